//! Pure functions over a step dependency map: which steps are ready to run,
//! whether a run is complete, and how steps group into parallel levels.

use std::collections::HashSet;

use indexmap::IndexMap;

/// `dependencies` maps each step name to the names of the steps it depends
/// on (its `after` list), in the workflow document's declaration order.
pub struct Scheduler<'a> {
    dependencies: &'a IndexMap<String, Vec<String>>,
}

impl<'a> Scheduler<'a> {
    pub fn new(dependencies: &'a IndexMap<String, Vec<String>>) -> Self {
        Self { dependencies }
    }

    /// Steps not yet completed whose every dependency is in `completed`.
    pub fn ready(&self, completed: &HashSet<String>) -> Vec<String> {
        self.dependencies
            .iter()
            .filter(|(name, deps)| {
                !completed.contains(*name) && deps.iter().all(|d| completed.contains(d))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_complete(&self, completed: &HashSet<String>) -> bool {
        completed.len() == self.dependencies.len()
    }

    /// Group every step into levels such that a step only appears once all
    /// the steps in earlier levels (transitively, its dependencies) have
    /// been placed. Declaration order breaks ties within a level.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut remaining: HashSet<String> = self.dependencies.keys().cloned().collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let current: Vec<String> = self
                .dependencies
                .keys()
                .filter(|name| {
                    remaining.contains(*name)
                        && self.dependencies[*name]
                            .iter()
                            .all(|dep| !remaining.contains(dep))
                })
                .cloned()
                .collect();

            if current.is_empty() {
                // A cycle would prevent any progress; Workflow::validate
                // rejects cycles before the scheduler ever runs, so this is
                // unreachable in practice and we stop rather than loop.
                break;
            }

            for name in &current {
                remaining.remove(name);
            }
            levels.push(current);
        }

        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(pairs: &[(&str, &[&str])]) -> IndexMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(name, d)| {
                (
                    name.to_string(),
                    d.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn ready_returns_steps_with_satisfied_dependencies() {
        let d = deps(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        let sched = Scheduler::new(&d);
        let completed = HashSet::new();
        assert_eq!(sched.ready(&completed), vec!["a".to_string()]);

        let mut completed = HashSet::new();
        completed.insert("a".to_string());
        let mut ready = sched.ready(&completed);
        ready.sort();
        assert_eq!(ready, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn is_complete_checks_count() {
        let d = deps(&[("a", &[]), ("b", &["a"])]);
        let sched = Scheduler::new(&d);
        let mut completed = HashSet::new();
        assert!(!sched.is_complete(&completed));
        completed.insert("a".to_string());
        completed.insert("b".to_string());
        assert!(sched.is_complete(&completed));
    }

    #[test]
    fn levels_groups_diamond_correctly() {
        let d = deps(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        let sched = Scheduler::new(&d);
        let levels = sched.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["a".to_string()]);
        let mut mid = levels[1].clone();
        mid.sort();
        assert_eq!(mid, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(levels[2], vec!["d".to_string()]);
    }
}
