//! Workflow document data model: parsing and validating the YAML definition
//! into [`Workflow`], [`Step`], [`Resources`], [`Config`] and [`Metadata`].

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{Error, Result};

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap())
}

fn memory_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)([MGT])$").unwrap())
}

fn time_limit_component_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)([hms])").unwrap())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<String>,
}

fn default_cpu() -> u32 {
    1
}

fn default_memory() -> String {
    "1G".to_string()
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory: default_memory(),
            time_limit: None,
        }
    }
}

impl Resources {
    pub fn validate(&self) -> Result<()> {
        if self.cpu < 1 {
            return Err(Error::Definition("resources.cpu must be >= 1".to_string()));
        }
        if !memory_pattern().is_match(&self.memory) {
            return Err(Error::InvalidMemory(self.memory.clone()));
        }
        if let Some(ref tl) = self.time_limit {
            validate_time_limit(tl)?;
        }
        Ok(())
    }

    /// Sum of every `<int><unit>` pair in the time limit string, in seconds.
    /// Distributive over concatenation: `1h30m` == `1h` + `30m` in seconds.
    pub fn time_limit_seconds(&self) -> Option<u64> {
        self.time_limit.as_deref().map(time_limit_to_seconds)
    }
}

fn validate_time_limit(s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::InvalidTimeLimit(s.to_string()));
    }
    let matched: usize = time_limit_component_pattern()
        .find_iter(s)
        .map(|m| m.as_str().len())
        .sum();
    if matched != s.len() {
        return Err(Error::InvalidTimeLimit(s.to_string()));
    }
    Ok(())
}

fn time_limit_to_seconds(s: &str) -> u64 {
    let mut total = 0u64;
    for cap in time_limit_component_pattern().captures_iter(s) {
        let value: u64 = cap[1].parse().unwrap_or(0);
        total += match &cap[2] {
            "h" => value * 3600,
            "m" => value * 60,
            "s" => value,
            _ => 0,
        };
    }
    total
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub container: String,
    pub command: String,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub after: Vec<String>,
}

impl Step {
    fn validate(&self, name: &str) -> Result<()> {
        if self.container.trim().is_empty() {
            return Err(Error::EmptyContainer(name.to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(Error::EmptyCommand(name.to_string()));
        }
        self.resources.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub base_dir: Option<String>,
    #[serde(default = "default_refs")]
    pub refs: String,
    #[serde(default = "default_workflows")]
    pub workflows: String,
    #[serde(default = "default_runs")]
    pub runs: String,
}

fn default_refs() -> String {
    "refs".to_string()
}
fn default_workflows() -> String {
    "workflows".to_string()
}
fn default_runs() -> String {
    "runs".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: None,
            refs: default_refs(),
            workflows: default_workflows(),
            runs: default_runs(),
        }
    }
}

impl Config {
    /// Resolve `base_dir`, expanding a literal `${PWD}` token the way the
    /// original configuration loader does, and defaulting to the process
    /// current working directory when absent.
    pub fn resolved_base_dir(&self) -> Result<PathBuf> {
        let cwd = std::env::current_dir()?;
        match &self.base_dir {
            None => Ok(cwd),
            Some(raw) => {
                let expanded = raw.replace("${PWD}", &cwd.to_string_lossy());
                Ok(PathBuf::from(expanded))
            }
        }
    }

    pub fn refs_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.refs)
    }

    pub fn workflows_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.workflows)
    }

    pub fn runs_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.runs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub license: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub inputs: IndexMap<String, serde_json::Value>,
    pub steps: IndexMap<String, Step>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl Workflow {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let workflow: Workflow = serde_yaml::from_str(s)?;
        workflow.validate()?;
        Ok(workflow)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "workflow file not found: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || !name_pattern().is_match(&self.name) {
            return Err(Error::InvalidName {
                name: self.name.clone(),
                pattern: "^[a-zA-Z0-9_-]+$",
            });
        }
        validate_version(&self.version)?;

        for (step_name, step) in &self.steps {
            step.validate(step_name)?;
            for dep in &step.after {
                if !self.steps.contains_key(dep) {
                    return Err(Error::UnknownDependency {
                        step: step_name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.execution_order()?;
        Ok(())
    }

    /// Topological order of step names: every dependency appears before the
    /// step that names it. Ties (steps with no ordering constraint between
    /// them) break in the order the steps map was declared in the YAML
    /// document, via a three-color depth-first search that visits steps in
    /// declaration order and appends each step to `order` only after every
    /// dependency of it has been appended.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        #[derive(PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color: IndexMap<&str, Color> = self
            .steps
            .keys()
            .map(|k| (k.as_str(), Color::White))
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        fn visit<'a>(
            name: &'a str,
            steps: &'a IndexMap<String, Step>,
            color: &mut IndexMap<&'a str, Color>,
            order: &mut Vec<String>,
        ) -> Result<()> {
            match color.get(name) {
                Some(Color::Black) => return Ok(()),
                Some(Color::Gray) => {
                    return Err(Error::CircularDependency(name.to_string()));
                }
                _ => {}
            }
            color.insert(name, Color::Gray);
            for dep in &steps[name].after {
                visit(dep, steps, color, order)?;
            }
            color.insert(name, Color::Black);
            order.push(name.to_string());
            Ok(())
        }

        for name in self.steps.keys() {
            if !matches!(color.get(name.as_str()), Some(Color::Black)) {
                visit(name, &self.steps, &mut color, &mut order)?;
            }
        }
        Ok(order)
    }

    /// Dependencies of every step, keyed by step name, preserving document
    /// order — the shape the scheduler operates over.
    pub fn dependencies(&self) -> IndexMap<String, Vec<String>> {
        self.steps
            .iter()
            .map(|(name, step)| (name.clone(), step.after.clone()))
            .collect()
    }
}

fn validate_version(v: &str) -> Result<()> {
    if v.is_empty() {
        return Err(Error::InvalidVersion(v.to_string()));
    }
    if semver::Version::parse(v).is_ok() {
        return Ok(());
    }
    // Accept a bare MAJOR.MINOR.PATCH with no pre-release/build metadata too;
    // semver::Version::parse already covers this, kept for clarity of intent.
    Err(Error::InvalidVersion(v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf(yaml: &str) -> Result<Workflow> {
        Workflow::from_yaml_str(yaml)
    }

    #[test]
    fn accepts_minimal_workflow() {
        let yaml = r#"
name: demo
version: 1.0.0
steps:
  a:
    container: "alpine"
    command: "echo hi"
"#;
        let w = wf(yaml).unwrap();
        assert_eq!(w.execution_order().unwrap(), vec!["a"]);
    }

    #[test]
    fn rejects_bad_name() {
        let yaml = r#"
name: "bad name!"
version: 1.0.0
steps:
  a:
    container: "alpine"
    command: "echo hi"
"#;
        assert!(wf(yaml).is_err());
    }

    #[test]
    fn rejects_bad_version() {
        let yaml = r#"
name: demo
version: "not-a-version"
steps:
  a:
    container: "alpine"
    command: "echo hi"
"#;
        assert!(wf(yaml).is_err());
    }

    #[test]
    fn accepts_semver_prerelease() {
        let yaml = r#"
name: demo
version: "1.0.0-beta.1"
steps:
  a:
    container: "alpine"
    command: "echo hi"
"#;
        assert!(wf(yaml).is_ok());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let yaml = r#"
name: demo
version: 1.0.0
steps:
  a:
    container: "alpine"
    command: "echo hi"
    after: ["b"]
"#;
        assert!(wf(yaml).is_err());
    }

    #[test]
    fn rejects_cycle() {
        let yaml = r#"
name: demo
version: 1.0.0
steps:
  a:
    container: "alpine"
    command: "echo hi"
    after: ["b"]
  b:
    container: "alpine"
    command: "echo hi"
    after: ["a"]
"#;
        assert!(wf(yaml).is_err());
    }

    #[test]
    fn execution_order_respects_edges_and_declaration_order() {
        let yaml = r#"
name: demo
version: 1.0.0
steps:
  c:
    container: "alpine"
    command: "echo c"
  b:
    container: "alpine"
    command: "echo b"
    after: ["c"]
  a:
    container: "alpine"
    command: "echo a"
    after: ["c"]
"#;
        let w = wf(yaml).unwrap();
        let order = w.execution_order().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("c") < pos("b"));
        assert!(pos("c") < pos("a"));
        // b was declared before a, and both only depend on c: stable tie-break.
        assert!(pos("b") < pos("a"));
    }

    #[test]
    fn time_limit_parses_and_sums_distributively() {
        let r = Resources {
            time_limit: Some("1h30m15s".to_string()),
            ..Default::default()
        };
        assert_eq!(r.time_limit_seconds(), Some(3600 + 30 * 60 + 15));

        let a = Resources {
            time_limit: Some("1h".to_string()),
            ..Default::default()
        };
        let b = Resources {
            time_limit: Some("30m".to_string()),
            ..Default::default()
        };
        let combined = Resources {
            time_limit: Some("1h30m".to_string()),
            ..Default::default()
        };
        assert_eq!(
            a.time_limit_seconds().unwrap() + b.time_limit_seconds().unwrap(),
            combined.time_limit_seconds().unwrap()
        );
    }

    #[test]
    fn rejects_malformed_time_limit() {
        let r = Resources {
            time_limit: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(r.validate().is_err());
    }

    #[test]
    fn rejects_malformed_memory() {
        let r = Resources {
            memory: "lots".to_string(),
            ..Default::default()
        };
        assert!(r.validate().is_err());
    }

    #[test]
    fn default_resources_applied() {
        let yaml = r#"
name: demo
version: 1.0.0
steps:
  a:
    container: "alpine"
    command: "echo hi"
"#;
        let w = wf(yaml).unwrap();
        let step = &w.steps["a"];
        assert_eq!(step.resources.cpu, 1);
        assert_eq!(step.resources.memory, "1G");
        assert!(step.resources.time_limit.is_none());
    }
}
