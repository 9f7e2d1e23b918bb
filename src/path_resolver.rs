//! `${...}` variable substitution and `resolve_path` classification over a
//! JSON-shaped run context tree.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").unwrap())
}

/// Resolves `${a.b.c}` placeholders and `steps/<name>/...`-style path sugar
/// against a context tree built up over the course of a run.
pub struct PathResolver {
    context: Value,
}

impl PathResolver {
    pub fn new(context: Value) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Value {
        &self.context
    }

    /// Deep-merge `update` into the context: nested maps merge key by key,
    /// any other value (including a whole replaced map) overwrites in place.
    pub fn update_context(&mut self, update: Value) {
        deep_update(&mut self.context, update);
    }

    /// Replace every `${...}` occurrence with the dotted-path lookup result,
    /// stringified. A path that can't be resolved is left untouched in the
    /// output (and logged) rather than failing the whole substitution.
    pub fn resolve_variables(&self, s: &str) -> String {
        if s.is_empty() {
            return s.to_string();
        }
        let result = var_pattern().replace_all(s, |caps: &regex::Captures| {
            let var_path = &caps[1];
            match self.get_context_value(var_path) {
                Some(value) => stringify(value),
                None => {
                    tracing::warn!("variable not found: ${{{}}}", var_path);
                    caps[0].to_string()
                }
            }
        });
        if result.contains("${") {
            tracing::warn!("some variables could not be resolved in: {}", result);
        }
        result.into_owned()
    }

    /// Resolve a path string into a filesystem path, first substituting
    /// variables, then classifying it relative to the run directory found at
    /// `context.run_dir` (absolute paths pass through unchanged; `inputs/`,
    /// `outputs/`, `tmp/`, `logs/` join under the run dir; `steps/<name>/rest`
    /// rewrites to `<run_dir>/outputs/<name>/rest`; anything else still joins
    /// under the run dir, or the process cwd if no run dir is set).
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let resolved = self.resolve_variables(path);
        let p = Path::new(&resolved);
        if p.is_absolute() {
            return p.to_path_buf();
        }

        let run_dir = self
            .get_context_value("run_dir")
            .and_then(Value::as_str)
            .map(PathBuf::from);

        let Some(run_dir) = run_dir else {
            return std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(&resolved);
        };

        for prefix in ["inputs/", "outputs/", "tmp/", "logs/"] {
            if resolved.starts_with(prefix) {
                return run_dir.join(&resolved);
            }
        }

        if let Some(rest) = resolved.strip_prefix("steps/") {
            let mut parts = rest.splitn(2, '/');
            if let (Some(step_name), Some(output_path)) = (parts.next(), parts.next()) {
                return run_dir.join("outputs").join(step_name).join(output_path);
            }
        }

        run_dir.join(&resolved)
    }

    /// Look up a dot-notation path (e.g. `config.base_dir`) in the context.
    pub fn get_context_value(&self, path: &str) -> Option<&Value> {
        let mut value = &self.context;
        for component in path.split('.') {
            match value {
                Value::Object(map) => {
                    value = map.get(component)?;
                }
                _ => return None,
            }
        }
        Some(value)
    }
}

/// `${steps.<name>.outputs.files}` and other list-valued lookups render as a
/// space-joined list of their elements, not a JSON array, matching the
/// reference rendering a shell command substitutes directly into its argv.
fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(" "),
        other => other.to_string(),
    }
}

fn deep_update(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                match target_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_update(existing, value);
                    }
                    _ => {
                        target_map.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_simple_variable() {
        let resolver = PathResolver::new(json!({"run_dir": "/run", "step": {"name": "align"}}));
        assert_eq!(resolver.resolve_variables("${step.name}"), "align");
    }

    #[test]
    fn leaves_unresolved_variable_untouched() {
        let resolver = PathResolver::new(json!({}));
        assert_eq!(resolver.resolve_variables("${missing.path}"), "${missing.path}");
    }

    #[test]
    fn resolve_path_absolute_passthrough() {
        let resolver = PathResolver::new(json!({"run_dir": "/run"}));
        assert_eq!(resolver.resolve_path("/abs/file"), PathBuf::from("/abs/file"));
    }

    #[test]
    fn resolve_path_prefixes_join_under_run_dir() {
        let resolver = PathResolver::new(json!({"run_dir": "/run"}));
        assert_eq!(
            resolver.resolve_path("inputs/reads.fq"),
            PathBuf::from("/run/inputs/reads.fq")
        );
        assert_eq!(
            resolver.resolve_path("outputs/x.bam"),
            PathBuf::from("/run/outputs/x.bam")
        );
    }

    #[test]
    fn resolve_path_steps_sugar_rewrites() {
        let resolver = PathResolver::new(json!({"run_dir": "/run"}));
        assert_eq!(
            resolver.resolve_path("steps/align/out.bam"),
            PathBuf::from("/run/outputs/align/out.bam")
        );
    }

    #[test]
    fn resolve_path_default_relative_joins_run_dir() {
        let resolver = PathResolver::new(json!({"run_dir": "/run"}));
        assert_eq!(resolver.resolve_path("foo/bar"), PathBuf::from("/run/foo/bar"));
    }

    #[test]
    fn resolves_step_outputs_list_as_space_joined() {
        let resolver = PathResolver::new(json!({
            "steps": { "a": { "outputs": { "files": ["out1.txt", "out2.txt"] } } }
        }));
        assert_eq!(
            resolver.resolve_variables("${steps.a.outputs.files}"),
            "out1.txt out2.txt"
        );
    }

    #[test]
    fn update_context_deep_merges() {
        let mut resolver = PathResolver::new(json!({"steps": {"a": {"status": "pending"}}}));
        resolver.update_context(json!({"steps": {"b": {"status": "pending"}}}));
        assert_eq!(
            resolver.get_context_value("steps.a.status").unwrap(),
            "pending"
        );
        assert_eq!(
            resolver.get_context_value("steps.b.status").unwrap(),
            "pending"
        );
    }
}
