//! Input staging (glob expansion, symlink-or-copy into the run's `inputs/`
//! directory) and output enumeration (lexical walk of a step's output dir).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Resolves each declared input pattern to one file (a string) or many
/// (a list), staging every match into `inputs_dir` via symlink, falling back
/// to a copy when linking isn't possible.
pub struct InputManager {
    inputs_config: HashMap<String, String>,
    inputs_dir: PathBuf,
    resolved_inputs: HashMap<String, Value>,
}

impl InputManager {
    pub fn new(inputs_config: HashMap<String, String>, inputs_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&inputs_dir)?;
        Ok(Self {
            inputs_config,
            inputs_dir,
            resolved_inputs: HashMap::new(),
        })
    }

    /// CLI-supplied overrides win over the workflow-declared pattern for any
    /// input name they share.
    pub fn process_inputs(&mut self, cli_inputs: &HashMap<String, String>) -> Result<Value> {
        let mut effective = self.inputs_config.clone();
        for (k, v) in cli_inputs {
            effective.insert(k.clone(), v.clone());
        }

        for (name, pattern) in &effective {
            let resolved = self.process_single_input(name, pattern)?;
            self.resolved_inputs.insert(name.clone(), resolved);
        }

        Ok(Value::Object(
            self.resolved_inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ))
    }

    fn process_single_input(&self, name: &str, pattern: &str) -> Result<Value> {
        let cwd = std::env::current_dir()?;
        let absolute_pattern = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            cwd.join(pattern).to_string_lossy().into_owned()
        };

        let mut matches: Vec<PathBuf> = glob::glob(&absolute_pattern)
            .map_err(|e| Error::InputValidation(format!("bad glob pattern {pattern:?}: {e}")))?
            .filter_map(|r| r.ok())
            .filter(|p| p.exists())
            .collect();
        matches.sort();

        if matches.is_empty() {
            tracing::warn!("no files found matching input path: {}", absolute_pattern);
            return Ok(Value::Array(vec![]));
        }

        let mut resolved_paths = Vec::with_capacity(matches.len());
        for source in &matches {
            let file_name = source
                .file_name()
                .ok_or_else(|| Error::InputValidation(format!("bad path: {source:?}")))?;
            let target = self.inputs_dir.join(file_name);
            link_or_copy(source, &target)?;
            resolved_paths.push(target.to_string_lossy().into_owned());
        }

        tracing::debug!("processed input '{}': {} file(s)", name, resolved_paths.len());

        if resolved_paths.len() == 1 {
            Ok(Value::String(resolved_paths.into_iter().next().unwrap()))
        } else {
            Ok(Value::Array(resolved_paths.into_iter().map(Value::String).collect()))
        }
    }

    pub fn get_input_path(&self, name: &str) -> Option<&Value> {
        self.resolved_inputs.get(name)
    }

    /// Every resolved input must name at least one file that exists on disk.
    pub fn validate_inputs(&self) -> Result<()> {
        for (name, value) in &self.resolved_inputs {
            let paths: Vec<&str> = match value {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => vec![],
            };
            if paths.is_empty() {
                return Err(Error::InputValidation(format!(
                    "no files found for input '{name}'"
                )));
            }
            for path in paths {
                if !Path::new(path).exists() {
                    return Err(Error::InputValidation(format!(
                        "input file not found: {path}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn link_or_copy(source: &Path, target: &Path) -> Result<()> {
    if target.exists() {
        let already_linked = target.is_symlink()
            && std::fs::canonicalize(target).ok() == std::fs::canonicalize(source).ok();
        if already_linked {
            return Ok(());
        }
        std::fs::remove_file(target)?;
    }

    #[cfg(unix)]
    {
        if std::os::unix::fs::symlink(source, target).is_ok() {
            return Ok(());
        }
    }
    std::fs::copy(source, target)?;
    Ok(())
}

/// Manages the `outputs/` and `tmp/` subtrees of a run.
pub struct OutputManager {
    outputs_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl OutputManager {
    pub fn new(outputs_dir: PathBuf, tmp_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&outputs_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;
        Ok(Self { outputs_dir, tmp_dir })
    }

    pub fn prepare_step_output(&self, step_name: &str) -> Result<PathBuf> {
        let dir = self.outputs_dir.join(step_name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Regular files under `outputs/<step_name>/`, in lexical path order.
    pub fn get_step_outputs(&self, step_name: &str) -> Vec<PathBuf> {
        let step_dir = self.outputs_dir.join(step_name);
        if !step_dir.exists() {
            return vec![];
        }
        let mut files: Vec<PathBuf> = WalkDir::new(&step_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect();
        files.sort();
        files
    }

    /// Empty and recreate `tmp/`, run at the end of a successful run.
    pub fn cleanup_temp_files(&self) -> Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn single_match_resolves_to_string() {
        let src_dir = tempfile::tempdir().unwrap();
        let inputs_dir = tempfile::tempdir().unwrap();
        let file_path = src_dir.path().join("reads.fq");
        std::fs::File::create(&file_path).unwrap().write_all(b"x").unwrap();

        let mut mgr = InputManager::new(HashMap::new(), inputs_dir.path().to_path_buf()).unwrap();
        let mut cli = HashMap::new();
        cli.insert(
            "reads".to_string(),
            file_path.to_string_lossy().into_owned(),
        );
        mgr.process_inputs(&cli).unwrap();

        match mgr.get_input_path("reads").unwrap() {
            Value::String(s) => assert!(Path::new(s).exists()),
            other => panic!("expected a string, got {other:?}"),
        }
    }

    #[test]
    fn empty_match_resolves_to_empty_list_and_fails_validation() {
        let inputs_dir = tempfile::tempdir().unwrap();
        let mut mgr = InputManager::new(HashMap::new(), inputs_dir.path().to_path_buf()).unwrap();
        let mut cli = HashMap::new();
        cli.insert("missing".to_string(), "/no/such/path/*.fq".to_string());
        mgr.process_inputs(&cli).unwrap();
        assert!(mgr.validate_inputs().is_err());
    }

    #[test]
    fn outputs_enumerate_in_lexical_order() {
        let outputs_dir = tempfile::tempdir().unwrap();
        let tmp_dir = tempfile::tempdir().unwrap();
        let mgr = OutputManager::new(outputs_dir.path().to_path_buf(), tmp_dir.path().to_path_buf())
            .unwrap();
        let step_dir = mgr.prepare_step_output("align").unwrap();
        for name in ["c.txt", "a.txt", "b.txt"] {
            std::fs::File::create(step_dir.join(name)).unwrap();
        }
        let files: Vec<String> = mgr
            .get_step_outputs("align")
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn cleanup_empties_and_recreates_tmp_dir() {
        let outputs_dir = tempfile::tempdir().unwrap();
        let tmp_dir = tempfile::tempdir().unwrap();
        let mgr = OutputManager::new(outputs_dir.path().to_path_buf(), tmp_dir.path().to_path_buf())
            .unwrap();
        std::fs::write(tmp_dir.path().join("scratch"), b"x").unwrap();
        mgr.cleanup_temp_files().unwrap();
        assert!(tmp_dir.path().exists());
        assert_eq!(std::fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }
}
