use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workflow definition error: {0}")]
    Definition(String),

    #[error("invalid name {name:?}: must match {pattern}")]
    InvalidName { name: String, pattern: &'static str },

    #[error("invalid version {0:?}: not a valid semantic version")]
    InvalidVersion(String),

    #[error("invalid memory spec {0:?}: expected digits followed by M, G, or T")]
    InvalidMemory(String),

    #[error("invalid time limit {0:?}: expected one or more <int><unit> pairs (h/m/s)")]
    InvalidTimeLimit(String),

    #[error("step {step:?} depends on unknown step {dependency:?}")]
    UnknownDependency { step: String, dependency: String },

    #[error("circular dependency detected involving step {0:?}")]
    CircularDependency(String),

    #[error("step {0:?} has an empty container image")]
    EmptyContainer(String),

    #[error("step {0:?} has an empty command")]
    EmptyCommand(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("container runtime error: {0}")]
    Container(String),

    #[error("setup error: {0}")]
    Setup(String),

    #[error("input validation failed: {0}")]
    InputValidation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
