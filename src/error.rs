use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy for one harness invocation.
///
/// Capability internals return `anyhow::Result`. These variants exist at the
/// seams where the orchestrator decides the exit code.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("critical capabilities failed to load: {}", failed.join(", "))]
    ModuleLoad { failed: Vec<String> },

    #[error("execution context is incomplete, missing: {}", missing.join(", "))]
    ContextValidation { missing: Vec<String> },

    #[error("script {file} is missing {missing} required protection marker(s)")]
    ScriptValidation { file: String, missing: usize },

    #[error("admission denied: {0}")]
    Admission(String),

    #[error("error in {file}: {message}")]
    SandboxExecution { file: String, message: String },
}

impl HarnessError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HarnessError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable kind, used in the final report line.
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::Io { .. } => "IOError",
            HarnessError::Config(_) => "ConfigError",
            HarnessError::ModuleLoad { .. } => "ModuleLoadError",
            HarnessError::ContextValidation { .. } => "ContextValidationError",
            HarnessError::ScriptValidation { .. } => "ScriptValidationError",
            HarnessError::Admission(_) => "AdmissionError",
            HarnessError::SandboxExecution { .. } => "SandboxExecutionError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_load_message_lists_names() {
        let err = HarnessError::ModuleLoad {
            failed: vec!["sql".into(), "date".into()],
        };
        assert_eq!(
            err.to_string(),
            "critical capabilities failed to load: sql, date"
        );
        assert_eq!(err.kind(), "ModuleLoadError");
    }

    #[test]
    fn test_io_error_keeps_source() {
        let err = HarnessError::io(
            "/nope/script.lua",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/nope/script.lua"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
