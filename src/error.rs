use std::time::Duration;
use thiserror::Error;

/// Exit code reported when a stage is killed after its timeout
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported when the run is cancelled by a signal
pub const EXIT_CANCELLED: i32 = 130;
/// Exit code used when a stage command could not be launched at all
pub const EXIT_LAUNCH_FAILED: i32 = 127;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced by pipeline loading and execution
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline definition is malformed; nothing was executed
    #[error("invalid pipeline definition: {0}")]
    Parse(String),

    /// A stage command exited unsuccessfully
    #[error("stage '{stage}' failed with exit code {exit_code}")]
    StageExecution {
        stage: String,
        exit_code: i32,
        stderr: String,
    },

    /// A declared artifact pattern matched no file in the output directory
    #[error("stage '{stage}' did not produce artifact '{pattern}'")]
    ArtifactMissing { stage: String, pattern: String },

    #[error("stage '{stage}' timed out after {}s", .timeout.as_secs())]
    Timeout { stage: String, timeout: Duration },

    #[error("stage '{stage}' was cancelled")]
    Cancelled { stage: String },
}

impl PipelineError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Process exit code matching this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse(_) | Self::ArtifactMissing { .. } => 1,
            Self::StageExecution { exit_code, .. } => *exit_code,
            Self::Timeout { .. } => EXIT_TIMEOUT,
            Self::Cancelled { .. } => EXIT_CANCELLED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(PipelineError::parse("bad").exit_code(), 1);
        assert_eq!(
            PipelineError::StageExecution {
                stage: "lint".to_string(),
                exit_code: 3,
                stderr: String::new(),
            }
            .exit_code(),
            3
        );
        assert_eq!(
            PipelineError::Timeout {
                stage: "benchmark".to_string(),
                timeout: Duration::from_secs(5),
            }
            .exit_code(),
            EXIT_TIMEOUT
        );
        assert_eq!(
            PipelineError::Cancelled {
                stage: "benchmark".to_string()
            }
            .exit_code(),
            EXIT_CANCELLED
        );
    }

    #[test]
    fn test_messages_name_the_stage() {
        let err = PipelineError::ArtifactMissing {
            stage: "benchmark".to_string(),
            pattern: "run_report.csv".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "stage 'benchmark' did not produce artifact 'run_report.csv'"
        );

        let err = PipelineError::Timeout {
            stage: "lint".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "stage 'lint' timed out after 30s");
    }
}
