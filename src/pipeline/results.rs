use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::command::{CommandOutput, Termination};
use crate::pipeline::variant::DayVariant;

/// Name of the run record written into the output directory
pub const RUN_RESULT_FILE: &str = "run_result.json";

/// Final state of a stage or of the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Captured output of one command of a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLog {
    /// Command line after variable substitution
    pub command: String,
    /// Exit code, absent when the process was killed or never started
    pub exit_code: Option<i32>,
    pub termination: Termination,
    /// Duration in milliseconds
    pub duration_ms: f64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandLog {
    pub fn from_output(command: &str, output: &CommandOutput) -> Self {
        Self {
            command: command.to_string(),
            exit_code: output.exit_code,
            termination: output.termination,
            duration_ms: output.duration.as_secs_f64() * 1000.0,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        }
    }
}

/// Everything recorded about one executed stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLog {
    pub name: String,
    pub status: RunStatus,
    /// Duration in milliseconds
    pub duration_ms: f64,
    pub commands: Vec<CommandLog>,
    /// Files matched by this stage's artifact patterns
    pub artifacts: Vec<PathBuf>,
}

impl StageLog {
    /// Standard error of every command of the stage, in order
    pub fn stderr(&self) -> String {
        self.commands
            .iter()
            .map(|c| c.stderr.as_str())
            .collect::<Vec<_>>()
            .concat()
    }
}

/// Outcome of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub pipeline: String,
    pub status: RunStatus,
    pub success: bool,
    /// First stage that did not succeed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    /// Process exit code for this outcome
    pub exit_code: i32,
    /// Human readable reason of the failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub variant: DayVariant,
    pub date: String,
    pub output_dir: PathBuf,
    /// Stages in execution order; stages after a failure never appear
    pub stages: Vec<StageLog>,
    /// Artifacts collected so far, including those of a failing stage
    pub artifacts: BTreeSet<PathBuf>,
    pub warnings: Vec<String>,
}

impl RunResult {
    /// Log of the stage that stopped the run
    pub fn failed_stage_log(&self) -> Option<&StageLog> {
        let name = self.failed_stage.as_deref()?;
        self.stages.iter().find(|s| s.name == name)
    }

    /// Names of the stages that were started, in order
    pub fn executed_stages(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Export the result to JSON
    pub fn export_json(&self, path: &Path) -> Result<()> {
        let json_data =
            serde_json::to_string_pretty(self).context("Failed to serialize run result")?;

        std::fs::write(path, json_data)
            .with_context(|| format!("Failed to write run result to {}", path.display()))?;

        Ok(())
    }
}
