use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::command::{CommandOutput, ExternalCommand, Invocation, Termination};
use crate::context::RunContext;
use crate::error::{PipelineError, EXIT_LAUNCH_FAILED};
use crate::path_utils;
use crate::pipeline::artifacts::{collect_artifacts, ArtifactScan};
use crate::pipeline::model::{Pipeline, Stage};
use crate::pipeline::results::{CommandLog, RunResult, RunStatus, StageLog, RUN_RESULT_FILE};

/// Name of the system description written next to the artifacts
pub const SYSTEM_INFO_FILE: &str = "system_info";

/// Executes the stages of a pipeline in order, stopping at the first failure
pub struct PipelineRunner {
    command: Box<dyn ExternalCommand>,
    default_timeout: Option<Duration>,
    cancel: CancelToken,
    record_run: bool,
    show_progress: bool,
}

/// Builder for PipelineRunner
pub struct PipelineRunnerBuilder {
    command: Box<dyn ExternalCommand>,
    default_timeout: Option<Duration>,
    cancel: CancelToken,
    record_run: bool,
    show_progress: bool,
}

impl PipelineRunnerBuilder {
    /// Stage timeout used when neither the stage nor the pipeline sets one
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Require an empty output directory and write the definition, system
    /// info and `run_result.json` into it
    pub fn record_run(mut self, record: bool) -> Self {
        self.record_run = record;
        self
    }

    /// Show a spinner for the running stage
    pub fn progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn build(self) -> Result<PipelineRunner> {
        if self.default_timeout == Some(Duration::ZERO) {
            anyhow::bail!("Default stage timeout must be greater than zero");
        }

        Ok(PipelineRunner {
            command: self.command,
            default_timeout: self.default_timeout,
            cancel: self.cancel,
            record_run: self.record_run,
            show_progress: self.show_progress,
        })
    }
}

/// What happened while running a single stage
struct StageOutcome {
    log: StageLog,
    error: Option<PipelineError>,
    warnings: Vec<String>,
}

impl PipelineRunner {
    pub fn builder(command: Box<dyn ExternalCommand>) -> PipelineRunnerBuilder {
        PipelineRunnerBuilder {
            command,
            default_timeout: None,
            cancel: CancelToken::new(),
            record_run: false,
            show_progress: false,
        }
    }

    /// Run every stage of `pipeline` against `context`.
    ///
    /// Stage failures are reported through the returned [`RunResult`]; an
    /// `Err` means the run could not be set up or recorded at all.
    pub fn run(&self, pipeline: &Pipeline, context: &RunContext) -> Result<RunResult> {
        let output_dir = context.output_dir();
        info!(
            "Running pipeline '{}' ({} variant, date {}) into {}",
            pipeline.name,
            context.variant(),
            context.date_str(),
            output_dir.display()
        );

        if self.record_run {
            self.prepare_record(pipeline, output_dir)?;
        } else {
            path_utils::ensure_directory(output_dir)?;
        }

        let reserved = self.record_files(pipeline);
        let mut env = context.env_vars();
        env.extend(substitute_env(&pipeline.env, context));

        let mut result = RunResult {
            pipeline: pipeline.name.clone(),
            status: RunStatus::Succeeded,
            success: true,
            failed_stage: None,
            exit_code: 0,
            error: None,
            variant: context.variant(),
            date: context.date_str().to_string(),
            output_dir: output_dir.to_path_buf(),
            stages: Vec::with_capacity(pipeline.stages.len()),
            artifacts: BTreeSet::new(),
            warnings: Vec::new(),
        };

        for stage in &pipeline.stages {
            if self.cancel.is_cancelled() {
                let err = PipelineError::Cancelled {
                    stage: stage.name.clone(),
                };
                warn!("Run cancelled before stage '{}'", stage.name);
                record_failure(&mut result, &stage.name, &err);
                break;
            }

            let outcome = self.run_stage(pipeline, stage, context, &env, &reserved);
            result.artifacts.extend(outcome.log.artifacts.iter().cloned());
            result.warnings.extend(outcome.warnings);
            result.stages.push(outcome.log);

            if let Some(err) = outcome.error {
                error!("{}", err);
                record_failure(&mut result, &stage.name, &err);
                break;
            }
        }

        if result.success {
            info!(
                "Pipeline '{}' succeeded with {} artifact(s)",
                pipeline.name,
                result.artifacts.len()
            );
        }

        if self.record_run {
            let record_path = output_dir.join(RUN_RESULT_FILE);
            result.export_json(&record_path)?;
            debug!("Wrote run record to {}", record_path.display());
        }

        Ok(result)
    }

    /// Empty output directory with the definition and system info copied in
    fn prepare_record(&self, pipeline: &Pipeline, output_dir: &Path) -> Result<()> {
        path_utils::prepare_output_directory(output_dir)?;

        if let Some(file_name) = pipeline.path.file_name() {
            path_utils::copy_file(&pipeline.path, &output_dir.join(file_name))?;
        }

        crate::system_info::dump_sys_info(&output_dir.join(SYSTEM_INFO_FILE))?;
        Ok(())
    }

    /// Files the runner itself writes into the output directory
    fn record_files(&self, pipeline: &Pipeline) -> Vec<PathBuf> {
        if !self.record_run {
            return Vec::new();
        }
        let mut files = vec![PathBuf::from(SYSTEM_INFO_FILE), PathBuf::from(RUN_RESULT_FILE)];
        files.extend(pipeline.path.file_name().map(PathBuf::from));
        files
    }

    fn run_stage(
        &self,
        pipeline: &Pipeline,
        stage: &Stage,
        context: &RunContext,
        base_env: &HashMap<String, String>,
        reserved: &[PathBuf],
    ) -> StageOutcome {
        info!("Starting stage '{}'", stage.name);
        let spinner = self.spinner(&stage.name);
        let start = Instant::now();

        // One deadline for all commands of the stage
        let timeout = stage
            .timeout
            .or(pipeline.timeout)
            .or(self.default_timeout);
        let mut env = base_env.clone();
        env.extend(substitute_env(&stage.env, context));

        let mut commands = Vec::new();
        let mut error = None;
        for template in stage.commands.for_variant(context.variant()) {
            if self.cancel.is_cancelled() {
                error = Some(PipelineError::Cancelled {
                    stage: stage.name.clone(),
                });
                break;
            }

            let remaining = timeout.map(|t| t.saturating_sub(start.elapsed()));
            if remaining == Some(Duration::ZERO) {
                error = Some(PipelineError::Timeout {
                    stage: stage.name.clone(),
                    timeout: timeout.unwrap_or_default(),
                });
                break;
            }

            let command_line = context.substitute_command(template);
            let invocation = Invocation {
                stage: &stage.name,
                command_line: &command_line,
                working_dir: context.base_dir(),
                env: &env,
                timeout: remaining,
            };

            let output = match self.command.execute(&invocation, &self.cancel) {
                Ok(output) => output,
                Err(err) => {
                    error!("[{}] could not run '{}': {:#}", stage.name, command_line, err);
                    CommandOutput::exited(EXIT_LAUNCH_FAILED, "", format!("{err:#}"))
                }
            };
            commands.push(CommandLog::from_output(&command_line, &output));

            if let Some(err) = command_error(&stage.name, &output, timeout) {
                error = Some(err);
                break;
            }
        }

        // Artifacts are collected even when the stage failed
        let mut warnings = Vec::new();
        let scan = match collect_artifacts(context.output_dir(), &stage.artifacts, reserved) {
            Ok(scan) => scan,
            Err(err) => {
                let warning = format!("stage '{}' artifact scan failed: {:#}", stage.name, err);
                warn!("{}", warning);
                warnings.push(warning);
                ArtifactScan::default()
            }
        };
        if error.is_none() {
            for missing in &scan.missing {
                let err = PipelineError::ArtifactMissing {
                    stage: stage.name.clone(),
                    pattern: missing.path.clone(),
                };
                if missing.required {
                    error.get_or_insert(err);
                } else {
                    warn!("{}", err);
                    warnings.push(err.to_string());
                }
            }
        }

        let status = error.as_ref().map_or(RunStatus::Succeeded, status_for);
        let duration = start.elapsed();
        spinner.finish_and_clear();
        info!(
            "Finished stage '{}' ({:?}) in {:.2}s",
            stage.name,
            status,
            duration.as_secs_f64()
        );

        StageOutcome {
            log: StageLog {
                name: stage.name.clone(),
                status,
                duration_ms: duration.as_secs_f64() * 1000.0,
                commands,
                artifacts: scan.found.into_iter().collect(),
            },
            error,
            warnings,
        }
    }

    fn spinner(&self, stage: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let spinner = ProgressBar::new_spinner();
        match ProgressStyle::default_spinner().template("{spinner} [{elapsed_precise}] {msg}") {
            Ok(style) => spinner.set_style(style),
            Err(err) => debug!("Falling back to the default spinner style: {}", err),
        }
        spinner.set_message(format!("stage {stage}"));
        spinner.enable_steady_tick(Duration::from_millis(120));
        spinner
    }
}

/// Error for a command that did not exit successfully
fn command_error(
    stage: &str,
    output: &CommandOutput,
    timeout: Option<Duration>,
) -> Option<PipelineError> {
    match output.termination {
        Termination::Exited if output.success() => None,
        Termination::Exited => Some(PipelineError::StageExecution {
            stage: stage.to_string(),
            // No code when the process was killed by a signal
            exit_code: output.exit_code.unwrap_or(1),
            stderr: output.stderr.clone(),
        }),
        Termination::TimedOut => Some(PipelineError::Timeout {
            stage: stage.to_string(),
            timeout: timeout.unwrap_or_default(),
        }),
        Termination::Cancelled => Some(PipelineError::Cancelled {
            stage: stage.to_string(),
        }),
    }
}

fn status_for(err: &PipelineError) -> RunStatus {
    match err {
        PipelineError::Timeout { .. } => RunStatus::TimedOut,
        PipelineError::Cancelled { .. } => RunStatus::Cancelled,
        _ => RunStatus::Failed,
    }
}

fn record_failure(result: &mut RunResult, stage: &str, err: &PipelineError) {
    result.success = false;
    result.status = status_for(err);
    result.failed_stage = Some(stage.to_string());
    result.exit_code = err.exit_code();
    result.error = Some(err.to_string());
}

fn substitute_env(env: &BTreeMap<String, String>, context: &RunContext) -> HashMap<String, String> {
    env.iter()
        .map(|(key, value)| (key.clone(), context.substitute(value)))
        .collect()
}
