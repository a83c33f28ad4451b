mod artifacts;
pub use artifacts::{collect_artifacts, compile_pattern, ArtifactScan};
mod model;
pub use model::{ArtifactSpec, Pipeline, Stage, StageCommands};
mod results;
pub use results::{CommandLog, RunResult, RunStatus, StageLog, RUN_RESULT_FILE};
mod runner;
pub use runner::{PipelineRunner, PipelineRunnerBuilder, SYSTEM_INFO_FILE};
pub mod variant;
pub use variant::{compute_day_variant, variant_for_iso_day, DayVariant};
