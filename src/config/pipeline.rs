use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::config::traits::Configuration;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{compile_pattern, ArtifactSpec, Pipeline, Stage, StageCommands};

const DEFAULT_PIPELINE_NAME: &str = "pipeline";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipeline {
    name: Option<String>,
    output_dir: Option<String>,
    timeout_secs: Option<u64>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    stages: Option<Vec<RawStage>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    name: Option<String>,
    commands: Option<Vec<String>>,
    variants: Option<RawVariants>,
    #[serde(default)]
    artifacts: Vec<RawArtifact>,
    timeout_secs: Option<u64>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVariants {
    weekday: Vec<String>,
    weekend: Vec<String>,
}

/// Either a bare pattern (optional artifact) or `{path, required}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawArtifact {
    Pattern(String),
    Detailed(ArtifactSpec),
}

impl From<RawArtifact> for ArtifactSpec {
    fn from(raw: RawArtifact) -> Self {
        match raw {
            RawArtifact::Pattern(path) => ArtifactSpec::optional(path),
            RawArtifact::Detailed(spec) => spec,
        }
    }
}

impl RawStage {
    fn into_stage(self, index: usize) -> PipelineResult<Stage> {
        let name = self
            .name
            .ok_or_else(|| PipelineError::parse(format!("stage #{} has no name", index + 1)))?;

        let commands = match (self.commands, self.variants) {
            (Some(commands), None) => StageCommands::Fixed(commands),
            (None, Some(variants)) => StageCommands::ByDay {
                weekday: variants.weekday,
                weekend: variants.weekend,
            },
            (Some(_), Some(_)) => {
                return Err(PipelineError::parse(format!(
                    "stage '{name}' declares both 'commands' and 'variants'"
                )))
            }
            (None, None) => {
                return Err(PipelineError::parse(format!(
                    "stage '{name}' declares neither 'commands' nor 'variants'"
                )))
            }
        };

        Ok(Stage {
            name,
            commands,
            artifacts: self.artifacts.into_iter().map(ArtifactSpec::from).collect(),
            timeout: self.timeout_secs.map(Duration::from_secs),
            env: self.env,
        })
    }
}

impl RawPipeline {
    fn into_pipeline(self) -> PipelineResult<Pipeline> {
        let stages = self
            .stages
            .ok_or_else(|| PipelineError::parse("missing 'stages' list"))?
            .into_iter()
            .enumerate()
            .map(|(index, stage)| stage.into_stage(index))
            .collect::<PipelineResult<Vec<_>>>()?;

        Ok(Pipeline {
            name: self
                .name
                .unwrap_or_else(|| DEFAULT_PIPELINE_NAME.to_string()),
            output_dir: self.output_dir,
            timeout: self.timeout_secs.map(Duration::from_secs),
            env: self.env,
            stages,
            path: PathBuf::new(),
        })
    }
}

/// Check the structural invariants of a pipeline. Nothing is executed.
pub fn validate_pipeline(pipeline: &Pipeline) -> PipelineResult<()> {
    if pipeline.name.trim().is_empty() {
        return Err(PipelineError::parse("pipeline name cannot be empty"));
    }
    if pipeline.stages.is_empty() {
        return Err(PipelineError::parse("pipeline defines no stages"));
    }
    if pipeline.timeout == Some(Duration::ZERO) {
        return Err(PipelineError::parse("pipeline timeout must be greater than zero"));
    }
    if matches!(&pipeline.output_dir, Some(template) if template.trim().is_empty()) {
        return Err(PipelineError::parse("output_dir template cannot be empty"));
    }

    let mut seen = HashSet::new();
    for stage in &pipeline.stages {
        validate_stage(stage)?;
        if !seen.insert(stage.name.as_str()) {
            return Err(PipelineError::parse(format!(
                "duplicate stage name '{}'",
                stage.name
            )));
        }
    }
    Ok(())
}

fn validate_stage(stage: &Stage) -> PipelineResult<()> {
    if stage.name.trim().is_empty() {
        return Err(PipelineError::parse("stage name cannot be empty"));
    }

    let command_sets: Vec<(&str, &Vec<String>)> = match &stage.commands {
        StageCommands::Fixed(commands) => vec![("commands", commands)],
        StageCommands::ByDay { weekday, weekend } => {
            vec![("variants.weekday", weekday), ("variants.weekend", weekend)]
        }
    };
    for (field, commands) in command_sets {
        if commands.is_empty() {
            return Err(PipelineError::parse(format!(
                "stage '{}' has no {}",
                stage.name, field
            )));
        }
        if commands.iter().any(|c| c.trim().is_empty()) {
            return Err(PipelineError::parse(format!(
                "stage '{}' has an empty command in {}",
                stage.name, field
            )));
        }
    }

    if stage.timeout == Some(Duration::ZERO) {
        return Err(PipelineError::parse(format!(
            "stage '{}' timeout must be greater than zero",
            stage.name
        )));
    }

    for artifact in &stage.artifacts {
        validate_artifact_pattern(&stage.name, &artifact.path)?;
    }
    Ok(())
}

fn validate_artifact_pattern(stage: &str, pattern: &str) -> PipelineResult<()> {
    if pattern.trim().is_empty() {
        return Err(PipelineError::parse(format!(
            "stage '{stage}' declares an empty artifact path"
        )));
    }

    let path = Path::new(pattern);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(PipelineError::parse(format!(
            "stage '{stage}' artifact '{pattern}' must be relative to the output directory"
        )));
    }

    compile_pattern(pattern).map_err(|e| {
        PipelineError::parse(format!("stage '{stage}' artifact '{pattern}': {e}"))
    })?;
    Ok(())
}

/// Parse and validate a pipeline definition from YAML
pub fn load_pipeline(source: &str) -> PipelineResult<Pipeline> {
    let raw: RawPipeline =
        serde_yaml::from_str(source).map_err(|e| PipelineError::parse(e.to_string()))?;
    let pipeline = raw.into_pipeline()?;
    validate_pipeline(&pipeline)?;
    Ok(pipeline)
}

/// Load a pipeline definition from a YAML file
pub fn load_pipeline_file(pipeline_path: &Path) -> Result<Pipeline> {
    if !pipeline_path.exists() {
        anyhow::bail!("Pipeline definition not found: {:?}", pipeline_path);
    }

    let contents = std::fs::read_to_string(pipeline_path)
        .with_context(|| format!("Failed to read pipeline definition: {:?}", pipeline_path))?;

    let mut pipeline = load_pipeline(&contents)
        .with_context(|| format!("Failed to load pipeline from file: {:?}", pipeline_path))?;
    pipeline.path = pipeline_path.to_path_buf();

    debug!(
        "Using {} configuration '{}' with stages {:?}",
        pipeline.config_type(),
        pipeline.name,
        pipeline.stage_names()
    );
    Ok(pipeline)
}

impl Configuration for Pipeline {
    fn config_path(&self) -> &PathBuf {
        &self.path
    }

    fn config_type(&self) -> &str {
        "pipeline"
    }

    fn validate(&self) -> anyhow::Result<()> {
        Ok(validate_pipeline(self)?)
    }
}
