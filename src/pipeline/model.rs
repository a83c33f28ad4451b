use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::variant::DayVariant;

/// A file-path pattern a stage is expected to leave in the output directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    /// Glob relative to the output directory
    pub path: String,
    /// Whether a missing match fails the stage instead of producing a warning
    #[serde(default)]
    pub required: bool,
}

impl ArtifactSpec {
    pub fn optional(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            required: false,
        }
    }

    pub fn required(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            required: true,
        }
    }
}

/// Commands of a stage, either fixed or chosen by day of week
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageCommands {
    Fixed(Vec<String>),
    ByDay {
        weekday: Vec<String>,
        weekend: Vec<String>,
    },
}

impl StageCommands {
    /// Command strings to run for the given variant
    pub fn for_variant(&self, variant: DayVariant) -> &[String] {
        match (self, variant) {
            (StageCommands::Fixed(commands), _) => commands,
            (StageCommands::ByDay { weekday, .. }, DayVariant::Weekday) => weekday,
            (StageCommands::ByDay { weekend, .. }, DayVariant::Weekend) => weekend,
        }
    }
}

/// A named, ordered unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub commands: StageCommands,
    pub artifacts: Vec<ArtifactSpec>,
    /// Time all commands of this stage may take together, overriding the pipeline
    pub timeout: Option<Duration>,
    /// Extra environment exported to this stage only
    pub env: BTreeMap<String, String>,
}

impl Stage {
    /// A stage with fixed commands and no artifacts
    pub fn new(name: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            commands: StageCommands::Fixed(commands),
            artifacts: Vec::new(),
            timeout: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactSpec>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Ordered stages executed fail-fast in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub name: String,
    /// Output directory template, overriding the application default
    pub output_dir: Option<String>,
    /// Default stage timeout for all stages
    pub timeout: Option<Duration>,
    /// Environment exported to every stage
    pub env: BTreeMap<String, String>,
    pub stages: Vec<Stage>,
    /// File the definition was loaded from; empty when parsed from a string
    pub path: PathBuf,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            output_dir: None,
            timeout: None,
            env: BTreeMap::new(),
            stages,
            path: PathBuf::new(),
        }
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_for_variant() {
        let fixed = StageCommands::Fixed(vec!["make lint".to_string()]);
        assert_eq!(fixed.for_variant(DayVariant::Weekday), ["make lint"]);
        assert_eq!(fixed.for_variant(DayVariant::Weekend), ["make lint"]);

        let by_day = StageCommands::ByDay {
            weekday: vec!["bench --full".to_string()],
            weekend: vec!["bench".to_string()],
        };
        assert_eq!(by_day.for_variant(DayVariant::Weekday), ["bench --full"]);
        assert_eq!(by_day.for_variant(DayVariant::Weekend), ["bench"]);
    }

    #[test]
    fn test_stage_lookup() {
        let pipeline = Pipeline::new(
            "ci",
            vec![
                Stage::new("lint", vec!["true".to_string()]),
                Stage::new("benchmark", vec!["true".to_string()]),
            ],
        );
        assert_eq!(pipeline.stage_names(), vec!["lint", "benchmark"]);
        assert!(pipeline.stage("benchmark").is_some());
        assert!(pipeline.stage("deploy").is_none());
    }
}
