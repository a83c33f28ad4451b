use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::context::shell_quote;
use crate::pipeline::{ArtifactSpec, DayVariant, Pipeline, Stage};

/// Reports the benchmark driver leaves in its output directory
pub const REPORT_FILES: [&str; 3] = [
    "prepare_report.csv",
    "run_report.csv",
    "precision_report.csv",
];

/// Name of the single stage of a benchmark pipeline
pub const BENCHMARK_STAGE: &str = "benchmark";

/// What the driver measures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum BenchmarkOption {
    /// Timing of model preparation and inference
    #[default]
    Performance,
    /// Accuracy against a labelled input set
    Precision,
}

impl fmt::Display for BenchmarkOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchmarkOption::Performance => write!(f, "Performance"),
            BenchmarkOption::Precision => write!(f, "Precision"),
        }
    }
}

/// Arguments of one benchmark driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchInvocation {
    /// Driver script, run through bash
    pub driver: PathBuf,
    pub benchmark_option: BenchmarkOption,
    /// Target architectures, e.g. `armeabi-v7a`, `arm64-v8a`
    pub target_abis: Vec<String>,
    pub output_dir: PathBuf,
    /// Minutes a device may stay locked by one run
    pub max_time_per_lock: u64,
    /// `all` or a comma separated executor list
    pub executors: String,
    /// Input source, only passed on weekdays
    pub input_dir: Option<String>,
    /// Limit on benchmarked targets, only passed on weekdays
    pub max_targets: Option<u32>,
}

impl BenchInvocation {
    pub fn validate(&self) -> Result<()> {
        if self.driver.as_os_str().is_empty() {
            anyhow::bail!("Benchmark driver path cannot be empty");
        }
        if self.target_abis.is_empty() {
            anyhow::bail!("At least one target ABI is required");
        }
        if let Some(abi) = self
            .target_abis
            .iter()
            .find(|abi| abi.is_empty() || abi.contains([',', ' ']))
        {
            anyhow::bail!("Invalid target ABI: {:?}", abi);
        }
        if self.max_time_per_lock == 0 {
            anyhow::bail!("max_time_per_lock must be greater than zero");
        }
        if self.executors.trim().is_empty() {
            anyhow::bail!("Executor selection cannot be empty");
        }
        if self.max_targets == Some(0) {
            anyhow::bail!("max_targets must be greater than zero");
        }
        Ok(())
    }

    /// Driver arguments for `variant`; weekend runs drop the input source and target limit
    pub fn args(&self, variant: DayVariant) -> Vec<String> {
        let mut args = vec![
            format!("--benchmark_option={}", self.benchmark_option),
            format!("--target_abis={}", self.target_abis.join(",")),
            format!("--output_dir={}", self.output_dir.display()),
            format!("--max_time_per_lock={}", self.max_time_per_lock),
            format!("--executors={}", self.executors),
        ];

        if variant == DayVariant::Weekday {
            if let Some(input_dir) = &self.input_dir {
                args.push(format!("--input_dir={input_dir}"));
            }
            if let Some(max_targets) = self.max_targets {
                args.push(format!("--max_targets={max_targets}"));
            }
        }
        args
    }

    /// Full shell command line running the driver
    pub fn command_line(&self, variant: DayVariant) -> String {
        let driver = self.driver.to_string_lossy();
        std::iter::once("bash".to_string())
            .chain(std::iter::once(shell_quote(&driver)))
            .chain(self.args(variant).iter().map(|a| shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Single-stage pipeline running the driver and collecting its reports
    pub fn to_pipeline(&self, variant: DayVariant) -> Pipeline {
        let stage = Stage::new(BENCHMARK_STAGE, vec![self.command_line(variant)]).with_artifacts(
            REPORT_FILES
                .iter()
                .map(|report| ArtifactSpec::optional(*report))
                .collect(),
        );
        Pipeline::new(BENCHMARK_STAGE, vec![stage])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::variant_for_iso_day;

    fn invocation() -> BenchInvocation {
        BenchInvocation {
            driver: PathBuf::from("tools/benchmark.sh"),
            benchmark_option: BenchmarkOption::Performance,
            target_abis: vec!["armeabi-v7a".to_string(), "arm64-v8a".to_string()],
            output_dir: PathBuf::from("/bench/output/42"),
            max_time_per_lock: 30,
            executors: "all".to_string(),
            input_dir: Some("http://cnbj1.fds.api.xiaomi.com/aibench/inputs".to_string()),
            max_targets: Some(2),
        }
    }

    #[test]
    fn test_weekday_args() {
        let args = invocation().args(variant_for_iso_day(1));
        assert_eq!(
            args,
            vec![
                "--benchmark_option=Performance",
                "--target_abis=armeabi-v7a,arm64-v8a",
                "--output_dir=/bench/output/42",
                "--max_time_per_lock=30",
                "--executors=all",
                "--input_dir=http://cnbj1.fds.api.xiaomi.com/aibench/inputs",
                "--max_targets=2",
            ]
        );
    }

    #[test]
    fn test_day_six_drops_optional_args() {
        let weekday = invocation().args(variant_for_iso_day(1));
        let saturday = invocation().args(variant_for_iso_day(6));

        assert_eq!(saturday.len(), 5);
        assert!(!saturday.iter().any(|a| a.starts_with("--input_dir=")));
        assert!(!saturday.iter().any(|a| a.starts_with("--max_targets=")));
        assert_eq!(weekday[..5], saturday[..]);
        assert_ne!(weekday, saturday);
    }

    #[test]
    fn test_precision_option() {
        let mut bench = invocation();
        bench.benchmark_option = BenchmarkOption::Precision;
        bench.input_dir = None;
        let args = bench.args(DayVariant::Weekday);
        assert_eq!(args[0], "--benchmark_option=Precision");
        assert_eq!(args.last().unwrap(), "--max_targets=2");
    }

    #[test]
    fn test_command_line_quotes_arguments() {
        let mut bench = invocation();
        bench.executors = "MACE,SNPE".to_string();
        bench.output_dir = PathBuf::from("/tmp/bench out");
        assert_eq!(
            bench.command_line(DayVariant::Weekend),
            "bash tools/benchmark.sh --benchmark_option=Performance \
             --target_abis=armeabi-v7a,arm64-v8a '--output_dir=/tmp/bench out' \
             --max_time_per_lock=30 --executors=MACE,SNPE"
        );
    }

    #[test]
    fn test_validate() {
        assert!(invocation().validate().is_ok());

        let mut bench = invocation();
        bench.target_abis.clear();
        assert!(bench.validate().is_err());

        let mut bench = invocation();
        bench.target_abis = vec!["arm64-v8a,x86".to_string()];
        assert!(bench.validate().is_err());

        let mut bench = invocation();
        bench.max_time_per_lock = 0;
        assert!(bench.validate().is_err());

        let mut bench = invocation();
        bench.max_targets = Some(0);
        assert!(bench.validate().is_err());
    }

    #[test]
    fn test_to_pipeline() {
        let pipeline = invocation().to_pipeline(DayVariant::Weekday);
        assert_eq!(pipeline.stage_names(), vec![BENCHMARK_STAGE]);
        let stage = pipeline.stage(BENCHMARK_STAGE).unwrap();
        assert_eq!(stage.artifacts.len(), 3);
        assert!(stage.artifacts.iter().all(|a| !a.required));
        assert!(crate::config::validate_pipeline(&pipeline).is_ok());
    }
}
