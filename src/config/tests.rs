#[cfg(test)]
mod tests {
    use crate::config::{
        load_app_config, load_pipeline, load_pipeline_file, AppConfig, Configuration,
        GlobalConfig, PathConfiguration,
    };
    use crate::error::PipelineError;
    use crate::pipeline::{ArtifactSpec, DayVariant, StageCommands};
    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::tempdir;

    const CI_PIPELINE: &str = r#"
name: mobile-ai-bench
output_dir: "/bench/{project}/{pipeline_id}"
timeout_secs: 3600
env:
  BENCH_MODE: "ci"
stages:
  - name: cpplint
    commands:
      - "sh tools/cpplint.sh"
  - name: pylint
    commands:
      - "pycodestyle $(find . -name '*.py')"
  - name: benchmark
    timeout_secs: 7200
    env:
      TARGET_ABIS: "armeabi-v7a,arm64-v8a"
    variants:
      weekday:
        - "bash tools/benchmark.sh --input_dir=/data --max_targets=2"
      weekend:
        - "bash tools/benchmark.sh"
    artifacts:
      - prepare_report.csv
      - path: run_report.csv
        required: true
      - "logs/*.log"
"#;

    fn assert_parse_error(source: &str, needle: &str) {
        match load_pipeline(source) {
            Err(PipelineError::Parse(message)) => assert!(
                message.contains(needle),
                "expected '{}' in '{}'",
                needle,
                message
            ),
            other => panic!("expected parse error containing '{}', got {:?}", needle, other),
        }
    }

    #[test]
    fn test_load_pipeline() {
        let pipeline = load_pipeline(CI_PIPELINE).unwrap();

        assert_eq!(pipeline.name, "mobile-ai-bench");
        assert_eq!(pipeline.stage_names(), vec!["cpplint", "pylint", "benchmark"]);
        assert_eq!(pipeline.timeout, Some(Duration::from_secs(3600)));
        assert_eq!(pipeline.env["BENCH_MODE"], "ci");
        assert_eq!(
            pipeline.output_dir.as_deref(),
            Some("/bench/{project}/{pipeline_id}")
        );

        let benchmark = pipeline.stage("benchmark").unwrap();
        assert_eq!(benchmark.timeout, Some(Duration::from_secs(7200)));
        assert_eq!(benchmark.env["TARGET_ABIS"], "armeabi-v7a,arm64-v8a");
        assert_eq!(
            benchmark.artifacts,
            vec![
                ArtifactSpec::optional("prepare_report.csv"),
                ArtifactSpec::required("run_report.csv"),
                ArtifactSpec::optional("logs/*.log"),
            ]
        );
        assert!(matches!(benchmark.commands, StageCommands::ByDay { .. }));
        assert_eq!(
            benchmark.commands.for_variant(DayVariant::Weekend),
            ["bash tools/benchmark.sh"]
        );
    }

    #[test]
    fn test_pipeline_name_defaults() {
        let pipeline = load_pipeline("stages:\n  - name: lint\n    commands: [\"true\"]\n").unwrap();
        assert_eq!(pipeline.name, "pipeline");
        assert!(pipeline.output_dir.is_none());
        assert!(pipeline.stage("lint").unwrap().artifacts.is_empty());
    }

    #[test]
    fn test_rejects_malformed_definitions() {
        assert_parse_error("stages: [", "");
        assert_parse_error("name: ci\n", "missing 'stages'");
        assert_parse_error("stages: []\n", "no stages");
        assert_parse_error("stages:\n  - commands: [\"true\"]\n", "has no name");
        assert_parse_error(
            "stages:\n  - name: \"\"\n    commands: [\"true\"]\n",
            "stage name cannot be empty",
        );
        assert_parse_error(
            "stages:\n  - name: lint\n    commands: [\"true\"]\n  - name: lint\n    commands: [\"false\"]\n",
            "duplicate stage name 'lint'",
        );
        assert_parse_error("stages:\n  - name: lint\n", "neither 'commands' nor 'variants'");
        assert_parse_error("stages:\n  - name: lint\n    commands: []\n", "has no commands");
        assert_parse_error(
            "stages:\n  - name: lint\n    commands: [\"  \"]\n",
            "empty command",
        );
        assert_parse_error(
            "stages:\n  - name: bench\n    commands: [\"a\"]\n    variants:\n      weekday: [\"a\"]\n      weekend: [\"b\"]\n",
            "both 'commands' and 'variants'",
        );
        assert_parse_error(
            "stages:\n  - name: bench\n    variants:\n      weekday: []\n      weekend: [\"b\"]\n",
            "has no variants.weekday",
        );
        assert_parse_error(
            "stages:\n  - name: lint\n    commands: [\"true\"]\n    timeout_secs: 0\n",
            "timeout must be greater than zero",
        );
        assert_parse_error(
            "stages:\n  - name: lint\n    command: [\"true\"]\n",
            "unknown field",
        );
    }

    #[test]
    fn test_rejects_escaping_artifacts() {
        for pattern in ["/etc/passwd", "../report.csv", "logs/../../x.csv"] {
            let source = format!(
                "stages:\n  - name: bench\n    commands: [\"true\"]\n    artifacts: [\"{}\"]\n",
                pattern
            );
            assert_parse_error(&source, "must be relative to the output directory");
        }

        assert_parse_error(
            "stages:\n  - name: bench\n    commands: [\"true\"]\n    artifacts: [\"reports/[\"]\n",
            "artifact 'reports/['",
        );
    }

    #[test]
    fn test_load_pipeline_file() {
        let tempdir = tempdir().unwrap();
        let path = tempdir.path().join("pipeline.yml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(CI_PIPELINE.as_bytes()).unwrap();

        let pipeline = load_pipeline_file(&path).unwrap();
        assert_eq!(pipeline.config_path(), &path);
        assert_eq!(pipeline.config_type(), "pipeline");
        assert!(pipeline.validate().is_ok());

        let missing = load_pipeline_file(&tempdir.path().join("missing.yml"));
        assert!(missing.is_err());

        fs::write(&path, "stages: []\n").unwrap();
        let err = load_pipeline_file(&path).unwrap_err();
        assert!(err.downcast_ref::<PipelineError>().is_some());
    }

    #[test]
    fn test_app_config_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.output_dir, "output/{project}/{pipeline_id}/{run_id}");
        assert_eq!(config.stage_timeout(), Duration::from_secs(7200));
        assert_eq!(config.kill_grace(), Duration::from_secs(5));
        assert_eq!(config.shell, "sh");
        assert_eq!(config.driver, PathBuf::from("tools/benchmark.sh"));
        assert!(config.stream_output);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_app_config() {
        let tempdir = tempdir().unwrap();
        let config_path = tempdir.path().join("benchci.yml");
        let config_content = r#"
output_dir: "/var/bench/{project}/{date}"
stage_timeout_secs: 600
driver: tools/run.sh
stream_output: false
"#;
        fs::write(&config_path, config_content).unwrap();

        let config = load_app_config(Some(&config_path)).unwrap();
        assert_eq!(config.output_dir, "/var/bench/{project}/{date}");
        assert_eq!(config.stage_timeout_secs, 600);
        assert_eq!(config.kill_grace_secs, 5);
        assert_eq!(config.driver, tempdir.path().join("tools/run.sh"));
        assert!(!config.stream_output);
        assert_eq!(config.config_path(), &config_path);
    }

    #[test]
    fn test_load_app_config_errors() {
        let tempdir = tempdir().unwrap();
        assert!(load_app_config(Some(&tempdir.path().join("absent.yml"))).is_err());

        let config_path = tempdir.path().join("benchci.yml");
        fs::write(&config_path, "stage_timeout_secs: 0\n").unwrap();
        assert!(load_app_config(Some(&config_path)).is_err());

        fs::write(&config_path, "bin_dir: /tmp\n").unwrap();
        assert!(load_app_config(Some(&config_path)).is_err());
    }

    #[test]
    fn test_path_expansion() {
        let config = AppConfig {
            driver: PathBuf::from("/opt/bench/benchmark.sh"),
            ..AppConfig::default()
        };
        let expanded = config.with_expanded_paths(Path::new("/etc/benchci")).unwrap();
        assert_eq!(expanded.driver, PathBuf::from("/opt/bench/benchmark.sh"));

        let expanded = AppConfig::default()
            .with_expanded_paths(Path::new("/etc/benchci"))
            .unwrap();
        assert_eq!(
            expanded.driver,
            PathBuf::from("/etc/benchci/tools/benchmark.sh")
        );
    }

    #[test]
    fn test_global_config_precedence() {
        let mut global = GlobalConfig {
            app: AppConfig::default(),
            pipeline: load_pipeline(CI_PIPELINE).unwrap(),
        };
        assert!(global.validate().is_ok());

        assert_eq!(global.output_template(Some("cli/{run_id}")), "cli/{run_id}");
        assert_eq!(global.output_template(None), "/bench/{project}/{pipeline_id}");
        assert_eq!(global.default_timeout(), Duration::from_secs(3600));

        global.pipeline.output_dir = None;
        global.pipeline.timeout = None;
        assert_eq!(
            global.output_template(None),
            "output/{project}/{pipeline_id}/{run_id}"
        );
        assert_eq!(global.default_timeout(), Duration::from_secs(7200));
    }
}
