use anyhow::Result;
use benchci::{
    bench::{BenchInvocation, BenchmarkOption},
    cancel,
    command::ShellCommand,
    config::{load_app_config, load_pipeline_file, AppConfig, Configuration, GlobalConfig},
    context::RunContext,
    path_utils,
    pipeline::{compute_day_variant, DayVariant, PipelineRunner, RunResult},
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{error, info};
use std::io::IsTerminal;
use std::{path::PathBuf, process};

const DEFAULT_PIPELINE: &str = "pipeline.yml";

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "Run declarative CI benchmark pipelines with fail-fast stages"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Application config, defaults to benchci.yml when present
    #[arg(short, long, global = true)]
    app_config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run all stages of a pipeline definition
    Run {
        /// Pipeline definition
        #[arg(short, long, default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,

        #[command(flatten)]
        context: ContextArgs,

        /// Print the resolved commands without running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Check a pipeline definition and list its stages
    Validate {
        /// Pipeline definition
        #[arg(short, long, default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,
    },
    /// Print the benchmark variant selected for a date
    Variant {
        /// Date to evaluate (YYYY-MM-DD), defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run the benchmark driver and collect its reports
    Bench {
        #[command(flatten)]
        context: ContextArgs,

        #[command(flatten)]
        bench: BenchArgs,

        /// Print the driver call without running it
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum VariantArg {
    /// Derive from the date
    #[default]
    Auto,
    Weekday,
    Weekend,
}

impl VariantArg {
    fn forced(self) -> Option<DayVariant> {
        match self {
            VariantArg::Auto => None,
            VariantArg::Weekday => Some(DayVariant::Weekday),
            VariantArg::Weekend => Some(DayVariant::Weekend),
        }
    }
}

#[derive(Args, Debug)]
struct ContextArgs {
    /// Date deciding the variant and `{date}` (YYYY-MM-DD), defaults to today
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Project identifier
    #[arg(long, env = "CI_PROJECT_NAME", default_value = "local")]
    project: String,

    /// Pipeline identifier
    #[arg(long, env = "CI_PIPELINE_ID", default_value = "0")]
    pipeline_id: String,

    /// Run identifier, random when not set
    #[arg(long, env = "CI_JOB_ID")]
    run_id: Option<String>,

    /// Native toolchain root exported to stages
    #[arg(long, env = "ANDROID_NDK_HOME")]
    ndk_home: Option<String>,

    /// Force the weekday or weekend command set
    #[arg(long, value_enum, default_value_t = VariantArg::Auto)]
    variant: VariantArg,

    /// Output directory template, overrides the pipeline and app config
    #[arg(short, long)]
    output_dir: Option<String>,

    /// Directory stage commands run in
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,
}

impl ContextArgs {
    fn build(&self, output_template: &str) -> Result<RunContext> {
        let cwd = std::env::current_dir()?;
        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(|| rand::random::<u32>().to_string());

        Ok(RunContext::builder(self.date.unwrap_or_else(today))
            .project(self.project.as_str())
            .pipeline_id(self.pipeline_id.as_str())
            .run_id(run_id)
            .ndk_home(self.ndk_home.clone())
            .base_dir(path_utils::absolutize(&self.base_dir, &cwd))
            .variant(self.variant.forced())
            .build(output_template))
    }
}

#[derive(Args, Debug)]
struct BenchArgs {
    /// Measure performance or precision
    #[arg(long, value_enum, default_value_t = BenchmarkOption::Performance)]
    benchmark_option: BenchmarkOption,

    /// Comma separated target ABIs
    #[arg(long, value_delimiter = ',', required = true)]
    target_abis: Vec<String>,

    /// Minutes a device may stay locked by one run
    #[arg(long, default_value_t = 30)]
    max_time_per_lock: u64,

    /// `all` or a comma separated executor list
    #[arg(long, default_value = "all")]
    executors: String,

    /// Input source, passed on weekdays only
    #[arg(long)]
    input_dir: Option<String>,

    /// Limit on benchmarked targets, passed on weekdays only
    #[arg(long)]
    max_targets: Option<u32>,

    /// Driver script, overrides the app config
    #[arg(long)]
    driver: Option<PathBuf>,
}

impl BenchArgs {
    fn invocation(&self, app: &AppConfig, context: &RunContext) -> BenchInvocation {
        BenchInvocation {
            driver: self.driver.clone().unwrap_or_else(|| app.driver.clone()),
            benchmark_option: self.benchmark_option,
            target_abis: self.target_abis.clone(),
            output_dir: context.output_dir().to_path_buf(),
            max_time_per_lock: self.max_time_per_lock,
            executors: self.executors.clone(),
            input_dir: self.input_dir.clone(),
            max_targets: self.max_targets,
        }
    }
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("{:#}", err);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let app = load_app_config(cli.app_config.as_deref())?;

    match cli.command {
        Commands::Variant { date } => {
            println!("{}", compute_day_variant(date.unwrap_or_else(today)));
            Ok(0)
        }
        Commands::Validate { pipeline } => {
            let pipeline = load_pipeline_file(&pipeline)?;
            println!("Pipeline '{}' is valid", pipeline.name);
            for stage in &pipeline.stages {
                println!("  - {}", stage.name);
            }
            Ok(0)
        }
        Commands::Run {
            pipeline,
            context,
            dry_run,
        } => {
            let pipeline = load_pipeline_file(&pipeline)?;
            let config = GlobalConfig { app, pipeline };
            config.validate()?;
            let ctx = context.build(config.output_template(context.output_dir.as_deref()))?;
            execute(&config, &ctx, dry_run)
        }
        Commands::Bench {
            context,
            bench,
            dry_run,
        } => {
            let ctx = context.build(
                context
                    .output_dir
                    .as_deref()
                    .unwrap_or(app.output_dir.as_str()),
            )?;
            let invocation = bench.invocation(&app, &ctx);
            invocation.validate()?;
            let pipeline = invocation.to_pipeline(ctx.variant());
            let config = GlobalConfig { app, pipeline };
            execute(&config, &ctx, dry_run)
        }
    }
}

fn execute(config: &GlobalConfig, context: &RunContext, dry_run: bool) -> Result<i32> {
    if dry_run {
        print_plan(config, context);
        return Ok(0);
    }

    let cancel = cancel::install_signal_handlers()?;
    let shell = ShellCommand::new(config.app.shell.clone())
        .with_kill_grace(config.app.kill_grace())
        .with_stream_output(config.app.stream_output);
    let runner = PipelineRunner::builder(Box::new(shell))
        .default_timeout(Some(config.default_timeout()))
        .cancel_token(cancel)
        .record_run(true)
        .progress(std::io::stderr().is_terminal())
        .build()?;

    let result = runner.run(&config.pipeline, context)?;
    report(&result);
    Ok(result.exit_code)
}

fn print_plan(config: &GlobalConfig, context: &RunContext) {
    println!(
        "Pipeline '{}' ({} variant, date {})",
        config.pipeline.name,
        context.variant(),
        context.date_str()
    );
    println!("Output directory: {}", context.output_dir().display());
    for stage in &config.pipeline.stages {
        println!("[{}]", stage.name);
        for command in stage.commands.for_variant(context.variant()) {
            println!("  $ {}", context.substitute_command(command));
        }
    }
}

fn report(result: &RunResult) {
    if result.success {
        info!("All stages completed successfully.");
        for artifact in &result.artifacts {
            println!("{}", artifact.display());
        }
        return;
    }

    let stage = result.failed_stage.as_deref().unwrap_or("<none>");
    eprintln!(
        "Stage '{}' failed: {}",
        stage,
        result.error.as_deref().unwrap_or("unknown error")
    );
    if let Some(log) = result.failed_stage_log() {
        for command in &log.commands {
            eprintln!("$ {}", command.command);
            if !command.stdout.is_empty() {
                eprint!("{}", command.stdout);
            }
            if !command.stderr.is_empty() {
                eprint!("{}", command.stderr);
            }
        }
    }
}
