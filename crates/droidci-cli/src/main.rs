use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

use droidci::engine::{Reconciler, Reporter};
use droidci::report::HtmlReportParser;
use droidci::runner::ProcessRunner;
use droidci::{events, status};
use droidci_config::{CONFIG_FILE, CliOverrides, DroidciConfig};
use droidci_types::{FailedTestId, IgnoreList, TestKind, TestTarget};

/// Every target passed (or the command succeeded).
const EXIT_OK: u8 = 0;
/// At least one target ended with a failure verdict, or the build is marked failed.
const EXIT_TESTS_FAILED: u8 = 1;
/// The run could not complete: bad config, missing build tool, unwritable results.
const EXIT_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "droidci", version)]
#[command(about = "Run Android test suites with retries and reconcile flaky failures")]
struct Cli {
    /// Project root containing the build tool wrapper
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Config file (default: <project-dir>/.droidci.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for build status and the event log (default: .droidci)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run test targets and reconcile their failures.
    Test(TestArgs),
    /// Print the pipeline build status. Exits 1 if any target has failed.
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear the pipeline build status and event log (run at the start of a pipeline).
    Reset,
    /// Config file helpers.
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Generate shell completion scripts.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print a commented default config, or write it with --output.
    Init {
        #[arg(long)]
        output: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Load and validate the config file.
    Validate,
}

#[derive(clap::Args, Debug)]
struct TestArgs {
    /// Module to test (repeatable). Targets run sequentially.
    #[arg(long = "target", required = true)]
    targets: Vec<TestTarget>,

    /// Suite kind: unit or integration
    #[arg(long, default_value = "unit")]
    kind: TestKind,

    /// Accepted failure as <class>#<method> (repeatable, applies to every target)
    #[arg(long = "ignore")]
    ignore: Vec<FailedTestId>,

    /// File with one accepted failure per line
    #[arg(long)]
    ignore_file: Option<PathBuf>,

    /// Where collected reports are written (default: test-results)
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Build tool program (default: ./gradlew)
    #[arg(long)]
    program: Option<String>,

    /// Whole-suite retries when failing tests cannot be identified
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    suite_attempts: Option<u32>,

    /// Wait before each whole-suite retry (e.g. 10s)
    #[arg(long, value_parser = parse_duration)]
    suite_delay: Option<Duration>,

    /// Attempts per failing test
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    test_attempts: Option<u32>,

    /// Wait before retrying each failing test (e.g. 10s)
    #[arg(long, value_parser = parse_duration)]
    settle_delay: Option<Duration>,

    /// How often a running build is polled (e.g. 10s)
    #[arg(long, value_parser = parse_nonzero_duration)]
    poll_interval: Option<Duration>,

    /// Print a liveness line every N polls (0 disables)
    #[arg(long)]
    heartbeat_every: Option<u32>,

    /// Kill a build invocation after this long (e.g. 2h)
    #[arg(long, value_parser = parse_nonzero_duration)]
    timeout: Option<Duration>,

    /// Extra arguments for the build tool, after `--`
    #[arg(last = true)]
    build_args: Vec<String>,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut reporter = CliReporter;

    match run(cli, &mut reporter) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            reporter.error(&format!("{e:#}"));
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(cli: Cli, reporter: &mut dyn Reporter) -> Result<u8> {
    match cli.cmd {
        Commands::Test(ref args) => run_test(&cli, args, reporter),
        Commands::Status { json } => run_status(&cli, json),
        Commands::Reset => run_reset(&cli, reporter),
        Commands::Config { ref action } => match action {
            ConfigCommands::Init { output, force } => {
                run_config_init(output.as_deref(), *force, reporter)
            }
            ConfigCommands::Validate => run_config_validate(&cli),
        },
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(EXIT_OK)
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn parse_nonzero_duration(s: &str) -> Result<Duration> {
    let duration = parse_duration(s)?;
    if duration.is_zero() {
        bail!("duration must be greater than 0");
    }
    Ok(duration)
}

fn load_config(cli: &Cli) -> Result<DroidciConfig> {
    let config = match &cli.config {
        Some(path) => DroidciConfig::load_from_file(path)?,
        None => DroidciConfig::load_from_project(&cli.project_dir)?.unwrap_or_default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn state_dir(cli: &Cli, config: &DroidciConfig) -> PathBuf {
    let dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| config.paths.state_dir.clone());
    if dir.is_absolute() {
        dir
    } else {
        cli.project_dir.join(dir)
    }
}

fn run_test(cli: &Cli, args: &TestArgs, reporter: &mut dyn Reporter) -> Result<u8> {
    let config = load_config(cli)?;

    let mut shared_ignores: IgnoreList = args.ignore.iter().cloned().collect();
    if let Some(path) = &args.ignore_file {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read ignore file {}", path.display()))?;
        let from_file = IgnoreList::parse_lines(&content)
            .with_context(|| format!("invalid ignore file {}", path.display()))?;
        shared_ignores.extend(from_file.iter().cloned());
    }

    let opts = config.build_runtime_options(
        &cli.project_dir,
        CliOverrides {
            program: args.program.clone(),
            build_args: (!args.build_args.is_empty()).then(|| args.build_args.clone()),
            results_dir: args.results_dir.clone(),
            state_dir: cli.state_dir.clone(),
            suite_attempts: args.suite_attempts,
            suite_delay: args.suite_delay,
            test_attempts: args.test_attempts,
            settle_delay: args.settle_delay,
            poll_interval: args.poll_interval,
            heartbeat_every: args.heartbeat_every,
            timeout: args.timeout,
        },
    );

    let state_dir = opts.resolved_state_dir();
    let mut build_status = status::load_build_status(&state_dir)?;
    let runner = ProcessRunner::from_options(&opts);
    let mut reconciler = Reconciler::new(opts, runner, HtmlReportParser);

    let mut reports = Vec::new();
    for target in &args.targets {
        let mut ignore = config.ignore_list_for(target);
        ignore.extend(shared_ignores.iter().cloned());
        let ignore = (!ignore.is_empty()).then_some(&ignore);

        let report = reconciler.reconcile(target, args.kind, ignore, reporter)?;
        if build_status.record(&report) {
            status::save_build_status(&state_dir, &build_status)?;
        }
        reports.push(report);
    }

    println!();
    for report in &reports {
        println!("{}", report.summary_line());
    }
    println!(
        "results: {}",
        reconciler.options().resolved_results_dir().display()
    );

    if reports.iter().all(|r| r.verdict.is_success()) {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_TESTS_FAILED)
    }
}

fn run_status(cli: &Cli, json: bool) -> Result<u8> {
    let config = load_config(cli)?;
    let build_status = status::load_build_status(&state_dir(cli, &config))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&build_status).context("failed to serialize status")?
        );
    } else {
        print!("{}", build_status.render());
    }

    if build_status.is_failed() {
        Ok(EXIT_TESTS_FAILED)
    } else {
        Ok(EXIT_OK)
    }
}

fn run_reset(cli: &Cli, reporter: &mut dyn Reporter) -> Result<u8> {
    let config = load_config(cli)?;
    let dir = state_dir(cli, &config);
    if status::clear_build_status(&dir)? {
        reporter.info(&format!("cleared build status in {}", dir.display()));
    } else {
        reporter.info("no build status to clear");
    }
    if events::clear_events(&dir)? {
        reporter.info(&format!("cleared event log in {}", dir.display()));
    }
    Ok(EXIT_OK)
}

fn run_config_init(output: Option<&Path>, force: bool, reporter: &mut dyn Reporter) -> Result<u8> {
    let template = DroidciConfig::default_toml_template();
    match output {
        None => print!("{template}"),
        Some(path) => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            fs::write(path, template)
                .with_context(|| format!("failed to write config file {}", path.display()))?;
            reporter.info(&format!("wrote {}", path.display()));
        }
    }
    Ok(EXIT_OK)
}

fn run_config_validate(cli: &Cli) -> Result<u8> {
    let source = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let path = cli.project_dir.join(CONFIG_FILE);
            if !path.exists() {
                bail!("no config file found at {}", path.display());
            }
            path
        }
    };
    let config = DroidciConfig::load_from_file(&source)?;
    config.validate().context("invalid configuration")?;

    println!("config is valid: {}", source.display());
    println!("build.program: {}", config.build.program);
    println!(
        "retry.suite: {} x{} ({})",
        strategy_name(&config.retry.suite.strategy),
        config.retry.suite.max_attempts,
        humantime::format_duration(config.retry.suite.base_delay)
    );
    println!(
        "retry.test: {} x{} (settle {})",
        strategy_name(&config.retry.test.strategy),
        config.retry.test.max_attempts,
        humantime::format_duration(config.retry.test.settle_delay)
    );
    println!("ignored targets: {}", config.ignore.len());
    Ok(EXIT_OK)
}

fn strategy_name(strategy: &droidci::retry::RetryStrategyType) -> &'static str {
    use droidci::retry::RetryStrategyType;

    match strategy {
        RetryStrategyType::Immediate => "immediate",
        RetryStrategyType::Constant => "constant",
        RetryStrategyType::Linear => "linear",
        RetryStrategyType::Exponential => "exponential",
    }
}
