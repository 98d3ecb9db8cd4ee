//! yea CLI - discover and run spec-annotated test scripts.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use yea::config::{HarnessConfig, Options};
use yea::discovery::{Discoverer, ResolvedTest};
use yea::durations::DurationHistory;
use yea::plugin::{ExitStatusPlugin, PluginSet};
use yea::report::{self, JUnitWriter};
use yea::runner::Runner;
use yea::split;

#[derive(Parser)]
#[command(name = "yea")]
#[command(about = "Discover and run spec-annotated test scripts", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Go through the run bookkeeping without executing anything
    #[arg(long, global = true)]
    dryrun: bool,

    /// Run the tests without checking their results
    #[arg(long, global = true)]
    live: bool,

    /// Treat discovery warnings as fatal
    #[arg(long, global = true)]
    strict: bool,

    /// Ignore skip tags and selection filters
    #[arg(long, global = true)]
    noskip: bool,

    /// Only tests tagged with this suite
    #[arg(long, global = true)]
    suite: Option<String>,

    /// Only tests tagged with this shard
    #[arg(long, global = true)]
    shard: Option<String>,

    /// Select tests for this platform instead of the running one
    #[arg(long, global = true)]
    platform: Option<String>,

    /// Include tests embedded in documentation
    #[arg(long, global = true)]
    yeadoc: bool,

    /// Split the tests into this many duration-balanced groups
    #[arg(long, global = true)]
    splits: Option<usize>,

    /// Which group to run (1-based), with --splits
    #[arg(long, global = true)]
    group: Option<usize>,

    /// Record this run's durations in the history file
    #[arg(long, global = true)]
    store_durations: bool,

    /// Debug logging, also forwarded to plugin checks
    #[arg(long, global = true)]
    debug: bool,

    /// Seconds a child gets to exit after each termination signal
    #[arg(long, global = true, default_value_t = 30)]
    kill_grace: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// List tests
    #[command(alias = "l")]
    List {
        /// Test files or directories (default: every configured test directory)
        tests: Vec<PathBuf>,
    },

    /// Run tests
    #[command(alias = "r")]
    Run {
        /// Run every test under the configured test directories
        #[arg(long)]
        all: bool,

        /// Test files or directories (default: the current directory)
        tests: Vec<PathBuf>,
    },
}

impl GlobalArgs {
    fn options(&self, all: bool) -> Options {
        Options {
            suite: self.suite.clone(),
            shard: self.shard.clone(),
            platform: self.platform.clone(),
            strict: self.strict,
            noskip: self.noskip,
            dryrun: self.dryrun,
            live: self.live,
            yeadoc: self.yeadoc,
            all,
            splits: self.splits,
            group: self.group,
            store_durations: self.store_durations,
            debug: self.debug,
            kill_grace: Duration::from_secs(self.kill_grace),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.global.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("yea={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let outcome = dispatch(cli).await;
    if let Err(e) = &outcome {
        eprintln!("{} {:#}", console::style("ERROR:").red().bold(), e);
    }
    std::process::exit(yea::exit_code(&outcome));
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::List { tests } => {
            let all = tests.is_empty();
            list_tests(&cli.global.options(all), &tests)
        }
        Commands::Run { all, tests } => run_tests(&cli.global.options(all), &tests).await,
    }
}

fn resolve_config() -> Result<(PathBuf, HarnessConfig)> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config = HarnessConfig::resolve(&cwd).context("Failed to load configuration")?;
    info!("Using root {}", config.root.display());
    Ok((cwd, config))
}

/// Discovers tests and applies the shard selection.
fn collect(
    config: &HarnessConfig,
    options: &Options,
    cwd: PathBuf,
    paths: &[PathBuf],
) -> Result<Vec<ResolvedTest>> {
    let shard = options.shard_selection()?;
    let mut tests = Discoverer::new(config, options)
        .with_working_dir(cwd)
        .collect(paths)
        .context("Test discovery failed")?;

    if let Some((splits, group)) = shard {
        let history = DurationHistory::load(&config.durations_path());
        tests = split::select_group(splits, group, &tests, history.as_map())
            .map(|g| g.selected)
            .unwrap_or_default();
    }
    Ok(tests)
}

fn list_tests(options: &Options, paths: &[PathBuf]) -> Result<i32> {
    let (cwd, config) = resolve_config()?;
    let tests = collect(&config, options, cwd, paths)?;

    println!("Tests:");
    for test in &tests {
        println!("  {} : {}", test.id, test.name);
    }
    Ok(yea::EXIT_SUCCESS)
}

async fn run_tests(options: &Options, paths: &[PathBuf]) -> Result<i32> {
    let (cwd, config) = resolve_config()?;
    let tests = collect(&config, options, cwd, paths)?;
    info!("Running {} tests", tests.len());

    let plugins = PluginSet::new().with(ExitStatusPlugin);
    let summary = Runner::new(&config, options, plugins)
        .run(&tests)
        .await
        .context("Test run aborted")?;

    if let Some(path) = config.results_path() {
        JUnitWriter::new(path).write(&summary)?;
    }
    report::print_summary(&summary);

    if options.store_durations && options.dryrun {
        info!("Dry run, not storing durations");
    } else if options.store_durations {
        let path = config.durations_path();
        let mut history = DurationHistory::load(&path);
        history.merge(summary.durations());
        history.save(&path)?;
        info!("Stored {} durations in {}", history.len(), path.display());
    }

    Ok(summary.exit_code())
}
