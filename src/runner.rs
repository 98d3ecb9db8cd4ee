//! Sequential test execution.
//!
//! Tests run one at a time, in the order given. Each goes through:
//!
//! ```text
//! reset monitors ─► prep ─► [depend ─► configure plugins ─► run] ─► done ─► [check] ─► report
//!                             └─────── skipped under --dryrun ──┘           └ skipped under --live
//! ```
//!
//! The working directory and the environment overlay are passed to each child
//! explicitly; the harness process itself never changes directory.
//!
//! # Errors
//!
//! A failed check is recorded in the test's report and the run continues. A
//! [`RunError`] ends the whole run: dependency failures, unsupported
//! download sources, programs that cannot be started, children that survive
//! SIGKILL and failing plugin hooks.

pub mod coverage;
pub mod depend;
pub mod environment;
pub mod process;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use crate::config::{ConfigError, HarnessConfig, Options};
use crate::discovery::ResolvedTest;
use crate::plugin::{self, Execution, PluginSet};
use crate::report::{RunSummary, TestReport};
use crate::spec::CommandMode;

use self::environment::TestEnvironment;
use self::process::Invocation;

/// Directory below the cache that documentation snippets are written to.
pub const YEADOC_DIR_NAME: &str = "yeadoc";

/// Result type for run operations.
pub type RunResult<T> = Result<T, RunError>;

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Unsupported source {url} for {file}: only http(s) downloads are supported")]
    UnsupportedSource { file: String, url: String },

    #[error("Failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Dependency step `{command}` failed: {reason}")]
    Dependency { command: String, reason: String },

    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process group {pid} survived SIGKILL: {command}")]
    Unkillable { pid: u32, command: String },

    #[error("Plugin {plugin} failed: {source:#}")]
    Plugin {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs tests and collects their reports.
pub struct Runner<'a> {
    config: &'a HarnessConfig,
    options: &'a Options,
    plugins: PluginSet,
    pid: u32,
    coverage_file_preset: bool,
}

impl<'a> Runner<'a> {
    pub fn new(config: &'a HarnessConfig, options: &'a Options, plugins: PluginSet) -> Self {
        Self {
            config,
            options,
            plugins,
            pid: std::process::id(),
            coverage_file_preset: std::env::var_os(coverage::COVERAGE_FILE_ENV).is_some(),
        }
    }

    /// Overrides the process id used to name per-test files.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    /// Runs `tests` in order. Plugin monitors are stopped even when the run
    /// aborts.
    pub async fn run(&mut self, tests: &[ResolvedTest]) -> RunResult<RunSummary> {
        self.plugins.inform(tests);

        let outcome = self.run_all(tests).await;
        let stopped = self.plugins.monitors_stop().await;

        let reports = outcome?;
        stopped?;
        Ok(RunSummary::new(reports))
    }

    async fn run_all(&self, tests: &[ResolvedTest]) -> RunResult<Vec<TestReport>> {
        self.plugins.monitors_init().await?;
        self.plugins.monitors_start().await?;

        let mut reports = Vec::with_capacity(tests.len());
        for test in tests {
            self.plugins.monitors_reset().await?;
            reports.push(self.run_test(test).await?);
        }
        Ok(reports)
    }

    /// Prepares, runs and checks one test.
    pub async fn run_test(&self, test: &ResolvedTest) -> RunResult<TestReport> {
        tracing::info!("Test {} ({})", test.id, test.name);
        self.plugins.test_prep(test).await?;

        let mut env = environment::test_environment(test, &self.config.cache_dir(), self.pid);
        if !self.coverage_file_preset {
            let file = coverage::coverage_file(&self.config.cache_dir(), self.pid, &test.id);
            env.vars.insert(
                coverage::COVERAGE_FILE_ENV.to_string(),
                file.to_string_lossy().into_owned(),
            );
        }
        let covrc =
            coverage::write_covrc(self.config, self.pid, &test.id, |k| std::env::var(k).ok())?;

        let execution = if self.options.dryrun {
            tracing::info!("Dry run, not executing {}", test.id);
            Execution {
                profile_file: env.profile_file.clone(),
                ..Default::default()
            }
        } else {
            self.execute(test, env, covrc.as_deref()).await?
        };

        self.plugins.test_done(test).await?;
        if self.options.live {
            tracing::info!("Live run, not checking {}", test.id);
            return Ok(TestReport::unchecked(test, &execution));
        }
        let results = self
            .plugins
            .check(test, &execution, self.options.debug)
            .await;
        let report = TestReport::new(test, &execution, results);
        if report.passed() {
            tracing::info!("Test {} passed", test.id);
        } else {
            tracing::warn!("Test {} failed: {}", test.id, report.failure_message());
        }
        Ok(report)
    }

    async fn execute(
        &self,
        test: &ResolvedTest,
        env: TestEnvironment,
        covrc: Option<&Path>,
    ) -> RunResult<Execution> {
        let grace = self.options.kill_grace;
        std::fs::create_dir_all(self.config.cache_dir())?;

        depend::resolve(&test.spec.depend, test.dir(), &self.config.python, grace).await?;
        self.configure_plugins(test).await?;

        let mut invocation = self.invocation(test, covrc)?;
        invocation.env = env.vars;

        let outcome = process::run(&invocation, grace).await?;
        Ok(Execution {
            ran: true,
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            timed_out: outcome.timed_out,
            elapsed: outcome.elapsed,
            profile_file: env.profile_file,
        })
    }

    /// Hands each declared plugin the `:plugin:` parameters of the test's
    /// permutation.
    async fn configure_plugins(&self, test: &ResolvedTest) -> RunResult<()> {
        let Some(permutation) = &test.permutation else {
            return Ok(());
        };
        let params = permutation.params();
        for name in &test.spec.plugin {
            let config = plugin::get_config(&params, &environment::plugin_prefix(name));
            if !config.is_empty() {
                self.plugins.configure(name, Value::Object(config)).await?;
            }
        }
        Ok(())
    }

    /// Builds the command line and working directory of `test`, writing the
    /// snippet of a documentation test to the cache first.
    pub fn invocation(&self, test: &ResolvedTest, covrc: Option<&Path>) -> RunResult<Invocation> {
        let command = &test.spec.command;
        let wrapper = &self.config.coverage_command;
        let python = &self.config.python;

        let (target, dir): (Vec<String>, PathBuf) = match &test.snippet {
            Some(snippet) => {
                let dir = self.config.cache_dir().join(YEADOC_DIR_NAME);
                let path = snippet.materialize(&dir, &test.stem())?;
                let file = file_name(&path);
                let target = if wrapper.is_empty() {
                    vec![python.clone(), file]
                } else {
                    vec![format!("./{file}")]
                };
                (target, dir)
            }
            None => {
                let target = match (&command.program, command.mode) {
                    (None, _) => vec![format!("./{}", file_name(&test.program))],
                    (Some(program), CommandMode::Module) => {
                        let module = module_name(program);
                        if wrapper.is_empty() {
                            vec![python.clone(), "-m".to_string(), module]
                        } else {
                            vec!["-m".to_string(), module]
                        }
                    }
                    (Some(program), CommandMode::Default) => vec![format!("./{program}")],
                };
                (target, test.dir().to_path_buf())
            }
        };

        let mut argv = wrapper.clone();
        if !wrapper.is_empty()
            && let Some(rc) = covrc
        {
            argv.push("--rcfile".to_string());
            argv.push(rc.to_string_lossy().into_owned());
        }
        argv.extend(target);
        argv.extend(command.args.iter().cloned());

        Ok(Invocation::new(argv, dir).with_timeout(Some(Duration::from_secs(command.timeout))))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `pkg/sub/mod.py` as a dotted module name: `pkg.sub.mod`.
pub fn module_name(program: &str) -> String {
    program
        .split(".py")
        .next()
        .unwrap_or(program)
        .replace('/', ".")
}
