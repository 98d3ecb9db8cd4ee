//! yea: a discovery and execution harness for spec-annotated test scripts.
//!
//! Tests are standalone programs described by a small YAML spec, either in a
//! `.yea` sidecar file or embedded in the leading docstring of a `.py` file.
//! The harness finds them, expands parametrized ones, gives each a stable id,
//! optionally picks one shard of the set, and runs them one at a time.
//!
//! # Architecture
//!
//! - **Config**: `.yearc` hierarchy root and per-directory overrides
//! - **Spec**: parsing, schema validation and typed test specs
//! - **Discovery**: walking test directories, skip filters, doc snippets
//! - **Identity**: composing canonical ids and the natural sort order
//! - **Split**: duration-balanced sharding
//! - **Runner**: dependency setup, environment contract, process control
//! - **Plugin**: collaborators that monitor and judge each test
//! - **Report**: console summary and JUnit XML
//!
//! # Example
//!
//! ```no_run
//! use yea::config::{HarnessConfig, Options};
//! use yea::discovery::Discoverer;
//! use yea::plugin::{ExitStatusPlugin, PluginSet};
//! use yea::runner::Runner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cwd = std::env::current_dir()?;
//!     let config = HarnessConfig::resolve(&cwd)?;
//!     let options = Options::default();
//!     let tests = Discoverer::new(&config, &options).collect(&[])?;
//!
//!     let plugins = PluginSet::new().with(ExitStatusPlugin);
//!     let summary = Runner::new(&config, &options, plugins).run(&tests).await?;
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod durations;
pub mod identity;
pub mod parametrize;
pub mod plugin;
pub mod report;
pub mod runner;
pub mod spec;
pub mod split;

pub use config::{ConfigError, HarnessConfig, Options};
pub use discovery::{Discoverer, DiscoveryError, ResolvedTest};
pub use plugin::{Plugin, PluginSet};
pub use report::{RunSummary, TestReport};
pub use runner::{RunError, Runner};
pub use spec::{SpecError, TestSpec};

/// Every test passed.
pub const EXIT_SUCCESS: i32 = 0;

/// At least one test failed.
pub const EXIT_TEST_FAILURE: i32 = 1;

/// The harness itself aborted.
pub const EXIT_HARNESS_ERROR: i32 = 2;

/// Exit code of a finished command. Any error that aborted the harness,
/// whether in configuration, discovery or the run itself, maps to
/// [`EXIT_HARNESS_ERROR`].
pub fn exit_code(outcome: &anyhow::Result<i32>) -> i32 {
    match outcome {
        Ok(code) => *code,
        Err(_) => EXIT_HARNESS_ERROR,
    }
}
