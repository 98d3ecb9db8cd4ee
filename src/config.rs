//! Harness configuration.
//!
//! Settings come from `.yearc` files (see [`schema`]). The one at the
//! hierarchy root carries harness-wide settings and is resolved once per
//! invocation by [`HarnessConfig::resolve`]. Those below the root carry
//! per-directory overrides and are looked up lazily through
//! [`overrides::DirectoryConfigCache`].
//!
//! Per-invocation switches (suite, shard, dry run, ...) are not read from
//! files. The binary builds an [`Options`] value from its arguments and hands
//! it to discovery and the runner.

pub mod overrides;
pub mod schema;

pub use overrides::{DirectoryConfigCache, FsOverrideSource, OverrideSource};
pub use schema::{DirectoryOverride, YEARC_FILE_NAME, YearcFile};

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-root cache directory.
pub const CACHE_DIR_NAME: &str = ".yea_cache";

/// File name of the duration history inside the cache directory.
pub const DURATIONS_FILE_NAME: &str = "durations.json";

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Coverage config template {0} does not exist")]
    MissingCoverageTemplate(PathBuf),

    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

/// Reads and parses a single `.yearc` file.
pub fn read_yearc(path: &Path) -> ConfigResult<YearcFile> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_yearc(&content, path)
}

/// Parses `.yearc` content. `path` is only used in error messages.
pub fn parse_yearc(content: &str, path: &Path) -> ConfigResult<YearcFile> {
    toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Harness-wide settings resolved from the hierarchy root.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// The hierarchy root. Test names and ids are relative to it.
    pub root: PathBuf,

    /// Test directories, relative to the root.
    pub test_dirs: Vec<String>,

    /// Directories scanned for documentation snippets, relative to the root.
    pub yeadoc_dirs: Vec<String>,

    /// Coverage rc template, relative to the root.
    pub coverage_template: Option<String>,

    /// Coverage `[run] source` value.
    pub coverage_source: Option<String>,

    /// Environment variable that overrides `coverage_source` when set.
    pub coverage_source_env: Option<String>,

    /// Instrumentation wrapper placed before every program.
    pub coverage_command: Vec<String>,

    /// Interpreter used for pip and module-mode invocations.
    pub python: String,

    /// JUnit XML output path, relative to the root.
    pub results_file: Option<String>,
}

impl HarnessConfig {
    /// Settings used when no `.yearc` exists anywhere above `dir`.
    pub fn implicit(dir: impl Into<PathBuf>) -> Self {
        Self::from_override(dir.into(), &DirectoryOverride::default())
    }

    fn from_override(root: PathBuf, ov: &DirectoryOverride) -> Self {
        Self {
            root,
            test_dirs: ov
                .test_paths
                .clone()
                .filter(|paths| !paths.is_empty())
                .unwrap_or_else(|| vec![".".to_string()]),
            yeadoc_dirs: ov.yeadoc_paths.clone().unwrap_or_default(),
            coverage_template: ov.coverage_config_template.clone(),
            coverage_source: ov.coverage_source.clone(),
            coverage_source_env: ov.coverage_source_env.clone(),
            coverage_command: ov
                .coverage_command
                .clone()
                .unwrap_or_else(|| vec!["coverage".to_string(), "run".to_string()]),
            python: ov.python.clone().unwrap_or_else(|| "python".to_string()),
            results_file: ov.results_file.clone(),
        }
    }

    /// Locates the hierarchy root above `start_dir` and loads its settings.
    ///
    /// Every ancestor is checked, nearest first. A `.yearc` declaring
    /// `root = true` ends the walk immediately. Otherwise the nearest `.yearc`
    /// seen is kept as a fallback. A directory containing `.git` is checked
    /// and then ends the walk.
    pub fn resolve(start_dir: &Path) -> ConfigResult<Self> {
        let mut fallback: Option<(PathBuf, DirectoryOverride)> = None;

        for dir in start_dir.ancestors() {
            let yearc = dir.join(YEARC_FILE_NAME);
            if yearc.is_file() {
                let file = read_yearc(&yearc)?;
                if file.yea.is_root() {
                    tracing::debug!("Found root config: {}", yearc.display());
                    return Ok(Self::from_override(dir.to_path_buf(), &file.yea));
                }
                if fallback.is_none() {
                    fallback = Some((dir.to_path_buf(), file.yea));
                }
            }
            if dir.join(".git").exists() {
                break;
            }
        }

        match fallback {
            Some((root, ov)) => {
                tracing::debug!("No root config found, using nearest: {}", root.display());
                Ok(Self::from_override(root, &ov))
            }
            None => {
                tracing::debug!(
                    "No .yearc found, using {} as root",
                    start_dir.display()
                );
                Ok(Self::implicit(start_dir))
            }
        }
    }

    /// `<root>/.yea_cache`
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR_NAME)
    }

    /// `<root>/.yea_cache/durations.json`
    pub fn durations_path(&self) -> PathBuf {
        self.cache_dir().join(DURATIONS_FILE_NAME)
    }

    /// Absolute test directories.
    pub fn test_dir_paths(&self) -> Vec<PathBuf> {
        self.test_dirs.iter().map(|d| self.root.join(d)).collect()
    }

    /// Absolute documentation snippet directories.
    pub fn yeadoc_dir_paths(&self) -> Vec<PathBuf> {
        self.yeadoc_dirs.iter().map(|d| self.root.join(d)).collect()
    }

    /// Absolute JUnit output path, if configured.
    pub fn results_path(&self) -> Option<PathBuf> {
        self.results_file.as_ref().map(|f| self.root.join(f))
    }

    /// Absolute coverage template path, if configured.
    ///
    /// Fails if the template is configured but missing on disk.
    pub fn coverage_template_path(&self) -> ConfigResult<Option<PathBuf>> {
        let Some(template) = &self.coverage_template else {
            return Ok(None);
        };
        let path = self.root.join(template);
        if !path.is_file() {
            return Err(ConfigError::MissingCoverageTemplate(path));
        }
        Ok(Some(path))
    }

    /// The coverage source, preferring the configured environment variable
    /// when it is set and non-empty.
    pub fn effective_coverage_source(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<String> {
        self.coverage_source_env
            .as_deref()
            .and_then(lookup)
            .filter(|s| !s.is_empty())
            .or_else(|| self.coverage_source.clone())
    }

    /// Test name: the path relative to the root.
    pub fn display_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

/// Per-invocation switches.
#[derive(Debug, Clone)]
pub struct Options {
    /// Only tests whose `tag.suite` matches.
    pub suite: Option<String>,

    /// Only tests whose `tag.shard`/`tag.shards` contain this shard.
    pub shard: Option<String>,

    /// Platform to select for; also replaces the detected platform.
    pub platform: Option<String>,

    /// Turn discovery warnings into fatal errors.
    pub strict: bool,

    /// Ignore every skip rule.
    pub noskip: bool,

    /// Go through the run bookkeeping without executing anything.
    pub dryrun: bool,

    /// Run the tests but skip their checks; nothing is reported as failed.
    pub live: bool,

    /// Include documentation-embedded tests.
    pub yeadoc: bool,

    /// Walk every configured test directory, ignoring explicit paths.
    pub all: bool,

    /// Number of shards, with `group` (1-based) selecting ours.
    pub splits: Option<usize>,

    /// Which shard this invocation runs.
    pub group: Option<usize>,

    /// Merge this run's durations into the history file.
    pub store_durations: bool,

    /// Forwarded to plugin checks.
    pub debug: bool,

    /// How long a child gets to exit after each termination signal.
    pub kill_grace: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            suite: None,
            shard: None,
            platform: None,
            strict: false,
            noskip: false,
            dryrun: false,
            live: false,
            yeadoc: false,
            all: false,
            splits: None,
            group: None,
            store_durations: false,
            debug: false,
            kill_grace: Duration::from_secs(30),
        }
    }
}

impl Options {
    /// Returns the requested `(splits, group)` pair, validated.
    pub fn shard_selection(&self) -> ConfigResult<Option<(usize, usize)>> {
        match (self.splits, self.group) {
            (None, None) => Ok(None),
            (Some(splits), Some(group)) => {
                if splits == 0 {
                    return Err(ConfigError::InvalidOption(
                        "--splits must be at least 1".to_string(),
                    ));
                }
                if group == 0 || group > splits {
                    return Err(ConfigError::InvalidOption(format!(
                        "--group must be between 1 and {splits}, got {group}"
                    )));
                }
                Ok(Some((splits, group)))
            }
            _ => Err(ConfigError::InvalidOption(
                "--splits and --group must be given together".to_string(),
            )),
        }
    }

    /// The platform used for skip decisions.
    pub fn current_platform(&self) -> String {
        self.platform.clone().unwrap_or_else(detected_platform)
    }
}

/// Name of the running platform, spelled the way test specs spell it.
pub fn detected_platform() -> String {
    match std::env::consts::OS {
        "macos" => "darwin".to_string(),
        "windows" => "win32".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_yearc(dir: &Path, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(YEARC_FILE_NAME), content).unwrap();
    }

    #[test]
    fn test_resolve_prefers_declared_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("proj");
        let inner = root.join("tests").join("unit");
        write_yearc(&root, "[yea]\nroot = true\ntest_paths = [\"tests\"]\n");
        write_yearc(&inner, "[yea]\nyeadoc = true\n");

        let cfg = HarnessConfig::resolve(&inner).unwrap();
        assert_eq!(cfg.root, root);
        assert_eq!(cfg.test_dirs, vec!["tests"]);
    }

    #[test]
    fn test_resolve_falls_back_to_nearest() {
        let tmp = TempDir::new().unwrap();
        let outer = tmp.path().join("a");
        let inner = outer.join("b");
        write_yearc(&outer, "[yea]\n");
        write_yearc(&inner, "[yea]\ntest_paths = [\"x\"]\n");
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();

        // The start directory need not exist.
        let cfg = HarnessConfig::resolve(&inner.join("c").join("d")).unwrap();
        assert_eq!(cfg.root, inner);
        assert_eq!(cfg.test_dirs, vec!["x"]);
    }

    #[test]
    fn test_resolve_checks_git_level_then_stops() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        let sub = repo.join("sub");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::create_dir_all(&sub).unwrap();
        write_yearc(&repo, "[yea]\nresults_file = \"out.xml\"\n");
        write_yearc(tmp.path(), "[yea]\nroot = true\n");

        let cfg = HarnessConfig::resolve(&sub).unwrap();
        assert_eq!(cfg.root, repo);
        assert_eq!(cfg.results_path(), Some(repo.join("out.xml")));
    }

    #[test]
    fn test_resolve_without_any_yearc() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();

        let cfg = HarnessConfig::resolve(tmp.path()).unwrap();
        assert_eq!(cfg.root, tmp.path());
        assert_eq!(cfg.test_dirs, vec!["."]);
        assert_eq!(cfg.coverage_command, vec!["coverage", "run"]);
        assert_eq!(cfg.python, "python");
    }

    #[test]
    fn test_resolve_malformed_is_fatal() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        write_yearc(tmp.path(), "[yea\n");

        let err = HarnessConfig::resolve(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_coverage_source_env_override() {
        let mut cfg = HarnessConfig::implicit("/r");
        cfg.coverage_source = Some("src/pkg".to_string());
        cfg.coverage_source_env = Some("PKG_COV".to_string());

        let from_env = cfg.effective_coverage_source(|_| Some("/site/pkg".to_string()));
        assert_eq!(from_env.as_deref(), Some("/site/pkg"));

        let unset = cfg.effective_coverage_source(|_| None);
        assert_eq!(unset.as_deref(), Some("src/pkg"));

        let empty = cfg.effective_coverage_source(|_| Some(String::new()));
        assert_eq!(empty.as_deref(), Some("src/pkg"));
    }

    #[test]
    fn test_missing_coverage_template() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = HarnessConfig::implicit(tmp.path());
        cfg.coverage_template = Some(".coveragerc".to_string());
        assert!(matches!(
            cfg.coverage_template_path(),
            Err(ConfigError::MissingCoverageTemplate(_))
        ));

        std::fs::write(tmp.path().join(".coveragerc"), "[run]\n").unwrap();
        assert!(cfg.coverage_template_path().unwrap().is_some());
    }

    #[test]
    fn test_shard_selection() {
        let mut opts = Options::default();
        assert_eq!(opts.shard_selection().unwrap(), None);

        opts.splits = Some(3);
        assert!(opts.shard_selection().is_err());

        opts.group = Some(3);
        assert_eq!(opts.shard_selection().unwrap(), Some((3, 3)));

        opts.group = Some(4);
        assert!(opts.shard_selection().is_err());

        opts.group = Some(0);
        assert!(opts.shard_selection().is_err());
    }

    #[test]
    fn test_display_name_relative_to_root() {
        let cfg = HarnessConfig::implicit("/r");
        assert_eq!(cfg.display_name(Path::new("/r/a/t1_x.py")), "a/t1_x.py");
        assert_eq!(cfg.display_name(Path::new("/elsewhere/t.py")), "/elsewhere/t.py");
    }
}
