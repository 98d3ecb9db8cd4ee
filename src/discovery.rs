//! Test discovery.
//!
//! Discovery turns directories and path arguments into the sorted list of
//! tests one invocation runs:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Discoverer                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  paths / --all ──► walk (.yea, .py) ──► inspect ──► skip filters │
//! │                                            │                     │
//! │             .yearc overrides ◄─────────────┤                     │
//! │             snippet index    ◄─────────────┘                     │
//! │                                                                  │
//! │  expand permutations ──► compute ids ──► duplicate check ──► sort│
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Candidates
//!
//! | file | becomes a test when | tracked as |
//! |------|---------------------|------------|
//! | `x.py` | its docstring (or a sibling `x.yea`) holds a spec | `x.py` |
//! | `x.yea` | `x.py` exists | `x.py` |
//! | `x.yea` with `command.program` | the program exists | `x.yea` |
//! | `x.yea` in a `yeadoc` subtree | the snippet named by its `id` exists | `x.yea` |
//!
//! Problems with individual candidates are warnings. Under `--strict` the
//! first warning aborts discovery with [`DiscoveryError::Strict`].

pub mod yeadoc;

pub use yeadoc::{Snippet, SnippetIndex};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::config::{
    ConfigError, DirectoryConfigCache, FsOverrideSource, HarnessConfig, Options, OverrideSource,
};
use crate::identity::{self, NaturalKey};
use crate::parametrize::{self, Permutation};
use crate::spec::{self, CandidateKind, SOURCE_EXTENSION, SpecError, TestSpec};

/// Directories never descended into.
pub const IGNORED_DIRS: &[&str] = &[".git", ".tox", "wandb", "__pycache__", ".yea_cache"];

pub(crate) fn is_ignored_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that end discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    /// A warning raised under `--strict`.
    #[error("{0}")]
    Strict(String),
}

/// One runnable test.
#[derive(Debug, Clone)]
pub struct ResolvedTest {
    /// The file the test is tracked by.
    pub path: PathBuf,
    /// The script to execute.
    pub program: PathBuf,
    pub spec: TestSpec,
    /// Set for each expansion of a parametrized test.
    pub permutation: Option<Permutation>,
    /// Code of a documentation-embedded test.
    pub snippet: Option<Snippet>,
    /// Canonical id, assigned after expansion.
    pub id: String,
    /// Path relative to the root.
    pub name: String,
}

impl ResolvedTest {
    pub fn new(path: PathBuf, program: PathBuf, spec: TestSpec) -> Self {
        let name = path.to_string_lossy().into_owned();
        Self {
            path,
            program,
            spec,
            permutation: None,
            snippet: None,
            id: String::new(),
            name,
        }
    }

    /// Directory the test's dependency and run phases execute in.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// File stem of the tracked path.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_yeadoc(&self) -> bool {
        self.snippet.is_some()
    }

    /// Listing and execution order key.
    pub fn sort_key(&self) -> NaturalKey {
        identity::sort_key(self.spec.raw_id(), &self.id)
    }
}

/// Sorts tests into listing and execution order.
pub fn sort_tests(tests: &mut [ResolvedTest]) {
    tests.sort_by_cached_key(ResolvedTest::sort_key);
}

/// Returns `true` if the test's tags exclude it from this invocation.
pub fn is_skipped(spec: &TestSpec, options: &Options, platform: &str) -> bool {
    let tag = &spec.tag;
    if tag.skip {
        return true;
    }
    if tag
        .skips
        .iter()
        .any(|s| s.platform.as_deref().is_none_or(|p| p == platform))
    {
        return true;
    }
    if let Some(suite) = &options.suite
        && *suite != tag.suite
    {
        return true;
    }
    if let Some(shard) = &options.shard
        && *shard != tag.shard
        && !tag.shards.contains(shard)
    {
        return true;
    }
    let listed = tag.platforms.iter().any(|p| p == platform);
    if !tag.platforms.is_empty() && !listed {
        return true;
    }
    // An explicit --platform only selects tests that name it.
    options.platform.is_some() && !listed
}

/// An inspected candidate, before skip filtering.
#[derive(Debug)]
struct Candidate {
    program: PathBuf,
    spec: TestSpec,
    snippet: Option<Snippet>,
}

/// Walks test directories and builds the test list.
pub struct Discoverer<'a, S = FsOverrideSource> {
    config: &'a HarnessConfig,
    options: &'a Options,
    working_dir: PathBuf,
    overrides: DirectoryConfigCache<S>,
    snippets: SnippetIndex,
    claimed: BTreeSet<String>,
    found: BTreeMap<PathBuf, Candidate>,
    warnings: Vec<String>,
}

impl<'a> Discoverer<'a, FsOverrideSource> {
    /// Creates a discoverer reading `.yearc` overrides from disk.
    pub fn new(config: &'a HarnessConfig, options: &'a Options) -> Self {
        Self::with_overrides(config, options, DirectoryConfigCache::new(&config.root))
    }
}

impl<'a, S: OverrideSource> Discoverer<'a, S> {
    /// Creates a discoverer using the given override cache.
    pub fn with_overrides(
        config: &'a HarnessConfig,
        options: &'a Options,
        overrides: DirectoryConfigCache<S>,
    ) -> Self {
        Self {
            config,
            options,
            working_dir: config.root.clone(),
            overrides,
            snippets: SnippetIndex::default(),
            claimed: BTreeSet::new(),
            found: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Sets the directory relative path arguments are resolved against, and
    /// walked when there are none.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Warnings emitted so far.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Discovers, expands, identifies and sorts the tests selected by
    /// `paths` and the options.
    pub fn collect(&mut self, paths: &[PathBuf]) -> DiscoveryResult<Vec<ResolvedTest>> {
        let discovered = self.discover(paths)?;

        let mut tests = Vec::with_capacity(discovered.len());
        for test in discovered {
            tests.extend(parametrize::expand(test)?);
        }

        for test in &mut tests {
            let tag = test.permutation.as_ref().map(Permutation::tag);
            test.id = identity::compute_id(
                &test.path,
                &test.spec,
                tag.as_deref(),
                &mut self.overrides,
            )?;
        }

        self.check_duplicate_ids(&tests)?;
        sort_tests(&mut tests);
        tracing::info!("Collected {} tests", tests.len());
        Ok(tests)
    }

    /// Finds the tests selected by `paths` and the options, skip filters
    /// applied, parametrized tests not yet expanded.
    pub fn discover(&mut self, paths: &[PathBuf]) -> DiscoveryResult<Vec<ResolvedTest>> {
        self.found.clear();
        self.claimed.clear();

        if self.options.yeadoc {
            self.index_snippets()?;
        }

        for dir in self.scope(paths)? {
            self.walk(&dir)?;
        }

        if self.options.yeadoc && self.options.all {
            self.check_unclaimed_snippets()?;
        }

        let platform = self.options.current_platform();
        let mut tests = Vec::with_capacity(self.found.len());
        for (path, candidate) in std::mem::take(&mut self.found) {
            if !self.options.noskip && is_skipped(&candidate.spec, self.options, &platform) {
                tracing::debug!("Skipping {}", path.display());
                continue;
            }
            let mut test = ResolvedTest::new(path, candidate.program, candidate.spec);
            test.snippet = candidate.snippet;
            test.name = self.config.display_name(&test.path);
            tests.push(test);
        }
        Ok(tests)
    }

    /// Reports a candidate problem. Fatal under `--strict`.
    fn warn(&mut self, msg: impl Into<String>, path: Option<&Path>) -> DiscoveryResult<()> {
        let mut msg = msg.into();
        if let Some(path) = path {
            msg = format!("{msg} (test: {})", path.display());
        }
        tracing::warn!("{}", msg);
        let level = if self.options.strict { "ERROR" } else { "WARNING" };
        eprintln!("{level}: {msg}");
        if self.options.strict {
            return Err(DiscoveryError::Strict(msg));
        }
        self.warnings.push(msg);
        Ok(())
    }

    /// Directories to walk. Explicit file arguments are inspected directly.
    fn scope(&mut self, paths: &[PathBuf]) -> DiscoveryResult<Vec<PathBuf>> {
        if self.options.all {
            if !paths.is_empty() {
                self.warn("Ignoring test args when using --all", None)?;
            }
            return Ok(self.config.test_dir_paths());
        }
        if paths.is_empty() {
            return Ok(vec![self.working_dir.clone()]);
        }

        let mut dirs = Vec::new();
        for arg in paths {
            let joined = self.working_dir.join(arg);
            let path = joined.canonicalize().unwrap_or(joined);
            if path.is_dir() {
                dirs.push(path);
            } else if path.is_file() {
                self.inspect_file(&path)?;
            } else {
                self.warn("Can not find file", Some(&path))?;
            }
        }
        Ok(dirs)
    }

    fn walk(&mut self, dir: &Path) -> DiscoveryResult<()> {
        tracing::debug!("Walking {}", dir.display());
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_ignored_dir(e));
        for entry in walker {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file() && CandidateKind::of(entry.path()).is_some() {
                        self.inspect_file(entry.path())?;
                    }
                }
                Err(e) => self.warn(format!("Unable to walk: {e}"), Some(dir))?,
            }
        }
        Ok(())
    }

    fn inspect_file(&mut self, path: &Path) -> DiscoveryResult<()> {
        match CandidateKind::of(path) {
            Some(CandidateKind::SpecFile) => self.inspect_spec_file(path),
            Some(CandidateKind::SourceFile) => self.inspect_source_file(path),
            None => self.warn("Ignoring file", Some(path)),
        }
    }

    fn inspect_source_file(&mut self, path: &Path) -> DiscoveryResult<()> {
        match spec::load(path) {
            Ok(Some(spec)) => {
                self.track(
                    path.to_path_buf(),
                    Candidate {
                        program: path.to_path_buf(),
                        spec,
                        snippet: None,
                    },
                );
                Ok(())
            }
            Ok(None) => {
                tracing::trace!("No spec in {}", path.display());
                Ok(())
            }
            Err(e) => self.unreadable(e, path),
        }
    }

    fn inspect_spec_file(&mut self, path: &Path) -> DiscoveryResult<()> {
        let spec = match spec::load_spec_file(path) {
            Ok(Some(spec)) => spec,
            Ok(None) => return self.warn("Can not parse file", Some(path)),
            Err(e) => return self.unreadable(e, path),
        };

        let yeadoc = self.overrides.yeadoc_enabled(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let (tracked, program) = match &spec.command.program {
            Some(program) => (path.to_path_buf(), dir.join(program)),
            None => {
                let script = path.with_extension(SOURCE_EXTENSION);
                if yeadoc {
                    (path.to_path_buf(), script)
                } else {
                    (script.clone(), script)
                }
            }
        };

        if yeadoc && !self.options.yeadoc {
            tracing::warn!(
                "Skipping yeadoc test because not enabled: {}",
                tracked.display()
            );
            return Ok(());
        }

        let snippet = if yeadoc {
            let Some(id) = spec.id.clone().filter(|id| !id.is_empty()) else {
                return self.warn("Documentation test declares no id", Some(path));
            };
            self.claimed.insert(id.clone());
            match self.snippets.get(&id) {
                Some(snippet) => Some(snippet.clone()),
                None => {
                    return self.warn(format!("Can not find code referencing: {id}"), Some(path));
                }
            }
        } else {
            if !program.is_file() {
                return self.warn(
                    format!("Can not find file: {}", program.display()),
                    Some(path),
                );
            }
            None
        };

        self.track(
            tracked,
            Candidate {
                program,
                spec,
                snippet,
            },
        );
        Ok(())
    }

    /// Unreadable or unparsable files are warnings. Schema violations and
    /// other spec errors are fatal.
    fn unreadable(&mut self, err: SpecError, path: &Path) -> DiscoveryResult<()> {
        match err {
            SpecError::Read { source, .. } => {
                self.warn(format!("Can not read file: {source}"), Some(path))
            }
            SpecError::Yaml { source, .. } => {
                self.warn(format!("Can not parse file: {source}"), Some(path))
            }
            other => Err(other.into()),
        }
    }

    fn track(&mut self, tracked: PathBuf, candidate: Candidate) {
        tracing::debug!("Found test {}", tracked.display());
        self.found.entry(tracked).or_insert(candidate);
    }

    fn index_snippets(&mut self) -> DiscoveryResult<()> {
        let (index, problems) = SnippetIndex::build(&self.config.yeadoc_dir_paths());
        self.snippets = index;
        for (msg, path) in problems {
            self.warn(msg, Some(&path))?;
        }
        Ok(())
    }

    fn check_unclaimed_snippets(&mut self) -> DiscoveryResult<()> {
        let unclaimed: Vec<String> = self
            .snippets
            .ids()
            .filter(|id| !self.claimed.contains(*id))
            .map(str::to_string)
            .collect();
        for id in unclaimed {
            self.warn(format!("Can not find yeadoc test for {id}"), None)?;
        }
        Ok(())
    }

    fn check_duplicate_ids(&mut self, tests: &[ResolvedTest]) -> DiscoveryResult<()> {
        let mut seen: HashMap<&str, &Path> = HashMap::new();
        let mut duplicates = Vec::new();
        for test in tests {
            if let Some(first) = seen.insert(&test.id, &test.path) {
                duplicates.push((
                    format!("Duplicate test id {} (also {})", test.id, first.display()),
                    test.path.clone(),
                ));
            }
        }
        for (msg, path) in duplicates {
            self.warn(msg, Some(&path))?;
        }
        Ok(())
    }
}
