//! Per-directory override lookup with caching.
//!
//! Discovery and id computation both need the `.yearc` files of every
//! directory between a test and the hierarchy root. [`DirectoryConfigCache`]
//! walks that path iteratively and caches each directory's result, including
//! the "no override here" result, so a directory is read at most once per
//! discovery pass.
//!
//! The filesystem access sits behind [`OverrideSource`] so that the walk can
//! be exercised against an in-memory hierarchy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::schema::{DirectoryOverride, YEARC_FILE_NAME};
use super::{ConfigResult, read_yearc};

/// Loads the override declared by a single directory, if any.
pub trait OverrideSource {
    /// Returns the directory's override, or `None` if it declares none.
    fn load(&self, dir: &Path) -> ConfigResult<Option<DirectoryOverride>>;
}

/// Reads `<dir>/.yearc` from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsOverrideSource;

impl OverrideSource for FsOverrideSource {
    fn load(&self, dir: &Path) -> ConfigResult<Option<DirectoryOverride>> {
        let path = dir.join(YEARC_FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        read_yearc(&path).map(|file| Some(file.yea))
    }
}

impl OverrideSource for HashMap<PathBuf, DirectoryOverride> {
    fn load(&self, dir: &Path) -> ConfigResult<Option<DirectoryOverride>> {
        Ok(self.get(dir).cloned())
    }
}

/// One ancestor directory together with its override.
#[derive(Debug, Clone)]
pub struct AncestorOverride {
    /// The directory that declared the override.
    pub dir: PathBuf,
    /// The declared settings.
    pub config: DirectoryOverride,
}

/// Cache of per-directory overrides below a hierarchy root.
pub struct DirectoryConfigCache<S = FsOverrideSource> {
    root: PathBuf,
    source: S,
    entries: HashMap<PathBuf, Option<DirectoryOverride>>,
}

impl DirectoryConfigCache<FsOverrideSource> {
    /// Creates a cache reading `.yearc` files from disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_source(root, FsOverrideSource)
    }
}

impl<S: OverrideSource> DirectoryConfigCache<S> {
    /// Creates a cache backed by the given source.
    pub fn with_source(root: impl Into<PathBuf>, source: S) -> Self {
        Self {
            root: root.into(),
            source,
            entries: HashMap::new(),
        }
    }

    /// The hierarchy root this cache stops at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the override of a single directory, loading it on first use.
    pub fn get(&mut self, dir: &Path) -> ConfigResult<Option<&DirectoryOverride>> {
        if !self.entries.contains_key(dir) {
            let loaded = self.source.load(dir)?;
            tracing::trace!(
                "Loaded override for {}: {}",
                dir.display(),
                if loaded.is_some() { "present" } else { "none" }
            );
            self.entries.insert(dir.to_path_buf(), loaded);
        }
        Ok(self.entries.get(dir).and_then(Option::as_ref))
    }

    /// Returns the overrides of every directory strictly between `test_path`
    /// and the root, nearest first.
    ///
    /// Directories without a `.yearc` are skipped. If `test_path` does not
    /// live under the root, the walk continues to the filesystem root.
    pub fn overrides_above(&mut self, test_path: &Path) -> ConfigResult<Vec<AncestorOverride>> {
        let mut found = Vec::new();
        for dir in self.ancestors_below_root(test_path) {
            if let Some(config) = self.get(&dir)? {
                found.push(AncestorOverride {
                    dir,
                    config: config.clone(),
                });
            }
        }
        Ok(found)
    }

    /// Returns whether documentation-embedded tests are enabled for the
    /// subtree containing `test_path`.
    ///
    /// The nearest directory that declares `yeadoc` decides.
    pub fn yeadoc_enabled(&mut self, test_path: &Path) -> ConfigResult<bool> {
        let overrides = self.overrides_above(test_path)?;
        Ok(overrides
            .iter()
            .find_map(|o| o.config.yeadoc)
            .unwrap_or(false))
    }

    /// Ancestor directories of `test_path`, nearest first, stopping before
    /// the root.
    pub fn ancestors_below_root(&self, test_path: &Path) -> Vec<PathBuf> {
        test_path
            .ancestors()
            .skip(1)
            .take_while(|dir| *dir != self.root && !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect()
    }
}
