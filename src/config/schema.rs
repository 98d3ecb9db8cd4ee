//! Schema of `.yearc` files.
//!
//! Every directory in a test hierarchy may carry a `.yearc` file. The file is
//! TOML with a single `[yea]` table. The same table type serves two roles:
//!
//! - at the hierarchy root it carries harness-wide settings (test paths,
//!   coverage, report location);
//! - anywhere below the root it carries per-directory overrides (`yeadoc`,
//!   `base`, `id`).
//!
//! ```text
//! .yearc
//! └── [yea]
//!     ├── root / yeadoc / base     - directory flags
//!     ├── id                       - explicit directory id
//!     ├── test_paths / yeadoc_paths
//!     ├── coverage_*               - per-test instrumentation
//!     └── results_file             - JUnit XML output
//! ```
//!
//! # Example
//!
//! ```toml
//! [yea]
//! root = true
//! test_paths = ["tests/functional"]
//! coverage_config_template = ".coveragerc"
//! coverage_source = "src/mypkg"
//! coverage_source_env = "MYPKG_COV_SOURCE"
//! results_file = "test-results/junit-yea.xml"
//! ```

use serde::{Deserialize, Serialize};

/// File name of a directory override / root configuration file.
pub const YEARC_FILE_NAME: &str = ".yearc";

/// Whole contents of a `.yearc` file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct YearcFile {
    /// The `[yea]` table. A file without it carries no settings.
    #[serde(default)]
    pub yea: DirectoryOverride,
}

/// Settings declared by one directory's `.yearc`.
///
/// All fields are optional: a missing key means "not declared here", which
/// lets nearer directories override farther ones key by key.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryOverride {
    /// Marks the hierarchy root.
    pub root: Option<bool>,

    /// Enables documentation-embedded tests for this subtree.
    pub yeadoc: Option<bool>,

    /// Stops upward id composition at this directory (inclusive).
    pub base: Option<bool>,

    /// Explicit id for this directory, used when its name carries none.
    pub id: Option<String>,

    /// Test directories, relative to the root.
    pub test_paths: Option<Vec<String>>,

    /// Directories scanned for documentation snippets, relative to the root.
    pub yeadoc_paths: Option<Vec<String>>,

    /// Coverage rc template, relative to the root.
    pub coverage_config_template: Option<String>,

    /// Value written to `[run] source` of the per-test coverage rc.
    pub coverage_source: Option<String>,

    /// Environment variable that, when set, replaces `coverage_source`.
    pub coverage_source_env: Option<String>,

    /// Instrumentation wrapper placed in front of every test program.
    ///
    /// Default: `["coverage", "run"]`. An empty list runs programs directly.
    pub coverage_command: Option<Vec<String>>,

    /// Interpreter used for pip and module-mode invocations.
    ///
    /// Default: `python`
    pub python: Option<String>,

    /// JUnit XML output path, relative to the root.
    pub results_file: Option<String>,
}

impl DirectoryOverride {
    /// Returns `true` if this file declares itself the hierarchy root.
    pub fn is_root(&self) -> bool {
        self.root.unwrap_or(false)
    }

    /// Returns `true` if this directory is an id-composition boundary.
    pub fn is_base(&self) -> bool {
        self.base.unwrap_or(false)
    }

    /// Returns the explicit directory id, ignoring empty strings.
    pub fn explicit_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_root_file() {
        let file: YearcFile = toml::from_str(
            r#"
            [yea]
            root = true
            test_paths = ["tests", "more/tests"]
            coverage_config_template = ".coveragerc"
            coverage_source = "src/yea"
            coverage_source_env = "YEACOV_SOURCE"
            results_file = "test-results/junit-yea.xml"
            "#,
        )
        .unwrap();

        assert!(file.yea.is_root());
        assert_eq!(
            file.yea.test_paths,
            Some(vec!["tests".to_string(), "more/tests".to_string()])
        );
        assert_eq!(file.yea.coverage_source_env.as_deref(), Some("YEACOV_SOURCE"));
        assert!(!file.yea.is_base());
    }

    #[test]
    fn test_empty_file_has_no_settings() {
        let file: YearcFile = toml::from_str("").unwrap();
        assert_eq!(file.yea, DirectoryOverride::default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = toml::from_str::<YearcFile>("[yea]\nbsae = true\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_id_is_not_explicit() {
        let ov = DirectoryOverride {
            id: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(ov.explicit_id(), None);
    }
}
