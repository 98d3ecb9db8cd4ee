//! Test specifications.
//!
//! A spec is YAML, either in a sidecar `.yea` file or in the docstring of a
//! `.py` test script. Loading goes through three stages:
//!
//! ```text
//! text ──serde_yaml──► serde_json::Value ──jsonschema──► (valid) ──serde──► TestSpec
//!                        stage 1                 stage 2                  stage 3
//! ```
//!
//! Stage 2 reports every violated constraint at once. Stage 3 fills the
//! defaults declared on the typed structures (`tag.suite = "main"`,
//! `tag.shard = "default"`, `command.timeout = 300`).

pub mod docstring;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Extension of sidecar spec files.
pub const SPEC_EXTENSION: &str = "yea";

/// Extension of test scripts.
pub const SOURCE_EXTENSION: &str = "py";

/// Default per-test timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

const TESTSPEC_SCHEMA_BYTES: &[u8] = include_bytes!("spec/testspec.schema.json");

/// Result type for spec operations.
pub type SpecResult<T> = Result<T, SpecError>;

/// Errors raised while loading a spec.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse spec in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Spec in {path} violates schema:\n{}", format_violations(.violations))]
    Schema {
        path: PathBuf,
        violations: Vec<String>,
    },

    #[error("Spec in {path} could not be materialized: {source}")]
    Materialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid parametrize entry in {path}: {reason}")]
    Permute { path: PathBuf, reason: String },

    #[error("Failed to build spec schema validator: {0}")]
    SchemaBuild(String),
}

fn format_violations(violations: &[String]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Kind of a discovery candidate, from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    /// A sidecar `.yea` spec file.
    SpecFile,
    /// A `.py` test script.
    SourceFile,
}

impl CandidateKind {
    /// Classifies a path by extension.
    pub fn of(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(SPEC_EXTENSION) => Some(Self::SpecFile),
            Some(SOURCE_EXTENSION) => Some(Self::SourceFile),
            _ => None,
        }
    }
}

/// Normalized configuration of one test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSpec {
    /// Declared id. Numeric ids are read as strings.
    pub id: Option<String>,
    pub tag: TagSpec,
    pub command: CommandSpec,
    /// Environment overlays, applied in order.
    pub env: Vec<BTreeMap<String, Value>>,
    pub depend: DependSpec,
    pub parametrize: Option<ParametrizeSpec>,
    /// Plugins this test needs.
    pub plugin: Vec<String>,
    /// Plugin variables, keyed `:plugin:name`.
    pub var: Vec<BTreeMap<String, Value>>,
    pub profile: Vec<NamedEntry>,
    pub trigger: Vec<NamedEntry>,
    /// Top-level keys not recognized here, kept for plugins.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Selection tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagSpec {
    pub skip: bool,
    pub skips: Vec<SkipEntry>,
    pub suite: String,
    pub shard: String,
    pub shards: Vec<String>,
    pub platforms: Vec<String>,
}

impl Default for TagSpec {
    fn default() -> Self {
        Self {
            skip: false,
            skips: Vec::new(),
            suite: "main".to_string(),
            shard: "default".to_string(),
            shards: Vec::new(),
            platforms: Vec::new(),
        }
    }
}

/// One `tag.skips` entry. Without a platform it skips everywhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipEntry {
    pub platform: Option<String>,
}

/// How the test program is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSpec {
    /// Program path relative to the spec's directory.
    pub program: Option<String>,
    pub mode: CommandMode,
    pub args: Vec<String>,
    /// Seconds before the test is killed.
    pub timeout: u64,
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self {
            program: None,
            mode: CommandMode::Default,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// `./program.py` or `python -m program`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMode {
    #[default]
    Default,
    Module,
}

/// Setup performed before the test runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependSpec {
    pub files: Vec<FileDependency>,
    pub requirements: Vec<String>,
    pub pip_install_options: Vec<String>,
    pub pip_install_timeout: Option<u64>,
    pub uninstall: Vec<String>,
    pub pip_uninstall_timeout: Option<u64>,
}

impl DependSpec {
    /// Returns `true` if there is nothing to set up.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.requirements.is_empty()
            && self.pip_install_options.is_empty()
            && self.uninstall.is_empty()
    }
}

/// A file fetched into the test directory before the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDependency {
    /// Destination, relative to the test directory.
    pub file: String,
    /// URL to fetch.
    pub source: String,
}

/// The `parametrize` section. Entries are checked on expansion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParametrizeSpec {
    pub permute: Vec<Value>,
}

/// A `profile`/`trigger` entry: a bare name or a single-key mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NamedEntry {
    Name(String),
    WithValue(BTreeMap<String, Value>),
}

impl NamedEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::WithValue(map) => map.keys().next().map(String::as_str).unwrap_or(""),
        }
    }

    /// The entry's value; `{}` for a bare name.
    pub fn value(&self) -> Value {
        match self {
            Self::Name(_) => Value::Object(Map::new()),
            Self::WithValue(map) => map
                .values()
                .next()
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
        }
    }
}

impl TestSpec {
    /// The declared id, unless it is a legacy dotted id.
    pub fn leaf_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty() && !id.contains('.'))
    }

    /// The declared id as written, for sorting.
    pub fn raw_id(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }
}

/// Renders a scalar spec value for the environment.
pub fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn validator() -> SpecResult<&'static jsonschema::Validator> {
    static VALIDATOR: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();
    VALIDATOR
        .get_or_init(|| {
            let schema: Value =
                serde_json::from_slice(TESTSPEC_SCHEMA_BYTES).map_err(|e| e.to_string())?;
            jsonschema::options()
                .with_draft(Draft::Draft7)
                .build(&schema)
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| SpecError::SchemaBuild(e.clone()))
}

/// Parses YAML text into a validated spec.
///
/// A document that is not a mapping (empty, or plain prose after a `---`
/// underline) is no spec: `Ok(None)`. `path` is only used in errors.
pub fn parse_spec(text: &str, path: &Path) -> SpecResult<Option<TestSpec>> {
    let raw: Value = serde_yaml::from_str(text).map_err(|source| SpecError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    if !raw.is_object() {
        tracing::trace!("No spec mapping in {}", path.display());
        return Ok(None);
    }
    materialize(raw, path).map(Some)
}

/// Validates a raw mapping and converts it to a [`TestSpec`].
pub fn materialize(mut raw: Value, path: &Path) -> SpecResult<TestSpec> {
    let violations: Vec<String> = validator()?
        .iter_errors(&raw)
        .map(|e| {
            let at = e.instance_path().to_string();
            if at.is_empty() {
                e.to_string()
            } else {
                format!("{e} at {at}")
            }
        })
        .collect();
    if !violations.is_empty() {
        return Err(SpecError::Schema {
            path: path.to_path_buf(),
            violations,
        });
    }

    if let Some(id @ Value::Number(_)) = raw.get_mut("id") {
        *id = Value::String(id.to_string());
    }

    serde_json::from_value(raw).map_err(|source| SpecError::Materialize {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the spec of a sidecar `.yea` file.
///
/// The YAML is the text after a `---` line, or the whole file without one.
pub fn load_spec_file(path: &Path) -> SpecResult<Option<TestSpec>> {
    let text = read(path)?;
    let yaml = docstring::yaml_section(&text).unwrap_or(text);
    parse_spec(&yaml, path)
}

/// Loads the spec embedded in a test script's docstring.
///
/// Scripts without a docstring spec are not tests: `Ok(None)`.
pub fn load_docstring_spec(path: &Path) -> SpecResult<Option<TestSpec>> {
    let text = read(path)?;
    let Some(yaml) = docstring::module_docstring(&text)
        .as_deref()
        .and_then(docstring::yaml_section)
    else {
        return Ok(None);
    };
    parse_spec(&yaml, path)
}

/// Loads the spec governing a candidate.
///
/// For a script, a sibling `.yea` file takes priority over its docstring.
pub fn load(path: &Path) -> SpecResult<Option<TestSpec>> {
    match CandidateKind::of(path) {
        Some(CandidateKind::SpecFile) => load_spec_file(path),
        Some(CandidateKind::SourceFile) => {
            let sidecar = path.with_extension(SPEC_EXTENSION);
            if sidecar.is_file()
                && let Some(spec) = load_spec_file(&sidecar)?
            {
                return Ok(Some(spec));
            }
            load_docstring_spec(path)
        }
        None => Ok(None),
    }
}

fn read(path: &Path) -> SpecResult<String> {
    std::fs::read_to_string(path).map_err(|source| SpecError::Read {
        path: path.to_path_buf(),
        source,
    })
}
