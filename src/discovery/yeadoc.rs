//! Documentation-embedded tests.
//!
//! A library documents an example in a docstring and labels the fenced block
//! with an id:
//!
//! ````text
//! <!--- yeadoc-test:log-table -->
//! ```python
//! import wandb
//! run = wandb.init()
//! ```
//! ````
//!
//! A `.yea` spec in a `yeadoc = true` subtree declares `id: log-table` and
//! runs that block. The snippet is written to the cache directory right
//! before the test runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use walkdir::WalkDir;

use super::is_ignored_dir;

const FENCE: &str = "```";

fn marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<!--[-\s]*yeadoc-test:(.*)-->").expect("static regex"))
}

/// A labeled code block.
#[derive(Debug, Clone, PartialEq)]
pub struct Snippet {
    pub id: String,
    pub code: String,
    /// Language after the opening fence, if any.
    pub syntax: Option<String>,
    /// File the snippet was found in.
    pub source: PathBuf,
    /// 1-based line of the opening fence.
    pub line: usize,
}

impl Snippet {
    /// Writes the snippet to `<dir>/<stem>.py` and returns that path.
    pub fn materialize(&self, dir: &Path, stem: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{stem}.py"));
        std::fs::write(&path, &self.code)?;
        tracing::debug!(
            "Materialized snippet {} from {}:{} to {}",
            self.id,
            self.source.display(),
            self.line,
            path.display()
        );
        Ok(path)
    }
}

/// Extracts every labeled fenced block from `text`.
///
/// Each line of a block loses up to as much leading whitespace as its
/// opening fence had. Fails on a fence that is never closed.
pub fn extract_snippets(text: &str, source: &Path) -> Result<Vec<Snippet>, String> {
    let mut out = Vec::new();
    let mut previous: Option<&str> = None;
    let mut lines = text.lines().enumerate();

    while let Some((idx, line)) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !line.trim_start().starts_with(FENCE) {
            previous = Some(trimmed);
            continue;
        }

        let indent = line.len() - line.trim_start().len();
        let syntax = Some(trimmed[FENCE.len()..].trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let mut code = String::new();
        let mut closed = false;
        for (_, body) in lines.by_ref() {
            if body.trim_start().starts_with(FENCE) {
                closed = true;
                break;
            }
            let cut = indent.min(body.len() - body.trim_start().len());
            code.push_str(&body[cut..]);
            code.push('\n');
        }
        if !closed {
            return Err(format!(
                "code block opened on line {} is never closed",
                idx + 1
            ));
        }

        let label = previous
            .and_then(|p| marker().captures(p))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim_matches(|c| c == '-' || c == ' ').to_string());
        if let Some(id) = label.filter(|id| !id.is_empty()) {
            out.push(Snippet {
                id,
                code,
                syntax,
                source: source.to_path_buf(),
                line: idx + 1,
            });
        }
        previous = Some(FENCE);
    }
    Ok(out)
}

/// Snippets by id, gathered from the configured documentation directories.
#[derive(Debug, Clone, Default)]
pub struct SnippetIndex {
    snippets: BTreeMap<String, Snippet>,
}

impl SnippetIndex {
    /// Scans every `.py` file below `dirs`.
    ///
    /// Files that cannot be read or contain a broken block are returned as
    /// `(message, path)` problems; the rest of the index is still built.
    pub fn build(dirs: &[PathBuf]) -> (Self, Vec<(String, PathBuf)>) {
        let mut index = Self::default();
        let mut problems = Vec::new();

        for dir in dirs {
            let walker = WalkDir::new(dir)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !is_ignored_dir(e));
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        problems.push((format!("Unable to walk: {e}"), dir.clone()));
                        continue;
                    }
                };
                let path = entry.path();
                if !entry.file_type().is_file()
                    || path.extension().and_then(|e| e.to_str()) != Some("py")
                {
                    continue;
                }
                let text = match std::fs::read_to_string(path) {
                    Ok(text) => text,
                    Err(e) => {
                        problems.push((format!("Unable to read: {e}"), path.to_path_buf()));
                        continue;
                    }
                };
                match extract_snippets(&text, path) {
                    Ok(found) => {
                        for snippet in found {
                            index.snippets.insert(snippet.id.clone(), snippet);
                        }
                    }
                    Err(e) => problems.push((
                        format!("Unable to parse yeadoc docstr: {e}"),
                        path.to_path_buf(),
                    )),
                }
            }
        }

        tracing::debug!("Indexed {} documentation snippets", index.snippets.len());
        (index, problems)
    }

    pub fn get(&self, id: &str) -> Option<&Snippet> {
        self.snippets.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.snippets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DOC: &str = r#"
def log_table():
    """Logs a table.

    <!--- yeadoc-test:log-table -->
    ```python
    import wandb
    if True:
        wandb.log({})
    ```

    ```python
    unlabeled = True
    ```
    """
"#;

    #[test]
    fn test_extracts_labeled_block_only() {
        let snippets = extract_snippets(DOC, Path::new("lib.py")).unwrap();
        assert_eq!(snippets.len(), 1);
        let s = &snippets[0];
        assert_eq!(s.id, "log-table");
        assert_eq!(s.syntax.as_deref(), Some("python"));
        assert_eq!(s.code, "import wandb\nif True:\n    wandb.log({})\n");
        assert_eq!(s.line, 6);
    }

    #[test]
    fn test_unterminated_block() {
        let text = "<!-- yeadoc-test: x -->\n```\nprint(1)\n";
        assert!(extract_snippets(text, Path::new("a.py")).is_err());
    }

    #[test]
    fn test_index_walks_and_skips_ignored() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(docs.join("nested")).unwrap();
        std::fs::create_dir_all(docs.join(".tox")).unwrap();
        std::fs::write(docs.join("nested").join("lib.py"), DOC).unwrap();
        std::fs::write(
            docs.join(".tox").join("copy.py"),
            "<!-- yeadoc-test: hidden -->\n```\nx\n```\n",
        )
        .unwrap();
        std::fs::write(docs.join("broken.py"), "<!-- yeadoc-test: b -->\n```\n").unwrap();

        let (index, problems) = SnippetIndex::build(&[docs]);
        assert_eq!(index.ids().collect::<Vec<_>>(), vec!["log-table"]);
        assert!(index.get("hidden").is_none());
        assert_eq!(problems.len(), 1);
    }

    #[test]
    fn test_materialize() {
        let tmp = TempDir::new().unwrap();
        let snippets = extract_snippets(DOC, Path::new("lib.py")).unwrap();
        let path = snippets[0]
            .materialize(&tmp.path().join("yeadoc"), "t1_table")
            .unwrap();
        assert_eq!(path, tmp.path().join("yeadoc").join("t1_table.py"));
        assert!(std::fs::read_to_string(path).unwrap().starts_with("import wandb"));
    }
}
