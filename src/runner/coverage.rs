//! Per-test coverage data and rc files.
//!
//! Each test writes coverage data to its own file so that concurrent shards on
//! one machine never collide:
//!
//! ```text
//! <cache>/.coverage-<pid>-<id>          COVERAGE_FILE
//! <cache>/yea-covrc-<pid>-<id>.conf     --rcfile, when a template is configured
//! ```

use std::path::{Path, PathBuf};

use crate::config::HarnessConfig;

use super::RunResult;
use super::environment::file_safe_id;

/// Environment variable coverage reads its data file from.
pub const COVERAGE_FILE_ENV: &str = "COVERAGE_FILE";

pub fn coverage_file(cache_dir: &Path, pid: u32, id: &str) -> PathBuf {
    cache_dir.join(format!(".coverage-{pid}-{}", file_safe_id(id)))
}

pub fn covrc_file(cache_dir: &Path, pid: u32, id: &str) -> PathBuf {
    cache_dir.join(format!("yea-covrc-{pid}-{}.conf", file_safe_id(id)))
}

/// Writes the per-test rc file, if a template is configured and a source
/// resolves. `lookup` reads the environment.
pub fn write_covrc(
    config: &HarnessConfig,
    pid: u32,
    id: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> RunResult<Option<PathBuf>> {
    if config.coverage_template.is_none() {
        return Ok(None);
    }
    let Some(source) = config.effective_coverage_source(lookup) else {
        tracing::debug!("Coverage template configured but no source resolved");
        return Ok(None);
    };
    let Some(template) = config.coverage_template_path()? else {
        return Ok(None);
    };

    let text = std::fs::read_to_string(&template)?;
    let rendered = set_ini_value(&text, "run", "source", &source);

    let cache_dir = config.cache_dir();
    std::fs::create_dir_all(&cache_dir)?;
    let path = covrc_file(&cache_dir, pid, id);
    std::fs::write(&path, rendered)?;
    tracing::debug!("Wrote coverage config {}", path.display());
    Ok(Some(path))
}

fn section_name(line: &str) -> Option<&str> {
    let line = line.trim();
    line.strip_prefix('[')?.strip_suffix(']').map(str::trim)
}

fn is_key_line(line: &str, key: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    line.split_once(['=', ':'])
        .is_some_and(|(k, _)| k.trim().eq_ignore_ascii_case(key))
}

/// Sets `key = value` in `[section]` of an INI document.
///
/// An existing entry, continuation lines included, is replaced in place. A
/// missing key is added right after the section header and a missing section
/// is appended. Everything else is kept verbatim.
pub fn set_ini_value(text: &str, section: &str, key: &str, value: &str) -> String {
    let entry = format!("{key} = {value}");
    let mut out: Vec<String> = Vec::new();
    let mut in_section = false;
    let mut header_at: Option<usize> = None;
    let mut replaced = false;
    let mut skipping_continuation = false;

    for line in text.lines() {
        if skipping_continuation {
            if line.starts_with(char::is_whitespace) && !line.trim().is_empty() {
                continue;
            }
            skipping_continuation = false;
        }
        if let Some(name) = section_name(line) {
            in_section = name == section;
            if in_section && header_at.is_none() {
                header_at = Some(out.len());
            }
            out.push(line.to_string());
            continue;
        }
        if in_section && !replaced && is_key_line(line, key) {
            out.push(entry.clone());
            replaced = true;
            skipping_continuation = true;
            continue;
        }
        out.push(line.to_string());
    }

    if !replaced {
        match header_at {
            Some(idx) => out.insert(idx + 1, entry),
            None => {
                if out.last().is_some_and(|l| !l.trim().is_empty()) {
                    out.push(String::new());
                }
                out.push(format!("[{section}]"));
                out.push(entry);
            }
        }
    }

    let mut rendered = out.join("\n");
    rendered.push('\n');
    rendered
}
