//! Canonical test ids and the ordering built on them.
//!
//! A test's id is composed from the outside in:
//!
//! ```text
//! <root>/d2_group/sub/t7_check.py   (sub/.yearc declares id = "s")
//!            │     │      │
//!            2  .  s   .  7        => "2.s.7"
//! ```
//!
//! | component      | source, in order of preference                       |
//! |----------------|------------------------------------------------------|
//! | leaf           | id in the file stem, spec `id` (not dotted), stem   |
//! | each directory | id in the directory name, `.yearc` `id`, name        |
//! | permutation    | the permutation tag, if the test is a permutation    |
//!
//! The directory walk stops below the root, or right after a directory whose
//! `.yearc` declares `base = true`.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{ConfigResult, DirectoryConfigCache, OverrideSource};
use crate::spec::TestSpec;

/// Separator between id components.
pub const ID_SEPARATOR: &str = ".";

fn numbered_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z](?P<id>\d+)_(?P<name>[a-zA-Z]\w*)$").expect("static regex")
    })
}

/// Extracts the id embedded in a numbered name such as `t7_check` or
/// `d2_group`.
pub fn embedded_id(name: &str) -> Option<&str> {
    numbered_name()
        .captures(name)
        .and_then(|c| c.name("id"))
        .map(|m| m.as_str())
}

/// The innermost id component of a test.
pub fn leaf_id(path: &Path, spec: &TestSpec) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(id) = embedded_id(&stem) {
        return id.to_string();
    }
    spec.leaf_id().map(str::to_string).unwrap_or(stem)
}

/// Computes the canonical id of the test tracked at `path`.
pub fn compute_id<S: OverrideSource>(
    path: &Path,
    spec: &TestSpec,
    permutation_tag: Option<&str>,
    cache: &mut DirectoryConfigCache<S>,
) -> ConfigResult<String> {
    let mut parts = vec![leaf_id(path, spec)];

    for dir in cache.ancestors_below_root(path) {
        let name = dir
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ov = cache.get(&dir)?;
        let part = embedded_id(&name)
            .map(str::to_string)
            .or_else(|| ov.and_then(|o| o.explicit_id()).map(str::to_string))
            .unwrap_or(name);
        let is_base = ov.is_some_and(|o| o.is_base());
        parts.push(part);
        if is_base {
            break;
        }
    }

    parts.reverse();
    if let Some(tag) = permutation_tag {
        parts.push(tag.to_string());
    }
    Ok(parts.join(ID_SEPARATOR))
}

/// One run of a [`NaturalKey`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Chunk {
    /// Lowercased non-digit text.
    Text(String),
    /// Digits without leading zeros, ordered by length then value.
    Num(usize, String),
}

/// Sort key that orders digit runs numerically and text case-insensitively.
///
/// `t2_b` sorts before `t10_a`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NaturalKey(Vec<Chunk>);

/// Builds the natural sort key of `s`.
///
/// Keys always start with a (possibly empty) text run, so runs of the same
/// kind line up position by position.
pub fn natural_key(s: &str) -> NaturalKey {
    let mut chunks = Vec::new();
    let mut text = String::new();
    let mut digits = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            if digits.is_empty() {
                chunks.push(Chunk::Text(std::mem::take(&mut text).to_lowercase()));
            }
            digits.push(c);
        } else {
            if !digits.is_empty() {
                chunks.push(number(std::mem::take(&mut digits)));
            }
            text.push(c);
        }
    }
    if !digits.is_empty() {
        chunks.push(number(digits));
    } else {
        chunks.push(Chunk::Text(text.to_lowercase()));
    }
    NaturalKey(chunks)
}

fn number(digits: String) -> Chunk {
    let trimmed = digits.trim_start_matches('0');
    Chunk::Num(trimmed.len(), trimmed.to_string())
}

/// Compares two strings in natural order.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b))
}

/// The key tests are listed and run in: raw spec id, then canonical id.
pub fn sort_key(raw_id: &str, canonical_id: &str) -> NaturalKey {
    natural_key(&format!("{raw_id}:{canonical_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryOverride;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn cache(
        entries: &[(&str, DirectoryOverride)],
    ) -> DirectoryConfigCache<HashMap<PathBuf, DirectoryOverride>> {
        let map = entries
            .iter()
            .map(|(dir, ov)| (PathBuf::from(dir), ov.clone()))
            .collect();
        DirectoryConfigCache::with_source("/root", map)
    }

    fn spec_with_id(id: &str) -> TestSpec {
        TestSpec {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_numbered_directory_and_file() {
        let mut cache = cache(&[]);
        let id = compute_id(
            Path::new("/root/d2_group/t7_check.py"),
            &TestSpec::default(),
            None,
            &mut cache,
        )
        .unwrap();
        assert_eq!(id, "2.7");
    }

    #[test]
    fn test_fallbacks() {
        let mut cache = cache(&[(
            "/root/tests/sub",
            DirectoryOverride {
                id: Some("s".to_string()),
                ..Default::default()
            },
        )]);

        let from_spec = compute_id(
            Path::new("/root/tests/sub/check_it.py"),
            &spec_with_id("resume"),
            None,
            &mut cache,
        )
        .unwrap();
        assert_eq!(from_spec, "tests.s.resume");

        let dotted = compute_id(
            Path::new("/root/tests/sub/check_it.py"),
            &spec_with_id("0.old.01"),
            None,
            &mut cache,
        )
        .unwrap();
        assert_eq!(dotted, "tests.s.check_it");
    }

    #[test]
    fn test_base_boundary_is_inclusive() {
        let mut cache = cache(&[(
            "/root/a/b",
            DirectoryOverride {
                base: Some(true),
                id: Some("bee".to_string()),
                ..Default::default()
            },
        )]);
        let id = compute_id(
            Path::new("/root/a/b/c/t1_x.py"),
            &TestSpec::default(),
            Some("0-1-a"),
            &mut cache,
        )
        .unwrap();
        assert_eq!(id, "bee.c.1.0-1-a");
    }

    #[test]
    fn test_directory_name_beats_override_id() {
        let mut cache = cache(&[(
            "/root/m3_mod",
            DirectoryOverride {
                id: Some("ignored".to_string()),
                ..Default::default()
            },
        )]);
        let id = compute_id(
            Path::new("/root/m3_mod/t1_a.yea"),
            &TestSpec::default(),
            None,
            &mut cache,
        )
        .unwrap();
        assert_eq!(id, "3.1");
    }

    #[test]
    fn test_embedded_id() {
        assert_eq!(embedded_id("t7_check"), Some("7"));
        assert_eq!(embedded_id("d12_group2"), Some("12"));
        assert_eq!(embedded_id("t7_"), None);
        assert_eq!(embedded_id("test_7"), None);
        assert_eq!(embedded_id("t7_9lives"), None);
    }

    #[test]
    fn test_natural_sort() {
        let mut names = vec!["t2_b", "t10_a", "t1_c"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["t1_c", "t2_b", "t10_a"]);
    }

    #[test]
    fn test_natural_sort_case_and_zeros() {
        assert_eq!(natural_cmp("Abc", "abd"), Ordering::Less);
        assert_eq!(natural_cmp("x007", "x7"), Ordering::Equal);
        assert_eq!(natural_cmp("x9", "x10"), Ordering::Less);
        assert_eq!(natural_cmp("10", "9a"), Ordering::Greater);
        assert_eq!(natural_cmp("", "a"), Ordering::Less);
    }

    #[test]
    fn test_sort_key_orders_by_raw_id_first() {
        assert!(sort_key("", "9.1") < sort_key("a", "1.1"));
        assert!(sort_key("x", "1.2") < sort_key("x", "1.10"));
    }
}
