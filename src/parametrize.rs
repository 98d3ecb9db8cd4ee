//! Expansion of parametrized tests.
//!
//! ```yaml
//! parametrize:
//!   permute:
//!     - x: [1, 2]
//!     - y: [a, b]
//! ```
//!
//! expands into the product of the groups, first group varying slowest:
//!
//! | index | x | y | tag     |
//! |-------|---|---|---------|
//! | 0     | 1 | a | `0-1-a` |
//! | 1     | 1 | b | `1-1-b` |
//! | 2     | 2 | a | `2-2-a` |
//! | 3     | 2 | b | `3-2-b` |

use serde_json::{Map, Value};

use crate::discovery::ResolvedTest;
use crate::spec::{SpecError, SpecResult, env_value};

/// One combination of parametrized values.
#[derive(Debug, Clone, PartialEq)]
pub struct Permutation {
    /// Position in the product enumeration.
    pub index: usize,
    /// Group names, in declaration order.
    pub groups: Vec<String>,
    /// Chosen value per group.
    pub values: Vec<Value>,
}

impl Permutation {
    /// `"{index}-{value1}-{value2}-..."`
    pub fn tag(&self) -> String {
        std::iter::once(self.index.to_string())
            .chain(self.values.iter().map(env_value))
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Comma-joined group names.
    pub fn names_env(&self) -> String {
        self.groups.join(",")
    }

    /// Comma-joined stringified values.
    pub fn values_env(&self) -> String {
        self.values
            .iter()
            .map(env_value)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Group name to chosen value.
    pub fn params(&self) -> Map<String, Value> {
        self.groups
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

/// Reads the `permute` groups of a test, checking their shape.
fn permute_groups(test: &ResolvedTest) -> SpecResult<Vec<(String, Vec<Value>)>> {
    let Some(parametrize) = &test.spec.parametrize else {
        return Ok(Vec::new());
    };

    let invalid = |reason: String| SpecError::Permute {
        path: test.path.clone(),
        reason,
    };

    parametrize
        .permute
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let map = entry
                .as_object()
                .ok_or_else(|| invalid(format!("entry {i} is not a mapping")))?;
            if map.len() != 1 {
                return Err(invalid(format!(
                    "entry {i} must have exactly one key, found {}",
                    map.len()
                )));
            }
            let (name, values) = map
                .iter()
                .next()
                .ok_or_else(|| invalid(format!("entry {i} is empty")))?;
            let values = values
                .as_array()
                .ok_or_else(|| invalid(format!("values of '{name}' are not a list")))?;
            Ok((name.clone(), values.clone()))
        })
        .collect()
}

/// Expands a test into its permutations.
///
/// A test without `parametrize.permute` groups is returned unchanged.
pub fn expand(test: ResolvedTest) -> SpecResult<Vec<ResolvedTest>> {
    let groups = permute_groups(&test)?;
    if groups.is_empty() {
        return Ok(vec![test]);
    }

    let names: Vec<String> = groups.iter().map(|(name, _)| name.clone()).collect();
    let mut combos: Vec<Vec<Value>> = vec![Vec::new()];
    for (_, values) in &groups {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    let mut combo = prefix.clone();
                    combo.push(v.clone());
                    combo
                })
            })
            .collect();
    }

    tracing::debug!(
        "Expanded {} into {} permutations",
        test.path.display(),
        combos.len()
    );

    Ok(combos
        .into_iter()
        .enumerate()
        .map(|(index, values)| {
            let mut permuted = test.clone();
            permuted.permutation = Some(Permutation {
                index,
                groups: names.clone(),
                values,
            });
            permuted
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parse_spec;
    use std::path::Path;

    fn test_from(yaml: &str) -> ResolvedTest {
        let path = Path::new("/root/t1_p.yea");
        let spec = parse_spec(yaml, path).unwrap().unwrap();
        ResolvedTest::new(path.to_path_buf(), path.with_extension("py"), spec)
    }

    #[test]
    fn test_product_order_and_tags() {
        let test = test_from("parametrize:\n  permute:\n    - x: [1, 2]\n    - y: [a, b]\n");
        let expanded = expand(test).unwrap();

        let tags: Vec<String> = expanded
            .iter()
            .map(|t| t.permutation.as_ref().unwrap().tag())
            .collect();
        assert_eq!(tags, vec!["0-1-a", "1-1-b", "2-2-a", "3-2-b"]);

        let last = expanded[3].permutation.as_ref().unwrap();
        assert_eq!(last.names_env(), "x,y");
        assert_eq!(last.values_env(), "2,b");
        assert_eq!(last.params()["y"], Value::from("b"));
    }

    #[test]
    fn test_no_parametrize_is_identity() {
        let test = test_from("id: plain\n");
        let expanded = expand(test.clone()).unwrap();
        assert_eq!(expanded.len(), 1);
        assert!(expanded[0].permutation.is_none());
        assert_eq!(expanded[0].spec, test.spec);
    }

    #[test]
    fn test_empty_group_yields_nothing() {
        let test = test_from("parametrize:\n  permute:\n    - x: []\n    - y: [a]\n");
        assert!(expand(test).unwrap().is_empty());
    }

    #[test]
    fn test_multi_key_entry_rejected() {
        let test = test_from("parametrize:\n  permute:\n    - {x: [1], y: [2]}\n");
        let err = expand(test).unwrap_err();
        assert!(matches!(err, SpecError::Permute { .. }));
    }

    #[test]
    fn test_non_list_values_rejected() {
        let test = test_from("parametrize:\n  permute:\n    - x: 1\n");
        assert!(expand(test).is_err());

        let test = test_from("parametrize:\n  permute:\n    - just_a_string\n");
        assert!(expand(test).is_err());
    }
}
