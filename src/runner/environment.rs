//! Variables handed to a test's program.
//!
//! | variable | content |
//! |----------|---------|
//! | spec `env` entries | as declared, later entries win |
//! | `YEA_PARAM_NAMES` / `YEA_PARAM_VALUES` | permutation groups and values, comma-joined |
//! | `YEA_PROFILE_VARS` / `YEA_PROFILE_VALS` / `YEA_PROFILE_FILE` | profile names, JSON values, output file |
//! | `YEA_TRIGGER_VARS` | sorted plugin-prefixed trigger names |
//! | `YEA_PLUGIN_<P>_NAMES` / `YEA_PLUGIN_<P>_VALUES` | `:p:` vars of plugin `P` |
//! | `YEA_PLUGINS` | declared plugins |

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::discovery::ResolvedTest;
use crate::spec::env_value;

pub const PARAM_NAMES: &str = "YEA_PARAM_NAMES";
pub const PARAM_VALUES: &str = "YEA_PARAM_VALUES";
pub const PROFILE_VARS: &str = "YEA_PROFILE_VARS";
pub const PROFILE_VALS: &str = "YEA_PROFILE_VALS";
pub const PROFILE_FILE: &str = "YEA_PROFILE_FILE";
pub const TRIGGER_VARS: &str = "YEA_TRIGGER_VARS";
pub const PLUGINS: &str = "YEA_PLUGINS";

/// The environment overlay of one test.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestEnvironment {
    pub vars: BTreeMap<String, String>,
    /// Where the program is asked to write profiling data.
    pub profile_file: Option<PathBuf>,
}

pub fn profile_file(cache_dir: &Path, pid: u32, id: &str) -> PathBuf {
    cache_dir.join(format!(".profile-{pid}-{}", file_safe_id(id)))
}

/// `id` as a single path component: parameter values may contain `/`.
pub fn file_safe_id(id: &str) -> String {
    id.replace('/', "_")
}

/// `:p:` prefix of plugin `p`.
pub fn plugin_prefix(plugin: &str) -> String {
    format!(":{plugin}:")
}

/// Builds the overlay for `test`. Profile files live in `cache_dir`.
pub fn test_environment(test: &ResolvedTest, cache_dir: &Path, pid: u32) -> TestEnvironment {
    let spec = &test.spec;
    let mut env = TestEnvironment::default();

    for overlay in &spec.env {
        for (key, value) in overlay {
            env.vars.insert(key.clone(), env_value(value));
        }
    }

    if let Some(permutation) = &test.permutation {
        env.vars.insert(PARAM_NAMES.to_string(), permutation.names_env());
        env.vars.insert(PARAM_VALUES.to_string(), permutation.values_env());
    }

    if !spec.profile.is_empty() {
        let names: Vec<&str> = spec.profile.iter().map(|p| p.name()).collect();
        let values: Vec<Value> = spec.profile.iter().map(|p| p.value()).collect();
        let file = profile_file(cache_dir, pid, &test.id);
        env.vars.insert(PROFILE_VARS.to_string(), names.join(","));
        env.vars
            .insert(PROFILE_VALS.to_string(), Value::Array(values).to_string());
        env.vars
            .insert(PROFILE_FILE.to_string(), file.to_string_lossy().into_owned());
        env.profile_file = Some(file);
    }

    if !spec.trigger.is_empty() {
        let triggers: BTreeSet<&str> = spec
            .trigger
            .iter()
            .map(|t| t.name())
            .filter(|name| name.starts_with(':'))
            .collect();
        env.vars.insert(
            TRIGGER_VARS.to_string(),
            triggers.into_iter().collect::<Vec<_>>().join(","),
        );
    }

    if !spec.plugin.is_empty() {
        for plugin in &spec.plugin {
            let prefix = plugin_prefix(plugin);
            let mut names = Vec::new();
            let mut values = Vec::new();
            for entry in &spec.var {
                for (key, value) in entry {
                    if let Some(name) = key.strip_prefix(&prefix) {
                        names.push(name.to_string());
                        values.push(value.clone());
                    }
                }
            }
            if !names.is_empty() {
                let upper = plugin.to_uppercase();
                env.vars
                    .insert(format!("YEA_PLUGIN_{upper}_NAMES"), names.join(","));
                env.vars.insert(
                    format!("YEA_PLUGIN_{upper}_VALUES"),
                    Value::Array(values).to_string(),
                );
            }
        }
        env.vars.insert(PLUGINS.to_string(), spec.plugin.join(","));
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parametrize;
    use crate::spec::parse_spec;

    fn resolved(yaml: &str) -> ResolvedTest {
        let spec = parse_spec(yaml, Path::new("t1_x.yea")).unwrap().unwrap();
        let path = PathBuf::from("/r/t1_x.py");
        let mut t = ResolvedTest::new(path.clone(), path, spec);
        t.id = "1".to_string();
        t
    }

    #[test]
    fn test_plain_spec_has_empty_overlay() {
        let env = test_environment(&resolved("id: x\n"), Path::new("/c"), 9);
        assert!(env.vars.is_empty());
        assert_eq!(env.profile_file, None);
    }

    #[test]
    fn test_env_overlays_in_order() {
        let env = test_environment(
            &resolved("env:\n  - A: one\n    N: 3\n  - A: two\n    B: true\n"),
            Path::new("/c"),
            9,
        );
        assert_eq!(env.vars["A"], "two");
        assert_eq!(env.vars["B"], "true");
        assert_eq!(env.vars["N"], "3");
    }

    #[test]
    fn test_permutation_vars() {
        let test = resolved("parametrize:\n  permute:\n    - x: [1, 2]\n    - y: [a]\n");
        let mut expanded = parametrize::expand(test).unwrap();
        let env = test_environment(&expanded.remove(1), Path::new("/c"), 9);
        assert_eq!(env.vars[PARAM_NAMES], "x,y");
        assert_eq!(env.vars[PARAM_VALUES], "2,a");
    }

    #[test]
    fn test_profile_and_trigger_vars() {
        let env = test_environment(
            &resolved(
                "profile:\n  - memory\n  - cpu: {interval: 5}\ntrigger:\n  - ':wandb:b'\n  - plain\n  - ':wandb:a': 1\n  - ':wandb:b'\n",
            ),
            Path::new("/c"),
            9,
        );
        assert_eq!(env.vars[PROFILE_VARS], "memory,cpu");
        assert_eq!(env.vars[PROFILE_VALS], r#"[{},{"interval":5}]"#);
        assert_eq!(env.vars[PROFILE_FILE], "/c/.profile-9-1");
        assert_eq!(env.profile_file, Some(PathBuf::from("/c/.profile-9-1")));
        assert_eq!(env.vars[TRIGGER_VARS], ":wandb:a,:wandb:b");
    }

    #[test]
    fn test_plugin_vars() {
        let env = test_environment(
            &resolved(
                "plugin: [wandb, other]\nvar:\n  - ':wandb:runs_len': 1\n    ':wandb:run[0]:config': {a: 2}\n  - unrelated: 3\n",
            ),
            Path::new("/c"),
            9,
        );
        assert_eq!(env.vars[PLUGINS], "wandb,other");
        assert_eq!(env.vars["YEA_PLUGIN_WANDB_NAMES"], "run[0]:config,runs_len");
        assert_eq!(
            env.vars["YEA_PLUGIN_WANDB_VALUES"],
            r#"[{"a":2},1]"#
        );
        assert!(!env.vars.contains_key("YEA_PLUGIN_OTHER_NAMES"));
    }

    #[test]
    fn test_file_names_stay_in_cache() {
        let cache = Path::new("/r/.yea_cache");
        let file = profile_file(cache, 7, "1.0-data/in.csv");
        assert_eq!(file, PathBuf::from("/r/.yea_cache/.profile-7-1.0-data_in.csv"));
        assert_eq!(file.parent(), Some(cache));
    }
}
