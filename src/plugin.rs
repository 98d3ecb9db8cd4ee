//! Plugin hooks.
//!
//! The harness never decides by itself whether a test passed. Plugins watch
//! the run through lifecycle hooks and report failures from [`Plugin::check`].
//! Plugins are registered by the binary at startup; the library only calls
//! them.
//!
//! ```text
//! inform(tests) ─► init ─► start ─┬─► reset ─► prep ─► (run) ─► done ─► check ─┬─► stop
//!                                 └──────────────── per test ──────────────────┘
//! ```
//!
//! Only plugins *needed* by at least one test get the monitor hooks and
//! checks. `test_prep`/`test_done` go to every registered plugin.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::discovery::ResolvedTest;
use crate::runner::{RunError, RunResult};

/// Prefix of the top-level spec key that opts a test into a plugin's check.
pub const CHECK_KEY_PREFIX: &str = "check-ext-";

/// What happened when a test's program ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    /// `false` under `--dryrun`.
    pub ran: bool,
    /// Exit code, if the program exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal, if the program was killed by one.
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
    /// File the program was asked to write profiling data to.
    pub profile_file: Option<PathBuf>,
}

/// One batch of findings from a plugin check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckResult {
    pub failures: Vec<String>,
    /// Arbitrary key/values. A `profile` object of numbers becomes report
    /// properties.
    pub state: Map<String, Value>,
}

impl CheckResult {
    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            failures: vec![msg.into()],
            state: Map::new(),
        }
    }
}

/// A collaborator observing and judging test runs.
///
/// Hooks take `&self`; implementations keep mutable state behind a lock.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Name used in specs (`plugin: [name]`, `:name:` prefixes).
    fn name(&self) -> &str;

    /// Whether `test` opts into this plugin.
    fn wants(&self, test: &ResolvedTest) -> bool {
        let name = self.name();
        test.spec.plugin.iter().any(|p| p == name)
            || test
                .spec
                .extra
                .contains_key(&format!("{CHECK_KEY_PREFIX}{name}"))
    }

    async fn monitors_init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn monitors_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn monitors_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn monitors_reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Receives the nested configuration built from `:name:` parameters.
    async fn configure(&self, _config: Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn test_prep(&self, _test: &ResolvedTest) -> anyhow::Result<()> {
        Ok(())
    }

    async fn test_done(&self, _test: &ResolvedTest) -> anyhow::Result<()> {
        Ok(())
    }

    async fn check(
        &self,
        test: &ResolvedTest,
        execution: &Execution,
        debug: bool,
    ) -> anyhow::Result<Vec<CheckResult>>;
}

/// The registered plugins and which of them the current run needs.
#[derive(Default)]
pub struct PluginSet {
    plugins: Vec<Box<dyn Plugin>>,
    needed: BTreeSet<String>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plugin. Later registrations with the same name are ignored.
    pub fn with(mut self, plugin: impl Plugin + 'static) -> Self {
        self.register(Box::new(plugin));
        self
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        if self.get(plugin.name()).is_some() {
            tracing::warn!("Plugin {} registered twice, keeping the first", plugin.name());
            return;
        }
        self.plugins.push(plugin);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Plugin> {
        self.plugins
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.name())
    }

    pub fn is_needed(&self, name: &str) -> bool {
        self.needed.contains(name)
    }

    /// Marks the plugins wanted by at least one of `tests` as needed.
    pub fn inform(&mut self, tests: &[ResolvedTest]) {
        self.needed = self
            .plugins
            .iter()
            .filter(|p| tests.iter().any(|t| p.wants(t)))
            .map(|p| p.name().to_string())
            .collect();
        tracing::debug!("Plugins needed: {:?}", self.needed);
    }

    fn needed(&self) -> impl Iterator<Item = &(dyn Plugin + 'static)> {
        self.plugins
            .iter()
            .filter(|p| self.needed.contains(p.name()))
            .map(|p| p.as_ref())
    }

    pub async fn monitors_init(&self) -> RunResult<()> {
        for p in self.needed() {
            p.monitors_init().await.map_err(|e| plugin_error(p, e))?;
        }
        Ok(())
    }

    pub async fn monitors_start(&self) -> RunResult<()> {
        for p in self.needed() {
            p.monitors_start().await.map_err(|e| plugin_error(p, e))?;
        }
        Ok(())
    }

    /// Stops every needed plugin, reporting the first failure after trying
    /// them all.
    pub async fn monitors_stop(&self) -> RunResult<()> {
        let mut first = None;
        for p in self.needed() {
            if let Err(e) = p.monitors_stop().await {
                tracing::error!("Plugin {} failed to stop: {:#}", p.name(), e);
                first.get_or_insert_with(|| plugin_error(p, e));
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub async fn monitors_reset(&self) -> RunResult<()> {
        for p in self.needed() {
            p.monitors_reset().await.map_err(|e| plugin_error(p, e))?;
        }
        Ok(())
    }

    /// Passes `config` to the named plugin. Unknown names are logged.
    pub async fn configure(&self, name: &str, config: Value) -> RunResult<()> {
        match self.get(name) {
            Some(p) => p.configure(config).await.map_err(|e| plugin_error(p, e)),
            None => {
                tracing::warn!("No plugin named {} to configure", name);
                Ok(())
            }
        }
    }

    pub async fn test_prep(&self, test: &ResolvedTest) -> RunResult<()> {
        for p in &self.plugins {
            p.test_prep(test)
                .await
                .map_err(|e| plugin_error(p.as_ref(), e))?;
        }
        Ok(())
    }

    pub async fn test_done(&self, test: &ResolvedTest) -> RunResult<()> {
        for p in &self.plugins {
            p.test_done(test)
                .await
                .map_err(|e| plugin_error(p.as_ref(), e))?;
        }
        Ok(())
    }

    /// Collects the findings of every needed plugin that wants `test`.
    ///
    /// A check that itself errors counts as a failure of the test.
    pub async fn check(
        &self,
        test: &ResolvedTest,
        execution: &Execution,
        debug: bool,
    ) -> Vec<CheckResult> {
        let mut results = Vec::new();
        for p in self.needed().filter(|p| p.wants(test)) {
            match p.check(test, execution, debug).await {
                Ok(found) => results.extend(found),
                Err(e) => {
                    tracing::error!("Plugin {} check failed: {:#}", p.name(), e);
                    results.push(CheckResult::failure(format!(
                        "PLUGIN_ERROR({}: {e})",
                        p.name()
                    )));
                }
            }
        }
        results
    }
}

fn plugin_error(plugin: &dyn Plugin, source: anyhow::Error) -> RunError {
    RunError::Plugin {
        plugin: plugin.name().to_string(),
        source,
    }
}

/// Folds flat `<prefix>a:b:c` parameter names into a nested mapping.
///
/// ```
/// use serde_json::json;
/// let params = json!({
///     ":wandb:mock_server:lol": true,
///     ":wandb:foo": "bar",
///     ":other:x": 1,
/// });
/// let config = yea::plugin::get_config(params.as_object().unwrap(), ":wandb:");
/// assert_eq!(serde_json::Value::Object(config), json!({
///     "mock_server": {"lol": true},
///     "foo": "bar",
/// }));
/// ```
pub fn get_config(params: &Map<String, Value>, prefix: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in params {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let mut node = &mut out;
        let mut parts = rest.split(':').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                node.insert(part.to_string(), value.clone());
                break;
            }
            let child = node
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            let Value::Object(map) = child else {
                break;
            };
            node = map;
        }
    }
    out
}

/// Built-in check failing tests whose program did not exit cleanly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitStatusPlugin;

#[async_trait]
impl Plugin for ExitStatusPlugin {
    fn name(&self) -> &str {
        "exit"
    }

    fn wants(&self, _test: &ResolvedTest) -> bool {
        true
    }

    async fn check(
        &self,
        _test: &ResolvedTest,
        execution: &Execution,
        _debug: bool,
    ) -> anyhow::Result<Vec<CheckResult>> {
        if !execution.ran || execution.timed_out {
            return Ok(Vec::new());
        }
        let failure = match (execution.exit_code, execution.signal) {
            (Some(0), _) => return Ok(Vec::new()),
            (Some(code), _) => format!("EXIT({code})"),
            (None, Some(signal)) => format!("SIGNAL({signal})"),
            (None, None) => "EXIT(unknown)".to_string(),
        };
        Ok(vec![CheckResult::failure(failure)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TestSpec;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        calls: Mutex<Vec<String>>,
        fail_start: bool,
    }

    impl Recorder {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Plugin for std::sync::Arc<Recorder> {
        fn name(&self) -> &str {
            self.name
        }

        async fn monitors_start(&self) -> anyhow::Result<()> {
            self.record("start");
            if self.fail_start {
                anyhow::bail!("port in use");
            }
            Ok(())
        }

        async fn monitors_stop(&self) -> anyhow::Result<()> {
            self.record("stop");
            Ok(())
        }

        async fn configure(&self, config: Value) -> anyhow::Result<()> {
            self.record(format!("configure {config}"));
            Ok(())
        }

        async fn test_prep(&self, test: &ResolvedTest) -> anyhow::Result<()> {
            self.record(format!("prep {}", test.id));
            Ok(())
        }

        async fn check(
            &self,
            test: &ResolvedTest,
            _execution: &Execution,
            _debug: bool,
        ) -> anyhow::Result<Vec<CheckResult>> {
            self.record(format!("check {}", test.id));
            Ok(vec![CheckResult::failure(format!("{}-bad", self.name))])
        }
    }

    fn test_with(id: &str, plugins: &[&str]) -> ResolvedTest {
        let spec = TestSpec {
            plugin: plugins.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        };
        let mut t = ResolvedTest::new(PathBuf::from("/r/t.py"), PathBuf::from("/r/t.py"), spec);
        t.id = id.to_string();
        t
    }

    #[tokio::test]
    async fn test_only_needed_plugins_get_monitor_hooks() {
        let used = std::sync::Arc::new(Recorder::named("wandb"));
        let unused = std::sync::Arc::new(Recorder::named("other"));
        let mut set = PluginSet::new().with(used.clone()).with(unused.clone());

        let tests = vec![test_with("1", &["wandb"]), test_with("2", &[])];
        set.inform(&tests);
        assert!(set.is_needed("wandb"));
        assert!(!set.is_needed("other"));

        set.monitors_start().await.unwrap();
        set.test_prep(&tests[1]).await.unwrap();
        let results = set.check(&tests[0], &Execution::default(), false).await;
        assert!(set.check(&tests[1], &Execution::default(), false).await.is_empty());
        set.monitors_stop().await.unwrap();

        assert_eq!(results, vec![CheckResult::failure("wandb-bad")]);
        assert_eq!(used.calls(), vec!["start", "prep 2", "check 1", "stop"]);
        assert_eq!(unused.calls(), vec!["prep 2"]);
    }

    #[tokio::test]
    async fn test_check_key_opts_in() {
        let plugin = std::sync::Arc::new(Recorder::named("wandb"));
        let mut set = PluginSet::new().with(plugin.clone());
        let mut test = test_with("3", &[]);
        test.spec
            .extra
            .insert("check-ext-wandb".to_string(), json!({"run": []}));
        set.inform(std::slice::from_ref(&test));
        assert_eq!(set.check(&test, &Execution::default(), false).await.len(), 1);
    }

    #[tokio::test]
    async fn test_hook_error_names_plugin() {
        let plugin = std::sync::Arc::new(Recorder {
            name: "wandb",
            fail_start: true,
            ..Default::default()
        });
        let mut set = PluginSet::new().with(plugin);
        set.inform(&[test_with("1", &["wandb"])]);
        let err = set.monitors_start().await.unwrap_err();
        assert!(matches!(err, RunError::Plugin { ref plugin, .. } if plugin == "wandb"));
    }

    #[tokio::test]
    async fn test_configure_routes_by_name() {
        let plugin = std::sync::Arc::new(Recorder::named("wandb"));
        let set = PluginSet::new().with(plugin.clone());
        set.configure("wandb", json!({"a": 1})).await.unwrap();
        set.configure("missing", json!({})).await.unwrap();
        assert_eq!(plugin.calls(), vec![r#"configure {"a":1}"#]);
    }

    #[test]
    fn test_get_config_nests_and_merges() {
        let params = json!({
            ":rug:ties_room_together": true,
            ":wandb:mock_server:lol": true,
            ":wandb:mock_server:lmao": false,
            ":wandb:mock_server:resistance:object": "Borg",
            ":wandb:mock_server:resistance:is_futile": true,
            ":wandb:foo": "bar",
            "plain": 1,
        });
        let config = get_config(params.as_object().unwrap(), ":wandb:");
        assert_eq!(
            Value::Object(config),
            json!({
                "mock_server": {
                    "lol": true,
                    "lmao": false,
                    "resistance": {"object": "Borg", "is_futile": true},
                },
                "foo": "bar",
            })
        );
        assert!(get_config(params.as_object().unwrap(), ":none:").is_empty());
    }

    #[tokio::test]
    async fn test_exit_status_plugin() {
        let plugin = ExitStatusPlugin;
        let test = test_with("1", &[]);
        assert!(plugin.wants(&test));

        let ok = Execution {
            ran: true,
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(plugin.check(&test, &ok, false).await.unwrap().is_empty());

        let failed = Execution {
            ran: true,
            exit_code: Some(3),
            ..Default::default()
        };
        assert_eq!(
            plugin.check(&test, &failed, false).await.unwrap(),
            vec![CheckResult::failure("EXIT(3)")]
        );

        let killed = Execution {
            ran: true,
            signal: Some(9),
            ..Default::default()
        };
        assert_eq!(
            plugin.check(&test, &killed, false).await.unwrap(),
            vec![CheckResult::failure("SIGNAL(9)")]
        );

        let dry = Execution::default();
        assert!(plugin.check(&test, &dry, false).await.unwrap().is_empty());
    }
}
