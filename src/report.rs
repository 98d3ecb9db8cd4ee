//! Test reporting.
//!
//! One [`TestReport`] per executed test, printed to the console when the run
//! ends and optionally written as JUnit XML (see [`junit`]).

pub mod junit;

pub use junit::JUnitWriter;

use std::time::Duration;

use serde_json::Value;

use crate::discovery::ResolvedTest;
use crate::plugin::{CheckResult, Execution};

/// State key whose numeric entries become report properties.
pub const PROFILE_STATE_KEY: &str = "profile";

/// The recorded result of one test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    /// Canonical id.
    pub id: String,
    /// Path relative to the root.
    pub name: String,
    pub elapsed: Duration,
    pub failures: Vec<String>,
    /// Profiling statistics reported by plugins.
    pub properties: Vec<(String, f64)>,
}

impl TestReport {
    /// Builds the report of `test` from its execution and the plugin checks.
    pub fn new(
        test: &ResolvedTest,
        execution: &Execution,
        results: impl IntoIterator<Item = CheckResult>,
    ) -> Self {
        let mut failures = Vec::new();
        if execution.timed_out {
            failures.push(format!("TIMEOUT({}s)", test.spec.command.timeout));
        }
        let mut properties = Vec::new();
        for result in results {
            failures.extend(result.failures);
            if let Some(Value::Object(profile)) = result.state.get(PROFILE_STATE_KEY) {
                properties.extend(
                    profile
                        .iter()
                        .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n))),
                );
            }
        }
        Self {
            id: test.id.clone(),
            name: test.name.clone(),
            elapsed: execution.elapsed,
            failures,
            properties,
        }
    }

    /// A report for a test whose checks were skipped.
    pub fn unchecked(test: &ResolvedTest, execution: &Execution) -> Self {
        Self {
            id: test.id.clone(),
            name: test.name.clone(),
            elapsed: execution.elapsed,
            failures: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// All failures, comma-joined.
    pub fn failure_message(&self) -> String {
        self.failures.join(",")
    }
}

/// Reports of a whole run, in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub reports: Vec<TestReport>,
}

impl RunSummary {
    pub fn new(reports: Vec<TestReport>) -> Self {
        Self { reports }
    }

    pub fn passed(&self) -> usize {
        self.reports.iter().filter(|r| r.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.passed()
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    /// Process exit code: 0 if every test passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            crate::EXIT_SUCCESS
        } else {
            crate::EXIT_TEST_FAILURE
        }
    }

    /// `(id, seconds)` of every test, for the duration history.
    pub fn durations(&self) -> impl Iterator<Item = (String, f64)> + '_ {
        self.reports
            .iter()
            .map(|r| (r.id.clone(), r.elapsed.as_secs_f64()))
    }
}

/// One summary row: the test name padded to `width`, its verdict and any
/// failures.
fn result_line(report: &TestReport, width: usize) -> String {
    let marker = if report.passed() {
        console::style("PASS").green()
    } else {
        console::style("FAIL").red().bold()
    };
    format!("{:<width$}  {}  {}", report.name, marker, report.failure_message())
        .trim_end()
        .to_string()
}

/// Prints one line per test, then the duration table.
pub fn print_summary(summary: &RunSummary) {
    let width = summary
        .reports
        .iter()
        .map(|r| r.name.len())
        .max()
        .unwrap_or(0);

    println!();
    for report in &summary.reports {
        println!("{}", result_line(report, width));
    }

    print_durations(summary);

    println!();
    if summary.success() {
        println!(
            "{}",
            console::style(format!("All {} tests passed", summary.reports.len()))
                .green()
                .bold()
        );
    } else {
        println!(
            "{}",
            console::style(format!(
                "{} of {} tests failed",
                summary.failed(),
                summary.reports.len()
            ))
            .red()
            .bold()
        );
    }
}

/// Prints elapsed seconds per test, longest first.
pub fn print_durations(summary: &RunSummary) {
    if summary.reports.is_empty() {
        return;
    }
    let mut rows: Vec<&TestReport> = summary.reports.iter().collect();
    rows.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));

    let width = rows.iter().map(|r| r.id.len()).max().unwrap_or(0);
    println!();
    println!("{}", console::style("Test durations (sec):").bold());
    for r in rows {
        println!(
            "  {:<width$}  {:>9.3}  {}",
            r.id,
            r.elapsed.as_secs_f64(),
            console::style(&r.name).dim()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TestSpec;
    use serde_json::json;
    use std::path::PathBuf;

    fn resolved(id: &str) -> ResolvedTest {
        let mut t = ResolvedTest::new(
            PathBuf::from("/r/t1_a.py"),
            PathBuf::from("/r/t1_a.py"),
            TestSpec::default(),
        );
        t.id = id.to_string();
        t.name = "t1_a.py".to_string();
        t
    }

    #[test]
    fn test_report_collects_failures_and_profile() {
        let mut state = serde_json::Map::new();
        state.insert(
            "profile".to_string(),
            json!({"max_rss_mb": 120.5, "label": "x", "runs": 2}),
        );
        let results = vec![
            CheckResult::failure("BAD_CONFIG(a:1!=2)"),
            CheckResult {
                failures: vec!["EXIT(1)".to_string()],
                state,
            },
        ];
        let execution = Execution {
            ran: true,
            elapsed: Duration::from_millis(1500),
            ..Default::default()
        };
        let report = TestReport::new(&resolved("1"), &execution, results);

        assert!(!report.passed());
        assert_eq!(report.failure_message(), "BAD_CONFIG(a:1!=2),EXIT(1)");
        assert_eq!(
            report.properties,
            vec![("max_rss_mb".to_string(), 120.5), ("runs".to_string(), 2.0)]
        );
        assert_eq!(report.elapsed, Duration::from_millis(1500));
    }

    #[test]
    fn test_timeout_is_reported_first() {
        let execution = Execution {
            ran: true,
            timed_out: true,
            ..Default::default()
        };
        let report = TestReport::new(
            &resolved("1"),
            &execution,
            vec![CheckResult::failure("MISSING")],
        );
        assert_eq!(report.failures, vec!["TIMEOUT(300s)", "MISSING"]);
    }

    #[test]
    fn test_summary_exit_code() {
        let pass = TestReport::new(&resolved("1"), &Execution::default(), vec![]);
        let fail = TestReport::new(
            &resolved("2"),
            &Execution::default(),
            vec![CheckResult::failure("x")],
        );

        assert_eq!(RunSummary::new(vec![pass.clone()]).exit_code(), crate::EXIT_SUCCESS);
        assert_eq!(RunSummary::new(vec![]).exit_code(), crate::EXIT_SUCCESS);
        let mixed = RunSummary::new(vec![pass, fail]);
        assert_eq!(mixed.exit_code(), crate::EXIT_TEST_FAILURE);
        assert_eq!(mixed.failed(), 1);
        assert_eq!(
            mixed.durations().map(|(id, _)| id).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
    }

    #[test]
    fn test_result_line_pads_names() {
        let mut short = TestReport::new(&resolved("1"), &Execution::default(), vec![]);
        short.name = "tests/t1_ok.py".to_string();
        let mut long = TestReport::new(
            &resolved("2"),
            &Execution::default(),
            vec![CheckResult::failure("EXIT(3)")],
        );
        long.name = "tests/t2_bad.py".to_string();

        let line = |r: &TestReport| console::strip_ansi_codes(&result_line(r, 15)).into_owned();
        assert_eq!(line(&short), "tests/t1_ok.py   PASS");
        assert_eq!(line(&long), "tests/t2_bad.py  FAIL  EXIT(3)");
    }

    #[test]
    fn test_unchecked_report_has_no_failures() {
        let execution = Execution {
            timed_out: true,
            ..Default::default()
        };
        let report = TestReport::unchecked(&resolved("1"), &execution);
        assert!(report.passed());
        assert_eq!(report.name, "t1_a.py");
    }
}
