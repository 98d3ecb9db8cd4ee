//! Duration-balanced sharding.
//!
//! Independent `yea` processes, one per shard, each call [`split`] with the
//! same test list and duration history and keep their own group. Nothing is
//! shared between them except the history file, so the assignment has to be
//! fully deterministic.
//!
//! The assignment is greedy longest-processing-time-first: tests are taken
//! longest first and each goes to the group with the smallest total so far.
//!
//! ```text
//! tests: A=5 B=3 C=1, 2 groups
//!
//!   A → group 1 (0,0)   sums 5,0
//!   B → group 2 (5,0)   sums 5,3
//!   C → group 2 (5,3)   sums 5,4
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::discovery::ResolvedTest;

/// Estimate used for every test when no relevant history exists.
pub const DEFAULT_DURATION: f64 = 1.0;

/// One shard's share of the test list.
#[derive(Debug, Clone)]
pub struct TestGroup {
    /// Tests assigned to this shard, in input order.
    pub selected: Vec<ResolvedTest>,
    /// Every other test, in input order.
    pub deselected: Vec<ResolvedTest>,
    /// Sum of the estimates of the selected tests.
    pub duration: f64,
}

/// Heap entry: a group's running sum and its index.
#[derive(Debug, Clone, Copy)]
struct Load {
    sum: f64,
    group: usize,
}

impl PartialEq for Load {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Load {}

impl PartialOrd for Load {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Load {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sum
            .total_cmp(&other.sum)
            .then(self.group.cmp(&other.group))
    }
}

/// Duration estimate per test, by position.
///
/// Tests with history use it. Others get the mean of the history entries
/// that belong to tests in this list, each entry counted once, or
/// [`DEFAULT_DURATION`] if none do.
pub fn estimate_durations(
    tests: &[ResolvedTest],
    durations: &HashMap<String, f64>,
) -> Vec<f64> {
    let ids: HashSet<&str> = tests.iter().map(|t| t.id.as_str()).collect();
    let relevant: Vec<f64> = durations
        .iter()
        .filter(|(id, _)| ids.contains(id.as_str()))
        .map(|(_, secs)| *secs)
        .collect();
    let fallback = if relevant.is_empty() {
        DEFAULT_DURATION
    } else {
        relevant.iter().sum::<f64>() / relevant.len() as f64
    };

    tests
        .iter()
        .map(|t| durations.get(&t.id).copied().unwrap_or(fallback))
        .collect()
}

/// Partitions `tests` into `splits` groups of roughly equal total duration.
///
/// Returns one group per shard; callers pick theirs by 1-based index.
pub fn split(
    splits: usize,
    tests: &[ResolvedTest],
    durations: &HashMap<String, f64>,
) -> Vec<TestGroup> {
    let splits = splits.max(1);
    let estimates = estimate_durations(tests, durations);

    let mut order: Vec<usize> = (0..tests.len()).collect();
    // Name first so that equal durations keep a stable order, then longest first.
    order.sort_by(|&a, &b| tests[a].name.cmp(&tests[b].name));
    order.sort_by(|&a, &b| estimates[b].total_cmp(&estimates[a]));

    let mut heap: BinaryHeap<Reverse<Load>> = (0..splits)
        .map(|group| Reverse(Load { sum: 0.0, group }))
        .collect();
    let mut assigned: Vec<Vec<usize>> = vec![Vec::new(); splits];
    let mut sums = vec![0.0; splits];

    for idx in order {
        let Some(Reverse(load)) = heap.pop() else {
            break;
        };
        let sum = load.sum + estimates[idx];
        assigned[load.group].push(idx);
        sums[load.group] = sum;
        heap.push(Reverse(Load {
            sum,
            group: load.group,
        }));
    }

    assigned
        .into_iter()
        .zip(sums)
        .map(|(mut indices, duration)| {
            indices.sort_unstable();
            let mut selected = Vec::with_capacity(indices.len());
            let mut deselected = Vec::with_capacity(tests.len() - indices.len());
            let mut chosen = indices.into_iter().peekable();
            for (i, test) in tests.iter().enumerate() {
                if chosen.peek() == Some(&i) {
                    chosen.next();
                    selected.push(test.clone());
                } else {
                    deselected.push(test.clone());
                }
            }
            TestGroup {
                selected,
                deselected,
                duration,
            }
        })
        .collect()
}

/// Returns the tests of shard `group` (1-based) out of `splits`.
pub fn select_group(
    splits: usize,
    group: usize,
    tests: &[ResolvedTest],
    durations: &HashMap<String, f64>,
) -> Option<TestGroup> {
    let mut groups = split(splits, tests, durations);
    if group == 0 || group > groups.len() {
        return None;
    }
    let chosen = groups.swap_remove(group - 1);
    tracing::info!(
        "Shard {}/{}: {} tests, estimated {:.1}s",
        group,
        splits,
        chosen.selected.len(),
        chosen.duration
    );
    Some(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TestSpec;
    use std::path::PathBuf;

    fn test(id: &str) -> ResolvedTest {
        let path = PathBuf::from(format!("/root/{id}.py"));
        let mut t = ResolvedTest::new(path.clone(), path, TestSpec::default());
        t.id = id.to_string();
        t.name = format!("{id}.py");
        t
    }

    fn ids(tests: &[ResolvedTest]) -> Vec<&str> {
        tests.iter().map(|t| t.id.as_str()).collect()
    }

    fn history(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_greedy_assignment() {
        let tests = vec![test("a"), test("b"), test("c")];
        let groups = split(2, &tests, &history(&[("a", 5.0), ("b", 3.0), ("c", 1.0)]));

        assert_eq!(ids(&groups[0].selected), vec!["a"]);
        assert_eq!(ids(&groups[1].selected), vec!["b", "c"]);
        assert_eq!(groups[0].duration, 5.0);
        assert_eq!(groups[1].duration, 4.0);
        assert_eq!(ids(&groups[1].deselected), vec!["a"]);
    }

    #[test]
    fn test_selected_keep_input_order() {
        let tests = vec![test("c"), test("b"), test("a"), test("d")];
        let groups = split(2, &tests, &history(&[("a", 8.0), ("b", 1.0), ("c", 2.0), ("d", 4.0)]));

        // a → g1, d → g2, c → g2, b → g2 (4+2=6 < 8)
        assert_eq!(ids(&groups[0].selected), vec!["a"]);
        assert_eq!(ids(&groups[1].selected), vec!["c", "b", "d"]);
    }

    #[test]
    fn test_fallback_is_mean_of_relevant_history() {
        let tests = vec![test("a"), test("b"), test("new")];
        let estimates = estimate_durations(
            &tests,
            &history(&[("a", 2.0), ("b", 4.0), ("unrelated", 100.0)]),
        );
        assert_eq!(estimates, vec![2.0, 4.0, 3.0]);
    }

    #[test]
    fn test_fallback_counts_each_entry_once() {
        let tests = vec![test("a"), test("a"), test("b"), test("new")];
        let estimates = estimate_durations(&tests, &history(&[("a", 2.0), ("b", 8.0)]));
        assert_eq!(estimates, vec![2.0, 2.0, 8.0, 5.0]);
    }

    #[test]
    fn test_no_history_uses_placeholder() {
        let tests = vec![test("b"), test("a"), test("c"), test("d")];
        let estimates = estimate_durations(&tests, &HashMap::new());
        assert_eq!(estimates, vec![DEFAULT_DURATION; 4]);

        // Equal estimates are dealt round-robin in name order.
        let groups = split(2, &tests, &HashMap::new());
        assert_eq!(ids(&groups[0].selected), vec!["a", "c"]);
        assert_eq!(ids(&groups[1].selected), vec!["b", "d"]);
    }

    #[test]
    fn test_every_test_in_exactly_one_group() {
        let tests: Vec<_> = (0..17).map(|i| test(&format!("t{i}"))).collect();
        let groups = split(4, &tests, &history(&[("t3", 9.0), ("t11", 0.5)]));
        let total: usize = groups.iter().map(|g| g.selected.len()).sum();
        assert_eq!(total, tests.len());
        for g in &groups {
            assert_eq!(g.selected.len() + g.deselected.len(), tests.len());
        }
    }

    #[test]
    fn test_same_inputs_same_assignment() {
        let tests: Vec<_> = (0..9).map(|i| test(&format!("t{i}"))).collect();
        let durations = history(&[("t1", 3.0), ("t2", 3.0), ("t5", 7.5)]);
        let first = split(3, &tests, &durations);
        let second = split(3, &tests, &durations);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(ids(&a.selected), ids(&b.selected));
        }
    }

    #[test]
    fn test_select_group_bounds() {
        let tests = vec![test("a"), test("b")];
        assert!(select_group(2, 0, &tests, &HashMap::new()).is_none());
        assert!(select_group(2, 3, &tests, &HashMap::new()).is_none());
        assert_eq!(select_group(2, 2, &tests, &HashMap::new()).unwrap().selected.len(), 1);
    }
}
