//! Reconciliation primitives.
//!
//! This library holds the side-effect free parts of the control plane:
//!
//! - **Fleet diff**: given the desired machines (from config) and the
//!   observed machines (from the providers), decide which names to create
//!   and which to destroy. Names are the only match key; a matching name is
//!   never resized or updated in place.
//! - **Retry budget**: the wall-clock window and fixed delay that bound the
//!   per-task scheduling loop.
//!
//! # Invariants
//!
//! - A diff applied without provider errors converges in one pass: the set
//!   of names after applying it equals the set of desired names.
//! - Decisions are deterministic given the same inputs, and preserve input
//!   order so callers can log and apply them predictably.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// The desired state names the same machine twice.
    #[error("duplicate machine name in desired state: {0}")]
    DuplicateName(String),
}

/// Result type for reconciliation helpers.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Convergence status for a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Observed names equal desired names.
    Converged,

    /// Creates or destroys are still outstanding.
    Converging,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// The minimal set of operations that converges observed toward desired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetDiff<O, D> {
    /// Observed entries with no desired counterpart.
    pub to_destroy: Vec<O>,

    /// Desired entries with no observed counterpart.
    pub to_create: Vec<D>,

    /// Observed entries whose name is desired; left untouched.
    pub unchanged: Vec<O>,
}

impl<O, D> FleetDiff<O, D> {
    /// Returns true when there is nothing to create or destroy.
    pub fn is_empty(&self) -> bool {
        self.to_destroy.is_empty() && self.to_create.is_empty()
    }

    pub fn status(&self) -> ConvergenceStatus {
        if self.is_empty() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }
}

/// Diff observed machines against desired specs, matching on name.
///
/// Fails if `desired` contains the same name twice, since the result would
/// create two machines that can never be told apart again.
pub fn diff_by_name<O, D, FO, FD>(
    observed: Vec<O>,
    desired: Vec<D>,
    observed_name: FO,
    desired_name: FD,
) -> ReconcileResult<FleetDiff<O, D>>
where
    FO: Fn(&O) -> &str,
    FD: Fn(&D) -> &str,
{
    let mut desired_names = HashSet::with_capacity(desired.len());
    for spec in &desired {
        let name = desired_name(spec);
        if !desired_names.insert(name.to_string()) {
            return Err(ReconcileError::DuplicateName(name.to_string()));
        }
    }

    let observed_names: HashSet<String> = observed
        .iter()
        .map(|o| observed_name(o).to_string())
        .collect();

    let mut to_destroy = Vec::new();
    let mut unchanged = Vec::new();
    for machine in observed {
        if desired_names.contains(observed_name(&machine)) {
            unchanged.push(machine);
        } else {
            to_destroy.push(machine);
        }
    }

    let to_create = desired
        .into_iter()
        .filter(|spec| !observed_names.contains(desired_name(spec)))
        .collect();

    Ok(FleetDiff {
        to_destroy,
        to_create,
        unchanged,
    })
}

/// Compare two name sets without computing a full diff.
pub fn convergence_status<'a, I, J>(observed: I, desired: J) -> ConvergenceStatus
where
    I: IntoIterator<Item = &'a str>,
    J: IntoIterator<Item = &'a str>,
{
    let observed: BTreeSet<&str> = observed.into_iter().collect();
    let desired: BTreeSet<&str> = desired.into_iter().collect();
    if observed == desired {
        ConvergenceStatus::Converged
    } else {
        ConvergenceStatus::Converging
    }
}

/// Wall-clock budget with a fixed delay between attempts.
///
/// The scheduler asks [`RetryBudget::next_delay`] after every failed attempt.
/// Another attempt is only allowed when the remaining budget is at least one
/// full delay, so a loop never overshoots the window by more than one
/// attempt interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Total time allowed for placement.
    pub window: Duration,

    /// Sleep between attempts.
    pub delay: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            window: DEFAULT_SCHEDULING_WINDOW,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryBudget {
    pub fn new(window: Duration, delay: Duration) -> Self {
        Self { window, delay }
    }

    /// Time left in the window after `elapsed`.
    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.window.saturating_sub(elapsed)
    }

    /// Returns the delay to sleep before the next attempt, or `None` once the
    /// remaining budget is smaller than one delay.
    pub fn next_delay(&self, elapsed: Duration) -> Option<Duration> {
        let remaining = self.remaining(elapsed);
        if remaining.is_zero() || remaining < self.delay {
            None
        } else {
            Some(self.delay)
        }
    }

    /// Upper bound on attempts the window can hold.
    pub fn max_attempts(&self) -> u32 {
        if self.delay.is_zero() {
            return 1;
        }
        let slots = self.window.as_millis() / self.delay.as_millis();
        u32::try_from(slots).unwrap_or(u32::MAX).saturating_add(1)
    }
}

/// Default placement window for a single task.
pub const DEFAULT_SCHEDULING_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default delay between placement attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default timeout for one availability probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn names<T: AsRef<str>>(items: &[T]) -> Vec<String> {
        items.iter().map(|s| s.as_ref().to_string()).collect()
    }

    #[test]
    fn test_diff_creates_and_destroys() {
        let observed = vec!["b", "c"];
        let desired = vec!["a", "b"];

        let diff = diff_by_name(observed, desired, |o| *o, |d| *d).unwrap();

        assert_eq!(names(&diff.to_destroy), vec!["c"]);
        assert_eq!(names(&diff.to_create), vec!["a"]);
        assert_eq!(names(&diff.unchanged), vec!["b"]);
        assert_eq!(diff.status(), ConvergenceStatus::Converging);
    }

    #[test]
    fn test_diff_empty_when_converged() {
        let diff = diff_by_name(vec!["a", "b"], vec!["b", "a"], |o| *o, |d| *d).unwrap();
        assert!(diff.is_empty());
        assert!(diff.status().is_converged());
    }

    #[test]
    fn test_diff_rejects_duplicate_desired_names() {
        let err = diff_by_name(Vec::<&str>::new(), vec!["a", "a"], |o| *o, |d| *d).unwrap_err();
        assert_eq!(err, ReconcileError::DuplicateName("a".to_string()));
    }

    #[test]
    fn test_diff_destroys_observed_duplicates_not_desired() {
        // Two observed machines sharing a desired name are both kept.
        let diff = diff_by_name(vec!["a", "a", "z"], vec!["a"], |o| *o, |d| *d).unwrap();
        assert_eq!(diff.unchanged.len(), 2);
        assert_eq!(names(&diff.to_destroy), vec!["z"]);
        assert!(diff.to_create.is_empty());
    }

    #[test]
    fn test_convergence_status_ignores_order() {
        assert!(convergence_status(["a", "b"], ["b", "a"]).is_converged());
        assert!(!convergence_status(["a"], ["a", "b"]).is_converged());
    }

    #[rstest]
    #[case(Duration::ZERO, Some(DEFAULT_RETRY_DELAY))]
    #[case(Duration::from_secs(290), Some(DEFAULT_RETRY_DELAY))]
    #[case(Duration::from_secs(296), None)]
    #[case(Duration::from_secs(300), None)]
    #[case(Duration::from_secs(900), None)]
    fn test_budget_next_delay(#[case] elapsed: Duration, #[case] expected: Option<Duration>) {
        let budget = RetryBudget::default();
        assert_eq!(budget.next_delay(elapsed), expected);
    }

    #[test]
    fn test_budget_max_attempts() {
        assert_eq!(RetryBudget::default().max_attempts(), 61);
        assert_eq!(
            RetryBudget::new(Duration::from_secs(1), Duration::ZERO).max_attempts(),
            1
        );
    }

    proptest! {
        #[test]
        fn prop_diff_converges_in_one_pass(
            observed in proptest::collection::vec("[a-e]", 0..8),
            desired in proptest::collection::btree_set("[a-e]", 0..5),
        ) {
            let desired: Vec<String> = desired.into_iter().collect();
            let diff = diff_by_name(
                observed.clone(),
                desired.clone(),
                |o| o.as_str(),
                |d| d.as_str(),
            ).unwrap();

            let mut after: BTreeSet<String> =
                diff.unchanged.iter().cloned().collect();
            after.extend(diff.to_create.iter().cloned());

            let expected: BTreeSet<String> = desired.into_iter().collect();
            prop_assert_eq!(after, expected);

            for gone in &diff.to_destroy {
                prop_assert!(!diff.to_create.contains(gone));
            }
        }
    }
}
