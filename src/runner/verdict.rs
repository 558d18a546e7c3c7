//! # Test verdicts and how they fold into a run verdict.

use std::fmt;

use crate::error::TestFailure;

/// Outcome of one test case, or of a whole run.
///
/// Discriminants start at zero so a verdict can map straight to a process
/// exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// The test ran to completion without failures.
    Passed = 0,
    /// An assertion failed (including a panicking test body).
    Failed = 1,
    /// The test raised a non-assertion error or was aborted.
    Error = 2,
    /// The test has not run yet.
    Pending = 3,
    /// Not run due to a missing, but not failing, precondition.
    Skipped = 4,
    /// Not run due to configuration.
    Ignored = 5,
}

impl Verdict {
    /// Folds two verdicts into the stricter one.
    ///
    /// `Pending` counts as `Error`: a test that never ran means the run
    /// ended abnormally. `Skipped` and `Ignored` do not degrade the
    /// result.
    #[must_use]
    pub fn combine(self, other: Verdict) -> Verdict {
        if self == Verdict::Error || other == Verdict::Error {
            return Verdict::Error;
        }
        if self == Verdict::Pending || other == Verdict::Pending {
            return Verdict::Error;
        }
        if self == Verdict::Failed || other == Verdict::Failed {
            return Verdict::Failed;
        }
        Verdict::Passed
    }

    /// Classifies a finished test body into a verdict.
    #[must_use]
    pub fn from_failure(failure: Option<&TestFailure>) -> Verdict {
        match failure {
            None => Verdict::Passed,
            Some(TestFailure::Skip { .. }) => Verdict::Skipped,
            Some(TestFailure::Disabled { .. }) => Verdict::Ignored,
            Some(TestFailure::Assertion { .. }) => Verdict::Failed,
            Some(_) => Verdict::Error,
        }
    }

    /// The verdict as a process exit code.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        self as i32
    }

    /// Uppercase name as used in logs and reports.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Verdict::Passed => "PASSED",
            Verdict::Failed => "FAILED",
            Verdict::Error => "ERROR",
            Verdict::Pending => "PENDING",
            Verdict::Skipped => "SKIPPED",
            Verdict::Ignored => "IGNORED",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
