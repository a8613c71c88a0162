//! Aggregation of failures from multi-step cleanup.
//!
//! Cleanup sequences (session exit, registry disposal) attempt every step even
//! when an earlier one failed. Failures are collected here and surfaced as a
//! single error instead of being swallowed.

use std::fmt;

/// One failed cleanup step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    /// Which step failed (e.g. `"commit"`, `"release"`, a scope key)
    pub step: String,
    /// Rendered error
    pub message: String,
}

/// Every failure collected during one cleanup sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupErrors {
    failures: Vec<CleanupFailure>,
}

impl CleanupErrors {
    /// Start an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed step.
    pub fn push(&mut self, step: impl Into<String>, error: &impl fmt::Display) {
        self.failures.push(CleanupFailure {
            step: step.into(),
            message: error.to_string(),
        });
    }

    /// Record the error of `result`, if any.
    pub fn record<E: fmt::Display>(&mut self, step: &str, result: Result<(), E>) {
        if let Err(error) = result {
            self.push(step, &error);
        }
    }

    /// Append every failure of `other`.
    pub fn extend(&mut self, other: Self) {
        self.failures.extend(other.failures);
    }

    /// Whether every step succeeded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failed steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// The failed steps, in the order they ran.
    #[must_use]
    pub fn failures(&self) -> &[CleanupFailure] {
        &self.failures
    }

    /// `Ok(())` if nothing failed, otherwise `Err(self)`.
    ///
    /// # Errors
    ///
    /// Returns `self` when at least one failure was recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CleanupErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, failure) in self.failures.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.step, failure.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for CleanupErrors {}
