//! Per-record lifecycle and run reporting.
//!
//! ```text
//! Pending -> Prepared -> StagingVerified -> Pushed -> TargetVerified -> Published
//!    \__________\_____________\_______________\____________\____> Failed(reason)
//! ```
//!
//! The on-disk stage directory stays the durable state; [`RecordState`]
//! tracks where a record got to within one invocation and guards the
//! order of the steps.

use std::fmt;

use serde::Serialize;
use sigstage_record::BatchId;

use crate::error::PipelineError;

/// Where a record is within the current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum RecordState {
    /// Not yet signed in this run.
    Pending,
    /// Signed; not yet verified.
    Prepared,
    /// Verified against the staging registry.
    StagingVerified,
    /// Pushed to the target repository.
    Pushed,
    /// Verified against the target repository.
    TargetVerified,
    /// Moved into the published stage root.
    Published,
    /// Terminal failure for this record only.
    Failed(String),
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Prepared => "prepared",
            Self::StagingVerified => "staging_verified",
            Self::Pushed => "pushed",
            Self::TargetVerified => "target_verified",
            Self::Published => "published",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Reason of a failed record.
    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    fn allows(&self, next: &RecordState) -> bool {
        use RecordState::*;
        matches!(
            (self, next),
            (Pending, Prepared)
                | (Prepared, StagingVerified)
                | (StagingVerified, Pushed)
                | (Pushed, TargetVerified)
                | (TargetVerified, Published)
        )
    }

    /// Move to `next`, rejecting steps taken out of order.
    pub fn advance(&mut self, next: RecordState) -> Result<(), PipelineError> {
        if !self.allows(&next) {
            return Err(PipelineError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Enter the terminal failure state. Has no effect once published.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if *self != Self::Published {
            *self = Self::Failed(reason.into());
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Which pipeline phase produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Prepare,
    Verify,
    Publish,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prepare => "prepare",
            Self::Verify => "verify",
            Self::Publish => "publish",
        })
    }
}

/// Final result for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub image: String,
    pub batch: Option<BatchId>,
    pub state: RecordState,
    /// A complete record from an earlier run was kept as-is.
    pub reused: bool,
    /// The repository's `latest` tag now points at this image.
    pub tagged_latest: bool,
}

impl RecordOutcome {
    pub fn new(image: impl ToString, batch: Option<BatchId>, state: RecordState) -> Self {
        Self {
            image: image.to_string(),
            batch,
            state,
            reused: false,
            tagged_latest: false,
        }
    }
}

/// Outcomes of one run, in processing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub operation: Operation,
    pub outcomes: Vec<RecordOutcome>,
}

impl RunReport {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            outcomes: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: RecordOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.state.is_failed()).count()
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.len() - self.failed_count()
    }

    /// True when no record failed.
    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn outcome(&self, image: &str) -> Option<&RecordOutcome> {
        self.outcomes.iter().find(|o| o.image == image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn full_publish_path_is_allowed() {
        let mut state = RecordState::Pending;
        for next in [
            RecordState::Prepared,
            RecordState::StagingVerified,
            RecordState::Pushed,
            RecordState::TargetVerified,
            RecordState::Published,
        ] {
            state.advance(next).unwrap();
        }
        assert_eq!(state, RecordState::Published);
    }

    #[rstest]
    #[case(RecordState::Prepared, RecordState::Pushed)]
    #[case(RecordState::StagingVerified, RecordState::Published)]
    #[case(RecordState::Pushed, RecordState::Published)]
    #[case(RecordState::Published, RecordState::Pending)]
    fn skipping_a_step_is_rejected(#[case] mut from: RecordState, #[case] to: RecordState) {
        let err = from.clone().advance(to).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert!(from.advance(RecordState::Failed("x".into())).is_err());
    }

    #[test]
    fn failure_is_terminal() {
        let mut state = RecordState::Pushed;
        state.fail("target verification failed");
        assert_eq!(state.failure(), Some("target verification failed"));
        assert!(state.advance(RecordState::TargetVerified).is_err());
    }

    #[test]
    fn report_counts_failures() {
        let mut report = RunReport::new(Operation::Publish);
        report.push(RecordOutcome::new("a", None, RecordState::Published));
        report.push(RecordOutcome::new("b", None, RecordState::Failed("boom".into())));
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.succeeded_count(), 1);
        assert!(!report.is_success());
    }

    #[test]
    fn state_serializes_with_reason() {
        let json = serde_json::to_value(RecordState::Failed("boom".into())).unwrap();
        assert_eq!(json, serde_json::json!({"status": "failed", "reason": "boom"}));
        let json = serde_json::to_value(RecordState::Published).unwrap();
        assert_eq!(json, serde_json::json!({"status": "published"}));
    }
}
