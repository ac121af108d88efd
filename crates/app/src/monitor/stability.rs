//! Debouncing of recognition outcomes into status reports.
//!
//! An outcome is reported once it has persisted for the dwell time and then
//! at most once per resend interval while it stays the same. Any change of
//! subject restarts the dwell timer and the report schedule, and so does
//! the end of face activity.

use std::time::{Duration, Instant};

use face_core::RecognitionOutcome;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum StabilityPhase {
    Unseeded,
    Stabilizing {
        outcome: RecognitionOutcome,
        since: Instant,
    },
    Confirmed {
        outcome: RecognitionOutcome,
        since: Instant,
        last_report: Instant,
    },
}

#[derive(Debug)]
pub(crate) struct StabilityTracker {
    dwell: Duration,
    resend: Duration,
    phase: StabilityPhase,
}

impl StabilityTracker {
    pub(crate) fn new(dwell: Duration, resend: Duration) -> Self {
        Self {
            dwell,
            resend,
            phase: StabilityPhase::Unseeded,
        }
    }

    pub(crate) fn phase(&self) -> StabilityPhase {
        self.phase
    }

    /// Forget the tracked outcome. The next outcome starts a fresh dwell.
    pub(crate) fn reset(&mut self) {
        self.phase = StabilityPhase::Unseeded;
    }

    /// Feed one outcome. Returns the outcome to report, if a report is due.
    pub(crate) fn observe(
        &mut self,
        outcome: RecognitionOutcome,
        now: Instant,
    ) -> Option<RecognitionOutcome> {
        let (since, last_report) = match self.phase {
            StabilityPhase::Stabilizing {
                outcome: tracked,
                since,
            } if tracked.same_subject(&outcome) => (since, None),
            StabilityPhase::Confirmed {
                outcome: tracked,
                since,
                last_report,
            } if tracked.same_subject(&outcome) => (since, Some(last_report)),
            _ => {
                self.phase = StabilityPhase::Stabilizing {
                    outcome,
                    since: now,
                };
                return None;
            }
        };

        if now.saturating_duration_since(since) < self.dwell {
            self.phase = StabilityPhase::Stabilizing { outcome, since };
            return None;
        }

        let due = last_report
            .is_none_or(|last| now.saturating_duration_since(last) >= self.resend);
        if !due {
            return None;
        }
        self.phase = StabilityPhase::Confirmed {
            outcome,
            since,
            last_report: now,
        };
        Some(outcome)
    }
}
