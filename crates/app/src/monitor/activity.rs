//! Detection activity tracking and the one-shot recognition trigger.

use std::time::{Duration, Instant};

/// Change in activity caused by one detection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActivityChange {
    Started,
    Ended,
    Unchanged,
}

/// Hysteresis over per-frame detection results.
///
/// Activity starts on the first non-empty result and only ends once no face
/// has been seen for longer than the quiet period, so single-frame gaps do
/// not restart the sustain timer.
#[derive(Debug)]
pub(crate) struct DetectionActivity {
    quiet: Duration,
    sustain: Duration,
    active_since: Option<Instant>,
    last_seen: Option<Instant>,
    recognition_pending: bool,
}

impl DetectionActivity {
    pub(crate) fn new(quiet: Duration, sustain: Duration) -> Self {
        Self {
            quiet,
            sustain,
            active_since: None,
            last_seen: None,
            recognition_pending: false,
        }
    }

    pub(crate) fn observe(&mut self, has_faces: bool, now: Instant) -> ActivityChange {
        if has_faces {
            self.last_seen = Some(now);
            if self.active_since.is_none() {
                self.active_since = Some(now);
                return ActivityChange::Started;
            }
            return ActivityChange::Unchanged;
        }

        match (self.active_since, self.last_seen) {
            (Some(_), Some(seen)) if now.saturating_duration_since(seen) > self.quiet => {
                self.active_since = None;
                ActivityChange::Ended
            }
            _ => ActivityChange::Unchanged,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    #[cfg(test)]
    pub(crate) fn active_since(&self) -> Option<Instant> {
        self.active_since
    }

    pub(crate) fn active_for(&self, now: Instant) -> Option<Duration> {
        self.active_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// Whether activity has lasted at least the sustain threshold.
    pub(crate) fn is_sustained(&self, now: Instant) -> bool {
        self.active_for(now)
            .is_some_and(|active_for| active_for >= self.sustain)
    }

    /// Returns `true` exactly once per pending cycle: when activity is
    /// sustained and no recognition request is outstanding. The caller must
    /// then issue the request.
    pub(crate) fn take_recognition_trigger(&mut self, now: Instant) -> bool {
        if self.recognition_pending || !self.is_sustained(now) {
            return false;
        }
        self.recognition_pending = true;
        true
    }

    pub(crate) fn recognition_pending(&self) -> bool {
        self.recognition_pending
    }

    /// Any recognizer message ends the pending request.
    pub(crate) fn recognition_finished(&mut self) {
        self.recognition_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(base: Instant, offset: u64) -> Instant {
        base + Duration::from_millis(offset)
    }

    fn activity() -> DetectionActivity {
        DetectionActivity::new(Duration::from_millis(300), Duration::from_millis(2_000))
    }

    #[test]
    fn short_gap_keeps_activation_time() {
        let t0 = Instant::now();
        let mut activity = activity();
        assert_eq!(activity.observe(true, t0), ActivityChange::Started);
        assert_eq!(activity.observe(true, ms(t0, 100)), ActivityChange::Unchanged);
        // Single empty frame inside the quiet period.
        assert_eq!(activity.observe(false, ms(t0, 200)), ActivityChange::Unchanged);
        assert_eq!(activity.observe(true, ms(t0, 300)), ActivityChange::Unchanged);
        assert_eq!(activity.active_since(), Some(t0));
    }

    #[test]
    fn ends_after_quiet_period() {
        let t0 = Instant::now();
        let mut activity = activity();
        activity.observe(true, t0);
        assert_eq!(activity.observe(false, ms(t0, 300)), ActivityChange::Unchanged);
        assert_eq!(activity.observe(false, ms(t0, 301)), ActivityChange::Ended);
        assert!(!activity.is_active());
        assert_eq!(activity.observe(true, ms(t0, 400)), ActivityChange::Started);
        assert_eq!(activity.active_since(), Some(ms(t0, 400)));
    }

    #[test]
    fn recognition_triggers_once_until_result() {
        let t0 = Instant::now();
        let mut activity = activity();
        activity.observe(true, t0);
        assert!(!activity.take_recognition_trigger(ms(t0, 1_999)));
        assert!(activity.take_recognition_trigger(ms(t0, 2_000)));
        assert!(!activity.take_recognition_trigger(ms(t0, 2_100)));
        assert!(activity.recognition_pending());

        activity.recognition_finished();
        assert!(activity.take_recognition_trigger(ms(t0, 2_200)));
    }

    #[test]
    fn inactive_never_triggers() {
        let mut activity = activity();
        assert!(!activity.take_recognition_trigger(Instant::now()));
        assert!(activity.active_for(Instant::now()).is_none());
    }
}
