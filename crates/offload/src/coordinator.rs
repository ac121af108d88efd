//! Cross-worker signals between the send worker and the display worker.
//!
//! The send worker raises `sending` for the span of each blocking network
//! transaction; the display worker only reads it. This is a throttle, not a
//! lock: a send may begin while a refresh is already mid-flight.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

const NEVER: u64 = u64::MAX;

/// What the display worker may do with the shared bus right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// A network transaction is in flight.
    Sending,
    /// The last transaction ended less than the cooldown window ago.
    CoolingDown,
    Free,
}

#[derive(Debug)]
pub struct Coordinator {
    epoch: Instant,
    sending: AtomicBool,
    send_cleared_at_ms: AtomicU64,
    streaming: AtomicBool,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            sending: AtomicBool::new(false),
            send_cleared_at_ms: AtomicU64::new(NEVER),
            streaming: AtomicBool::new(false),
        }
    }

    /// Mark a transaction as in flight until the guard drops.
    pub fn begin_send(&self) -> SendGuard<'_> {
        self.sending.store(true, Ordering::Release);
        metrics::gauge!("facewatch_sending").set(1.0);
        SendGuard { coordinator: self }
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    /// Time the flag last cleared, if it ever did.
    pub fn send_cleared_at(&self) -> Option<Instant> {
        match self.send_cleared_at_ms.load(Ordering::Acquire) {
            NEVER => None,
            ms => Some(self.epoch + Duration::from_millis(ms)),
        }
    }

    pub fn bus_state(&self, now: Instant, cooldown: Duration) -> BusState {
        if self.is_sending() {
            return BusState::Sending;
        }
        match self.send_cleared_at() {
            Some(cleared) if now.saturating_duration_since(cleared) < cooldown => {
                BusState::CoolingDown
            }
            _ => BusState::Free,
        }
    }

    pub fn set_streaming(&self, active: bool) {
        self.streaming.store(active, Ordering::Release);
    }

    /// Whether a live preview client is attached.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    fn finish_send(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        // Stamp first so a reader that sees the flag drop also sees the time.
        self.send_cleared_at_ms.store(ms, Ordering::Release);
        self.sending.store(false, Ordering::Release);
        metrics::gauge!("facewatch_sending").set(0.0);
    }
}

/// Clears the sending flag on drop, including on early return or panic.
pub struct SendGuard<'a> {
    coordinator: &'a Coordinator,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.finish_send();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_raises_and_clears_flag() {
        let coordinator = Coordinator::new();
        let cooldown = Duration::from_millis(250);
        assert_eq!(coordinator.bus_state(Instant::now(), cooldown), BusState::Free);
        assert!(coordinator.send_cleared_at().is_none());

        {
            let _guard = coordinator.begin_send();
            assert!(coordinator.is_sending());
            assert_eq!(
                coordinator.bus_state(Instant::now(), cooldown),
                BusState::Sending
            );
        }

        assert!(!coordinator.is_sending());
        let cleared = coordinator.send_cleared_at().unwrap();
        assert_eq!(coordinator.bus_state(cleared, cooldown), BusState::CoolingDown);
        assert_eq!(
            coordinator.bus_state(cleared + Duration::from_millis(249), cooldown),
            BusState::CoolingDown
        );
        assert_eq!(
            coordinator.bus_state(cleared + cooldown, cooldown),
            BusState::Free
        );
    }

    #[test]
    fn streaming_flag_round_trips() {
        let coordinator = Coordinator::new();
        coordinator.set_streaming(true);
        assert!(coordinator.is_streaming());
        coordinator.set_streaming(false);
        assert!(!coordinator.is_streaming());
    }
}
