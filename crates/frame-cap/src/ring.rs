//! Bounded ring of recently captured frames with a new-frame signal.
//!
//! Consumers never hold on to the live buffers: `peek_latest` lends a
//! [`FrameView`] to a visitor closure and anything that must outlive the
//! call has to be copied out.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::debug;

use crate::types::{CaptureError, Frame, FrameGeometry, FrameView};

/// Read-only access to the capture pipeline's most recent frames.
pub trait FrameSource: Send + Sync {
    /// Dimensions and pixel layout shared by every frame.
    fn geometry(&self) -> FrameGeometry;

    /// Lend the frame `index` slots behind the newest (0 = newest) to `visit`.
    ///
    /// Returns `false` when no frame is buffered at that position.
    fn peek_latest(&self, index: usize, visit: &mut dyn FnMut(FrameView<'_>)) -> bool;

    /// Copy a buffered frame out of the source.
    fn latest_owned(&self, index: usize) -> Option<Frame> {
        let mut out = None;
        self.peek_latest(index, &mut |view| out = Some(view.to_frame()));
        out
    }
}

pub struct FrameRing {
    geometry: FrameGeometry,
    capacity: usize,
    slots: Mutex<VecDeque<Frame>>,
    next_sequence: AtomicU64,
    subscribers: Mutex<Vec<Sender<u64>>>,
}

impl FrameRing {
    pub fn new(geometry: FrameGeometry, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            geometry,
            capacity,
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            next_sequence: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Store a freshly captured frame and signal subscribers.
    ///
    /// The oldest frame is evicted once the ring is full.
    pub fn push(&self, data: Vec<u8>, timestamp_ms: i64) -> Result<u64, CaptureError> {
        let expected = self.geometry.frame_len();
        if data.len() != expected {
            return Err(CaptureError::Size {
                expected,
                actual: data.len(),
            });
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let frame = Frame {
            data,
            width: self.geometry.width,
            height: self.geometry.height,
            format: self.geometry.format,
            timestamp_ms,
            sequence,
        };

        if let Ok(mut slots) = self.slots.lock() {
            slots.push_back(frame);
            while slots.len() > self.capacity {
                slots.pop_front();
            }
        }

        self.notify(sequence);
        Ok(sequence)
    }

    /// Subscribe to new-frame notifications.
    ///
    /// Each subscriber holds at most one pending notification, so a slow
    /// subscriber coalesces bursts into a single wake-up and should peek the
    /// newest frame rather than trust the sequence it received.
    pub fn subscribe(&self) -> Receiver<u64> {
        let (tx, rx) = bounded(1);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Sequence number of the newest buffered frame.
    pub fn latest_sequence(&self) -> Option<u64> {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.back().map(|frame| frame.sequence))
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, sequence: u64) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|tx| match tx.try_send(sequence) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => {
                debug!("dropping disconnected frame subscriber");
                false
            }
        });
    }
}

impl FrameSource for FrameRing {
    fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    fn peek_latest(&self, index: usize, visit: &mut dyn FnMut(FrameView<'_>)) -> bool {
        let Ok(slots) = self.slots.lock() else {
            return false;
        };
        if index >= slots.len() {
            return false;
        }
        let position = slots.len() - 1 - index;
        match slots.get(position) {
            Some(frame) => {
                visit(frame.view());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    fn ring(capacity: usize) -> FrameRing {
        FrameRing::new(FrameGeometry::new(2, 2, PixelFormat::Rgb565), capacity)
    }

    #[test]
    fn rejects_frames_with_wrong_length() {
        let ring = ring(2);
        let err = ring.push(vec![0; 3], 0).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Size {
                expected: 8,
                actual: 3
            }
        ));
        assert!(ring.is_empty());
    }

    #[test]
    fn peek_indexes_from_newest() {
        let ring = ring(3);
        for fill in 1..=4u8 {
            ring.push(vec![fill; 8], fill as i64).unwrap();
        }
        assert_eq!(ring.len(), 3);

        let mut seen = Vec::new();
        for index in 0..4 {
            ring.peek_latest(index, &mut |view| seen.push(view.data[0]));
        }
        assert_eq!(seen, vec![4, 3, 2]);
        assert!(!ring.peek_latest(3, &mut |_| {}));
    }

    #[test]
    fn subscribers_receive_latest_sequence() {
        let ring = ring(2);
        let rx = ring.subscribe();
        let first = ring.push(vec![0; 8], 0).unwrap();
        let _second = ring.push(vec![0; 8], 1).unwrap();

        assert_eq!(rx.try_recv().unwrap(), first);
        assert!(rx.try_recv().is_err());
        assert_eq!(ring.latest_sequence(), Some(first + 1));
    }

    #[test]
    fn owned_copy_survives_eviction() {
        let ring = ring(1);
        ring.push(vec![7; 8], 0).unwrap();
        let copy = ring.latest_owned(0).unwrap();
        ring.push(vec![9; 8], 1).unwrap();
        assert_eq!(copy.data, vec![7; 8]);
    }
}
