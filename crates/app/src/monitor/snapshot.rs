//! Motion snapshot rate limiting and frame copy-out.

use std::time::{Duration, Instant};

use frame_cap::{FrameSource, FrameView, PixelFormat, rgb565};
use offload::{AllocError, BufferPool, PixelBuffer};

/// Cooldown between motion snapshots. Only successful enqueues count.
#[derive(Debug)]
pub(crate) struct SnapshotGate {
    cooldown: Duration,
    last_sent: Option<Instant>,
}

impl SnapshotGate {
    pub(crate) fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: None,
        }
    }

    pub(crate) fn cooled_down(&self, now: Instant) -> bool {
        self.last_sent
            .is_none_or(|last| now.saturating_duration_since(last) > self.cooldown)
    }

    pub(crate) fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    #[cfg(test)]
    pub(crate) fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }
}

/// Owned copy of the live frame, ready to hand to the send queue.
pub(crate) struct Snapshot {
    pub(crate) pixels: PixelBuffer,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: PixelFormat,
}

/// Copy the newest frame out of `source`, optionally halving RGB565 frames.
///
/// Returns `Ok(None)` when no frame is buffered yet.
pub(crate) fn capture_snapshot(
    source: &dyn FrameSource,
    pool: &BufferPool,
    downscale: bool,
) -> Result<Option<Snapshot>, AllocError> {
    let mut copied = None;
    source.peek_latest(0, &mut |view| copied = Some(copy_view(view, pool, downscale)));
    copied.transpose()
}

fn copy_view(view: FrameView<'_>, pool: &BufferPool, downscale: bool) -> Result<Snapshot, AllocError> {
    if downscale && view.format == PixelFormat::Rgb565 {
        let mut pixels = pool.acquire(rgb565::half_len(view.width, view.height))?;
        if let Some((width, height)) =
            rgb565::downscale_half_into(view.data, view.width, view.height, &mut pixels)
        {
            return Ok(Snapshot {
                pixels,
                width,
                height,
                format: view.format,
            });
        }
    }
    Ok(Snapshot {
        pixels: pool.copy_from(view.data)?,
        width: view.width,
        height: view.height,
        format: view.format,
    })
}

#[cfg(test)]
mod tests {
    use frame_cap::{FrameGeometry, FrameRing};

    use super::*;

    #[test]
    fn cooldown_allows_first_snapshot() {
        let t0 = Instant::now();
        let mut gate = SnapshotGate::new(Duration::from_secs(20));
        assert!(gate.cooled_down(t0));
        gate.mark_sent(t0);
        assert!(!gate.cooled_down(t0 + Duration::from_secs(20)));
        assert!(gate.cooled_down(t0 + Duration::from_millis(20_001)));
    }

    #[test]
    fn copies_latest_frame_into_pool() {
        let geometry = FrameGeometry::new(4, 2, PixelFormat::Rgb565);
        let ring = FrameRing::new(geometry, 2);
        let pool = BufferPool::new(geometry.frame_len(), 1).unwrap();
        assert!(capture_snapshot(&ring, &pool, false).unwrap().is_none());

        ring.push(vec![1; geometry.frame_len()], 0).unwrap();
        ring.push(vec![2; geometry.frame_len()], 1).unwrap();
        let snapshot = capture_snapshot(&ring, &pool, false).unwrap().unwrap();
        assert!(snapshot.pixels.is_pooled());
        assert!(snapshot.pixels.iter().all(|&b| b == 2));
        assert_eq!((snapshot.width, snapshot.height), (4, 2));
    }

    #[test]
    fn downscale_halves_dimensions() {
        let geometry = FrameGeometry::new(4, 4, PixelFormat::Rgb565);
        let ring = FrameRing::new(geometry, 1);
        let pool = BufferPool::new(geometry.frame_len(), 1).unwrap();
        ring.push(vec![9; geometry.frame_len()], 0).unwrap();

        let snapshot = capture_snapshot(&ring, &pool, true).unwrap().unwrap();
        assert_eq!((snapshot.width, snapshot.height), (2, 2));
        assert_eq!(snapshot.pixels.len(), rgb565::half_len(4, 4));
    }
}
