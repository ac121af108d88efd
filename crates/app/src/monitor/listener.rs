//! Engine callbacks: debounce detections and outcomes, then hand owned
//! payloads to the send queue.
//!
//! Both callbacks run on the engine thread. Activity, stability and cooldown
//! state is owned by the listener and never shared, so none of it is locked.

use std::{sync::Arc, time::Instant};

use face_core::{
    DetectionResult, RecognitionControl, RecognitionMessage, RecognitionOutcome, ResultListener,
};
use frame_cap::FrameSource;
use offload::{BufferPool, NetSender};
use tracing::{debug, info, warn};

use crate::monitor::{
    activity::{ActivityChange, DetectionActivity},
    config::{PeerConfig, SendSettings, TimingConfig},
    snapshot::{SnapshotGate, capture_snapshot},
    stability::StabilityTracker,
};

pub(crate) struct MonitorListener {
    peer: Option<PeerConfig>,
    jpeg_quality: u8,
    caption: String,
    downscale: bool,
    activity: DetectionActivity,
    stability: StabilityTracker,
    snapshots: SnapshotGate,
    snapshots_enabled: bool,
    sender: Arc<NetSender>,
    frames: Arc<dyn FrameSource>,
    control: Arc<dyn RecognitionControl>,
    pool: BufferPool,
}

impl MonitorListener {
    pub(crate) fn new(
        timing: &TimingConfig,
        settings: &SendSettings,
        peer: Option<PeerConfig>,
        sender: Arc<NetSender>,
        frames: Arc<dyn FrameSource>,
        control: Arc<dyn RecognitionControl>,
        pool: BufferPool,
    ) -> Self {
        Self {
            peer,
            jpeg_quality: settings.jpeg_quality,
            caption: settings.caption.clone(),
            downscale: settings.downscale,
            activity: DetectionActivity::new(timing.quiet, timing.sustain),
            stability: StabilityTracker::new(timing.dwell, timing.resend),
            snapshots: SnapshotGate::new(timing.snapshot_cooldown),
            snapshots_enabled: true,
            sender,
            frames,
            control,
            pool,
        }
    }

    /// Stop queueing motion snapshots, used when no image sink is configured.
    pub(crate) fn without_snapshots(mut self) -> Self {
        self.snapshots_enabled = false;
        self
    }

    pub(crate) fn handle_detection(&mut self, result: &DetectionResult, now: Instant) {
        let active_for = self.activity.active_for(now);
        match self.activity.observe(!result.is_empty(), now) {
            ActivityChange::Started => info!(faces = result.len(), "face activity started"),
            ActivityChange::Ended => {
                info!(
                    active_ms = active_for.map_or(0, |d| d.as_millis() as u64),
                    "face activity ended"
                );
                self.stability.reset();
            }
            ActivityChange::Unchanged => {}
        }
        if !self.activity.is_active() {
            return;
        }

        // The snapshot decision sees the state before this callback's trigger.
        self.maybe_snapshot(now);

        if self.activity.take_recognition_trigger(now) {
            debug!("activity sustained, requesting recognition");
            self.control.request_recognize();
        }
    }

    pub(crate) fn handle_recognition(&mut self, text: &str, now: Instant) {
        self.activity.recognition_finished();
        let Some(outcome) = RecognitionMessage::parse(text).outcome() else {
            info!(message = text, "recognizer message");
            return;
        };
        debug!(%outcome, "recognition outcome");
        match self.stability.observe(outcome, now) {
            Some(stable) => self.report(stable),
            None => debug!(phase = ?self.stability.phase(), "outcome not reported yet"),
        }
    }

    fn maybe_snapshot(&mut self, now: Instant) {
        if !self.snapshots_enabled {
            return;
        }
        if self.activity.recognition_pending() || self.control.is_recognition_active() {
            return;
        }
        if !self.activity.is_sustained(now) || !self.snapshots.cooled_down(now) {
            return;
        }

        let snapshot = match capture_snapshot(self.frames.as_ref(), &self.pool, self.downscale) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!("no frame buffered, skipping snapshot");
                return;
            }
            Err(err) => {
                warn!(error = %err, "snapshot copy failed");
                return;
            }
        };

        let caption = format!(
            "{} at {}",
            self.caption,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let (width, height) = (snapshot.width, snapshot.height);
        match self.sender.enqueue_image_send(
            snapshot.pixels,
            width,
            height,
            snapshot.format,
            self.jpeg_quality,
            &caption,
        ) {
            Ok(()) => {
                self.snapshots.mark_sent(now);
                info!(width, height, "motion snapshot queued");
            }
            Err(rejected) => {
                warn!(reason = %rejected.reason, "motion snapshot dropped");
            }
        }
    }

    fn report(&self, outcome: RecognitionOutcome) {
        let body = outcome.status_body();
        let Some(peer) = self.peer.as_ref() else {
            info!(%body, "status report (no peer configured)");
            return;
        };
        match self
            .sender
            .enqueue_plain_post(&peer.host, peer.port, &peer.path, body.as_bytes())
        {
            Ok(()) => info!(%body, "status report queued"),
            Err(err) => warn!(%body, error = %err, "status report dropped"),
        }
    }
}

impl ResultListener for MonitorListener {
    fn on_detection(&mut self, result: &DetectionResult) {
        self.handle_detection(result, Instant::now());
    }

    fn on_recognition(&mut self, text: &str) {
        self.handle_recognition(text, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    use face_core::Detection;
    use frame_cap::{FrameGeometry, FrameRing, PixelFormat};
    use offload::{
        Coordinator, RetryPolicy, SendBackend, SenderConfig, Transport, TransportError,
    };

    use super::*;

    #[derive(Default)]
    struct StubControl {
        requests: AtomicUsize,
        active: AtomicBool,
    }

    impl RecognitionControl for StubControl {
        fn request_recognize(&self) {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn request_enroll(&self) {}

        fn request_clear_all(&self) {}

        fn is_recognition_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    struct RecordingTransport {
        bodies: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Transport for RecordingTransport {
        fn post_plain_text(
            &mut self,
            url: &str,
            body: &[u8],
            _timeout: Duration,
        ) -> Result<u16, TransportError> {
            self.bodies
                .lock()
                .unwrap()
                .push((url.to_string(), String::from_utf8_lossy(body).into_owned()));
            Ok(200)
        }
    }

    struct Fixture {
        listener: MonitorListener,
        sender: Arc<NetSender>,
        control: Arc<StubControl>,
        bodies: Arc<Mutex<Vec<(String, String)>>>,
        ring: Arc<FrameRing>,
    }

    fn fixture() -> Fixture {
        let geometry = FrameGeometry::new(4, 4, PixelFormat::Rgb565);
        let ring = Arc::new(FrameRing::new(geometry, 2));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let sender = Arc::new(NetSender::new(
            SenderConfig {
                lazy_start: false,
                retry: RetryPolicy::none(),
                item_yield: Duration::ZERO,
                ..SenderConfig::default()
            },
            SendBackend {
                transport: Box::new(RecordingTransport {
                    bodies: bodies.clone(),
                }),
                sinks: Vec::new(),
            },
            Arc::new(Coordinator::new()),
        ));
        let control = Arc::new(StubControl::default());
        let settings = SendSettings {
            queue_capacity: 6,
            preferred_core: 1,
            plain_timeout: Duration::from_secs(8),
            sink_timeout: Duration::from_secs(30),
            retry: RetryPolicy::none(),
            jpeg_quality: 80,
            caption: "Motion detected".into(),
            downscale: false,
            pool_buffers: 1,
        };
        let listener = MonitorListener::new(
            &TimingConfig::default(),
            &settings,
            Some(PeerConfig {
                host: "peer.local".into(),
                port: 8080,
                path: "status".into(),
            }),
            sender.clone(),
            ring.clone(),
            control.clone(),
            BufferPool::new(geometry.frame_len(), 1).unwrap(),
        );
        Fixture {
            listener,
            sender,
            control,
            bodies,
            ring,
        }
    }

    fn faces(n: usize) -> DetectionResult {
        let detections = (0..n)
            .map(|_| Detection {
                bbox_xywh: [10.0, 10.0, 40.0, 40.0],
                score: 0.9,
            })
            .collect();
        DetectionResult::new(0, detections)
    }

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    fn drain(fx: &Fixture, count: u64) -> Vec<(String, String)> {
        fx.sender.start(1).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while fx.sender.stats().processed < count {
            assert!(Instant::now() < deadline, "worker did not drain in time");
            thread::sleep(Duration::from_millis(5));
        }
        fx.bodies.lock().unwrap().clone()
    }

    #[test]
    fn known_face_stable_for_dwell_posts_authorized() {
        let mut fx = fixture();
        let t0 = Instant::now();
        fx.listener.handle_recognition("id: 3, sim: 0.87", t0);
        fx.listener.handle_recognition("id: 3, sim: 0.87", at(t0, 500));
        assert_eq!(fx.sender.queue_depth(), 0);
        fx.listener.handle_recognition("id: 3, sim: 0.87", at(t0, 1_000));

        let bodies = drain(&fx, 1);
        assert_eq!(
            bodies,
            vec![(
                "http://peer.local:8080/status".to_string(),
                "authorized,0.87".to_string()
            )]
        );
    }

    #[test]
    fn unknown_face_stable_for_dwell_posts_denied() {
        let mut fx = fixture();
        let t0 = Instant::now();
        fx.listener.handle_recognition("who?", t0);
        fx.listener.handle_recognition("who?", at(t0, 1_000));
        let bodies = drain(&fx, 1);
        assert_eq!(bodies[0].1, "denied,0");
    }

    #[test]
    fn sustained_activity_requests_recognition_once() {
        let mut fx = fixture();
        let t0 = Instant::now();
        for step in 0..=25 {
            fx.listener.handle_detection(&faces(1), at(t0, step * 100));
        }
        assert_eq!(fx.control.requests.load(Ordering::SeqCst), 1);

        // Housekeeping text still ends the pending request.
        fx.listener.handle_recognition("id: 1 enrolled.", at(t0, 2_550));
        fx.listener.handle_detection(&faces(1), at(t0, 2_600));
        assert_eq!(fx.control.requests.load(Ordering::SeqCst), 2);
        assert_eq!(fx.sender.queue_depth(), 0, "no status report for housekeeping");
    }

    #[test]
    fn snapshot_queued_once_per_cooldown() {
        let mut fx = fixture();
        let t0 = Instant::now();
        fx.ring.push(vec![0x42; 32], 0).unwrap();

        fx.listener.handle_detection(&faces(1), t0);
        fx.listener.handle_detection(&faces(1), at(t0, 1_000));
        assert_eq!(fx.sender.queue_depth(), 0, "not sustained yet");

        fx.listener.handle_detection(&faces(1), at(t0, 2_000));
        assert_eq!(fx.sender.queue_depth(), 1);
        assert_eq!(fx.listener.snapshots.last_sent(), Some(at(t0, 2_000)));

        // Recognition result arrives, activity continues inside the cooldown.
        fx.listener.handle_recognition("who?", at(t0, 2_100));
        fx.listener.handle_detection(&faces(1), at(t0, 2_200));
        assert_eq!(fx.sender.queue_depth(), 1);
    }

    #[test]
    fn no_snapshot_while_engine_recognizing() {
        let mut fx = fixture();
        let t0 = Instant::now();
        fx.ring.push(vec![0x42; 32], 0).unwrap();
        fx.control.active.store(true, Ordering::SeqCst);

        fx.listener.handle_detection(&faces(2), t0);
        fx.listener.handle_detection(&faces(2), at(t0, 2_500));
        assert_eq!(fx.sender.queue_depth(), 0);
        assert!(fx.listener.snapshots.last_sent().is_none());
    }

    #[test]
    fn rejected_snapshot_keeps_cooldown_open() {
        let mut fx = fixture();
        let t0 = Instant::now();
        fx.ring.push(vec![0x42; 32], 0).unwrap();
        for _ in 0..fx.sender.capacity() {
            fx.sender
                .enqueue_plain_post("peer.local", 80, "/fill", b"denied,0")
                .unwrap();
        }

        fx.listener.handle_detection(&faces(1), t0);
        fx.listener.handle_detection(&faces(1), at(t0, 2_000));
        assert!(fx.listener.snapshots.last_sent().is_none());
    }

    #[test]
    fn new_activity_session_needs_fresh_dwell() {
        let mut fx = fixture();
        let t0 = Instant::now();
        fx.listener.handle_detection(&faces(1), t0);
        fx.listener.handle_recognition("id: 3, sim: 0.87", t0);
        fx.listener.handle_recognition("id: 3, sim: 0.87", at(t0, 1_000));
        assert_eq!(fx.sender.queue_depth(), 1);

        fx.listener.handle_detection(&faces(0), at(t0, 2_000));
        fx.listener.handle_detection(&faces(0), at(t0, 30_000));
        assert!(!fx.listener.activity.is_active());

        // Same subject in a later session, well past the resend interval.
        fx.listener.handle_detection(&faces(1), at(t0, 60_000));
        fx.listener.handle_recognition("id: 3, sim: 0.51", at(t0, 60_000));
        assert_eq!(fx.sender.queue_depth(), 1);

        fx.listener.handle_recognition("id: 3, sim: 0.51", at(t0, 61_000));
        let bodies = drain(&fx, 2);
        assert_eq!(bodies[1].1, "authorized,0.51");
    }
}
