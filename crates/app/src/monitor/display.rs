//! Display refresh worker.
//!
//! The panel shares its bus with the network path, so the worker checks the
//! coordinator before every refresh: nothing is written while a send is in
//! flight or during the cooldown that follows it. Outside those windows only
//! one frame in `refresh_every` is drawn.

use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;
use frame_cap::{FrameGeometry, FrameRing, FrameSource, FrameView, PixelFormat, rgb565};
use image::ExtendedColorType;
use offload::{BusState, Coordinator};
use tracing::{debug, info, warn};

use crate::monitor::{config::DisplayConfig, telemetry};

/// Destination of canvas refreshes. `flush` is the only bus write.
pub(crate) trait DisplaySink: Send {
    fn flush(&mut self, canvas: &Canvas) -> Result<()>;
}

/// Persistent RGB565 canvas the size of the panel.
pub(crate) struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    pub(crate) fn new(geometry: FrameGeometry) -> Self {
        let panel = FrameGeometry::new(geometry.width, geometry.height, PixelFormat::Rgb565);
        Self {
            width: geometry.width,
            height: geometry.height,
            pixels: vec![0; panel.frame_len()],
        }
    }

    /// Copy `view` in when its dimensions match. Returns whether it did.
    fn copy_from(&mut self, view: FrameView<'_>) -> bool {
        if view.width != self.width
            || view.height != self.height
            || view.data.len() != self.pixels.len()
        {
            return false;
        }
        self.pixels.copy_from_slice(view.data);
        true
    }

    pub(crate) fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Mirrors the canvas into a PNG file, standing in for the LCD panel.
pub(crate) struct PngCanvasSink {
    path: PathBuf,
}

impl PngCanvasSink {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DisplaySink for PngCanvasSink {
    fn flush(&mut self, canvas: &Canvas) -> Result<()> {
        let rgb = rgb565::to_rgb888(canvas.pixels());
        image::save_buffer(
            &self.path,
            &rgb,
            canvas.width,
            canvas.height,
            ExtendedColorType::Rgb8,
        )
        .with_context(|| format!("Failed to write canvas to {}", self.path.display()))
    }
}

/// Headless panel: records refreshes in the log only.
#[derive(Default)]
pub(crate) struct LogSink {
    refreshes: u64,
}

impl DisplaySink for LogSink {
    fn flush(&mut self, canvas: &Canvas) -> Result<()> {
        self.refreshes += 1;
        debug!(
            refresh = self.refreshes,
            width = canvas.width,
            height = canvas.height,
            "display refresh"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HoldReason {
    Sending,
    Cooldown,
}

impl HoldReason {
    fn label(self) -> &'static str {
        match self {
            HoldReason::Sending => "sending",
            HoldReason::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshStep {
    /// Keep off the bus and poll again after `sleep`.
    Hold { reason: HoldReason, sleep: Duration },
    /// Frame counted but not drawn.
    Skip,
    Draw,
}

/// Per-frame refresh decision.
#[derive(Debug)]
pub(crate) struct RefreshGate {
    refresh_every: u32,
    counter: u32,
    sending_poll: Duration,
    cooldown_poll: Duration,
}

impl RefreshGate {
    pub(crate) fn new(config: &DisplayConfig) -> Self {
        Self {
            refresh_every: config.refresh_every.max(1),
            counter: 0,
            sending_poll: config.sending_poll,
            cooldown_poll: config.cooldown_poll,
        }
    }

    pub(crate) fn decide(&mut self, bus: BusState) -> RefreshStep {
        match bus {
            BusState::Sending => RefreshStep::Hold {
                reason: HoldReason::Sending,
                sleep: self.sending_poll,
            },
            BusState::CoolingDown => RefreshStep::Hold {
                reason: HoldReason::Cooldown,
                sleep: self.cooldown_poll,
            },
            BusState::Free => {
                self.counter = (self.counter + 1) % self.refresh_every;
                if self.counter == 0 {
                    RefreshStep::Draw
                } else {
                    RefreshStep::Skip
                }
            }
        }
    }
}

pub(crate) struct DisplayWorker {
    config: DisplayConfig,
    bus_cooldown: Duration,
    gate: RefreshGate,
    canvas: Canvas,
    frames: Arc<FrameRing>,
    coordinator: Arc<Coordinator>,
    sink: Box<dyn DisplaySink>,
}

impl DisplayWorker {
    pub(crate) fn new(
        config: DisplayConfig,
        bus_cooldown: Duration,
        frames: Arc<FrameRing>,
        coordinator: Arc<Coordinator>,
        sink: Box<dyn DisplaySink>,
    ) -> Self {
        Self {
            gate: RefreshGate::new(&config),
            canvas: Canvas::new(frames.geometry()),
            config,
            bus_cooldown,
            frames,
            coordinator,
            sink,
        }
    }

    /// Run one cycle for a newly signalled frame and return how long to
    /// sleep before waiting for the next one.
    pub(crate) fn cycle(&mut self, now: Instant) -> Duration {
        if self.frames.latest_sequence().is_none() {
            return self.config.first_frame_poll;
        }
        match self.gate.decide(self.coordinator.bus_state(now, self.bus_cooldown)) {
            RefreshStep::Hold { reason, sleep } => {
                metrics::counter!("facewatch_display_skipped_total", "reason" => reason.label())
                    .increment(1);
                return sleep;
            }
            RefreshStep::Skip => {}
            RefreshStep::Draw => self.draw(),
        }
        self.config.pacing
    }

    fn draw(&mut self) {
        let canvas = &mut self.canvas;
        let mut copied = false;
        self.frames
            .peek_latest(0, &mut |view| copied = canvas.copy_from(view));
        if !copied {
            debug!("frame does not match canvas, redrawing previous contents");
        }
        if let Err(err) = self.sink.flush(&self.canvas) {
            warn!("Display flush failed: {err:#}");
        }
    }

    fn run(mut self, running: Arc<AtomicBool>) {
        let _span = tracing::info_span!("display.worker").entered();
        let warmup_end = Instant::now() + self.config.warmup;
        while running.load(Ordering::Relaxed) && Instant::now() < warmup_end {
            thread::sleep(Duration::from_millis(50));
        }

        let signal = self.frames.subscribe();
        info!(
            refresh_every = self.config.refresh_every,
            "display worker running"
        );
        while running.load(Ordering::Relaxed) {
            match signal.recv_timeout(Duration::from_millis(200)) {
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let sleep = self.cycle(Instant::now());
            thread::sleep(sleep);
        }
        debug!("display worker exiting");
    }
}

pub(crate) fn spawn_display_worker(
    worker: DisplayWorker,
    running: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    telemetry::spawn_thread("display", move || worker.run(running))
}
