//! Bounded send queue and its single worker thread.
//!
//! Producers never block: items are handed over with `try_send` and a full
//! queue drops the newest item, reporting it through the return value. The
//! worker owns every item it pops and drops it after the attempt, whatever
//! the outcome.

use std::{
    io, mem,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use frame_cap::PixelFormat;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    buffer::{AllocError, PixelBuffer, try_copy, try_copy_str},
    coordinator::Coordinator,
    encode::encode_jpeg,
    item::{ImageSend, PlainPost, TransferItem},
    retry::RetryPolicy,
    sinks::ImageSink,
    transport::Transport,
};

/// Why an item did not make it into the queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("send queue is full")]
    QueueFull,
    #[error("failed to allocate transfer item")]
    Alloc,
    #[error("invalid transfer item: {0}")]
    Invalid(&'static str),
    #[error("send worker unavailable")]
    WorkerUnavailable,
    #[error("send queue closed")]
    Closed,
}

impl EnqueueError {
    fn label(self) -> &'static str {
        match self {
            EnqueueError::QueueFull => "full",
            EnqueueError::Alloc => "alloc",
            EnqueueError::Invalid(_) => "invalid",
            EnqueueError::WorkerUnavailable => "unavailable",
            EnqueueError::Closed => "closed",
        }
    }
}

impl From<AllocError> for EnqueueError {
    fn from(_: AllocError) -> Self {
        EnqueueError::Alloc
    }
}

/// A rejected image enqueue. Ownership of the pixels goes back to the caller.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct Rejected {
    pub reason: EnqueueError,
    pub pixels: PixelBuffer,
}

impl Rejected {
    pub fn into_pixels(self) -> PixelBuffer {
        self.pixels
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to spawn send worker: {0}")]
    Spawn(#[from] io::Error),
    #[error("send worker failed to start earlier")]
    Unavailable,
    #[error("send worker already stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub capacity: usize,
    /// Core the worker prefers; anything but 0 or 1 falls back to 1.
    pub preferred_core: i32,
    /// Start the worker on first enqueue when `start` was never called.
    pub lazy_start: bool,
    pub plain_timeout: Duration,
    pub retry: RetryPolicy,
    /// Pause after each item so other threads get the CPU.
    pub item_yield: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            capacity: 6,
            preferred_core: 1,
            lazy_start: true,
            plain_timeout: Duration::from_secs(8),
            retry: RetryPolicy::default(),
            item_yield: Duration::from_millis(10),
        }
    }
}

/// Where the worker sends things.
pub struct SendBackend {
    pub transport: Box<dyn Transport>,
    pub sinks: Vec<Box<dyn ImageSink>>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    plain_ok: AtomicU64,
    plain_failed: AtomicU64,
    sink_ok: AtomicU64,
    sink_failed: AtomicU64,
}

/// Snapshot of queue and worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub enqueued: u64,
    pub rejected: u64,
    /// Items popped, attempted and dropped by the worker.
    pub processed: u64,
    pub plain_ok: u64,
    pub plain_failed: u64,
    /// Per-sink deliveries, counted once per sink per image.
    pub sink_ok: u64,
    pub sink_failed: u64,
}

enum WorkerState {
    Idle(Box<Dispatcher>, Receiver<TransferItem>, Receiver<()>),
    Running { handle: JoinHandle<()>, core: i32 },
    Failed,
    Stopped,
}

pub struct NetSender {
    config: SenderConfig,
    tx: Sender<TransferItem>,
    stop_tx: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
    state: Mutex<WorkerState>,
    counters: Arc<Counters>,
}

impl NetSender {
    /// Create the queue. The worker is not running until [`NetSender::start`]
    /// or, with `lazy_start`, the first enqueue.
    pub fn new(config: SenderConfig, backend: SendBackend, coordinator: Arc<Coordinator>) -> Self {
        let (tx, rx) = bounded(config.capacity.max(1));
        let (stop_tx, stop_rx) = bounded(1);
        let counters = Arc::new(Counters::default());
        let dispatcher = Dispatcher {
            backend,
            coordinator,
            plain_timeout: config.plain_timeout,
            retry: config.retry,
            item_yield: config.item_yield,
            counters: counters.clone(),
        };
        Self {
            config,
            tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            closed: AtomicBool::new(false),
            state: Mutex::new(WorkerState::Idle(Box::new(dispatcher), rx, stop_rx)),
            counters,
        }
    }

    /// Start the worker. Calling it again after a successful start is a no-op.
    pub fn start(&self, preferred_core: i32) -> Result<(), StartError> {
        let mut state = self.state.lock().map_err(|_| StartError::Unavailable)?;
        let (dispatcher, rx, stop_rx) = match mem::replace(&mut *state, WorkerState::Failed) {
            WorkerState::Idle(dispatcher, rx, stop_rx) => (dispatcher, rx, stop_rx),
            running @ WorkerState::Running { .. } => {
                *state = running;
                return Ok(());
            }
            WorkerState::Failed => return Err(StartError::Unavailable),
            WorkerState::Stopped => {
                *state = WorkerState::Stopped;
                return Err(StartError::Stopped);
            }
        };

        let core = placement_core(preferred_core);
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let spawned = thread::Builder::new()
            .name(format!("net-sender-c{core}"))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || run_worker(rx, stop_rx, *dispatcher))
            });
        match spawned {
            Ok(handle) => {
                info!(core, capacity = self.config.capacity, "network send worker started");
                *state = WorkerState::Running { handle, core };
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "failed to start network send worker");
                Err(StartError::Spawn(err))
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.state
            .lock()
            .map(|state| matches!(*state, WorkerState::Running { .. }))
            .unwrap_or(false)
    }

    /// Core the running worker was placed on.
    pub fn worker_core(&self) -> Option<i32> {
        match &*self.state.lock().ok()? {
            WorkerState::Running { core, .. } => Some(*core),
            _ => None,
        }
    }

    /// Queue a plain-text status POST. All inputs are copied.
    pub fn enqueue_plain_post(
        &self,
        host: &str,
        port: u16,
        path: &str,
        body: &[u8],
    ) -> Result<(), EnqueueError> {
        const KIND: &str = "plain_post";
        let result = self.prepare_plain(host, port, path, body).and_then(|post| {
            self.push(TransferItem::PlainPost(post))
                .map_err(|(reason, _item)| reason)
        });
        self.record(KIND, result.err());
        result
    }

    /// Queue a snapshot upload, taking ownership of `pixels`. On failure the
    /// pixels come back inside [`Rejected`].
    pub fn enqueue_image_send(
        &self,
        pixels: PixelBuffer,
        width: u32,
        height: u32,
        format: PixelFormat,
        quality: u8,
        caption: &str,
    ) -> Result<(), Rejected> {
        const KIND: &str = "image_send";
        let result = self
            .prepare_image(pixels, width, height, format, quality, caption)
            .and_then(|image| {
                self.push(TransferItem::ImageSend(image))
                    .map_err(|(reason, item)| match item.into_pixels() {
                        Some(pixels) => Rejected { reason, pixels },
                        None => Rejected {
                            reason,
                            pixels: PixelBuffer::from_vec(Vec::new()),
                        },
                    })
            });
        self.record(KIND, result.as_ref().err().map(|rejected| rejected.reason));
        result
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.len()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity.max(1)
    }

    pub fn stats(&self) -> SenderStats {
        let c = &self.counters;
        SenderStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            plain_ok: c.plain_ok.load(Ordering::Relaxed),
            plain_failed: c.plain_failed.load(Ordering::Relaxed),
            sink_ok: c.sink_ok.load(Ordering::Relaxed),
            sink_failed: c.sink_failed.load(Ordering::Relaxed),
        }
    }

    /// Refuse new items, let the worker drain what is queued, then join it.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut stop_tx) = self.stop_tx.lock() {
            stop_tx.take();
        }
        let state = match self.state.lock() {
            Ok(mut state) => mem::replace(&mut *state, WorkerState::Stopped),
            Err(_) => return,
        };
        if let WorkerState::Running { handle, .. } = state {
            if handle.join().is_err() {
                error!("network send worker panicked");
            }
        }
        debug!("network sender shut down");
    }

    fn prepare_plain(
        &self,
        host: &str,
        port: u16,
        path: &str,
        body: &[u8],
    ) -> Result<PlainPost, EnqueueError> {
        if host.is_empty() {
            return Err(EnqueueError::Invalid("empty host"));
        }
        if path.is_empty() {
            return Err(EnqueueError::Invalid("empty path"));
        }
        if body.is_empty() {
            return Err(EnqueueError::Invalid("empty body"));
        }
        self.ensure_started()?;
        Ok(PlainPost {
            host: try_copy_str(host)?,
            port,
            path: try_copy_str(path)?,
            body: try_copy(body)?,
        })
    }

    fn prepare_image(
        &self,
        pixels: PixelBuffer,
        width: u32,
        height: u32,
        format: PixelFormat,
        quality: u8,
        caption: &str,
    ) -> Result<ImageSend, Rejected> {
        let invalid = if pixels.is_empty() {
            Some("empty pixel buffer")
        } else if width == 0 || height == 0 {
            Some("zero dimension")
        } else if format.frame_len(width, height) != Some(pixels.len()) {
            Some("pixel length does not match dimensions")
        } else {
            None
        };
        if let Some(reason) = invalid {
            return Err(Rejected {
                reason: EnqueueError::Invalid(reason),
                pixels,
            });
        }
        if let Err(reason) = self.ensure_started() {
            return Err(Rejected { reason, pixels });
        }
        let caption = match try_copy_str(caption) {
            Ok(caption) => caption,
            Err(err) => {
                return Err(Rejected {
                    reason: err.into(),
                    pixels,
                });
            }
        };
        Ok(ImageSend {
            pixels,
            width,
            height,
            format,
            quality,
            caption,
        })
    }

    fn ensure_started(&self) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }
        if !self.config.lazy_start {
            return Ok(());
        }
        self.start(self.config.preferred_core)
            .map_err(|_| EnqueueError::WorkerUnavailable)
    }

    fn push(&self, item: TransferItem) -> Result<(), (EnqueueError, TransferItem)> {
        match self.tx.try_send(item) {
            Ok(()) => {
                metrics::gauge!("facewatch_queue_depth").set(self.tx.len() as f64);
                Ok(())
            }
            Err(TrySendError::Full(item)) => {
                warn!(kind = item.kind(), "send queue full, dropping item");
                Err((EnqueueError::QueueFull, item))
            }
            Err(TrySendError::Disconnected(item)) => Err((EnqueueError::Closed, item)),
        }
    }

    fn record(&self, kind: &'static str, failure: Option<EnqueueError>) {
        let result = match failure {
            None => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                "ok"
            }
            Some(reason) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(kind, %reason, "enqueue rejected");
                reason.label()
            }
        };
        metrics::counter!("facewatch_enqueue_total", "kind" => kind, "result" => result)
            .increment(1);
    }
}

impl Drop for NetSender {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn placement_core(preferred: i32) -> i32 {
    match preferred {
        0 | 1 => preferred,
        other => {
            warn!(requested = other, "invalid core for send worker, using core 1");
            1
        }
    }
}

fn run_worker(rx: Receiver<TransferItem>, stop: Receiver<()>, mut dispatcher: Dispatcher) {
    let _span = info_span!("offload.worker").entered();
    loop {
        select! {
            recv(rx) -> item => match item {
                Ok(item) => dispatcher.process(item, rx.len()),
                Err(_) => break,
            },
            recv(stop) -> _ => {
                for item in rx.try_iter() {
                    dispatcher.process(item, rx.len());
                }
                break;
            }
        }
    }
    info!("network send worker exiting");
}

struct Dispatcher {
    backend: SendBackend,
    coordinator: Arc<Coordinator>,
    plain_timeout: Duration,
    retry: RetryPolicy,
    item_yield: Duration,
    counters: Arc<Counters>,
}

impl Dispatcher {
    fn process(&mut self, item: TransferItem, remaining: usize) {
        metrics::gauge!("facewatch_queue_depth").set(remaining as f64);
        let kind = item.kind();
        let span = info_span!("offload.item", kind);
        let _entered = span.enter();
        let started = Instant::now();

        match &item {
            TransferItem::PlainPost(post) => self.send_plain(post),
            TransferItem::ImageSend(image) => self.send_image(image),
        }
        metrics::histogram!("facewatch_send_seconds", "kind" => kind)
            .record(started.elapsed().as_secs_f64());

        // Owned buffers are released here, exactly once.
        drop(item);
        self.counters.processed.fetch_add(1, Ordering::Release);
        if !self.item_yield.is_zero() {
            thread::sleep(self.item_yield);
        }
    }

    fn send_plain(&mut self, post: &PlainPost) {
        let url = post.url();
        let result = {
            let _sending = self.coordinator.begin_send();
            self.retry.run("plain_post", |_| {
                self.backend
                    .transport
                    .post_plain_text(&url, &post.body, self.plain_timeout)
            })
        };
        let ok = match result {
            Ok(status) if (200..300).contains(&status) => {
                debug!(%url, status, "status posted");
                true
            }
            Ok(status) => {
                warn!(%url, status, "status post rejected");
                false
            }
            Err(err) => {
                warn!(%url, error = %err, "status post failed");
                false
            }
        };
        let counter = if ok {
            &self.counters.plain_ok
        } else {
            &self.counters.plain_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("facewatch_send_total", "sink" => "plain_post", "result" => if ok { "ok" } else { "error" })
            .increment(1);
    }

    fn send_image(&mut self, image: &ImageSend) {
        if self.backend.sinks.is_empty() {
            debug!("no image sinks configured, dropping snapshot");
            return;
        }
        let jpeg = match encode_jpeg(
            &image.pixels,
            image.width,
            image.height,
            image.format,
            image.quality,
        ) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                error!(error = %err, "snapshot encode failed");
                metrics::counter!("facewatch_send_total", "sink" => "encode", "result" => "error")
                    .increment(1);
                return;
            }
        };

        for sink in self.backend.sinks.iter_mut() {
            let name = sink.name();
            let result = {
                let _sending = self.coordinator.begin_send();
                self.retry
                    .run(name, |_| sink.deliver(&jpeg, &image.caption))
            };
            let ok = match result {
                Ok(()) => true,
                Err(err) => {
                    warn!(sink = name, error = %err, "snapshot delivery failed");
                    false
                }
            };
            let counter = if ok {
                &self.counters.sink_ok
            } else {
                &self.counters.sink_failed
            };
            counter.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("facewatch_send_total", "sink" => name, "result" => if ok { "ok" } else { "error" })
                .increment(1);
        }
    }
}
