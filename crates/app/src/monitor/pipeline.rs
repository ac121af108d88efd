//! Supervisor wiring capture, the replay engine, the send worker, the
//! display worker and the preview server.
//!
//! Every stage gets the same `running` flag; Ctrl+C or the end of a
//! non-looping script clears it and the stages are joined in reverse order.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use face_core::{RecognitionControl, ReplayEngine, ReplayScript};
use frame_cap::{FrameRing, FrameSource, spawn_image_dir_reader, spawn_synthetic_camera};
use offload::{
    BufferPool, Coordinator, HttpTransport, ImageSink, MqttSink, NetSender, ObjectStorageSink,
    SendBackend, TcpFrameSink, TelegramSink, build_client,
};
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::monitor::{
    FacewatchConfig,
    config::SinkConfig,
    display::{DisplaySink, DisplayWorker, LogSink, PngCanvasSink, spawn_display_worker},
    listener::MonitorListener,
    server::{PreviewServer, ServerState, spawn_preview_server},
    telemetry,
};

/// Run the monitor until Ctrl+C, or until the script ends when not looping.
pub fn run(config: FacewatchConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let prometheus = match telemetry::init_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("Metrics disabled: {err:#}");
            None
        }
    };
    let span = tracing::info_span!(
        "facewatch",
        width = config.capture.geometry.width,
        height = config.capture.geometry.height,
        fps = config.capture.fps,
        script = %config.engine.script.display(),
    );
    let _span = span.enter();

    let script = ReplayScript::from_path(&config.engine.script)
        .with_context(|| format!("Failed to load script {}", config.engine.script.display()))?;
    info!(
        entries = script.entries().len(),
        duration_ms = script.duration().as_millis() as u64,
        looped = config.engine.looped,
        "replay script loaded"
    );

    let running = Arc::new(AtomicBool::new(true));
    let frames = Arc::new(FrameRing::new(
        config.capture.geometry,
        config.capture.ring_capacity,
    ));
    let capture = match config.capture.frames_dir.as_deref() {
        Some(dir) => spawn_image_dir_reader(dir, frames.clone(), config.capture.fps, running.clone()),
        None => spawn_synthetic_camera(frames.clone(), config.capture.fps, running.clone()),
    }
    .context("Failed to start frame capture")?;

    let coordinator = Arc::new(Coordinator::new());
    let client = build_client().context("Failed to build HTTP client")?;
    let sinks = build_sinks(&config.sinks, &client, config.sender.sink_timeout);
    let snapshots_enabled = !sinks.is_empty();
    if !snapshots_enabled {
        info!("No image sinks configured, motion snapshots disabled");
    }

    let sender = Arc::new(NetSender::new(
        config.sender.sender_config(),
        SendBackend {
            transport: Box::new(HttpTransport::with_client(client)),
            sinks,
        },
        coordinator.clone(),
    ));
    sender
        .start(config.sender.preferred_core)
        .context("Failed to start send worker")?;

    let pool = BufferPool::new(config.capture.geometry.frame_len(), config.sender.pool_buffers)
        .context("Failed to preallocate snapshot buffers")?;

    let engine = ReplayEngine::new(script, config.engine.looped);
    let control = engine.control();
    let listener = MonitorListener::new(
        &config.timing,
        &config.sender,
        config.peer.clone(),
        sender.clone(),
        frames.clone() as Arc<dyn FrameSource>,
        control.clone() as Arc<dyn RecognitionControl>,
        pool,
    );
    let listener = if snapshots_enabled {
        listener
    } else {
        listener.without_snapshots()
    };
    let engine_handle = engine
        .spawn(Box::new(listener), running.clone())
        .context("Failed to start replay engine")?;

    let display_handle = match config.display.clone() {
        Some(display) => {
            let sink: Box<dyn DisplaySink> = match display.canvas_png.clone() {
                Some(path) => Box::new(PngCanvasSink::new(path)),
                None => Box::new(LogSink::default()),
            };
            let worker = DisplayWorker::new(
                display,
                config.timing.display_cooldown,
                frames.clone(),
                coordinator.clone(),
                sink,
            );
            Some(spawn_display_worker(worker, running.clone()).context("Failed to start display worker")?)
        }
        None => None,
    };

    let preview = match config.preview.as_ref() {
        Some(preview) => spawn_preview_server(
            preview.bind.clone(),
            ServerState {
                frames: frames.clone(),
                coordinator: coordinator.clone(),
                control: control.clone(),
                sender: sender.clone(),
                jpeg_quality: config.sender.jpeg_quality,
                prometheus,
                stream_clients: Arc::new(AtomicUsize::new(0)),
            },
        )?,
        None => PreviewServer::default(),
    };

    info!("monitor running, press Ctrl+C to stop");
    while !shutdown.load(Ordering::SeqCst) && !engine_handle.is_finished() {
        thread::sleep(Duration::from_millis(100));
    }
    if shutdown.load(Ordering::SeqCst) {
        info!("shutdown requested");
    } else {
        info!("replay script finished, shutting down");
    }

    running.store(false, Ordering::SeqCst);
    preview.stop();
    if engine_handle.join().is_err() {
        warn!("engine thread panicked");
    }
    if let Some(handle) = display_handle {
        if handle.join().is_err() {
            warn!("display thread panicked");
        }
    }
    if capture.join().is_err() {
        warn!("capture thread panicked");
    }

    sender.shutdown();
    let stats = sender.stats();
    info!(
        enqueued = stats.enqueued,
        rejected = stats.rejected,
        processed = stats.processed,
        plain_ok = stats.plain_ok,
        plain_failed = stats.plain_failed,
        sink_ok = stats.sink_ok,
        sink_failed = stats.sink_failed,
        "send worker stopped"
    );
    Ok(())
}

/// Instantiate every configured image sink, in delivery order.
fn build_sinks(config: &SinkConfig, client: &Client, timeout: Duration) -> Vec<Box<dyn ImageSink>> {
    let mut sinks: Vec<Box<dyn ImageSink>> = Vec::new();
    if let Some(telegram) = config.telegram.as_ref() {
        sinks.push(Box::new(TelegramSink::new(
            client.clone(),
            telegram.token.clone(),
            telegram.chat_id.clone(),
            timeout,
        )));
    }
    if let Some(storage) = config.storage.as_ref() {
        sinks.push(Box::new(ObjectStorageSink::new(
            client.clone(),
            storage.url.clone(),
            storage.service_key.clone(),
            storage.bucket.clone(),
            timeout,
        )));
    }
    if let Some(addr) = config.tcp_addr.as_ref() {
        sinks.push(Box::new(TcpFrameSink::new(addr.clone(), timeout)));
    }
    if let Some(target) = config.mqtt.as_ref() {
        sinks.push(Box::new(MqttSink::new(target.clone(), timeout)));
    }
    debug!(
        sinks = ?sinks.iter().map(|sink| sink.name()).collect::<Vec<_>>(),
        "image sinks configured"
    );
    sinks
}
