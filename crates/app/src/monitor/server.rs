//! Actix Web preview server: live frames, metrics, worker status and engine
//! control endpoints.
//!
//! The server runs on a dedicated thread so the engine and worker threads
//! never see the Actix runtime.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use face_core::RecognitionControl;
use frame_cap::{FrameRing, FrameSource};
use metrics_exporter_prometheus::PrometheusHandle;
use offload::{Coordinator, NetSender, encode_jpeg};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::monitor::telemetry;

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) frames: Arc<FrameRing>,
    pub(crate) coordinator: Arc<Coordinator>,
    pub(crate) control: Arc<dyn RecognitionControl>,
    pub(crate) sender: Arc<NetSender>,
    pub(crate) jpeg_quality: u8,
    pub(crate) prometheus: Option<&'static PrometheusHandle>,
    pub(crate) stream_clients: Arc<AtomicUsize>,
}

#[derive(Default)]
/// Handle for the preview server thread.
pub(crate) struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Spawn the preview server thread and return a handle that can stop it.
pub(crate) fn spawn_preview_server(bind: String, state: ServerState) -> Result<PreviewServer> {
    let state = web::Data::new(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = telemetry::spawn_thread("preview-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(routes))
                .workers(1)
                .bind(bind.as_str())?
                .run();
            info!(%bind, "preview server listening");

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn preview server thread")?;
    Ok(PreviewServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/snapshot", web::get().to(snapshot_handler))
        .route("/stream", web::get().to(stream_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/status", web::get().to(status_handler))
        .route("/recognize", web::post().to(recognize_handler))
        .route("/enroll", web::post().to(enroll_handler))
        .route("/clear", web::post().to(clear_handler));
}

/// Keeps the coordinator's streaming flag raised while any client is attached.
struct StreamingGuard {
    coordinator: Arc<Coordinator>,
    clients: Arc<AtomicUsize>,
}

impl StreamingGuard {
    fn attach(coordinator: Arc<Coordinator>, clients: Arc<AtomicUsize>) -> Self {
        clients.fetch_add(1, Ordering::AcqRel);
        coordinator.set_streaming(true);
        Self {
            coordinator,
            clients,
        }
    }
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        if self.clients.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.coordinator.set_streaming(false);
        }
    }
}

/// Encode the newest frame, returning its sequence number and JPEG bytes.
fn latest_jpeg(state: &ServerState) -> Option<(u64, Vec<u8>)> {
    let frame = state.frames.latest_owned(0)?;
    match encode_jpeg(
        &frame.data,
        frame.width,
        frame.height,
        frame.format,
        state.jpeg_quality,
    ) {
        Ok(jpeg) => Some((frame.sequence, jpeg)),
        Err(err) => {
            warn!("Preview encode failed: {err}");
            None
        }
    }
}

/// Return the newest frame as a single JPEG.
async fn snapshot_handler(state: web::Data<ServerState>) -> HttpResponse {
    match latest_jpeg(&state) {
        Some((sequence, jpeg)) => HttpResponse::Ok()
            .append_header(("X-Sequence", sequence.to_string()))
            .content_type("image/jpeg")
            .body(jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream new frames as MJPEG for as long as the client stays connected.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let guard = StreamingGuard::attach(state.coordinator.clone(), state.stream_clients.clone());
    let stream = stream! {
        let _guard = guard;
        let mut last_sequence = 0;
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(66));
        loop {
            interval.tick().await;
            if state.frames.latest_sequence() == Some(last_sequence) {
                continue;
            }
            if let Some((sequence, jpeg)) = latest_jpeg(&state) {
                last_sequence = sequence;
                let mut payload = Vec::with_capacity(jpeg.len() + 96);
                payload.extend_from_slice(b"\r\n--frame\r\n");
                payload.extend_from_slice(
                    format!(
                        "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                        jpeg.len()
                    )
                    .as_bytes(),
                );
                payload.extend_from_slice(&jpeg);
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace;boundary=frame"))
        .streaming(stream)
}

/// Prometheus text exposition of every recorded metric.
async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.prometheus {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    sending: bool,
    streaming: bool,
    worker_started: bool,
    queue_depth: usize,
    queue_capacity: usize,
    enqueued: u64,
    rejected: u64,
    processed: u64,
    plain_ok: u64,
    plain_failed: u64,
    sink_ok: u64,
    sink_failed: u64,
    latest_frame: Option<u64>,
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    let stats = state.sender.stats();
    HttpResponse::Ok().json(StatusResponse {
        sending: state.coordinator.is_sending(),
        streaming: state.coordinator.is_streaming(),
        worker_started: state.sender.is_started(),
        queue_depth: state.sender.queue_depth(),
        queue_capacity: state.sender.capacity(),
        enqueued: stats.enqueued,
        rejected: stats.rejected,
        processed: stats.processed,
        plain_ok: stats.plain_ok,
        plain_failed: stats.plain_failed,
        sink_ok: stats.sink_ok,
        sink_failed: stats.sink_failed,
        latest_frame: state.frames.latest_sequence(),
    })
}

async fn recognize_handler(state: web::Data<ServerState>) -> HttpResponse {
    state.control.request_recognize();
    HttpResponse::Accepted().body("recognition requested")
}

async fn enroll_handler(state: web::Data<ServerState>) -> HttpResponse {
    state.control.request_enroll();
    HttpResponse::Accepted().body("enrollment requested")
}

async fn clear_handler(state: web::Data<ServerState>) -> HttpResponse {
    state.control.request_clear_all();
    HttpResponse::Accepted().body("clearing all ids")
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test as actix_test};
    use face_core::ReplayControl;
    use frame_cap::{FrameGeometry, PixelFormat};
    use offload::{SendBackend, SenderConfig, Transport, TransportError};

    use super::*;

    struct NullTransport;

    impl Transport for NullTransport {
        fn post_plain_text(
            &mut self,
            _url: &str,
            _body: &[u8],
            _timeout: Duration,
        ) -> Result<u16, TransportError> {
            Ok(200)
        }
    }

    fn state(control: Arc<ReplayControl>) -> (web::Data<ServerState>, Arc<FrameRing>) {
        let frames = Arc::new(FrameRing::new(
            FrameGeometry::new(8, 8, PixelFormat::Rgb565),
            2,
        ));
        let coordinator = Arc::new(Coordinator::new());
        let sender = Arc::new(NetSender::new(
            SenderConfig {
                lazy_start: false,
                ..SenderConfig::default()
            },
            SendBackend {
                transport: Box::new(NullTransport),
                sinks: Vec::new(),
            },
            coordinator.clone(),
        ));
        let state = web::Data::new(ServerState {
            frames: frames.clone(),
            coordinator,
            control,
            sender,
            jpeg_quality: 80,
            prometheus: None,
            stream_clients: Arc::new(AtomicUsize::new(0)),
        });
        (state, frames)
    }

    #[actix_web::test]
    async fn control_endpoints_forward_to_engine() {
        let control = Arc::new(ReplayControl::default());
        let (state, _frames) = state(control.clone());
        let app = actix_test::init_service(App::new().app_data(state).configure(routes)).await;

        let req = actix_test::TestRequest::post().uri("/recognize").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(control.is_recognition_active());

        let req = actix_test::TestRequest::get().uri("/recognize").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn snapshot_is_empty_until_first_frame() {
        let (state, frames) = state(Arc::new(ReplayControl::default()));
        let app = actix_test::init_service(App::new().app_data(state).configure(routes)).await;

        let req = actix_test::TestRequest::get().uri("/snapshot").to_request();
        assert_eq!(
            actix_test::call_service(&app, req).await.status(),
            StatusCode::NO_CONTENT
        );

        frames.push(vec![0x1f; 128], 0).unwrap();
        let req = actix_test::TestRequest::get().uri("/snapshot").to_request();
        let body = actix_test::call_and_read_body(&app, req).await;
        assert_eq!(&body[..2], &[0xff, 0xd8]);
    }

    #[actix_web::test]
    async fn status_reports_queue_state() {
        let (state, _frames) = state(Arc::new(ReplayControl::default()));
        state
            .sender
            .enqueue_plain_post("peer", 80, "/status", b"denied,0")
            .unwrap();
        let app = actix_test::init_service(App::new().app_data(state).configure(routes)).await;

        let req = actix_test::TestRequest::get().uri("/status").to_request();
        let json: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(json["queue_depth"], 1);
        assert_eq!(json["queue_capacity"], 6);
        assert_eq!(json["worker_started"], false);
        assert_eq!(json["sending"], false);
    }

    #[actix_web::test]
    async fn metrics_unavailable_without_recorder() {
        let (state, _frames) = state(Arc::new(ReplayControl::default()));
        let app = actix_test::init_service(App::new().app_data(state).configure(routes)).await;

        let req = actix_test::TestRequest::get().uri("/metrics").to_request();
        assert_eq!(
            actix_test::call_service(&app, req).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn streaming_flag_follows_last_client() {
        let coordinator = Arc::new(Coordinator::new());
        let clients = Arc::new(AtomicUsize::new(0));
        let first = StreamingGuard::attach(coordinator.clone(), clients.clone());
        let second = StreamingGuard::attach(coordinator.clone(), clients.clone());
        drop(first);
        assert!(coordinator.is_streaming());
        drop(second);
        assert!(!coordinator.is_streaming());
    }
}
