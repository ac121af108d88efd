//! Configuration for the monitor.
//!
//! Translates CLI arguments (with environment fallbacks for credentials) into
//! a validated `FacewatchConfig` which the stages use without re-parsing.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;
use frame_cap::{FrameGeometry, PixelFormat};
use offload::{MqttTarget, RetryPolicy, SenderConfig};

/// Largest accepted frame side, in pixels.
const MAX_FRAME_SIDE: u32 = 4096;

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage.
pub struct FacewatchConfig {
    pub capture: CaptureConfig,
    pub engine: EngineConfig,
    /// Remote peer receiving status reports. `None` only logs reports.
    pub peer: Option<PeerConfig>,
    pub timing: TimingConfig,
    pub sender: SendSettings,
    pub sinks: SinkConfig,
    /// `None` disables the display worker.
    pub display: Option<DisplayConfig>,
    /// `None` disables the preview server.
    pub preview: Option<PreviewConfig>,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Directory of still images to loop over; synthetic pattern when unset.
    pub frames_dir: Option<PathBuf>,
    pub geometry: FrameGeometry,
    pub fps: u32,
    pub ring_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub script: PathBuf,
    pub looped: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Dwell, resend and cooldown windows.
pub struct TimingConfig {
    /// How long an outcome must persist before it is reported.
    pub dwell: Duration,
    /// Minimum gap between repeated reports of the same outcome.
    pub resend: Duration,
    /// Continuous activity required before recognition is requested.
    pub sustain: Duration,
    /// Detection gap after which activity is considered over.
    pub quiet: Duration,
    pub snapshot_cooldown: Duration,
    /// Display hold-off after a network send finishes.
    pub display_cooldown: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            dwell: Duration::from_millis(1_000),
            resend: Duration::from_millis(5_000),
            sustain: Duration::from_millis(2_000),
            quiet: Duration::from_millis(300),
            snapshot_cooldown: Duration::from_millis(20_000),
            display_cooldown: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SendSettings {
    pub queue_capacity: usize,
    pub preferred_core: i32,
    pub plain_timeout: Duration,
    pub sink_timeout: Duration,
    pub retry: RetryPolicy,
    pub jpeg_quality: u8,
    pub caption: String,
    pub downscale: bool,
    /// Preallocated snapshot buffers.
    pub pool_buffers: usize,
}

impl SendSettings {
    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            capacity: self.queue_capacity,
            preferred_core: self.preferred_core,
            lazy_start: true,
            plain_timeout: self.plain_timeout,
            retry: self.retry,
            ..SenderConfig::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SinkConfig {
    pub telegram: Option<TelegramSettings>,
    pub storage: Option<StorageSettings>,
    pub tcp_addr: Option<String>,
    pub mqtt: Option<MqttTarget>,
}

impl SinkConfig {
    pub fn is_empty(&self) -> bool {
        self.telegram.is_none()
            && self.storage.is_none()
            && self.tcp_addr.is_none()
            && self.mqtt.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct TelegramSettings {
    pub token: String,
    pub chat_id: String,
}

#[derive(Clone, Debug)]
pub struct StorageSettings {
    pub url: String,
    pub service_key: String,
    pub bucket: String,
}

#[derive(Clone, Debug)]
pub struct DisplayConfig {
    pub warmup: Duration,
    pub first_frame_poll: Duration,
    pub sending_poll: Duration,
    pub cooldown_poll: Duration,
    /// Redraw one frame out of every `refresh_every`.
    pub refresh_every: u32,
    pub pacing: Duration,
    /// Write the canvas to this PNG on every refresh.
    pub canvas_png: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct PreviewConfig {
    pub bind: String,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing worker spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct FacewatchCliArgs {
    /// JSONL script driving the replay inference engine.
    #[arg(long = "script", value_name = "PATH")]
    pub script: PathBuf,
    /// Restart the script when it ends.
    #[arg(long = "loop-script", action = clap::ArgAction::SetTrue)]
    pub loop_script: bool,

    /// Directory of images used as camera frames (synthetic pattern if omitted).
    #[arg(long = "frames", value_name = "DIR")]
    pub frames_dir: Option<PathBuf>,
    /// Frame width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 240)]
    pub width: u32,
    /// Frame height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 240)]
    pub height: u32,
    #[arg(long = "fps", default_value_t = 15)]
    pub fps: u32,
    /// Frames kept in the capture ring.
    #[arg(long = "ring", value_name = "N", default_value_t = 3)]
    pub ring_capacity: usize,

    /// Status peer host; reports are only logged when unset.
    #[arg(long = "peer-host", env = "FACEWATCH_PEER_HOST")]
    pub peer_host: Option<String>,
    #[arg(long = "peer-port", env = "FACEWATCH_PEER_PORT", default_value_t = 80)]
    pub peer_port: u16,
    #[arg(long = "peer-path", env = "FACEWATCH_PEER_PATH", default_value = "/status")]
    pub peer_path: String,

    #[arg(long = "dwell-ms", default_value_t = 1_000)]
    pub dwell_ms: u64,
    #[arg(long = "resend-ms", default_value_t = 5_000)]
    pub resend_ms: u64,
    #[arg(long = "sustain-ms", default_value_t = 2_000)]
    pub sustain_ms: u64,
    #[arg(long = "quiet-ms", default_value_t = 300)]
    pub quiet_ms: u64,
    #[arg(long = "snapshot-cooldown-ms", default_value_t = 20_000)]
    pub snapshot_cooldown_ms: u64,
    #[arg(long = "display-cooldown-ms", default_value_t = 250)]
    pub display_cooldown_ms: u64,

    /// Send queue capacity.
    #[arg(long = "queue", value_name = "N", default_value_t = 6)]
    pub queue_capacity: usize,
    /// Preferred core for the send worker (0 or 1).
    #[arg(long = "send-core", default_value_t = 1, allow_negative_numbers = true)]
    pub send_core: i32,
    #[arg(long = "request-timeout-secs", default_value_t = 8)]
    pub request_timeout_secs: u64,
    #[arg(long = "sink-timeout-secs", default_value_t = 30)]
    pub sink_timeout_secs: u64,
    /// Attempts per request, counting the first.
    #[arg(long = "send-attempts", default_value_t = 3)]
    pub send_attempts: u32,
    #[arg(long = "retry-backoff-ms", default_value_t = 500)]
    pub retry_backoff_ms: u64,
    /// JPEG quality used for snapshots (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 80)]
    pub jpeg_quality: u8,
    #[arg(long = "caption", default_value = "Motion detected")]
    pub caption: String,
    /// Halve snapshot resolution before queueing.
    #[arg(long = "snapshot-downscale", action = clap::ArgAction::SetTrue)]
    pub snapshot_downscale: bool,
    #[arg(long = "pool-buffers", value_name = "N", default_value_t = 2)]
    pub pool_buffers: usize,

    #[arg(long = "telegram-token", env = "FACEWATCH_TELEGRAM_TOKEN", hide_env_values = true)]
    pub telegram_token: Option<String>,
    #[arg(long = "telegram-chat", env = "FACEWATCH_TELEGRAM_CHAT")]
    pub telegram_chat: Option<String>,
    #[arg(long = "storage-url", env = "FACEWATCH_STORAGE_URL")]
    pub storage_url: Option<String>,
    #[arg(long = "storage-key", env = "FACEWATCH_STORAGE_KEY", hide_env_values = true)]
    pub storage_key: Option<String>,
    #[arg(long = "storage-bucket", env = "FACEWATCH_STORAGE_BUCKET")]
    pub storage_bucket: Option<String>,
    /// `host:port` of a raw TCP snapshot receiver.
    #[arg(long = "tcp-sink", env = "FACEWATCH_TCP_SINK", value_name = "ADDR")]
    pub tcp_sink: Option<String>,
    /// MQTT broker host. Snapshots are published as base64 JPEG text.
    #[arg(long = "mqtt-host", env = "FACEWATCH_MQTT_HOST", value_name = "HOST")]
    pub mqtt_host: Option<String>,
    #[arg(long = "mqtt-port", env = "FACEWATCH_MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,
    #[arg(long = "mqtt-topic", env = "FACEWATCH_MQTT_TOPIC", default_value = "facewatch/detection")]
    pub mqtt_topic: String,
    #[arg(long = "mqtt-client-id", env = "FACEWATCH_MQTT_CLIENT_ID", default_value = "facewatch")]
    pub mqtt_client_id: String,
    #[arg(long = "mqtt-user", env = "FACEWATCH_MQTT_USER")]
    pub mqtt_user: Option<String>,
    #[arg(long = "mqtt-password", env = "FACEWATCH_MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// Disable the display worker.
    #[arg(long = "no-display", action = clap::ArgAction::SetTrue)]
    pub no_display: bool,
    #[arg(long = "display-warmup-ms", default_value_t = 5_000)]
    pub display_warmup_ms: u64,
    #[arg(long = "refresh-every", value_name = "N", default_value_t = 20)]
    pub refresh_every: u32,
    #[arg(long = "display-pacing-ms", default_value_t = 180)]
    pub display_pacing_ms: u64,
    /// Mirror the display canvas into a PNG file.
    #[arg(long = "canvas-png", value_name = "PATH")]
    pub canvas_png: Option<PathBuf>,

    /// Preview server bind address.
    #[arg(long = "preview-bind", default_value = "0.0.0.0:8080")]
    pub preview_bind: String,
    #[arg(long = "no-preview", action = clap::ArgAction::SetTrue)]
    pub no_preview: bool,

    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<FacewatchCliArgs> for FacewatchConfig {
    type Error = anyhow::Error;

    fn try_from(args: FacewatchCliArgs) -> Result<Self> {
        if args.width < 2 || args.height < 2 {
            bail!("Frame width and height must be at least 2 pixels");
        }
        if args.width > MAX_FRAME_SIDE || args.height > MAX_FRAME_SIDE {
            bail!("Frame width and height must not exceed {MAX_FRAME_SIDE} pixels");
        }
        if !(1..=120).contains(&args.fps) {
            bail!("--fps must be between 1 and 120");
        }
        if args.ring_capacity == 0 {
            bail!("--ring must be at least 1");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.queue_capacity == 0 {
            bail!("--queue must be at least 1");
        }
        if args.send_attempts == 0 {
            bail!("--send-attempts must be at least 1");
        }
        if args.resend_ms == 0 {
            bail!("--resend-ms must be positive");
        }
        if args.request_timeout_secs == 0 || args.sink_timeout_secs == 0 {
            bail!("Request timeouts must be positive");
        }
        if args.refresh_every == 0 {
            bail!("--refresh-every must be at least 1");
        }

        let peer = match args.peer_host {
            Some(host) if host.trim().is_empty() => bail!("--peer-host must not be empty"),
            Some(host) => {
                if args.peer_path.trim().is_empty() {
                    bail!("--peer-path must not be empty");
                }
                Some(PeerConfig {
                    host,
                    port: args.peer_port,
                    path: args.peer_path,
                })
            }
            None => None,
        };

        let telegram = match (args.telegram_token, args.telegram_chat) {
            (Some(token), Some(chat_id)) => Some(TelegramSettings { token, chat_id }),
            (None, None) => None,
            _ => bail!("--telegram-token and --telegram-chat must be given together"),
        };
        let storage = match (args.storage_url, args.storage_key, args.storage_bucket) {
            (Some(url), Some(service_key), Some(bucket)) => Some(StorageSettings {
                url,
                service_key,
                bucket,
            }),
            (None, None, None) => None,
            _ => bail!("--storage-url, --storage-key and --storage-bucket must be given together"),
        };
        let mqtt = match args.mqtt_host {
            Some(host) => {
                if host.is_empty() || args.mqtt_topic.is_empty() {
                    bail!("--mqtt-host and --mqtt-topic must not be empty");
                }
                if args.mqtt_client_id.trim().is_empty() {
                    bail!("--mqtt-client-id must not be empty");
                }
                let credentials = match (args.mqtt_user, args.mqtt_password) {
                    (Some(user), Some(password)) => Some((user, password)),
                    (None, None) => None,
                    _ => bail!("--mqtt-user and --mqtt-password must be given together"),
                };
                Some(MqttTarget {
                    host,
                    port: args.mqtt_port,
                    topic: args.mqtt_topic,
                    client_id: args.mqtt_client_id,
                    credentials,
                })
            }
            None => None,
        };

        let timing = TimingConfig {
            dwell: Duration::from_millis(args.dwell_ms),
            resend: Duration::from_millis(args.resend_ms),
            sustain: Duration::from_millis(args.sustain_ms),
            quiet: Duration::from_millis(args.quiet_ms),
            snapshot_cooldown: Duration::from_millis(args.snapshot_cooldown_ms),
            display_cooldown: Duration::from_millis(args.display_cooldown_ms),
        };

        let display = (!args.no_display).then(|| DisplayConfig {
            warmup: Duration::from_millis(args.display_warmup_ms),
            first_frame_poll: Duration::from_millis(50),
            sending_poll: Duration::from_millis(120),
            cooldown_poll: Duration::from_millis(60),
            refresh_every: args.refresh_every,
            pacing: Duration::from_millis(args.display_pacing_ms),
            canvas_png: args.canvas_png,
        });

        let preview = (!args.no_preview).then_some(PreviewConfig {
            bind: args.preview_bind,
        });

        Ok(Self {
            capture: CaptureConfig {
                frames_dir: args.frames_dir,
                geometry: FrameGeometry::new(args.width, args.height, PixelFormat::Rgb565),
                fps: args.fps,
                ring_capacity: args.ring_capacity,
            },
            engine: EngineConfig {
                script: args.script,
                looped: args.loop_script,
            },
            peer,
            timing,
            sender: SendSettings {
                queue_capacity: args.queue_capacity,
                preferred_core: args.send_core,
                plain_timeout: Duration::from_secs(args.request_timeout_secs),
                sink_timeout: Duration::from_secs(args.sink_timeout_secs),
                retry: RetryPolicy {
                    attempts: args.send_attempts,
                    backoff: Duration::from_millis(args.retry_backoff_ms),
                },
                jpeg_quality: args.jpeg_quality,
                caption: args.caption,
                downscale: args.snapshot_downscale,
                pool_buffers: args.pool_buffers,
            },
            sinks: SinkConfig {
                telegram,
                storage,
                tcp_addr: args.tcp_sink,
                mqtt,
            },
            display,
            preview,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, FromArgMatches, Parser};

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: FacewatchCliArgs,
    }

    /// Parse `extra` with every `env` fallback detached, so `FACEWATCH_*`
    /// variables in the test environment cannot leak in.
    fn parse(extra: &[&str]) -> Result<FacewatchConfig> {
        let argv = ["facewatch", "--script", "faces.jsonl"]
            .into_iter()
            .chain(extra.iter().copied());
        let command = TestCli::command().mut_args(|arg| arg.env(None::<&'static str>));
        let matches = command.try_get_matches_from(argv)?;
        let cli = TestCli::from_arg_matches(&matches)?;
        FacewatchConfig::try_from(cli.args)
    }

    #[test]
    fn credential_flags_have_no_env_fallback_in_tests() {
        let command = TestCli::command().mut_args(|arg| arg.env(None::<&'static str>));
        assert!(command.get_arguments().all(|arg| arg.get_env().is_none()));
        let with_env = TestCli::command();
        let token = with_env
            .get_arguments()
            .find(|arg| arg.get_id() == "telegram_token")
            .unwrap();
        assert_eq!(token.get_env(), Some(std::ffi::OsStr::new("FACEWATCH_TELEGRAM_TOKEN")));
    }

    #[test]
    fn defaults_match_documented_windows() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.timing, TimingConfig::default());
        assert_eq!(config.sender.queue_capacity, 6);
        assert_eq!(config.sender.plain_timeout, Duration::from_secs(8));
        assert_eq!(config.sender.sink_timeout, Duration::from_secs(30));
        assert_eq!(config.sender.retry.attempts, 3);
        assert_eq!(config.sender.jpeg_quality, 80);
        assert!(config.peer.is_none());
        assert!(config.sinks.is_empty());
        let display = config.display.unwrap();
        assert_eq!(display.refresh_every, 20);
        assert_eq!(display.pacing, Duration::from_millis(180));
    }

    #[test]
    fn peer_and_overrides_are_applied() {
        let config = parse(&[
            "--peer-host",
            "192.168.1.20",
            "--peer-port",
            "5000",
            "--dwell-ms",
            "500",
            "--no-display",
            "--send-core",
            "-1",
        ])
        .unwrap();
        assert_eq!(
            config.peer,
            Some(PeerConfig {
                host: "192.168.1.20".into(),
                port: 5000,
                path: "/status".into(),
            })
        );
        assert_eq!(config.timing.dwell, Duration::from_millis(500));
        assert_eq!(config.sender.preferred_core, -1);
        assert!(config.display.is_none());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse(&["--jpeg-quality", "0"]).is_err());
        assert!(parse(&["--queue", "0"]).is_err());
        assert!(parse(&["--resend-ms", "0"]).is_err());
        assert!(parse(&["--refresh-every", "0"]).is_err());
        assert!(parse(&["--width", "4097"]).is_err());
        assert!(parse(&["--height", "100000"]).is_err());
    }

    #[test]
    fn sink_credentials_come_in_sets() {
        assert!(parse(&["--telegram-token", "abc"]).is_err());
        assert!(parse(&["--storage-url", "https://x", "--storage-bucket", "b"]).is_err());
        let config = parse(&["--telegram-token", "abc", "--telegram-chat", "42"]).unwrap();
        assert!(config.sinks.telegram.is_some());
        assert!(parse(&["--mqtt-host", "broker.local", "--mqtt-user", "cam"]).is_err());
    }

    #[test]
    fn mqtt_sink_uses_topic_defaults() {
        assert!(parse(&[]).unwrap().sinks.mqtt.is_none());

        let config = parse(&["--mqtt-host", "broker.local", "--mqtt-port", "1884"]).unwrap();
        assert!(!config.sinks.is_empty());
        assert_eq!(
            config.sinks.mqtt,
            Some(MqttTarget {
                host: "broker.local".into(),
                port: 1884,
                topic: "facewatch/detection".into(),
                client_id: "facewatch".into(),
                credentials: None,
            })
        );
    }
}
