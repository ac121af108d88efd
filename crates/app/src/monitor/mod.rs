//! Face-monitoring loop: debounces engine results, offloads status reports and
//! motion snapshots to the send worker, and keeps the display off the shared
//! bus while a send is in flight.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Wires capture, engine, send worker, display and preview server.
//! - `listener`: Engine callbacks feeding the send queue.
//! - `activity`: Face presence tracking and the recognition trigger.
//! - `stability`: Dwell and resend debouncing of recognition outcomes.
//! - `snapshot`: Snapshot cooldown and frame copy-out.
//! - `display`: Bus-aware display refresh worker.
//! - `server`: Actix Web preview and control endpoints.
//! - `telemetry`: Tracing subscriber and Prometheus recorder.

/// Re-export run settings so callers can configure runs without reaching
/// into submodules.
pub use config::{FacewatchCliArgs, FacewatchConfig};
/// Launch the monitor with a ready-made configuration.
pub use pipeline::run;

mod activity;
mod config;
mod display;
mod listener;
mod pipeline;
mod server;
mod snapshot;
mod stability;
mod telemetry;
