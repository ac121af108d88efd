//! Deferred network offload: a bounded send queue drained by one worker
//! thread, plus the flag the display path polls to stay off the bus while a
//! transaction is in flight.

mod buffer;
mod coordinator;
mod encode;
mod item;
mod mqtt;
mod retry;
mod sender;
mod sinks;
mod transport;

pub use buffer::{AllocError, BufferPool, PixelBuffer, PoolStats};
pub use coordinator::{BusState, Coordinator, SendGuard};
pub use encode::{EncodeError, encode_jpeg};
pub use item::{ImageSend, PlainPost, TransferItem};
pub use mqtt::{MqttSink, MqttTarget, snapshot_payload};
pub use retry::RetryPolicy;
pub use sender::{
    EnqueueError, NetSender, Rejected, SendBackend, SenderConfig, SenderStats, StartError,
};
pub use sinks::{ImageSink, ObjectStorageSink, TcpFrameSink, TelegramSink};
pub use transport::{HttpTransport, Transport, TransportError, build_client};
