//! Frame capture collaborators: the bounded frame ring consumers peek from,
//! pixel helpers, and host capture threads that stand in for the camera.

mod capture;
pub mod rgb565;
mod ring;
mod types;

pub use capture::{spawn_image_dir_reader, spawn_synthetic_camera};
pub use ring::{FrameRing, FrameSource};
pub use types::{CaptureError, Frame, FrameGeometry, FrameView, PixelFormat};
