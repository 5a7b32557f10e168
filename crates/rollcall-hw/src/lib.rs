//! rollcall-hw: frame sources for attendance sessions.
//!
//! V4L2 camera capture and still-image sequences, both exposed through
//! [`rollcall_core::FrameSource`].

pub mod camera;
pub mod frame;
pub mod image_dir;

pub use camera::{CameraError, CameraSource, PixelFormat};
pub use image_dir::ImageSequenceSource;
