pub mod engine;
pub mod frame;
pub mod session;
#[cfg(feature = "v4l2")]
pub mod v4l2;
pub mod virtual_engine;

pub use engine::{CaptureEngine, EngineDevice, EngineHandle, Facing, OutputTarget, StreamMode};
pub use frame::{Frame, PixelFormat, Plane};
pub use session::{CaptureSession, SessionState};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Engine;
pub use virtual_engine::VirtualEngine;
