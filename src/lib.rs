//! Camera device session manager
//!
//! Enumerates camera devices once, drives one capture session per device,
//! delivers frames through a bounded drop-oldest queue and packs YUV 4:2:0
//! plane sets into contiguous bytes.

pub mod capture;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{
    CaptureEngine, CaptureSession, Facing, Frame, OutputTarget, SessionState, StreamMode,
    VirtualEngine,
};
pub use error::{CameraError, EngineStatus, Result};
pub use pipeline::{pack, pack_with, ChromaLayout, FrameQueue, PackedBuffer};
pub use registry::{DeviceDescriptor, DeviceId, DeviceRegistry};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CAMSTREAM";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub queue: QueueConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub frame_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Frames held before the oldest is evicted; the reserved buffer count
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub still_poll_interval_ms: u64,
    pub still_max_attempts: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: PixelFormat::Yuv420,
            frame_interval_ms: 33, // 30fps
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 4 }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            still_poll_interval_ms: 30,
            still_max_attempts: 50,
        }
    }
}

impl SessionConfig {
    pub fn still_poll_interval(&self) -> Duration {
        Duration::from_millis(self.still_poll_interval_ms)
    }
}

impl Config {
    /// Load defaults, then an optional TOML file, then `CAMSTREAM__*`
    /// environment overrides (e.g. `CAMSTREAM__QUEUE__CAPACITY=8`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let loaded: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(loaded)
    }

    /// An output target sized and buffered per this configuration.
    pub fn output_target(&self) -> OutputTarget {
        OutputTarget::new(
            self.capture.width,
            self.capture.height,
            self.capture.format,
            self.queue.capacity,
        )
    }
}
