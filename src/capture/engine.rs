//! Boundary to the capture engine that owns the physical devices

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::EngineStatus;
use crate::pipeline::FrameQueue;

/// Lens direction of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facing {
    Front,
    Back,
    External,
}

/// What the engine reports for each device during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDevice {
    pub name: String,
    pub facing: Facing,
}

/// Opaque handle to an opened physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub u64);

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Request kind bound to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamMode {
    /// Continuous frames until stopped
    Repeating,
    /// One frame
    SingleShot,
}

/// Output surface frames are delivered into.
///
/// Cloning shares the underlying queue.
#[derive(Clone)]
pub struct OutputTarget {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    queue: Arc<FrameQueue>,
}

impl OutputTarget {
    /// A target backed by a fresh queue holding up to `capacity` frames.
    pub fn new(width: u32, height: u32, format: PixelFormat, capacity: usize) -> Self {
        Self::with_queue(width, height, format, Arc::new(FrameQueue::new(capacity)))
    }

    pub fn with_queue(width: u32, height: u32, format: PixelFormat, queue: Arc<FrameQueue>) -> Self {
        Self {
            width,
            height,
            format,
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    /// Frame delivery entry point for engines. Never blocks.
    pub fn deliver(&self, frame: Frame) -> bool {
        self.queue.push(frame)
    }
}

impl fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputTarget")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

/// A capture engine able to open, stream from and close physical devices.
///
/// Frames are delivered asynchronously from the engine's own context through
/// [`OutputTarget::deliver`]. `stop` halts future scheduling but may let
/// frames already in flight land in the target afterwards.
pub trait CaptureEngine: Send + Sync {
    /// Discover devices. Fails if the engine cannot be reached.
    fn enumerate(&self) -> Result<Vec<EngineDevice>, EngineStatus>;

    /// Claim the device at `index` in enumeration order.
    fn open(&self, index: u16) -> Result<EngineHandle, EngineStatus>;

    fn configure_stream(
        &self,
        handle: EngineHandle,
        target: OutputTarget,
        mode: StreamMode,
    ) -> Result<(), EngineStatus>;

    fn stop(&self, handle: EngineHandle);

    fn close(&self, handle: EngineHandle);
}
