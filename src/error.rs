//! Error types for device, session, delivery and packing operations

use std::time::Duration;

use thiserror::Error;

use crate::capture::session::SessionState;
use crate::DeviceId;

/// Result type alias for camstream operations
pub type Result<T> = std::result::Result<T, CameraError>;

/// Failure codes reported by a capture engine
#[derive(Debug, Error)]
pub enum EngineStatus {
    #[error("camera operation has failed due to an unspecified cause")]
    Unknown,

    #[error("camera operation has failed due to an invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("camera device has been closed, possibly because a higher-priority client has taken ownership of it")]
    Disconnected,

    #[error("camera device is being used by another higher priority camera client")]
    CameraInUse,

    #[error("the system-wide limit for open cameras has been reached")]
    MaxCamerasInUse,

    #[error("the camera is disabled due to a device policy and cannot be opened")]
    Disabled,

    #[error("the application does not have permission to open the camera")]
    PermissionDenied,

    #[error("camera device does not support the requested stream configuration: {0}")]
    StreamConfigureFail(String),

    #[error("the camera service has encountered a fatal error or cannot be reached")]
    ServiceUnavailable,

    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers of the registry, sessions, queue and packer
#[derive(Debug, Error)]
pub enum CameraError {
    /// Device discovery failed; safe to retry
    #[error("capture engine could not be initialized: {0}")]
    Initialization(#[source] EngineStatus),

    #[error("no camera device with id {0}")]
    UnknownDevice(DeviceId),

    /// A session is already open for the device
    #[error("camera device {0} already has an open session")]
    DeviceBusy(DeviceId),

    #[error("failed to open camera device {id}: {source}")]
    DeviceOpen {
        id: DeviceId,
        #[source]
        source: EngineStatus,
    },

    #[error("cannot {op} while session is {state:?}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error("engine rejected stream configuration for device {id}: {source}")]
    StreamConfigure {
        id: DeviceId,
        #[source]
        source: EngineStatus,
    },

    /// Single-shot capture produced no frame within the retry window
    #[error("no frame captured after {attempts} attempts ({waited:?})")]
    CaptureTimeout { attempts: u32, waited: Duration },

    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    /// A plane holds fewer bytes than its declared geometry requires
    #[error("plane {plane} is too short: {required} bytes required, {actual} available")]
    ShortRead {
        plane: usize,
        required: usize,
        actual: usize,
    },

    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
