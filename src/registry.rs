//! Device discovery and ownership of capture sessions

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capture::{CaptureEngine, CaptureSession, Facing};
use crate::error::{CameraError, Result};
use crate::SessionConfig;

/// Stable device identifier, unique within a process run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable description of an enumerated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub facing: Facing,
}

/// Discovers devices once and owns at most one live session per device.
pub struct DeviceRegistry {
    engine: Arc<dyn CaptureEngine>,
    settings: SessionConfig,
    devices: OnceCell<Vec<DeviceDescriptor>>,
    sessions: Mutex<HashMap<DeviceId, Arc<CaptureSession>>>,
}

impl DeviceRegistry {
    pub fn new(engine: Arc<dyn CaptureEngine>) -> Self {
        Self::with_settings(engine, SessionConfig::default())
    }

    pub fn with_settings(engine: Arc<dyn CaptureEngine>, settings: SessionConfig) -> Self {
        Self {
            engine,
            settings,
            devices: OnceCell::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Run device discovery. Repeated and concurrent calls are safe: only the
    /// first successful call enumerates, the others wait for and observe its
    /// result. A failed discovery leaves nothing cached and may be retried.
    pub fn initialize(&self) -> Result<()> {
        self.discovered().map(|_| ())
    }

    /// The device list, discovered on first access.
    pub fn list_devices(&self) -> Result<&[DeviceDescriptor]> {
        self.discovered()
    }

    fn discovered(&self) -> Result<&[DeviceDescriptor]> {
        let devices = self.devices.get_or_try_init(|| {
            info!("Enumerating camera devices...");
            let found = self
                .engine
                .enumerate()
                .map_err(CameraError::Initialization)?;

            let devices: Vec<DeviceDescriptor> = found
                .iter()
                .zip(0u16..)
                .map(|(dev, index)| {
                    debug!(id = index, name = %dev.name, facing = ?dev.facing, "Found device");
                    DeviceDescriptor {
                        id: DeviceId(index),
                        facing: dev.facing,
                    }
                })
                .collect();
            info!("Found {} camera device(s)", devices.len());
            Ok::<_, CameraError>(devices)
        })?;
        Ok(devices)
    }

    pub fn device(&self, id: DeviceId) -> Result<DeviceDescriptor> {
        self.discovered()?
            .iter()
            .find(|dev| dev.id == id)
            .copied()
            .ok_or(CameraError::UnknownDevice(id))
    }

    pub fn facing(&self, id: DeviceId) -> Result<Facing> {
        self.device(id).map(|dev| dev.facing)
    }

    /// Open a session on `id`.
    ///
    /// Fails with `DeviceBusy` while a session for the device is open. Each
    /// device keeps one session object for the registry's lifetime; a closed
    /// one is reopened. The registry lock only guards the lookup, the engine
    /// open runs under the session's own lock.
    #[instrument(skip(self))]
    pub fn open_session(&self, id: DeviceId) -> Result<Arc<CaptureSession>> {
        let device = self.device(id)?;

        let session = {
            let mut sessions = self.sessions.lock();
            let session = sessions.entry(id).or_insert_with(|| {
                Arc::new(CaptureSession::new(
                    device,
                    Arc::clone(&self.engine),
                    self.settings.clone(),
                ))
            });
            if session.is_open() {
                return Err(CameraError::DeviceBusy(id));
            }
            Arc::clone(session)
        };

        match session.open() {
            Ok(()) => Ok(session),
            // Lost a race with another opener
            Err(CameraError::InvalidState { .. }) => Err(CameraError::DeviceBusy(id)),
            Err(e) => Err(e),
        }
    }

    /// The session for `id`, whether open or closed.
    pub fn session(&self, id: DeviceId) -> Option<Arc<CaptureSession>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Close the session for `id`. The session object stays registered and
    /// is reused by the next `open_session`.
    pub fn close_session(&self, id: DeviceId) {
        let session = self.session(id);
        if let Some(session) = session {
            session.close();
        }
    }

    /// Close every session. Called on drop.
    pub fn release(&self) {
        let sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            if session.is_open() {
                warn!(device = %session.id(), "Closing session left open");
            }
            session.close();
        }
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.release();
    }
}
