//! Per-device capture session state machine

use std::sync::Arc;
use std::time::Instant;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capture::engine::{CaptureEngine, EngineHandle, OutputTarget, StreamMode};
use crate::capture::frame::Frame;
use crate::error::{CameraError, Result};
use crate::registry::{DeviceDescriptor, DeviceId};
use crate::SessionConfig;

/// Lifecycle of a capture session.
///
/// `Closed -> Opening -> Idle -> Configuring -> Active -> Stopping -> Idle -> Closing -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Idle,
    Configuring,
    Active(StreamMode),
    Stopping,
    Closing,
}

#[derive(Default)]
struct Inner {
    handle: Option<EngineHandle>,
    target: Option<OutputTarget>,
}

/// Capture session bound to one device.
///
/// Transitions are serialized by a per-session lock; `state()` is a lock-free
/// snapshot and may be observed mid-transition.
pub struct CaptureSession {
    device: DeviceDescriptor,
    engine: Arc<dyn CaptureEngine>,
    settings: SessionConfig,
    state: AtomicCell<SessionState>,
    inner: Mutex<Inner>,
}

impl CaptureSession {
    pub(crate) fn new(
        device: DeviceDescriptor,
        engine: Arc<dyn CaptureEngine>,
        settings: SessionConfig,
    ) -> Self {
        Self {
            device,
            engine,
            settings,
            state: AtomicCell::new(SessionState::Closed),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn id(&self) -> DeviceId {
        self.device.id
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Request kind of the running stream, if any.
    pub fn mode(&self) -> Option<StreamMode> {
        match self.state() {
            SessionState::Active(mode) => Some(mode),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() != SessionState::Closed
    }

    /// Target the current stream delivers into.
    pub fn target(&self) -> Option<OutputTarget> {
        self.inner.lock().target.clone()
    }

    /// Acquire the physical device. On failure the session stays `Closed`.
    #[instrument(skip(self), fields(device = %self.device.id))]
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = self.state();
        if state != SessionState::Closed {
            return Err(CameraError::InvalidState { op: "open", state });
        }

        self.state.store(SessionState::Opening);
        match self.engine.open(self.device.id.0) {
            Ok(handle) => {
                inner.handle = Some(handle);
                self.state.store(SessionState::Idle);
                info!("Session opened");
                Ok(())
            }
            Err(source) => {
                self.state.store(SessionState::Closed);
                warn!(error = %source, "Failed to open device");
                Err(CameraError::DeviceOpen {
                    id: self.device.id,
                    source,
                })
            }
        }
    }

    /// Stream frames into `target` until stopped.
    pub fn start_repeating(&self, target: OutputTarget) -> Result<()> {
        self.start(target, StreamMode::Repeating)
    }

    /// Request a single frame into `target`.
    pub fn start_capture(&self, target: OutputTarget) -> Result<()> {
        self.start(target, StreamMode::SingleShot)
    }

    #[instrument(skip(self, target), fields(device = %self.device.id))]
    fn start(&self, target: OutputTarget, mode: StreamMode) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = self.state();
        let handle = match (state, inner.handle) {
            (SessionState::Idle, Some(handle)) => handle,
            _ => {
                return Err(CameraError::InvalidState {
                    op: "start streaming",
                    state,
                })
            }
        };

        self.state.store(SessionState::Configuring);
        match self.engine.configure_stream(handle, target.clone(), mode) {
            Ok(()) => {
                inner.target = Some(target);
                self.state.store(SessionState::Active(mode));
                info!(?mode, "Streaming started");
                Ok(())
            }
            Err(source) => {
                self.state.store(SessionState::Idle);
                Err(CameraError::StreamConfigure {
                    id: self.device.id,
                    source,
                })
            }
        }
    }

    /// Halt frame production. Frames already in flight may still reach the
    /// target after this returns. No-op unless the session is streaming.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner);
    }

    fn stop_locked(&self, inner: &mut Inner) {
        if !matches!(self.state(), SessionState::Active(_)) {
            return;
        }
        self.state.store(SessionState::Stopping);
        if let Some(handle) = inner.handle {
            self.engine.stop(handle);
        }
        inner.target = None;
        self.state.store(SessionState::Idle);
        debug!(device = %self.device.id, "Streaming stopped");
    }

    /// Release the physical device, stopping any stream first. Closing a
    /// closed session does nothing.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if self.state() == SessionState::Closed {
            return;
        }

        self.stop_locked(&mut inner);
        self.state.store(SessionState::Closing);
        if let Some(handle) = inner.handle.take() {
            self.engine.close(handle);
        }
        inner.target = None;
        self.state.store(SessionState::Closed);
        info!(device = %self.device.id, "Session closed");
    }

    /// Capture one frame: start a single-shot request, wait for the frame
    /// with repeated short polls, then stop.
    ///
    /// Frames left in the target's queue from an earlier stream are discarded
    /// first. Fails with `CaptureTimeout` if nothing arrives within
    /// `still_max_attempts` polls.
    #[instrument(skip(self, target), fields(device = %self.device.id))]
    pub fn capture_still(&self, target: OutputTarget) -> Result<Frame> {
        let queue = Arc::clone(target.queue());
        queue.clear();
        self.start_capture(target)?;

        let started = Instant::now();
        let interval = self.settings.still_poll_interval();
        let attempts = self.settings.still_max_attempts;
        let frame = (0..attempts).find_map(|_| queue.poll_next(interval));
        self.stop();

        match frame {
            Some(frame) => {
                debug!(timestamp = frame.timestamp_nanos, "Still captured");
                Ok(frame)
            }
            None => Err(CameraError::CaptureTimeout {
                attempts,
                waited: started.elapsed(),
            }),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device", &self.device)
            .field("state", &self.state())
            .finish()
    }
}
