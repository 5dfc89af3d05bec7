//! Software capture engine emitting patterned YUV 4:2:0 frames

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capture::engine::{CaptureEngine, EngineDevice, EngineHandle, Facing, OutputTarget, StreamMode};
use crate::capture::frame::{Frame, PixelFormat, Plane};
use crate::error::EngineStatus;
use crate::CaptureConfig;

/// Strictly increasing nanosecond clock shared by all streams of one engine
#[derive(Clone)]
struct MonotonicClock {
    epoch: Instant,
    last: Arc<Mutex<u64>>,
}

impl MonotonicClock {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last: Arc::new(Mutex::new(0)),
        }
    }

    fn next(&self) -> u64 {
        let now = self.epoch.elapsed().as_nanos() as u64;
        let mut last = self.last.lock();
        *last = now.max(*last + 1);
        *last
    }
}

struct Worker {
    stop: flume::Sender<()>,
    join: JoinHandle<()>,
}

struct OpenDevice {
    index: u16,
    worker: Option<Worker>,
    // Stopped workers may still be delivering their last frame
    retired: Vec<JoinHandle<()>>,
}

impl OpenDevice {
    /// Signal the running worker, if any, and keep its handle until joined.
    fn retire_worker(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return false;
        };
        let _ = worker.stop.try_send(());
        let (finished, running): (Vec<_>, Vec<_>) =
            self.retired.drain(..).partition(|join| join.is_finished());
        join_workers(finished);
        self.retired = running;
        self.retired.push(worker.join);
        true
    }
}

fn join_workers(handles: Vec<JoinHandle<()>>) {
    for join in handles {
        if join.join().is_err() {
            warn!("Virtual capture worker panicked");
        }
    }
}

/// Capture engine that fabricates frames on a worker thread per stream.
///
/// Frames mimic what camera hardware hands out for YUV 4:2:0: a luma plane
/// with padded rows and two chroma views over one interleaved region.
pub struct VirtualEngine {
    devices: Vec<EngineDevice>,
    frame_interval: Duration,
    row_padding: usize,
    clock: MonotonicClock,
    next_handle: AtomicU64,
    available: AtomicBool,
    reject_streams: AtomicBool,
    claimed_elsewhere: Mutex<HashSet<u16>>,
    open: Mutex<HashMap<EngineHandle, OpenDevice>>,
}

impl VirtualEngine {
    pub fn new(facings: impl IntoIterator<Item = Facing>) -> Self {
        let devices = facings
            .into_iter()
            .enumerate()
            .map(|(i, facing)| EngineDevice {
                name: format!("virtual{i}"),
                facing,
            })
            .collect();

        Self {
            devices,
            frame_interval: Duration::from_millis(33),
            row_padding: 0,
            clock: MonotonicClock::new(),
            next_handle: AtomicU64::new(1),
            available: AtomicBool::new(true),
            reject_streams: AtomicBool::new(false),
            claimed_elsewhere: Mutex::new(HashSet::new()),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Back and front camera, like a typical phone.
    pub fn phone() -> Self {
        Self::new([Facing::Back, Facing::Front])
    }

    pub fn from_config(facings: impl IntoIterator<Item = Facing>, config: &CaptureConfig) -> Self {
        Self::new(facings).with_frame_interval(Duration::from_millis(config.frame_interval_ms))
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Extra bytes at the end of every luma and chroma row.
    pub fn with_row_padding(mut self, padding: usize) -> Self {
        self.row_padding = padding;
        self
    }

    /// Simulate the camera service going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate another process holding the device.
    pub fn claim_elsewhere(&self, index: u16) {
        self.claimed_elsewhere.lock().insert(index);
    }

    pub fn release_elsewhere(&self, index: u16) {
        self.claimed_elsewhere.lock().remove(&index);
    }

    /// Make every subsequent stream configuration fail.
    pub fn set_reject_streams(&self, reject: bool) {
        self.reject_streams.store(reject, Ordering::SeqCst);
    }

    /// Number of devices currently held open through this engine.
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    fn spawn_worker(
        &self,
        index: u16,
        target: OutputTarget,
        mode: StreamMode,
    ) -> Result<Worker, EngineStatus> {
        let (stop, stop_rx) = flume::bounded::<()>(1);
        let clock = self.clock.clone();
        let interval = self.frame_interval;
        let padding = self.row_padding;

        let join = thread::Builder::new()
            .name(format!("virtual-capture-{index}"))
            .spawn(move || {
                let mut sequence = 0u64;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(flume::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }

                    let frame = synthesize(&target, clock.next(), sequence, padding);
                    target.deliver(frame);
                    sequence += 1;

                    if mode == StreamMode::SingleShot {
                        break;
                    }
                }
                debug!(device = index, frames = sequence, "Virtual stream finished");
            })?;

        Ok(Worker { stop, join })
    }
}

impl CaptureEngine for VirtualEngine {
    fn enumerate(&self) -> Result<Vec<EngineDevice>, EngineStatus> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(EngineStatus::ServiceUnavailable);
        }
        Ok(self.devices.clone())
    }

    #[instrument(skip(self))]
    fn open(&self, index: u16) -> Result<EngineHandle, EngineStatus> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(EngineStatus::ServiceUnavailable);
        }
        if usize::from(index) >= self.devices.len() {
            return Err(EngineStatus::InvalidParameter(format!(
                "no device at index {index}"
            )));
        }
        if self.claimed_elsewhere.lock().contains(&index) {
            return Err(EngineStatus::CameraInUse);
        }

        let mut open = self.open.lock();
        if open.values().any(|dev| dev.index == index) {
            return Err(EngineStatus::CameraInUse);
        }

        let handle = EngineHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        open.insert(
            handle,
            OpenDevice {
                index,
                worker: None,
                retired: Vec::new(),
            },
        );
        info!("Opened virtual device {} as {}", index, handle);
        Ok(handle)
    }

    #[instrument(skip(self, target))]
    fn configure_stream(
        &self,
        handle: EngineHandle,
        target: OutputTarget,
        mode: StreamMode,
    ) -> Result<(), EngineStatus> {
        if self.reject_streams.load(Ordering::SeqCst) {
            return Err(EngineStatus::StreamConfigureFail(
                "stream configuration rejected".into(),
            ));
        }
        if !target.format.is_yuv420() {
            return Err(EngineStatus::StreamConfigureFail(format!(
                "virtual devices only produce YUV 4:2:0, not {}",
                target.format
            )));
        }
        if target.width == 0 || target.height == 0 {
            return Err(EngineStatus::InvalidParameter(format!(
                "invalid target size {}x{}",
                target.width, target.height
            )));
        }

        // Previous workers must be gone before a new stream starts
        let retired = {
            let mut open = self.open.lock();
            let device = open
                .get_mut(&handle)
                .ok_or_else(|| EngineStatus::InvalidParameter(format!("unknown {handle}")))?;
            if device.retire_worker() {
                warn!("Replacing running stream on {}", handle);
            }
            std::mem::take(&mut device.retired)
        };
        join_workers(retired);

        let mut open = self.open.lock();
        let device = open
            .get_mut(&handle)
            .ok_or_else(|| EngineStatus::InvalidParameter(format!("unknown {handle}")))?;
        device.worker = Some(self.spawn_worker(device.index, target, mode)?);
        Ok(())
    }

    fn stop(&self, handle: EngineHandle) {
        let mut open = self.open.lock();
        if let Some(device) = open.get_mut(&handle) {
            // Signal only; an in-flight frame may still be delivered.
            if device.retire_worker() {
                debug!("Stopped stream on {}", handle);
            }
        }
    }

    fn close(&self, handle: EngineHandle) {
        let device = self.open.lock().remove(&handle);
        let Some(mut device) = device else {
            return;
        };

        device.retire_worker();
        join_workers(device.retired);
        info!("Closed virtual device {} ({})", device.index, handle);
    }
}

impl Drop for VirtualEngine {
    fn drop(&mut self) {
        let handles: Vec<EngineHandle> = self.open.lock().keys().copied().collect();
        for handle in handles {
            self.close(handle);
        }
    }
}

/// Build one frame in the target's geometry with aliasing chroma views.
fn synthesize(target: &OutputTarget, timestamp: u64, sequence: u64, padding: usize) -> Frame {
    let (w, h) = (target.width as usize, target.height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let luma_stride = w + padding;
    let chroma_stride = (2 * cw).max(luma_stride);
    let seq = sequence as usize;

    let mut buf = vec![0u8; luma_stride * h + chroma_stride * ch + 1];
    for y in 0..h {
        for x in 0..w {
            buf[y * luma_stride + x] = ((x + y + seq) & 0xff) as u8;
        }
    }

    // NV21 stores V first in each pair
    let (u_offset, v_offset) = match target.format {
        PixelFormat::Nv21 => (1, 0),
        _ => (0, 1),
    };
    let chroma_base = luma_stride * h;
    for row in 0..ch {
        for col in 0..cw {
            let at = chroma_base + row * chroma_stride + col * 2;
            buf[at + u_offset] = (128 + seq) as u8;
            buf[at + v_offset] = (64 + seq + col) as u8;
        }
    }

    let buf = Bytes::from(buf);
    let chroma_len = (ch - 1) * chroma_stride + (cw - 1) * 2 + 1;
    let u_start = chroma_base + u_offset;
    let v_start = chroma_base + v_offset;

    Frame::new(
        target.format,
        target.width,
        target.height,
        timestamp,
        vec![
            Plane::new(buf.slice(0..luma_stride * h), luma_stride, 1),
            Plane::new(buf.slice(u_start..u_start + chroma_len), chroma_stride, 2),
            Plane::new(buf.slice(v_start..v_start + chroma_len), chroma_stride, 2),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pack;

    fn target(capacity: usize) -> OutputTarget {
        OutputTarget::new(8, 6, PixelFormat::Yuv420, capacity)
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = MonotonicClock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let ts = clock.next();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn synthesized_frames_pack_cleanly() {
        let frame = synthesize(&target(1), 5, 3, 7);
        assert_eq!(frame.planes.len(), 3);
        assert_eq!(frame.planes[0].row_stride, 15);

        let packed = pack(&frame).unwrap();
        assert_eq!(packed.len(), 8 * 6 * 3 / 2);
        assert_eq!(packed.luma()[0], 3);
        assert_eq!(packed.luma()[9], 5); // x=1, y=1, seq=3
        // U region then V region
        assert!(packed.chroma()[..12].iter().all(|&b| b == 131));
        assert_eq!(packed.chroma()[12], 67);
    }

    #[test]
    fn device_claimed_twice_is_in_use() {
        let engine = VirtualEngine::phone();
        let handle = engine.open(0).unwrap();
        assert!(matches!(engine.open(0), Err(EngineStatus::CameraInUse)));
        engine.close(handle);
        let again = engine.open(0).unwrap();
        assert_ne!(handle, again);
        engine.close(again);
        assert_eq!(engine.open_count(), 0);
    }

    #[test]
    fn unavailable_engine_fails_enumeration() {
        let engine = VirtualEngine::phone();
        engine.set_available(false);
        assert!(matches!(
            engine.enumerate(),
            Err(EngineStatus::ServiceUnavailable)
        ));
        engine.set_available(true);
        assert_eq!(engine.enumerate().unwrap().len(), 2);
    }

    #[test]
    fn single_shot_delivers_one_frame() {
        let engine = VirtualEngine::phone().with_frame_interval(Duration::from_millis(1));
        let handle = engine.open(1).unwrap();
        let target = target(4);
        engine
            .configure_stream(handle, target.clone(), StreamMode::SingleShot)
            .unwrap();

        let frame = target.queue().poll_next(Duration::from_secs(5));
        assert!(frame.is_some());
        engine.close(handle);
        assert!(target.queue().is_empty());
        assert_eq!(target.queue().stats().pushed, 1);
    }

    #[test]
    fn rejects_non_yuv_targets() {
        let engine = VirtualEngine::phone();
        let handle = engine.open(0).unwrap();
        let rgb = OutputTarget::new(4, 4, PixelFormat::Rgb24, 2);
        assert!(matches!(
            engine.configure_stream(handle, rgb, StreamMode::Repeating),
            Err(EngineStatus::StreamConfigureFail(_))
        ));
        engine.close(handle);
    }

    #[test]
    fn restarting_joins_stopped_workers() {
        let engine = VirtualEngine::phone().with_frame_interval(Duration::from_millis(1));
        let handle = engine.open(0).unwrap();
        let retired = |engine: &VirtualEngine| engine.open.lock()[&handle].retired.len();

        for _ in 0..200 {
            engine
                .configure_stream(handle, target(2), StreamMode::Repeating)
                .unwrap();
            assert_eq!(retired(&engine), 0);
            engine.stop(handle);
            assert!(retired(&engine) <= 1);
        }
        engine.close(handle);
        assert_eq!(engine.open_count(), 0);
    }
}
