//! V4L2 capture engine streaming NV12 through memory-mapped buffers

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::engine::{CaptureEngine, EngineDevice, EngineHandle, Facing, OutputTarget, StreamMode};
use crate::capture::frame::{Frame, PixelFormat, Plane};
use crate::error::EngineStatus;

const MAX_NODES: usize = 64;

struct Worker {
    stop: flume::Sender<()>,
    join: JoinHandle<()>,
}

struct OpenNode {
    index: u16,
    device: Arc<Device>,
    worker: Option<Worker>,
    retired: Vec<JoinHandle<()>>,
}

impl OpenNode {
    /// Signal the running worker, if any, and keep its handle until joined.
    fn retire_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.stop.try_send(());
        let (finished, running): (Vec<_>, Vec<_>) =
            self.retired.drain(..).partition(|join| join.is_finished());
        join_workers(finished);
        self.retired = running;
        self.retired.push(worker.join);
    }
}

fn join_workers(handles: Vec<JoinHandle<()>>) {
    for join in handles {
        if join.join().is_err() {
            warn!("V4L2 capture worker panicked");
        }
    }
}

/// Capture engine over Linux V4L2 capture nodes.
///
/// Every node with the video-capture capability is reported as an
/// `External` device. Streams are negotiated as NV12; the interleaved chroma
/// region is exposed as two aliasing plane views.
pub struct V4l2Engine {
    buffer_count: u32,
    nodes: Mutex<Vec<PathBuf>>,
    next_handle: AtomicU64,
    open: Mutex<HashMap<EngineHandle, OpenNode>>,
}

impl V4l2Engine {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(2),
            nodes: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn spawn_worker(
        &self,
        index: u16,
        device: Arc<Device>,
        stride: usize,
        target: OutputTarget,
        mode: StreamMode,
    ) -> Result<Worker, EngineStatus> {
        let (stop, stop_rx) = flume::bounded::<()>(1);
        let buffer_count = self.buffer_count;

        let join = thread::Builder::new()
            .name(format!("v4l2-capture-{index}"))
            .spawn(move || {
                let mut stream =
                    match MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count) {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("Failed to start capture stream: {}", e);
                            return;
                        }
                    };
                info!("Capture stream started with {} buffers", buffer_count);

                let mut last_timestamp = 0u64;
                loop {
                    if !matches!(stop_rx.try_recv(), Err(flume::TryRecvError::Empty)) {
                        break;
                    }

                    let (buf, meta) = match stream.next() {
                        Ok(next) => next,
                        Err(e) => {
                            error!("Capture error: {}", e);
                            thread::sleep(Duration::from_millis(10));
                            continue;
                        }
                    };

                    let device_ns = (meta.timestamp.sec as u64) * 1_000_000_000
                        + (meta.timestamp.usec as u64) * 1_000;
                    let timestamp = device_ns.max(last_timestamp + 1);
                    last_timestamp = timestamp;

                    match nv12_frame(buf, stride, &target, timestamp) {
                        Some(frame) => {
                            target.deliver(frame);
                        }
                        None => {
                            warn!(len = buf.len(), "Short NV12 buffer, frame skipped");
                            continue;
                        }
                    }

                    if mode == StreamMode::SingleShot {
                        break;
                    }
                }
                debug!(device = index, "V4L2 stream finished");
            })?;

        Ok(Worker { stop, join })
    }
}

impl Default for V4l2Engine {
    fn default() -> Self {
        Self::new(4)
    }
}

fn probe(path: &Path) -> Option<String> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    caps.capabilities
        .contains(CapFlags::VIDEO_CAPTURE)
        .then(|| format!("{} ({})", caps.card, caps.driver))
}

impl CaptureEngine for V4l2Engine {
    fn enumerate(&self) -> Result<Vec<EngineDevice>, EngineStatus> {
        info!("Scanning V4L2 capture nodes...");
        if !Path::new("/dev").is_dir() {
            return Err(EngineStatus::ServiceUnavailable);
        }

        let mut nodes = Vec::new();
        let mut devices = Vec::new();
        for i in 0..MAX_NODES {
            let path = PathBuf::from(format!("/dev/video{}", i));
            if !path.exists() {
                continue;
            }
            if let Some(name) = probe(&path) {
                info!("Found capture device: {} - {}", path.display(), name);
                devices.push(EngineDevice {
                    name,
                    facing: Facing::External,
                });
                nodes.push(path);
            }
        }

        *self.nodes.lock() = nodes;
        Ok(devices)
    }

    #[instrument(skip(self))]
    fn open(&self, index: u16) -> Result<EngineHandle, EngineStatus> {
        let path = self
            .nodes
            .lock()
            .get(usize::from(index))
            .cloned()
            .ok_or_else(|| EngineStatus::InvalidParameter(format!("no capture node {index}")))?;

        let mut open = self.open.lock();
        if open.values().any(|node| node.index == index) {
            return Err(EngineStatus::CameraInUse);
        }

        let device = Device::with_path(&path)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(EngineStatus::InvalidParameter(format!(
                "{} doesn't support video capture",
                path.display()
            )));
        }

        let handle = EngineHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        open.insert(
            handle,
            OpenNode {
                index,
                device: Arc::new(device),
                worker: None,
                retired: Vec::new(),
            },
        );
        Ok(handle)
    }

    #[instrument(skip(self, target))]
    fn configure_stream(
        &self,
        handle: EngineHandle,
        target: OutputTarget,
        mode: StreamMode,
    ) -> Result<(), EngineStatus> {
        if !matches!(target.format, PixelFormat::Nv12 | PixelFormat::Yuv420) {
            return Err(EngineStatus::StreamConfigureFail(format!(
                "V4L2 streams are negotiated as NV12, not {}",
                target.format
            )));
        }

        if target.width == 0 || target.height == 0 {
            return Err(EngineStatus::InvalidParameter(format!(
                "invalid target size {}x{}",
                target.width, target.height
            )));
        }

        // The old stream must release its buffers before the format changes.
        // A worker blocked in `next()` exits after at most one frame.
        let retired = {
            let mut open = self.open.lock();
            let node = open
                .get_mut(&handle)
                .ok_or_else(|| EngineStatus::InvalidParameter(format!("unknown {handle}")))?;
            node.retire_worker();
            std::mem::take(&mut node.retired)
        };
        join_workers(retired);

        let mut open = self.open.lock();
        let node = open
            .get_mut(&handle)
            .ok_or_else(|| EngineStatus::InvalidParameter(format!("unknown {handle}")))?;

        let mut fmt = node.device.format()?;
        fmt.width = target.width;
        fmt.height = target.height;
        fmt.fourcc = FourCC::new(b"NV12");
        let fmt = node.device.set_format(&fmt)?;

        if fmt.fourcc != FourCC::new(b"NV12") || fmt.width != target.width || fmt.height != target.height {
            return Err(EngineStatus::StreamConfigureFail(format!(
                "driver negotiated {} {}x{}",
                fmt.fourcc, fmt.width, fmt.height
            )));
        }

        let stride = (fmt.stride as usize).max(fmt.width as usize);
        let worker = self.spawn_worker(node.index, Arc::clone(&node.device), stride, target, mode)?;
        node.worker = Some(worker);
        Ok(())
    }

    fn stop(&self, handle: EngineHandle) {
        let mut open = self.open.lock();
        if let Some(node) = open.get_mut(&handle) {
            node.retire_worker();
        }
    }

    fn close(&self, handle: EngineHandle) {
        let node = self.open.lock().remove(&handle);
        let Some(mut node) = node else {
            return;
        };
        node.retire_worker();
        join_workers(node.retired);
        info!("Closed capture node {} ({})", node.index, handle);
    }
}

impl Drop for V4l2Engine {
    fn drop(&mut self) {
        let handles: Vec<EngineHandle> = self.open.lock().keys().copied().collect();
        for handle in handles {
            self.close(handle);
        }
    }
}

/// Split a contiguous NV12 buffer into a luma view and two aliasing chroma views.
fn nv12_frame(buf: &[u8], stride: usize, target: &OutputTarget, timestamp: u64) -> Option<Frame> {
    let (w, h) = (target.width as usize, target.height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let luma_len = stride * h;
    let chroma_len = (ch - 1) * stride + (cw - 1) * 2 + 1;
    if buf.len() < luma_len + chroma_len + 1 {
        return None;
    }

    let data = Bytes::copy_from_slice(buf);
    Some(Frame::new(
        target.format,
        target.width,
        target.height,
        timestamp,
        vec![
            Plane::new(data.slice(0..luma_len), stride, 1),
            Plane::new(data.slice(luma_len..luma_len + chroma_len), stride, 2),
            Plane::new(data.slice(luma_len + 1..luma_len + 1 + chroma_len), stride, 2),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_split_aliases_chroma() {
        let target = OutputTarget::new(4, 2, PixelFormat::Nv12, 1);
        // stride 6: luma rows of 4 + 2 padding, one chroma row
        let buf = [0, 1, 2, 3, 9, 9, 4, 5, 6, 7, 9, 9, 50, 60, 51, 61, 9, 9];
        let frame = nv12_frame(&buf, 6, &target, 1).unwrap();

        assert_eq!(frame.planes[1].data(), &[50, 60, 51]);
        assert_eq!(frame.planes[2].data(), &[60, 51, 61]);

        let packed = crate::pipeline::pack(&frame).unwrap();
        assert_eq!(packed.as_bytes(), &[0, 1, 2, 3, 4, 5, 6, 7, 50, 51, 60, 61]);
    }

    #[test]
    fn short_buffer_is_skipped() {
        let target = OutputTarget::new(4, 2, PixelFormat::Nv12, 1);
        assert!(nv12_frame(&[0; 10], 4, &target, 1).is_none());
    }

    #[test]
    #[ignore = "requires a V4L2 capture device"]
    fn enumerates_real_devices() {
        let engine = V4l2Engine::default();
        let devices = engine.enumerate().unwrap();
        for dev in &devices {
            assert_eq!(dev.facing, Facing::External);
        }
    }

    #[test]
    #[ignore = "requires a V4L2 capture device"]
    fn restart_after_stop_renegotiates() {
        let engine = V4l2Engine::default();
        if engine.enumerate().unwrap().is_empty() {
            return;
        }
        let handle = engine.open(0).unwrap();
        for _ in 0..3 {
            let target = OutputTarget::new(640, 480, PixelFormat::Nv12, 2);
            engine
                .configure_stream(handle, target.clone(), StreamMode::Repeating)
                .unwrap();
            assert!(target.queue().poll_next(Duration::from_secs(2)).is_some());
            engine.stop(handle);
        }
        engine.close(handle);
    }
}
