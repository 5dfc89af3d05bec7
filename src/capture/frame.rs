use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Pixel formats a capture engine may emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Flexible YUV 4:2:0, three plane views (Y, U, V)
    Yuv420,
    /// Semi-planar 4:2:0, interleaved U/V
    Nv12,
    /// Semi-planar 4:2:0, interleaved V/U
    Nv21,
    Yuyv,
    Rgb24,
    Mjpeg,
}

impl PixelFormat {
    /// True for the 4:2:0 formats whose planes the packer understands.
    pub fn is_yuv420(self) -> bool {
        matches!(self, PixelFormat::Yuv420 | PixelFormat::Nv12 | PixelFormat::Nv21)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Yuv420 => "YUV_420_888",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Mjpeg => "MJPEG",
        };
        f.write_str(name)
    }
}

/// Read-only view of one image plane.
///
/// Views of the same frame may share backing memory: the two chroma views of a
/// semi-planar frame are usually offset by one byte into the same interleaved
/// region. Readers must go through `row_stride` / `pixel_stride` and never
/// assume a plane is densely packed.
#[derive(Clone)]
pub struct Plane {
    pub row_stride: usize,
    pub pixel_stride: usize,
    data: Bytes,
}

impl Plane {
    pub fn new(data: Bytes, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            row_stride,
            pixel_stride,
            data,
        }
    }

    pub fn byte_length(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plane")
            .field("row_stride", &self.row_stride)
            .field("pixel_stride", &self.pixel_stride)
            .field("byte_length", &self.data.len())
            .finish()
    }
}

/// A captured image.
///
/// Owned by the frame queue until polled, then by the consumer until released.
/// Releasing consumes the frame, so its planes cannot be read afterwards.
#[derive(Debug)]
pub struct Frame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture time, strictly increasing within one stream
    pub timestamp_nanos: u64,
    pub planes: Vec<Plane>,
}

impl Frame {
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        timestamp_nanos: u64,
        planes: Vec<Plane>,
    ) -> Self {
        Self {
            format,
            width,
            height,
            timestamp_nanos,
            planes,
        }
    }

    /// Hand the frame's buffers back.
    pub fn release(self) {
        trace!(timestamp = self.timestamp_nanos, "frame released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chroma_views_can_alias_one_region() {
        let region = Bytes::from_static(&[10, 20, 11, 21, 12, 22, 13, 23]);
        let u = Plane::new(region.slice(0..7), 4, 2);
        let v = Plane::new(region.slice(1..8), 4, 2);

        assert_eq!(u.data()[0], 10);
        assert_eq!(v.data()[0], 20);
        assert_eq!(u.byte_length(), 7);
        assert_eq!(v.data()[2], 21);
    }

    #[test]
    fn yuv420_family() {
        assert!(PixelFormat::Yuv420.is_yuv420());
        assert!(PixelFormat::Nv21.is_yuv420());
        assert!(!PixelFormat::Mjpeg.is_yuv420());
        assert_eq!(PixelFormat::Nv12.to_string(), "NV12");
    }
}
