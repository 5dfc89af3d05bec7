//! YUV 4:2:0 plane set to contiguous packed bytes
//!
//! Hardware planes carry their own row and pixel strides, and the two chroma
//! views of a semi-planar frame usually overlap in memory. Every plane is read
//! through its declared strides only; the output is Y first, then chroma, no
//! header.

use std::io::Write;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::capture::{Frame, PixelFormat, Plane};
use crate::error::{CameraError, Result};

/// Order of chroma samples after the luma region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChromaLayout {
    /// All samples of chroma plane 0, then all samples of chroma plane 1
    #[default]
    Planar,
    /// Alternating plane 0 / plane 1 samples
    Interleaved,
}

/// Packed output of one frame; owned by the caller
#[derive(Debug, Clone)]
pub struct PackedBuffer {
    pub width: u32,
    pub height: u32,
    pub layout: ChromaLayout,
    data: Bytes,
}

impl PackedBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Luma region, `width * height` bytes.
    pub fn luma(&self) -> &[u8] {
        &self.data[..self.width as usize * self.height as usize]
    }

    /// Everything after the luma region.
    pub fn chroma(&self) -> &[u8] {
        &self.data[self.width as usize * self.height as usize..]
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Write raw packed bytes, no header.
    pub fn write_to<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&self.data)?;
        writer.flush()
    }
}

/// Packed length for a 4:2:0 frame: luma plus two quarter-size chroma regions.
pub fn packed_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = chroma_dims(w, h);
    w * h + 2 * cw * ch
}

fn chroma_dims(width: usize, height: usize) -> (usize, usize) {
    (width.div_ceil(2), height.div_ceil(2))
}

/// Pack with planar chroma.
pub fn pack(frame: &Frame) -> Result<PackedBuffer> {
    pack_with(frame, ChromaLayout::Planar)
}

#[instrument(skip(frame), fields(width = frame.width, height = frame.height, format = %frame.format))]
pub fn pack_with(frame: &Frame, layout: ChromaLayout) -> Result<PackedBuffer> {
    let started = Instant::now();

    if !frame.format.is_yuv420() {
        return Err(CameraError::UnsupportedFormat(format!(
            "{} cannot be packed as YUV 4:2:0",
            frame.format
        )));
    }
    if frame.width == 0 || frame.height == 0 {
        return Err(CameraError::UnsupportedFormat(format!(
            "empty {}x{} frame",
            frame.width, frame.height
        )));
    }
    if frame.planes.len() != 3 {
        return Err(CameraError::UnsupportedFormat(format!(
            "{} frame has {} planes, expected 3",
            frame.format,
            frame.planes.len()
        )));
    }

    let (w, h) = (frame.width as usize, frame.height as usize);
    let (cw, ch) = chroma_dims(w, h);
    let (luma, cb, cr) = (&frame.planes[0], &frame.planes[1], &frame.planes[2]);

    check_plane(0, luma, w, h)?;
    check_plane(1, cb, cw, ch)?;
    check_plane(2, cr, cw, ch)?;

    let mut out = BytesMut::with_capacity(packed_len(frame.width, frame.height));
    copy_plane(luma, w, h, &mut out);

    match layout {
        ChromaLayout::Planar => {
            copy_plane(cb, cw, ch, &mut out);
            copy_plane(cr, cw, ch, &mut out);
        }
        ChromaLayout::Interleaved => {
            for row in 0..ch {
                for col in 0..cw {
                    out.extend_from_slice(&[sample(cb, row, col), sample(cr, row, col)]);
                }
            }
        }
    }

    let elapsed = started.elapsed();
    metrics::histogram!("camstream_pack_time_us").record(elapsed.as_micros() as f64);
    debug!(bytes = out.len(), ?layout, ?elapsed, "Packed frame");

    Ok(PackedBuffer {
        width: frame.width,
        height: frame.height,
        layout,
        data: out.freeze(),
    })
}

/// Bytes one row of `cols` samples spans, `None` on overflow.
fn row_span(plane: &Plane, cols: usize) -> Option<usize> {
    cols.checked_sub(1)?.checked_mul(plane.pixel_stride)?.checked_add(1)
}

/// Bytes a plane must hold to address `rows x cols` samples through its
/// strides, `None` if that is not addressable.
fn required_len(plane: &Plane, cols: usize, rows: usize) -> Option<usize> {
    if cols == 0 || rows == 0 {
        return Some(0);
    }
    (rows - 1)
        .checked_mul(plane.row_stride)?
        .checked_add(row_span(plane, cols)?)
}

fn check_plane(index: usize, plane: &Plane, cols: usize, rows: usize) -> Result<()> {
    if plane.pixel_stride == 0 {
        return Err(CameraError::UnsupportedFormat(format!(
            "plane {index} declares a zero pixel stride"
        )));
    }
    let (Some(span), Some(required)) = (row_span(plane, cols), required_len(plane, cols, rows))
    else {
        return Err(CameraError::UnsupportedFormat(format!(
            "plane {index} strides ({}, {}) overflow the address space",
            plane.row_stride, plane.pixel_stride
        )));
    };
    if rows > 1 && plane.row_stride < span {
        return Err(CameraError::UnsupportedFormat(format!(
            "plane {index} row stride {} is narrower than {cols} samples",
            plane.row_stride
        )));
    }

    if plane.byte_length() < required {
        return Err(CameraError::ShortRead {
            plane: index,
            required,
            actual: plane.byte_length(),
        });
    }
    Ok(())
}

#[inline]
fn sample(plane: &Plane, row: usize, col: usize) -> u8 {
    plane.data()[row * plane.row_stride + col * plane.pixel_stride]
}

fn copy_plane(plane: &Plane, cols: usize, rows: usize, out: &mut BytesMut) {
    let data = plane.data();
    for row in 0..rows {
        let start = row * plane.row_stride;
        if plane.pixel_stride == 1 {
            // Dense row: strip the padding in one copy
            out.extend_from_slice(&data[start..start + cols]);
        } else {
            out.extend((0..cols).map(|col| data[start + col * plane.pixel_stride]));
        }
    }
}
