use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use tracing::info;

use crate::capture::Facing;
use crate::error::Result;
use crate::pipeline::PackedBuffer;
use crate::registry::DeviceDescriptor;

/// First device with the requested facing
pub fn find_device(devices: &[DeviceDescriptor], facing: Facing) -> Option<DeviceDescriptor> {
    devices.iter().find(|dev| dev.facing == facing).copied()
}

/// Write a packed buffer to `path` as raw bytes, replacing any existing file.
///
/// No header is written; readers need width, height and layout out of band.
pub fn save_packed(path: impl AsRef<Path>, packed: &PackedBuffer) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)?;
    packed.write_to(BufWriter::new(file))?;
    info!(
        "Saved {}x{} packed frame ({} bytes) to {}",
        packed.width,
        packed.height,
        packed.len(),
        path.display()
    );
    Ok(())
}
