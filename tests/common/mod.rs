#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camstream::capture::{Plane, PixelFormat};
use camstream::{DeviceRegistry, Facing, Frame, SessionConfig, VirtualEngine};

/// Route library logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn phone(interval: Duration) -> (Arc<VirtualEngine>, DeviceRegistry) {
    init_tracing();
    let engine = Arc::new(VirtualEngine::phone().with_frame_interval(interval));
    let settings = SessionConfig {
        still_poll_interval_ms: 10,
        still_max_attempts: 50,
    };
    let registry = DeviceRegistry::with_settings(engine.clone(), settings);
    (engine, registry)
}

/// 2x2 planar frame with a recognisable luma byte.
pub fn tiny_frame(timestamp: u64, luma: u8) -> Frame {
    Frame::new(
        PixelFormat::Yuv420,
        2,
        2,
        timestamp,
        vec![
            Plane::new(Bytes::from(vec![luma; 4]), 2, 1),
            Plane::new(Bytes::from_static(&[128]), 1, 1),
            Plane::new(Bytes::from_static(&[128]), 1, 1),
        ],
    )
}

pub fn back_camera(registry: &DeviceRegistry) -> camstream::DeviceId {
    camstream::utils::find_device(registry.list_devices().unwrap(), Facing::Back)
        .expect("phone has a back camera")
        .id
}
