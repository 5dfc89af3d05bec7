mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camstream::{
    CameraError, DeviceId, DeviceRegistry, Facing, OutputTarget, SessionState, StreamMode,
    VirtualEngine,
};
use camstream::capture::PixelFormat;

#[test]
fn repeated_initialize_returns_identical_lists() {
    let (_, registry) = common::phone(Duration::from_millis(5));
    registry.initialize().unwrap();
    let first = registry.list_devices().unwrap().to_vec();

    for _ in 0..10 {
        registry.initialize().unwrap();
        assert_eq!(registry.list_devices().unwrap(), first.as_slice());
    }
    assert_eq!(first[0].facing, Facing::Back);
    assert_eq!(first[1].facing, Facing::Front);
}

#[test]
fn concurrent_first_access_enumerates_once() {
    let (_, registry) = common::phone(Duration::from_millis(5));
    let registry = Arc::new(registry);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                if i % 2 == 0 {
                    registry.initialize().unwrap();
                }
                registry.list_devices().unwrap().as_ptr() as usize
            })
        })
        .collect();

    let addresses: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    // Everyone observed the same cached list
    assert!(addresses.iter().all(|&a| a == addresses[0]));
}

#[test]
fn busy_then_reopen_after_close() {
    let (_, registry) = common::phone(Duration::from_millis(5));
    let id = common::back_camera(&registry);

    let session = registry.open_session(id).unwrap();
    for _ in 0..3 {
        assert!(matches!(
            registry.open_session(id),
            Err(CameraError::DeviceBusy(busy)) if busy == id
        ));
    }

    session.close();
    let session = registry.open_session(id).unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.id(), id);
}

#[test]
fn sessions_on_different_devices_are_independent() {
    let (engine, registry) = common::phone(Duration::from_millis(5));
    let back = registry.open_session(DeviceId(0)).unwrap();
    let front = registry.open_session(DeviceId(1)).unwrap();
    assert_eq!(engine.open_count(), 2);

    back.close();
    assert_eq!(front.state(), SessionState::Idle);
    assert_eq!(engine.open_count(), 1);
}

#[test]
fn stop_then_close_while_frames_in_flight() {
    let (engine, registry) = common::phone(Duration::from_millis(1));
    let session = registry.open_session(DeviceId(0)).unwrap();

    for _ in 0..20 {
        let target = OutputTarget::new(32, 16, PixelFormat::Yuv420, 2);
        session.start_repeating(target.clone()).unwrap();
        thread::sleep(Duration::from_millis(3));
        session.stop();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        // Late frames may have landed, but never more than capacity
        assert!(target.queue().len() <= 2);
        session.open().unwrap();
    }
    session.close();
    assert_eq!(engine.open_count(), 0);
}

#[test]
fn close_without_stop() {
    let (engine, registry) = common::phone(Duration::from_millis(1));
    let session = registry.open_session(DeviceId(0)).unwrap();
    session
        .start_repeating(OutputTarget::new(16, 16, PixelFormat::Nv21, 4))
        .unwrap();
    thread::sleep(Duration::from_millis(10));

    registry.close_session(DeviceId(0));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(engine.open_count(), 0);
}

#[test]
fn start_while_active_is_rejected() {
    let (_, registry) = common::phone(Duration::from_millis(5));
    let session = registry.open_session(DeviceId(0)).unwrap();
    let target = OutputTarget::new(16, 16, PixelFormat::Yuv420, 4);

    session.start_repeating(target.clone()).unwrap();
    assert!(matches!(
        session.start_repeating(target.clone()),
        Err(CameraError::InvalidState { .. })
    ));
    assert_eq!(session.mode(), Some(StreamMode::Repeating));

    session.stop();
    session.start_capture(target).unwrap();
    assert_eq!(session.mode(), Some(StreamMode::SingleShot));
}

#[test]
fn device_claimed_elsewhere_is_retryable() {
    let (engine, registry) = common::phone(Duration::from_millis(5));
    engine.claim_elsewhere(0);

    let err = registry.open_session(DeviceId(0)).unwrap_err();
    assert!(matches!(err, CameraError::DeviceOpen { id: DeviceId(0), .. }));

    engine.release_elsewhere(0);
    assert!(registry.open_session(DeviceId(0)).is_ok());
}

#[test]
fn unreachable_engine_fails_initialization() {
    common::init_tracing();
    let engine = Arc::new(VirtualEngine::phone());
    engine.set_available(false);
    let registry = DeviceRegistry::new(engine.clone());

    assert!(matches!(
        registry.list_devices(),
        Err(CameraError::Initialization(_))
    ));
    assert!(matches!(
        registry.open_session(DeviceId(0)),
        Err(CameraError::Initialization(_))
    ));

    engine.set_available(true);
    assert_eq!(registry.list_devices().unwrap().len(), 2);
}

#[test]
fn parallel_starts_admit_one_stream() {
    let (engine, registry) = common::phone(Duration::from_millis(1));
    let session = registry.open_session(DeviceId(0)).unwrap();
    let target = OutputTarget::new(16, 16, PixelFormat::Yuv420, 4);

    let started = (0..8)
        .map(|_| {
            let session = Arc::clone(&session);
            let target = target.clone();
            thread::spawn(move || session.start_repeating(target).is_ok())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&ok| ok)
        .count();

    assert_eq!(started, 1);
    assert_eq!(session.mode(), Some(StreamMode::Repeating));

    let closers: Vec<_> = (0..8)
        .map(|i| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                if i % 2 == 0 {
                    session.stop();
                } else {
                    session.close();
                }
            })
        })
        .collect();
    for closer in closers {
        closer.join().unwrap();
    }

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(engine.open_count(), 0);
}

#[test]
fn racing_transitions_leave_consistent_state() {
    let (engine, registry) = common::phone(Duration::from_millis(1));

    for _ in 0..20 {
        let session = registry.open_session(DeviceId(1)).unwrap();
        let workers: Vec<_> = (0..9)
            .map(|i| {
                let session = Arc::clone(&session);
                thread::spawn(move || match i % 3 {
                    0 => {
                        let _ = session.start_repeating(OutputTarget::new(
                            8,
                            8,
                            PixelFormat::Nv12,
                            2,
                        ));
                    }
                    1 => session.stop(),
                    _ => session.close(),
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // Some close ran, and nothing can start once closed
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.target().is_none());
        assert_eq!(engine.open_count(), 0);
    }
}
