//! Frame pacing and device-loss recovery

use pretty_assertions::assert_eq;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tessera_core::FrameConfig;
use tessera_renderer::backend::{BackendEvent, HeadlessBackend, MemoryKind};
use tessera_renderer::{FrameStatus, FrameSynchronizer, RenderDevice};

#[test]
fn test_cpu_stays_within_frames_in_flight() {
    let backend = Arc::new(HeadlessBackend::manual());
    let config = FrameConfig {
        max_frames_in_flight: 2,
        ..Default::default()
    };
    let mut frames = FrameSynchronizer::new(backend.clone(), &config).unwrap();
    let first_slot_fence = frames.slot(0).unwrap().gpu_lock().handle();

    let (tx, rx) = mpsc::channel();
    let renderer = thread::spawn(move || {
        for _ in 0..3 {
            let status = frames.render_frame(|frame| {
                frame.begin_render_pass(Some([0.0, 0.0, 0.0, 1.0]));
                frame.end_render_pass();
                Ok(())
            });
            tx.send(status.unwrap()).unwrap();
        }
        frames
    });

    let timeout = Duration::from_secs(5);
    assert_eq!(
        rx.recv_timeout(timeout).unwrap(),
        FrameStatus::Presented { image_index: 0 }
    );
    assert_eq!(
        rx.recv_timeout(timeout).unwrap(),
        FrameStatus::Presented { image_index: 1 }
    );

    // third frame reuses slot 0 and must wait for the first frame's fence
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(backend.pending_batches(), 2);

    assert!(backend.complete_next());
    assert_eq!(
        rx.recv_timeout(timeout).unwrap(),
        FrameStatus::Presented { image_index: 2 }
    );

    let mut frames = renderer.join().unwrap();
    assert_eq!(frames.frame_counter(), 3);
    assert_eq!(frames.stats().blocked_waits, 1);

    let events = backend.events();
    let completed = events
        .iter()
        .position(|e| *e == BackendEvent::Completed { fence: Some(first_slot_fence) })
        .unwrap();
    let waited = events
        .iter()
        .position(|e| {
            *e == BackendEvent::FenceWaited {
                fence: first_slot_fence,
                blocked: true,
            }
        })
        .unwrap();
    assert!(completed < waited);

    backend.complete_all();
    frames.wait_idle().unwrap();
}

#[test]
fn test_device_loss_keeps_resources_and_restarts_frames() {
    let backend = Arc::new(HeadlessBackend::default());
    let mut device = RenderDevice::builder()
        .with_linear_page_size(4096)
        .with_atlas_page_size(128)
        .build(backend.clone())
        .unwrap();

    let vertices = device.linear().alloc(64, 4, MemoryKind::Vertex).unwrap();
    let sprite = device.atlas().alloc(8, 8).unwrap();
    {
        let mut data = device.upload_stream().unwrap();
        data.write_buffer(&vertices, 0, &[9; 64]).unwrap();
        data.write_region(&sprite, &[0xAB; 8 * 8 * 4]).unwrap();
    }
    device.upload().wait_idle().unwrap();
    assert_eq!(sprite.ref_count(), 1);

    for _ in 0..2 {
        device.render_frame(|_| Ok(())).unwrap();
    }
    assert_eq!(device.frames().frame_counter(), 2);

    let atlas_before = device.atlas().stats();
    let linear_before = device.linear().stats();

    backend.inject_device_loss();
    let status = device.render_frame(|_| Ok(())).unwrap();
    assert_eq!(status, FrameStatus::Recovered);
    assert_eq!(device.frames().frame_counter(), 0);
    assert_eq!(device.frames().stats().recoveries, 1);

    assert_eq!(device.atlas().stats().placements, atlas_before.placements);
    assert_eq!(device.linear().stats().bytes_in_use, linear_before.bytes_in_use);
    assert_eq!(sprite.ref_count(), 1);

    let status = device.render_frame(|_| Ok(())).unwrap();
    assert_eq!(status, FrameStatus::Presented { image_index: 0 });
    assert_eq!(backend.live_framebuffers(), 3);

    let bytes = backend.read_memory(vertices.memory()).unwrap();
    assert_eq!(bytes[vertices.offset() as usize], 9);
    let texels = backend.read_surface(sprite.memory(), sprite.region()).unwrap();
    assert!(texels.iter().all(|&b| b == 0xAB));
}

#[test]
fn test_outdated_surface_is_recovered() {
    let backend = Arc::new(HeadlessBackend::default());
    let mut device = RenderDevice::builder().build(backend.clone()).unwrap();

    device.render_frame(|_| Ok(())).unwrap();
    backend.inject_surface_outdated();

    assert_eq!(
        device.render_frame(|_| Ok(())).unwrap(),
        FrameStatus::Recovered
    );
    assert_eq!(
        device.render_frame(|_| Ok(())).unwrap(),
        FrameStatus::Presented { image_index: 0 }
    );
}

#[test]
fn test_recording_error_is_returned_without_recovery() {
    let backend = Arc::new(HeadlessBackend::default());
    let mut device = RenderDevice::builder().build(backend).unwrap();

    let result = device.render_frame(|_| {
        Err(tessera_core::TesseraError::invalid_argument("bad draw"))
    });
    assert!(result.unwrap_err().is_programmer_error());
    assert_eq!(device.frames().stats().recoveries, 0);
}

#[test]
fn test_recording_error_gives_back_the_image() {
    let backend = Arc::new(HeadlessBackend::default());
    let mut device = RenderDevice::builder().build(backend.clone()).unwrap();

    let result = device.render_frame(|frame| {
        frame.begin_render_pass(None);
        Err(tessera_core::TesseraError::invalid_argument("bad draw"))
    });
    assert!(result.is_err());
    assert!(backend
        .events()
        .contains(&BackendEvent::Released { image_index: 0 }));
    assert_eq!(backend.submission_count(), 0);

    assert_eq!(
        device.render_frame(|_| Ok(())).unwrap(),
        FrameStatus::Presented { image_index: 1 }
    );
}

#[test]
fn test_failed_submit_rearms_the_slot() {
    let backend = Arc::new(HeadlessBackend::default());
    let config = FrameConfig {
        max_frames_in_flight: 1,
        ..Default::default()
    };
    let mut frames = FrameSynchronizer::new(backend.clone(), &config).unwrap();

    backend.inject_submit_failure();
    let err = frames.render_frame(|_| Ok(())).unwrap_err();
    assert!(!err.is_device_lost());
    assert_eq!(frames.frame_counter(), 0);
    assert!(frames.slot(0).unwrap().gpu_lock().is_signaled());
    assert!(backend
        .events()
        .contains(&BackendEvent::Released { image_index: 0 }));

    // a fence left reset would block the next frame forever
    let (tx, rx) = mpsc::channel();
    let renderer = thread::spawn(move || {
        let status = frames.render_frame(|_| Ok(())).unwrap();
        frames.wait_idle().unwrap();
        tx.send(status).unwrap();
    });
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        FrameStatus::Presented { image_index: 1 }
    );
    renderer.join().unwrap();
    assert_eq!(backend.live_fences(), 0);
}

#[test]
fn test_device_drop_after_failed_submit_returns() {
    let backend = Arc::new(HeadlessBackend::default());
    let (tx, rx) = mpsc::channel();
    {
        let backend = backend.clone();
        thread::spawn(move || {
            let mut device = RenderDevice::builder().build(backend.clone()).unwrap();
            device.render_frame(|_| Ok(())).unwrap();
            backend.inject_submit_failure();
            assert!(device.render_frame(|_| Ok(())).is_err());
            drop(device);
            tx.send(()).unwrap();
        });
    }
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(backend.live_framebuffers(), 0);
}
