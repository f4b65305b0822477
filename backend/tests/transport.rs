//! End-to-end transport scenarios: a real backend service thread, a real
//! kernel agent connected over the device link, and a user producer on
//! top, all sharing one file-backed region.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use pvgpu_backend::{BackendService, Config};
use pvgpu_kmd::{GuestMapping, IrqListener, KernelAgent, LinkDevice};
use pvgpu_protocol::*;
use pvgpu_umd::Device;

struct TestRig {
    device: Arc<Device>,
    link: LinkDevice,
    shmem_path: std::path::PathBuf,
    service: Option<std::thread::JoinHandle<anyhow::Result<()>>>,
    _dir: tempfile::TempDir,
}

impl TestRig {
    /// Bring up the full stack. `shmem_size`/`ring_size` shape the region;
    /// the backend runs on its own thread.
    fn start(shmem_size: usize, ring_size: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let shmem_path = dir.path().join("pvgpu-shmem");

        let mut config = Config::default();
        config.link_addr = "127.0.0.1:0".to_string();
        config.shmem_size = shmem_size;
        config.ring_size = ring_size;

        let mut service = BackendService::new(config);
        let addr = service.bind_link().unwrap();

        let service = std::thread::spawn(move || -> anyhow::Result<()> {
            service.accept_device()?;
            service.perform_handshake()?;
            service.init_renderer()?;
            service.start_link_reader()?;
            let result = service.run_loop();
            service.publish_shutdown();
            service.join_reader();
            result
        });

        // The ack arrives only after the region file exists.
        let mut link = LinkDevice::connect(
            &addr.to_string(),
            shmem_path.to_str().unwrap(),
            shmem_size as u64,
        )
        .unwrap();
        assert_eq!(link.features(), PVGPU_FEATURES_MVP);

        let mapping = GuestMapping::open(&shmem_path).unwrap();
        let agent = Arc::new(KernelAgent::new(mapping, Box::new(link.doorbell())));
        let _irq = IrqListener::spawn(
            link.take_reader().unwrap(),
            agent.fence_waiters(),
            agent.link_down_flag(),
        );

        let device = Arc::new(Device::new(agent).unwrap());
        Self {
            device,
            link,
            shmem_path,
            service: Some(service),
            _dir: dir,
        }
    }

    /// A host-eye view of the control region (second mapping of the file).
    fn host_view(&self) -> GuestMapping {
        GuestMapping::open(&self.shmem_path).unwrap()
    }

    fn wait_until(&self, what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn shutdown(mut self) {
        self.link.send_shutdown();
        if let Some(handle) = self.service.take() {
            let _ = handle.join().unwrap();
        }
    }
}

const SMALL_SHMEM: usize = 0x1000 + 0x10000 + 128 * 0x1000; // 64 KiB ring, 128-block heap
const SMALL_RING: usize = 0x10000;

#[test]
fn clean_init_publishes_spec_geometry() {
    let rig = TestRig::start(PVGPU_DEFAULT_SHMEM_SIZE, PVGPU_COMMAND_RING_SIZE);
    let host = rig.host_view();
    let control = host.control();

    assert_eq!(control.magic(), 0x50564750);
    assert_eq!(control.version(), 0x00010000);
    assert_eq!(control.ring_offset(), 0x1000);
    assert_eq!(control.ring_size(), 0x1000000);
    assert_eq!(control.heap_offset(), 0x1001000);
    assert_eq!(control.heap_size(), 0xEFFF000);
    assert!(control.has_status_flag(PVGPU_STATUS_READY));

    rig.shutdown();
}

#[test]
fn single_command_round_trip() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);
    let host = rig.host_view();

    rig.device.draw(3, 0).unwrap();
    let fence = rig.device.fence().unwrap();
    assert_eq!(fence, 1);
    rig.device.flush().unwrap();

    // Draw (32) + fence (32): the producer moved exactly 64 bytes.
    assert_eq!(host.control().producer_ptr(), 64);

    let completed = rig.device.wait_fence(1, 1000).unwrap();
    assert!(completed >= 1);
    assert_eq!(host.control().host_fence_completed(), 1);
    rig.wait_until("consumer catch-up", || host.control().consumer_ptr() == 64);

    rig.shutdown();
}

#[test]
fn ring_wrap_preserves_record_bytes() {
    let rig = TestRig::start(PVGPU_DEFAULT_SHMEM_SIZE, PVGPU_COMMAND_RING_SIZE);
    let host = rig.host_view();
    let control = host.control();

    // Park the device as if a long session had run: both cursors 16 bytes
    // shy of the ring end. Consumer first, so the host never observes a
    // bogus in-flight range.
    control.set_consumer_ptr(0xFFFFFF0);
    control.set_producer_ptr(0xFFFFFF0);

    // One 32-byte record: 16 bytes at the tail, 16 at offset 0.
    rig.device.draw(3, 0).unwrap();
    rig.device.flush().unwrap();
    assert_eq!(control.producer_ptr(), 0x1000010);

    rig.wait_until("wrap record consumption", || {
        control.consumer_ptr() == 0x1000010
    });
    // The host decoded it as a valid draw, not as framing garbage.
    assert!(!control.has_status_flag(PVGPU_STATUS_ERROR));
    assert_eq!(control.get_error_code(), PVGPU_ERROR_SUCCESS);

    rig.shutdown();
}

#[test]
fn heap_exhaustion_recovers_after_fence() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);

    // Fill every remaining block (the device reserved its spill area).
    let mut held = Vec::new();
    let mut free_bytes = 0u32;
    loop {
        match rig.device.heap_alloc(0x1000, 16) {
            Ok((offset, size)) => {
                held.push((offset, size));
                free_bytes += size;
            }
            Err(PvgpuError::HeapExhausted) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(free_bytes > 0);
    assert_eq!(
        rig.device.heap_alloc(0x1000, 16),
        Err(PvgpuError::HeapExhausted)
    );

    // Submit work, fence at 42, and wait for it before reclaiming.
    let mut fence = 0;
    while fence < 42 {
        rig.device.draw(3, 0).unwrap();
        fence = rig.device.fence().unwrap();
    }
    assert_eq!(fence, 42);
    rig.device.flush().unwrap();
    rig.device.wait_fence(42, 5000).unwrap();

    for (offset, size) in held {
        rig.device.heap_free(offset, size).unwrap();
    }
    rig.device.heap_alloc(0x1000, 16).unwrap();

    rig.shutdown();
}

#[test]
fn device_loss_during_wait_cancels_and_taints() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);
    let host = rig.host_view();

    let waiter = {
        let device = Arc::clone(&rig.device);
        std::thread::spawn(move || device.wait_fence(100, 5000))
    };
    std::thread::sleep(Duration::from_millis(20));

    // The host reports the GPU gone.
    host.control().set_status_flag(PVGPU_STATUS_DEVICE_LOST);

    let start = Instant::now();
    assert_eq!(waiter.join().unwrap(), Err(PvgpuError::DeviceLost));
    assert!(start.elapsed() < Duration::from_millis(500));

    // Every subsequent operation fails the same way, from any thread,
    // without advancing the producer.
    let producer_before = host.control().producer_ptr();
    assert_eq!(rig.device.draw(1, 0), Err(PvgpuError::DeviceLost));
    assert_eq!(rig.device.flush(), Err(PvgpuError::DeviceLost));
    assert_eq!(rig.device.heap_alloc(16, 16), Err(PvgpuError::DeviceLost));
    assert!(rig.device.is_disconnected());
    assert_eq!(host.control().producer_ptr(), producer_before);

    rig.shutdown();
}

#[test]
fn concurrent_producers_stay_framed() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);
    let host = rig.host_view();

    let spawn_producer = |vertices: u32, batches: usize| {
        let device = Arc::clone(&rig.device);
        std::thread::spawn(move || {
            for _ in 0..batches {
                for _ in 0..16 {
                    device.draw(vertices, 0).unwrap();
                }
                device.flush().unwrap();
            }
        })
    };
    let a = spawn_producer(3, 32);
    let b = spawn_producer(6, 32);
    a.join().unwrap();
    b.join().unwrap();

    rig.device.wait_idle(5000).unwrap();

    let control = host.control();
    assert_eq!(control.producer_ptr(), control.consumer_ptr());
    // Every record decoded cleanly: no framing error was recorded.
    assert!(!control.has_status_flag(PVGPU_STATUS_ERROR));
    assert!(!control.has_status_flag(PVGPU_STATUS_DEVICE_LOST));

    rig.shutdown();
}

#[test]
fn resource_data_round_trips_through_map_read() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);

    let payload: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
    let buffer = rig
        .device
        .create_buffer(1024, 0, Some(&payload))
        .unwrap();
    let read_back = rig.device.map_read(buffer, 0, 1024, 5000).unwrap();
    assert_eq!(read_back, payload);

    rig.shutdown();
}

#[test]
fn present_orders_one_frame_behind() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);

    let backbuffer = rig
        .device
        .create_texture2d(64, 64, 28, 1, 0, None)
        .unwrap();
    let rtv = rig
        .device
        .create_view(backbuffer, ResourceType::RenderTargetView, 28)
        .unwrap();

    let mut previous_fence = 0u64;
    for frame in 0..3 {
        if previous_fence != 0 {
            // One frame behind: wait on frame N-1 before presenting N.
            rig.device.wait_fence(previous_fence, 5000).unwrap();
        }
        rig.device
            .clear_render_target(rtv, [0.0, 0.0, frame as f32 / 3.0, 1.0])
            .unwrap();
        rig.device.draw(3, 0).unwrap();
        previous_fence = rig.device.present(backbuffer, 1).unwrap();
    }
    rig.device.wait_fence(previous_fence, 5000).unwrap();

    rig.shutdown();
}

#[test]
fn per_command_errors_do_not_stop_the_stream() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);
    let host = rig.host_view();

    // Reference a resource that was never created.
    rig.device.set_shader(ShaderStage::Vertex, 12345).unwrap();
    rig.device.draw(3, 0).unwrap();
    rig.device.wait_idle(5000).unwrap();

    let control = host.control();
    // The error was recorded...
    assert!(control.has_status_flag(PVGPU_STATUS_ERROR));
    assert_eq!(control.get_error_code(), PVGPU_ERROR_RESOURCE_NOT_FOUND);
    assert_eq!(control.get_error_data(), 12345);
    // ...but the stream kept going and the device is not lost.
    assert!(!control.has_status_flag(PVGPU_STATUS_DEVICE_LOST));
    assert_eq!(control.producer_ptr(), control.consumer_ptr());

    rig.shutdown();
}

#[test]
fn shutdown_wakes_pending_waiters() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);

    let waiter = {
        let device = Arc::clone(&rig.device);
        std::thread::spawn(move || device.wait_fence(999, 10_000))
    };
    std::thread::sleep(Duration::from_millis(20));

    rig.shutdown();
    assert_eq!(
        waiter.join().unwrap(),
        Err(PvgpuError::BackendDisconnected)
    );
}

#[test]
fn display_mode_and_caps_flow_through_escapes() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);

    rig.device.set_display_mode(2560, 1440, 144).unwrap();
    let caps = rig.device.caps().unwrap();
    assert_eq!(caps.display_width, 2560);
    assert_eq!(caps.display_height, 1440);
    assert_eq!(caps.display_refresh, 144);
    assert_eq!(caps.features, PVGPU_FEATURES_MVP);

    let host = rig.host_view();
    let mode = host.control().display_mode();
    assert_eq!((mode.width, mode.height), (2560, 1440));

    rig.shutdown();
}

#[test]
fn guest_fence_request_never_trails_completion() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);
    let host = rig.host_view();

    for _ in 0..10 {
        rig.device.draw(3, 0).unwrap();
        let fence = rig.device.fence().unwrap();
        rig.device.flush().unwrap();
        rig.device.wait_fence(fence, 5000).unwrap();

        let control = host.control();
        let completed = control.host_fence_completed();
        let requested = control.guest_fence_request();
        assert!(
            requested >= completed,
            "requested {requested} < completed {completed}"
        );
    }

    rig.shutdown();
}

#[test]
fn dropped_link_disconnects_producer() {
    let rig = TestRig::start(SMALL_SHMEM, SMALL_RING);

    // Kill the backend abruptly (socket close, no SHUTDOWN status write).
    rig.link.send_shutdown();
    if let Some(handle) = &rig.service {
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // Either the SHUTDOWN bit or the dead link cancels the wait.
    let err = rig.device.wait_fence(50, 5000).unwrap_err();
    assert_eq!(err, PvgpuError::BackendDisconnected);

    let agent_flag = rig.device.is_disconnected();
    assert!(agent_flag);
}
