//! Producer-side tests against a kernel agent with no live backend: the
//! host role is played by a second mapping of the region file.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use pvgpu_kmd::{GuestMapping, KernelAgent, NullDoorbell};
use pvgpu_protocol::*;
use pvgpu_umd::Device;

const RING_SIZE: u32 = 0x20000; // 128 KiB
const HEAP_BLOCKS: u32 = 256;
const SHMEM_SIZE: usize =
    PVGPU_CONTROL_REGION_SIZE + RING_SIZE as usize + HEAP_BLOCKS as usize * PVGPU_HEAP_BLOCK_SIZE;

fn create_region(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("pvgpu-shmem");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap();
    file.set_len(SHMEM_SIZE as u64).unwrap();

    let mut map = unsafe { memmap2::MmapMut::map_mut(&file).unwrap() };
    let control = unsafe { &mut *(map.as_mut_ptr() as *mut ControlRegion) };
    unsafe {
        control.init(
            PVGPU_FEATURES_MVP,
            PVGPU_CONTROL_REGION_SIZE as u32,
            RING_SIZE,
            PVGPU_CONTROL_REGION_SIZE as u32 + RING_SIZE,
            HEAP_BLOCKS * PVGPU_HEAP_BLOCK_SIZE as u32,
        );
    }
    control.set_status(PVGPU_STATUS_READY);
    path
}

fn rig(dir: &tempfile::TempDir) -> (Arc<Device>, GuestMapping) {
    let path = create_region(dir);
    let mapping = GuestMapping::open(&path).unwrap();
    let agent = Arc::new(KernelAgent::new(mapping, Box::new(NullDoorbell)));
    let device = Device::new(agent).unwrap();
    (Arc::new(device), GuestMapping::open(&path).unwrap())
}

#[test]
fn staged_commands_stay_local_until_flush() {
    let dir = tempfile::tempdir().unwrap();
    let (device, host) = rig(&dir);

    device.draw(3, 0).unwrap();
    device.set_primitive_topology(4).unwrap();
    assert_eq!(host.control().producer_ptr(), 0);

    device.flush().unwrap();
    assert_eq!(host.control().producer_ptr(), 64);

    // An empty flush does not move the cursor again.
    device.flush().unwrap();
    assert_eq!(host.control().producer_ptr(), 64);
}

#[test]
fn full_staging_buffer_forces_flush() {
    let dir = tempfile::tempdir().unwrap();
    let (device, host) = rig(&dir);

    // Spill area is min(256K, heap/4, ring/2) = 64 KiB here; one draw is
    // 32 bytes, so 2048 draws fill the staging buffer exactly and the
    // 2049th triggers a submission.
    for _ in 0..2049 {
        device.draw(1, 0).unwrap();
    }
    assert_eq!(host.control().producer_ptr(), 0x10000);

    device.flush().unwrap();
    assert_eq!(host.control().producer_ptr(), 0x10000 + 32);
}

#[test]
fn fence_values_are_strictly_increasing_from_one() {
    let dir = tempfile::tempdir().unwrap();
    let (device, _host) = rig(&dir);

    let first = device.fence().unwrap();
    let second = device.fence().unwrap();
    let third = device.fence().unwrap();
    assert_eq!((first, second, third), (1, 2, 3));
}

#[test]
fn resource_handles_are_unique_and_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let (device, _host) = rig(&dir);

    let a = device.create_buffer(64, 0, None).unwrap();
    let b = device.create_buffer(64, 0, None).unwrap();
    let c = device
        .create_texture2d(16, 16, 28, 1, 0, None)
        .unwrap();
    assert!(a != 0 && b != 0 && c != 0);
    assert!(a != b && b != c && a != c);
}

#[test]
fn wait_fast_path_avoids_the_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let (device, host) = rig(&dir);

    // Host publishes completion out-of-band; the producer's zero-timeout
    // poll sees it immediately.
    host.control().set_host_fence_completed(5);
    assert_eq!(device.wait_fence(5, 0).unwrap(), 5);
    // Unsatisfied poll-only wait reports timeout without blocking.
    assert_eq!(device.wait_fence(6, 0), Err(PvgpuError::Timeout));
}

#[test]
fn shutdown_status_latches_the_device() {
    let dir = tempfile::tempdir().unwrap();
    let (device, host) = rig(&dir);

    host.control().set_status_flag(PVGPU_STATUS_SHUTDOWN);
    assert_eq!(
        device.wait_fence(1, 100),
        Err(PvgpuError::BackendDisconnected)
    );
    // The latch is sticky and preserves the kind, even though staging is
    // purely local.
    assert_eq!(device.draw(1, 0), Err(PvgpuError::BackendDisconnected));
    assert!(device.is_disconnected());
}

#[test]
fn bulk_payloads_land_in_the_heap() {
    let dir = tempfile::tempdir().unwrap();
    let (device, host) = rig(&dir);

    let bytecode = vec![0x44u8, 0x58, 0x42, 0x43, 1, 2, 3, 4];
    device
        .create_shader(ShaderStage::Pixel, &bytecode)
        .unwrap();
    device.flush().unwrap();

    // Decode the CREATE_SHADER record out of the ring and verify the
    // cited heap range holds the bytecode.
    let control = host.control();
    let produced = control.producer_ptr() as usize;
    let mut ring_bytes = vec![0u8; produced];
    host.read_bytes(control.ring_offset() as usize, &mut ring_bytes)
        .unwrap();

    let cmd: CmdCreateShader = read_command(&ring_bytes).unwrap();
    assert_eq!(cmd.header.command_type, PVGPU_CMD_CREATE_SHADER);
    assert_eq!(cmd.bytecode_size, bytecode.len() as u32);

    let mut stored = vec![0u8; bytecode.len()];
    host.read_bytes(cmd.bytecode_offset as usize, &mut stored)
        .unwrap();
    assert_eq!(stored, bytecode);
}

#[test]
fn oversized_viewport_counts_are_rejected_locally() {
    let dir = tempfile::tempdir().unwrap();
    let (device, host) = rig(&dir);

    let viewports = vec![
        Viewport {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        17
    ];
    assert_eq!(
        device.set_viewports(&viewports),
        Err(PvgpuError::InvalidParameter)
    );
    assert_eq!(host.control().producer_ptr(), 0);
}
