//! Producer side of the SPSC command ring.
//!
//! The ring is a byte stream addressed by two monotone u64 cursors; the
//! write position is `producer mod ring_size`. Records that run past the
//! end of the ring split into a tail prefix and a suffix at offset 0, and
//! the consumer reassembles with the same rule. The payload copy uses
//! plain stores; the release store of the new producer value publishes
//! them, pairing with the consumer's acquire load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use pvgpu_protocol::{
    PvgpuError, Result, PVGPU_STATUS_DEVICE_LOST, PVGPU_STATUS_SHUTDOWN,
};

use crate::shmem::GuestMapping;

/// Hybrid wait tuning: spin briefly for sub-microsecond contention, yield
/// for a while, then sleep in 1 ms ticks. The counter resets whenever the
/// consumer makes forward progress.
const SPIN_ITERATIONS: u32 = 100;
const YIELD_ITERATIONS: u32 = 500;
const SLEEP_TICK: Duration = Duration::from_millis(1);

pub struct RingWriter {
    mapping: Arc<GuestMapping>,
    ring_size: u64,
    link_down: Arc<AtomicBool>,
}

impl RingWriter {
    pub fn new(mapping: Arc<GuestMapping>, link_down: Arc<AtomicBool>) -> Self {
        let ring_size = mapping.control().ring_size() as u64;
        debug_assert!(ring_size.is_power_of_two());
        Self {
            mapping,
            ring_size,
            link_down,
        }
    }

    /// Append a batch of records to the ring and publish the new producer
    /// cursor. Blocks while the ring lacks space; aborts with the terminal
    /// kind if the device dies while waiting. The batch must already be
    /// 16-byte-aligned record data.
    pub fn submit(&self, batch: &[u8]) -> Result<u64> {
        let len = batch.len() as u64;
        if len == 0 {
            let producer = self.mapping.control().producer_ptr();
            return Ok(producer);
        }
        if len % 16 != 0 {
            return Err(PvgpuError::InvalidParameter);
        }
        if len > self.ring_size {
            return Err(PvgpuError::RingFull);
        }

        let producer = self.wait_for_space(len)?;
        self.copy_into_ring(producer, batch);
        // Release: the payload stores above become visible before the new
        // producer value does.
        self.mapping.control().set_producer_ptr(producer + len);
        trace!(bytes = len, producer = producer + len, "ring submit");
        Ok(producer + len)
    }

    /// Wait until `producer - consumer + needed <= ring_size`, re-reading
    /// the live cursors each iteration. Returns the producer cursor to
    /// write at.
    fn wait_for_space(&self, needed: u64) -> Result<u64> {
        let control = self.mapping.control();
        let mut iterations: u32 = 0;
        let mut last_consumer = control.consumer_ptr();

        loop {
            let status = control.get_status();
            if status & PVGPU_STATUS_DEVICE_LOST != 0 {
                return Err(PvgpuError::DeviceLost);
            }
            if status & PVGPU_STATUS_SHUTDOWN != 0 {
                return Err(PvgpuError::BackendDisconnected);
            }
            if self.link_down.load(Ordering::Acquire) {
                return Err(PvgpuError::BackendDisconnected);
            }

            let producer = control.producer_ptr();
            let consumer = control.consumer_ptr();
            let space_available = self.ring_size - (producer - consumer);
            if space_available >= needed {
                return Ok(producer);
            }

            if consumer != last_consumer {
                last_consumer = consumer;
                iterations = 0;
            }
            if iterations < SPIN_ITERATIONS {
                std::hint::spin_loop();
            } else if iterations < SPIN_ITERATIONS + YIELD_ITERATIONS {
                std::thread::yield_now();
            } else {
                std::thread::sleep(SLEEP_TICK);
            }
            iterations = iterations.saturating_add(1);
        }
    }

    fn copy_into_ring(&self, producer: u64, batch: &[u8]) {
        let ring = self.mapping.ring_base();
        let offset = (producer & (self.ring_size - 1)) as usize;
        let to_end = self.ring_size as usize - offset;

        if batch.len() <= to_end {
            // SAFETY: offset + len <= ring_size; the space check above
            // guarantees the consumer is not reading this range.
            unsafe {
                std::ptr::copy_nonoverlapping(batch.as_ptr(), ring.add(offset), batch.len());
            }
        } else {
            let (prefix, suffix) = batch.split_at(to_end);
            // SAFETY: as above, for both halves of the wrap.
            unsafe {
                std::ptr::copy_nonoverlapping(prefix.as_ptr(), ring.add(offset), prefix.len());
                std::ptr::copy_nonoverlapping(suffix.as_ptr(), ring, suffix.len());
            }
        }
    }
}
