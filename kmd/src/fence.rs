//! Fence waiters and their cancellation.
//!
//! The host publishes `host_fence_completed` and raises an interrupt; the
//! interrupt listener queues the deferred notification that pokes the
//! condvar here. Waiters also tick on their own every millisecond so a
//! lost interrupt degrades to polling instead of a hang. Shutdown and
//! device loss wake every waiter, present and future, regardless of the
//! target fence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use pvgpu_protocol::{
    ControlRegion, PvgpuError, Result, PVGPU_STATUS_DEVICE_LOST, PVGPU_STATUS_SHUTDOWN,
};

const WAIT_TICK: Duration = Duration::from_millis(1);

#[derive(Default)]
pub struct FenceWaiters {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl FenceWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deferred-procedure half of the interrupt path: wake every waiter so
    /// it re-reads `host_fence_completed`.
    pub fn notify_all(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.condvar.notify_all();
    }

    /// Block until `host_fence_completed >= target`, the timeout elapses,
    /// or the device dies. `link_down` covers the case where the backend
    /// vanished without managing to publish a status bit.
    ///
    /// `timeout_ms == 0` is poll-only: a single check and an immediate
    /// return. Cancellation takes precedence over fence satisfaction.
    /// Returns the completed fence value observed at exit.
    pub fn wait(
        &self,
        control: &ControlRegion,
        link_down: &AtomicBool,
        target: u64,
        timeout_ms: u32,
    ) -> Result<u64> {
        let deadline = (timeout_ms != 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            // Device loss outranks shutdown when both bits are set.
            let status = control.get_status();
            if status & PVGPU_STATUS_DEVICE_LOST != 0 {
                debug!(target, "fence wait cancelled: device lost");
                return Err(PvgpuError::DeviceLost);
            }
            if status & PVGPU_STATUS_SHUTDOWN != 0 {
                debug!(target, "fence wait cancelled: shutdown");
                return Err(PvgpuError::BackendDisconnected);
            }
            if link_down.load(Ordering::Acquire) {
                debug!(target, "fence wait cancelled: link down");
                return Err(PvgpuError::BackendDisconnected);
            }

            let completed = control.host_fence_completed();
            if completed >= target {
                return Ok(completed);
            }

            match deadline {
                None => return Err(PvgpuError::Timeout),
                Some(deadline) if Instant::now() >= deadline => {
                    return Err(PvgpuError::Timeout)
                }
                Some(_) => {}
            }

            let (g, _timed_out) = self
                .condvar
                .wait_timeout(guard, WAIT_TICK)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use pvgpu_protocol::PVGPU_FEATURES_MVP;
    use std::sync::Arc;

    fn control() -> Box<ControlRegion> {
        // SAFETY: valid for the all-zero pattern; init() overwrites it.
        let mut region: Box<ControlRegion> = unsafe { Box::new_zeroed().assume_init() };
        unsafe {
            region.init(PVGPU_FEATURES_MVP, 0x1000, 0x1000, 0x2000, 0x4000);
        }
        region
    }

    #[test]
    fn satisfied_fence_returns_immediately() {
        let control = control();
        let waiters = FenceWaiters::new();
        let link_down = AtomicBool::new(false);
        control.set_host_fence_completed(5);
        assert_eq!(waiters.wait(&control, &link_down, 5, 0), Ok(5));
        assert_eq!(waiters.wait(&control, &link_down, 3, 1000), Ok(5));
    }

    #[test]
    fn zero_timeout_polls_only() {
        let control = control();
        let waiters = FenceWaiters::new();
        let link_down = AtomicBool::new(false);
        let start = Instant::now();
        assert_eq!(
            waiters.wait(&control, &link_down, 1, 0),
            Err(PvgpuError::Timeout)
        );
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn timeout_is_bounded() {
        let control = control();
        let waiters = FenceWaiters::new();
        let link_down = AtomicBool::new(false);
        let start = Instant::now();
        assert_eq!(
            waiters.wait(&control, &link_down, 1, 20),
            Err(PvgpuError::Timeout)
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn completion_from_another_thread_wakes_waiter() {
        let control = Arc::new(control());
        let waiters = Arc::new(FenceWaiters::new());

        let link_down = Arc::new(AtomicBool::new(false));
        let waiter = {
            let control = Arc::clone(&control);
            let waiters = Arc::clone(&waiters);
            let link_down = Arc::clone(&link_down);
            std::thread::spawn(move || waiters.wait(&control, &link_down, 7, 5000))
        };

        std::thread::sleep(Duration::from_millis(10));
        control.set_host_fence_completed(7);
        waiters.notify_all();
        assert_eq!(waiter.join().unwrap(), Ok(7));
    }

    #[test]
    fn shutdown_cancels_waiters_within_a_tick() {
        let control = Arc::new(control());
        let waiters = Arc::new(FenceWaiters::new());

        let link_down = Arc::new(AtomicBool::new(false));
        let waiter = {
            let control = Arc::clone(&control);
            let waiters = Arc::clone(&waiters);
            let link_down = Arc::clone(&link_down);
            std::thread::spawn(move || waiters.wait(&control, &link_down, 100, 60_000))
        };

        std::thread::sleep(Duration::from_millis(10));
        control.set_status_flag(PVGPU_STATUS_SHUTDOWN);
        waiters.notify_all();
        assert_eq!(
            waiter.join().unwrap(),
            Err(PvgpuError::BackendDisconnected)
        );
    }

    #[test]
    fn device_loss_beats_fence_satisfaction() {
        let control = control();
        let waiters = FenceWaiters::new();
        let link_down = AtomicBool::new(false);
        control.set_host_fence_completed(10);
        control.set_status_flag(PVGPU_STATUS_DEVICE_LOST);
        assert_eq!(
            waiters.wait(&control, &link_down, 1, 1000),
            Err(PvgpuError::DeviceLost)
        );
    }
}
