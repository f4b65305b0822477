//! PVGPU guest kernel agent.
//!
//! The privileged half of the guest driver pair. It owns the shared-memory
//! mapping, the resource heap allocator, the ring producer cursor and the
//! doorbell; the user producer reaches all of them only through the escape
//! gateway ([`KernelAgent::escape`]). The host backend sits on the far side
//! of the shared region and is reached exclusively through it plus the
//! device link signals (doorbell out, interrupt in).

pub mod agent;
pub mod device;
pub mod fence;
pub mod heap;
pub mod ring;
pub mod shmem;

pub use agent::KernelAgent;
pub use device::{Doorbell, IrqListener, LinkDevice, NullDoorbell};
pub use fence::FenceWaiters;
pub use heap::HeapAllocator;
pub use shmem::{GuestMapping, ShmemError, UserView};
