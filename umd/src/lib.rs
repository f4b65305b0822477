//! PVGPU user-mode producer.
//!
//! The unprivileged half of the guest driver pair. It translates API
//! calls into command records in a process-local staging buffer, hands
//! batches to the kernel agent's escape gateway for ring submission, and
//! places bulk payloads (shader bytecode, texel data, mapped contents)
//! into escape-allocated heap ranges cited by offset. It holds no kernel
//! privileges of its own: every shared-memory mutation goes through an
//! escape, and the only direct reads are the fence/status fast path
//! through the secondary mapping.

pub mod device;
pub mod staging;

pub use device::{Device, MappedWrite, ResourceId};
