//! PVGPU Host Backend Service
//!
//! This service runs on the host and:
//! 1. Accepts the virtual pvgpu device over the device link
//! 2. Creates and initializes the shared memory region
//! 3. Processes commands from the guest via the command ring
//! 4. Executes commands against the renderer
//! 5. Presents frames and publishes fence completions back to the guest

pub mod command_processor;
pub mod config;
pub mod ipc;
pub mod presentation;
pub mod renderer;
pub mod service;
pub mod shmem;

pub use command_processor::CommandProcessor;
pub use config::Config;
pub use renderer::{Renderer, TrackingRenderer};
pub use service::BackendService;
pub use shmem::SharedMemory;
