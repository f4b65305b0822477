//! Backend service: attach sequence and the main processing loop.
//!
//! The service binds the device link, performs the attach handshake,
//! creates and initializes the shared region, then drains the ring until
//! shutdown or device loss. Fence completions are published with an IRQ
//! only when a new fence value retires, so a burst of commands costs one
//! interrupt, not one per record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use pvgpu_protocol::{PVGPU_FEATURES_MVP, PVGPU_STATUS_RESIZING, PVGPU_STATUS_SHUTDOWN};

use crate::command_processor::CommandProcessor;
use crate::config::Config;
use crate::ipc::LinkServer;
use crate::presentation::{PresentationConfig, PresentationMode, PresentationPipeline};
use crate::renderer::TrackingRenderer;
use crate::shmem::SharedMemory;

/// Backend service state
pub struct BackendService {
    config: Config,
    link: Option<LinkServer>,
    shared_memory: Option<SharedMemory>,
    command_processor: Option<CommandProcessor>,
    presentation: Option<PresentationPipeline>,
    shutdown: Arc<AtomicBool>,
    link_reader_handle: Option<thread::JoinHandle<()>>,
}

impl BackendService {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            link: None,
            shared_memory: None,
            command_processor: None,
            presentation: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            link_reader_handle: None,
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Bind the link socket. Returns the bound address (useful when the
    /// configured port is ephemeral).
    pub fn bind_link(&mut self) -> Result<std::net::SocketAddr> {
        info!("initializing device link...");
        let link = LinkServer::bind(&self.config.link_addr)?;
        let addr = link.local_addr()?;
        self.link = Some(link);
        Ok(addr)
    }

    /// Block until the virtual device connects.
    pub fn accept_device(&mut self) -> Result<()> {
        self.link
            .as_mut()
            .context("link not initialized")?
            .wait_for_connection()
    }

    /// Bind the link and wait for the virtual device to connect.
    pub fn init_link(&mut self) -> Result<()> {
        self.bind_link()?;
        self.accept_device()
    }

    /// Exchange the attach handshake: create the shared region at the
    /// geometry the device announced (falling back to configuration),
    /// then acknowledge. The ack goes out only once the region exists.
    pub fn perform_handshake(&mut self) -> Result<()> {
        let link = self.link.as_ref().context("link not initialized")?;

        info!("waiting for handshake from device...");
        let (shmem_path, shmem_size) = link.read_handshake()?;
        let path = if shmem_path.is_empty() {
            self.config.shmem_path.clone()
        } else {
            shmem_path
        };
        let size = if shmem_size == 0 {
            self.config.shmem_size
        } else {
            shmem_size as usize
        };

        let shmem = SharedMemory::create(&path, size, self.config.ring_size)?;
        shmem
            .control_region()
            .set_display_mode(self.config.width, self.config.height, self.config.refresh_rate);
        self.shared_memory = Some(shmem);

        link.send_handshake_ack(PVGPU_FEATURES_MVP)?;
        info!("handshake complete, shared region ready");
        Ok(())
    }

    /// Initialize the renderer and presentation pipeline.
    pub fn init_renderer(&mut self) -> Result<()> {
        info!("initializing renderer...");
        let renderer = TrackingRenderer::new();
        self.command_processor = Some(CommandProcessor::new(Box::new(renderer)));

        let presentation_mode = match self.config.presentation_mode.as_str() {
            "windowed" => PresentationMode::Windowed,
            "dual" => PresentationMode::Dual,
            _ => PresentationMode::Headless,
        };
        let presentation = PresentationPipeline::new(PresentationConfig {
            mode: presentation_mode,
            width: self.config.width,
            height: self.config.height,
            vsync: self.config.vsync,
            buffer_count: self.config.buffer_count,
        })?;
        self.presentation = Some(presentation);

        info!("renderer and presentation pipeline initialized");
        Ok(())
    }

    /// Start the background link reader (doorbell/shutdown messages).
    pub fn start_link_reader(&mut self) -> Result<()> {
        let link = self.link.as_ref().context("link not initialized")?;
        self.link_reader_handle = Some(link.start_reader()?);
        Ok(())
    }

    /// Main processing loop
    pub fn run_loop(&mut self) -> Result<()> {
        info!("entering main processing loop...");
        let mut last_irq_fence: u64 = 0;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested");
                break;
            }
            if let Some(link) = &self.link {
                if link.is_shutdown_signaled() {
                    info!("link shutdown signaled");
                    break;
                }
            }

            let shmem = self
                .shared_memory
                .as_ref()
                .context("shared memory not initialized")?;
            let processor = self
                .command_processor
                .as_mut()
                .context("command processor not initialized")?;
            let link = self.link.as_ref().context("link not initialized")?;

            let stats = processor.drain(shmem);

            // Publish fence completions, one IRQ per newly retired value.
            let fence = processor.current_fence();
            if fence > last_irq_fence {
                shmem.complete_fence(fence);
                last_irq_fence = fence;
                if let Err(e) = link.send_irq(0) {
                    warn!("failed to send IRQ: {e}");
                }
            }

            if stats.fatal {
                // Corrupt framing: the device is lost; waiters observe the
                // status bit. Terminal until a reset re-initializes.
                error!("device lost on corrupt command stream");
                break;
            }

            if let Some((backbuffer, sync_interval)) = processor.take_pending_present() {
                if let Some(presentation) = self.presentation.as_mut() {
                    if let Err(e) = presentation.present(backbuffer, sync_interval) {
                        error!("presentation failed: {e}");
                        shmem.control_region().set_error(
                            pvgpu_protocol::PVGPU_ERROR_INTERNAL,
                            backbuffer,
                        );
                    }
                }
            }

            if let Some((width, height, format)) = self
                .command_processor
                .as_mut()
                .and_then(|p| p.take_pending_resize())
            {
                let shmem = self.shared_memory.as_ref().unwrap();
                let control = shmem.control_region();
                control.set_status_flag(PVGPU_STATUS_RESIZING);

                if let Some(presentation) = self.presentation.as_mut() {
                    if let Err(e) = presentation.resize(width, height) {
                        error!("resize failed: {e}");
                        control.set_error(
                            pvgpu_protocol::PVGPU_ERROR_INTERNAL,
                            (width & 0xFFFF) | ((height & 0xFFFF) << 16),
                        );
                    } else {
                        let refresh = control.display_mode().refresh_rate;
                        control.set_display_mode(width, height, refresh);
                        if format != 0 {
                            control.set_display_format(format);
                        }
                        info!(width, height, "resized presentation");
                    }
                }
                control.clear_status_flag(PVGPU_STATUS_RESIZING);
            }

            // If we processed commands, continue immediately; otherwise
            // park on the doorbell with a short timeout so shutdown and
            // status checks stay responsive.
            if stats.bytes > 0 {
                continue;
            }
            if let Some(link) = &self.link {
                link.wait_for_doorbell(5);
            }
        }

        Ok(())
    }

    /// Publish SHUTDOWN so every guest waiter exits, then stop.
    pub fn publish_shutdown(&self) {
        if let Some(shmem) = &self.shared_memory {
            shmem
                .control_region()
                .set_status_flag(PVGPU_STATUS_SHUTDOWN);
            info!("device status set to SHUTDOWN");
        }
    }

    /// Request shutdown
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(link) = &self.link {
            link.signal_shutdown();
        }
    }

    /// Join the reader thread after the loop exits.
    pub fn join_reader(&mut self) {
        if let Some(handle) = self.link_reader_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn shared_memory(&self) -> Option<&SharedMemory> {
        self.shared_memory.as_ref()
    }
}
