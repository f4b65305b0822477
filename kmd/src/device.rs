//! Doorbell and interrupt plumbing toward the virtual device.
//!
//! On real hardware the doorbell is a write-only BAR0 register and the
//! interrupt arrives as a message-signaled interrupt; here both travel
//! over the device link stream. The interrupt listener thread is the ISR
//! analogue: it reads the IRQ message, then runs the deferred work of
//! waking fence waiters.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use pvgpu_protocol::link::LinkMessage;
use pvgpu_protocol::{PvgpuError, Result};

use crate::fence::FenceWaiters;

/// Sink for doorbell writes. The escape gateway rings it after every
/// submission; a separate implementation lets tests run without a live
/// backend on the other end.
pub trait Doorbell: Send + Sync {
    fn ring(&self) -> Result<()>;
}

/// Doorbell that drops the write. For tests that drain the ring directly.
pub struct NullDoorbell;

impl Doorbell for NullDoorbell {
    fn ring(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("device link I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected link message during handshake")]
    BadHandshake,
}

/// Client end of the device link: performs the attach handshake, carries
/// doorbell writes out and interrupt messages in.
pub struct LinkDevice {
    writer: Arc<Mutex<TcpStream>>,
    reader: Option<TcpStream>,
    features: u64,
}

impl LinkDevice {
    /// Connect to the backend and exchange the attach handshake. The
    /// returned device owns both stream halves; `features` is the
    /// negotiated bitmap from the ack.
    pub fn connect(
        addr: &str,
        shmem_path: &str,
        shmem_size: u64,
    ) -> std::result::Result<Self, LinkError> {
        let mut stream = TcpStream::connect(addr)?;
        info!(addr, "device link connected");

        LinkMessage::Handshake {
            shmem_size,
            shmem_path: shmem_path.to_string(),
        }
        .write_to(&mut stream)?;

        let features = match LinkMessage::read_from(&mut stream)? {
            LinkMessage::HandshakeAck { features } => features,
            other => {
                warn!(?other, "expected handshake ack");
                return Err(LinkError::BadHandshake);
            }
        };
        debug!(features = format_args!("0x{features:016X}"), "handshake complete");

        let reader = stream.try_clone()?;
        Ok(Self {
            writer: Arc::new(Mutex::new(stream)),
            reader: Some(reader),
            features,
        })
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    /// Doorbell handle for the escape gateway.
    pub fn doorbell(&self) -> LinkDoorbell {
        LinkDoorbell {
            writer: Arc::clone(&self.writer),
        }
    }

    /// Send an orderly shutdown toward the backend.
    pub fn send_shutdown(&self) {
        let mut stream = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = LinkMessage::Shutdown.write_to(&mut *stream) {
            warn!("failed to send shutdown: {e}");
        }
        let _ = stream.flush();
    }

    /// Take the read half for the interrupt listener. Callable once.
    pub fn take_reader(&mut self) -> Option<TcpStream> {
        self.reader.take()
    }
}

/// Doorbell write that travels the device link.
pub struct LinkDoorbell {
    writer: Arc<Mutex<TcpStream>>,
}

impl Doorbell for LinkDoorbell {
    fn ring(&self) -> Result<()> {
        let mut stream = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        LinkMessage::Doorbell
            .write_to(&mut *stream)
            .map_err(|_| PvgpuError::BackendDisconnected)
    }
}

/// Interrupt service thread: reads link messages and runs the deferred
/// notification for fence waiters. A read error or shutdown message marks
/// the link down, which cancels every current and future waiter.
pub struct IrqListener {
    handle: Option<std::thread::JoinHandle<()>>,
}

impl IrqListener {
    pub fn spawn(
        mut reader: TcpStream,
        waiters: Arc<FenceWaiters>,
        link_down: Arc<AtomicBool>,
    ) -> Self {
        let handle = std::thread::Builder::new()
            .name("pvgpu-irq".to_string())
            .spawn(move || {
                info!("irq listener started");
                loop {
                    match LinkMessage::read_from(&mut reader) {
                        Ok(LinkMessage::Irq { vector }) => {
                            debug!(vector, "irq received");
                            waiters.notify_all();
                        }
                        Ok(LinkMessage::Shutdown) => {
                            info!("backend shutdown received");
                            link_down.store(true, Ordering::Release);
                            waiters.notify_all();
                            break;
                        }
                        Ok(other) => {
                            warn!(?other, "unexpected link message");
                        }
                        Err(e) => {
                            error!("device link read failed: {e}");
                            link_down.store(true, Ordering::Release);
                            waiters.notify_all();
                            break;
                        }
                    }
                }
                info!("irq listener exiting");
            })
            .expect("failed to spawn irq listener thread");
        Self {
            handle: Some(handle),
        }
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
