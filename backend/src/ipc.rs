//! IPC Module - Device Link Server
//!
//! Handles communication with the virtual pvgpu device. The device side
//! connects to this server to:
//! 1. Exchange handshake messages
//! 2. Send doorbell notifications when new commands are available
//! 3. Receive IRQ requests from the host
//!
//! The transport is a loopback stream socket carrying the framed
//! [`LinkMessage`] protocol; a doorbell event (mutex + condvar) decouples
//! the reader thread from the consumer loop.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use pvgpu_protocol::link::LinkMessage;

/// Device link server: owns the listening socket and, after
/// [`wait_for_connection`](Self::wait_for_connection), the connected
/// device stream.
pub struct LinkServer {
    listener: TcpListener,
    stream: Option<Arc<Mutex<TcpStream>>>,
    doorbell: Arc<DoorbellEvent>,
    shutdown: Arc<AtomicBool>,
}

struct DoorbellEvent {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl DoorbellEvent {
    fn signal(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = true;
        self.condvar.notify_one();
    }

    /// Wait up to `timeout` for a doorbell; consumes the pending state.
    /// Returns whether a doorbell was observed.
    fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if !*pending {
            let (p, _) = self
                .condvar
                .wait_timeout(pending, timeout)
                .unwrap_or_else(|e| e.into_inner());
            pending = p;
        }
        std::mem::take(&mut *pending)
    }
}

impl LinkServer {
    /// Bind the listening socket (but don't accept yet).
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
        info!(addr = %listener.local_addr()?, "device link listening");
        Ok(Self {
            listener,
            stream: None,
            doorbell: Arc::new(DoorbellEvent {
                pending: Mutex::new(false),
                condvar: Condvar::new(),
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Block until the device side connects.
    pub fn wait_for_connection(&mut self) -> Result<()> {
        info!("waiting for device connection...");
        let (stream, peer) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        info!(%peer, "device connected");
        self.stream = Some(Arc::new(Mutex::new(stream)));
        Ok(())
    }

    fn stream(&self) -> Result<&Arc<Mutex<TcpStream>>> {
        self.stream
            .as_ref()
            .context("device link not connected")
    }

    /// Read the attach handshake. Returns the shared-memory path and size
    /// the device announced. The ack is sent separately, after the region
    /// exists, so the device never maps a file that is not there yet.
    pub fn read_handshake(&self) -> Result<(String, u64)> {
        let stream = self.stream()?;
        let mut guard = stream.lock().unwrap_or_else(|e| e.into_inner());

        let msg = LinkMessage::read_from(&mut *guard)?;
        let (shmem_path, shmem_size) = match msg {
            LinkMessage::Handshake {
                shmem_size,
                shmem_path,
            } => (shmem_path, shmem_size),
            other => anyhow::bail!("expected handshake, got {other:?}"),
        };
        info!(
            shmem_path,
            size_mb = shmem_size / (1024 * 1024),
            "handshake received"
        );
        Ok((shmem_path, shmem_size))
    }

    /// Acknowledge the handshake with the negotiated feature bitmap.
    pub fn send_handshake_ack(&self, features: u64) -> Result<()> {
        let stream = self.stream()?;
        let mut guard = stream.lock().unwrap_or_else(|e| e.into_inner());
        LinkMessage::HandshakeAck { features }.write_to(&mut *guard)?;
        info!("handshake complete");
        Ok(())
    }

    /// Request an interrupt toward the guest.
    pub fn send_irq(&self, vector: u32) -> Result<()> {
        let stream = self.stream()?;
        let mut guard = stream.lock().unwrap_or_else(|e| e.into_inner());
        LinkMessage::Irq { vector }.write_to(&mut *guard)?;
        Ok(())
    }

    /// Park until the next doorbell or `timeout_ms`. Returns whether a
    /// doorbell arrived.
    pub fn wait_for_doorbell(&self, timeout_ms: u64) -> bool {
        self.doorbell.wait(Duration::from_millis(timeout_ms))
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Wake the consumer loop if it is parked on the doorbell.
        self.doorbell.signal();
    }

    pub fn is_shutdown_signaled(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Spawn the reader thread: doorbell messages signal the event,
    /// shutdown messages (or a dead link) stop the service.
    pub fn start_reader(&self) -> Result<std::thread::JoinHandle<()>> {
        let stream = Arc::clone(self.stream()?);
        let reader = {
            let guard = stream.lock().unwrap_or_else(|e| e.into_inner());
            guard.try_clone()?
        };
        let doorbell = Arc::clone(&self.doorbell);
        let shutdown = Arc::clone(&self.shutdown);

        let handle = std::thread::Builder::new()
            .name("pvgpu-link-reader".to_string())
            .spawn(move || {
                info!("link reader thread started");
                let mut reader = reader;
                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    match LinkMessage::read_from(&mut reader) {
                        Ok(LinkMessage::Doorbell) => {
                            debug!("doorbell received");
                            doorbell.signal();
                        }
                        Ok(LinkMessage::Shutdown) => {
                            info!("shutdown message received from device");
                            shutdown.store(true, Ordering::Release);
                            doorbell.signal();
                            break;
                        }
                        Ok(other) => {
                            warn!(?other, "unexpected link message during operation");
                        }
                        Err(e) => {
                            if !shutdown.load(Ordering::Acquire) {
                                warn!("link read error: {e}");
                                shutdown.store(true, Ordering::Release);
                                doorbell.signal();
                            }
                            break;
                        }
                    }
                }
                info!("link reader thread exiting");
            })
            .context("failed to spawn link reader thread")?;
        Ok(handle)
    }
}
