//! Device-link wire messages.
//!
//! The virtual device and the host backend exchange out-of-band signals
//! over a byte stream: handshake at attach, doorbell notifications when
//! new commands land in the ring, IRQ requests back toward the guest, and
//! shutdown. Each message is a `{ msg_type: u32, payload_size: u32 }`
//! header followed by the payload, little-endian.

use std::io::{self, Read, Write};

pub const LINK_MSG_HANDSHAKE: u32 = 1;
pub const LINK_MSG_HANDSHAKE_ACK: u32 = 2;
pub const LINK_MSG_DOORBELL: u32 = 3;
pub const LINK_MSG_IRQ: u32 = 4;
pub const LINK_MSG_SHUTDOWN: u32 = 5;

/// Payloads larger than this are a framing error, not a message.
const LINK_MAX_PAYLOAD: u32 = 0x10000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    /// Device side connected; carries the shared-memory geometry and the
    /// path of the backing mapping.
    Handshake { shmem_size: u64, shmem_path: String },
    /// Backend accepted; carries the negotiated feature bitmap.
    HandshakeAck { features: u64 },
    /// New commands are available in the ring.
    Doorbell,
    /// Backend requests an interrupt toward the guest.
    Irq { vector: u32 },
    /// Orderly teardown.
    Shutdown,
}

impl LinkMessage {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let (msg_type, payload): (u32, Vec<u8>) = match self {
            LinkMessage::Handshake {
                shmem_size,
                shmem_path,
            } => {
                let mut p = shmem_size.to_le_bytes().to_vec();
                p.extend_from_slice(shmem_path.as_bytes());
                (LINK_MSG_HANDSHAKE, p)
            }
            LinkMessage::HandshakeAck { features } => {
                (LINK_MSG_HANDSHAKE_ACK, features.to_le_bytes().to_vec())
            }
            LinkMessage::Doorbell => (LINK_MSG_DOORBELL, Vec::new()),
            LinkMessage::Irq { vector } => (LINK_MSG_IRQ, vector.to_le_bytes().to_vec()),
            LinkMessage::Shutdown => (LINK_MSG_SHUTDOWN, Vec::new()),
        };

        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&msg_type.to_le_bytes());
        header[4..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        w.write_all(&header)?;
        if !payload.is_empty() {
            w.write_all(&payload)?;
        }
        w.flush()
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut header = [0u8; 8];
        r.read_exact(&mut header)?;
        let msg_type = u32::from_le_bytes(header[..4].try_into().unwrap());
        let payload_size = u32::from_le_bytes(header[4..].try_into().unwrap());

        if payload_size > LINK_MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("link payload too large: {payload_size}"),
            ));
        }
        let mut payload = vec![0u8; payload_size as usize];
        r.read_exact(&mut payload)?;

        match msg_type {
            LINK_MSG_HANDSHAKE => {
                if payload.len() < 8 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "handshake payload too small",
                    ));
                }
                let shmem_size = u64::from_le_bytes(payload[..8].try_into().unwrap());
                let shmem_path = String::from_utf8_lossy(&payload[8..])
                    .trim_end_matches('\0')
                    .to_string();
                Ok(LinkMessage::Handshake {
                    shmem_size,
                    shmem_path,
                })
            }
            LINK_MSG_HANDSHAKE_ACK => {
                if payload.len() < 8 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "handshake ack payload too small",
                    ));
                }
                Ok(LinkMessage::HandshakeAck {
                    features: u64::from_le_bytes(payload[..8].try_into().unwrap()),
                })
            }
            LINK_MSG_DOORBELL => Ok(LinkMessage::Doorbell),
            LINK_MSG_IRQ => {
                if payload.len() < 4 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "irq payload too small",
                    ));
                }
                Ok(LinkMessage::Irq {
                    vector: u32::from_le_bytes(payload[..4].try_into().unwrap()),
                })
            }
            LINK_MSG_SHUTDOWN => Ok(LinkMessage::Shutdown),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown link message type: {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: LinkMessage) -> LinkMessage {
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        LinkMessage::read_from(&mut buf.as_slice()).unwrap()
    }

    #[test]
    fn messages_roundtrip() {
        assert_eq!(
            roundtrip(LinkMessage::Handshake {
                shmem_size: 0x10000000,
                shmem_path: "/tmp/pvgpu-shmem".to_string(),
            }),
            LinkMessage::Handshake {
                shmem_size: 0x10000000,
                shmem_path: "/tmp/pvgpu-shmem".to_string(),
            }
        );
        assert_eq!(
            roundtrip(LinkMessage::HandshakeAck { features: 0x1D }),
            LinkMessage::HandshakeAck { features: 0x1D }
        );
        assert_eq!(roundtrip(LinkMessage::Doorbell), LinkMessage::Doorbell);
        assert_eq!(
            roundtrip(LinkMessage::Irq { vector: 0 }),
            LinkMessage::Irq { vector: 0 }
        );
        assert_eq!(roundtrip(LinkMessage::Shutdown), LinkMessage::Shutdown);
    }

    #[test]
    fn unknown_type_is_invalid_data() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&99u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        let err = LinkMessage::read_from(&mut buf.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
