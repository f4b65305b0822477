//! Wire error codes, device status bits, and the error type shared by the
//! transport crates.
//!
//! The numeric codes cross the trust boundary (control region `error_code`,
//! escape `status` words), so [`PvgpuError`] keeps an exact round-trip to
//! them: every propagation hop preserves the kind.

use thiserror::Error;

// =============================================================================
// Error Codes
// =============================================================================

pub const PVGPU_ERROR_SUCCESS: u32 = 0x0000;
pub const PVGPU_ERROR_INVALID_COMMAND: u32 = 0x0001;
pub const PVGPU_ERROR_RESOURCE_NOT_FOUND: u32 = 0x0002;
pub const PVGPU_ERROR_OUT_OF_MEMORY: u32 = 0x0003;
pub const PVGPU_ERROR_SHADER_COMPILE: u32 = 0x0004;
pub const PVGPU_ERROR_DEVICE_LOST: u32 = 0x0005;
pub const PVGPU_ERROR_INVALID_PARAMETER: u32 = 0x0006;
pub const PVGPU_ERROR_UNSUPPORTED_FORMAT: u32 = 0x0007;
pub const PVGPU_ERROR_BACKEND_DISCONNECTED: u32 = 0x0008;
pub const PVGPU_ERROR_RING_FULL: u32 = 0x0009;
pub const PVGPU_ERROR_TIMEOUT: u32 = 0x000A;
pub const PVGPU_ERROR_HEAP_EXHAUSTED: u32 = 0x000B;
pub const PVGPU_ERROR_INTERNAL: u32 = 0x000C;
pub const PVGPU_ERROR_UNKNOWN: u32 = 0xFFFF;

// =============================================================================
// Device Status Flags
// =============================================================================

pub const PVGPU_STATUS_READY: u32 = 1 << 0;
pub const PVGPU_STATUS_ERROR: u32 = 1 << 1;
pub const PVGPU_STATUS_DEVICE_LOST: u32 = 1 << 2;
pub const PVGPU_STATUS_BACKEND_BUSY: u32 = 1 << 3;
pub const PVGPU_STATUS_RESIZING: u32 = 1 << 4;
pub const PVGPU_STATUS_RECOVERY: u32 = 1 << 5;
pub const PVGPU_STATUS_SHUTDOWN: u32 = 1 << 6;

/// Transport error, one variant per wire kind.
///
/// Recoverability partitions:
/// - local/recoverable: `RingFull`, `Timeout`, `HeapExhausted` - caller
///   retries after waiting or reclaiming;
/// - per-command: `ResourceNotFound`, `InvalidParameter`,
///   `UnsupportedFormat`, `ShaderCompile` - host records and continues;
/// - device-fatal (sticky): `DeviceLost`, `BackendDisconnected`,
///   `InvalidCommand` on corrupt framing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PvgpuError {
    #[error("invalid or malformed command")]
    InvalidCommand,
    #[error("resource not found")]
    ResourceNotFound,
    #[error("out of memory")]
    OutOfMemory,
    #[error("shader compilation failed")]
    ShaderCompile,
    #[error("device lost")]
    DeviceLost,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("unsupported format")]
    UnsupportedFormat,
    #[error("backend disconnected")]
    BackendDisconnected,
    #[error("command ring full")]
    RingFull,
    #[error("operation timed out")]
    Timeout,
    #[error("resource heap exhausted")]
    HeapExhausted,
    #[error("internal error")]
    Internal,
    #[error("unknown error")]
    Unknown,
}

pub type Result<T> = std::result::Result<T, PvgpuError>;

impl PvgpuError {
    /// The wire code written into `error_code` / escape `status` fields.
    pub fn code(self) -> u32 {
        match self {
            PvgpuError::InvalidCommand => PVGPU_ERROR_INVALID_COMMAND,
            PvgpuError::ResourceNotFound => PVGPU_ERROR_RESOURCE_NOT_FOUND,
            PvgpuError::OutOfMemory => PVGPU_ERROR_OUT_OF_MEMORY,
            PvgpuError::ShaderCompile => PVGPU_ERROR_SHADER_COMPILE,
            PvgpuError::DeviceLost => PVGPU_ERROR_DEVICE_LOST,
            PvgpuError::InvalidParameter => PVGPU_ERROR_INVALID_PARAMETER,
            PvgpuError::UnsupportedFormat => PVGPU_ERROR_UNSUPPORTED_FORMAT,
            PvgpuError::BackendDisconnected => PVGPU_ERROR_BACKEND_DISCONNECTED,
            PvgpuError::RingFull => PVGPU_ERROR_RING_FULL,
            PvgpuError::Timeout => PVGPU_ERROR_TIMEOUT,
            PvgpuError::HeapExhausted => PVGPU_ERROR_HEAP_EXHAUSTED,
            PvgpuError::Internal => PVGPU_ERROR_INTERNAL,
            PvgpuError::Unknown => PVGPU_ERROR_UNKNOWN,
        }
    }

    /// Decode a wire code. `SUCCESS` maps to `Ok(())`; unrecognized codes
    /// collapse to `Unknown` rather than failing the decode.
    pub fn from_code(code: u32) -> std::result::Result<(), PvgpuError> {
        match code {
            PVGPU_ERROR_SUCCESS => Ok(()),
            PVGPU_ERROR_INVALID_COMMAND => Err(PvgpuError::InvalidCommand),
            PVGPU_ERROR_RESOURCE_NOT_FOUND => Err(PvgpuError::ResourceNotFound),
            PVGPU_ERROR_OUT_OF_MEMORY => Err(PvgpuError::OutOfMemory),
            PVGPU_ERROR_SHADER_COMPILE => Err(PvgpuError::ShaderCompile),
            PVGPU_ERROR_DEVICE_LOST => Err(PvgpuError::DeviceLost),
            PVGPU_ERROR_INVALID_PARAMETER => Err(PvgpuError::InvalidParameter),
            PVGPU_ERROR_UNSUPPORTED_FORMAT => Err(PvgpuError::UnsupportedFormat),
            PVGPU_ERROR_BACKEND_DISCONNECTED => Err(PvgpuError::BackendDisconnected),
            PVGPU_ERROR_RING_FULL => Err(PvgpuError::RingFull),
            PVGPU_ERROR_TIMEOUT => Err(PvgpuError::Timeout),
            PVGPU_ERROR_HEAP_EXHAUSTED => Err(PvgpuError::HeapExhausted),
            PVGPU_ERROR_INTERNAL => Err(PvgpuError::Internal),
            _ => Err(PvgpuError::Unknown),
        }
    }

    /// Device-fatal errors taint the device for all future calls.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            PvgpuError::DeviceLost | PvgpuError::BackendDisconnected
        )
    }
}
