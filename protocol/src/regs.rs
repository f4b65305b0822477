//! Virtual PCIe device identity and BAR0 register map.
//!
//! BAR0 is a 4 KiB configuration-register region; BAR1 is the shared
//! memory region itself. Writing [`PVGPU_REG_DOORBELL`] at any value wakes
//! the host consumer; writing [`PVGPU_REG_RESET`] clears all transport
//! state and re-initializes the control region.

// PCI identity
pub const PVGPU_PCI_VENDOR_ID: u16 = 0x1B36; // Red Hat (QEMU)
pub const PVGPU_PCI_DEVICE_ID: u16 = 0x0778;
pub const PVGPU_PCI_REVISION: u8 = 0x01;
/// Display controller, 3D controller (VGA-3D).
pub const PVGPU_PCI_CLASS_CODE: u32 = 0x030200;

pub const PVGPU_REG_BAR_SIZE: usize = 0x1000;

// BAR0 register offsets
pub const PVGPU_REG_VERSION: usize = 0x00;
pub const PVGPU_REG_FEATURES: usize = 0x08;
pub const PVGPU_REG_STATUS: usize = 0x10;
/// Write-only; any value rings the doorbell.
pub const PVGPU_REG_DOORBELL: usize = 0x14;
pub const PVGPU_REG_IRQ_STATUS: usize = 0x18;
pub const PVGPU_REG_IRQ_MASK: usize = 0x1C;
pub const PVGPU_REG_SHMEM_SIZE: usize = 0x20;
pub const PVGPU_REG_RING_SIZE: usize = 0x28;
pub const PVGPU_REG_RESET: usize = 0x30;

// Interrupt status bits
pub const PVGPU_IRQ_FENCE: u32 = 1 << 0;
pub const PVGPU_IRQ_ERROR: u32 = 1 << 1;
