//! Register maps and wire formats for OCCP-based FPGA platforms.
//!
//! This crate is pure data: ABI-fixed register layouts for the on-FPGA
//! control plane (OCCP), the per-port data plane block (OCDP), the
//! Ethernet control-protocol packet formats, and PCI identity constants.
//! No I/O happens here — the driver crate owns all device access.
//!
//! Every offset and constant in this crate is part of a hardware contract:
//! bitstreams and this software must agree bit-for-bit. Treat changes as
//! wire-protocol changes.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod admin;
pub mod ocdp;
pub mod pci;
pub mod wire;
pub mod worker;

/// Byte offset of the admin register bank within the OCCP space.
pub const OCCP_ADMIN_OFFSET: u64 = 0;

/// Size reserved for the admin register bank.
pub const OCCP_ADMIN_SIZE: u64 = 0x1000;

/// Maximum number of workers addressable in one OCCP space.
pub const OCCP_MAX_WORKERS: usize = 15;

/// Size of one worker's control register block (including padding).
pub const OCCP_WORKER_CONTROL_SIZE: u64 = 0x1000;

/// Size of one worker's directly-addressable configuration window.
///
/// Larger configuration spaces are reached through the worker `window`
/// register, which selects which 64 KiB page the window exposes.
pub const OCCP_WORKER_CONFIG_SIZE: u64 = 0x1_0000;

/// Byte offset of worker `index`'s control register block.
pub const fn worker_control_offset(index: usize) -> u64 {
    OCCP_ADMIN_SIZE + index as u64 * OCCP_WORKER_CONTROL_SIZE
}

/// Byte offset of worker `index`'s configuration window.
pub const fn worker_config_offset(index: usize) -> u64 {
    OCCP_CONFIG_BASE + index as u64 * OCCP_WORKER_CONFIG_SIZE
}

/// Byte offset where the per-worker configuration windows begin.
pub const OCCP_CONFIG_BASE: u64 = 0x1_0000;

/// Total size of the OCCP space: admin + worker control + config windows.
///
/// BAR0 of a valid device is exactly this size.
pub const OCCP_SPACE_SIZE: u64 = OCCP_CONFIG_BASE + OCCP_MAX_WORKERS as u64 * OCCP_WORKER_CONFIG_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_is_consistent() {
        assert!(OCCP_ADMIN_SIZE + OCCP_MAX_WORKERS as u64 * OCCP_WORKER_CONTROL_SIZE <= OCCP_CONFIG_BASE);
        assert_eq!(worker_control_offset(0), 0x1000);
        assert_eq!(worker_config_offset(0), OCCP_CONFIG_BASE);
        assert_eq!(worker_config_offset(1), OCCP_CONFIG_BASE + 0x1_0000);
        assert_eq!(OCCP_SPACE_SIZE, 0x10_0000);
    }
}
