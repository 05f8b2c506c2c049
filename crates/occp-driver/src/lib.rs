//! Driver for FPGA platforms exposing an OCCP control plane.
//!
//! Discovers devices over PCI and raw Ethernet, maps or relays their
//! control-plane registers, drives per-worker lifecycle operations, and
//! negotiates zero-copy RDMA connections between data ports.
//!
//! # Layering
//!
//! ```text
//! port      descriptor exchange, role negotiation, OCDP programming
//! control   worker lifecycle state machine over register triggers
//! device    admin-space identity, per-worker windows, time service
//! net/pci   discovery drivers producing Devices
//! ether     control datagram transport (tag correlation, retries)
//! access    register windows over mmio or a remote accessor
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use occp_driver::{NetDriver, PciDriver};
//!
//! # fn main() -> occp_driver::Result<()> {
//! let mut devices = Vec::new();
//! PciDriver::new().search(&[], &mut |d| devices.push(d));
//! NetDriver::new().search(None, &[], &mut |d| devices.push(d));
//!
//! for dev in &devices {
//!     println!("{}: platform {} part {}", dev.name(), dev.platform(), dev.part());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Everything here is synchronous and blocking: a register access over
//! Ethernet blocks its caller for at most the transport's bounded retry
//! budget (about a second), and nothing suspends indefinitely. Driver
//! instances and Access windows are not meant for concurrent sharing;
//! give each worker and port its own window and serialize driver use.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod access;
pub mod control;
pub mod device;
pub mod error;
pub mod ether;
pub mod mmio;
pub mod net;
pub mod pci;
pub mod port;
pub mod sim;

pub use access::{Access, Accessor, SharedAccessor};
pub use control::{state_from_status, ControlOp, ControlState, WorkerControl};
pub use device::{Device, EndPoint};
pub use error::{HdlError, Result};
pub use ether::{scan_interfaces, ControlSocket, Interface, MacAddr, NetAccessor, RawSocket};
pub use mmio::MappedRegion;
pub use net::NetDriver;
pub use pci::{DmaMemory, PciDriver};
pub use port::{
    choose_roles, pack_descriptor, unpack_descriptor, Desc, DescKind, Descriptors, OutOfBand,
    Port, PortConfig, PortRole, MANDATED_ROLE, MAX_ENDPOINT,
};

/// Name of the environment variable supplying a default device name.
pub const DEFAULT_DEVICE_ENV: &str = "OCPI_DEFAULT_HDL_DEVICE";

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Access, ControlOp, ControlState, Device, HdlError, MacAddr, NetDriver, PciDriver, Port,
        PortConfig, PortRole, Result, WorkerControl,
    };
}
