//! A discovered OCCP device.
//!
//! Holds the control and data register windows a discovery driver opened,
//! validates the admin space, and hands out worker control interfaces.
//! The admin magic check is the one gate every path goes through: until
//! it passes, nothing else about the device is believed.

use crate::access::Access;
use crate::control::{ControlOp, WorkerControl};
use crate::error::{HdlError, Result};
use crate::port::PortRole;
use occp_chip::admin::{self, HdlUuid};
use occp_chip::{OCCP_MAX_WORKERS, worker_config_offset, worker_control_offset};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A transport-level descriptor of a remotely addressable memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndPoint {
    /// Transport-specific endpoint string, e.g.
    /// `ocpi-dma-pio:0xf7800000.0x100000.0x800000`.
    pub specifier: String,
    /// Addressable size in bytes.
    pub size: u64,
    /// Bus address of the region's origin.
    pub address: u64,
}

/// One FPGA device with an OCCP control plane.
#[derive(Debug)]
pub struct Device {
    name: String,
    protocol: &'static str,
    c_access: Access,
    d_access: Access,
    endpoint_specific: String,
    endpoint_size: u64,
    endpoint_address: u64,
    platform: String,
    part: String,
    uuid: Option<HdlUuid>,
    is_alive: bool,
}

impl Device {
    /// Wrap freshly opened register windows. Call [`Device::init`] before
    /// believing anything else.
    pub fn new(
        name: impl Into<String>,
        protocol: &'static str,
        c_access: Access,
        d_access: Access,
        endpoint_specific: String,
        endpoint_size: u64,
        endpoint_address: u64,
    ) -> Self {
        Self {
            name: name.into(),
            protocol,
            c_access,
            d_access,
            endpoint_specific,
            endpoint_size,
            endpoint_address,
            platform: String::new(),
            part: String::new(),
            uuid: None,
            is_alive: false,
        }
    }

    /// Probe and bring up the device: magic check, platform/time worker
    /// unreset when needed, identity capture.
    ///
    /// # Errors
    ///
    /// `BadMagic` when the admin space does not answer correctly; any
    /// transport or control error during bring-up.
    pub fn init(&mut self) -> Result<()> {
        self.is_alive = false;
        let magic = self.c_access.get64(admin::MAGIC)?;
        if magic != admin::OCCP_MAGIC {
            tracing::warn!(
                "HDL device '{}' responds, but magic is {magic:#018x} (wanted {:#018x})",
                self.name,
                admin::OCCP_MAGIC
            );
            return Err(HdlError::BadMagic { name: self.name.clone(), magic });
        }
        let mut pf = self.worker("platform", "pf_i", 0)?;
        let mut ts = self.worker("time_server", "ts_i", 1)?;
        if pf.is_reset()? {
            tracing::debug!("platform worker is in reset, initializing it");
            pf.reset_cycle()?;
            ts.reset_cycle()?;
            pf.control_op(ControlOp::Initialize)?;
            ts.control_op(ControlOp::Initialize)?;
            pf.control_op(ControlOp::Start)?;
            ts.control_op(ControlOp::Start)?;
        }
        self.is_alive = true;
        self.configure()
    }

    /// Capture identity from the admin UUID block. Called by `init` and
    /// again after loading a new bitstream.
    ///
    /// # Errors
    ///
    /// `BadPlatformName` when the block holds garbage; transport errors.
    pub fn configure(&mut self) -> Result<()> {
        let mut raw = [0u8; admin::UUID_SIZE];
        self.c_access.get_bytes(admin::UUID, &mut raw)?;
        let fixed = admin::fix_endianness(&raw);
        let uuid = HdlUuid::from_bytes(&fixed);
        match uuid.platform_str() {
            Some(p) => self.platform = p.to_string(),
            None => {
                tracing::warn!("HDL device '{}' has a garbage platform name", self.name);
                return Err(HdlError::BadPlatformName { name: self.name.clone() });
            }
        }
        if let Some(d) = uuid.device_str() {
            self.part = d.to_string();
        }
        tracing::info!(
            "HDL device '{}': platform '{}', part '{}', uuid {}",
            self.name,
            self.platform,
            self.part,
            uuid.uuid_string()
        );
        self.uuid = Some(uuid);
        Ok(())
    }

    /// Control interface to worker `index`.
    ///
    /// # Errors
    ///
    /// Rejects indices beyond the OCCP worker array.
    pub fn worker(
        &self,
        impl_name: &str,
        inst_name: &str,
        index: usize,
    ) -> Result<WorkerControl> {
        if index >= OCCP_MAX_WORKERS {
            return Err(HdlError::discovery(format!(
                "invalid occpIndex {index} (max {OCCP_MAX_WORKERS})"
            )));
        }
        Ok(WorkerControl::new(
            impl_name,
            inst_name,
            index,
            self.c_access.window(worker_control_offset(index)),
            self.c_access.window(worker_config_offset(index)),
            true,
        ))
    }

    /// Device name as the discovery driver assigned it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// RDMA protocol this device's endpoints speak.
    pub const fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Platform name from the loaded bitstream.
    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Part/chip name from the loaded bitstream.
    pub fn part(&self) -> &str {
        &self.part
    }

    /// Identity block of the loaded bitstream, after `init`.
    pub const fn uuid(&self) -> Option<&HdlUuid> {
        self.uuid.as_ref()
    }

    /// True once `init` has fully validated the device.
    pub const fn is_alive(&self) -> bool {
        self.is_alive
    }

    /// Compare the loaded bitstream UUID against a canonical text form.
    pub fn is_loaded_uuid(&self, uuid: &str) -> bool {
        self.uuid.as_ref().is_some_and(|u| u.uuid_string() == uuid)
    }

    /// The admin/control register window.
    pub const fn control_space(&self) -> &Access {
        &self.c_access
    }

    /// The data-plane buffer window.
    pub const fn data_space(&self) -> &Access {
        &self.d_access
    }

    /// Worker-presence bitmask from admin space.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub fn present_workers(&self) -> Result<u64> {
        self.c_access.get64(admin::CONFIG)
    }

    /// The RDMA endpoint other sides use to address this device.
    pub fn endpoint(&self) -> EndPoint {
        EndPoint {
            specifier: self.endpoint_specific.clone(),
            size: self.endpoint_size,
            address: self.endpoint_address,
        }
    }

    /// Which transfer roles this device's data movers support for a port
    /// direction. Network data movers only push; PCI providers can also
    /// push flow control back to a messaging peer.
    pub fn dma_options(&self, is_provider: bool) -> u32 {
        if self.protocol.contains("ether") {
            1 << (if is_provider { PortRole::ActiveFlowControl } else { PortRole::ActiveMessage }
                as u32)
        } else if is_provider {
            PortRole::ActiveFlowControl.bit() | PortRole::ActiveMessage.bit()
        } else {
            PortRole::ActiveMessage.bit()
        }
    }

    /// Write/readback liveness check through the admin scratch registers.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub fn scratch_check(&self) -> Result<bool> {
        let pattern = 0xa5a5_5a5a;
        self.c_access.set32(admin::SCRATCH20, pattern)?;
        self.c_access.set32(admin::SCRATCH24, !pattern)?;
        Ok(self.c_access.get32(admin::SCRATCH20)? == pattern
            && self.c_access.get32(admin::SCRATCH24)? == !pattern)
    }

    /// Set the FPGA time-of-day from the host clock.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub fn set_time(&self) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let ticks = ns_to_ticks(now.as_secs(), u64::from(now.subsec_nanos()));
        self.c_access.set64(admin::TIME, admin::swap32(ticks))
    }

    /// Measure the host→FPGA time offset: repeated round trips through
    /// the delta register, slowest decile discarded. Returns nanoseconds.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub fn delta_time(&self) -> Result<u64> {
        const SAMPLES: usize = 100;
        let mut deltas = [0u32; SAMPLES];
        for d in &mut deltas {
            let t = self.c_access.get64(admin::TIME)?;
            self.c_access.set64(admin::TIME_DELTA, t)?;
            *d = admin::swap32(self.c_access.get64(admin::TIME_DELTA)?) as u32;
        }
        deltas.sort_unstable();
        let keep = SAMPLES * 9 / 10;
        let sum: u64 = deltas[..keep].iter().map(|&d| u64::from(d)).sum();
        let avg = (sum + keep as u64 / 2) / keep as u64;
        Ok(ticks_to_ns(avg))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("closing HDL device '{}'", self.name);
    }
}

/// Seconds-and-fraction ticks: seconds in the upper 32 bits, binary
/// fraction below.
fn ns_to_ticks(sec: u64, nsec: u64) -> u64 {
    (sec << 32) + ((nsec << 32) + 500_000_000) / 1_000_000_000
}

fn ticks_to_ns(ticks: u64) -> u64 {
    ((u128::from(ticks) * 1_000_000_000 + (1 << 31)) >> 32) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::SharedAccessor;
    use crate::sim::SimDevice;

    fn sim_device() -> Device {
        let acc: SharedAccessor = SimDevice::shared("ml605", "xc6vlx240t");
        let c = Access::remote(acc.clone(), 0, 0);
        let d = Access::remote(acc, 0, 0x4000_0000);
        Device::new("sim:0", "ocpi-dma-pio", c, d, "ocpi-dma-pio:0".into(), 1 << 24, 0)
    }

    #[test]
    fn init_validates_magic_and_captures_identity() {
        let mut dev = sim_device();
        dev.init().expect("init");
        assert!(dev.is_alive());
        assert_eq!(dev.platform(), "ml605");
        assert_eq!(dev.part(), "xc6vlx240t");
        assert!(dev.uuid().is_some());
    }

    #[test]
    fn init_rejects_bad_magic() {
        let mut dev = sim_device();
        dev.control_space().set64(admin::MAGIC, 0x0BAD_1BAD_DEAD_BEEF).expect("clobber");
        match dev.init() {
            Err(HdlError::BadMagic { magic, .. }) => assert_eq!(magic, 0x0BAD_1BAD_DEAD_BEEF),
            other => panic!("expected bad magic, got {other:?}"),
        }
        assert!(!dev.is_alive());
    }

    #[test]
    fn worker_index_is_bounded() {
        let dev = sim_device();
        assert!(dev.worker("x", "y", OCCP_MAX_WORKERS).is_err());
        assert!(dev.worker("x", "y", OCCP_MAX_WORKERS - 1).is_ok());
    }

    #[test]
    fn scratch_check_round_trips() {
        let dev = sim_device();
        assert!(dev.scratch_check().expect("scratch"));
    }

    #[test]
    fn tick_conversions_are_inverse_enough() {
        let ticks = ns_to_ticks(1_700_000_000, 250_000_000);
        assert_eq!(ticks >> 32, 1_700_000_000);
        let ns = ticks_to_ns(ticks & 0xffff_ffff);
        assert!((ns as i64 - 250_000_000).abs() < 2);
    }
}
