//! Ethernet discovery driver.
//!
//! Scans up-and-connected interfaces, broadcasts the NOP probe, and
//! creates a device per distinct responder. Raw sockets are expensive
//! and one listener per interface suffices, so sockets are cached per
//! interface and shared by every device opened through it. The cache is
//! not meant for concurrent use; callers serialize access to a driver
//! instance.

use crate::access::{Access, SharedAccessor};
use crate::device::Device;
use crate::error::{HdlError, Result};
use crate::ether::{
    scan_interfaces, ControlSocket, Interface, MacAddr, NetAccessor, RawSocket, SharedSocket,
    RECV_BUF,
};
use bytemuck::{bytes_of, from_bytes};
use occp_chip::wire::{self, EtherControlNop, EtherControlNopResponse, DELAY_MS, RETRIES};
use std::collections::{BTreeSet, HashMap};
use std::mem::size_of;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Set to suppress network discovery entirely.
pub const SUPPRESS_ENV: &str = "OCPI_SUPPRESS_HDL_NETWORK_DISCOVERY";

/// Broadcast the discovery NOP on `socket` (or unicast it when `dest` is
/// a specific address) and collect the distinct responders.
///
/// Responses are validated byte-for-byte against the prescribed pattern;
/// a deviation is logged in full for diagnosis and the scan continues.
/// Broadcast responders are deduplicated by source MAC, so retransmitted
/// answers do not become extra devices.
///
/// # Errors
///
/// Socket-level send/receive failures. Malformed or excluded responses
/// are not errors.
pub fn probe(
    socket: &mut dyn ControlSocket,
    dest: MacAddr,
    exclude: &[&str],
) -> Result<Vec<MacAddr>> {
    let nop = EtherControlNop::probe();
    let mut found: BTreeSet<MacAddr> = BTreeSet::new();
    let mut buf = [0u8; RECV_BUF];
    for _attempt in 0..RETRIES {
        socket.send(bytes_of(&nop), dest)?;
        let deadline = Instant::now() + Duration::from_millis(DELAY_MS);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some((len, src)) = socket.recv(&mut buf, remaining)? else {
                break;
            };
            if exclude.contains(&src.to_string().as_str()) {
                tracing::info!("net device {src} specifically excluded, ignored");
                continue;
            }
            if len < size_of::<EtherControlNopResponse>() {
                tracing::info!("probe return was short: {len} bytes from {src}");
                continue;
            }
            if dest.is_broadcast() && found.contains(&src) {
                tracing::debug!("redundant discovery response from {src}");
                continue;
            }
            let resp: &EtherControlNopResponse =
                from_bytes(&buf[..size_of::<EtherControlNopResponse>()]);
            if !resp.is_well_formed() {
                tracing::warn!("bad network discovery response from {src}:");
                for (i, b) in buf[..size_of::<EtherControlNopResponse>()].iter().enumerate() {
                    tracing::warn!("  response byte {i}: {b:#04x}");
                }
                continue;
            }
            if !dest.is_broadcast() {
                if src != dest {
                    tracing::info!("discovery response from wrong address {src}, ignored");
                    continue;
                }
                return Ok(vec![src]);
            }
            tracing::info!("discovered device at {src}");
            found.insert(src);
        }
        // One full window with answers is enough for a broadcast; keep
        // retrying only while nothing has responded.
        if dest.is_broadcast() && !found.is_empty() {
            break;
        }
    }
    Ok(found.into_iter().collect())
}

/// Ethernet discovery driver with its per-interface socket cache.
#[derive(Debug, Default)]
pub struct NetDriver {
    sockets: HashMap<String, SharedSocket>,
    delay_ms: u64,
}

impl NetDriver {
    /// A driver with protocol-default timing.
    pub fn new() -> Self {
        Self { sockets: HashMap::new(), delay_ms: DELAY_MS }
    }

    /// Find or open the shared socket for `ifc`.
    ///
    /// # Errors
    ///
    /// Raw-socket open failures (typically missing CAP_NET_RAW).
    pub fn find_socket(&mut self, ifc: &Interface) -> Result<SharedSocket> {
        if let Some(s) = self.sockets.get(&ifc.name) {
            return Ok(s.clone());
        }
        let s: SharedSocket = Arc::new(Mutex::new(RawSocket::open(ifc)?));
        self.sockets.insert(ifc.name.clone(), s.clone());
        Ok(s)
    }

    /// Preload a socket for an interface, mainly for emulation.
    pub fn insert_socket(&mut self, name: &str, socket: SharedSocket) {
        self.sockets.insert(name.to_string(), socket);
    }

    /// Scan interfaces (optionally just `if_name`), probe by broadcast,
    /// and hand every validated device to `found`. Per-candidate errors
    /// are logged and skipped; the count of devices found is returned.
    pub fn search(
        &mut self,
        if_name: Option<&str>,
        exclude: &[&str],
        found: &mut dyn FnMut(Device),
    ) -> usize {
        if std::env::var_os(SUPPRESS_ENV).is_some() {
            return 0;
        }
        let interfaces = match scan_interfaces() {
            Ok(i) => i,
            Err(e) => {
                tracing::info!("cannot scan network interfaces: {e}");
                return 0;
            }
        };
        let mut count = 0;
        for ifc in interfaces {
            if let Some(name) = if_name {
                if ifc.name != name {
                    continue;
                }
            }
            if !(ifc.up && ifc.connected) {
                tracing::debug!(
                    "interface '{}' is {} and {}",
                    ifc.name,
                    if ifc.up { "up" } else { "down" },
                    if ifc.connected { "connected" } else { "not connected" }
                );
                continue;
            }
            count += self.search_interface(&ifc, exclude, found);
        }
        count
    }

    fn search_interface(
        &mut self,
        ifc: &Interface,
        exclude: &[&str],
        found: &mut dyn FnMut(Device),
    ) -> usize {
        let socket = match self.find_socket(ifc) {
            Ok(s) => s,
            Err(e) => {
                // needs privilege for bare sockets; not worth shouting
                tracing::debug!("could not open socket on interface '{}': {e}", ifc.name);
                return 0;
            }
        };
        let macs = {
            let mut guard = match socket.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            match probe(&mut *guard, MacAddr::BROADCAST, exclude) {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("error during discovery on '{}': {e}", ifc.name);
                    return 0;
                }
            }
        };
        let mut count = 0;
        for mac in macs {
            match self.create_device(ifc, &socket, mac) {
                Ok(dev) => {
                    found(dev);
                    count += 1;
                }
                Err(e) => {
                    tracing::info!("error creating device for {mac} on '{}': {e}", ifc.name);
                }
            }
        }
        count
    }

    /// Open one device by name: `interface/mac` or a bare MAC probed on
    /// every candidate interface.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` when nothing answers; per-interface open errors.
    pub fn open(&mut self, name: &str) -> Result<Device> {
        let (if_name, mac_str) = match name.split_once('/') {
            Some((i, m)) => (Some(i), m),
            None => (None, name),
        };
        let mac: MacAddr = mac_str.parse()?;
        let interfaces = scan_interfaces()?;
        for ifc in interfaces {
            if let Some(want) = if_name {
                if ifc.name != want {
                    continue;
                }
            }
            if !(ifc.up && ifc.connected) {
                continue;
            }
            let socket = match self.find_socket(&ifc) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!("no socket on '{}': {e}", ifc.name);
                    continue;
                }
            };
            let answered = {
                let mut guard = match socket.lock() {
                    Ok(g) => g,
                    Err(p) => p.into_inner(),
                };
                probe(&mut *guard, mac, &[])?
            };
            if !answered.is_empty() {
                return self.create_device(&ifc, &socket, mac);
            }
        }
        Err(HdlError::device_not_found(name, "no probe response on any interface"))
    }

    fn create_device(
        &mut self,
        ifc: &Interface,
        socket: &SharedSocket,
        mac: MacAddr,
    ) -> Result<Device> {
        let name = format!("Ether:{}/{mac}", ifc.name);
        let accessor: SharedAccessor =
            Arc::new(Mutex::new(NetAccessor::new(socket.clone(), mac, self.delay_ms)));
        let c_access = Access::remote(accessor.clone(), 0, 0);
        let d_access = Access::remote(accessor, 0, 0);
        let endpoint_size = u64::from(wire::ADDRESS_MASK) + 1;
        let mut dev = Device::new(
            name.clone(),
            "ocpi-ether-rdma",
            c_access,
            d_access,
            format!("ocpi-ether-rdma:{}/{mac}", ifc.name),
            endpoint_size,
            0,
        );
        dev.init()?;
        Ok(dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimSocket};

    fn segment(n_devices: usize, duplicates: u32) -> SimSocket {
        let mut seg = SimSocket::new(MacAddr([0x02, 0, 0, 0, 0, 0xfe]));
        seg.nop_duplicates = duplicates;
        for i in 0..n_devices {
            seg.add_device(
                MacAddr([0x02, 0, 0, 0, 0x10, i as u8]),
                SimDevice::shared("ml605", "xc6vlx240t"),
            );
        }
        seg
    }

    #[test]
    fn broadcast_probe_finds_each_device_once() {
        // Two devices, every NOP response retransmitted twice over.
        let mut seg = segment(2, 2);
        let macs = probe(&mut seg, MacAddr::BROADCAST, &[]).expect("probe");
        assert_eq!(macs.len(), 2, "dedup by source MAC must collapse duplicates");
    }

    #[test]
    fn excluded_devices_are_skipped() {
        let mut seg = segment(2, 0);
        let excluded = MacAddr([0x02, 0, 0, 0, 0x10, 0]).to_string();
        let macs = probe(&mut seg, MacAddr::BROADCAST, &[excluded.as_str()]).expect("probe");
        assert_eq!(macs, vec![MacAddr([0x02, 0, 0, 0, 0x10, 1])]);
    }

    #[test]
    fn unicast_probe_returns_exactly_the_target() {
        let mut seg = segment(3, 0);
        let want = MacAddr([0x02, 0, 0, 0, 0x10, 1]);
        let macs = probe(&mut seg, want, &[]).expect("probe");
        assert_eq!(macs, vec![want]);
    }

    #[test]
    fn malformed_probe_responses_are_ignored() {
        use crate::sim::ScriptedSocket;
        let mut script = ScriptedSocket::new();
        let src = MacAddr([0x02, 0, 0, 0, 0x10, 9]);
        // A response with a wrong magic byte.
        let mut resp = bytes_of(&EtherControlNopResponse {
            header: occp_chip::wire::EtherControlHeader::new(
                occp_chip::wire::MessageType::Response,
                occp_chip::wire::ResponseCode::Ok as u8,
                0,
                size_of::<EtherControlNopResponse>(),
            ),
            mbx40: 0x40,
            mbz0: 0,
            mbz1: 0,
            max_coalesced: 1,
        })
        .to_vec();
        resp[8] = 0x80; // clobber mbx40
        script.push_response(resp, src);
        let macs = probe(&mut script, MacAddr::BROADCAST, &[]).expect("probe");
        assert!(macs.is_empty(), "bad discovery response must not yield a device");
    }

    #[test]
    fn search_builds_devices_over_the_wire() {
        let seg = segment(2, 1);
        let mut driver = NetDriver::new();
        driver.insert_socket("sim0", Arc::new(Mutex::new(seg)));
        let ifc = Interface {
            name: "sim0".into(),
            index: 99,
            mac: MacAddr([0x02, 0, 0, 0, 0, 0xfe]),
            up: true,
            connected: true,
        };
        let mut devices = Vec::new();
        let count = driver.search_interface(&ifc, &[], &mut |d| devices.push(d));
        assert_eq!(count, 2);
        for d in &devices {
            assert!(d.is_alive());
            assert_eq!(d.platform(), "ml605");
            assert!(d.name().starts_with("Ether:sim0/"));
        }
    }
}
