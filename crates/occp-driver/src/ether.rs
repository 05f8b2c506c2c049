//! Ethernet control-plane transport.
//!
//! Relays register cycles to a device as control datagrams: build a
//! READ/WRITE/NOP packet, send it, and wait for the matching RESPONSE.
//! Correlation is by 8-bit tag plus source address; anything else that
//! arrives is logged and ignored without disturbing the wait. The retry
//! budget is bounded (RETRIES × DELAY_MS), so a dead device costs about a
//! second per access, after which the accessor latches failed.

use crate::access::Accessor;
use crate::error::{HdlError, Result};
use bytemuck::{bytes_of, from_bytes};
use occp_chip::wire::{
    self, EtherControlHeader, EtherControlNop, EtherControlRead, EtherControlReadResponse,
    EtherControlWrite, MessageType, ResponseCode, DELAY_MS, RETRIES,
};
use std::fmt;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The Ethernet broadcast address.
    pub const BROADCAST: Self = Self([0xff; 6]);

    /// True for the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", m[0], m[1], m[2], m[3], m[4], m[5])
    }
}

impl FromStr for MacAddr {
    type Err = HdlError;

    fn from_str(s: &str) -> Result<Self> {
        let mut mac = [0u8; 6];
        let mut parts = 0;
        for (i, p) in s.split(':').enumerate() {
            if i >= 6 {
                return Err(HdlError::discovery(format!("invalid MAC address '{s}'")));
            }
            mac[i] = u8::from_str_radix(p, 16)
                .map_err(|_| HdlError::discovery(format!("invalid MAC address '{s}'")))?;
            parts = i + 1;
        }
        if parts != 6 {
            return Err(HdlError::discovery(format!("invalid MAC address '{s}'")));
        }
        Ok(Self(mac))
    }
}

/// A network interface candidate for discovery.
#[derive(Debug, Clone)]
pub struct Interface {
    /// Interface name ("eth2").
    pub name: String,
    /// Kernel ifindex.
    pub index: i32,
    /// Hardware address.
    pub mac: MacAddr,
    /// Administratively up.
    pub up: bool,
    /// Link carrier present.
    pub connected: bool,
}

/// Enumerate interfaces from sysfs.
///
/// # Errors
///
/// Returns an error only when `/sys/class/net` itself is unreadable;
/// unparseable individual interfaces are skipped.
pub fn scan_interfaces() -> Result<Vec<Interface>> {
    let dir = std::fs::read_dir("/sys/class/net")
        .map_err(|e| HdlError::sysfs("/sys/class/net", e.to_string()))?;
    let mut out = Vec::new();
    for entry in dir.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let base = entry.path();
        let read = |attr: &str| std::fs::read_to_string(base.join(attr)).unwrap_or_default();
        let Ok(index) = read("ifindex").trim().parse::<i32>() else {
            continue;
        };
        let Ok(mac) = read("address").trim().parse::<MacAddr>() else {
            continue;
        };
        if mac.0 == [0; 6] {
            continue; // loopback and friends
        }
        let up = read("operstate").trim() == "up";
        // carrier reads fail with EINVAL while the interface is down
        let connected = read("carrier").trim() == "1";
        out.push(Interface { name, index, mac, up, connected });
    }
    Ok(out)
}

/// Raw frame I/O for the control protocol.
///
/// Payloads start at the EtherType word; the implementation owns the MAC
/// header. `recv` returns `Ok(None)` on timeout.
pub trait ControlSocket: fmt::Debug + Send {
    /// Send `payload` to `dst`.
    ///
    /// # Errors
    ///
    /// OS-level send failures.
    fn send(&mut self, payload: &[u8], dst: MacAddr) -> Result<()>;

    /// Receive one payload, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// OS-level receive failures; a timeout is `Ok(None)`.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<(usize, MacAddr)>>;

    /// This side's hardware address.
    fn local_addr(&self) -> MacAddr;
}

/// A shared per-interface socket.
pub type SharedSocket = Arc<Mutex<dyn ControlSocket>>;

/// Receive buffer size covering any control frame.
pub const RECV_BUF: usize = 1518;

const MAC_HEADER: usize = 12;
const MIN_FRAME: usize = 60;

/// AF_PACKET socket bound to one interface and the control EtherType.
pub struct RawSocket {
    fd: OwnedFd,
    ifindex: i32,
    mac: MacAddr,
}

impl fmt::Debug for RawSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSocket")
            .field("fd", &self.fd.as_raw_fd())
            .field("ifindex", &self.ifindex)
            .field("mac", &self.mac)
            .finish()
    }
}

impl RawSocket {
    /// Open and bind a raw socket on `ifc`. Needs CAP_NET_RAW.
    ///
    /// # Errors
    ///
    /// Socket or bind failure (typically missing privilege).
    pub fn open(ifc: &Interface) -> Result<Self> {
        let proto = u16::to_be(wire::ETHER_TYPE);
        // SAFETY: plain socket(2); the fd is owned immediately on success.
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, i32::from(proto)) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: fd was just returned by socket(2) and is unowned.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: sockaddr_ll is POD; zeroed is a valid initial state.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = proto;
        addr.sll_ifindex = ifc.index;
        // SAFETY: addr is a properly populated sockaddr_ll for this fd.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        tracing::debug!("opened control socket on {} (ifindex {})", ifc.name, ifc.index);
        Ok(Self { fd, ifindex: ifc.index, mac: ifc.mac })
    }
}

impl ControlSocket for RawSocket {
    fn send(&mut self, payload: &[u8], dst: MacAddr) -> Result<()> {
        let mut frame = [0u8; RECV_BUF];
        frame[0..6].copy_from_slice(&dst.0);
        frame[6..12].copy_from_slice(&self.mac.0);
        frame[MAC_HEADER..MAC_HEADER + payload.len()].copy_from_slice(payload);
        let len = (MAC_HEADER + payload.len()).max(MIN_FRAME);
        // SAFETY: sockaddr_ll is POD; zeroed is a valid initial state.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = u16::to_be(wire::ETHER_TYPE);
        addr.sll_ifindex = self.ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&dst.0);
        // SAFETY: frame[..len] is initialized; addr describes the target link.
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr().cast(),
                len,
                0,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(HdlError::SendFailed {
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<(usize, MacAddr)>> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        // SAFETY: pfd references our live fd for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ready < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if ready == 0 {
            return Ok(None);
        }
        let mut frame = [0u8; RECV_BUF];
        // SAFETY: sockaddr_ll is POD; zeroed is a valid out-parameter.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        let mut addr_len = size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        // SAFETY: frame and addr are valid out-buffers of the stated sizes.
        let n = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                frame.as_mut_ptr().cast(),
                frame.len(),
                0,
                std::ptr::addr_of_mut!(addr).cast::<libc::sockaddr>(),
                &mut addr_len,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let n = n as usize;
        if n <= MAC_HEADER {
            return Ok(None);
        }
        let mut src = [0u8; 6];
        src.copy_from_slice(&addr.sll_addr[..6]);
        let payload = n - MAC_HEADER;
        let take = payload.min(buf.len());
        buf[..take].copy_from_slice(&frame[MAC_HEADER..MAC_HEADER + take]);
        Ok(Some((take, MacAddr(src))))
    }

    fn local_addr(&self) -> MacAddr {
        self.mac
    }
}

/// Register accessor relaying cycles over a control socket.
///
/// One per device; the socket may be shared with other devices on the
/// same interface (the mutex serializes frames, and tags plus source
/// filtering keep conversations apart).
#[derive(Debug)]
pub struct NetAccessor {
    socket: SharedSocket,
    dev_addr: MacAddr,
    delay_ms: u64,
    tag: u8,
    failed: bool,
}

impl NetAccessor {
    /// New accessor for the device at `dev_addr` reachable via `socket`.
    pub fn new(socket: SharedSocket, dev_addr: MacAddr, delay_ms: u64) -> Self {
        Self { socket, dev_addr, delay_ms: if delay_ms == 0 { DELAY_MS } else { delay_ms }, tag: 0, failed: false }
    }

    #[cfg(test)]
    pub(crate) fn set_tag(&mut self, tag: u8) {
        self.tag = tag;
    }

    /// Send `frame` and wait for the matching OK response, retrying per
    /// the protocol budget. Returns the response bytes.
    fn request(&mut self, what: &'static str, frame: &mut [u8]) -> Result<[u8; RECV_BUF]> {
        if self.failed {
            return Err(HdlError::TransportFailed { dest: self.dev_addr.to_string() });
        }
        self.tag = self.tag.wrapping_add(1);
        frame[7] = self.tag; // header tag byte
        let mut resp = [0u8; RECV_BUF];
        let mut sock = match self.socket.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        for _attempt in 0..RETRIES {
            sock.send(frame, self.dev_addr)?;
            let deadline = Instant::now() + Duration::from_millis(self.delay_ms);
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let Some((len, src)) = sock.recv(&mut resp, remaining)? else {
                    break;
                };
                if len < size_of::<EtherControlHeader>() {
                    tracing::warn!("control packet too short: {len} bytes, ignored");
                    continue;
                }
                let hdr: &EtherControlHeader = from_bytes(&resp[..size_of::<EtherControlHeader>()]);
                if len < hdr.packet_len() {
                    tracing::warn!(
                        "control packet shorter than its header claims: got {len}, expected {}",
                        hdr.packet_len()
                    );
                    continue;
                }
                if MessageType::from_type_etc(hdr.type_etc) != Some(MessageType::Response) {
                    tracing::warn!(
                        "control packet from {src} not a response, ignored: type_etc {:#04x}",
                        hdr.type_etc
                    );
                    continue;
                }
                if hdr.tag != self.tag {
                    tracing::debug!(
                        "control response from {src} has extraneous tag {}, expecting {}, ignored",
                        hdr.tag,
                        self.tag
                    );
                    continue;
                }
                if src != self.dev_addr {
                    tracing::debug!("control response from wrong address {src}, ignored");
                    continue;
                }
                match ResponseCode::from_type_etc(hdr.type_etc) {
                    Some(ResponseCode::Ok) => return Ok(resp),
                    // The far side definitively reported a state; retrying
                    // cannot change it.
                    Some(ResponseCode::WorkerTimeout) => {
                        return Err(HdlError::WorkerTimeout { what });
                    }
                    Some(ResponseCode::Error | ResponseCode::EtherTimeout) => {
                        return Err(HdlError::RemoteError { what });
                    }
                    None => {
                        tracing::warn!(
                            "control response with unknown code {:#x}, ignored",
                            hdr.type_etc & 0xf
                        );
                    }
                }
            }
            tracing::debug!("timeout waiting for control response from {}", self.dev_addr);
        }
        self.failed = true;
        Err(HdlError::EtherTimeout { dest: self.dev_addr.to_string(), retries: RETRIES })
    }

    /// Round-trip a NOP as a liveness check.
    ///
    /// # Errors
    ///
    /// Transport errors per the crate taxonomy.
    pub fn nop(&mut self) -> Result<()> {
        let mut nop = EtherControlNop::probe();
        nop.header.tag = self.tag; // request() assigns the real tag
        let mut frame = [0u8; size_of::<EtherControlNop>()];
        frame.copy_from_slice(bytes_of(&nop));
        self.request("nop", &mut frame).map(|_| ())
    }
}

impl Accessor for NetAccessor {
    fn get(&mut self, offset: u64, bytes: usize) -> Result<u32> {
        tracing::trace!("net read of {bytes} bytes at {offset:#x}");
        let read = EtherControlRead {
            header: EtherControlHeader::new(
                MessageType::Read,
                wire::byte_enables(offset, bytes),
                0,
                size_of::<EtherControlRead>(),
            ),
            address: ((offset as u32 & wire::ADDRESS_MASK) & !3).to_be(),
        };
        let mut frame = [0u8; size_of::<EtherControlRead>()];
        frame.copy_from_slice(bytes_of(&read));
        let resp = self.request("read", &mut frame)?;
        let rr: &EtherControlReadResponse = from_bytes(&resp[..size_of::<EtherControlReadResponse>()]);
        let data = u32::from_be(rr.data);
        Ok(if bytes == 4 {
            data
        } else {
            (data >> ((offset & 3) * 8)) & !(u32::MAX << (bytes * 8))
        })
    }

    fn set(&mut self, offset: u64, bytes: usize, value: u32) -> Result<()> {
        tracing::trace!("net write of {bytes} bytes at {offset:#x}");
        let write = EtherControlWrite {
            header: EtherControlHeader::new(
                MessageType::Write,
                wire::byte_enables(offset, bytes),
                0,
                size_of::<EtherControlWrite>(),
            ),
            address: ((offset as u32 & wire::ADDRESS_MASK) & !3).to_be(),
            data: (value << ((offset & 3) * 8)).to_be(),
        };
        let mut frame = [0u8; size_of::<EtherControlWrite>()];
        frame.copy_from_slice(bytes_of(&write));
        self.request("write", &mut frame).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ScriptedSocket;
    use occp_chip::wire::type_etc;

    fn read_response(tag: u8, data: u32) -> Vec<u8> {
        let rr = EtherControlReadResponse {
            header: EtherControlHeader::new(
                MessageType::Response,
                ResponseCode::Ok as u8,
                tag,
                size_of::<EtherControlReadResponse>(),
            ),
            data: data.to_be(),
        };
        bytes_of(&rr).to_vec()
    }

    fn accessor(script: ScriptedSocket, dev: MacAddr) -> NetAccessor {
        NetAccessor::new(Arc::new(Mutex::new(script)), dev, 1)
    }

    #[test]
    fn mismatched_tags_are_ignored_not_fatal() {
        let dev: MacAddr = "02:00:00:00:00:01".parse().expect("mac");
        for t in [0u8, 1, 41, 254, 255] {
            let mut script = ScriptedSocket::new();
            let expect = t.wrapping_add(1);
            // Two stale responses, then the real one.
            script.push_response(read_response(expect.wrapping_add(7), 0x1111), dev);
            script.push_response(read_response(expect.wrapping_sub(1), 0x2222), dev);
            script.push_response(read_response(expect, 0xdead_beef), dev);
            let mut acc = accessor(script, dev);
            acc.set_tag(t);
            assert_eq!(acc.get(0x20, 4).expect("read"), 0xdead_beef);
        }
    }

    #[test]
    fn response_from_wrong_source_is_ignored() {
        let dev: MacAddr = "02:00:00:00:00:01".parse().expect("mac");
        let other: MacAddr = "02:00:00:00:00:02".parse().expect("mac");
        let mut script = ScriptedSocket::new();
        script.push_response(read_response(1, 0x1111), other);
        script.push_response(read_response(1, 0x2222), dev);
        let mut acc = accessor(script, dev);
        assert_eq!(acc.get(0, 4).expect("read"), 0x2222);
    }

    #[test]
    fn worker_timeout_fails_immediately_without_retries() {
        let dev: MacAddr = "02:00:00:00:00:01".parse().expect("mac");
        let mut script = ScriptedSocket::new();
        let sent = script.sent_log();
        let mut resp = read_response(1, 0);
        resp[6] = type_etc(MessageType::Response, ResponseCode::WorkerTimeout as u8);
        script.push_response(resp, dev);
        let mut acc = accessor(script, dev);
        match acc.get(0, 4) {
            Err(HdlError::WorkerTimeout { .. }) => {}
            other => panic!("expected worker timeout, got {other:?}"),
        }
        // Only the one send happened: the far side's answer was definitive.
        assert_eq!(sent.lock().expect("log").len(), 1);
    }

    #[test]
    fn exhausted_retries_become_ether_timeout_and_latch() {
        let dev: MacAddr = "02:00:00:00:00:01".parse().expect("mac");
        let script = ScriptedSocket::new(); // never answers
        let mut acc = accessor(script, dev);
        match acc.get(0, 4) {
            Err(HdlError::EtherTimeout { retries, .. }) => assert_eq!(retries, RETRIES),
            other => panic!("expected ether timeout, got {other:?}"),
        }
        match acc.get(0, 4) {
            Err(HdlError::TransportFailed { .. }) => {}
            other => panic!("expected latched failure, got {other:?}"),
        }
    }

    #[test]
    fn narrow_read_extracts_the_addressed_byte() {
        // 1-byte field at 0x21: enables 0b0010, byte pulled from lane 1.
        let dev: MacAddr = "02:00:00:00:00:01".parse().expect("mac");
        let mut script = ScriptedSocket::new();
        let sent = script.sent_log();
        script.push_response(read_response(1, 0xaabb_ccdd), dev);
        let mut acc = accessor(script, dev);
        assert_eq!(acc.get(0x21, 1).expect("read"), 0xcc);
        // And the request carried the right byte enables.
        let sent = sent.lock().expect("log");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0[6] & 0xf, 0b0010);
    }

    #[test]
    fn mac_addr_parses_and_prints() {
        let m: MacAddr = "a0:36:9f:00:12:ff".parse().expect("mac");
        assert_eq!(m.to_string(), "a0:36:9f:00:12:ff");
        assert!("a0:36".parse::<MacAddr>().is_err());
        assert!(MacAddr::BROADCAST.is_broadcast());
    }
}
