//! Ethernet control-plane wire format.
//!
//! Canonical definitions for the OCCP control datagrams. All header
//! structs are `#[repr(C, packed)]` for zero-copy casts from receive
//! buffers; multi-byte fields are big-endian on the wire. Packets begin
//! at the EtherType word — the MAC addresses in front of it belong to the
//! socket layer.
//!
//! A request carries a monotonically incrementing 8-bit tag; a response
//! is only accepted when its tag matches the outstanding request and it
//! arrived from the address the request was sent to.

use bytemuck::{Pod, Zeroable};
use core::mem;

/// EtherType for OCCP control frames, both directions.
pub const ETHER_TYPE: u16 = 0xf040;

/// Send attempts per request before giving up.
pub const RETRIES: u32 = 10;

/// Receive wait per attempt, milliseconds.
pub const DELAY_MS: u64 = 100;

/// Control message types, packed into the high nibble of `type_etc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Discovery probe / liveness check.
    Nop = 0,
    /// Register write.
    Write = 1,
    /// Register read.
    Read = 2,
    /// Response to any of the above.
    Response = 3,
}

impl MessageType {
    /// Decode from a received `type_etc` byte.
    pub const fn from_type_etc(type_etc: u8) -> Option<Self> {
        match type_etc >> 4 {
            0 => Some(Self::Nop),
            1 => Some(Self::Write),
            2 => Some(Self::Read),
            3 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Response codes, packed into the low nibble of a RESPONSE `type_etc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    /// Request completed.
    Ok = 0,
    /// The worker addressed by the request timed out internally.
    WorkerTimeout = 1,
    /// The device reported a processing error.
    Error = 2,
    /// Synthesized locally when retries are exhausted with no valid
    /// response; never on the wire from a device.
    EtherTimeout = 3,
}

impl ResponseCode {
    /// Decode the low nibble of a RESPONSE `type_etc`.
    pub const fn from_type_etc(type_etc: u8) -> Option<Self> {
        match type_etc & 0xf {
            0 => Some(Self::Ok),
            1 => Some(Self::WorkerTimeout),
            2 => Some(Self::Error),
            3 => Some(Self::EtherTimeout),
            _ => None,
        }
    }
}

/// Pack a message type and a low nibble (byte enables or response code)
/// into the `type_etc` byte.
pub const fn type_etc(msg: MessageType, low: u8) -> u8 {
    ((msg as u8) << 4) | (low & 0xf)
}

/// Byte-enable mask for a `bytes`-wide access at `offset`: a run of
/// `bytes` one-bits positioned at the sub-DWORD byte offset.
///
/// The control-plane bus only moves DWORDs; narrower accesses qualify the
/// lanes with this mask.
pub const fn byte_enables(offset: u64, bytes: usize) -> u8 {
    ((!((!0u32) << bytes) << (offset & 3)) & 0xf) as u8
}

/// Common control packet header. 8 bytes starting at the EtherType.
///
/// `length` is big-endian and counts the packet bytes *after* the
/// EtherType overlay, i.e. total size minus 2.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct EtherControlHeader {
    /// EtherType overlay, `ETHER_TYPE` big-endian.
    pub ether_type: u16,
    /// Big-endian byte count minus 2.
    pub length: u16,
    /// Must-be-zero padding.
    pub pad: u16,
    /// `msgtype << 4 | byte-enables` (requests) or `| response code`.
    pub type_etc: u8,
    /// Request/response correlation tag.
    pub tag: u8,
}

/// Discovery probe. The four trailing bytes are a fixed signature.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct EtherControlNop {
    /// Common header.
    pub header: EtherControlHeader,
    /// Must be 0x80.
    pub mbx80: u8,
    /// Must be zero.
    pub mbz0: u8,
    /// Must be zero.
    pub mbz1: u8,
    /// Must be 1: one uncoalesced request per frame.
    pub max_coalesced: u8,
}

/// Ack to a discovery probe; signature mirrors the probe with 0x40.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct EtherControlNopResponse {
    /// Common header.
    pub header: EtherControlHeader,
    /// Must be 0x40.
    pub mbx40: u8,
    /// Must be zero.
    pub mbz0: u8,
    /// Must be zero.
    pub mbz1: u8,
    /// Must be 1.
    pub max_coalesced: u8,
}

/// Register read request. Address is big-endian, DWORD aligned (low two
/// bits masked off), 24 bits significant.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct EtherControlRead {
    /// Common header.
    pub header: EtherControlHeader,
    /// Big-endian DWORD-aligned register address.
    pub address: u32,
}

/// Register write request.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct EtherControlWrite {
    /// Common header.
    pub header: EtherControlHeader,
    /// Big-endian DWORD-aligned register address.
    pub address: u32,
    /// Big-endian data, pre-shifted into its byte lanes.
    pub data: u32,
}

/// Response to a read: the full containing DWORD.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct EtherControlReadResponse {
    /// Common header.
    pub header: EtherControlHeader,
    /// Big-endian register contents.
    pub data: u32,
}

/// Response to a write: header only.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct EtherControlWriteResponse {
    /// Common header.
    pub header: EtherControlHeader,
}

const _: () = assert!(mem::size_of::<EtherControlHeader>() == 8);
const _: () = assert!(mem::size_of::<EtherControlNop>() == 12);
const _: () = assert!(mem::size_of::<EtherControlNopResponse>() == 12);
const _: () = assert!(mem::size_of::<EtherControlRead>() == 12);
const _: () = assert!(mem::size_of::<EtherControlWrite>() == 16);
const _: () = assert!(mem::size_of::<EtherControlReadResponse>() == 12);
const _: () = assert!(mem::size_of::<EtherControlWriteResponse>() == 8);

/// The largest control packet.
pub const MAX_PACKET: usize = mem::size_of::<EtherControlWrite>();

/// Significant bits of a control-plane register address on the wire.
pub const ADDRESS_MASK: u32 = 0x00ff_ffff;

impl EtherControlHeader {
    /// Build a header for a packet of `size` total bytes.
    pub fn new(msg: MessageType, low: u8, tag: u8, size: usize) -> Self {
        Self {
            ether_type: ETHER_TYPE.to_be(),
            length: ((size - 2) as u16).to_be(),
            pad: 0,
            type_etc: type_etc(msg, low),
            tag,
        }
    }

    /// Host-order packet length implied by the wire `length` field
    /// (total bytes including the EtherType overlay).
    pub fn packet_len(&self) -> usize {
        u16::from_be(self.length) as usize + 2
    }
}

impl EtherControlNop {
    /// A fresh discovery probe with tag 0.
    pub fn probe() -> Self {
        Self {
            header: EtherControlHeader::new(MessageType::Nop, 0xf, 0, mem::size_of::<Self>()),
            mbx80: 0x80,
            mbz0: 0,
            mbz1: 0,
            max_coalesced: 1,
        }
    }
}

impl EtherControlNopResponse {
    /// True when every byte of the response matches the prescribed
    /// pattern. Any deviation means "bad discovery response".
    pub fn is_well_formed(&self) -> bool {
        u16::from_be(self.header.length) as usize == mem::size_of::<Self>() - 2
            && self.header.type_etc == type_etc(MessageType::Response, ResponseCode::Ok as u8)
            && self.mbx40 == 0x40
            && self.mbz0 == 0
            && self.mbz1 == 0
            && self.max_coalesced == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_enables_positions_the_run() {
        // One byte at 0x21: offset & 3 == 1, so lane 1 only.
        assert_eq!(byte_enables(0x21, 1), 0b0010);
        assert_eq!(byte_enables(0x20, 4), 0b1111);
        assert_eq!(byte_enables(0x22, 2), 0b1100);
        assert_eq!(byte_enables(0x23, 1), 0b1000);
        assert_eq!(byte_enables(0x00, 1), 0b0001);
    }

    #[test]
    fn type_etc_packs_nibbles() {
        assert_eq!(type_etc(MessageType::Read, 0xf), 0x2f);
        assert_eq!(type_etc(MessageType::Response, ResponseCode::Ok as u8), 0x30);
        assert_eq!(MessageType::from_type_etc(0x2f), Some(MessageType::Read));
        assert_eq!(ResponseCode::from_type_etc(0x31), Some(ResponseCode::WorkerTimeout));
        assert_eq!(MessageType::from_type_etc(0x5f), None);
    }

    #[test]
    fn probe_has_prescribed_signature() {
        let nop = EtherControlNop::probe();
        assert_eq!(nop.mbx80, 0x80);
        assert_eq!(nop.mbz0, 0);
        assert_eq!(nop.mbz1, 0);
        assert_eq!(nop.max_coalesced, 1);
        assert_eq!(nop.header.packet_len(), 12);
        let bytes = bytemuck::bytes_of(&nop);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..2], &ETHER_TYPE.to_be_bytes());
    }

    #[test]
    fn nop_response_validation_is_exact() {
        let mut resp = EtherControlNopResponse {
            header: EtherControlHeader::new(
                MessageType::Response,
                ResponseCode::Ok as u8,
                0,
                mem::size_of::<EtherControlNopResponse>(),
            ),
            mbx40: 0x40,
            mbz0: 0,
            mbz1: 0,
            max_coalesced: 1,
        };
        assert!(resp.is_well_formed());
        resp.max_coalesced = 2;
        assert!(!resp.is_well_formed());
        resp.max_coalesced = 1;
        resp.mbx40 = 0x80;
        assert!(!resp.is_well_formed());
    }

    #[test]
    fn header_length_counts_bytes_minus_two() {
        let h = EtherControlHeader::new(MessageType::Write, 0xf, 9, 16);
        assert_eq!(u16::from_be(h.length), 14);
        assert_eq!(h.packet_len(), 16);
        assert_eq!(h.tag, 9);
    }
}
