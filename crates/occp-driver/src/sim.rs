//! Software emulation of an OCCP device.
//!
//! [`SimDevice`] models the register space of a loaded bitstream well
//! enough to discover, probe, drive control operations, and connect
//! ports against — no hardware required. [`SimSocket`] puts one or more
//! emulated devices on a fake Ethernet segment speaking the real wire
//! protocol, and [`ScriptedSocket`] replays canned frames for protocol
//! tests. The CLI `emulate` subcommand and the test suites are the
//! consumers.

use crate::access::Accessor;
use crate::control::ControlOp;
use crate::error::Result;
use crate::ether::{ControlSocket, MacAddr};
use bytemuck::{bytes_of, from_bytes};
use occp_chip::wire::{
    self, EtherControlHeader, EtherControlNopResponse, EtherControlReadResponse,
    EtherControlWriteResponse, MessageType, ResponseCode,
};
use occp_chip::{admin, ocdp, worker, OCCP_SPACE_SIZE, OCCP_WORKER_CONTROL_SIZE};
use std::collections::{HashMap, VecDeque};
use std::mem::size_of;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Emulated register space of one device.
#[derive(Debug)]
pub struct SimDevice {
    mem: Vec<u8>,
    /// Override results for specific (absolute) control-op slots.
    op_results: HashMap<u64, u32>,
    reads: HashMap<u64, usize>,
}

impl SimDevice {
    /// A device with four workers present and the given identity.
    pub fn new(platform: &str, part: &str) -> Self {
        let mut mem = vec![0u8; OCCP_SPACE_SIZE as usize];
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as u32;

        mem[admin::MAGIC as usize..][..8].copy_from_slice(&admin::OCCP_MAGIC.to_le_bytes());
        mem[admin::REVISION as usize..][..4].copy_from_slice(&4u32.to_le_bytes());
        mem[admin::BIRTHDAY as usize..][..4].copy_from_slice(&now.to_le_bytes());
        mem[admin::CONFIG as usize..][..8].copy_from_slice(&0b1111u64.to_le_bytes());
        mem[admin::DNA as usize..][..8].copy_from_slice(&0x0102_0304_0506_07u64.to_le_bytes());
        mem[admin::NUM_REGIONS as usize..][..4].copy_from_slice(&1u32.to_le_bytes());

        // UUID block, stored with the hardware's per-DWORD byte reversal.
        let mut block = [0u8; admin::UUID_SIZE];
        block[0..4].copy_from_slice(&(now + 1).to_le_bytes());
        block[4..20].copy_from_slice(&[
            0x9e, 0x1c, 0x7a, 0x02, 0x4b, 0x1f, 0x4e, 0x60, 0x8f, 0x33, 0x21, 0x08, 0x5a, 0x7d,
            0x91, 0x44,
        ]);
        let plat = platform.as_bytes();
        block[20..20 + plat.len().min(16)].copy_from_slice(&plat[..plat.len().min(16)]);
        let dev = part.as_bytes();
        block[36..36 + dev.len().min(16)].copy_from_slice(&dev[..dev.len().min(16)]);
        block[52..54].copy_from_slice(b"ld");
        // fix_endianness is an involution, so encoding reuses it
        let wire_block = admin::fix_endianness(&block);
        mem[admin::UUID as usize..][..admin::UUID_SIZE].copy_from_slice(&wire_block);

        Self { mem, op_results: HashMap::new(), reads: HashMap::new() }
    }

    /// A shared handle usable as an [`Accessor`].
    pub fn shared(platform: &str, part: &str) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(platform, part)))
    }

    /// Give worker `index` an OCDP block with `memory_bytes` of buffer
    /// memory in its config window.
    pub fn install_ocdp(&mut self, index: usize, memory_bytes: u32) {
        let base = occp_chip::worker_config_offset(index) as usize;
        self.mem[base + ocdp::MEMORY_BYTES as usize..][..4]
            .copy_from_slice(&memory_bytes.to_le_bytes());
        self.mem[base + ocdp::FOOD_FACE_REG as usize..][..4]
            .copy_from_slice(&ocdp::FOOD_FACE.to_le_bytes());
    }

    /// Force the result word the next reads of one worker's op slot see.
    pub fn set_op_result(&mut self, index: usize, op_offset: u64, code: u32) {
        self.op_results.insert(occp_chip::worker_control_offset(index) + op_offset, code);
    }

    /// Overwrite a worker's status register.
    pub fn set_status(&mut self, index: usize, status: u32) {
        let at = (occp_chip::worker_control_offset(index) + worker::STATUS) as usize;
        self.mem[at..at + 4].copy_from_slice(&status.to_le_bytes());
    }

    /// How many reads have hit the absolute offset `at`.
    pub fn reads_at(&self, at: u64) -> usize {
        self.reads.get(&at).copied().unwrap_or(0)
    }

    /// Raw 32-bit peek, bypassing trigger semantics.
    pub fn peek32(&self, at: u64) -> u32 {
        let at = at as usize;
        u32::from_le_bytes([self.mem[at], self.mem[at + 1], self.mem[at + 2], self.mem[at + 3]])
    }

    /// Which worker control block (if any) an absolute offset falls in.
    fn worker_block(at: u64) -> Option<(usize, u64)> {
        let workers_base = occp_chip::worker_control_offset(0);
        let workers_end = occp_chip::worker_control_offset(occp_chip::OCCP_MAX_WORKERS);
        if at >= workers_base && at < workers_end {
            let index = ((at - workers_base) / OCCP_WORKER_CONTROL_SIZE) as usize;
            Some((index, (at - workers_base) % OCCP_WORKER_CONTROL_SIZE))
        } else {
            None
        }
    }

    fn trigger(&mut self, at: u64, index: usize, slot: u64) -> u32 {
        let control = self.peek32(occp_chip::worker_control_offset(index) + worker::CONTROL);
        if control & worker::control::ENABLE == 0 {
            return worker::result::RESET;
        }
        if let Some(&code) = self.op_results.get(&at) {
            return code;
        }
        // Record state-changing ops in the sticky status field.
        let op = (slot / 4) as u32;
        if op <= ControlOp::Release as u32 {
            let stat_at = occp_chip::worker_control_offset(index) + worker::STATUS;
            let stat = self.peek32(stat_at)
                & !(worker::status::LAST_OP_MASK << worker::status::LAST_OP_SHIFT);
            let stat = stat | worker::status::LAST_OP_VALID | (op << worker::status::LAST_OP_SHIFT);
            let stat_at = stat_at as usize;
            self.mem[stat_at..stat_at + 4].copy_from_slice(&stat.to_le_bytes());
        }
        worker::result::SUCCESS
    }
}

impl Accessor for SimDevice {
    fn get(&mut self, offset: u64, bytes: usize) -> Result<u32> {
        *self.reads.entry(offset).or_insert(0) += 1;
        if let Some((index, block_off)) = Self::worker_block(offset) {
            if block_off < worker::STATUS {
                return Ok(self.trigger(offset, index, block_off));
            }
        }
        let at = offset as usize;
        let mut le = [0u8; 4];
        le[..bytes].copy_from_slice(&self.mem[at..at + bytes]);
        Ok(u32::from_le_bytes(le))
    }

    fn set(&mut self, offset: u64, bytes: usize, value: u32) -> Result<()> {
        if let Some((index, block_off)) = Self::worker_block(offset) {
            if block_off == worker::CLEAR_ERROR {
                let stat = self.peek32(occp_chip::worker_control_offset(index) + worker::STATUS)
                    & !worker::status::ALL_ERRORS;
                let at = (occp_chip::worker_control_offset(index) + worker::STATUS) as usize;
                self.mem[at..at + 4].copy_from_slice(&stat.to_le_bytes());
                return Ok(());
            }
        }
        let at = offset as usize;
        self.mem[at..at + bytes].copy_from_slice(&value.to_le_bytes()[..bytes]);
        Ok(())
    }
}

/// A fake Ethernet segment carrying the control protocol.
///
/// Every attached device answers probes and register cycles addressed to
/// it (or broadcast), through the same state a PCI-style accessor would
/// see.
#[derive(Debug)]
pub struct SimSocket {
    host_mac: MacAddr,
    devices: Vec<(MacAddr, Arc<Mutex<SimDevice>>)>,
    queue: VecDeque<(Vec<u8>, MacAddr)>,
    /// Extra copies of each NOP response, emulating retransmission.
    pub nop_duplicates: u32,
}

impl SimSocket {
    /// An empty segment seen from `host_mac`.
    pub fn new(host_mac: MacAddr) -> Self {
        Self { host_mac, devices: Vec::new(), queue: VecDeque::new(), nop_duplicates: 0 }
    }

    /// Attach an emulated device at `mac`.
    pub fn add_device(&mut self, mac: MacAddr, dev: Arc<Mutex<SimDevice>>) {
        self.devices.push((mac, dev));
    }

    fn respond(&mut self, payload: &[u8], mac: MacAddr, dev: &Arc<Mutex<SimDevice>>) {
        if payload.len() < size_of::<EtherControlHeader>() {
            return;
        }
        let hdr: &EtherControlHeader = from_bytes(&payload[..size_of::<EtherControlHeader>()]);
        let tag = hdr.tag;
        match MessageType::from_type_etc(hdr.type_etc) {
            Some(MessageType::Nop) => {
                let resp = EtherControlNopResponse {
                    header: EtherControlHeader::new(
                        MessageType::Response,
                        ResponseCode::Ok as u8,
                        tag,
                        size_of::<EtherControlNopResponse>(),
                    ),
                    mbx40: 0x40,
                    mbz0: 0,
                    mbz1: 0,
                    max_coalesced: 1,
                };
                for _ in 0..=self.nop_duplicates {
                    self.queue.push_back((bytes_of(&resp).to_vec(), mac));
                }
            }
            Some(MessageType::Read) => {
                let req: &wire::EtherControlRead =
                    from_bytes(&payload[..size_of::<wire::EtherControlRead>()]);
                let addr = u64::from(u32::from_be(req.address));
                let data = dev
                    .lock()
                    .expect("sim device")
                    .get(addr, 4)
                    .unwrap_or(0xdead_dead);
                let resp = EtherControlReadResponse {
                    header: EtherControlHeader::new(
                        MessageType::Response,
                        ResponseCode::Ok as u8,
                        tag,
                        size_of::<EtherControlReadResponse>(),
                    ),
                    data: data.to_be(),
                };
                self.queue.push_back((bytes_of(&resp).to_vec(), mac));
            }
            Some(MessageType::Write) => {
                let req: &wire::EtherControlWrite =
                    from_bytes(&payload[..size_of::<wire::EtherControlWrite>()]);
                let addr = u64::from(u32::from_be(req.address));
                let data = u32::from_be(req.data);
                let enables = req.header.type_etc & 0xf;
                // Recover lane offset and width from the enable run.
                let first = enables.trailing_zeros() as u64;
                let count = (enables >> first).count_ones() as usize;
                let value = (data >> (first * 8))
                    & if count >= 4 { u32::MAX } else { !(u32::MAX << (count * 8)) };
                let _ = dev.lock().expect("sim device").set(addr + first, count, value);
                let resp = EtherControlWriteResponse {
                    header: EtherControlHeader::new(
                        MessageType::Response,
                        ResponseCode::Ok as u8,
                        tag,
                        size_of::<EtherControlWriteResponse>(),
                    ),
                };
                self.queue.push_back((bytes_of(&resp).to_vec(), mac));
            }
            _ => {}
        }
    }
}

impl ControlSocket for SimSocket {
    fn send(&mut self, payload: &[u8], dst: MacAddr) -> Result<()> {
        let devices = self.devices.clone();
        for (mac, dev) in &devices {
            if dst.is_broadcast() || dst == *mac {
                self.respond(payload, *mac, dev);
            }
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<Option<(usize, MacAddr)>> {
        match self.queue.pop_front() {
            Some((bytes, src)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(Some((n, src)))
            }
            None => Ok(None),
        }
    }

    fn local_addr(&self) -> MacAddr {
        self.host_mac
    }
}

/// Replays canned response frames and records everything sent.
#[derive(Debug, Default)]
pub struct ScriptedSocket {
    responses: VecDeque<(Vec<u8>, MacAddr)>,
    sent: Arc<Mutex<Vec<(Vec<u8>, MacAddr)>>>,
}

impl ScriptedSocket {
    /// An empty script: every receive times out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response frame from `src`.
    pub fn push_response(&mut self, bytes: Vec<u8>, src: MacAddr) {
        self.responses.push_back((bytes, src));
    }

    /// Handle onto the log of sent frames, valid after the socket moves.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<(Vec<u8>, MacAddr)>>> {
        self.sent.clone()
    }
}

impl ControlSocket for ScriptedSocket {
    fn send(&mut self, payload: &[u8], dst: MacAddr) -> Result<()> {
        self.sent.lock().expect("sent log").push((payload.to_vec(), dst));
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<Option<(usize, MacAddr)>> {
        match self.responses.pop_front() {
            Some((bytes, src)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(Some((n, src)))
            }
            None => Ok(None),
        }
    }

    fn local_addr(&self) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, 0xfe])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_space_carries_the_magic() {
        let mut dev = SimDevice::new("ml605", "xc6vlx240t");
        let lo = dev.get(admin::MAGIC, 4).expect("lo");
        let hi = dev.get(admin::MAGIC + 4, 4).expect("hi");
        assert_eq!(u64::from(lo) | u64::from(hi) << 32, admin::OCCP_MAGIC);
    }

    #[test]
    fn op_slot_read_in_reset_reports_reset() {
        let mut dev = SimDevice::new("sim", "sim");
        let slot = occp_chip::worker_control_offset(1);
        assert_eq!(dev.get(slot, 4).expect("read"), worker::result::RESET);
    }

    #[test]
    fn op_slot_read_out_of_reset_succeeds_and_records() {
        let mut dev = SimDevice::new("sim", "sim");
        let base = occp_chip::worker_control_offset(1);
        dev.set(base + worker::CONTROL, 4, worker::control::ENABLE | 4).expect("unreset");
        let slot = base + ControlOp::Start.offset();
        assert_eq!(dev.get(slot, 4).expect("read"), worker::result::SUCCESS);
        let stat = dev.peek32(base + worker::STATUS);
        assert_eq!(
            worker::status::last_op(stat),
            Some(ControlOp::Start as u32)
        );
    }

    #[test]
    fn sub_word_access_hits_the_right_lanes() {
        let mut dev = SimDevice::new("sim", "sim");
        dev.set(admin::SCRATCH20, 4, 0x1122_3344).expect("set");
        dev.set(admin::SCRATCH20 + 1, 1, 0xaa).expect("set byte");
        assert_eq!(dev.get(admin::SCRATCH20, 4).expect("get"), 0x1122_aa44);
        assert_eq!(dev.get(admin::SCRATCH20 + 1, 1).expect("get byte"), 0xaa);
    }
}
