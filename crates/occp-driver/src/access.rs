//! Register access windows.
//!
//! An [`Access`] is a capability to read and write one register region,
//! backed either by a memory-mapped BAR (PCI) or by a remote [`Accessor`]
//! that relays every cycle over a transport (Ethernet). Workers and ports
//! each own their own window into the shared device space; windows are
//! cheap to clone and re-base.
//!
//! Offsets are byte offsets into the window. Bounds beyond the window are
//! the caller's contract, validated one layer up where extents are known.

use crate::error::Result;
use crate::mmio::MappedRegion;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

/// Remote register access over some transport.
///
/// `bytes` is 1, 2 or 4; `get` returns the value right-aligned, `set`
/// takes it right-aligned. The implementation owns sub-DWORD lane
/// placement, since the control plane only moves DWORDs qualified by
/// byte enables.
pub trait Accessor: Debug + Send {
    /// Read `bytes` at `offset`.
    ///
    /// # Errors
    ///
    /// Transport errors per the crate error taxonomy.
    fn get(&mut self, offset: u64, bytes: usize) -> Result<u32>;

    /// Write `bytes` at `offset`.
    ///
    /// # Errors
    ///
    /// Transport errors per the crate error taxonomy.
    fn set(&mut self, offset: u64, bytes: usize, value: u32) -> Result<()>;
}

/// A shared, serialized remote accessor.
pub type SharedAccessor = Arc<Mutex<dyn Accessor>>;

#[derive(Debug, Clone)]
enum Backing {
    Direct(Arc<MappedRegion>),
    Remote(SharedAccessor),
}

/// One register window.
#[derive(Debug, Clone)]
pub struct Access {
    backing: Backing,
    /// Byte offset of this window within the backing region/accessor.
    base: u64,
    /// Bus address of the backing region's origin (not of this window).
    bus_base: u64,
}

fn lock(m: &SharedAccessor) -> MutexGuard<'_, dyn Accessor + 'static> {
    // A panicked holder leaves registers in an unknown but readable
    // state; recover the guard rather than cascading the poison.
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Access {
    /// Window over a mapped BAR.
    pub fn direct(region: Arc<MappedRegion>, base: u64) -> Self {
        let bus_base = region.bus_addr();
        Self { backing: Backing::Direct(region), base, bus_base }
    }

    /// Window over a remote accessor.
    pub fn remote(accessor: SharedAccessor, base: u64, bus_base: u64) -> Self {
        Self { backing: Backing::Remote(accessor), base, bus_base }
    }

    /// A sub-window `offset` bytes into this one.
    pub fn window(&self, offset: u64) -> Self {
        let mut w = self.clone();
        w.base = self.base + offset;
        w
    }

    /// Bus address of `offset` within this window, for descriptors the
    /// peer will use to address us directly.
    pub const fn bus_offset(&self, offset: u64) -> u64 {
        self.bus_base + self.base + offset
    }

    /// 32-bit read.
    ///
    /// # Errors
    ///
    /// Transport errors on remote windows; direct windows cannot fail.
    pub fn get32(&self, offset: u64) -> Result<u32> {
        match &self.backing {
            Backing::Direct(r) => Ok(r.read32((self.base + offset) as usize)),
            Backing::Remote(m) => lock(m).get(self.base + offset, 4),
        }
    }

    /// 64-bit read. Remote windows move it as two DWORDs, low word first.
    ///
    /// # Errors
    ///
    /// Transport errors on remote windows.
    pub fn get64(&self, offset: u64) -> Result<u64> {
        match &self.backing {
            Backing::Direct(r) => Ok(r.read64((self.base + offset) as usize)),
            Backing::Remote(m) => {
                let mut a = lock(m);
                let lo = a.get(self.base + offset, 4)?;
                let hi = a.get(self.base + offset + 4, 4)?;
                Ok(u64::from(lo) | u64::from(hi) << 32)
            }
        }
    }

    /// 16-bit read.
    ///
    /// # Errors
    ///
    /// Transport errors on remote windows.
    pub fn get16(&self, offset: u64) -> Result<u16> {
        match &self.backing {
            Backing::Direct(r) => Ok(r.read16((self.base + offset) as usize)),
            Backing::Remote(m) => Ok(lock(m).get(self.base + offset, 2)? as u16),
        }
    }

    /// 8-bit read.
    ///
    /// # Errors
    ///
    /// Transport errors on remote windows.
    pub fn get8(&self, offset: u64) -> Result<u8> {
        match &self.backing {
            Backing::Direct(r) => Ok(r.read8((self.base + offset) as usize)),
            Backing::Remote(m) => Ok(lock(m).get(self.base + offset, 1)? as u8),
        }
    }

    /// 32-bit write.
    ///
    /// # Errors
    ///
    /// Transport errors on remote windows.
    pub fn set32(&self, offset: u64, value: u32) -> Result<()> {
        match &self.backing {
            Backing::Direct(r) => {
                r.write32((self.base + offset) as usize, value);
                Ok(())
            }
            Backing::Remote(m) => lock(m).set(self.base + offset, 4, value),
        }
    }

    /// 64-bit write, low DWORD first on remote windows.
    ///
    /// # Errors
    ///
    /// Transport errors on remote windows.
    pub fn set64(&self, offset: u64, value: u64) -> Result<()> {
        match &self.backing {
            Backing::Direct(r) => {
                r.write64((self.base + offset) as usize, value);
                Ok(())
            }
            Backing::Remote(m) => {
                let mut a = lock(m);
                a.set(self.base + offset, 4, value as u32)?;
                a.set(self.base + offset + 4, 4, (value >> 32) as u32)
            }
        }
    }

    /// 16-bit write.
    ///
    /// # Errors
    ///
    /// Transport errors on remote windows.
    pub fn set16(&self, offset: u64, value: u16) -> Result<()> {
        match &self.backing {
            Backing::Direct(r) => {
                r.write16((self.base + offset) as usize, value);
                Ok(())
            }
            Backing::Remote(m) => lock(m).set(self.base + offset, 2, u32::from(value)),
        }
    }

    /// 8-bit write.
    ///
    /// # Errors
    ///
    /// Transport errors on remote windows.
    pub fn set8(&self, offset: u64, value: u8) -> Result<()> {
        match &self.backing {
            Backing::Direct(r) => {
                r.write8((self.base + offset) as usize, value);
                Ok(())
            }
            Backing::Remote(m) => lock(m).set(self.base + offset, 1, u32::from(value)),
        }
    }

    /// Read a byte range, walking DWORD-at-a-time so every cycle stays a
    /// legal control-plane access.
    ///
    /// # Errors
    ///
    /// Transport errors on remote windows.
    pub fn get_bytes(&self, mut offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut remaining = buf.len();
        let mut at = 0usize;
        while remaining > 0 {
            let in_word = 4 - (offset & 3) as usize;
            let bytes = remaining.min(in_word);
            let val = match &self.backing {
                Backing::Direct(r) => {
                    let word = r.read32(((self.base + offset) & !3) as usize);
                    (word >> ((offset & 3) * 8)) & mask(bytes)
                }
                Backing::Remote(m) => lock(m).get(self.base + offset, bytes)?,
            };
            buf[at..at + bytes].copy_from_slice(&val.to_le_bytes()[..bytes]);
            remaining -= bytes;
            at += bytes;
            offset += bytes as u64;
        }
        Ok(())
    }

    /// Write a byte range, DWORD-at-a-time.
    ///
    /// # Errors
    ///
    /// Transport errors on remote windows.
    pub fn set_bytes(&self, mut offset: u64, buf: &[u8]) -> Result<()> {
        let mut remaining = buf.len();
        let mut at = 0usize;
        while remaining > 0 {
            let in_word = 4 - (offset & 3) as usize;
            let bytes = remaining.min(in_word);
            let mut le = [0u8; 4];
            le[..bytes].copy_from_slice(&buf[at..at + bytes]);
            let val = u32::from_le_bytes(le) & mask(bytes);
            match &self.backing {
                Backing::Direct(r) => {
                    // Byte stores generate the right enables on the bus.
                    for (i, b) in buf[at..at + bytes].iter().enumerate() {
                        r.write8((self.base + offset) as usize + i, *b);
                    }
                }
                Backing::Remote(m) => lock(m).set(self.base + offset, bytes, val)?,
            }
            remaining -= bytes;
            at += bytes;
            offset += bytes as u64;
        }
        Ok(())
    }
}

const fn mask(bytes: usize) -> u32 {
    if bytes >= 4 {
        u32::MAX
    } else {
        !(u32::MAX << (bytes * 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn sim_access() -> (Access, SharedAccessor) {
        let shared: SharedAccessor = Arc::new(Mutex::new(SimDevice::new("sim", "simpart")));
        (Access::remote(shared.clone(), 0, 0), shared)
    }

    #[test]
    fn windows_compose_offsets() {
        let (a, _s) = sim_access();
        let w = a.window(0x1000).window(0x20);
        assert_eq!(w.bus_offset(4), 0x1024);
    }

    #[test]
    fn remote_byte_range_walks_dwords() {
        let (a, _s) = sim_access();
        let scratch = occp_chip::admin::SCRATCH20;
        a.set_bytes(scratch, &[1, 2, 3, 4, 5, 6]).expect("set");
        let mut back = [0u8; 6];
        a.get_bytes(scratch, &mut back).expect("get");
        assert_eq!(back, [1, 2, 3, 4, 5, 6]);
        // Misaligned start within a DWORD.
        let mut one = [0u8; 1];
        a.get_bytes(scratch + 1, &mut one).expect("get");
        assert_eq!(one, [2]);
    }

    #[test]
    fn sixty_four_bit_moves_low_word_first() {
        let (a, s) = sim_access();
        a.set64(occp_chip::admin::SCRATCH20, 0x1122_3344_5566_7788).expect("set64");
        assert_eq!(a.get64(occp_chip::admin::SCRATCH20).expect("get64"), 0x1122_3344_5566_7788);
        let dev = lock(&s);
        drop(dev);
        assert_eq!(a.get32(occp_chip::admin::SCRATCH20).expect("lo"), 0x5566_7788);
        assert_eq!(a.get32(occp_chip::admin::SCRATCH24).expect("hi"), 0x1122_3344);
    }
}
