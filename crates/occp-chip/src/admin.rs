//! OCCP admin register bank.
//!
//! The admin bank sits at offset 0 of the OCCP space and identifies the
//! loaded bitstream: a 64-bit ASCII magic, build birthday, worker-presence
//! bitmask, GPS-grade time registers, and a trailing 512-bit UUID block.
//!
//! The UUID block is stored opposite-endian from the host: every 32-bit
//! word is byte-reversed. `fix_endianness` undoes that. Whether any
//! deployed platform ships the same-endian variant is unresolved, so the
//! conditional is kept behind [`FPGA_IS_OPPOSITE_ENDIAN`].

/// Admin magic value: ASCII "OpenCPI" and a trailing NUL, read as one
/// big-endian 64-bit word.
pub const OCCP_MAGIC: u64 = u64::from_be_bytes(*b"OpenCPI\0");

/// All current platforms store multi-byte admin/UUID fields with each
/// 32-bit word byte-reversed relative to the host.
pub const FPGA_IS_OPPOSITE_ENDIAN: bool = true;

// Field offsets within the admin bank. ABI-fixed.

/// 64-bit magic ("OpenCPI\0").
pub const MAGIC: u64 = 0x00;
/// Control-plane revision.
pub const REVISION: u64 = 0x08;
/// Bitstream build time (Unix seconds).
pub const BIRTHDAY: u64 = 0x0C;
/// Worker-presence bitmask, bit N = worker N exists. 64-bit.
pub const CONFIG: u64 = 0x10;
/// PCI device number the bitstream was built for.
pub const PCI_DEVICE: u64 = 0x18;
/// Attention bits, one per worker.
pub const ATTENTION: u64 = 0x1C;
/// Scratch register at 0x20, free for software probes.
pub const SCRATCH20: u64 = 0x20;
/// Scratch register at 0x24.
pub const SCRATCH24: u64 = 0x24;
/// Global status.
pub const STATUS: u64 = 0x28;
/// Global control.
pub const CONTROL: u64 = 0x2C;
/// Time-service status.
pub const TIME_STATUS: u64 = 0x30;
/// Time-service control.
pub const TIME_CONTROL: u64 = 0x34;
/// 64-bit current time, seconds in the upper half, binary fraction below.
pub const TIME: u64 = 0x38;
/// 64-bit delta register: writing stores (written - current) readback.
pub const TIME_DELTA: u64 = 0x40;
/// Clocks per PPS measurement.
pub const TIME_CLKS_PER_PPS: u64 = 0x48;
/// 64-bit device DNA (die serial).
pub const DNA: u64 = 0x50;
/// Number of valid entries in `REGIONS`.
pub const NUM_REGIONS: u64 = 0x58;
/// Sixteen 32-bit data-plane region registers.
pub const REGIONS: u64 = 0x60;
/// Number of region slots.
pub const N_REGION_SLOTS: usize = 16;
/// Trailing UUID block (512 bits, see [`HdlUuid`]).
pub const UUID: u64 = 0xA0;

/// The 512-bit identity block trailing the admin bank.
///
/// Fixed-size, fixed-offset; strings are NUL-padded, not NUL-terminated
/// when full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HdlUuid {
    /// Bitstream build time (Unix seconds), may differ slightly from the
    /// admin `BIRTHDAY`.
    pub birthday: u32,
    /// The loaded bitstream's UUID.
    pub uuid: [u8; 16],
    /// Platform name, e.g. "ml605".
    pub platform: [u8; 16],
    /// Part/chip name, e.g. "xc6vlx240t".
    pub device: [u8; 16],
    /// Load-tool tag.
    pub load: [u8; 4],
    /// Copy of the device DNA.
    pub dna: [u8; 8],
}

/// Size of the UUID block in bytes.
pub const UUID_SIZE: usize = core::mem::size_of::<HdlUuid>();
const _: () = assert!(UUID_SIZE == 64);

/// Undo the per-DWORD byte reversal the hardware applies to the UUID
/// block (and the time registers). A no-op when the platform is
/// same-endian.
pub fn fix_endianness(raw: &[u8; UUID_SIZE]) -> [u8; UUID_SIZE] {
    if !FPGA_IS_OPPOSITE_ENDIAN {
        return *raw;
    }
    let mut out = [0u8; UUID_SIZE];
    for (n, b) in out.iter_mut().enumerate() {
        *b = raw[(n & !3) + (3 - (n & 3))];
    }
    out
}

/// Byte-reverse each 32-bit half of a 64-bit register value.
///
/// The time registers move 64 bits as two opposite-endian DWORDs; this is
/// the swap needed in both directions.
pub const fn swap32(v: u64) -> u64 {
    if !FPGA_IS_OPPOSITE_ENDIAN {
        return v;
    }
    ((v as u32).swap_bytes() as u64) | (((v >> 32) as u32).swap_bytes() as u64) << 32
}

impl HdlUuid {
    /// Parse an endian-fixed UUID block.
    pub fn from_bytes(fixed: &[u8; UUID_SIZE]) -> Self {
        let mut uuid = [0u8; 16];
        let mut platform = [0u8; 16];
        let mut device = [0u8; 16];
        let mut load = [0u8; 4];
        let mut dna = [0u8; 8];
        uuid.copy_from_slice(&fixed[4..20]);
        platform.copy_from_slice(&fixed[20..36]);
        device.copy_from_slice(&fixed[36..52]);
        load.copy_from_slice(&fixed[52..56]);
        dna.copy_from_slice(&fixed[56..64]);
        Self {
            birthday: u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]),
            uuid,
            platform,
            device,
            load,
            dna,
        }
    }

    /// NUL-trimmed platform name, if it holds printable text.
    pub fn platform_str(&self) -> Option<&str> {
        trimmed_str(&self.platform)
    }

    /// NUL-trimmed part name, if it holds printable text.
    pub fn device_str(&self) -> Option<&str> {
        trimmed_str(&self.device)
    }

    /// The UUID in canonical 8-4-4-4-12 text form.
    pub fn uuid_string(&self) -> String {
        let u = &self.uuid;
        format!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            u[0], u[1], u[2], u[3], u[4], u[5], u[6], u[7],
            u[8], u[9], u[10], u[11], u[12], u[13], u[14], u[15]
        )
    }
}

fn trimmed_str(field: &[u8]) -> Option<&str> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let s = core::str::from_utf8(&field[..end]).ok()?;
    if s.len() > 1 && s.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        Some(s)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_ascii_opencpi() {
        assert_eq!(OCCP_MAGIC, 0x4F70_656E_4350_4900);
    }

    #[test]
    fn endian_fix_reverses_each_dword() {
        let mut raw = [0u8; UUID_SIZE];
        raw[0..4].copy_from_slice(&[0x04, 0x03, 0x02, 0x01]);
        raw[4..8].copy_from_slice(&[b'd', b'c', b'b', b'a']);
        let fixed = fix_endianness(&raw);
        assert_eq!(&fixed[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&fixed[4..8], b"abcd");
    }

    #[test]
    fn swap32_swaps_halves_independently() {
        assert_eq!(swap32(0x0102_0304_0506_0708), 0x0403_0201_0807_0605);
        assert_eq!(swap32(swap32(0xdead_beef_f00d_face)), 0xdead_beef_f00d_face);
    }

    #[test]
    fn uuid_block_parses_fixed_bytes() {
        let mut fixed = [0u8; UUID_SIZE];
        fixed[0..4].copy_from_slice(&7u32.to_le_bytes());
        fixed[20..25].copy_from_slice(b"ml605");
        fixed[36..46].copy_from_slice(b"xc6vlx240t");
        let u = HdlUuid::from_bytes(&fixed);
        assert_eq!(u.birthday, 7);
        assert_eq!(u.platform_str(), Some("ml605"));
        assert_eq!(u.device_str(), Some("xc6vlx240t"));
    }

    #[test]
    fn garbage_platform_name_is_rejected() {
        let mut fixed = [0u8; UUID_SIZE];
        fixed[20] = 0xA0;
        fixed[21] = 0xFF;
        let u = HdlUuid::from_bytes(&fixed);
        assert_eq!(u.platform_str(), None);
    }
}
