//! PCI discovery driver.
//!
//! Scans `/sys/bus/pci/devices`, validates candidates by vendor/device/
//! class IDs and BAR geometry, and maps the two BARs of each match. One
//! bad candidate never aborts a search; named opens fail loudly.

use crate::access::Access;
use crate::device::Device;
use crate::error::{HdlError, Result};
use crate::mmio::MappedRegion;
use occp_chip::pci::{self, Bar};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SYS_PCI: &str = "/sys/bus/pci/devices";

// sysfs resource flag bits (include/linux/ioport.h)
const IORESOURCE_IO: u64 = 0x100;
const IORESOURCE_PREFETCH: u64 = 0x2000;
const IORESOURCE_MEM_64: u64 = 0x0010_0000;

/// Host memory reserved for DMA, described by `OCPI_DMA_MEMORY` as
/// `<megabytes>M$0x<hexbase>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMemory {
    /// Physical base, page aligned.
    pub base: u64,
    /// Usable bytes.
    pub size: u64,
}

impl DmaMemory {
    /// Parse the `OCPI_DMA_MEMORY` environment variable.
    ///
    /// # Errors
    ///
    /// `Discovery` when the variable is present but malformed; `Ok(None)`
    /// when it is absent.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(raw) = std::env::var_os("OCPI_DMA_MEMORY") else {
            return Ok(None);
        };
        let raw = raw.to_string_lossy();
        Self::parse(&raw).map(Some)
    }

    fn parse(raw: &str) -> Result<Self> {
        let err = || HdlError::discovery(format!("bad OCPI_DMA_MEMORY format: '{raw}'"));
        let (mb, base) = raw.split_once("M$0x").ok_or_else(err)?;
        let mb: u64 = mb.parse().map_err(|_| err())?;
        let mut base = u64::from_str_radix(base, 16).map_err(|_| err())?;
        let mut size = mb * 1024 * 1024;
        let page = 4096;
        if base & (page - 1) != 0 {
            let aligned = (base + page - 1) & !(page - 1);
            size -= aligned - base;
            base = aligned;
            tracing::debug!("DMA memory was not page aligned; now {size} at {base:#x}");
        }
        Ok(Self { base, size })
    }
}

/// PCI discovery driver.
#[derive(Debug, Default)]
pub struct PciDriver {
    sys_path: PathBuf,
}

impl PciDriver {
    /// A driver scanning the real sysfs tree.
    pub fn new() -> Self {
        Self { sys_path: PathBuf::from(SYS_PCI) }
    }

    /// A driver scanning an alternate tree (tests, chroots).
    pub fn with_sys_path(path: impl Into<PathBuf>) -> Self {
        Self { sys_path: path.into() }
    }

    /// Scan all candidates, handing validated devices to `found`.
    /// Per-candidate failures are logged and skipped; returns the count
    /// of devices found.
    pub fn search(&mut self, exclude: &[&str], found: &mut dyn FnMut(Device)) -> usize {
        tracing::info!("searching for PCI-based HDL devices");
        let entries = match std::fs::read_dir(&self.sys_path) {
            Ok(e) => e,
            Err(e) => {
                tracing::info!("can't open {} for PCI search: {e}", self.sys_path.display());
                return 0;
            }
        };
        let mut count = 0;
        for entry in entries.flatten() {
            let bdf = entry.file_name().to_string_lossy().to_string();
            if bdf.starts_with('.') {
                continue;
            }
            let name = format!("PCI:{bdf}");
            if exclude.contains(&name.as_str()) {
                tracing::info!("PCI device {name} specifically excluded, ignored");
                continue;
            }
            match self.try_candidate(&bdf) {
                Ok(Some(dev)) => {
                    found(dev);
                    count += 1;
                }
                Ok(None) => {} // not ours
                Err(e) => {
                    tracing::info!("when searching PCI device '{bdf}': {e}");
                }
            }
        }
        count
    }

    /// Open a named device: a full BDF or a bare bus number.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` with the disqualifying reason; any error here is
    /// fatal to the open, unlike during a search.
    pub fn open(&mut self, name: &str) -> Result<Device> {
        let bdf = if name.chars().all(|c| c.is_ascii_digit()) {
            format!("0000:{:02x}:00.0", name.parse::<u8>().unwrap_or(0))
        } else {
            name.to_string()
        };
        match self.try_candidate(&bdf) {
            Ok(Some(dev)) => Ok(dev),
            Ok(None) => Err(HdlError::device_not_found(
                name,
                "vendor/device/class IDs do not match an HDL device",
            )),
            Err(e) => Err(HdlError::device_not_found(name, e.to_string())),
        }
    }

    /// Validate one sysfs candidate; `Ok(None)` means "not an HDL
    /// device", distinct from a matching device that fails validation.
    fn try_candidate(&self, bdf: &str) -> Result<Option<Device>> {
        let dir = self.sys_path.join(bdf);
        let vendor = read_hex(&dir.join("vendor"))? as u16;
        let device_id = read_hex(&dir.join("device"))? as u16;
        let class = read_hex(&dir.join("class"))?;
        let (class, subclass) = ((class >> 16) as u8, (class >> 8) as u8);

        let ours = (vendor == pci::VENDOR_ID
            && class == pci::CLASS
            && subclass == pci::SUBCLASS)
            || (vendor == pci::legacy::VENDOR_ID && device_id == pci::legacy::DEVICE_ID);
        if !ours {
            return Ok(None);
        }

        let bars = read_bars(&dir.join("resource"))?;
        Bar::validate_pair(&bars).map_err(|why| {
            HdlError::discovery(format!(
                "found PCI device with good vendor/device/class, but {why}; skipping it"
            ))
        })?;

        let bar0 = Arc::new(MappedRegion::map(
            &dir.join("resource0"),
            bars[0].size as usize,
            bars[0].address,
        )?);
        let bar1 = Arc::new(MappedRegion::map(
            &dir.join("resource1"),
            bars[1].size as usize,
            bars[1].address,
        )?);

        // The endpoint spans both BARs; the gap between them is a hole
        // the peer must not address.
        let (lo, hi) = if bars[0].address < bars[1].address {
            (&bars[0], &bars[1])
        } else {
            (&bars[1], &bars[0])
        };
        let endpoint_addr = lo.address;
        let endpoint_size = hi.address + hi.size - endpoint_addr;
        let hole_start = lo.size;
        let hole_end = hi.address - endpoint_addr;
        let specifier = format!("ocpi-dma-pio:{endpoint_addr:#x}.{hole_start:#x}.{hole_end:#x}");

        let mut dev = Device::new(
            format!("PCI:{bdf}"),
            "ocpi-dma-pio",
            Access::direct(bar0, 0),
            Access::direct(bar1, 0),
            specifier,
            endpoint_size,
            endpoint_addr,
        );
        dev.init()?;
        Ok(Some(dev))
    }
}

fn read_hex(path: &Path) -> Result<u64> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| HdlError::sysfs(path, e.to_string()))?;
    let t = content.trim().trim_start_matches("0x");
    u64::from_str_radix(t, 16).map_err(|e| HdlError::sysfs(path, format!("invalid hex: {e}")))
}

/// Parse the sysfs `resource` file: one `start end flags` line per BAR
/// slot, zeros meaning the slot is unimplemented.
fn read_bars(path: &Path) -> Result<Vec<Bar>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| HdlError::sysfs(path, e.to_string()))?;
    let mut bars = Vec::new();
    for (slot, line) in content.lines().take(pci::N_BARS + 1).enumerate() {
        let mut fields = line.split_whitespace().map(|f| {
            u64::from_str_radix(f.trim_start_matches("0x"), 16)
                .map_err(|e| HdlError::sysfs(path, format!("invalid resource line: {e}")))
        });
        let (Some(start), Some(end), Some(flags)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let (start, end, flags) = (start?, end?, flags?);
        if start == 0 && end == 0 {
            continue;
        }
        if slot >= pci::N_BARS {
            return Err(HdlError::discovery("more than two BARs present".to_string()));
        }
        bars.push(Bar {
            address: start,
            size: end - start + 1,
            io: flags & IORESOURCE_IO != 0,
            prefetch: flags & IORESOURCE_PREFETCH != 0,
            is_64: flags & IORESOURCE_MEM_64 != 0,
        });
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn dma_memory_parses_and_aligns() {
        let m = DmaMemory::parse("128M$0x80000000").expect("parse");
        assert_eq!(m.base, 0x8000_0000);
        assert_eq!(m.size, 128 * 1024 * 1024);

        let m = DmaMemory::parse("1M$0x80000100").expect("parse");
        assert_eq!(m.base, 0x8000_1000);
        assert_eq!(m.size, 1024 * 1024 - 0xf00);

        assert!(DmaMemory::parse("garbage").is_err());
        assert!(DmaMemory::parse("12Mx0x100").is_err());
    }

    #[test]
    fn resource_parsing_validates_geometry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("resource");
        let mut f = std::fs::File::create(&path).expect("create");
        writeln!(f, "0xf7800000 0xf78fffff 0x40200").expect("w");
        writeln!(f, "0xf0000000 0xf03fffff 0x40200").expect("w");
        writeln!(f, "0x00000000 0x00000000 0x0").expect("w");
        drop(f);
        let bars = read_bars(&path).expect("bars");
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].size, occp_chip::OCCP_SPACE_SIZE);
        assert!(!bars[0].io && !bars[0].prefetch && !bars[0].is_64);
        assert!(Bar::validate_pair(&bars).is_ok());
    }

    #[test]
    fn io_bars_are_flagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("resource");
        std::fs::write(&path, "0xe000 0xe0ff 0x40101\n0xf0000000 0xf00fffff 0x40200\n")
            .expect("write");
        let bars = read_bars(&path).expect("bars");
        assert!(bars[0].io);
        assert!(Bar::validate_pair(&bars).is_err());
    }

    #[test]
    fn search_of_empty_tree_finds_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut driver = PciDriver::with_sys_path(dir.path());
        let mut n = 0;
        let count = driver.search(&[], &mut |_d| n += 1);
        assert_eq!(count, 0);
        assert_eq!(n, 0);
    }
}
