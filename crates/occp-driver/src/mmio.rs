//! Memory-mapped register regions.
//!
//! Maps PCI BAR resource files into the process and provides volatile
//! typed accessors. Volatile is load-bearing: register reads have side
//! effects (control-op triggers) and the compiler must not elide or
//! reorder them.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe.
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{HdlError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::File;
use std::os::unix::io::AsFd;
use std::path::Path;

/// One mapped BAR region.
pub struct MappedRegion {
    ptr: *mut u8,
    size: usize,
    /// Bus address of the region, for building RDMA descriptors.
    bus_addr: u64,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .finish()
    }
}

// SAFETY: Send - the region owns its mapping exclusively; mmap'd memory is
// process-wide and carries no thread-local state.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - all accessors are volatile and bounds-checked. Concurrent
// access to overlapping registers needs external serialization, which the
// ownership model (one Access window per worker/port) provides.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `size` bytes of a BAR resource file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped.
    pub fn map(path: &Path, size: usize, bus_addr: u64) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path).map_err(|e| {
            HdlError::sysfs(path, format!("cannot open for mmap: {e}"))
        })?;
        Self::map_file(&file, size, bus_addr)
    }

    /// Map `size` bytes of an already-open file at offset 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping fails.
    pub fn map_file(file: &File, size: usize, bus_addr: u64) -> Result<Self> {
        // SAFETY: mapping a file the kernel exposes for exactly this purpose.
        // On success ptr is valid for `size` bytes until munmap in Drop.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
            .map_err(|e| HdlError::discovery(format!("mmap of BAR failed: {e}")))?
        };
        tracing::debug!("mapped BAR at {:p}, size {:#x}, bus {:#x}", ptr, size, bus_addr);
        Ok(Self { ptr: ptr.cast(), size, bus_addr })
    }

    /// Region size in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Bus address of the start of the region.
    pub const fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    fn check(&self, offset: usize, bytes: usize) {
        assert!(offset + bytes <= self.size, "register offset out of bounds");
    }

    /// Volatile 8-bit read.
    pub fn read8(&self, offset: usize) -> u8 {
        self.check(offset, 1);
        // SAFETY: ptr valid for self.size, offset bounds-checked above.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset)) }
    }

    /// Volatile 16-bit read.
    pub fn read16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        // SAFETY: as read8; hardware guarantees natural alignment.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u16>()) }
    }

    /// Volatile 32-bit read.
    pub fn read32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        // SAFETY: as read8; hardware guarantees natural alignment.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) }
    }

    /// Volatile 64-bit read.
    pub fn read64(&self, offset: usize) -> u64 {
        self.check(offset, 8);
        // SAFETY: as read8; hardware guarantees natural alignment.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u64>()) }
    }

    /// Volatile 8-bit write.
    pub fn write8(&self, offset: usize, value: u8) {
        self.check(offset, 1);
        // SAFETY: as read8.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset), value) }
    }

    /// Volatile 16-bit write.
    pub fn write16(&self, offset: usize, value: u16) {
        self.check(offset, 2);
        // SAFETY: as read8; hardware guarantees natural alignment.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset).cast::<u16>(), value) }
    }

    /// Volatile 32-bit write.
    pub fn write32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        // SAFETY: as read8; hardware guarantees natural alignment.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value) }
    }

    /// Volatile 64-bit write.
    pub fn write64(&self, offset: usize, value: u64) {
        self.check(offset, 8);
        // SAFETY: as read8; hardware guarantees natural alignment.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset).cast::<u64>(), value) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly what mmap returned; Drop runs once.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("unmapped BAR at bus {:#x}", self.bus_addr);
    }
}
