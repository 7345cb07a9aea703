//! Guest physical memory for the minivmm monitor.
//!
//! The guest gets a single contiguous RAM region, allocated as one
//! anonymous page-aligned `mmap` through [`vm_memory::GuestMemoryMmap`]
//! and registered with KVM as slot 0.  Every host-side access goes
//! through the `vm-memory` [`Bytes`] API, which rejects any range that is
//! not fully backed by the region.
//!
//! # Guest Physical Memory Layout (real mode)
//!
//! ```text
//! 0x0000_0000  ┌───────────────────────────┐
//!              │  Real-mode IVT / BDA       │
//! 0x0000_7C00  ├───────────────────────────┤  ← BOOT_SECTOR_START (entry)
//!              │  Boot sector (512 bytes)   │
//! 0x0000_7E00  ├───────────────────────────┤
//!              │  Kernel, loaded by the     │
//!              │  boot sector over IDE      │
//!              │  ...                       │
//!              └───────────────────────────┘
//! ```

use log::info;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

/// Conventional BIOS load address of the boot sector, and the guest's
/// first instruction.
pub const BOOT_SECTOR_START: u64 = 0x7c00;

/// Alignment of the host allocation backing guest RAM.
pub const PAGE_SIZE: usize = 0x1000;

/// Errors that can occur during guest memory operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The `vm-memory` crate failed to create the guest memory region.
    #[error("Failed to create guest memory region of {size} bytes at {base:#x}")]
    Create { base: u64, size: usize },

    /// The region size is zero or not a multiple of [`PAGE_SIZE`].
    #[error("Guest memory size {size:#x} is not a positive multiple of the page size")]
    UnalignedSize { size: usize },

    /// A write to guest physical memory failed.
    #[error("Failed to write {len} bytes to guest memory at {address:#x}")]
    Write { address: u64, len: usize },

    /// A read from guest physical memory failed.
    #[error("Failed to read {len} bytes from guest memory at {address:#x}")]
    Read { address: u64, len: usize },

    /// The host virtual address for the guest memory could not be resolved.
    #[error("Failed to resolve host virtual address for guest memory")]
    HostAddress,
}

/// Owns the guest RAM region.
///
/// The backing `mmap` uses interior mutability, so reads and writes take
/// `&self`, matching the `vm-memory` API.
pub struct GuestMemoryManager {
    memory: GuestMemoryMmap,
    base: u64,
    size: usize,
}

impl GuestMemoryManager {
    /// Allocate `size` bytes of zeroed guest RAM mapped at guest physical
    /// address `base`.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::UnalignedSize`] if `size` is zero or not page-aligned.
    /// - [`MemoryError::Create`] if the underlying `mmap` fails.
    pub fn new(base: u64, size: usize) -> Result<Self, MemoryError> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(MemoryError::UnalignedSize { size });
        }

        let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(base), size)])
            .map_err(|_| MemoryError::Create { base, size })?;

        info!(
            "Guest memory created: {} MB at {:#x}",
            size / (1024 * 1024),
            base,
        );

        Ok(Self { memory, base, size })
    }

    /// Copy `data` into guest memory at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Write`] if any byte of the range is outside
    /// guest RAM; nothing is written in that case.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.check_range(address, data.len())
            .ok_or(MemoryError::Write {
                address,
                len: data.len(),
            })?;
        self.memory
            .write_slice(data, GuestAddress(address))
            .map_err(|_| MemoryError::Write {
                address,
                len: data.len(),
            })
    }

    /// Fill `buf` from guest memory at `address`.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let len = buf.len();
        self.check_range(address, len)
            .ok_or(MemoryError::Read { address, len })?;
        self.memory
            .read_slice(buf, GuestAddress(address))
            .map_err(|_| MemoryError::Read { address, len })
    }

    /// Place a raw image (e.g. the boot sector) at `address`.
    pub fn load_image(&self, address: u64, image: &[u8]) -> Result<(), MemoryError> {
        self.write(address, image)?;
        info!("Loaded {} bytes at {:#x}", image.len(), address);
        Ok(())
    }

    /// Host virtual address of the start of guest RAM, for
    /// `kvm_userspace_memory_region.userspace_addr`.
    pub fn host_address(&self) -> Result<u64, MemoryError> {
        self.memory
            .get_host_address(GuestAddress(self.base))
            .map(|ptr| ptr as u64)
            .map_err(|_| MemoryError::HostAddress)
    }

    /// Guest physical address of the first byte of RAM.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Total size of the guest memory in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// `Some(())` if `[address, address + len)` lies inside guest RAM.
    fn check_range(&self, address: u64, len: usize) -> Option<()> {
        let offset = address.checked_sub(self.base)?;
        let end = offset.checked_add(len as u64)?;
        (end <= self.size as u64).then_some(())
    }
}
