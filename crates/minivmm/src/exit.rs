//! Decoding of VM exits from the shared `kvm_run` page.
//!
//! After every `KVM_RUN` the kernel leaves the exit reason and its
//! per-reason payload in the run page, and for port I/O it also places
//! the operand bytes in the same mapping at `io.data_offset`.  Nothing in
//! this module dereferences a raw pointer: the mapping is viewed as a
//! byte slice through [`RunPage`], and every field or operand access is
//! validated against the mapping size by
//! [`crate::verified::run_page::check_access`].
//!
//! Exits are decoded once into a [`VmExit`] and handlers match on the
//! typed transaction rather than re-reading raw fields.
//!
//! # Field offsets
//!
//! The offsets below are fixed by the KVM ABI (`struct kvm_run` in
//! `<linux/kvm.h>`); the tests cross-check them against
//! [`kvm_bindings::kvm_run`].
//!
//! | Field               | Offset | Width |
//! |---------------------|--------|-------|
//! | `exit_reason`       | 8      | 4     |
//! | `io.direction`      | 32     | 1     |
//! | `io.size`           | 33     | 1     |
//! | `io.port`           | 34     | 2     |
//! | `io.count`          | 36     | 4     |
//! | `io.data_offset`    | 40     | 8     |
//! | `mmio.phys_addr`    | 32     | 8     |
//! | `mmio.data`         | 40     | 8     |
//! | `mmio.len`          | 48     | 4     |
//! | `mmio.is_write`     | 52     | 1     |

use kvm_bindings::{
    KVM_EXIT_DEBUG, KVM_EXIT_EXCEPTION, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_HYPERCALL,
    KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_INTR, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT,
    KVM_EXIT_IRQ_WINDOW_OPEN, KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN, KVM_EXIT_SYSTEM_EVENT,
    KVM_EXIT_UNKNOWN,
};
use thiserror::Error;

use crate::verified::run_page::{check_access, operand_offset};

pub const EXIT_REASON_OFFSET: u64 = 8;

const EXIT_PAYLOAD_OFFSET: u64 = 32;

pub const IO_DIRECTION_OFFSET: u64 = EXIT_PAYLOAD_OFFSET;
pub const IO_SIZE_OFFSET: u64 = EXIT_PAYLOAD_OFFSET + 1;
pub const IO_PORT_OFFSET: u64 = EXIT_PAYLOAD_OFFSET + 2;
pub const IO_COUNT_OFFSET: u64 = EXIT_PAYLOAD_OFFSET + 4;
pub const IO_DATA_OFFSET_OFFSET: u64 = EXIT_PAYLOAD_OFFSET + 8;

pub const MMIO_PHYS_ADDR_OFFSET: u64 = EXIT_PAYLOAD_OFFSET;
pub const MMIO_DATA_OFFSET: u64 = EXIT_PAYLOAD_OFFSET + 8;
pub const MMIO_LEN_OFFSET: u64 = EXIT_PAYLOAD_OFFSET + 16;
pub const MMIO_IS_WRITE_OFFSET: u64 = EXIT_PAYLOAD_OFFSET + 20;

/// Capacity of `kvm_run.mmio.data`.
pub const MMIO_DATA_CAPACITY: usize = 8;

/// Errors from reading or writing the run page.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunPageError {
    /// The access does not fit inside the mapping.
    #[error("run page access out of bounds: offset {offset:#x}, len {len}, page size {page_size:#x}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        page_size: usize,
    },

    /// `io.direction` is neither `KVM_EXIT_IO_IN` nor `KVM_EXIT_IO_OUT`.
    #[error("invalid port I/O direction {0}")]
    InvalidDirection(u8),

    /// `io.size` is not 1, 2 or 4.
    #[error("invalid port I/O operand size {0}")]
    InvalidOperandSize(u8),

    /// `mmio.len` exceeds the 8-byte data field.
    #[error("invalid MMIO access length {0}")]
    InvalidMmioLength(u32),
}

// ═══════════════════════════════════════════════════════════════════════
//  RunPage
// ═══════════════════════════════════════════════════════════════════════

/// Bounds-checked byte view of the `kvm_run` mapping.
///
/// ABI metadata fields are read in native byte order with the exact
/// widths the kernel uses.  Operand bytes are returned and stored
/// verbatim; callers decide how to interpret them.
pub struct RunPage<'a> {
    bytes: &'a mut [u8],
}

impl<'a> RunPage<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<&[u8], RunPageError> {
        let range = check_access(self.bytes.len(), offset, len)?;
        Ok(&self.bytes[range])
    }

    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), RunPageError> {
        let range = check_access(self.bytes.len(), offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u8(&self, offset: u64) -> Result<u8, RunPageError> {
        Ok(self.read_array::<1>(offset)?[0])
    }

    pub fn read_u16(&self, offset: u64) -> Result<u16, RunPageError> {
        Ok(u16::from_ne_bytes(self.read_array(offset)?))
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, RunPageError> {
        Ok(u32::from_ne_bytes(self.read_array(offset)?))
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64, RunPageError> {
        Ok(u64::from_ne_bytes(self.read_array(offset)?))
    }

    pub fn write_u8(&mut self, offset: u64, value: u8) -> Result<(), RunPageError> {
        self.write_bytes(offset, &[value])
    }

    fn read_array<const N: usize>(&self, offset: u64) -> Result<[u8; N], RunPageError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(offset, N)?);
        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transactions
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoDirection {
    /// Guest `IN`: the host fills the operand bytes.
    In,
    /// Guest `OUT`: the operand bytes carry the guest's value.
    Out,
}

/// A port I/O exit, possibly a `REP INS`/`REP OUTS` of `count` operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoTransaction {
    pub direction: IoDirection,
    /// Operand width in bytes (1, 2 or 4).
    pub size: u8,
    pub port: u16,
    pub count: u32,
    /// Offset of the first operand from the start of the run page.
    pub data_offset: u64,
}

impl IoTransaction {
    pub fn decode(page: &RunPage<'_>) -> Result<Self, RunPageError> {
        let direction = match page.read_u8(IO_DIRECTION_OFFSET)? {
            d if u32::from(d) == KVM_EXIT_IO_IN => IoDirection::In,
            d if u32::from(d) == KVM_EXIT_IO_OUT => IoDirection::Out,
            d => return Err(RunPageError::InvalidDirection(d)),
        };

        let size = page.read_u8(IO_SIZE_OFFSET)?;
        if !matches!(size, 1 | 2 | 4) {
            return Err(RunPageError::InvalidOperandSize(size));
        }

        Ok(Self {
            direction,
            size,
            port: page.read_u16(IO_PORT_OFFSET)?,
            count: page.read_u32(IO_COUNT_OFFSET)?,
            data_offset: page.read_u64(IO_DATA_OFFSET_OFFSET)?,
        })
    }

    /// Run-page offset of the `index`-th operand.
    ///
    /// Overflow saturates to `u64::MAX`, which no page access accepts.
    pub fn operand_offset(&self, index: u32) -> u64 {
        operand_offset(self.data_offset, self.size, index).unwrap_or(u64::MAX)
    }

    /// Bytes of the `index`-th operand.
    pub fn operand<'p>(&self, page: &'p RunPage<'_>, index: u32) -> Result<&'p [u8], RunPageError> {
        page.read_bytes(self.operand_offset(index), self.size as usize)
    }

    /// Store `data` as the `index`-th operand.  `data` may be shorter than
    /// the operand width.
    pub fn write_operand(
        &self,
        page: &mut RunPage<'_>,
        index: u32,
        data: &[u8],
    ) -> Result<(), RunPageError> {
        debug_assert!(data.len() <= self.size as usize);
        page.write_bytes(self.operand_offset(index), data)
    }
}

/// A guest load or store to an unbacked physical address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioTransaction {
    pub phys_addr: u64,
    pub data: [u8; MMIO_DATA_CAPACITY],
    pub len: u32,
    pub is_write: bool,
}

impl MmioTransaction {
    pub fn decode(page: &RunPage<'_>) -> Result<Self, RunPageError> {
        let len = page.read_u32(MMIO_LEN_OFFSET)?;
        if len as usize > MMIO_DATA_CAPACITY {
            return Err(RunPageError::InvalidMmioLength(len));
        }

        let mut data = [0u8; MMIO_DATA_CAPACITY];
        data.copy_from_slice(page.read_bytes(MMIO_DATA_OFFSET, MMIO_DATA_CAPACITY)?);

        Ok(Self {
            phys_addr: page.read_u64(MMIO_PHYS_ADDR_OFFSET)?,
            data,
            len,
            is_write: page.read_u8(MMIO_IS_WRITE_OFFSET)? != 0,
        })
    }

    /// The bytes actually written by the guest (or requested, for a read).
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Hand the result of an MMIO read back to the kernel.  Bytes beyond
    /// the access length are dropped; missing bytes read as zero.
    pub fn complete_read(&self, page: &mut RunPage<'_>, value: &[u8]) -> Result<(), RunPageError> {
        let mut data = [0u8; MMIO_DATA_CAPACITY];
        let n = value.len().min(self.len as usize);
        data[..n].copy_from_slice(&value[..n]);
        page.write_bytes(MMIO_DATA_OFFSET, &data[..self.len as usize])
    }
}

/// The decoded reason for the most recent return from `KVM_RUN`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmExit {
    Io(IoTransaction),
    Mmio(MmioTransaction),
    Hlt,
    /// Any exit reason this monitor does not emulate, with its raw code.
    Unhandled(u32),
}

impl VmExit {
    pub fn decode(page: &RunPage<'_>) -> Result<Self, RunPageError> {
        match page.read_u32(EXIT_REASON_OFFSET)? {
            KVM_EXIT_IO => IoTransaction::decode(page).map(VmExit::Io),
            KVM_EXIT_MMIO => MmioTransaction::decode(page).map(VmExit::Mmio),
            KVM_EXIT_HLT => Ok(VmExit::Hlt),
            reason => Ok(VmExit::Unhandled(reason)),
        }
    }
}

/// Human-readable name of a raw `KVM_EXIT_*` code, for diagnostics.
pub fn exit_reason_name(reason: u32) -> &'static str {
    match reason {
        KVM_EXIT_UNKNOWN => "UNKNOWN",
        KVM_EXIT_EXCEPTION => "EXCEPTION",
        KVM_EXIT_IO => "IO",
        KVM_EXIT_HYPERCALL => "HYPERCALL",
        KVM_EXIT_DEBUG => "DEBUG",
        KVM_EXIT_HLT => "HLT",
        KVM_EXIT_MMIO => "MMIO",
        KVM_EXIT_IRQ_WINDOW_OPEN => "IRQ_WINDOW_OPEN",
        KVM_EXIT_SHUTDOWN => "SHUTDOWN",
        KVM_EXIT_FAIL_ENTRY => "FAIL_ENTRY",
        KVM_EXIT_INTR => "INTR",
        KVM_EXIT_INTERNAL_ERROR => "INTERNAL_ERROR",
        KVM_EXIT_SYSTEM_EVENT => "SYSTEM_EVENT",
        _ => "unrecognized",
    }
}
