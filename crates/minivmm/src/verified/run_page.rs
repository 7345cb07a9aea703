//! Pure bounds checks for accesses into the shared `kvm_run` mapping.
//!
//! Offsets into the run page come from the kernel (`io.data_offset`) and
//! are advanced by guest-controlled repeat counts, so every access is
//! validated against the mapping size before a byte is touched.

use std::ops::Range;

use crate::exit::RunPageError;

/// Validate a `len`-byte access at `offset` in a page of `page_size` bytes
/// and return the corresponding index range.
///
/// # Properties
///
/// - `Ok(r)` implies `r.end <= page_size` and `r.len() == len`.
/// - Offsets that do not fit in `usize`, or whose end overflows, are
///   rejected rather than wrapped.
pub fn check_access(page_size: usize, offset: u64, len: usize) -> Result<Range<usize>, RunPageError> {
    let out_of_bounds = || RunPageError::OutOfBounds {
        offset,
        len,
        page_size,
    };

    let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
    if end > page_size {
        return Err(out_of_bounds());
    }

    debug_assert!(end <= page_size && end - start == len);

    Ok(start..end)
}

/// Offset of the `index`-th operand of a repeated port I/O transaction.
///
/// Returns `None` on overflow; the caller turns that into an
/// out-of-bounds error on the subsequent access.
pub fn operand_offset(data_offset: u64, operand_size: u8, index: u32) -> Option<u64> {
    u64::from(index)
        .checked_mul(u64::from(operand_size))
        .and_then(|step| data_offset.checked_add(step))
}
