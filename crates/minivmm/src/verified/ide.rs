//! Pure, verifiable functions for the IDE disk controller.
//!
//! | Verified function      | Used by                               |
//! |------------------------|---------------------------------------|
//! | [`lba28`]              | `IdeDisk` READ SECTOR command         |
//! | [`sector_offset`]      | `IdeDisk` READ SECTOR command         |
//! | [`check_read`]         | `IdeDisk::read_data()`                |

use crate::devices::ide::DiskError;

/// Bytes per sector.
pub const SECTOR_SIZE: u64 = 512;

/// Mask for the LBA bits carried in the low nibble of the drive/head register.
pub const DRIVE_HEAD_LBA_MASK: u8 = 0x0F;

/// Largest address representable in 28-bit LBA mode.
pub const LBA28_MAX: u32 = 0x0FFF_FFFF;

// ─── Addressing ─────────────────────────────────────────────────────

/// Pack the four task-file address registers into a 28-bit LBA.
///
/// `lba = low | mid << 8 | high << 16 | (drive_head & 0xF) << 24`.
/// The drive-select and mode bits in the upper nibble of `drive_head`
/// do not contribute to the address.
///
/// # Properties
///
/// - The result never exceeds [`LBA28_MAX`].
/// - Each register contributes to exactly one byte lane.
pub fn lba28(low: u8, mid: u8, high: u8, drive_head: u8) -> u32 {
    let lba = u32::from(low)
        | (u32::from(mid) << 8)
        | (u32::from(high) << 16)
        | (u32::from(drive_head & DRIVE_HEAD_LBA_MASK) << 24);

    debug_assert!(lba <= LBA28_MAX, "lba28: result must fit in 28 bits");
    debug_assert_eq!((lba & 0xFF) as u8, low);

    lba
}

/// Byte offset of the first byte of sector `lba` in a flat image.
///
/// Computed in `u64`, so it cannot overflow for any 28-bit LBA.
pub fn sector_offset(lba: u32) -> u64 {
    let offset = u64::from(lba) * SECTOR_SIZE;

    debug_assert!(offset % SECTOR_SIZE == 0);

    offset
}

// ─── Bounds checking ────────────────────────────────────────────────

/// Check that `[offset, offset+len)` lies within an image of `image_size`
/// bytes.
///
/// Uses saturating addition so that a cursor near `u64::MAX` is rejected
/// rather than wrapping into range.
pub fn check_read(image_size: u64, offset: u64, len: u64) -> Result<(), DiskError> {
    if offset.saturating_add(len) > image_size {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            image_size,
        });
    }

    debug_assert!(offset + len <= image_size);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── lba28 ────────────────────────────────────────────────────

    #[test]
    fn lba_zero() {
        assert_eq!(lba28(0, 0, 0, 0), 0);
    }

    #[test]
    fn lba_byte_lanes() {
        assert_eq!(lba28(0x01, 0, 0, 0), 0x0000_0001);
        assert_eq!(lba28(0, 0x01, 0, 0), 0x0000_0100);
        assert_eq!(lba28(0, 0, 0x01, 0), 0x0001_0000);
        assert_eq!(lba28(0, 0, 0, 0x01), 0x0100_0000);
    }

    #[test]
    fn lba_ignores_drive_select_bits() {
        // 0xE0 = LBA mode + drive 0, 0xF0 = LBA mode + drive 1.
        assert_eq!(lba28(0x12, 0x34, 0x56, 0xE7), 0x0756_3412);
        assert_eq!(lba28(0x12, 0x34, 0x56, 0xF7), 0x0756_3412);
    }

    #[test]
    fn lba_max() {
        assert_eq!(lba28(0xFF, 0xFF, 0xFF, 0xFF), LBA28_MAX);
    }

    // ── sector_offset ────────────────────────────────────────────

    #[test]
    fn sector_offsets() {
        assert_eq!(sector_offset(0), 0);
        assert_eq!(sector_offset(1), 512);
        assert_eq!(sector_offset(LBA28_MAX), u64::from(LBA28_MAX) * 512);
    }

    // ── check_read ───────────────────────────────────────────────

    #[test]
    fn read_exact_fit() {
        assert!(check_read(1024, 0, 1024).is_ok());
        assert!(check_read(1024, 1020, 4).is_ok());
        assert!(check_read(1024, 1024, 0).is_ok());
    }

    #[test]
    fn read_past_end() {
        let err = check_read(1024, 1022, 4).unwrap_err();
        assert!(matches!(
            err,
            DiskError::OutOfBounds {
                offset: 1022,
                len: 4,
                image_size: 1024
            }
        ));
    }

    #[test]
    fn read_overflow_saturates() {
        assert!(check_read(1024, u64::MAX, 4).is_err());
    }
}
