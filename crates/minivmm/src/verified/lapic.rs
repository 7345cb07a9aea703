//! Pure functions for decoding accesses to the local APIC MMIO window.

/// Size of the LAPIC MMIO page.
pub const LAPIC_PAGE_SIZE: u64 = 0x1000;

/// Size of the register file KVM exchanges through `KVM_GET_LAPIC`.
pub const LAPIC_REGISTER_BYTES: usize = 0x400;

/// Number of 32-bit slots in the register file.
pub const LAPIC_REGISTER_SLOTS: usize = LAPIC_REGISTER_BYTES / 4;

/// Map a guest physical address to a 32-bit register slot.
///
/// Returns `None` if `addr` lies outside `[base, base + LAPIC_PAGE_SIZE)`
/// or if the slot falls beyond the kernel's register file.
///
/// # Properties
///
/// - `Some(i)` implies `i < LAPIC_REGISTER_SLOTS`.
/// - `Some(i)` implies `i == (addr - base) / 4`.
pub fn register_slot(base: u64, addr: u64) -> Option<usize> {
    let offset = addr.checked_sub(base)?;
    if offset >= LAPIC_PAGE_SIZE {
        return None;
    }

    let slot = (offset / 4) as usize;
    if slot >= LAPIC_REGISTER_SLOTS {
        return None;
    }

    debug_assert!(slot < LAPIC_REGISTER_SLOTS);

    Some(slot)
}

/// Assemble up to four bytes of MMIO data into a little-endian `u32`.
///
/// Missing high bytes read as zero; bytes past the fourth are ignored.
pub fn assemble_le(data: &[u8]) -> u32 {
    data.iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, byte)| acc | (u32::from(*byte) << (8 * i)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0xFFE0_0000;

    #[test]
    fn slot_of_base() {
        assert_eq!(register_slot(BASE, BASE), Some(0));
    }

    #[test]
    fn slot_of_common_registers() {
        // ID, TPR, EOI, SVR.
        assert_eq!(register_slot(BASE, BASE + 0x20), Some(0x08));
        assert_eq!(register_slot(BASE, BASE + 0x80), Some(0x20));
        assert_eq!(register_slot(BASE, BASE + 0xB0), Some(0x2C));
        assert_eq!(register_slot(BASE, BASE + 0xF0), Some(0x3C));
    }

    #[test]
    fn slot_unaligned_rounds_down() {
        assert_eq!(register_slot(BASE, BASE + 0x23), Some(0x08));
    }

    #[test]
    fn outside_window() {
        assert_eq!(register_slot(BASE, BASE - 4), None);
        assert_eq!(register_slot(BASE, BASE + LAPIC_PAGE_SIZE), None);
        assert_eq!(register_slot(BASE, 0), None);
    }

    #[test]
    fn beyond_register_file() {
        assert_eq!(register_slot(BASE, BASE + 0x3FC), Some(0xFF));
        assert_eq!(register_slot(BASE, BASE + 0x400), None);
        assert_eq!(register_slot(BASE, BASE + 0xFFC), None);
    }

    #[test]
    fn assemble_little_endian() {
        assert_eq!(assemble_le(&[0x78, 0x56, 0x34, 0x12]), 0x1234_5678);
        assert_eq!(assemble_le(&[0xFF]), 0xFF);
        assert_eq!(assemble_le(&[1, 2, 3, 4, 5, 6, 7, 8]), 0x0403_0201);
        assert_eq!(assemble_le(&[]), 0);
    }
}
