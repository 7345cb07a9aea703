//! Local APIC MMIO window forwarded to KVM's in-kernel APIC.
//!
//! The kernel owns the authoritative APIC state.  Every access inside the
//! window fetches the register file with `KVM_GET_LAPIC`; a store then
//! patches one 32-bit slot and pushes the file back with `KVM_SET_LAPIC`.
//! [`LapicState`] is only the scratch copy for that read-modify-write.

use std::os::raw::c_char;

use kvm_bindings::kvm_lapic_state;
use kvm_ioctls::VcpuFd;
use log::debug;
use thiserror::Error;

use crate::verified::lapic::{assemble_le, register_slot, LAPIC_REGISTER_BYTES, LAPIC_REGISTER_SLOTS};

/// Guest physical base of the LAPIC page as seen by the target guest.
pub const LAPIC_MMIO_BASE: u64 = 0xFFE0_0000;

#[derive(Error, Debug)]
pub enum LapicError {
    #[error("Failed to get LAPIC state: {0}")]
    Get(#[source] kvm_ioctls::Error),

    #[error("Failed to set LAPIC state: {0}")]
    Set(#[source] kvm_ioctls::Error),
}

/// The APIC register file as 32-bit slots indexed by `offset / 4`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LapicState {
    regs: [u32; LAPIC_REGISTER_SLOTS],
}

impl Default for LapicState {
    fn default() -> Self {
        Self {
            regs: [0; LAPIC_REGISTER_SLOTS],
        }
    }
}

impl LapicState {
    pub fn get(&self, slot: usize) -> Option<u32> {
        self.regs.get(slot).copied()
    }

    /// Overwrite `slot`.  Out-of-range slots are ignored.
    pub fn set(&mut self, slot: usize, value: u32) {
        if let Some(reg) = self.regs.get_mut(slot) {
            *reg = value;
        }
    }

    pub fn to_kvm(&self) -> kvm_lapic_state {
        let mut raw = kvm_lapic_state {
            regs: [0; LAPIC_REGISTER_BYTES],
        };
        for (chunk, value) in raw.regs.chunks_exact_mut(4).zip(self.regs) {
            for (dst, byte) in chunk.iter_mut().zip(value.to_le_bytes()) {
                *dst = byte as c_char;
            }
        }
        raw
    }
}

impl From<&kvm_lapic_state> for LapicState {
    fn from(raw: &kvm_lapic_state) -> Self {
        let mut state = Self::default();
        for (reg, chunk) in state.regs.iter_mut().zip(raw.regs.chunks_exact(4)) {
            *reg = u32::from_le_bytes([chunk[0] as u8, chunk[1] as u8, chunk[2] as u8, chunk[3] as u8]);
        }
        state
    }
}

/// Access to the kernel-held APIC register file of one vCPU.
pub trait LapicAccess {
    fn get_lapic_state(&self) -> Result<LapicState, LapicError>;
    fn set_lapic_state(&mut self, state: &LapicState) -> Result<(), LapicError>;
}

impl LapicAccess for VcpuFd {
    fn get_lapic_state(&self) -> Result<LapicState, LapicError> {
        self.get_lapic()
            .map(|raw| LapicState::from(&raw))
            .map_err(LapicError::Get)
    }

    fn set_lapic_state(&mut self, state: &LapicState) -> Result<(), LapicError> {
        self.set_lapic(&state.to_kvm()).map_err(LapicError::Set)
    }
}

/// The LAPIC register page at a fixed guest physical address.
#[derive(Clone, Copy, Debug)]
pub struct LapicWindow {
    base: u64,
}

impl Default for LapicWindow {
    fn default() -> Self {
        Self::new(LAPIC_MMIO_BASE)
    }
}

impl LapicWindow {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    /// Register slot addressed by `addr`, if it is inside the window.
    pub fn slot(&self, addr: u64) -> Option<usize> {
        register_slot(self.base, addr)
    }

    /// Store `data` (little-endian, at most four bytes used) into the
    /// register at `addr`.  Returns `false` without touching the kernel if
    /// `addr` is outside the window.
    pub fn write(
        &self,
        lapic: &mut impl LapicAccess,
        addr: u64,
        data: &[u8],
    ) -> Result<bool, LapicError> {
        let Some(slot) = self.slot(addr) else {
            return Ok(false);
        };
        let value = assemble_le(data);

        let mut state = lapic.get_lapic_state()?;
        state.set(slot, value);
        lapic.set_lapic_state(&state)?;

        debug!("LAPIC write {:#x} (slot {:#x}) = {:#x}", addr, slot, value);
        Ok(true)
    }

    /// Load the register at `addr` from the kernel.  Returns `None` if
    /// `addr` is outside the window.
    pub fn read(&self, lapic: &impl LapicAccess, addr: u64) -> Result<Option<u32>, LapicError> {
        let Some(slot) = self.slot(addr) else {
            return Ok(None);
        };
        let state = lapic.get_lapic_state()?;
        Ok(state.get(slot))
    }
}
