//! VM handle: `/dev/kvm`, the VM file descriptor, chipset and guest RAM.

use std::path::PathBuf;

use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, KVM_PIT_SPEAKER_DUMMY};
use kvm_ioctls::{Kvm, VmFd};
use log::info;
use thiserror::Error;

use crate::memory::{GuestMemoryManager, MemoryError, BOOT_SECTOR_START};
use crate::vcpu::Vcpu;

/// Default guest RAM: 2 GiB.
pub const DEFAULT_MEMORY_SIZE: usize = 0x8000_0000;

/// Default TSS location: three pages high in the 32-bit hole, clear of
/// guest RAM and the LAPIC page.
pub const DEFAULT_TSS_ADDRESS: usize = 0xfffb_d000;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("Failed to open /dev/kvm: {0}")]
    KvmCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("Failed to create in-kernel IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("Failed to create PIT: {0}")]
    CreatePit(#[source] kvm_ioctls::Error),

    #[error("Failed to set user memory region: {0}")]
    SetUserMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("Guest memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Failed to create vCPU: {0}")]
    VcpuCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to query vCPU mmap size: {0}")]
    VcpuMmapSize(#[source] kvm_ioctls::Error),

    #[error("KVM reported an invalid vCPU mmap size of {0} bytes")]
    InvalidMmapSize(usize),

    #[error("Failed to map the vCPU run page: {0}")]
    MapRunPage(#[source] std::io::Error),

    #[error("Failed to get vCPU special registers: {0}")]
    GetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU special registers: {0}")]
    SetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to get vCPU registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to run vCPU: {0}")]
    VcpuRun(#[source] kvm_ioctls::Error),
}

/// Fixed configuration of one monitor instance.
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Guest RAM size in bytes (page-aligned).
    pub memory_size: usize,
    /// Guest physical address of the first byte of RAM.
    pub memory_base: u64,
    /// Initial instruction pointer.
    pub entry_point: u64,
    /// Where the boot sector is copied before the first run.
    pub boot_sector_address: u64,
    /// `KVM_SET_TSS_ADDR` argument; `None` skips the call.
    pub tss_address: Option<usize>,
    pub boot_sector_path: PathBuf,
    pub disk_image_path: PathBuf,
    /// File receiving the UART byte stream (created or appended to).
    pub serial_output_path: PathBuf,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            memory_base: 0,
            entry_point: BOOT_SECTOR_START,
            boot_sector_address: BOOT_SECTOR_START,
            tss_address: Some(DEFAULT_TSS_ADDRESS),
            boot_sector_path: PathBuf::from("../xv6/bootblock"),
            disk_image_path: PathBuf::from("../xv6/xv6.img"),
            serial_output_path: PathBuf::from("out.txt"),
        }
    }
}

/// An open VM with its chipset created and RAM registered.
///
/// Construction performs every VM-level setup step in the order KVM
/// requires: TSS address and IRQ chip before any vCPU exists, and guest
/// RAM registered exactly once as slot 0.
pub struct VmHandle {
    kvm: Kvm,
    fd: VmFd,
    memory: GuestMemoryManager,
}

impl VmHandle {
    pub fn new(config: &VmConfig) -> Result<Self, VmError> {
        let kvm = Kvm::new().map_err(VmError::KvmCreate)?;
        let fd = kvm.create_vm().map_err(VmError::VmCreate)?;

        // TSS address MUST be set before create_irq_chip on x86_64.
        if let Some(tss) = config.tss_address {
            fd.set_tss_address(tss).map_err(VmError::SetTssAddress)?;
        }

        // In-kernel PIC, IOAPIC and LAPIC. MUST precede create_vcpu.
        fd.create_irq_chip().map_err(VmError::CreateIrqChip)?;

        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        fd.create_pit2(pit_config).map_err(VmError::CreatePit)?;

        let memory = GuestMemoryManager::new(config.memory_base, config.memory_size)?;
        register_memory_region(&fd, &memory)?;

        info!(
            "VM created: {} MB RAM at {:#x}, irqchip + PIT",
            config.memory_size / (1024 * 1024),
            config.memory_base,
        );

        Ok(Self { kvm, fd, memory })
    }

    pub fn memory(&self) -> &GuestMemoryManager {
        &self.memory
    }

    /// Create vCPU 0 and map its run page.
    pub fn create_vcpu(&self) -> Result<Vcpu, VmError> {
        Vcpu::new(&self.kvm, &self.fd)
    }
}

/// Register `memory` as slot 0, read/write/execute, at its guest base.
fn register_memory_region(fd: &VmFd, memory: &GuestMemoryManager) -> Result<(), VmError> {
    let region = kvm_userspace_memory_region {
        slot: 0,
        flags: 0,
        guest_phys_addr: memory.base(),
        memory_size: memory.size() as u64,
        userspace_addr: memory.host_address()?,
    };

    // SAFETY: `region` describes the mmap owned by `memory`, which lives
    // inside the same `VmHandle` as `fd` and is therefore never unmapped
    // while the VM can access it.
    unsafe {
        fd.set_user_memory_region(region)
            .map_err(VmError::SetUserMemoryRegion)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_boots_from_boot_sector() {
        let config = VmConfig::default();
        assert_eq!(config.entry_point, 0x7c00);
        assert_eq!(config.boot_sector_address, config.entry_point);
        assert_eq!(config.memory_base, 0);
        assert_eq!(config.memory_size, 0x8000_0000);
        assert_eq!(config.memory_size % crate::memory::PAGE_SIZE, 0);
    }

    #[test]
    fn tss_clear_of_ram_and_lapic() {
        let config = VmConfig::default();
        let tss = config.tss_address.unwrap() as u64;
        assert!(tss >= config.memory_base + config.memory_size as u64);
        // KVM uses three pages for the TSS.
        let lapic = crate::devices::lapic::LAPIC_MMIO_BASE;
        assert!(tss >= lapic + 0x1000 || tss + 3 * 0x1000 <= lapic);
    }
}
