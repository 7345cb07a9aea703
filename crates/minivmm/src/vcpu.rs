//! vCPU controller: creation, run-page mapping, register setup and `KVM_RUN`.
//!
//! The run page is mapped a second time by this process (in addition to
//! the mapping `kvm-ioctls` keeps internally) so that exits can be decoded
//! through the bounds-checked [`RunPage`] view instead of the borrowed
//! `VcpuExit` slices.  Both mappings are `MAP_SHARED` views of the same
//! kernel pages.

use std::io;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use log::info;

use crate::exit::RunPage;
use crate::vm::VmError;

/// Bit 1 of RFLAGS is reserved and must be set.
pub const RFLAGS_RESERVED: u64 = 0x2;

/// A shared, read/write mapping of a vCPU's `kvm_run` area.
pub struct RunMapping {
    addr: NonNull<u8>,
    size: usize,
}

impl RunMapping {
    /// Map `size` bytes of the vCPU file descriptor at offset 0.
    pub fn new(fd: &impl AsRawFd, size: usize) -> Result<Self, VmError> {
        if size == 0 {
            return Err(VmError::InvalidMmapSize(size));
        }

        // SAFETY: mapping a fresh region chosen by the kernel; the result
        // is checked before use and only unmapped in `drop`.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(VmError::MapRunPage(io::Error::last_os_error()));
        }
        let addr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| VmError::MapRunPage(io::Error::other("mmap returned NULL")))?;

        Ok(Self { addr, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte view of the whole mapping.
    ///
    /// Takes `&mut self` so at most one view exists at a time; the kernel
    /// only writes the page while the vCPU is inside `KVM_RUN`, which also
    /// needs `&mut` access to the owning [`Vcpu`].
    pub fn page(&mut self) -> RunPage<'_> {
        // SAFETY: `addr` points to `size` bytes mapped read/write for the
        // lifetime of `self`.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.size) };
        RunPage::new(bytes)
    }
}

impl Drop for RunMapping {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region mapped in `new`.
        unsafe {
            libc::munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}

/// The single vCPU of a VM.
pub struct Vcpu {
    fd: VcpuFd,
    run: RunMapping,
    regs: kvm_regs,
    sregs: kvm_sregs,
}

impl Vcpu {
    pub(crate) fn new(kvm: &Kvm, vm: &VmFd) -> Result<Self, VmError> {
        let fd = vm.create_vcpu(0).map_err(VmError::VcpuCreate)?;

        let size = kvm.get_vcpu_mmap_size().map_err(VmError::VcpuMmapSize)?;
        let run = RunMapping::new(&fd, size)?;

        info!("vCPU 0 created, run page {} bytes", size);

        Ok(Self {
            fd,
            run,
            regs: kvm_regs::default(),
            sregs: kvm_sregs::default(),
        })
    }

    /// Put the vCPU in flat real mode at `entry`.
    ///
    /// CS selector and base are zeroed so that `CS:IP == entry`; paging
    /// and protected mode stay off as left by KVM's reset state.
    pub fn initialize_registers(&mut self, entry: u64) -> Result<(), VmError> {
        let mut sregs = self.fd.get_sregs().map_err(VmError::GetSregs)?;
        sregs.cs.selector = 0;
        sregs.cs.base = 0;
        self.fd.set_sregs(&sregs).map_err(VmError::SetSregs)?;
        self.sregs = sregs;

        let regs = kvm_regs {
            rflags: RFLAGS_RESERVED,
            rip: entry,
            ..Default::default()
        };
        self.fd.set_regs(&regs).map_err(VmError::SetRegisters)?;
        self.regs = regs;

        info!("vCPU registers set: rip={:#x} rflags={:#x}", entry, RFLAGS_RESERVED);
        Ok(())
    }

    /// Enter the guest and block until it exits back to us.
    ///
    /// The exit itself is decoded from [`Vcpu::exit_context`].
    pub fn run(&mut self) -> Result<(), VmError> {
        self.fd.run().map(|_| ()).map_err(VmError::VcpuRun)
    }

    /// Refresh the cached general-purpose registers.
    pub fn read_regs(&mut self) -> Result<&kvm_regs, VmError> {
        self.regs = self.fd.get_regs().map_err(VmError::GetRegisters)?;
        Ok(&self.regs)
    }

    /// Last register snapshot written or read; not refreshed by `run`.
    pub fn regs(&self) -> &kvm_regs {
        &self.regs
    }

    pub fn sregs(&self) -> &kvm_sregs {
        &self.sregs
    }

    /// The run page together with the vCPU fd, for handlers that need
    /// both (LAPIC accesses).
    pub fn exit_context(&mut self) -> (RunPage<'_>, &mut VcpuFd) {
        (self.run.page(), &mut self.fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn zero_size_mapping_is_rejected() {
        let file = File::open("/dev/zero").unwrap();
        assert!(matches!(
            RunMapping::new(&file, 0),
            Err(VmError::InvalidMmapSize(0))
        ));
    }

    #[test]
    fn shared_mapping_is_readable_and_writable() {
        // /dev/zero supports MAP_SHARED and gives a zeroed page, enough to
        // exercise the view without /dev/kvm.
        let file = File::options().read(true).write(true).open("/dev/zero").unwrap();
        let mut mapping = RunMapping::new(&file, 0x1000).unwrap();
        assert_eq!(mapping.size(), 0x1000);

        let mut page = mapping.page();
        assert_eq!(page.size(), 0x1000);
        assert_eq!(page.read_u32(8).unwrap(), 0);
        page.write_u8(0xFFF, 0x5A).unwrap();
        assert_eq!(page.read_u8(0xFFF).unwrap(), 0x5A);
        assert!(page.read_u8(0x1000).is_err());
    }
}
