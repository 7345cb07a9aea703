//! A complete single-vCPU machine: VM, vCPU and the devices behind the
//! exit dispatcher.

use std::io::Write;

use crate::devices::ide::IdeDisk;
use crate::devices::serial::Serial;
use crate::dispatcher::{ExitDispatcher, ExitError, Halted};
use crate::memory::GuestMemoryManager;
use crate::vcpu::Vcpu;
use crate::vm::{VmConfig, VmError, VmHandle};

/// Owns every piece of one monitor instance.
///
/// Field order is drop order: the vCPU (and its run-page mapping) goes
/// before the VM and guest RAM it points into.
pub struct Machine<W: Write> {
    dispatcher: ExitDispatcher<W>,
    vcpu: Vcpu,
    vm: VmHandle,
    boot_sector_address: u64,
}

impl<W: Write> Machine<W> {
    /// Create the VM and its vCPU and point the vCPU at
    /// `config.entry_point`.  Guest RAM starts zeroed; call
    /// [`Machine::load_boot_sector`] before [`Machine::run`].
    pub fn new(config: &VmConfig, disk: IdeDisk, serial_out: W) -> Result<Self, VmError> {
        let vm = VmHandle::new(config)?;
        let mut vcpu = vm.create_vcpu()?;
        vcpu.initialize_registers(config.entry_point)?;

        Ok(Self {
            dispatcher: ExitDispatcher::new(disk, Serial::new(serial_out)),
            vcpu,
            vm,
            boot_sector_address: config.boot_sector_address,
        })
    }

    /// Copy the boot sector image to its load address.
    pub fn load_boot_sector(&self, image: &[u8]) -> Result<(), VmError> {
        self.vm
            .memory()
            .load_image(self.boot_sector_address, image)
            .map_err(VmError::from)
    }

    /// Run until the guest halts or a terminal error occurs.
    pub fn run(&mut self) -> Result<Halted, ExitError> {
        self.dispatcher.run(&mut self.vcpu)
    }

    pub fn memory(&self) -> &GuestMemoryManager {
        self.vm.memory()
    }

    pub fn vcpu(&self) -> &Vcpu {
        &self.vcpu
    }

    pub fn dispatcher(&self) -> &ExitDispatcher<W> {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> VmConfig {
        VmConfig {
            memory_size: 0x10_0000,
            ..Default::default()
        }
    }

    // With the in-kernel irqchip, HLT is absorbed by KVM rather than
    // reported, so the program ends through the debug port.
    #[test]
    #[ignore = "requires /dev/kvm"]
    fn real_mode_uart_then_debug_port() {
        let program = [
            0xB0, b'H', //       mov al, 'H'
            0xBA, 0xF8, 0x03, // mov dx, 0x3f8
            0xEE, //             out dx, al
            0xB0, b'i', //       mov al, 'i'
            0xEE, //             out dx, al
            0xBA, 0x00, 0x8A, // mov dx, 0x8a00
            0xB8, 0x34, 0x12, // mov ax, 0x1234
            0xEF, //             out dx, ax
        ];

        let config = small_config();
        let mut machine = Machine::new(&config, IdeDisk::from_image(Vec::new()), Vec::<u8>::new()).unwrap();
        machine.load_boot_sector(&program).unwrap();

        let err = machine.run().unwrap_err();
        assert!(
            matches!(err, ExitError::GuestAbort { value: 0x1234, .. }),
            "unexpected error: {err}"
        );
        assert_eq!(machine.dispatcher().serial().get_ref(), b"Hi");
        assert_eq!(machine.dispatcher().exit_count(), 3);
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn registers_start_at_entry_point() {
        let config = small_config();
        let machine = Machine::new(&config, IdeDisk::from_image(Vec::new()), Vec::<u8>::new()).unwrap();
        assert_eq!(machine.vcpu().regs().rip, config.entry_point);
        assert_eq!(machine.vcpu().regs().rflags, crate::vcpu::RFLAGS_RESERVED);
        assert_eq!(machine.vcpu().sregs().cs.base, 0);
        assert_eq!(machine.vcpu().sregs().cs.selector, 0);
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn boot_sector_lands_at_load_address() {
        let config = small_config();
        let machine = Machine::new(&config, IdeDisk::from_image(Vec::new()), Vec::<u8>::new()).unwrap();
        machine.load_boot_sector(&[0xFA, 0x31, 0xC0]).unwrap();

        let mut buf = [0u8; 3];
        machine.memory().read(config.boot_sector_address, &mut buf).unwrap();
        assert_eq!(buf, [0xFA, 0x31, 0xC0]);
    }
}
