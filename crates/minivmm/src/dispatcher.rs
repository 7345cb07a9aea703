//! The VM-exit dispatch loop.
//!
//! Each iteration blocks in [`Vcpu::run`] until the guest traps, decodes
//! the exit once from the run page and routes it:
//!
//! | Exit            | Route                                           |
//! |-----------------|-------------------------------------------------|
//! | port I/O OUT    | IDE (`0x1F0..=0x1F7`), COM1 (`0x3F8`), debug port (`0x8A00`), else ignored |
//! | port I/O IN     | IDE status (`0x1F7`), IDE data (`0x1F0`), else ignored |
//! | MMIO            | LAPIC window, else ignored (reads return zero)  |
//! | HLT             | terminal: success                               |
//! | anything else   | terminal: [`ExitError::UnhandledExit`]          |
//!
//! Emulation runs to completion between two `KVM_RUN` calls; there is no
//! other concurrency.

use std::io::{self, Write};

use log::{debug, error, info, trace};
use thiserror::Error;

use crate::devices::ide::{DiskError, IdeDisk, IdeRegister};
use crate::devices::lapic::{LapicAccess, LapicError, LapicWindow};
use crate::devices::serial::{Serial, COM1_BASE};
use crate::exit::{
    exit_reason_name, IoDirection, IoTransaction, MmioTransaction, RunPage, RunPageError, VmExit,
};
use crate::vcpu::Vcpu;
use crate::vm::VmError;

/// Bochs/QEMU debug port.  The xv6 boot block writes here if the kernel
/// it loaded ever returns.
pub const DEBUG_EXIT_PORT: u16 = 0x8A00;

#[derive(Error, Debug)]
pub enum ExitError {
    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("Run page error: {0}")]
    RunPage(#[from] RunPageError),

    #[error("Disk error: {0}")]
    Disk(#[from] DiskError),

    #[error("Serial output error: {0}")]
    Serial(#[source] io::Error),

    #[error("LAPIC error: {0}")]
    Lapic(#[from] LapicError),

    #[error("Unhandled VM exit {reason} ({name}) at rip {rip:#x}")]
    UnhandledExit {
        reason: u32,
        name: &'static str,
        rip: u64,
    },

    #[error("Guest aborted through debug port 0x8a00 with {value:#x} at rip {rip:#x}")]
    GuestAbort { value: u16, rip: u64 },
}

/// What the loop does after an exit has been emulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
    Unhandled(u32),
    Abort(u16),
}

/// Final state of a guest that halted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Halted {
    pub rip: u64,
    pub exits: u64,
}

/// Routes VM exits to the emulated devices it owns.
pub struct ExitDispatcher<W: Write> {
    disk: IdeDisk,
    serial: Serial<W>,
    lapic: LapicWindow,
    exits: u64,
}

impl<W: Write> ExitDispatcher<W> {
    pub fn new(disk: IdeDisk, serial: Serial<W>) -> Self {
        Self {
            disk,
            serial,
            lapic: LapicWindow::default(),
            exits: 0,
        }
    }

    pub fn disk(&self) -> &IdeDisk {
        &self.disk
    }

    pub fn serial(&self) -> &Serial<W> {
        &self.serial
    }

    /// Exits handled so far.
    pub fn exit_count(&self) -> u64 {
        self.exits
    }

    /// Run `vcpu` until the guest halts or something terminal happens.
    pub fn run(&mut self, vcpu: &mut Vcpu) -> Result<Halted, ExitError> {
        info!("Starting VM execution");

        loop {
            vcpu.run()?;
            self.exits += 1;

            let flow = {
                let (mut page, fd) = vcpu.exit_context();
                let exit = VmExit::decode(&page)?;
                self.dispatch(exit, &mut page, fd)?
            };

            match flow {
                Flow::Continue => {}
                Flow::Halt => {
                    let rip = vcpu.read_regs()?.rip;
                    info!(
                        "VM halted at rip {:#x} ({} exits, {} serial bytes, {} disk bytes read)",
                        rip,
                        self.exits,
                        self.serial.bytes_written(),
                        self.disk.stats().bytes_read,
                    );
                    return Ok(Halted {
                        rip,
                        exits: self.exits,
                    });
                }
                Flow::Unhandled(reason) => {
                    let rip = vcpu.read_regs()?.rip;
                    let name = exit_reason_name(reason);
                    error!("Unhandled exit reason {} ({}) at rip {:#x}", reason, name, rip);
                    return Err(ExitError::UnhandledExit { reason, name, rip });
                }
                Flow::Abort(value) => {
                    let rip = vcpu.read_regs()?.rip;
                    error!("Guest wrote {:#x} to the debug port at rip {:#x}", value, rip);
                    return Err(ExitError::GuestAbort { value, rip });
                }
            }
        }
    }

    /// Emulate one decoded exit.
    ///
    /// `page` must be the run page the exit was decoded from; IN and MMIO
    /// read results are written back into it.
    pub fn dispatch(
        &mut self,
        exit: VmExit,
        page: &mut RunPage<'_>,
        lapic: &mut impl LapicAccess,
    ) -> Result<Flow, ExitError> {
        match exit {
            VmExit::Io(io) => match io.direction {
                IoDirection::Out => self.emulate_out(&io, page),
                IoDirection::In => {
                    self.emulate_in(&io, page)?;
                    Ok(Flow::Continue)
                }
            },
            VmExit::Mmio(mmio) => {
                self.emulate_mmio(&mmio, page, lapic)?;
                Ok(Flow::Continue)
            }
            VmExit::Hlt => Ok(Flow::Halt),
            VmExit::Unhandled(reason) => Ok(Flow::Unhandled(reason)),
        }
    }

    fn emulate_out(&mut self, io: &IoTransaction, page: &RunPage<'_>) -> Result<Flow, ExitError> {
        if let Some(reg) = IdeRegister::from_port(io.port) {
            for i in 0..io.count {
                let value = operand_u16(io.operand(page, i)?);
                debug!("IDE OUT {:?} <- {:#x}", reg, value);
                self.disk.write_register(reg, value)?;
            }
            return Ok(Flow::Continue);
        }

        match io.port {
            COM1_BASE => {
                for i in 0..io.count {
                    let byte = io.operand(page, i)?[0];
                    self.serial.transmit(byte).map_err(ExitError::Serial)?;
                }
            }
            DEBUG_EXIT_PORT => {
                return Ok(Flow::Abort(operand_u16(io.operand(page, 0)?)));
            }
            port => trace!("Ignoring OUT to port {:#x}", port),
        }
        Ok(Flow::Continue)
    }

    fn emulate_in(&mut self, io: &IoTransaction, page: &mut RunPage<'_>) -> Result<(), ExitError> {
        match IdeRegister::from_port(io.port) {
            Some(IdeRegister::StatusCommand) => {
                let status = self.disk.status();
                for i in 0..io.count {
                    io.write_operand(page, i, &[status])?;
                }
            }
            Some(IdeRegister::Data) => {
                let mut word = [0u8; 4];
                let operand = &mut word[..io.size as usize];
                for i in 0..io.count {
                    self.disk.read_data(operand)?;
                    io.write_operand(page, i, operand)?;
                }
            }
            _ => trace!("Ignoring IN from port {:#x}", io.port),
        }
        Ok(())
    }

    fn emulate_mmio(
        &mut self,
        mmio: &MmioTransaction,
        page: &mut RunPage<'_>,
        lapic: &mut impl LapicAccess,
    ) -> Result<(), ExitError> {
        debug!(
            "MMIO {} {:#x} len {} data {:02x?}",
            if mmio.is_write { "write" } else { "read" },
            mmio.phys_addr,
            mmio.len,
            mmio.bytes(),
        );

        if mmio.is_write {
            if !self.lapic.write(lapic, mmio.phys_addr, mmio.bytes())? {
                trace!("Ignoring MMIO write to {:#x}", mmio.phys_addr);
            }
        } else {
            let value = self.lapic.read(lapic, mmio.phys_addr)?.unwrap_or(0);
            mmio.complete_read(page, &value.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Little-endian value of a 1-, 2- or 4-byte operand, truncated to 16 bits.
fn operand_u16(bytes: &[u8]) -> u16 {
    match bytes {
        [] => 0,
        [lo] => u16::from(*lo),
        [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
    }
}
