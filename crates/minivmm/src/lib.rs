//! minivmm: a minimal KVM monitor that boots an xv6 boot sector.
//!
//! One VM, one vCPU in real mode at `0x7c00`, and a trap-and-emulate
//! device set just large enough for the xv6 boot path: an IDE disk that
//! reads sectors by programmed I/O, an output-only COM1 UART, and a LAPIC
//! MMIO window forwarded to KVM's in-kernel APIC.
//!
//! # Architecture
//!
//! - [`memory`]: Guest RAM allocation and boot-image loading
//! - [`vm`]: VM creation, chipset setup, RAM registration, configuration
//! - [`vcpu`]: vCPU creation, run-page mapping, register setup
//! - [`exit`]: Bounds-checked decoding of the `kvm_run` exit record
//! - [`dispatcher`]: The exit loop routing traps to devices
//! - [`devices`]: IDE disk, serial port and LAPIC window
//! - [`machine`]: Everything above wired into one bootable machine
//! - [`verified`]: Pure arithmetic helpers with checked postconditions

pub mod devices;
pub mod dispatcher;
pub mod exit;
pub mod machine;
pub mod memory;
pub mod vcpu;
pub mod verified;
pub mod vm;
