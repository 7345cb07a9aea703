//! Emulated devices reached through port I/O and MMIO exits.
//!
//! Each device is plain state plus methods; decoding exits and moving
//! operand bytes in and out of the run page is the dispatcher's job.

pub mod ide;
pub mod lapic;
pub mod serial;
