//! Pure functions extracted from the minivmm device and exit shells.
//!
//! Every function here takes values in and returns values out: no I/O, no
//! ioctls, no mutation of device state.  The effectful code in
//! [`crate::exit`] and [`crate::devices`] delegates its arithmetic
//! (register-to-LBA packing, bounds checks, LAPIC slot indexing) to these
//! functions so that the address computations derived from guest- and
//! kernel-supplied values can be tested exhaustively in isolation.
//!
//! Non-trivial functions carry `debug_assert!` postconditions.

pub mod ide;
pub mod lapic;
pub mod run_page;
