//! Command implementations.
//!
//! Commands that talk to a bootloader live in `device`; the rest work
//! without hardware.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod firmware;
pub(crate) mod ports;
