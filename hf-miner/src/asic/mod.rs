//! ASIC protocol support.

pub mod gn;
