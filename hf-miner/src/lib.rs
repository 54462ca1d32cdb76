//! Driver and hash-rate test harness for HashFast GN hashing dies.
//!
//! The dies sit behind a USB interface controller that maps the serial
//! protocol onto bulk transfers. This crate encodes and recovers protocol
//! frames, schedules randomized test work onto every core, verifies the
//! nonces that come back and reports the achieved hash rate.

pub mod asic;
pub mod config;
pub mod daemon;
pub mod error;
pub mod pow;
pub mod scheduler;
pub mod session;
pub mod tracing;
pub mod transport;
pub mod types;
