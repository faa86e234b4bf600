//! Support library for the `fleetctl` binary.

pub mod config;
pub mod listener;
