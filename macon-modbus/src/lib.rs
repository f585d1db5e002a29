//! Modbus RTU driver for the Macon geothermal heat pump controller.
//!
//! The driver talks to a single device (slave 1) over a half-duplex RS485
//! link at 2400 baud. It periodically reads the holding registers and packed
//! status bits into typed snapshots, and performs validated, single-attempt
//! writes to a handful of control registers.
//!
//! # Layers
//!
//! - [`codec`] - RTU frame encoding, decoding and CRC16
//! - [`transport`] - Serial session ownership, one transaction at a time
//! - [`registers`] - Register map: addresses, scaling, sign and bit packing
//! - [`poller`] - Grouped reads assembled into [`snapshot::DeviceSnapshot`]s
//! - [`writer`] - Setpoint writes with optional read-back verification
//! - [`reset`] - Soft reset state machine
//! - [`control`] - Fault-gated setpoint and host control routine
//! - [`sink`] - Records emitted per poll cycle and per write
//!
//! Every component reaches the device through the [`transport::Bus`] trait;
//! [`transport::Transport`] is the only implementation that owns a link.

pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod poller;
pub mod registers;
pub mod reset;
pub mod sink;
pub mod snapshot;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod testing;

pub use error::{DecodeError, PollError, RegisterError, TransportError, WriteError};
pub use registers::{RegisterMap, Value};
pub use snapshot::DeviceSnapshot;
pub use transport::{Bus, Transport};
