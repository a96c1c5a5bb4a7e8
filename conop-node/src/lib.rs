#![allow(clippy::comparison_chain)]
//! The device-side CANopen core.
//!
//! [`object_dict`] holds the dynamic object dictionary (C2), [`sdo_buffer`] the SDO staging
//! buffer (C3), [`sdo_server`] the SDO server state machine (C4), [`dispatcher`] the CAN
//! frame demultiplexer and timer registry (C5), [`nmt`] the NMT lifecycle with heartbeat and
//! life-guarding (C6), and [`services`] the TIME/EMCY producer/consumer pair (C7).
//! [`device::Device`] wires all of these together into the thing an application embeds.

pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod nmt;
pub mod object_dict;
pub mod sdo_buffer;
pub mod sdo_server;
pub mod services;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use conop_common as common;
pub use device::Device;
