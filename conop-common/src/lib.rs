#![cfg_attr(not(feature = "std"), no_std)]
//! Wire-level types shared between the device core (`conop-node`) and the manager-side
//! client (`conop-client`).
//!
//! This crate has no notion of a running node: it only encodes and decodes the bytes
//! that go on the bus (CAN frames, SDO requests/responses, NMT/heartbeat/SYNC/TIME/EMCY
//! payloads) and the CANopen basic/array value types.

mod atomic_cell;
pub use atomic_cell::AtomicCell;

pub mod constants;
pub mod identity;
pub mod messages;
pub mod node_id;
pub mod objects;
pub mod sdo;
pub mod traits;
pub mod value;

pub use node_id::NodeId;
pub use messages::{CanError, CanId, CanMessage};
