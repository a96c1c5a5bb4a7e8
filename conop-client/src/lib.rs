//! A client for communicating with CANopen nodes
//!
//! The crate provides utilities for communicating with nodes, including:
//!
//! - An [SDO client](SdoClient) for reading/writing a node's object dictionary via its SDO server
//! - An [NMT master](nmt_master) for sending node-control commands and tracking heartbeats
//! - A [BusManager] which is intended to be the engine behind an application, keeping track of
//!   nodes, and providing an API for managing them.
//! - Defining a [NodeConfig] TOML file format, which allows for storing and loading node
//!   configuration (any object, not just a PDO mapping)
//!
//! This library is currently based on tokio/async. The plan is to also include blocking APIs in
//! the future.
//!
//! This should be considered very alpha, with important missing features, and potentially
//! frequent breaking API changes.
#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod bus;
pub mod nmt_master;
mod node_configuration;
mod sdo_client;
#[cfg(any(target_os = "linux", target_os = "macos"))]
mod socketcan;
pub use conop_common as common;

pub use bus::{scanner::{BusNode, BusScanner, ScannerError}, BusManager, BusManagerError};
pub use node_configuration::{ConfigError, NodeConfig, Store, StoreValue};
pub use sdo_client::{ISDOClientBuilder, RawAbortCode, SdoClient, SdoClientError};
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use socketcan::{open_socketcan, SocketCanReceiver, SocketCanSender, SocketCanSdoClientBuilder};
