//! Error types for the device-side core
//!
//! SDO access failures have their own representation ([`conop_common::sdo::AbortCode`]),
//! since they're reported back to the requesting client on the wire rather than surfaced to
//! the embedding application. The types here cover everything else: building an object
//! dictionary, applying a configuration, and driving the dispatcher.

use snafu::Snafu;

use conop_common::sdo::AbortCode;

use crate::dispatcher::{ReceiverHandle, TimerHandle};

/// Error returned by [`crate::object_dict::ObjectDictionary`] construction
#[derive(Debug, Snafu)]
pub enum DictError {
    /// An object was inserted at an index that was already occupied
    #[snafu(display("object 0x{index:04X} already exists in the dictionary"))]
    DuplicateObject {
        /// The conflicting index
        index: u16,
    },
    /// A lookup was made against an index with no registered object
    #[snafu(display("object 0x{index:04X} does not exist"))]
    NoSuchObject {
        /// The missing index
        index: u16,
    },
    /// A sub object was inserted at a sub index that was already occupied
    #[snafu(display("sub index {sub} already exists on this object"))]
    DuplicateSubObject {
        /// The conflicting sub index
        sub: u8,
    },
}

/// Error returned while applying a [`crate::config::ConfigRecord`] sequence
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The object an entry targeted does not exist
    #[snafu(display("object 0x{index:04X} does not exist"))]
    NoSuchObject {
        /// The index the record named
        index: u16,
    },
    /// The object dictionary rejected the write
    #[snafu(display("object 0x{index:04X}sub{sub} rejected configuration write: {abort_code:?}"))]
    Rejected {
        /// The object index being configured
        index: u16,
        /// The sub index being configured
        sub: u8,
        /// The reason the write was rejected
        abort_code: AbortCode,
    },
}

/// Error returned by [`crate::dispatcher::Dispatcher`] operations
#[derive(Debug, Snafu)]
pub enum DispatchError {
    /// The underlying transport refused the frame (e.g. a full TX mailbox)
    #[snafu(display("failed to send CAN message"))]
    SendFailed,
    /// [`crate::dispatcher::Dispatcher::unregister_receiver`] was called with a handle that
    /// is not (or is no longer) registered
    #[snafu(display("no receiver registered with handle {handle:?}"))]
    UnknownReceiver {
        /// The handle that was looked up
        handle: ReceiverHandle,
    },
    /// [`crate::dispatcher::Dispatcher::cancel`] was called with a handle that is not (or is
    /// no longer) registered
    #[snafu(display("no timer registered with handle {handle:?}"))]
    UnknownTimer {
        /// The handle that was looked up
        handle: TimerHandle,
    },
}
