//! Shared test fixtures available to every crate's `#[cfg(test)]` modules, instead of
//! duplicating a mock bus in each one.
//!
//! [`LoopbackBus`] is a synchronous loopback [`CanSender`]: since [`Dispatcher`](crate::dispatcher::Dispatcher)
//! is driven synchronously (one frame or timer tick at a time, no concurrent callers), the
//! loopback bus is a plain `Vec` behind a mutex rather than a channel.

use std::sync::{Arc, Mutex};

use conop_common::{messages::CanMessage, traits::CanSender};

/// A [`CanSender`] that appends every sent frame to a shared log instead of touching real
/// hardware, plus a convenience loop-back queue a test can feed straight back into a
/// [`crate::device::Device`] or [`crate::dispatcher::Dispatcher`] under test.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    sent: Arc<Mutex<Vec<CanMessage>>>,
}

impl LoopbackBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frame sent so far, oldest first
    pub fn sent(&self) -> Vec<CanMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Remove and return the oldest sent frame, if any
    pub fn pop_sent(&self) -> Option<CanMessage> {
        self.sent.lock().unwrap().pop()
    }

    /// Drain every sent frame
    pub fn take_sent(&self) -> Vec<CanMessage> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    /// True if nothing has been sent
    pub fn is_empty(&self) -> bool {
        self.sent.lock().unwrap().is_empty()
    }
}

impl CanSender for LoopbackBus {
    fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conop_common::messages::{CanId, CanMessage};

    #[test]
    fn records_sent_frames_in_order() {
        let mut bus = LoopbackBus::new();
        bus.send(CanMessage::new(CanId::Std(0x100), &[1])).unwrap();
        bus.send(CanMessage::new(CanId::Std(0x101), &[2])).unwrap();
        let sent = bus.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].id(), CanId::Std(0x100));
        assert_eq!(sent[1].id(), CanId::Std(0x101));
    }

    #[test]
    fn take_sent_drains_the_log() {
        let mut bus = LoopbackBus::new();
        bus.send(CanMessage::new(CanId::Std(0x200), &[9])).unwrap();
        assert_eq!(bus.take_sent().len(), 1);
        assert!(bus.is_empty());
    }
}
