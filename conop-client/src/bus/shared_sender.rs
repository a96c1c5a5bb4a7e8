//! Utility for sharing a single socket among tasks
use std::sync::Arc;
use tokio::sync::Mutex;

use conop_common::{traits::AsyncCanSender, CanMessage};

/// A cloneable [`AsyncCanSender`] wrapping an `Arc<Mutex<S>>`
///
/// [`BusManager`](crate::BusManager) hands one of these to every long-running task (the NMT
/// master, per-node SDO clients) that needs to write to the bus, so they all serialize onto
/// the one socket rather than each owning a send half.
#[derive(Debug)]
pub struct SharedSender<S: AsyncCanSender> {
    inner: Arc<Mutex<S>>,
}

impl<S: AsyncCanSender> Clone for SharedSender<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: AsyncCanSender> SharedSender<S> {
    /// Wrap a shared sender around an already-`Arc<Mutex<_>>`-wrapped sender
    pub fn new(sender: Arc<Mutex<S>>) -> Self {
        Self { inner: sender }
    }
}

impl<S: AsyncCanSender> AsyncCanSender for SharedSender<S> {
    async fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        let mut inner = self.inner.lock().await;
        inner.send(msg).await
    }
}
