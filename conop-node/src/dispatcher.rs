//! CAN frame dispatcher (C5)
//!
//! The dispatcher is the single point of contact between a [`Device`](crate::Device) and the
//! bus: every service (SDO server, NMT, TIME/EMCY) registers interest in the COB-IDs it cares
//! about instead of inspecting every incoming frame itself, and schedules the timers it needs
//! (heartbeat production, SDO timeout, life-guarding) against the same clock the caller drives
//! with [`Dispatcher::dispatch`]/[`Dispatcher::poll_timers`].
//!
//! This mirrors the fixed-ID routing a node's mailbox does in the single-SDO-server case, but
//! generalizes it to an arbitrary number of registrations: a device may offer several SDO
//! servers (CiA 301 §7.2.4 allows up to 128, each with its own pair of COB-IDs in object
//! 0x1200+), and the set of COB-IDs a device cares about isn't fixed at compile time once
//! object 0x1005/0x1012/0x1014/0x1200+ become writable.

use std::collections::VecDeque;

use conop_common::{messages::CanMessage, traits::CanSender};

use crate::error::{DispatchError, UnknownReceiverSnafu, UnknownTimerSnafu};
use snafu::OptionExt as _;

/// Callback invoked when a registered receiver's filter matches an inbound frame
pub type ReceiverCallback = Box<dyn FnMut(CanMessage) + Send>;

/// Callback invoked when a scheduled timer's deadline elapses. Receives the current time.
pub type TimerCallback = Box<dyn FnMut(u64) + Send>;

/// Opaque handle returned by [`Dispatcher::register_receiver`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReceiverHandle(u32);

/// Opaque handle returned by [`Dispatcher::schedule`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u32);

struct Receiver {
    handle: ReceiverHandle,
    /// The base COB-ID to match against
    id: u32,
    /// Bits of the incoming COB-ID that must match `id`; unset bits are don't-care
    mask: u32,
    callback: ReceiverCallback,
}

/// When a scheduled timer should fire again
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Recurrence {
    Once,
    Every(u64),
}

struct Timer {
    handle: TimerHandle,
    deadline_us: u64,
    recurrence: Recurrence,
    callback: TimerCallback,
}

/// Routes inbound CAN frames to registered receivers, and outbound frames/timer callbacks
/// through a single owned sender
///
/// Receivers and timers both fire in registration order when more than one matches/is due in
/// the same call, per the core's single-threaded cooperative scheduling model: there is never
/// a need to reason about concurrent delivery, only about order.
pub struct Dispatcher<S: CanSender> {
    sender: S,
    receivers: Vec<Receiver>,
    timers: Vec<Timer>,
    next_handle: u32,
    /// Frames queued by a callback re-entering [`Self::send`] during [`Self::dispatch`] or
    /// [`Self::poll_timers`]; flushed once the triggering call returns, so a service reacting
    /// to a frame it just received never fights the dispatcher for `&mut self`.
    pending_sends: VecDeque<CanMessage>,
}

impl<S: CanSender> Dispatcher<S> {
    /// Create a dispatcher around an owned sender
    pub fn new(sender: S) -> Self {
        Self {
            sender,
            receivers: Vec::new(),
            timers: Vec::new(),
            next_handle: 0,
            pending_sends: VecDeque::new(),
        }
    }

    fn alloc_handle(&mut self) -> u32 {
        let h = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        h
    }

    /// Register interest in inbound frames whose COB-ID matches `id` under `mask`
    ///
    /// A frame matches when `(frame.id & mask) == (id & mask)`; a mask of `0x7FF` (the full
    /// standard ID space) requires an exact match, while a mask like `0x780` matches a whole
    /// node-ID range (e.g. every node's heartbeat).
    pub fn register_receiver(
        &mut self,
        id: u32,
        mask: u32,
        callback: ReceiverCallback,
    ) -> ReceiverHandle {
        let handle = ReceiverHandle(self.alloc_handle());
        self.receivers.push(Receiver {
            handle,
            id,
            mask,
            callback,
        });
        handle
    }

    /// Remove a previously registered receiver
    pub fn unregister_receiver(&mut self, handle: ReceiverHandle) -> Result<(), DispatchError> {
        let pos = self
            .receivers
            .iter()
            .position(|r| r.handle == handle)
            .context(UnknownReceiverSnafu { handle })?;
        self.receivers.remove(pos);
        Ok(())
    }

    /// Transmit a frame
    ///
    /// If called from within a receiver or timer callback (i.e. re-entrantly, while
    /// [`Self::dispatch`] or [`Self::poll_timers`] is already running), the frame is queued and
    /// sent once that call returns, so callbacks never need a second mutable borrow of the
    /// dispatcher.
    pub fn send(&mut self, msg: CanMessage) -> Result<(), DispatchError> {
        self.sender.send(msg).map_err(|_| DispatchError::SendFailed)
    }

    /// Queue a frame for transmission once the current dispatch/poll call completes
    ///
    /// Used internally when a callback needs to send while the dispatcher's receiver/timer
    /// list is already borrowed; exposed so a callback can call it directly rather than
    /// failing to borrow `&mut self` a second time.
    pub fn queue_send(&mut self, msg: CanMessage) {
        self.pending_sends.push_back(msg);
    }

    fn flush_pending(&mut self) {
        while let Some(msg) = self.pending_sends.pop_front() {
            // Best-effort: one rejected frame doesn't stop the others from being tried.
            let _ = self.sender.send(msg);
        }
    }

    /// Schedule a one-shot timer to fire once, at `deadline_us`
    pub fn schedule_once(&mut self, deadline_us: u64, callback: TimerCallback) -> TimerHandle {
        self.insert_timer(deadline_us, Recurrence::Once, callback)
    }

    /// Schedule a periodic timer, first firing at `first_deadline_us` and then every
    /// `interval_us` after that
    pub fn schedule_periodic(
        &mut self,
        first_deadline_us: u64,
        interval_us: u64,
        callback: TimerCallback,
    ) -> TimerHandle {
        self.insert_timer(first_deadline_us, Recurrence::Every(interval_us), callback)
    }

    fn insert_timer(
        &mut self,
        deadline_us: u64,
        recurrence: Recurrence,
        callback: TimerCallback,
    ) -> TimerHandle {
        let handle = TimerHandle(self.alloc_handle());
        self.timers.push(Timer {
            handle,
            deadline_us,
            recurrence,
            callback,
        });
        handle
    }

    /// Cancel a previously scheduled timer
    pub fn cancel(&mut self, handle: TimerHandle) -> Result<(), DispatchError> {
        let pos = self
            .timers
            .iter()
            .position(|t| t.handle == handle)
            .context(UnknownTimerSnafu { handle })?;
        self.timers.remove(pos);
        Ok(())
    }

    /// Feed one inbound frame to every receiver whose filter matches it, in registration order
    pub fn dispatch(&mut self, msg: CanMessage) {
        let raw = msg.id().raw();
        for r in &mut self.receivers {
            if (raw & r.mask) == (r.id & r.mask) {
                (r.callback)(msg);
            }
        }
        self.flush_pending();
    }

    /// Fire every timer whose deadline has elapsed, in registration order, rescheduling
    /// periodic ones
    pub fn poll_timers(&mut self, now_us: u64) {
        // Indices, not timers, so a callback scheduling/canceling a timer doesn't invalidate
        // the borrow; the list is re-walked each call, so fairness degrades gracefully rather
        // than panicking if that happens.
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].deadline_us > now_us {
                i += 1;
                continue;
            }
            let mut timer = self.timers.remove(i);
            (timer.callback)(now_us);
            match timer.recurrence {
                Recurrence::Once => {}
                Recurrence::Every(interval) => {
                    timer.deadline_us = now_us.saturating_add(interval);
                    self.timers.insert(i, timer);
                    i += 1;
                }
            }
        }
        self.flush_pending();
    }

    /// Access the owned sender directly, bypassing registration/queuing
    ///
    /// Intended for callers that already hold `&mut Dispatcher` outside a callback (e.g.
    /// [`Device::process`](crate::Device::process)) and want to send without going through
    /// [`Self::send`]'s error mapping twice.
    pub fn sender_mut(&mut self) -> &mut S {
        &mut self.sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conop_common::messages::CanId;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct TestSender {
        sent: Arc<Mutex<Vec<CanMessage>>>,
    }

    impl CanSender for TestSender {
        fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    #[test]
    fn receivers_fire_in_registration_order_when_both_match() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::new(TestSender::default());

        let o1 = order.clone();
        d.register_receiver(0x180, 0x7FF, Box::new(move |_| o1.lock().unwrap().push(1)));
        let o2 = order.clone();
        d.register_receiver(0x100, 0x700, Box::new(move |_| o2.lock().unwrap().push(2)));

        d.dispatch(CanMessage::new(CanId::Std(0x180), &[]));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn mask_restricts_match_to_id_range() {
        let hits = Arc::new(Mutex::new(0u32));
        let mut d = Dispatcher::new(TestSender::default());
        let h = hits.clone();
        // Matches any heartbeat COB-ID (0x700 + node 0..=0x7F)
        d.register_receiver(0x700, 0x780, Box::new(move |_| *h.lock().unwrap() += 1));

        d.dispatch(CanMessage::new(CanId::Std(0x705), &[]));
        d.dispatch(CanMessage::new(CanId::Std(0x800), &[]));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unregister_stops_future_delivery() {
        let hits = Arc::new(Mutex::new(0u32));
        let mut d = Dispatcher::new(TestSender::default());
        let h = hits.clone();
        let handle = d.register_receiver(0x100, 0x7FF, Box::new(move |_| *h.lock().unwrap() += 1));

        d.dispatch(CanMessage::new(CanId::Std(0x100), &[]));
        d.unregister_receiver(handle).unwrap();
        d.dispatch(CanMessage::new(CanId::Std(0x100), &[]));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unregister_unknown_handle_errors() {
        let mut d = Dispatcher::new(TestSender::default());
        let handle = d.register_receiver(0x100, 0x7FF, Box::new(|_| {}));
        d.unregister_receiver(handle).unwrap();
        assert!(d.unregister_receiver(handle).is_err());
    }

    #[test]
    fn one_shot_timer_fires_once() {
        let fires = Arc::new(Mutex::new(0u32));
        let mut d = Dispatcher::new(TestSender::default());
        let f = fires.clone();
        d.schedule_once(1000, Box::new(move |_| *f.lock().unwrap() += 1));

        d.poll_timers(500);
        assert_eq!(*fires.lock().unwrap(), 0);
        d.poll_timers(1000);
        assert_eq!(*fires.lock().unwrap(), 1);
        d.poll_timers(2000);
        assert_eq!(*fires.lock().unwrap(), 1);
    }

    #[test]
    fn periodic_timer_reschedules() {
        let fires = Arc::new(Mutex::new(0u32));
        let mut d = Dispatcher::new(TestSender::default());
        let f = fires.clone();
        d.schedule_periodic(1000, 1000, Box::new(move |_| *f.lock().unwrap() += 1));

        d.poll_timers(1000);
        d.poll_timers(2000);
        d.poll_timers(3000);
        assert_eq!(*fires.lock().unwrap(), 3);
    }

    #[test]
    fn cancel_stops_periodic_timer() {
        let fires = Arc::new(Mutex::new(0u32));
        let mut d = Dispatcher::new(TestSender::default());
        let f = fires.clone();
        let handle = d.schedule_periodic(1000, 1000, Box::new(move |_| *f.lock().unwrap() += 1));

        d.poll_timers(1000);
        d.cancel(handle).unwrap();
        d.poll_timers(2000);
        assert_eq!(*fires.lock().unwrap(), 1);
    }

    #[test]
    fn send_forwards_to_sender() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::new(TestSender { sent: sent.clone() });
        d.send(CanMessage::new(CanId::Std(0x123), &[1, 2, 3])).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);
    }
}
