//! NMT lifecycle: state machine, heartbeat, and life-guarding (C6)
//!
//! Four states gate which other services are active: *Initialisation* exists only for the
//! instant it takes to emit a boot-up message before the device moves itself to
//! *Pre-operational*; *Pre-operational* runs everything except PDOs; *Operational* runs
//! everything; *Stopped* runs only NMT node-control and the heartbeat producer.
//!
//! Heartbeat production (object 0x1017) and legacy node guarding (0x100C/0x100D) are two
//! independent liveness mechanisms defined by CiA 301, and nothing prevents a network from
//! configuring both on the same node at once. Rather than pick one, this module honors
//! whichever are configured, simultaneously: a heartbeat is still produced on its own interval
//! even while a guard master is also polling this node with RTR frames. Object 0x1016
//! (consumer heartbeat time) is a third, separate mechanism: it lets *this* node monitor the
//! liveness of up to 127 other nodes by consuming their heartbeats, independent of whatever an
//! NMT master elsewhere on the bus is doing with the same frames.

use std::sync::RwLock;

use conop_common::{
    messages::{CanMessage, Heartbeat, NmtCommand, NmtCommandSpecifier, NmtState},
    AtomicCell,
};

/// What a device should do in response to an NMT node-control command
///
/// [`NmtService::handle_command`] returns this so the embedding [`Device`](crate::Device) can
/// perform whatever side effects a reset implies (re-running application init, re-reading
/// configuration) beyond the state machine's own bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmtAction {
    /// The local state changed with no further action required
    StateChanged(NmtState),
    /// The application should perform a full reset, as if the device had just powered on
    ResetApp,
    /// Communication parameters should reset to their power-on defaults; the application
    /// itself keeps running
    ResetComm,
}

/// A node monitored via the heartbeat consumer mechanism (object 0x1016)
#[derive(Debug)]
struct MonitoredNode {
    node_id: u8,
    interval_ms: u16,
    last_seen_us: AtomicCell<Option<u64>>,
    /// Set once [`LifeGuardingEvent::ConsumerTimeout`] has fired for the current outage, so
    /// [`NmtService::check_timeouts`] reports it exactly once per outage rather than on every
    /// call while the node stays quiet.
    alarmed: AtomicCell<bool>,
}

/// Reported when a liveness mechanism (heartbeat consumer or node guarding) times out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifeGuardingEvent {
    /// A monitored node (object 0x1016) missed two consecutive expected heartbeats
    ConsumerTimeout {
        /// The node that went quiet
        node_id: u8,
    },
    /// This node's own guard master (object 0x100C/0x100D) stopped polling in time
    GuardTimeout,
}

/// The NMT state machine, heartbeat producer/consumer, and legacy node guarding
pub struct NmtService {
    node_id: u8,
    state: AtomicCell<NmtState>,
    heartbeat_toggle: AtomicCell<bool>,
    /// Object 0x1017: 0 disables production
    heartbeat_period_ms: AtomicCell<u16>,
    /// Object 0x100C: 0 disables node guarding
    guard_time_ms: AtomicCell<u16>,
    /// Object 0x100D
    life_time_factor: AtomicCell<u8>,
    last_guard_poll_us: AtomicCell<Option<u64>>,
    /// Set once [`LifeGuardingEvent::GuardTimeout`] has fired for the current outage; see
    /// [`MonitoredNode::alarmed`].
    guard_alarmed: AtomicCell<bool>,
    /// Object 0x1016 entries; reconfigured wholesale since the object is an array the client
    /// downloads one sub-index at a time but which only takes effect as a set
    monitored: RwLock<Vec<MonitoredNode>>,
}

impl std::fmt::Debug for NmtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NmtService")
            .field("node_id", &self.node_id)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

impl NmtService {
    /// Create a new service for the given node ID, starting in [`NmtState::Bootup`]
    ///
    /// Heartbeat production and node guarding start out disabled; call
    /// [`Self::set_heartbeat_period_ms`] / [`Self::set_guarding`] once the object dictionary has
    /// supplied their configured values.
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            state: AtomicCell::new(NmtState::Bootup),
            heartbeat_toggle: AtomicCell::new(false),
            heartbeat_period_ms: AtomicCell::new(0),
            guard_time_ms: AtomicCell::new(0),
            life_time_factor: AtomicCell::new(0),
            last_guard_poll_us: AtomicCell::new(None),
            guard_alarmed: AtomicCell::new(false),
            monitored: RwLock::new(Vec::new()),
        }
    }

    /// The current NMT state
    pub fn state(&self) -> NmtState {
        self.state.load()
    }

    /// Set the heartbeat producer interval (object 0x1017). Zero disables production.
    pub fn set_heartbeat_period_ms(&self, ms: u16) {
        self.heartbeat_period_ms.store(ms);
    }

    /// True if the heartbeat producer is configured to run
    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_period_ms.load() != 0
    }

    /// The configured heartbeat interval, in microseconds, if enabled
    pub fn heartbeat_interval_us(&self) -> Option<u64> {
        let ms = self.heartbeat_period_ms.load();
        (ms != 0).then(|| ms as u64 * 1000)
    }

    /// Configure legacy node guarding (objects 0x100C and 0x100D). Either value zero disables
    /// it.
    pub fn set_guarding(&self, guard_time_ms: u16, life_time_factor: u8) {
        self.guard_time_ms.store(guard_time_ms);
        self.life_time_factor.store(life_time_factor);
        self.last_guard_poll_us.store(None);
        self.guard_alarmed.store(false);
    }

    fn life_time_us(&self) -> Option<u64> {
        let guard = self.guard_time_ms.load();
        let factor = self.life_time_factor.load();
        if guard == 0 || factor == 0 {
            None
        } else {
            Some(guard as u64 * factor as u64 * 1000)
        }
    }

    /// Replace the set of nodes monitored via the heartbeat consumer mechanism (object 0x1016)
    ///
    /// Each entry is `(node_id, interval_ms)`; an interval of zero for a given node_id means
    /// "not monitored" and is filtered out.
    pub fn set_consumer_heartbeat(&self, entries: &[(u8, u16)]) {
        let nodes = entries
            .iter()
            .filter(|(_, ms)| *ms != 0)
            .map(|(node_id, interval_ms)| MonitoredNode {
                node_id: *node_id,
                interval_ms: *interval_ms,
                last_seen_us: AtomicCell::new(None),
                alarmed: AtomicCell::new(false),
            })
            .collect();
        *self.monitored.write().unwrap() = nodes;
    }

    /// Emit the boot-up message and transition to [`NmtState::PreOperational`]
    ///
    /// Called once by [`Device`](crate::Device) on startup. Per CiA 301, *Initialisation*
    /// exists only long enough to send this message before moving on automatically.
    pub fn boot(&self) -> CanMessage {
        self.state.store(NmtState::PreOperational);
        Heartbeat {
            node: self.node_id,
            toggle: false,
            state: NmtState::Bootup,
        }
        .into()
    }

    /// Process a received CAN message as an NMT node-control command, if it is one addressed
    /// to this node (or a broadcast)
    ///
    /// Returns `None` if the frame isn't an NMT command, or is addressed to a different node.
    pub fn handle_command(&self, msg: &CanMessage) -> Option<NmtAction> {
        let cmd = NmtCommand::try_from(*msg).ok()?;
        if cmd.node != 0 && cmd.node != self.node_id {
            return None;
        }
        Some(self.apply(cmd.cs))
    }

    /// Force the local state directly, bypassing the node-control command path
    ///
    /// Used by [`Device`](crate::Device) to apply object 0x1029 (error behavior) when a
    /// life-guarding timeout fires: unlike [`Self::handle_command`] this never emits an
    /// [`NmtAction`], since there is no remote command to react to.
    pub fn force_state(&self, state: NmtState) {
        self.state.store(state);
    }

    fn apply(&self, cs: NmtCommandSpecifier) -> NmtAction {
        match cs {
            NmtCommandSpecifier::Start => {
                self.state.store(NmtState::Operational);
                NmtAction::StateChanged(NmtState::Operational)
            }
            NmtCommandSpecifier::Stop => {
                self.state.store(NmtState::Stopped);
                NmtAction::StateChanged(NmtState::Stopped)
            }
            NmtCommandSpecifier::EnterPreOp => {
                self.state.store(NmtState::PreOperational);
                NmtAction::StateChanged(NmtState::PreOperational)
            }
            NmtCommandSpecifier::ResetApp => {
                self.state.store(NmtState::Bootup);
                NmtAction::ResetApp
            }
            NmtCommandSpecifier::ResetComm => {
                self.state.store(NmtState::Bootup);
                NmtAction::ResetComm
            }
        }
    }

    /// Build the next heartbeat frame, flipping the toggle bit
    ///
    /// The caller (normally a periodic timer armed for [`Self::heartbeat_interval_us`]) is
    /// responsible for actually sending it and for rescheduling the next firing.
    pub fn produce_heartbeat(&self) -> CanMessage {
        let toggle = self.heartbeat_toggle.fetch_update(|t| Some(!t)).unwrap_or(false);
        Heartbeat {
            node: self.node_id,
            toggle,
            state: self.state.load(),
        }
        .into()
    }

    /// Record that a guard RTR (or any frame on this node's own heartbeat COB-ID received as
    /// an RTR) arrived at `now_us`, resetting the guard timeout
    pub fn note_guard_poll(&self, now_us: u64) {
        self.last_guard_poll_us.store(Some(now_us));
        self.guard_alarmed.store(false);
    }

    /// Record that a heartbeat from a monitored node arrived at `now_us`
    pub fn note_consumed_heartbeat(&self, hb: &Heartbeat, now_us: u64) {
        let monitored = self.monitored.read().unwrap();
        if let Some(node) = monitored.iter().find(|n| n.node_id == hb.node) {
            node.last_seen_us.store(Some(now_us));
            node.alarmed.store(false);
        }
    }

    /// Check both liveness mechanisms for timeouts as of `now_us`
    ///
    /// Should be called periodically (e.g. from the same tick that drives the dispatcher's
    /// timers). A monitored node is considered timed out once two consecutive expected
    /// heartbeats have been missed; node guarding times out once `guard_time * life_time_factor`
    /// elapses since the last guard poll. Each outage is reported exactly once: a fresh guard
    /// poll or consumed heartbeat re-arms its event for the next outage.
    pub fn check_timeouts(&self, now_us: u64) -> Vec<LifeGuardingEvent> {
        let mut events = Vec::new();

        if let Some(life_time_us) = self.life_time_us() {
            if let Some(last) = self.last_guard_poll_us.load() {
                if now_us.saturating_sub(last) > life_time_us
                    && !self.guard_alarmed.fetch_update(|_| Some(true)).unwrap_or(false)
                {
                    events.push(LifeGuardingEvent::GuardTimeout);
                }
            }
        }

        for node in self.monitored.read().unwrap().iter() {
            if let Some(last) = node.last_seen_us.load() {
                let timeout_us = 2 * node.interval_ms as u64 * 1000;
                if now_us.saturating_sub(last) > timeout_us
                    && !node.alarmed.fetch_update(|_| Some(true)).unwrap_or(false)
                {
                    events.push(LifeGuardingEvent::ConsumerTimeout {
                        node_id: node.node_id,
                    });
                }
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conop_common::messages::{CanId, NMT_CMD_ID};

    fn nmt_frame(cs: u8, node: u8) -> CanMessage {
        CanMessage::new(NMT_CMD_ID, &[cs, node])
    }

    #[test]
    fn boot_transitions_to_pre_operational() {
        let nmt = NmtService::new(5);
        assert_eq!(nmt.state(), NmtState::Bootup);
        let msg = nmt.boot();
        assert_eq!(nmt.state(), NmtState::PreOperational);
        assert_eq!(msg.data()[0], NmtState::Bootup as u8);
    }

    #[test]
    fn start_command_for_this_node_transitions() {
        let nmt = NmtService::new(5);
        let action = nmt.handle_command(&nmt_frame(1, 5)).unwrap();
        assert_eq!(action, NmtAction::StateChanged(NmtState::Operational));
        assert_eq!(nmt.state(), NmtState::Operational);
    }

    #[test]
    fn command_for_other_node_is_ignored() {
        let nmt = NmtService::new(5);
        assert!(nmt.handle_command(&nmt_frame(1, 6)).is_none());
        assert_eq!(nmt.state(), NmtState::Bootup);
    }

    #[test]
    fn broadcast_command_applies() {
        let nmt = NmtService::new(5);
        let action = nmt.handle_command(&nmt_frame(2, 0)).unwrap();
        assert_eq!(action, NmtAction::StateChanged(NmtState::Stopped));
    }

    #[test]
    fn reset_app_and_reset_comm_return_distinct_actions() {
        let nmt = NmtService::new(5);
        assert_eq!(nmt.handle_command(&nmt_frame(129, 5)), Some(NmtAction::ResetApp));
        assert_eq!(nmt.handle_command(&nmt_frame(130, 5)), Some(NmtAction::ResetComm));
    }

    #[test]
    fn non_nmt_frame_is_ignored() {
        let nmt = NmtService::new(5);
        assert!(nmt.handle_command(&CanMessage::new(CanId::Std(0x123), &[1, 2])).is_none());
    }

    #[test]
    fn heartbeat_toggle_flips_each_call() {
        let nmt = NmtService::new(5);
        nmt.set_heartbeat_period_ms(100);
        assert!(nmt.heartbeat_enabled());
        assert_eq!(nmt.heartbeat_interval_us(), Some(100_000));

        let first = nmt.produce_heartbeat();
        let second = nmt.produce_heartbeat();
        assert_ne!(first.data()[0] & 0x80, second.data()[0] & 0x80);
    }

    #[test]
    fn heartbeat_disabled_by_default() {
        let nmt = NmtService::new(5);
        assert!(!nmt.heartbeat_enabled());
        assert_eq!(nmt.heartbeat_interval_us(), None);
    }

    #[test]
    fn consumer_heartbeat_timeout_after_two_missed_intervals() {
        let nmt = NmtService::new(1);
        nmt.set_consumer_heartbeat(&[(9, 100)]);
        nmt.note_consumed_heartbeat(
            &Heartbeat {
                node: 9,
                toggle: false,
                state: NmtState::Operational,
            },
            0,
        );

        assert!(nmt.check_timeouts(150_000).is_empty());
        let events = nmt.check_timeouts(250_000);
        assert_eq!(events, vec![LifeGuardingEvent::ConsumerTimeout { node_id: 9 }]);
    }

    #[test]
    fn guard_timeout_fires_once_life_time_elapses() {
        let nmt = NmtService::new(1);
        nmt.set_guarding(100, 3);
        nmt.note_guard_poll(0);

        assert!(nmt.check_timeouts(250_000).is_empty());
        let events = nmt.check_timeouts(400_000);
        assert_eq!(events, vec![LifeGuardingEvent::GuardTimeout]);
    }

    #[test]
    fn force_state_bypasses_command_path() {
        let nmt = NmtService::new(1);
        nmt.force_state(NmtState::Stopped);
        assert_eq!(nmt.state(), NmtState::Stopped);
    }

    #[test]
    fn consumer_heartbeat_timeout_fires_exactly_once_per_outage() {
        let nmt = NmtService::new(1);
        nmt.set_consumer_heartbeat(&[(9, 100)]);
        nmt.note_consumed_heartbeat(
            &Heartbeat { node: 9, toggle: false, state: NmtState::Operational },
            0,
        );

        assert_eq!(
            nmt.check_timeouts(250_000),
            vec![LifeGuardingEvent::ConsumerTimeout { node_id: 9 }]
        );
        // Still quiet: must not re-fire for the same outage.
        assert!(nmt.check_timeouts(300_000).is_empty());
        assert!(nmt.check_timeouts(1_000_000).is_empty());

        // A fresh heartbeat re-arms the alarm for the next outage.
        nmt.note_consumed_heartbeat(
            &Heartbeat { node: 9, toggle: true, state: NmtState::Operational },
            1_000_000,
        );
        assert!(nmt.check_timeouts(1_150_000).is_empty());
        assert_eq!(
            nmt.check_timeouts(1_250_000),
            vec![LifeGuardingEvent::ConsumerTimeout { node_id: 9 }]
        );
    }

    #[test]
    fn guarding_disabled_when_either_parameter_zero() {
        let nmt = NmtService::new(1);
        nmt.set_guarding(0, 3);
        nmt.note_guard_poll(0);
        assert!(nmt.check_timeouts(u64::MAX).is_empty());
    }
}
