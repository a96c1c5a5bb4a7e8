//! TIME and EMCY producer/consumer (C7)
//!
//! Both are thin bindings between a communication parameter object (0x1012 for TIME, 0x1014/
//! 0x1015 for EMCY) and a pair of dispatcher registrations: TIME needs a receiver when
//! consuming and a timer when producing; EMCY needs a receiver to dispatch incoming emergencies
//! to per-producer callbacks and an inhibit-time gate on the outgoing side.

use std::collections::VecDeque;
use std::sync::RwLock;

use conop_common::{
    messages::{CanId, CanMessage, EmcyMessage, TimeMessage, TimeStamp},
    AtomicCell,
};

/// Bit 31 of object 0x1012: this node produces TIME messages
const TIME_PRODUCER_BIT: u32 = 1 << 31;
/// Bit 30 of object 0x1012: this node consumes TIME messages
const TIME_CONSUMER_BIT: u32 = 1 << 30;
/// Bit 29 of object 0x1012: the configured COB-ID is a 29-bit extended identifier
const TIME_EXTENDED_BIT: u32 = 1 << 29;

fn decode_time_cob_id(raw: u32) -> CanId {
    let id = raw & 0x1FFF_FFFF;
    if raw & TIME_EXTENDED_BIT != 0 {
        CanId::Extended(id)
    } else {
        CanId::Std(id as u16)
    }
}

/// TIME producer/consumer bound to object 0x1012
pub struct TimeService {
    /// The raw value of object 0x1012
    cob_id_word: AtomicCell<u32>,
}

impl std::fmt::Debug for TimeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeService")
            .field("cob_id_word", &format_args!("0x{:08X}", self.cob_id_word.load()))
            .finish()
    }
}

impl TimeService {
    /// Create a new service, disabled until [`Self::set_cob_id_word`] is called with the
    /// configured object 0x1012 value
    pub fn new() -> Self {
        Self {
            cob_id_word: AtomicCell::new(0),
        }
    }

    /// Update the raw value of object 0x1012
    pub fn set_cob_id_word(&self, word: u32) {
        self.cob_id_word.store(word);
    }

    /// True if production is enabled
    pub fn producer_enabled(&self) -> bool {
        self.cob_id_word.load() & TIME_PRODUCER_BIT != 0
    }

    /// True if consumption is enabled
    pub fn consumer_enabled(&self) -> bool {
        self.cob_id_word.load() & TIME_CONSUMER_BIT != 0
    }

    /// The COB-ID TIME messages are sent/received on
    pub fn cob_id(&self) -> CanId {
        decode_time_cob_id(self.cob_id_word.load())
    }

    /// Build an outgoing TIME frame for the given time stamp
    pub fn produce(&self, stamp: TimeStamp) -> CanMessage {
        TimeMessage { stamp }.to_can_message(self.cob_id())
    }

    /// Decode an incoming frame as a TIME message, if consumption is enabled and the frame
    /// matches the configured COB-ID
    pub fn consume(&self, msg: &CanMessage) -> Option<TimeStamp> {
        if !self.consumer_enabled() || msg.id() != self.cob_id() {
            return None;
        }
        TimeMessage::from_can_message(msg).map(|t| t.stamp)
    }
}

impl Default for TimeService {
    fn default() -> Self {
        Self::new()
    }
}

/// EMCY producer/consumer bound to objects 0x1014 (COB-ID) and 0x1015 (inhibit time)
///
/// Outgoing emergencies queue rather than send immediately, so a burst of faults can't exceed
/// the configured inhibit-time rate; [`Self::poll_outgoing`] drains one frame at a time, no more
/// often than the inhibit interval allows.
pub struct EmcyService {
    node_id: u8,
    cob_id_word: AtomicCell<u32>,
    /// Object 0x1015, in 100-microsecond units; zero means no rate limiting
    inhibit_time_100us: AtomicCell<u16>,
    last_sent_us: AtomicCell<Option<u64>>,
    queue: RwLock<VecDeque<EmcyMessage>>,
}

impl std::fmt::Debug for EmcyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmcyService")
            .field("node_id", &self.node_id)
            .field("queued", &self.queue.read().unwrap().len())
            .finish()
    }
}

impl EmcyService {
    /// Create a new service for the given node ID
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            cob_id_word: AtomicCell::new(0),
            inhibit_time_100us: AtomicCell::new(0),
            last_sent_us: AtomicCell::new(None),
            queue: RwLock::new(VecDeque::new()),
        }
    }

    /// Update the raw value of object 0x1014
    pub fn set_cob_id_word(&self, word: u32) {
        self.cob_id_word.store(word);
    }

    /// Update object 0x1015 (inhibit time, in 100-microsecond units)
    pub fn set_inhibit_time_100us(&self, value: u16) {
        self.inhibit_time_100us.store(value);
    }

    /// True if this node is configured to produce emergencies (the COB-ID's valid bit, bit 31,
    /// is clear; CiA 301 sets bit 31 to *disable* the producer)
    pub fn producer_enabled(&self) -> bool {
        self.cob_id_word.load() & (1 << 31) == 0
    }

    /// Queue an emergency for transmission, subject to inhibit-time rate limiting
    pub fn queue(&self, error_code: u16, error_register: u8, manufacturer_data: [u8; 5]) {
        if !self.producer_enabled() {
            return;
        }
        self.queue.write().unwrap().push_back(EmcyMessage {
            node: self.node_id,
            error_code,
            error_register,
            manufacturer_data,
        });
    }

    /// Pop and return the next queued emergency frame, if the inhibit interval has elapsed
    /// since the last one was sent
    ///
    /// The caller is responsible for actually sending the returned frame and, if it wants
    /// further drains, calling this again on a subsequent tick.
    pub fn poll_outgoing(&self, now_us: u64) -> Option<CanMessage> {
        let inhibit_us = self.inhibit_time_100us.load() as u64 * 100;
        if let Some(last) = self.last_sent_us.load() {
            if now_us.saturating_sub(last) < inhibit_us {
                return None;
            }
        }
        let emcy = self.queue.write().unwrap().pop_front()?;
        self.last_sent_us.store(Some(now_us));
        Some(emcy.to_can_message())
    }

    /// Decode an incoming EMCY frame from the given producer node ID
    pub fn decode_incoming(node: u8, msg: &CanMessage) -> Option<EmcyMessage> {
        EmcyMessage::from_can_message(node, msg).ok()
    }

    /// The EMCY COB-ID a receiver for incoming emergencies from `node` should be registered for
    pub fn incoming_cob_id(node: u8) -> CanId {
        CanId::Std(0x080 | node as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_service_disabled_by_default() {
        let svc = TimeService::new();
        assert!(!svc.producer_enabled());
        assert!(!svc.consumer_enabled());
    }

    #[test]
    fn time_service_round_trips_through_cob_id() {
        let svc = TimeService::new();
        svc.set_cob_id_word(TIME_PRODUCER_BIT | TIME_CONSUMER_BIT | 0x100);
        assert!(svc.producer_enabled());
        assert!(svc.consumer_enabled());

        let stamp = TimeStamp { ms: 1234, days: 5 };
        let msg = svc.produce(stamp);
        let decoded = svc.consume(&msg).unwrap();
        assert_eq!(decoded.ms, 1234);
        assert_eq!(decoded.days, 5);
    }

    #[test]
    fn time_consumer_ignores_other_cob_ids() {
        let svc = TimeService::new();
        svc.set_cob_id_word(TIME_CONSUMER_BIT | 0x100);
        let other = TimeMessage {
            stamp: TimeStamp { ms: 0, days: 0 },
        }
        .to_can_message(CanId::Std(0x101));
        assert!(svc.consume(&other).is_none());
    }

    #[test]
    fn emcy_producer_enabled_by_default() {
        let svc = EmcyService::new(5);
        assert!(svc.producer_enabled());
    }

    #[test]
    fn emcy_producer_disabled_by_valid_bit() {
        let svc = EmcyService::new(5);
        svc.set_cob_id_word(1 << 31);
        svc.queue(0x1000, 0x01, [0; 5]);
        assert!(svc.poll_outgoing(0).is_none());
    }

    #[test]
    fn emcy_inhibit_time_rate_limits_sends() {
        let svc = EmcyService::new(5);
        svc.set_inhibit_time_100us(10); // 1ms
        svc.queue(0x1000, 0x01, [0; 5]);
        svc.queue(0x2000, 0x01, [0; 5]);

        assert!(svc.poll_outgoing(0).is_some());
        assert!(svc.poll_outgoing(500).is_none());
        assert!(svc.poll_outgoing(1000).is_some());
    }

    #[test]
    fn emcy_round_trips_incoming() {
        let emcy = EmcyMessage {
            node: 9,
            error_code: 0x2000,
            error_register: 0x02,
            manufacturer_data: [1, 2, 3, 4, 5],
        };
        let msg = emcy.to_can_message();
        let decoded = EmcyService::decode_incoming(9, &msg).unwrap();
        assert_eq!(decoded.error_code, 0x2000);
    }
}
