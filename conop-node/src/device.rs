//! Wires the object dictionary, SDO server, NMT lifecycle, and TIME/EMCY services to a
//! [`Dispatcher`], and owns the standard CiA 301 communication profile objects.
//!
//! A single receiver, registered with `id = 0, mask = 0`, catches every inbound frame and
//! drops it into a shared mailbox; [`Device::process`] drains that mailbox and classifies
//! each frame with [`CanopenMessage::try_from`] rather than maintaining a COB-ID-keyed
//! registration per service. That sidesteps re-registering receivers whenever a
//! communication parameter object (1005/1012/1014/1200+) is reconfigured: classification
//! reads each service's live COB-ID on every frame instead of a snapshot taken at
//! registration time. Timers are handled the same way — [`Device::process`] drives
//! [`SdoServer::poll`], heartbeat production, and [`NmtService::check_timeouts`] directly
//! off the caller-supplied clock rather than arming [`Dispatcher`] timers, since a timer
//! callback has no way to reach back into the dispatcher that owns it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use conop_common::{
    constants::{emcy_codes, object_ids},
    identity::Identity,
    messages::{CanMessage, CanopenMessage, EmcyMessage, NmtState, TimeStamp},
    objects::{ObjectCode, SubInfo},
    sdo::AbortCode,
    traits::CanSender,
    AtomicCell,
};
use defmt_or_log::{debug, trace, warn};

use crate::dispatcher::Dispatcher;
use crate::nmt::{LifeGuardingEvent, NmtAction, NmtService};
use crate::object_dict::{DynamicObject, ObjectDictionary};
use crate::sdo_server::{SdoFrame, SdoServer};
use crate::services::{EmcyService, TimeService};

/// Object 0x1029 sub 1: what to do with the NMT state when an error (e.g. a life-guarding
/// timeout) occurs. CiA 301 defines only "no state change"; the other values are reserved
/// by CiA 301 but some stacks use them to force Pre-operational/Stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorBehavior {
    NoChange,
    PreOperational,
    Stopped,
}

impl From<u8> for ErrorBehavior {
    fn from(value: u8) -> Self {
        match value {
            1 => ErrorBehavior::PreOperational,
            2 => ErrorBehavior::Stopped,
            _ => ErrorBehavior::NoChange,
        }
    }
}

/// A structured event surfaced through the optional tracing hook (see module docs and
/// Observability). Emitted in addition to, not instead of, `log`/`defmt`
/// statements.
#[derive(Clone, Debug)]
pub enum Event {
    /// The node finished its boot-up sequence and entered Pre-operational
    Booted,
    /// An NMT node-control command produced a state transition
    NmtTransition(NmtState),
    /// An SDO transfer completed successfully against the named object
    SdoCompleted {
        /// The object index written
        index: u16,
        /// The sub index written
        sub: u8,
    },
    /// An SDO transfer aborted
    SdoAborted {
        /// The object index, if known (0 if the abort predates addressing, e.g. a malformed
        /// frame)
        index: u16,
        /// The sub index, if known
        sub: u8,
        /// The reason given to the peer
        abort_code: AbortCode,
    },
    /// A life-guarding or heartbeat-consumer timeout fired
    LifeGuarding(LifeGuardingEvent),
}

type TracingHook = dyn Fn(Event) + Send + Sync;
type EmcyListener = dyn Fn(EmcyMessage) + Send;
type TimeListener = dyn Fn(TimeStamp) + Send;

/// A CANopen device: the object dictionary plus every communication-profile service bound
/// to it, driven by a single [`Dispatcher`].
///
/// `Device` owns the objects in the 0x1000–0x1029 communication profile range; application
/// code inserts its own (manufacturer- or profile-specific) objects into
/// [`Device::dict`] directly.
#[allow(missing_debug_implementations)]
pub struct Device<S: CanSender> {
    node_id: u8,
    dict: Arc<ObjectDictionary>,
    dispatcher: Dispatcher<S>,
    nmt: Arc<NmtService>,
    sdo: SdoServer,
    time: Arc<TimeService>,
    emcy: Arc<EmcyService>,
    error_register: Arc<AtomicCell<u8>>,
    error_behavior: Arc<AtomicCell<u8>>,
    mailbox: Arc<Mutex<VecDeque<CanMessage>>>,
    emcy_listeners: Arc<Mutex<BTreeMap<u8, Box<EmcyListener>>>>,
    time_listeners: Arc<Mutex<Vec<Box<TimeListener>>>>,
    last_heartbeat_us: Option<u64>,
    tracing_hook: Option<Arc<TracingHook>>,
}

impl<S: CanSender> Device<S> {
    /// Build a device for `node_id`, registering the standard CiA 301 communication
    /// profile objects (device type, error register, identity, heartbeat/guarding,
    /// consumer heartbeat table, SDO server parameters, TIME/EMCY COB-IDs, error
    /// behavior) into a fresh [`ObjectDictionary`].
    ///
    /// `device_type` is the raw value of object 0x1000; `identity` populates object
    /// 0x1018. The node starts in [`NmtState::Bootup`]; call [`Self::start`] once the
    /// caller is ready to bring it onto the bus.
    pub fn new(node_id: u8, sender: S, device_type: u32, identity: Identity) -> Self {
        let dict = Arc::new(ObjectDictionary::new());
        let nmt = Arc::new(NmtService::new(node_id));
        let time = Arc::new(TimeService::new());
        let emcy = Arc::new(EmcyService::new(node_id));
        let error_register = Arc::new(AtomicCell::new(0u8));
        let error_behavior = Arc::new(AtomicCell::new(0u8));

        register_comm_profile_objects(
            &dict,
            device_type,
            identity,
            &nmt,
            &time,
            &emcy,
            &error_register,
            &error_behavior,
        );

        let mailbox: Arc<Mutex<VecDeque<CanMessage>>> = Arc::new(Mutex::new(VecDeque::new()));
        let mut dispatcher = Dispatcher::new(sender);
        let mbox = mailbox.clone();
        dispatcher.register_receiver(
            0,
            0,
            Box::new(move |msg| mbox.lock().unwrap().push_back(msg)),
        );

        Self {
            node_id,
            dict,
            dispatcher,
            nmt,
            sdo: SdoServer::new(),
            time,
            emcy,
            error_register,
            error_behavior,
            mailbox,
            emcy_listeners: Arc::new(Mutex::new(BTreeMap::new())),
            time_listeners: Arc::new(Mutex::new(Vec::new())),
            last_heartbeat_us: None,
            tracing_hook: None,
        }
    }

    /// Attach (or replace) the optional tracing hook
    pub fn set_tracing_hook(&mut self, hook: impl Fn(Event) + Send + Sync + 'static) {
        self.tracing_hook = Some(Arc::new(hook));
    }

    fn emit(&self, event: Event) {
        if let Some(hook) = &self.tracing_hook {
            hook(event);
        }
    }

    /// The object dictionary, for inserting application-specific objects and reading
    /// values outside of SDO traffic
    pub fn dict(&self) -> &Arc<ObjectDictionary> {
        &self.dict
    }

    /// Apply a sequence of configuration records produced by an external EDS/DCF loader
    /// through the dictionary's download path.
    /// Call before [`Self::start`] to preload objects before the node announces itself.
    pub fn apply_config(&self, records: &[crate::config::ConfigRecord]) -> Result<(), crate::error::ConfigError> {
        crate::config::apply_config(&self.dict, records)
    }

    /// The node's configured ID
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// The current NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    /// Register a callback invoked whenever an emergency arrives from `producer_node`
    ///
    /// Incoming emergencies dispatch to per-producer-node callbacks rather
    /// than a single catch-all, so a monitoring application can tell at a glance which
    /// peer raised a fault.
    pub fn register_emcy_listener(&self, producer_node: u8, callback: impl Fn(EmcyMessage) + Send + 'static) {
        self.emcy_listeners.lock().unwrap().insert(producer_node, Box::new(callback));
    }

    /// Register a callback invoked whenever a TIME frame is consumed (object 0x1012's
    /// consumer flag is set and the frame's COB-ID matches the configured one)
    ///
    /// Unlike EMCY, TIME has no producer-node field to key on, so every registered
    /// callback runs on every consumed frame.
    pub fn register_time_listener(&self, callback: impl Fn(TimeStamp) + Send + 'static) {
        self.time_listeners.lock().unwrap().push(Box::new(callback));
    }

    /// Raise a local emergency: update the error register and queue an EMCY for
    /// transmission (subject to the inhibit-time rate limit configured via object 0x1015)
    pub fn raise_error(&self, error_code: u16, manufacturer_data: [u8; 5]) {
        self.error_register.store(self.error_register.load() | 0x01);
        self.emcy.queue(error_code, self.error_register.load(), manufacturer_data);
    }

    /// Clear the error register and queue the "error reset" emergency (code 0x0000)
    pub fn clear_error(&self) {
        self.error_register.store(0);
        self.emcy.queue(emcy_codes::NO_ERROR, 0, [0; 5]);
    }

    /// Emit the boot-up message and enter Pre-operational. Call once, after the object
    /// dictionary has been fully populated (including any application objects).
    pub fn start(&mut self) -> Result<(), conop_common::CanError> {
        let msg = self.nmt.boot();
        self.dispatcher.send(msg).map_err(|_| conop_common::CanError::SendFailed)?;
        self.emit(Event::Booted);
        Ok(())
    }

    /// Feed one inbound CAN frame to the device
    ///
    /// Pushes the frame through the catch-all receiver into the mailbox; call
    /// [`Self::process`] afterward (or on every tick regardless) to act on it.
    pub fn receive(&mut self, msg: CanMessage) {
        self.dispatcher.dispatch(msg);
    }

    /// Drain the mailbox and drive every time-based service, using `now_us` as the
    /// current monotonic time in microseconds
    ///
    /// This is the single entry point that performs protocol logic: NMT command
    /// handling, SDO request/timeout processing, TIME/EMCY consumption, heartbeat
    /// production, and life-guarding timeout detection.
    pub fn process(&mut self, now_us: u64) {
        let pending: Vec<CanMessage> = {
            let mut mbox = self.mailbox.lock().unwrap();
            mbox.drain(..).collect()
        };
        for msg in pending {
            self.handle_frame(msg, now_us);
        }

        if let Some(resp) = self.sdo.poll(now_us) {
            let _ = self.dispatcher.send(resp.to_can_message(sdo_response_id(self.node_id)));
        }

        if let Some(interval_us) = self.nmt.heartbeat_interval_us() {
            let due = self.last_heartbeat_us.is_none_or(|last| now_us.saturating_sub(last) >= interval_us);
            if due {
                let hb = self.nmt.produce_heartbeat();
                let _ = self.dispatcher.send(hb);
                self.last_heartbeat_us = Some(now_us);
            }
        }

        for event in self.nmt.check_timeouts(now_us) {
            self.handle_life_guarding_event(event);
        }

        while let Some(frame) = self.emcy.poll_outgoing(now_us) {
            let _ = self.dispatcher.send(frame);
        }
    }

    fn handle_life_guarding_event(&mut self, event: LifeGuardingEvent) {
        warn!("life-guarding event");
        self.raise_error(emcy_codes::HEARTBEAT_OR_GUARDING, [0; 5]);
        match ErrorBehavior::from(self.error_behavior.load()) {
            ErrorBehavior::NoChange => {}
            ErrorBehavior::PreOperational => self.nmt.force_state(NmtState::PreOperational),
            ErrorBehavior::Stopped => self.nmt.force_state(NmtState::Stopped),
        }
        self.emit(Event::LifeGuarding(event));
    }

    fn handle_frame(&mut self, msg: CanMessage, now_us: u64) {
        let is_guard_rtr = msg.is_rtr() && msg.id().raw() == 0x700 | self.node_id as u32;
        if is_guard_rtr {
            self.nmt.note_guard_poll(now_us);
        }

        let parsed = match CanopenMessage::try_from(msg) {
            Ok(parsed) => parsed,
            Err(_) => return,
        };

        match parsed {
            CanopenMessage::NmtCommand(_) => {
                if let Some(action) = self.nmt.handle_command(&msg) {
                    self.on_nmt_action(action);
                }
            }
            CanopenMessage::Heartbeat(hb) => {
                self.nmt.note_consumed_heartbeat(&hb, now_us);
            }
            CanopenMessage::Sync(_) => {}
            CanopenMessage::Time(time_msg) => {
                if self.time.consumer_enabled() && self.time.cob_id() == msg.id() {
                    trace!("consumed TIME frame");
                    for cb in self.time_listeners.lock().unwrap().iter() {
                        cb(time_msg.stamp);
                    }
                }
            }
            CanopenMessage::Emcy(emcy_msg) => {
                if let Some(cb) = self.emcy_listeners.lock().unwrap().get(&emcy_msg.node) {
                    cb(emcy_msg);
                }
            }
            CanopenMessage::SdoRequest(_) => {
                self.handle_sdo_request(msg.data(), now_us);
            }
            CanopenMessage::SdoResponse(_) => {}
        }
    }

    fn on_nmt_action(&mut self, action: NmtAction) {
        match action {
            NmtAction::StateChanged(state) => {
                debug!("nmt state changed");
                self.emit(Event::NmtTransition(state));
            }
            NmtAction::ResetApp | NmtAction::ResetComm => {
                self.last_heartbeat_us = None;
                self.emit(Event::NmtTransition(NmtState::Bootup));
            }
        }
    }

    fn handle_sdo_request(&mut self, frame: &[u8], now_us: u64) {
        if self.nmt.state() == NmtState::Stopped {
            let (index, sub) = sdo_addressing(frame);
            let abort = AbortCode::CantStoreDeviceState;
            self.emit(Event::SdoAborted { index, sub, abort_code: abort });
            let resp = conop_common::sdo::SdoResponse::abort(index, sub, abort);
            let _ = self.dispatcher.send(resp.to_can_message(sdo_response_id(self.node_id)));
            return;
        }

        let outcome = self.sdo.handle_frame(frame, &self.dict, self.nmt.state(), now_us);
        for frame in &outcome.frames {
            match frame {
                SdoFrame::Response(resp) => {
                    if let conop_common::sdo::SdoResponse::Abort { index, sub, abort_code } = resp {
                        if let Ok(code) = AbortCode::try_from(*abort_code) {
                            self.emit(Event::SdoAborted { index: *index, sub: *sub, abort_code: code });
                        }
                    }
                    let _ = self.dispatcher.send(resp.to_can_message(sdo_response_id(self.node_id)));
                }
                SdoFrame::Block(segment) => {
                    let _ = self.dispatcher.send(segment.to_can_message(sdo_response_id(self.node_id)));
                }
            }
        }
        if let Some(obj) = outcome.updated_object {
            self.emit(Event::SdoCompleted { index: obj.index, sub: obj.sub });
        }
    }
}

fn sdo_response_id(node_id: u8) -> conop_common::messages::CanId {
    conop_common::messages::CanId::Std(0x580 | node_id as u16)
}

/// Pull (index, sub) out of a raw SDO request frame, best-effort, for error reporting when
/// the request never reaches the server's own addressing logic (e.g. the Stopped-state
/// blanket rejection)
fn sdo_addressing(frame: &[u8]) -> (u16, u8) {
    if frame.len() < 4 {
        return (0, 0);
    }
    let index = u16::from_le_bytes([frame[1], frame[2]]);
    (index, frame[3])
}

#[allow(clippy::too_many_arguments)]
fn register_comm_profile_objects(
    dict: &ObjectDictionary,
    device_type: u32,
    identity: Identity,
    nmt: &Arc<NmtService>,
    time: &Arc<TimeService>,
    emcy: &Arc<EmcyService>,
    error_register: &Arc<AtomicCell<u8>>,
    error_behavior: &Arc<AtomicCell<u8>>,
) {
    // 0x1000: Device type
    let obj = Arc::new(DynamicObject::new(ObjectCode::Var));
    obj.insert_sub(0, SubInfo::new_u32().ro_access(), &device_type.to_le_bytes()).unwrap();
    dict.insert_object(object_ids::DEVICE_TYPE, obj).unwrap();

    // 0x1001: Error register, read-only to SDO clients but freely updatable internally via
    // a read indication that overwrites the outgoing buffer from the live error register
    let obj = Arc::new(DynamicObject::new(ObjectCode::Var));
    obj.insert_sub(0, SubInfo::new_u8().ro_access(), &[0]).unwrap();
    {
        let error_register = error_register.clone();
        obj.register_read_indication(0, move |_sub, buf| {
            if !buf.is_empty() {
                buf[0] = error_register.load();
            }
        });
    }
    dict.insert_object(object_ids::ERROR_REGISTER, obj).unwrap();

    // 0x1008/0x1009/0x100A: device name / hardware / software version, empty by default;
    // applications overwrite these before calling Device::start
    for index in [
        object_ids::DEVICE_NAME,
        object_ids::HARDWARE_VERSION,
        object_ids::SOFTWARE_VERSION,
    ] {
        let obj = Arc::new(DynamicObject::new(ObjectCode::Var));
        obj.insert_sub(0, SubInfo::new_visibile_str(32).ro_access(), &[]).unwrap();
        dict.insert_object(index, obj).unwrap();
    }

    // 0x100C/0x100D: guard time / life time factor (legacy node guarding)
    let guard_time = Arc::new(DynamicObject::new(ObjectCode::Var));
    guard_time.insert_sub(0, SubInfo::new_u16().rw_access(), &0u16.to_le_bytes()).unwrap();
    {
        let nmt = nmt.clone();
        let life_time_factor: Arc<AtomicCell<u8>> = Arc::new(AtomicCell::new(0));
        let ltf = life_time_factor.clone();
        guard_time.register_write_indication(0, move |_sub, data| {
            let guard_ms = u16::from_le_bytes([data[0], data[1]]);
            nmt.set_guarding(guard_ms, ltf.load());
            Ok(())
        });
        dict.insert_object(object_ids::GUARD_TIME, guard_time).unwrap();

        let life_time = Arc::new(DynamicObject::new(ObjectCode::Var));
        life_time.insert_sub(0, SubInfo::new_u8().rw_access(), &[0]).unwrap();
        let nmt2 = nmt.clone();
        life_time.register_write_indication(0, move |_sub, data| {
            life_time_factor.store(data[0]);
            // Guard time is re-read from its own object's current value on the next write;
            // CiA 301 leaves the effective-order question to the device, and this core
            // simply applies whichever of the two is written second.
            nmt2.set_guarding(0, data[0]);
            Ok(())
        });
        dict.insert_object(object_ids::LIFE_TIME_FACTOR, life_time).unwrap();
    }

    // 0x1010/0x1011: save/restore commands are non-goals (no persistence backend); expose
    // them as write-only u32s that simply discard the magic value rather than omitting the
    // objects a scanner expects to find.
    for index in [object_ids::SAVE_OBJECTS, object_ids::RESTORE_DEFAULTS] {
        let obj = Arc::new(DynamicObject::new(ObjectCode::Array));
        obj.insert_sub(1, SubInfo::new_u32().wo_access(), &0u32.to_le_bytes()).unwrap();
        dict.insert_object(index, obj).unwrap();
    }

    // 0x1012: COB-ID TIME
    let obj = Arc::new(DynamicObject::new(ObjectCode::Var));
    obj.insert_sub(0, SubInfo::new_u32().rw_access(), &0u32.to_le_bytes()).unwrap();
    {
        let time = time.clone();
        obj.register_write_indication(0, move |_sub, data| {
            time.set_cob_id_word(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
            Ok(())
        });
    }
    dict.insert_object(object_ids::COB_ID_TIME, obj).unwrap();

    // 0x1014: COB-ID EMCY
    let obj = Arc::new(DynamicObject::new(ObjectCode::Var));
    obj.insert_sub(0, SubInfo::new_u32().rw_access(), &0u32.to_le_bytes()).unwrap();
    {
        let emcy = emcy.clone();
        obj.register_write_indication(0, move |_sub, data| {
            emcy.set_cob_id_word(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
            Ok(())
        });
    }
    dict.insert_object(object_ids::COB_ID_EMCY, obj).unwrap();

    // 0x1015: inhibit time EMCY, 100us units
    let obj = Arc::new(DynamicObject::new(ObjectCode::Var));
    obj.insert_sub(0, SubInfo::new_u16().rw_access(), &0u16.to_le_bytes()).unwrap();
    {
        let emcy = emcy.clone();
        obj.register_write_indication(0, move |_sub, data| {
            emcy.set_inhibit_time_100us(u16::from_le_bytes([data[0], data[1]]));
            Ok(())
        });
    }
    dict.insert_object(object_ids::INHIBIT_TIME_EMCY, obj).unwrap();

    // 0x1016: consumer heartbeat time, array of u32 (bits 24-16 node id, bits 15-0 interval)
    let obj = Arc::new(DynamicObject::new(ObjectCode::Array));
    const MAX_MONITORED: u8 = 16;
    for sub in 1..=MAX_MONITORED {
        obj.insert_sub(sub, SubInfo::new_u32().rw_access(), &0u32.to_le_bytes()).unwrap();
    }
    {
        let nmt = nmt.clone();
        let entries: Arc<Mutex<[(u8, u16); MAX_MONITORED as usize]>> =
            Arc::new(Mutex::new([(0, 0); MAX_MONITORED as usize]));
        for sub in 1..=MAX_MONITORED {
            let nmt = nmt.clone();
            let entries = entries.clone();
            obj.register_write_indication(sub, move |_sub, data| {
                let word = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                let node_id = ((word >> 16) & 0x7f) as u8;
                let interval_ms = (word & 0xffff) as u16;
                entries.lock().unwrap()[(sub - 1) as usize] = (node_id, interval_ms);
                let snapshot: Vec<(u8, u16)> = entries.lock().unwrap().to_vec();
                nmt.set_consumer_heartbeat(&snapshot);
                Ok(())
            });
        }
    }
    dict.insert_object(object_ids::CONSUMER_HEARTBEAT_TIME, obj).unwrap();

    // 0x1017: heartbeat producer time, ms
    let obj = Arc::new(DynamicObject::new(ObjectCode::Var));
    obj.insert_sub(0, SubInfo::new_u16().rw_access(), &0u16.to_le_bytes()).unwrap();
    {
        let nmt = nmt.clone();
        obj.register_write_indication(0, move |_sub, data| {
            nmt.set_heartbeat_period_ms(u16::from_le_bytes([data[0], data[1]]));
            Ok(())
        });
    }
    dict.insert_object(object_ids::HEARTBEAT_PRODUCER_TIME, obj).unwrap();

    // 0x1018: Identity, a 4-member record
    let obj = Arc::new(DynamicObject::new(ObjectCode::Record));
    obj.insert_sub(1, SubInfo::new_u32().ro_access(), &identity.vendor_id.to_le_bytes()).unwrap();
    obj.insert_sub(2, SubInfo::new_u32().ro_access(), &identity.product_code.to_le_bytes()).unwrap();
    obj.insert_sub(3, SubInfo::new_u32().ro_access(), &identity.revision_number.to_le_bytes()).unwrap();
    obj.insert_sub(4, SubInfo::new_u32().ro_access(), &identity.serial_number.to_le_bytes()).unwrap();
    dict.insert_object(object_ids::IDENTITY, obj).unwrap();

    // 0x1029: error behavior, sub 1 (communication error) gates forced NMT transitions on
    // a life-guarding timeout
    let obj = Arc::new(DynamicObject::new(ObjectCode::Array));
    obj.insert_sub(1, SubInfo::new_u8().rw_access(), &[0]).unwrap();
    {
        let error_behavior = error_behavior.clone();
        obj.register_write_indication(1, move |_sub, data| {
            error_behavior.store(data[0]);
            Ok(())
        });
    }
    dict.insert_object(object_ids::ERROR_BEHAVIOR, obj).unwrap();

    // 0x1200: first SDO server parameter (client->server, server->client COB-IDs); this
    // core runs a single SDO server channel at the node's own standard COB-IDs, so the
    // object is exposed read-only for scanner compatibility rather than wired to reshape
    // the dispatcher's registrations.
    let obj = Arc::new(DynamicObject::new(ObjectCode::Record));
    obj.insert_sub(1, SubInfo::new_u32().ro_access(), &0u32.to_le_bytes()).unwrap();
    obj.insert_sub(2, SubInfo::new_u32().ro_access(), &0u32.to_le_bytes()).unwrap();
    dict.insert_object(object_ids::SDO_SERVER_PARAM_BASE, obj).unwrap();
}
