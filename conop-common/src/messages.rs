//! Message definitions
//!
//! Encodes and decodes the CAN frames that make up the CANopen communication profile:
//! NMT node control, heartbeat, SYNC, TIME, EMCY, and the SDO request/response frames
//! (the wire format for SDO itself lives in [`crate::sdo`]).

use snafu::Snafu;

use crate::sdo::{SdoRequest, SdoResponse};

/// Yet another CanId enum
///
/// TODO: Consider if this should use the CanId from embedded_can?
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanId {
    /// An extended 28-bit identifier
    Extended(u32),
    /// A std 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create a new extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a new standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw ID as a u32
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true if this ID is an extended ID
    pub fn is_extended(&self) -> bool {
        match self {
            CanId::Extended(_) => true,
            CanId::Std(_) => false,
        }
    }
}

/// Flags carried alongside a CAN frame's ID and data
///
/// `rtr` and `ide` are classical CAN flags; `edl`, `brs`, and `esi` only apply to CAN-FD
/// frames. The core only emits classical frames, but tolerates FD frames on input by
/// ignoring them wherever an EDL flag is set (see [`CanMessage::is_fd`]).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFlags {
    /// Remote transmission request
    pub rtr: bool,
    /// Extended (29-bit) identifier frame
    pub ide: bool,
    /// CAN-FD extended data length frame
    pub edl: bool,
    /// CAN-FD bit rate switch
    pub brs: bool,
    /// CAN-FD error state indicator
    pub esi: bool,
}

const MAX_DATA_LENGTH: usize = 8;

/// A struct to contain a CanMessage
#[derive(Clone, Copy, Debug)]
pub struct CanMessage {
    /// The data payload of the message
    ///
    /// Note, some bytes may be unused. Check dlc.
    pub data: [u8; MAX_DATA_LENGTH],
    /// The length of the data payload
    pub dlc: u8,
    /// Indicates this message is a remote transmission request
    pub rtr: bool,
    /// The id of this message
    pub id: CanId,
    /// CAN-FD flags (edl/brs/esi); always default for classical frames
    pub flags: CanFlags,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
            flags: CanFlags::default(),
        }
    }
}

impl CanMessage {
    /// Create a new CAN message
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len() as u8;
        if dlc > MAX_DATA_LENGTH as u8 {
            panic!(
                "Data length exceeds maximum size of {} bytes",
                MAX_DATA_LENGTH
            );
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc as usize].copy_from_slice(data);
        let rtr = false;

        Self {
            id,
            dlc,
            data: buf,
            rtr,
            flags: CanFlags {
                ide: id.is_extended(),
                ..Default::default()
            },
        }
    }

    /// Create a new RTR message
    ///
    /// RTR messages have no data payload
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            rtr: true,
            flags: CanFlags {
                rtr: true,
                ide: id.is_extended(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Get the id of the message
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get a slice containing the data payload
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true if this message is a remote transmission request
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }

    /// Returns true if this message is a CAN-FD extended-data-length frame
    ///
    /// The core ignores these for SDO/NMT/TIME/EMCY purposes; CANopen protocol traffic is
    /// classical CAN only.
    pub fn is_fd(&self) -> bool {
        self.flags.edl
    }
}

/// The error codes which can be delivered in a CAN frame
///
/// These are set by a receiver when it detects an error in a received frame, and received globally
/// by all nodes on the bus
#[derive(Clone, Copy, Debug, Snafu)]
#[repr(u8)]
pub enum CanError {
    /// The transmitter detected a different value on the bus than the value is was transmitting at
    /// a point in the message after the arbitration process (sending of the ID)
    Bit = 1,
    /// A receiver detected a sequence of 6 bits of the same level, indicating a failure in bit
    /// stuffing
    Stuff = 2,
    /// A reveiver detected a malformed can frame (e.g. the SOF bit was not dominant, etc)
    Form = 3,
    /// The transmitter did not detect an ACK from any receivers
    Ack = 4,
    /// A receiver detected a mismatch in CRC value for the message
    Crc = 5,
    /// There are other bit patterns possible for the error field, but they have no defined meaning
    Other,
}

impl CanError {
    /// Create a CanError from the on-bus error code
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Bit,
            2 => Self::Stuff,
            3 => Self::Form,
            4 => Self::Ack,
            5 => Self::Crc,
            _ => Self::Other,
        }
    }
}

/// The NMT state transition command specifier
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Indicates device should transition to the Operation state
    Start = 1,
    /// Indicates device should transition to the Stopped state
    Stop = 2,
    /// Indicates device should transition to the PreOperational state
    EnterPreOp = 128,
    /// Indicates device should perform an application reset
    ResetApp = 129,
    /// Indicates device should perform a communications reset
    ResetComm = 130,
}

impl NmtCommandSpecifier {
    /// Create an NmtCommandCmd from the byte value transmitted in the message
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// The COB ID used for sending NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// The COB ID used for sending SYNC commands
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// The COB ID used for sending TIME messages, before any 0x1012 override
pub const TIME_ID: CanId = CanId::Std(0x100);
/// The COB ID used for heartbeat messages
pub const HEARTBEAT_ID: u16 = 0x700;
/// The default base ID for sending EMCY messages (node ID is added)
pub const EMCY_ID_BASE: u16 = 0x080;
/// The default base ID for sending SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The default base ID for sending SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;

/// An NmtCommand message
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NmtCommand {
    /// Specifies the type of command
    pub cs: NmtCommandSpecifier,
    /// Indicates the node it applies to. A node of 0 indicates a broadcast command to all nodes.
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cmd = NmtCommandSpecifier::from_byte(payload[0])?;
            let node = payload[1];
            Ok(NmtCommand { cs: cmd, node })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        let mut msg = CanMessage {
            id: NMT_CMD_ID,
            dlc: 2,
            ..Default::default()
        };
        msg.data[0] = cmd.cs as u8;
        msg.data[1] = cmd.node;
        msg
    }
}

/// Possible NMT states for a node
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtState {
    /// Bootup
    ///
    /// A node never remains in this state, as all nodes should transition automatically into PreOperational
    Bootup = 0,
    /// Node has been stopped
    Stopped = 4,
    /// Normal operational state
    Operational = 5,
    /// Node is awaiting command to enter operation
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Bootup => write!(f, "Bootup"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
/// An error for [`NmtState::try_from()`]
pub struct InvalidNmtStateError(u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    /// Attempt to convert a u8 to an NmtState enum
    ///
    /// Fails with BadNmtStateError if value is not a valid state
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Bootup as u8 => Ok(Bootup),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// A Heartbeat message
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Heartbeat {
    /// The ID of the node transmitting the heartbeat
    pub node: u8,
    /// A toggle value which is flipped on every heartbeat
    pub toggle: bool,
    /// The current NMT state of the node
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut msg = CanMessage {
            id: CanId::Std(HEARTBEAT_ID | value.node as u16),
            dlc: 1,
            ..Default::default()
        };
        msg.data[0] = value.state as u8;
        if value.toggle {
            msg.data[0] |= 1 << 7;
        }
        msg
    }
}
/// Represents a SYNC object/message
///
/// A single CAN node can serve as the SYNC provider, sending a periodic sync object to all other
/// nodes. The one byte count value starts at 1, and increments. On overflow, it should be reset to
/// 1.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncObject {
    count: u8,
}

impl SyncObject {
    /// Create a new SyncObjectd
    pub fn new(count: u8) -> Self {
        Self { count }
    }
}

impl Default for SyncObject {
    fn default() -> Self {
        Self { count: 1 }
    }
}

impl From<SyncObject> for CanMessage {
    fn from(value: SyncObject) -> Self {
        CanMessage::new(SYNC_ID, &[value.count])
    }
}

impl From<CanMessage> for SyncObject {
    fn from(msg: CanMessage) -> Self {
        if msg.id() == SYNC_ID {
            let count = msg.data()[0];
            Self { count }
        } else {
            panic!("Invalid message ID for SyncObject");
        }
    }
}

/// Number of whole days between the CANopen TIME_OF_DAY epoch (1984-01-01) and the Unix
/// epoch (1970-01-01)
const DAYS_1970_TO_1984: i64 = 5_114;

/// The 6-byte CANopen TIME_OF_DAY / TIME_DIFF wire representation
///
/// Encodes a 28-bit millisecond-of-day value and a 16-bit day counter. For TIME_OF_DAY the
/// day counter is days since 1984-01-01; for TIME_DIFF it is a relative day count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeStamp {
    /// Milliseconds since midnight (0..=86_399_999)
    pub ms: u32,
    /// Days since 1984-01-01 (absolute) or a relative day offset (for TIME_DIFF)
    pub days: u16,
}

impl TimeStamp {
    /// Decode the 6-byte wire payload used by both TIME and TIME_DIFF
    pub fn from_wire(bytes: &[u8; 6]) -> Self {
        let ms = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x0FFF_FFFF;
        let days = u16::from_le_bytes([bytes[4], bytes[5]]);
        Self { ms, days }
    }

    /// Encode to the 6-byte wire payload used by both TIME and TIME_DIFF
    pub fn to_wire(self) -> [u8; 6] {
        let ms_bytes = (self.ms & 0x0FFF_FFFF).to_le_bytes();
        let day_bytes = self.days.to_le_bytes();
        [
            ms_bytes[0],
            ms_bytes[1],
            ms_bytes[2],
            ms_bytes[3],
            day_bytes[0],
            day_bytes[1],
        ]
    }

    /// Convert to whole seconds since the Unix epoch, truncating sub-second precision
    ///
    /// Only meaningful for an absolute TIME_OF_DAY value, not a TIME_DIFF.
    pub fn to_unix_seconds(self) -> i64 {
        let days_since_epoch = self.days as i64 - DAYS_1970_TO_1984;
        days_since_epoch * 86_400 + (self.ms / 1000) as i64
    }
}

/// A decoded TIME message
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeMessage {
    /// The decoded time stamp
    pub stamp: TimeStamp,
}

impl TimeMessage {
    /// Encode this time message onto the given CAN-ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.stamp.to_wire())
    }

    /// Decode a TIME message payload from a received frame
    ///
    /// Returns `None` if the frame is shorter than the 6-byte TIME payload.
    pub fn from_can_message(msg: &CanMessage) -> Option<Self> {
        let data = msg.data();
        if data.len() < 6 {
            return None;
        }
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&data[0..6]);
        Some(Self {
            stamp: TimeStamp::from_wire(&bytes),
        })
    }
}

/// A decoded EMCY (emergency) message
///
/// Wire format: error code (u16 LE), error register (u8), 5 bytes manufacturer-specific
/// data, transmitted on `0x080 + node-id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EmcyMessage {
    /// The node which produced this emergency
    pub node: u8,
    /// The standard CiA 301 error code
    pub error_code: u16,
    /// A snapshot of object 0x1001 (error register) at the time of the event
    pub error_register: u8,
    /// Manufacturer-specific additional information
    pub manufacturer_data: [u8; 5],
}

impl EmcyMessage {
    /// Encode this emergency onto a CAN frame
    pub fn to_can_message(self) -> CanMessage {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&self.error_code.to_le_bytes());
        data[2] = self.error_register;
        data[3..8].copy_from_slice(&self.manufacturer_data);
        CanMessage::new(CanId::Std(EMCY_ID_BASE | self.node as u16), &data)
    }

    /// Decode an emergency from a received frame, given the producer's node ID
    pub fn from_can_message(node: u8, msg: &CanMessage) -> Result<Self, MessageError> {
        let data = msg.data();
        if data.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        let error_code = u16::from_le_bytes([data[0], data[1]]);
        let error_register = data[2];
        let mut manufacturer_data = [0u8; 5];
        manufacturer_data.copy_from_slice(&data[3..8]);
        Ok(Self {
            node,
            error_code,
            error_register,
            manufacturer_data,
        })
    }
}

impl TryFrom<CanMessage> for CanopenMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        if cob_id == NMT_CMD_ID {
            Ok(CanopenMessage::NmtCommand(msg.try_into()?))
        } else if cob_id.raw() & !0x7f == HEARTBEAT_ID as u32 {
            let node = (cob_id.raw() & 0x7f) as u8;
            let toggle = (msg.data[0] & (1 << 7)) != 0;
            let state: NmtState = (msg.data[0] & 0x7f)
                .try_into()
                .map_err(|e: InvalidNmtStateError| MessageError::InvalidNmtState { value: e.0 })?;
            Ok(CanopenMessage::Heartbeat(Heartbeat {
                node,
                toggle,
                state,
            }))
        } else if cob_id.raw() & 0xff80 == 0x580 {
            // SDO response
            let resp: SdoResponse = msg
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(CanopenMessage::SdoResponse(resp))
        } else if cob_id.raw() & 0xff80 == 0x600 {
            // SDO request
            let req: SdoRequest = msg
                .data()
                .try_into()
                .map_err(|_| MessageError::MalformedMsg { cob_id })?;
            Ok(CanopenMessage::SdoRequest(req))
        } else if cob_id == SYNC_ID {
            Ok(CanopenMessage::Sync(msg.into()))
        } else if cob_id == TIME_ID {
            let time = TimeMessage::from_can_message(&msg)
                .ok_or(MessageError::MessageTooShort)?;
            Ok(CanopenMessage::Time(time))
        } else if cob_id.raw() & !0x7f == EMCY_ID_BASE as u32 {
            let node = (cob_id.raw() & 0x7f) as u8;
            Ok(CanopenMessage::Emcy(EmcyMessage::from_can_message(
                node, &msg,
            )?))
        } else {
            Err(MessageError::UnrecognizedId { cob_id })
        }
    }
}

/// An enum representing all of the standard CANopen messages this core understands
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum CanopenMessage {
    NmtCommand(NmtCommand),
    Sync(SyncObject),
    Heartbeat(Heartbeat),
    Time(TimeMessage),
    Emcy(EmcyMessage),
    SdoRequest(SdoRequest),
    SdoResponse(SdoResponse),
}

/// An error for problems converting CanMessages to CANopen message types
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// Not enough bytes were present in the message
    MessageTooShort,
    /// The message was malformed in some way
    MalformedMsg {
        /// The COB ID of the malformed message
        cob_id: CanId,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// Received ID
        cob_id: CanId,
        /// Expected ID
        expected: CanId,
    },
    /// A field in the message contained an unallowed value for that field
    InvalidField,
    /// The COB ID of the message does not correspond to an expected CanopenMessage
    ///
    /// This isn't particular surprising, many messages on the bus will not (e.g. PDOs)
    UnrecognizedId {
        /// The unrecognized COB
        cob_id: CanId,
    },
    /// The NMT state integer in the message is not a valid NMT state
    InvalidNmtState {
        /// The invalid byte
        value: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_of_day_round_trip() {
        // 2017-01-01 00:01:40 UTC: ms-of-day = 100000 (0x000186A0), days = 12076
        let bytes = [0xA0, 0x86, 0x01, 0x00, 0x2C, 0x2F];
        let stamp = TimeStamp::from_wire(&bytes);
        assert_eq!(stamp.ms, 100_000);
        assert_eq!(stamp.days, 12076);
        assert_eq!(stamp.to_wire(), bytes);
    }

    #[test]
    fn emcy_round_trip() {
        let emcy = EmcyMessage {
            node: 5,
            error_code: 0x1000,
            error_register: 0x01,
            manufacturer_data: [1, 2, 3, 4, 5],
        };
        let msg = emcy.to_can_message();
        assert_eq!(msg.id(), CanId::Std(EMCY_ID_BASE | 5));
        let decoded = EmcyMessage::from_can_message(5, &msg).unwrap();
        assert_eq!(decoded, emcy);
    }
}
