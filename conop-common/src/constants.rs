//! Constants defining standard object indices and special values
//!
//! These are the CiA 301 communication profile objects the core binds services to:
//! NMT/heartbeat, SDO server COB-IDs, SYNC, TIME, EMCY, and life-guarding.

/// Object indices for standard CiA 301 communication profile objects
pub mod object_ids {
    /// Device type
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// Error register
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// COB-ID SYNC message
    pub const COB_ID_SYNC: u16 = 0x1005;
    /// Communication cycle period (SYNC interval, microseconds)
    pub const SYNC_CYCLE_PERIOD: u16 = 0x1006;
    /// The Device Name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The hardware version object index
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// The software version object index
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// Save objects command object index
    pub const SAVE_OBJECTS: u16 = 0x1010;
    /// Restore default parameters
    pub const RESTORE_DEFAULTS: u16 = 0x1011;
    /// COB-ID TIME message
    pub const COB_ID_TIME: u16 = 0x1012;
    /// High-resolution time stamp
    pub const HIGH_RES_TIMESTAMP: u16 = 0x1013;
    /// COB-ID EMCY message
    pub const COB_ID_EMCY: u16 = 0x1014;
    /// Inhibit time EMCY (100 microsecond units)
    pub const INHIBIT_TIME_EMCY: u16 = 0x1015;
    /// Consumer heartbeat time (array of node/interval entries)
    pub const CONSUMER_HEARTBEAT_TIME: u16 = 0x1016;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// Synchronous counter overflow value
    pub const SYNC_COUNTER_OVERFLOW: u16 = 0x1019;
    /// Guard time, in milliseconds (life-guarding)
    pub const GUARD_TIME: u16 = 0x100C;
    /// Life time factor (life-guarding)
    pub const LIFE_TIME_FACTOR: u16 = 0x100D;
    /// Error behavior object
    pub const ERROR_BEHAVIOR: u16 = 0x1029;
    /// First SDO server parameter object (client->server / server->client COB-IDs)
    pub const SDO_SERVER_PARAM_BASE: u16 = 0x1200;
    /// Last SDO server parameter object in the standard range
    pub const SDO_SERVER_PARAM_MAX: u16 = 0x127F;
    /// The auto start object index
    pub const AUTO_START: u16 = 0x5000;
}

/// Special values used to access standard objects
pub mod values {
    /// Magic value used to trigger object storage by writing to object 0x1010
    pub const SAVE_CMD: u32 = 0x7365_7661;
    /// Magic value used to trigger restoring defaults by writing to object 0x1011
    pub const RESTORE_CMD: u32 = 0x6461_6F6C;
}

/// Standard CiA 301 Table 12 EMCY error codes relevant to the communication profile itself
/// (device-specific codes are the application's to define)
pub mod emcy_codes {
    /// No error / error reset
    pub const NO_ERROR: u16 = 0x0000;
    /// Generic error
    pub const GENERIC: u16 = 0x1000;
    /// Communication error (generic, bus warning/overrun etc.)
    pub const COMMUNICATION: u16 = 0x8100;
    /// Heartbeat or life-guarding error (a monitored node, or this node's own guard master,
    /// stopped being heard from in time)
    pub const HEARTBEAT_OR_GUARDING: u16 = 0x8130;
}

/// Base CAN-ID for NMT node control
pub const NMT_CMD_COB_ID: u16 = 0x000;
/// Default base CAN-ID for SYNC, before 0x1005 override
pub const DEFAULT_SYNC_COB_ID: u16 = 0x080;
/// Default base CAN-ID for EMCY (node ID is added)
pub const DEFAULT_EMCY_COB_ID_BASE: u16 = 0x080;
/// Default base CAN-ID for TIME
pub const DEFAULT_TIME_COB_ID: u16 = 0x100;
/// Base CAN-ID for heartbeat (node ID is added)
pub const HEARTBEAT_COB_ID_BASE: u16 = 0x700;
/// Default base CAN-ID for SDO client -> server requests (node ID is added)
pub const SDO_REQUEST_COB_ID_BASE: u16 = 0x600;
/// Default base CAN-ID for SDO server -> client responses (node ID is added)
pub const SDO_RESPONSE_COB_ID_BASE: u16 = 0x580;
