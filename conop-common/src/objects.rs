//! Object dictionary metadata: object kinds, access rights, and sub-object descriptors
//!
//! These types describe the *shape* of an object dictionary entry; the storage and dispatch
//! logic that uses them lives in `conop-node`.

use crate::messages::NmtState;
use crate::value::DataType;

/// What kind of object an index holds, per CiA 301
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ObjectCode {
    /// An empty entry
    Null = 0,
    /// Large variable amount of data, e.g. a firmware image
    Domain = 2,
    /// Denotes a data type definition
    DefType = 5,
    /// Denotes a struct type definition
    DefStruct = 6,
    /// A single value
    #[default]
    Var = 7,
    /// A collection of sub objects with a shared data type, sub 0 giving the count
    Array = 8,
    /// A collection of sub objects with heterogeneous types, sub 0 giving the highest sub index
    Record = 9,
}

impl TryFrom<u8> for ObjectCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ObjectCode::Null,
            2 => ObjectCode::Domain,
            5 => ObjectCode::DefType,
            6 => ObjectCode::DefStruct,
            7 => ObjectCode::Var,
            8 => ObjectCode::Array,
            9 => ObjectCode::Record,
            _ => return Err(()),
        })
    }
}

/// The access rights a sub object grants
///
/// `RwReadOnlyInOp` and `RwWriteOnlyInOp` are read-write in every NMT state except
/// Operational, where they degrade to read-only / write-only respectively — the CiA 301
/// convention for objects (e.g. PDO mapping tables) that must not be reconfigured while
/// PDOs built from them are live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-write outside Operational, read-only while Operational
    RwReadOnlyInOp,
    /// Read-write outside Operational, write-only while Operational
    RwWriteOnlyInOp,
    /// Read-only, and the value will never change, even internally by the device
    Const,
}

impl AccessType {
    /// True if SDO upload is allowed, independent of NMT state
    pub fn is_readable(&self) -> bool {
        !matches!(self, AccessType::Wo)
    }

    /// True if SDO download is allowed, independent of NMT state
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            AccessType::Wo | AccessType::Rw | AccessType::RwReadOnlyInOp | AccessType::RwWriteOnlyInOp
        )
    }

    /// True if SDO upload is allowed while the device is in `state`
    pub fn is_readable_in(&self, state: NmtState) -> bool {
        match self {
            AccessType::Wo => false,
            AccessType::RwWriteOnlyInOp => state != NmtState::Operational,
            _ => true,
        }
    }

    /// True if SDO download is allowed while the device is in `state`
    pub fn is_writable_in(&self, state: NmtState) -> bool {
        match self {
            AccessType::Ro | AccessType::Const => false,
            AccessType::RwReadOnlyInOp => state != NmtState::Operational,
            _ => true,
        }
    }
}

bitflags::bitflags! {
    /// Behavioral flags attached to a sub object, beyond its access mode
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SubFlags: u8 {
        /// Invoke the registered write indication even when the new value equals the old one
        const CALL_WRITE_CALLBACK_ALWAYS = 0x01;
        /// The sub object's value lives in a file rather than RAM; reads/writes go through the
        /// upload/download indication instead of the value region
        const DOMAIN_IS_FILE_BACKED = 0x02;
        /// Uploads for this sub object are serviced by re-reading the backing file on every
        /// request rather than from a cached value
        const UPLOAD_READS_FROM_FILE = 0x04;
    }
}

/// Identifies a single sub object: the 16-bit index of its parent object plus the 8-bit sub
/// index within it
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObjectId {
    /// The parent object's index
    pub index: u16,
    /// The sub index within the parent object
    pub sub: u8,
}

impl ObjectId {
    /// Construct an `ObjectId` from an index and sub index
    pub const fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }
}

/// Metadata describing one sub object
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubInfo {
    /// The size (or max size) of this sub object, in bytes
    pub size: usize,
    /// The data type of this sub object
    pub data_type: DataType,
    /// Which accesses (read/write) are allowed on this sub object
    pub access_type: AccessType,
    /// Whether this sub object's value should be included when the object dictionary is saved
    /// via object 0x1010
    pub persist: bool,
    /// Inclusive lower bound on the value accepted by a download, if any
    pub min: Option<crate::value::BasicValue>,
    /// Inclusive upper bound on the value accepted by a download, if any
    pub max: Option<crate::value::BasicValue>,
    /// Whether this sub object may be referenced by a PDO mapping table
    ///
    /// PDO transmission itself isn't implemented; this flag only gates whether a mapping
    /// attempt into a TPDO/RPDO mapping table should be rejected with
    /// [`crate::sdo::AbortCode::UnnallowedPdo`].
    pub pdo_mappable: bool,
    /// Behavioral flags beyond the access mode
    pub flags: SubFlags,
}

impl SubInfo {
    /// The canonical descriptor for sub 0 of an ARRAY or RECORD object (the count/highest-sub
    /// field)
    pub const MAX_SUB_NUMBER: SubInfo = SubInfo {
        size: 1,
        data_type: DataType::UInt8,
        access_type: AccessType::Const,
        persist: false,
        min: None,
        max: None,
        pdo_mappable: false,
        flags: SubFlags::empty(),
    };

    const fn basic(data_type: DataType, size: usize) -> Self {
        Self {
            size,
            data_type,
            access_type: AccessType::Ro,
            persist: false,
            min: None,
            max: None,
            pdo_mappable: false,
            flags: SubFlags::empty(),
        }
    }

    /// Descriptor for a BOOLEAN sub object
    pub const fn new_bool() -> Self {
        Self::basic(DataType::Boolean, 1)
    }
    /// Descriptor for an INTEGER8 sub object
    pub const fn new_i8() -> Self {
        Self::basic(DataType::Int8, 1)
    }
    /// Descriptor for an INTEGER16 sub object
    pub const fn new_i16() -> Self {
        Self::basic(DataType::Int16, 2)
    }
    /// Descriptor for an INTEGER32 sub object
    pub const fn new_i32() -> Self {
        Self::basic(DataType::Int32, 4)
    }
    /// Descriptor for an INTEGER64 sub object
    pub const fn new_i64() -> Self {
        Self::basic(DataType::Int64, 8)
    }
    /// Descriptor for an UNSIGNED8 sub object
    pub const fn new_u8() -> Self {
        Self::basic(DataType::UInt8, 1)
    }
    /// Descriptor for an UNSIGNED16 sub object
    pub const fn new_u16() -> Self {
        Self::basic(DataType::UInt16, 2)
    }
    /// Descriptor for an UNSIGNED32 sub object
    pub const fn new_u32() -> Self {
        Self::basic(DataType::UInt32, 4)
    }
    /// Descriptor for an UNSIGNED64 sub object
    pub const fn new_u64() -> Self {
        Self::basic(DataType::UInt64, 8)
    }
    /// Descriptor for a REAL32 sub object
    pub const fn new_f32() -> Self {
        Self::basic(DataType::Real32, 4)
    }
    /// Descriptor for a REAL64 sub object
    pub const fn new_f64() -> Self {
        Self::basic(DataType::Real64, 8)
    }
    /// Descriptor for a TIME_OF_DAY sub object
    pub const fn new_time_of_day() -> Self {
        Self::basic(DataType::TimeOfDay, 6)
    }
    /// Descriptor for a TIME_DIFFERENCE sub object
    pub const fn new_time_difference() -> Self {
        Self::basic(DataType::TimeDifference, 6)
    }
    /// Descriptor for a VISIBLE_STRING sub object with the given max length
    pub const fn new_visibile_str(max_len: usize) -> Self {
        Self::basic(DataType::VisibleString, max_len)
    }
    /// Descriptor for an OCTET_STRING sub object with the given max length
    pub const fn new_octet_str(max_len: usize) -> Self {
        Self::basic(DataType::OctetString, max_len)
    }
    /// Descriptor for a DOMAIN sub object
    pub const fn new_domain() -> Self {
        Self::basic(DataType::Domain, 0)
    }

    /// Set access type to read-write
    pub const fn rw_access(mut self) -> Self {
        self.access_type = AccessType::Rw;
        self
    }
    /// Set access type to read-only
    pub const fn ro_access(mut self) -> Self {
        self.access_type = AccessType::Ro;
        self
    }
    /// Set access type to write-only
    pub const fn wo_access(mut self) -> Self {
        self.access_type = AccessType::Wo;
        self
    }
    /// Set access type to const
    pub const fn const_access(mut self) -> Self {
        self.access_type = AccessType::Const;
        self
    }
    /// Set access type to read-write outside Operational, read-only while Operational
    pub const fn rw_read_only_in_op_access(mut self) -> Self {
        self.access_type = AccessType::RwReadOnlyInOp;
        self
    }
    /// Set access type to read-write outside Operational, write-only while Operational
    pub const fn rw_write_only_in_op_access(mut self) -> Self {
        self.access_type = AccessType::RwWriteOnlyInOp;
        self
    }
    /// Mark whether this sub object should be persisted on save
    pub const fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }
    /// Mark whether this sub object may be referenced by a PDO mapping table
    pub const fn pdo_mappable(mut self, mappable: bool) -> Self {
        self.pdo_mappable = mappable;
        self
    }
    /// Set the inclusive lower bound a download must satisfy
    pub const fn min(mut self, min: crate::value::BasicValue) -> Self {
        self.min = Some(min);
        self
    }
    /// Set the inclusive upper bound a download must satisfy
    pub const fn max(mut self, max: crate::value::BasicValue) -> Self {
        self.max = Some(max);
        self
    }
    /// Set the behavioral flags bitset
    pub const fn flags(mut self, flags: SubFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Check a candidate value against [`Self::min`]/[`Self::max`], if set
    ///
    /// Returns `true` if the value is in range, or if no bounds were configured, or if the
    /// value's variant doesn't match (bounds only apply to values of the sub's own data type;
    /// array types are never bounds-checked here).
    pub fn in_range(&self, value: &crate::value::BasicValue) -> bool {
        if let Some(min) = &self.min {
            if let (Some(v), Some(m)) = (Self::ordinal(value), Self::ordinal(min)) {
                if v < m {
                    return false;
                }
            }
        }
        if let Some(max) = &self.max {
            if let (Some(v), Some(m)) = (Self::ordinal(value), Self::ordinal(max)) {
                if v > m {
                    return false;
                }
            }
        }
        true
    }

    /// Project a basic value onto `f64` for the purpose of a bounds comparison
    ///
    /// `f64` has 52 bits of exact integer mantissa, comfortably covering every integer width
    /// this codec supports short of the full 64-bit range; bounds on 64-bit subs are expected
    /// to be used for sign/magnitude checks rather than single-unit precision.
    fn ordinal(value: &crate::value::BasicValue) -> Option<f64> {
        use crate::value::BasicValue::*;
        Some(match *value {
            Boolean(v) => v as u8 as f64,
            Int8(v) => v as f64,
            Int16(v) => v as f64,
            Int24(v) => v as f64,
            Int32(v) => v as f64,
            Int40(v) => v as f64,
            Int48(v) => v as f64,
            Int56(v) => v as f64,
            Int64(v) => v as f64,
            UInt8(v) => v as f64,
            UInt16(v) => v as f64,
            UInt24(v) => v as f64,
            UInt32(v) => v as f64,
            UInt40(v) => v as f64,
            UInt48(v) => v as f64,
            UInt56(v) => v as f64,
            UInt64(v) => v as f64,
            Real32(v) => v as f64,
            Real64(v) => v,
            TimeOfDay(_) | TimeDifference(_) => return None,
        })
    }
}
