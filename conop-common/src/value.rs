//! The CANopen basic/array value type system
//!
//! CiA 301 defines a fixed catalogue of data types identified by a 16-bit type code (the
//! same codes appear in object 0x1000 Device Type sub-fields and various object dictionary
//! metadata). This module gives that catalogue a typed Rust home: [`DataType`] identifies a
//! type, [`BasicValue`] holds a decoded fixed-width value, and the free functions convert
//! to/from the little-endian wire encoding CANopen uses for every multi-byte field.
//!
//! Array types (VISIBLE_STRING, OCTET_STRING, UNICODE_STRING, DOMAIN) are variable-length
//! and have no fixed in-memory representation here; they're carried as raw byte slices by
//! the object dictionary (`conop-node`), which is the layer with an allocator.

use crate::messages::TimeStamp;

/// A CANopen standard data type code, per CiA 301 Table 43
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum DataType {
    /// BOOLEAN
    Boolean = 0x0001,
    /// INTEGER8
    Int8 = 0x0002,
    /// INTEGER16
    Int16 = 0x0003,
    /// INTEGER32
    Int32 = 0x0004,
    /// UNSIGNED8
    UInt8 = 0x0005,
    /// UNSIGNED16
    UInt16 = 0x0006,
    /// UNSIGNED32
    UInt32 = 0x0007,
    /// REAL32
    Real32 = 0x0008,
    /// VISIBLE_STRING
    VisibleString = 0x0009,
    /// OCTET_STRING
    OctetString = 0x000A,
    /// UNICODE_STRING
    UnicodeString = 0x000B,
    /// TIME_OF_DAY
    TimeOfDay = 0x000C,
    /// TIME_DIFFERENCE
    TimeDifference = 0x000D,
    /// DOMAIN
    Domain = 0x000F,
    /// INTEGER24
    Int24 = 0x0010,
    /// REAL64
    Real64 = 0x0011,
    /// INTEGER40
    Int40 = 0x0012,
    /// INTEGER48
    Int48 = 0x0013,
    /// INTEGER56
    Int56 = 0x0014,
    /// INTEGER64
    Int64 = 0x0015,
    /// UNSIGNED24
    UInt24 = 0x0016,
    /// UNSIGNED40
    UInt40 = 0x0018,
    /// UNSIGNED48
    UInt48 = 0x0019,
    /// UNSIGNED56
    UInt56 = 0x001A,
    /// UNSIGNED64
    UInt64 = 0x001B,
}

/// Error returned when an integer type code does not match any known [`DataType`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownDataType(pub u16);

impl TryFrom<u16> for DataType {
    type Error = UnknownDataType;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use DataType::*;
        Ok(match value {
            0x0001 => Boolean,
            0x0002 => Int8,
            0x0003 => Int16,
            0x0004 => Int32,
            0x0005 => UInt8,
            0x0006 => UInt16,
            0x0007 => UInt32,
            0x0008 => Real32,
            0x0009 => VisibleString,
            0x000A => OctetString,
            0x000B => UnicodeString,
            0x000C => TimeOfDay,
            0x000D => TimeDifference,
            0x000F => Domain,
            0x0010 => Int24,
            0x0011 => Real64,
            0x0012 => Int40,
            0x0013 => Int48,
            0x0014 => Int56,
            0x0015 => Int64,
            0x0016 => UInt24,
            0x0018 => UInt40,
            0x0019 => UInt48,
            0x001A => UInt56,
            0x001B => UInt64,
            other => return Err(UnknownDataType(other)),
        })
    }
}

impl DataType {
    /// True if this is one of the variable-length array types (VISIBLE_STRING, OCTET_STRING,
    /// UNICODE_STRING, DOMAIN)
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            DataType::VisibleString
                | DataType::OctetString
                | DataType::UnicodeString
                | DataType::Domain
        )
    }

    /// True if this is one of the string-like array types (everything array-typed except
    /// DOMAIN, which is opaque binary data with no notion of a null terminator)
    pub fn is_str(&self) -> bool {
        matches!(
            self,
            DataType::VisibleString | DataType::OctetString | DataType::UnicodeString
        )
    }

    /// The fixed storage size in bytes for a basic (non-array) type
    ///
    /// Returns `None` for array types, which have no fixed size.
    pub fn size_of(&self) -> Option<usize> {
        use DataType::*;
        Some(match self {
            Boolean | Int8 | UInt8 => 1,
            Int16 | UInt16 => 2,
            Int24 | UInt24 => 3,
            Int32 | UInt32 | Real32 => 4,
            Int40 | UInt40 => 5,
            Int48 | UInt48 | TimeOfDay | TimeDifference => 6,
            Int56 | UInt56 => 7,
            Int64 | UInt64 | Real64 => 8,
            VisibleString | OctetString | UnicodeString | Domain => return None,
        })
    }

    /// The required alignment, in bytes, for this type's storage within an object's value
    /// region
    ///
    /// Matches the alignment rule the object dictionary uses when laying out sub-object
    /// storage: a type aligns to its own size up to 8 bytes, odd widths (24/40/48/56-bit)
    /// align to the next power of two not exceeding their size.
    pub fn align_of(&self) -> usize {
        match self.size_of() {
            None => 1,
            Some(size) => size.next_power_of_two().min(8),
        }
    }
}

/// A decoded value for one of the fixed-width basic types
///
/// Array types are not represented here; see the module documentation.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum BasicValue {
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int24(i32),
    Int32(i32),
    Int40(i64),
    Int48(i64),
    Int56(i64),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt24(u32),
    UInt32(u32),
    UInt40(u64),
    UInt48(u64),
    UInt56(u64),
    UInt64(u64),
    Real32(f32),
    Real64(f64),
    TimeOfDay(TimeStamp),
    TimeDifference(TimeStamp),
}

/// Error returned by [`BasicValue::decode`] / [`BasicValue::encode`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueCodecError {
    /// The supplied buffer was shorter than the type's fixed size
    BufferTooShort,
    /// `decode` was asked to decode an array type, which has no fixed representation
    NotABasicType,
}

impl BasicValue {
    /// The [`DataType`] this value was decoded as / will encode as
    pub fn data_type(&self) -> DataType {
        use BasicValue::*;
        match self {
            Boolean(_) => DataType::Boolean,
            Int8(_) => DataType::Int8,
            Int16(_) => DataType::Int16,
            Int24(_) => DataType::Int24,
            Int32(_) => DataType::Int32,
            Int40(_) => DataType::Int40,
            Int48(_) => DataType::Int48,
            Int56(_) => DataType::Int56,
            Int64(_) => DataType::Int64,
            UInt8(_) => DataType::UInt8,
            UInt16(_) => DataType::UInt16,
            UInt24(_) => DataType::UInt24,
            UInt32(_) => DataType::UInt32,
            UInt40(_) => DataType::UInt40,
            UInt48(_) => DataType::UInt48,
            UInt56(_) => DataType::UInt56,
            UInt64(_) => DataType::UInt64,
            Real32(_) => DataType::Real32,
            Real64(_) => DataType::Real64,
            TimeOfDay(_) => DataType::TimeOfDay,
            TimeDifference(_) => DataType::TimeDifference,
        }
    }

    /// Encode this value to its little-endian wire representation, writing into `out`
    ///
    /// `out` must be at least `data_type().size_of()` bytes; unused trailing bytes are
    /// untouched.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, ValueCodecError> {
        use BasicValue::*;
        let size = self.data_type().size_of().expect("basic type has a size");
        if out.len() < size {
            return Err(ValueCodecError::BufferTooShort);
        }
        match self {
            Boolean(v) => out[0] = *v as u8,
            Int8(v) => out[0] = *v as u8,
            Int16(v) => out[0..2].copy_from_slice(&v.to_le_bytes()),
            Int24(v) => out[0..3].copy_from_slice(&v.to_le_bytes()[0..3]),
            Int32(v) => out[0..4].copy_from_slice(&v.to_le_bytes()),
            Int40(v) => out[0..5].copy_from_slice(&v.to_le_bytes()[0..5]),
            Int48(v) => out[0..6].copy_from_slice(&v.to_le_bytes()[0..6]),
            Int56(v) => out[0..7].copy_from_slice(&v.to_le_bytes()[0..7]),
            Int64(v) => out[0..8].copy_from_slice(&v.to_le_bytes()),
            UInt8(v) => out[0] = *v,
            UInt16(v) => out[0..2].copy_from_slice(&v.to_le_bytes()),
            UInt24(v) => out[0..3].copy_from_slice(&v.to_le_bytes()[0..3]),
            UInt32(v) => out[0..4].copy_from_slice(&v.to_le_bytes()),
            UInt40(v) => out[0..5].copy_from_slice(&v.to_le_bytes()[0..5]),
            UInt48(v) => out[0..6].copy_from_slice(&v.to_le_bytes()[0..6]),
            UInt56(v) => out[0..7].copy_from_slice(&v.to_le_bytes()[0..7]),
            UInt64(v) => out[0..8].copy_from_slice(&v.to_le_bytes()),
            Real32(v) => out[0..4].copy_from_slice(&v.to_le_bytes()),
            Real64(v) => out[0..8].copy_from_slice(&v.to_le_bytes()),
            TimeOfDay(ts) => out[0..6].copy_from_slice(&ts.to_wire()),
            TimeDifference(ts) => out[0..6].copy_from_slice(&ts.to_wire()),
        }
        Ok(size)
    }

    /// Decode a value of the given type from its little-endian wire representation
    pub fn decode(data_type: DataType, bytes: &[u8]) -> Result<Self, ValueCodecError> {
        if data_type.is_array() {
            return Err(ValueCodecError::NotABasicType);
        }
        let size = data_type.size_of().expect("checked non-array above");
        if bytes.len() < size {
            return Err(ValueCodecError::BufferTooShort);
        }
        Ok(match data_type {
            DataType::Boolean => BasicValue::Boolean(bytes[0] != 0),
            DataType::Int8 => BasicValue::Int8(bytes[0] as i8),
            DataType::Int16 => BasicValue::Int16(i16::from_le_bytes([bytes[0], bytes[1]])),
            DataType::Int24 => BasicValue::Int24(sign_extend_i32(bytes, 3)),
            DataType::Int32 => BasicValue::Int32(i32::from_le_bytes(bytes[0..4].try_into().unwrap())),
            DataType::Int40 => BasicValue::Int40(sign_extend_i64(bytes, 5)),
            DataType::Int48 => BasicValue::Int48(sign_extend_i64(bytes, 6)),
            DataType::Int56 => BasicValue::Int56(sign_extend_i64(bytes, 7)),
            DataType::Int64 => BasicValue::Int64(i64::from_le_bytes(bytes[0..8].try_into().unwrap())),
            DataType::UInt8 => BasicValue::UInt8(bytes[0]),
            DataType::UInt16 => BasicValue::UInt16(u16::from_le_bytes([bytes[0], bytes[1]])),
            DataType::UInt24 => BasicValue::UInt24(zero_extend_u32(bytes, 3)),
            DataType::UInt32 => BasicValue::UInt32(u32::from_le_bytes(bytes[0..4].try_into().unwrap())),
            DataType::UInt40 => BasicValue::UInt40(zero_extend_u64(bytes, 5)),
            DataType::UInt48 => BasicValue::UInt48(zero_extend_u64(bytes, 6)),
            DataType::UInt56 => BasicValue::UInt56(zero_extend_u64(bytes, 7)),
            DataType::UInt64 => BasicValue::UInt64(u64::from_le_bytes(bytes[0..8].try_into().unwrap())),
            DataType::Real32 => BasicValue::Real32(f32::from_le_bytes(bytes[0..4].try_into().unwrap())),
            DataType::Real64 => BasicValue::Real64(f64::from_le_bytes(bytes[0..8].try_into().unwrap())),
            DataType::TimeOfDay => {
                let mut buf = [0u8; 6];
                buf.copy_from_slice(&bytes[0..6]);
                BasicValue::TimeOfDay(TimeStamp::from_wire(&buf))
            }
            DataType::TimeDifference => {
                let mut buf = [0u8; 6];
                buf.copy_from_slice(&bytes[0..6]);
                BasicValue::TimeDifference(TimeStamp::from_wire(&buf))
            }
            DataType::VisibleString
            | DataType::OctetString
            | DataType::UnicodeString
            | DataType::Domain => unreachable!("is_array() checked above"),
        })
    }
}

/// Sign-extend an `n`-byte little-endian two's-complement integer (n <= 4) to an `i32`
fn sign_extend_i32(bytes: &[u8], n: usize) -> i32 {
    let mut buf = [0u8; 4];
    buf[0..n].copy_from_slice(&bytes[0..n]);
    let shift = (4 - n) * 8;
    ((i32::from_le_bytes(buf) << shift) >> shift) as i32
}

/// Sign-extend an `n`-byte little-endian two's-complement integer (n <= 8) to an `i64`
fn sign_extend_i64(bytes: &[u8], n: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf[0..n].copy_from_slice(&bytes[0..n]);
    let shift = (8 - n) * 8;
    (i64::from_le_bytes(buf) << shift) >> shift
}

/// Zero-extend an `n`-byte little-endian unsigned integer (n <= 4) to a `u32`
fn zero_extend_u32(bytes: &[u8], n: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf[0..n].copy_from_slice(&bytes[0..n]);
    u32::from_le_bytes(buf)
}

/// Zero-extend an `n`-byte little-endian unsigned integer (n <= 8) to a `u64`
fn zero_extend_u64(bytes: &[u8], n: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf[0..n].copy_from_slice(&bytes[0..n]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_basic_types() {
        let values = [
            BasicValue::Boolean(true),
            BasicValue::Int8(-5),
            BasicValue::Int16(-1000),
            BasicValue::Int24(-1_000_000),
            BasicValue::Int32(-70_000),
            BasicValue::Int40(-1_000_000_000),
            BasicValue::Int48(-1_000_000_000_000),
            BasicValue::Int56(-1_000_000_000_000_000),
            BasicValue::Int64(-1),
            BasicValue::UInt8(200),
            BasicValue::UInt16(60_000),
            BasicValue::UInt24(0xABCDEF),
            BasicValue::UInt32(0xFFFF_FFFE),
            BasicValue::UInt40(0x01_0203_0405),
            BasicValue::UInt48(0x0102_0304_0506),
            BasicValue::UInt56(0x01_0203_0405_0607),
            BasicValue::UInt64(u64::MAX),
            BasicValue::Real32(1.5),
            BasicValue::Real64(2.5),
        ];
        for value in values {
            let mut buf = [0u8; 8];
            let n = value.encode(&mut buf).unwrap();
            let decoded = BasicValue::decode(value.data_type(), &buf[0..n]).unwrap();
            assert_eq!(decoded, value, "round trip failed for {value:?}");
        }
    }

    #[test]
    fn negative_24_bit_sign_extends() {
        // -1 as a 24-bit two's complement value is 0xFFFFFF
        let bytes = [0xFF, 0xFF, 0xFF];
        let decoded = BasicValue::decode(DataType::Int24, &bytes).unwrap();
        assert_eq!(decoded, BasicValue::Int24(-1));
    }

    #[test]
    fn data_type_codes_round_trip() {
        for code in [0x0001u16, 0x0008, 0x0010, 0x0011, 0x001B] {
            let dt = DataType::try_from(code).unwrap();
            assert_eq!(dt as u16, code);
        }
    }

    #[test]
    fn array_types_have_no_fixed_size() {
        assert_eq!(DataType::Domain.size_of(), None);
        assert!(DataType::Domain.is_array());
        assert_eq!(
            BasicValue::decode(DataType::Domain, &[0u8; 8]),
            Err(ValueCodecError::NotABasicType)
        );
    }
}
