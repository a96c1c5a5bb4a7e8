//! The configuration loader interface.
//!
//! An external EDS/DCF parser (not implemented here) produces a sequence of
//! `(index, sub, data_type, value-bytes)` records; [`apply_config`] feeds each one through
//! the same [`ObjectAccess::write`] path local application code and the SDO server use, so
//! configuration loading gets the same access/range/callback discipline as any other write.
//!
//! This module does not parse any file format. `ConfigRecord` is deliberately the shape an
//! external loader would already be producing.

use conop_common::value::DataType;

use crate::error::{ConfigError, NoSuchObjectSnafu};
use crate::object_dict::ObjectDictionary;
use snafu::OptionExt;

/// One object-dictionary write, as an external configuration loader would produce it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigRecord {
    /// The target object's index
    pub index: u16,
    /// The target sub-object's sub index
    pub sub: u8,
    /// The sub object's declared type, carried alongside the bytes for the caller's own
    /// validation; the dictionary re-derives the type from the sub object itself and does
    /// not trust this field
    pub data_type: DataType,
    /// The little-endian wire bytes to write
    pub value: Vec<u8>,
}

impl ConfigRecord {
    /// Build a record from its constituent parts
    pub fn new(index: u16, sub: u8, data_type: DataType, value: Vec<u8>) -> Self {
        Self { index, sub, data_type, value }
    }
}

/// Apply a sequence of configuration records to `dict`, in order, via the dictionary's
/// download path.
///
/// Stops at the first record that fails and reports which one; records already applied
/// before the failure remain applied (this mirrors local configuration writes applied one
/// at a time, not a transactional load — atomicity is scoped to a single dictionary
/// reshape, not to a multi-record load).
pub fn apply_config(dict: &ObjectDictionary, records: &[ConfigRecord]) -> Result<(), ConfigError> {
    for record in records {
        let object = dict.get(record.index).context(NoSuchObjectSnafu { index: record.index })?;
        object.write(record.sub, &record.value).map_err(|abort_code| ConfigError::Rejected {
            index: record.index,
            sub: record.sub,
            abort_code,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use conop_common::objects::{ObjectCode, SubInfo};

    use super::*;
    use crate::object_dict::DynamicObject;

    fn dict_with_u32(index: u16) -> ObjectDictionary {
        let dict = ObjectDictionary::new();
        let obj = Arc::new(DynamicObject::new(ObjectCode::Var));
        obj.insert_sub(0, SubInfo::new_u32().rw_access(), &0u32.to_le_bytes()).unwrap();
        dict.insert_object(index, obj).unwrap();
        dict
    }

    #[test]
    fn applies_records_in_order() {
        let dict = dict_with_u32(0x2000);
        let records = vec![ConfigRecord::new(0x2000, 0, DataType::UInt32, 0x12345678u32.to_le_bytes().to_vec())];
        apply_config(&dict, &records).unwrap();
        assert_eq!(dict.get(0x2000).unwrap().read_u32(0).unwrap(), 0x12345678);
    }

    #[test]
    fn missing_object_is_reported() {
        let dict = ObjectDictionary::new();
        let records = vec![ConfigRecord::new(0x3000, 0, DataType::UInt32, vec![0; 4])];
        let err = apply_config(&dict, &records).unwrap_err();
        assert!(matches!(err, ConfigError::NoSuchObject { index: 0x3000 }));
    }

    #[test]
    fn rejected_write_is_reported() {
        let dict = dict_with_u32(0x2000);
        let records = vec![ConfigRecord::new(0x2000, 0, DataType::UInt32, vec![0; 2])];
        let err = apply_config(&dict, &records).unwrap_err();
        assert!(matches!(err, ConfigError::Rejected { index: 0x2000, sub: 0, .. }));
    }
}
