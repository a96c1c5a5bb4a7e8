//! A dynamically shaped object
//!
//! [`DynamicObject`] backs VAR, ARRAY and RECORD entries whose sub objects are registered at
//! runtime rather than generated at build time. Every [`insert_sub`](DynamicObject::insert_sub)
//! or [`remove_sub`](DynamicObject::remove_sub) recomputes the fixed-size value region under a
//! single write lock, so no reader ever observes a partially laid out object.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use conop_common::{objects::SubInfo, sdo::AbortCode, value::BasicValue};

pub use conop_common::objects::ObjectCode;

use super::ObjectAccess;
use crate::error::DictError;

/// A read indication: runs after a value is read, with the chance to rewrite the bytes about
/// to go out on the wire.
pub type ReadIndication = dyn Fn(u8, &mut [u8]) + Send + Sync;
/// A write indication: runs on an incoming, fully materialized value, with the chance to
/// reject it with an abort code or mutate it before it's committed.
pub type WriteIndication = dyn Fn(u8, &mut Vec<u8>) -> Result<(), AbortCode> + Send + Sync;

#[derive(Default)]
struct Indications {
    read: BTreeMap<u8, Arc<ReadIndication>>,
    write: BTreeMap<u8, Arc<WriteIndication>>,
}

#[derive(Clone, Copy)]
struct SubSlot {
    info: SubInfo,
    /// Byte offset into `value_region`. Meaningless for array-typed subs, which are stored in
    /// `arrays` instead.
    offset: usize,
}

#[derive(Default)]
struct Shape {
    subs: BTreeMap<u8, SubSlot>,
    value_region: Vec<u8>,
    arrays: BTreeMap<u8, Vec<u8>>,
}

impl Shape {
    /// Recompute offsets for every basic-typed sub, preserving existing values where they still
    /// fit. Each type aligns to [`DataType::align_of`](conop_common::value::DataType::align_of).
    fn recompute_layout(&mut self) {
        let old_region = std::mem::take(&mut self.value_region);
        let old_offsets: BTreeMap<u8, usize> =
            self.subs.iter().map(|(sub, slot)| (*sub, slot.offset)).collect();

        let mut offset = 0usize;
        let mut new_offsets = Vec::with_capacity(self.subs.len());
        for (sub, slot) in self.subs.iter() {
            if slot.info.data_type.is_array() {
                continue;
            }
            let align = slot.info.data_type.align_of();
            let pad = (align - (offset % align)) % align;
            offset += pad;
            new_offsets.push((*sub, offset));
            offset += slot.info.size;
        }

        let mut new_region = vec![0u8; offset];
        for (sub, new_offset) in &new_offsets {
            if let Some(&old_offset) = old_offsets.get(sub) {
                let size = self.subs[sub].info.size;
                if old_offset + size <= old_region.len() {
                    new_region[*new_offset..*new_offset + size]
                        .copy_from_slice(&old_region[old_offset..old_offset + size]);
                }
            }
        }
        for (sub, new_offset) in new_offsets {
            self.subs.get_mut(&sub).unwrap().offset = new_offset;
        }
        self.value_region = new_region;
    }
}

/// An object whose sub objects can be added and removed while the node is running
#[allow(missing_debug_implementations)]
pub struct DynamicObject {
    object_code: ObjectCode,
    shape: RwLock<Shape>,
    indications: RwLock<Indications>,
}

impl DynamicObject {
    /// Create an empty object of the given kind
    pub fn new(object_code: ObjectCode) -> Self {
        Self {
            object_code,
            shape: RwLock::new(Shape::default()),
            indications: RwLock::new(Indications::default()),
        }
    }

    /// Attach a read indication to a sub object, replacing any previously registered one
    ///
    /// Runs synchronously, with the object's internal lock held, every time the sub is read.
    pub fn register_read_indication(
        &self,
        sub: u8,
        callback: impl Fn(u8, &mut [u8]) + Send + Sync + 'static,
    ) {
        self.indications
            .write()
            .unwrap()
            .read
            .insert(sub, Arc::new(callback));
    }

    /// Attach a write indication to a sub object, replacing any previously registered one
    ///
    /// Runs synchronously, with the object's internal lock held, every time the sub is
    /// written, before the new value is committed. Returning `Err` aborts the write without
    /// modifying stored state.
    pub fn register_write_indication(
        &self,
        sub: u8,
        callback: impl Fn(u8, &mut Vec<u8>) -> Result<(), AbortCode> + Send + Sync + 'static,
    ) {
        self.indications
            .write()
            .unwrap()
            .write
            .insert(sub, Arc::new(callback));
    }

    /// Register a sub object, reshaping the value region atomically
    ///
    /// `initial` is copied into the new storage, truncated or zero-padded to the sub object's
    /// size. Fails with [`DictError::DuplicateSubObject`] if `sub` is already registered;
    /// callers that mean to replace a sub object must [`Self::remove_sub`] it first.
    pub fn insert_sub(&self, sub: u8, info: SubInfo, initial: &[u8]) -> Result<(), DictError> {
        let mut shape = self.shape.write().unwrap();
        if shape.subs.contains_key(&sub) {
            return Err(DictError::DuplicateSubObject { sub });
        }
        if info.data_type.is_array() {
            let mut bytes = vec![0u8; info.size];
            let n = initial.len().min(bytes.len());
            bytes[..n].copy_from_slice(&initial[..n]);
            shape.arrays.insert(sub, bytes);
            shape.subs.insert(sub, SubSlot { info, offset: 0 });
        } else {
            shape.subs.insert(sub, SubSlot { info, offset: 0 });
            shape.recompute_layout();
            let slot = shape.subs[&sub];
            let n = initial.len().min(slot.info.size);
            shape.value_region[slot.offset..slot.offset + n].copy_from_slice(&initial[..n]);
        }
        Ok(())
    }

    /// Remove a sub object, reshaping the value region atomically
    pub fn remove_sub(&self, sub: u8) {
        let mut shape = self.shape.write().unwrap();
        shape.subs.remove(&sub);
        shape.arrays.remove(&sub);
        shape.recompute_layout();
    }

    /// The highest registered sub index, or 0 if none are registered
    pub fn max_sub(&self) -> u8 {
        self.shape.read().unwrap().subs.keys().copied().max().unwrap_or(0)
    }

    fn has_synthetic_sub0(&self) -> bool {
        matches!(self.object_code, ObjectCode::Array | ObjectCode::Record)
    }
}

impl ObjectAccess for DynamicObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if sub == 0 && self.has_synthetic_sub0() {
            if offset != 0 || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.max_sub();
            return Ok(1);
        }

        let shape = self.shape.read().unwrap();
        let slot = shape.subs.get(&sub).ok_or(AbortCode::NoSuchSubIndex)?;
        if !slot.info.access_type.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        let n = if slot.info.data_type.is_array() {
            let bytes = &shape.arrays[&sub];
            if offset >= bytes.len() {
                return Ok(0);
            }
            let n = buf.len().min(bytes.len() - offset);
            buf[..n].copy_from_slice(&bytes[offset..offset + n]);
            n
        } else {
            if offset >= slot.info.size {
                return Ok(0);
            }
            let n = buf.len().min(slot.info.size - offset);
            let start = slot.offset + offset;
            buf[..n].copy_from_slice(&shape.value_region[start..start + n]);
            n
        };
        drop(shape);
        if let Some(indication) = self.indications.read().unwrap().read.get(&sub) {
            indication(sub, &mut buf[..n]);
        }
        Ok(n)
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        if sub == 0 && self.has_synthetic_sub0() {
            return Ok(1);
        }
        let shape = self.shape.read().unwrap();
        shape
            .subs
            .get(&sub)
            .map(|slot| slot.info.size)
            .ok_or(AbortCode::NoSuchSubIndex)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if sub == 0 && self.has_synthetic_sub0() {
            return Err(AbortCode::ReadOnly);
        }
        let mut shape = self.shape.write().unwrap();
        let slot = *shape.subs.get(&sub).ok_or(AbortCode::NoSuchSubIndex)?;
        if !slot.info.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }

        let mut data = data.to_vec();
        if !slot.info.data_type.is_array() {
            if data.len() != slot.info.size {
                return Err(if data.len() < slot.info.size {
                    AbortCode::DataTypeMismatchLengthLow
                } else {
                    AbortCode::DataTypeMismatchLengthHigh
                });
            }
            if slot.info.min.is_some() || slot.info.max.is_some() {
                if let Ok(value) = BasicValue::decode(slot.info.data_type, &data) {
                    if !slot.info.in_range(&value) {
                        return Err(AbortCode::InvalidValue);
                    }
                }
            }
        } else if data.len() > slot.info.size {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }

        if let Some(indication) = self.indications.read().unwrap().write.get(&sub).cloned() {
            indication(sub, &mut data)?;
        }

        if slot.info.data_type.is_array() {
            let bytes = shape.arrays.get_mut(&sub).unwrap();
            if data.len() > bytes.len() {
                return Err(AbortCode::DataTypeMismatchLengthHigh);
            }
            let n = data.len();
            bytes[..n].copy_from_slice(&data);
            bytes[n..].fill(0);
        } else {
            if data.len() != slot.info.size {
                return Err(if data.len() < slot.info.size {
                    AbortCode::DataTypeMismatchLengthLow
                } else {
                    AbortCode::DataTypeMismatchLengthHigh
                });
            }
            shape.value_region[slot.offset..slot.offset + data.len()].copy_from_slice(&data);
        }
        Ok(())
    }

    fn object_code(&self) -> ObjectCode {
        self.object_code
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 && self.has_synthetic_sub0() {
            return Ok(SubInfo::MAX_SUB_NUMBER);
        }
        let shape = self.shape.read().unwrap();
        shape
            .subs
            .get(&sub)
            .map(|slot| slot.info)
            .ok_or(AbortCode::NoSuchSubIndex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_object_round_trips_a_value() {
        let obj = DynamicObject::new(ObjectCode::Var);
        obj.insert_sub(0, SubInfo::new_u32().rw_access(), &0u32.to_le_bytes()).unwrap();
        obj.write(0, &42u32.to_le_bytes()).unwrap();
        assert_eq!(obj.read_u32(0).unwrap(), 42);
    }

    #[test]
    fn record_reports_highest_sub_from_sub0() {
        let obj = DynamicObject::new(ObjectCode::Record);
        obj.insert_sub(1, SubInfo::new_u32().rw_access(), &[]).unwrap();
        obj.insert_sub(3, SubInfo::new_u8().rw_access(), &[]).unwrap();
        assert_eq!(obj.read_u8(0).unwrap(), 3);
    }

    #[test]
    fn inserting_a_sub_preserves_existing_values() {
        let obj = DynamicObject::new(ObjectCode::Record);
        obj.insert_sub(1, SubInfo::new_u32().rw_access(), &[]).unwrap();
        obj.write(1, &7u32.to_le_bytes()).unwrap();
        // Insert a new, differently aligned sub ahead of sub 1 in iteration order; sub 1's
        // value must survive the relayout.
        obj.insert_sub(0, SubInfo::new_u8().ro_access(), &[]).unwrap();
        assert_eq!(obj.read_u32(1).unwrap(), 7);
    }

    #[test]
    fn removing_a_sub_reshapes_without_corrupting_survivors() {
        let obj = DynamicObject::new(ObjectCode::Record);
        obj.insert_sub(1, SubInfo::new_u8().rw_access(), &[]).unwrap();
        obj.insert_sub(2, SubInfo::new_u32().rw_access(), &[]).unwrap();
        obj.write(2, &99u32.to_le_bytes()).unwrap();
        obj.remove_sub(1);
        assert_eq!(obj.read_u32(2).unwrap(), 99);
        assert_eq!(obj.sub_info(1), Err(AbortCode::NoSuchSubIndex));
    }

    #[test]
    fn array_subs_bypass_the_value_region() {
        let obj = DynamicObject::new(ObjectCode::Array);
        obj.insert_sub(1, SubInfo::new_visibile_str(16).rw_access(), b"hello").unwrap();
        let mut buf = [0u8; 5];
        obj.read(1, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn duplicate_sub_insert_is_rejected() {
        let obj = DynamicObject::new(ObjectCode::Record);
        obj.insert_sub(1, SubInfo::new_u32().rw_access(), &[]).unwrap();
        obj.write(1, &7u32.to_le_bytes()).unwrap();
        let err = obj.insert_sub(1, SubInfo::new_u8().rw_access(), &[]).unwrap_err();
        assert!(matches!(err, DictError::DuplicateSubObject { sub: 1 }));
        // The existing slot must survive the rejected insert untouched.
        assert_eq!(obj.read_u32(1).unwrap(), 7);
    }
}
