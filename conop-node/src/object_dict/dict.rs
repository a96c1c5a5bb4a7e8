//! The runtime object dictionary
//!
//! Unlike a build-time generated `&'static [ODEntry]` table, objects can be registered and
//! removed from an [`ObjectDictionary`] while the node is running. Lookups take a read lock on
//! the index map; an individual object's own internal locking (see [`DynamicObject`](super::DynamicObject))
//! governs concurrent access to its sub objects.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::ObjectAccess;
use crate::error::DictError;

/// A dynamically shaped collection of objects, indexed by their 16-bit object index
#[derive(Default)]
pub struct ObjectDictionary {
    objects: RwLock<BTreeMap<u16, Arc<dyn ObjectAccess>>>,
}

impl std::fmt::Debug for ObjectDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let indices: Vec<u16> = self.indices();
        f.debug_struct("ObjectDictionary")
            .field("indices", &indices)
            .finish()
    }
}

impl ObjectDictionary {
    /// Create an empty object dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object at the given index
    ///
    /// Fails with [`DictError::DuplicateObject`] if an object is already registered there;
    /// callers that mean to replace an object must [`Self::remove_object`] it first.
    pub fn insert_object(&self, index: u16, object: Arc<dyn ObjectAccess>) -> Result<(), DictError> {
        use std::collections::btree_map::Entry;
        match self.objects.write().unwrap().entry(index) {
            Entry::Occupied(_) => Err(DictError::DuplicateObject { index }),
            Entry::Vacant(slot) => {
                slot.insert(object);
                Ok(())
            }
        }
    }

    /// Remove the object at the given index, if any
    pub fn remove_object(&self, index: u16) -> Option<Arc<dyn ObjectAccess>> {
        self.objects.write().unwrap().remove(&index)
    }

    /// Look up an object by index
    pub fn get(&self, index: u16) -> Option<Arc<dyn ObjectAccess>> {
        self.objects.read().unwrap().get(&index).cloned()
    }

    /// True if an object is registered at this index
    pub fn contains(&self, index: u16) -> bool {
        self.objects.read().unwrap().contains_key(&index)
    }

    /// The number of registered objects
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    /// True if no objects are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The indices of every registered object, in ascending order
    pub fn indices(&self) -> Vec<u16> {
        self.objects.read().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use conop_common::objects::ObjectCode;

    use super::*;
    use crate::object_dict::DynamicObject;

    #[test]
    fn insert_and_lookup() {
        let dict = ObjectDictionary::new();
        assert!(dict.get(0x1000).is_none());

        dict.insert_object(0x1000, Arc::new(DynamicObject::new(ObjectCode::Var))).unwrap();
        assert!(dict.contains(0x1000));
        assert_eq!(dict.len(), 1);

        dict.remove_object(0x1000);
        assert!(!dict.contains(0x1000));
        assert_eq!(dict.len(), 0);
    }

    #[test]
    fn indices_are_sorted() {
        let dict = ObjectDictionary::new();
        for index in [0x6000, 0x1000, 0x2000] {
            dict.insert_object(index, Arc::new(DynamicObject::new(ObjectCode::Var))).unwrap();
        }
        assert_eq!(dict.indices(), vec![0x1000, 0x2000, 0x6000]);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let dict = ObjectDictionary::new();
        dict.insert_object(0x1000, Arc::new(DynamicObject::new(ObjectCode::Var))).unwrap();
        let err = dict.insert_object(0x1000, Arc::new(DynamicObject::new(ObjectCode::Var))).unwrap_err();
        assert!(matches!(err, DictError::DuplicateObject { index: 0x1000 }));
        assert_eq!(dict.len(), 1);
    }
}
