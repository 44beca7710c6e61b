//! Pointer Map - bidirectional native address <-> managed object table
//!
//! Every native address known to the bridge has exactly one `BridgeEntry`,
//! and every managed object maps back to at most one address. Deferred
//! entries hold a fresh sentinel object each, so they never collide.
//!
//! The map never reads native memory itself. Callers pass the refcount they
//! read from the object header; strength is always derived from that value.

pub mod entry;

pub use entry::{BridgeEntry, EntryOrigin, Strength};

use crate::error::{BridgeError, Result};
use crate::object::Object;
use rustc_hash::FxHashMap;

/// Bidirectional pointer/object map
#[derive(Default)]
pub struct PointerMap {
    /// address -> entry
    entries: FxHashMap<usize, BridgeEntry>,

    /// object identity -> address
    by_object: FxHashMap<usize, usize>,
}

impl PointerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a store-created address with `object`
    pub fn associate(&mut self, address: usize, object: Object) -> Result<()> {
        self.insert(BridgeEntry::new(address, object, EntryOrigin::Store))
    }

    /// Associate a host-owned address with `object`
    ///
    /// The entry starts strong; callers re-derive its strength from the
    /// native refcount right away.
    pub fn bridge_associate(&mut self, address: usize, object: Object) -> Result<()> {
        self.insert(BridgeEntry::new(address, object, EntryOrigin::Bridge))
    }

    fn insert(&mut self, entry: BridgeEntry) -> Result<()> {
        let address = entry.address();
        if self.entries.contains_key(&address) {
            return Err(BridgeError::AlreadyMapped { address });
        }
        let id = entry.object_id();
        if let Some(&existing) = self.by_object.get(&id) {
            return Err(BridgeError::AlreadyMapped { address: existing });
        }

        self.by_object.insert(id, address);
        self.entries.insert(address, entry);
        Ok(())
    }

    pub fn has_ptr(&self, address: usize) -> bool {
        self.entries.contains_key(&address)
    }

    pub fn has_obj(&self, object: &Object) -> bool {
        self.get_ptr(object).is_some()
    }

    /// Address associated with `object`
    pub fn get_ptr(&self, object: &Object) -> Option<usize> {
        let address = *self.by_object.get(&object.id())?;
        let entry = self.entries.get(&address)?;
        (entry.object_id() == object.id()).then_some(address)
    }

    /// Managed object at `address`; `None` when unmapped or collected
    pub fn get_obj(&self, address: usize) -> Option<Object> {
        self.entries.get(&address).and_then(BridgeEntry::object)
    }

    pub fn entry(&self, address: usize) -> Option<&BridgeEntry> {
        self.entries.get(&address)
    }

    /// Re-derive the strength of the entry at `address`
    pub fn update_strength(&mut self, address: usize, refcount: isize) -> Option<Strength> {
        let entry = self.entries.get_mut(&address)?;
        let wanted = entry.derive_strength(refcount);
        Some(entry.set_strength(wanted))
    }

    /// Keep `object` alive regardless of its native refcount
    ///
    /// Returns false if the object is not mapped.
    pub fn strengthen(&mut self, object: &Object) -> bool {
        self.pin(object, Strength::Strong)
    }

    /// Stop keeping `object` alive regardless of its native refcount
    pub fn weaken(&mut self, object: &Object) -> bool {
        self.pin(object, Strength::Weak)
    }

    fn pin(&mut self, object: &Object, strength: Strength) -> bool {
        let Some(address) = self.get_ptr(object) else {
            return false;
        };
        match self.entries.get_mut(&address) {
            Some(entry) => {
                entry.pin(strength);
                entry.set_strength(strength);
                true
            },
            None => false,
        }
    }

    /// Remove the entry at `address`
    pub fn release(&mut self, address: usize) -> Option<BridgeEntry> {
        let entry = self.entries.remove(&address)?;
        let id = entry.object_id();
        if self.by_object.get(&id) == Some(&address) {
            self.by_object.remove(&id);
        }
        Some(entry)
    }

    /// Swap the sentinel of a deferred entry for the materialized object
    ///
    /// Address, origin and pinned strength are preserved.
    pub fn replace_deferred(&mut self, address: usize, object: Object) -> Result<()> {
        let entry = self.entries.get_mut(&address).ok_or(BridgeError::NotFound {
            address,
            operation: "Actualize",
        })?;
        if !entry.is_deferred() {
            return Err(BridgeError::Internal(format!(
                "entry at {:#x} is not deferred",
                address
            )));
        }

        self.by_object.remove(&entry.object_id());
        entry.replace_object(object.clone());
        self.by_object.insert(object.id(), address);
        Ok(())
    }

    /// Put the sentinel of a deferred entry back after its materialization
    /// failed
    pub fn restore_deferred(&mut self, address: usize, sentinel: Object) -> Result<()> {
        if sentinel.marker().is_none() {
            return Err(BridgeError::Internal(format!(
                "restoring {:#x} with a non-sentinel object",
                address
            )));
        }
        let entry = self.entries.get_mut(&address).ok_or(BridgeError::NotFound {
            address,
            operation: "Actualize",
        })?;

        self.by_object.remove(&entry.object_id());
        entry.replace_object(sentinel.clone());
        self.by_object.insert(sentinel.id(), address);
        Ok(())
    }

    /// Addresses of host-owned entries, in ascending order
    pub fn bridge_addresses(&self) -> Vec<usize> {
        let mut addresses: Vec<usize> = self
            .entries
            .values()
            .filter(|entry| entry.is_bridge())
            .map(BridgeEntry::address)
            .collect();
        addresses.sort_unstable();
        addresses
    }

    /// Addresses that pin native memory: strong entries and bridge entries
    pub fn owned_addresses(&self) -> Vec<usize> {
        let mut addresses: Vec<usize> = self
            .entries
            .values()
            .filter(|entry| entry.is_bridge() || entry.strength() == Strength::Strong)
            .map(BridgeEntry::address)
            .collect();
        addresses.sort_unstable();
        addresses
    }

    /// Re-derive every bridge entry and drop the ones whose managed object
    /// has been collected
    ///
    /// Returns the pruned addresses.
    pub fn check_bridge_ptrs(&mut self, refcount_of: impl Fn(usize) -> isize) -> Vec<usize> {
        let mut pruned = Vec::new();
        for address in self.bridge_addresses() {
            let refcount = refcount_of(address);
            let Some(entry) = self.entries.get_mut(&address) else {
                continue;
            };
            let wanted = entry.derive_strength(refcount);
            if entry.set_strength(wanted) == Strength::Weak && entry.is_collected() {
                pruned.push(address);
            }
        }
        for &address in &pruned {
            self.release(address);
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bridge_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_bridge()).count()
    }

    pub fn deferred_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_deferred()).count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_object.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::DeferredMarker;

    #[test]
    fn test_associate_both_directions() {
        let mut map = PointerMap::new();
        let obj = Object::from("abc");

        map.associate(0x1000, obj.clone()).unwrap();

        assert!(map.has_ptr(0x1000));
        assert!(map.has_obj(&obj));
        assert_eq!(map.get_ptr(&obj), Some(0x1000));
        assert!(map.get_obj(0x1000).unwrap().is(&obj));
    }

    #[test]
    fn test_double_association_rejected() {
        let mut map = PointerMap::new();
        let obj = Object::int(3);
        map.associate(0x1000, obj.clone()).unwrap();

        assert!(matches!(
            map.associate(0x1000, Object::int(4)),
            Err(BridgeError::AlreadyMapped { address: 0x1000 })
        ));
        assert!(matches!(
            map.associate(0x2000, obj),
            Err(BridgeError::AlreadyMapped { address: 0x1000 })
        ));
    }

    #[test]
    fn test_deferred_entries_share_tag_not_identity() {
        let mut map = PointerMap::new();
        map.associate(0x1000, Object::deferred_marker(DeferredMarker::Tuple))
            .unwrap();
        map.associate(0x2000, Object::deferred_marker(DeferredMarker::Tuple))
            .unwrap();

        assert_eq!(map.deferred_count(), 2);
        assert!(!map
            .get_obj(0x1000)
            .unwrap()
            .is(&map.get_obj(0x2000).unwrap()));
    }

    #[test]
    fn test_replace_deferred_keeps_address() {
        let mut map = PointerMap::new();
        let marker = Object::deferred_marker(DeferredMarker::String);
        map.associate(0x1000, marker.clone()).unwrap();

        let real = Object::from("hi");
        map.replace_deferred(0x1000, real.clone()).unwrap();

        assert_eq!(map.get_ptr(&real), Some(0x1000));
        assert!(!map.has_obj(&marker));
        assert_eq!(map.deferred_count(), 0);
        assert!(map.replace_deferred(0x1000, Object::none()).is_err());
    }

    #[test]
    fn test_restore_deferred_after_failed_materialize() {
        let mut map = PointerMap::new();
        let marker = Object::deferred_marker(DeferredMarker::List);
        map.associate(0x1000, marker.clone()).unwrap();
        let partial = Object::list(Vec::new());
        map.replace_deferred(0x1000, partial.clone()).unwrap();

        map.restore_deferred(0x1000, marker.clone()).unwrap();

        assert!(map.entry(0x1000).unwrap().is_deferred());
        assert_eq!(map.get_ptr(&marker), Some(0x1000));
        assert!(!map.has_obj(&partial));
        assert!(map.restore_deferred(0x1000, Object::int(1)).is_err());
    }

    #[test]
    fn test_weak_entry_lets_object_go() {
        let mut map = PointerMap::new();
        let obj = Object::int(12);
        map.associate(0x1000, obj.clone()).unwrap();

        assert_eq!(map.update_strength(0x1000, 0), Some(Strength::Weak));
        drop(obj);

        assert!(map.has_ptr(0x1000));
        assert!(map.get_obj(0x1000).is_none());
    }

    #[test]
    fn test_check_bridge_ptrs_prunes_collected() {
        let mut map = PointerMap::new();
        let kept = Object::int(1);
        let lost = Object::int(2);
        map.bridge_associate(0x1000, kept.clone()).unwrap();
        map.bridge_associate(0x2000, lost.clone()).unwrap();
        map.associate(0x3000, Object::int(3)).unwrap();
        drop(lost);

        let pruned = map.check_bridge_ptrs(|_| 1);

        assert_eq!(pruned, vec![0x2000]);
        assert!(map.has_ptr(0x1000));
        assert!(!map.has_ptr(0x2000));
        assert!(map.has_ptr(0x3000));
        assert!(map.get_obj(0x1000).unwrap().is(&kept));
    }

    #[test]
    fn test_bridge_entry_strong_while_native_holds_extra_ref() {
        let mut map = PointerMap::new();
        map.bridge_associate(0x1000, Object::int(7)).unwrap();

        // Host object dropped, but native code still holds a second reference
        assert!(map.check_bridge_ptrs(|_| 2).is_empty());
        assert_eq!(map.get_obj(0x1000).and_then(|o| o.as_int()), Some(7));
    }

    #[test]
    fn test_weaken_then_strengthen() {
        let mut map = PointerMap::new();
        let obj = Object::int(5);
        map.associate(0x1000, obj.clone()).unwrap();

        assert!(map.weaken(&obj));
        assert_eq!(map.entry(0x1000).unwrap().strength(), Strength::Weak);
        assert_eq!(map.update_strength(0x1000, 3), Some(Strength::Weak));

        assert!(map.strengthen(&obj));
        assert_eq!(map.update_strength(0x1000, 0), Some(Strength::Strong));
        assert!(!map.strengthen(&Object::int(5)));
    }

    #[test]
    fn test_release_forgets_both_sides() {
        let mut map = PointerMap::new();
        let obj = Object::int(1);
        map.associate(0x1000, obj.clone()).unwrap();

        assert!(map.release(0x1000).is_some());
        assert!(!map.has_ptr(0x1000));
        assert!(!map.has_obj(&obj));
        map.associate(0x2000, obj).unwrap();
    }
}
