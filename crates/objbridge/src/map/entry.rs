//! Bridge entries - one native address paired with one managed object

use crate::object::{DeferredMarker, Object, WeakObject};

/// Whether the entry keeps its managed object alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Strength {
    Strong,
    Weak,
}

/// How the entry came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum EntryOrigin {
    /// Created by `store` or by a native constructor; the bridge owns the
    /// native memory
    Store,
    /// Pre-existing native/managed pair owned by the host runtime
    Bridge,
}

#[derive(Clone)]
pub(crate) enum Referent {
    Strong(Object),
    Weak(WeakObject),
}

/// Association between a native address and a managed object
#[derive(Clone)]
pub struct BridgeEntry {
    address: usize,
    referent: Referent,
    origin: EntryOrigin,
    pinned: Option<Strength>,
}

impl BridgeEntry {
    pub(crate) fn new(address: usize, object: Object, origin: EntryOrigin) -> Self {
        Self {
            address,
            referent: Referent::Strong(object),
            origin,
            pinned: None,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn origin(&self) -> EntryOrigin {
        self.origin
    }

    pub fn is_bridge(&self) -> bool {
        self.origin == EntryOrigin::Bridge
    }

    pub fn strength(&self) -> Strength {
        match self.referent {
            Referent::Strong(_) => Strength::Strong,
            Referent::Weak(_) => Strength::Weak,
        }
    }

    /// Explicit strength set by `strengthen`/`weaken`
    pub fn pinned(&self) -> Option<Strength> {
        self.pinned
    }

    /// Managed object, unless it was held weakly and has been collected
    pub fn object(&self) -> Option<Object> {
        match &self.referent {
            Referent::Strong(obj) => Some(obj.clone()),
            Referent::Weak(weak) => weak.upgrade(),
        }
    }

    /// Identity of the referent, collected or not
    pub(crate) fn object_id(&self) -> usize {
        match &self.referent {
            Referent::Strong(obj) => obj.id(),
            Referent::Weak(weak) => weak.id(),
        }
    }

    pub fn is_collected(&self) -> bool {
        match &self.referent {
            Referent::Strong(_) => false,
            Referent::Weak(weak) => weak.is_collected(),
        }
    }

    /// Tag of the sentinel held by a deferred entry
    pub fn marker(&self) -> Option<DeferredMarker> {
        match &self.referent {
            Referent::Strong(obj) => obj.marker(),
            Referent::Weak(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.marker().is_some()
    }

    /// Strength this entry should have at the given native refcount
    pub fn derive_strength(&self, refcount: isize) -> Strength {
        if let Some(pinned) = self.pinned {
            return pinned;
        }
        if self.is_deferred() {
            return Strength::Strong;
        }
        let threshold = match self.origin {
            EntryOrigin::Store => 0,
            // The host's own reference accounts for one
            EntryOrigin::Bridge => 1,
        };
        if refcount > threshold {
            Strength::Strong
        } else {
            Strength::Weak
        }
    }

    pub(crate) fn pin(&mut self, strength: Strength) {
        self.pinned = Some(strength);
    }

    pub(crate) fn replace_object(&mut self, object: Object) {
        self.referent = Referent::Strong(object);
    }

    /// Switch the referent to `strength`
    ///
    /// A collected weak referent cannot be made strong again; the entry is
    /// left weak in that case.
    pub(crate) fn set_strength(&mut self, strength: Strength) -> Strength {
        let next = match (&self.referent, strength) {
            (Referent::Strong(obj), Strength::Weak) => Some(Referent::Weak(obj.downgrade())),
            (Referent::Weak(weak), Strength::Strong) => weak.upgrade().map(Referent::Strong),
            _ => None,
        };
        if let Some(referent) = next {
            self.referent = referent;
        }
        self.strength()
    }
}

impl std::fmt::Debug for BridgeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeEntry")
            .field("address", &format_args!("{:#x}", self.address))
            .field("origin", &self.origin)
            .field("strength", &self.strength())
            .field("pinned", &self.pinned)
            .field("marker", &self.marker())
            .finish()
    }
}
