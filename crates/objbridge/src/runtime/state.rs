//! Bridge state guarded by the global lock

use super::actualize::{actualize_type_object, Actualizer};
use super::resources::ResourceTable;
use super::temps::TempObjectSet;
use crate::allocator::Allocator;
use crate::error::Result;
use crate::logging::BridgeLogger;
use crate::map::PointerMap;
use crate::object::{header, BuiltinType, BuiltinTypes, DeferredMarker, Object, Singletons};
use crate::stats::BridgeCounters;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// Mutable bridge state
///
/// Only reachable through the bridge lock. No method here calls native code;
/// anything that may run a destructor returns a `Release` that the caller
/// performs after giving up its borrow.
pub struct BridgeState {
    pub(crate) map: PointerMap,
    pub(crate) allocator: Box<dyn Allocator>,
    pub(crate) types: BuiltinTypes,
    pub(crate) singletons: Singletons,

    /// Managed views of actualized type objects; types live as long as the
    /// bridge
    pub(crate) type_objects: Vec<Object>,

    /// Type address -> actualization routine
    pub(crate) actualizers: IndexMap<usize, Actualizer>,

    pub(crate) temps: TempObjectSet,

    /// String contents -> interned address
    pub(crate) interned: FxHashMap<Vec<u8>, usize>,

    pub(crate) resources: ResourceTable,

    /// Deferred tuples currently being materialized
    pub(crate) actualizing: FxHashSet<usize>,

    /// Blocks returned to the allocator and not handed out again; their
    /// headers must not be read
    pub(crate) released: FxHashSet<usize>,

    /// Set for the duration of `dispose`
    pub(crate) disposing: bool,

    pub(crate) logger: Arc<BridgeLogger>,
    pub(crate) counters: Arc<BridgeCounters>,
}

impl BridgeState {
    pub(crate) fn new(
        allocator: Box<dyn Allocator>,
        logger: Arc<BridgeLogger>,
        counters: Arc<BridgeCounters>,
    ) -> Result<Self> {
        let types = BuiltinTypes::new();
        let singletons = Singletons::new(&types);

        let mut state = Self {
            map: PointerMap::new(),
            allocator,
            types,
            singletons,
            type_objects: Vec::new(),
            actualizers: IndexMap::new(),
            temps: TempObjectSet::new(),
            interned: FxHashMap::default(),
            resources: ResourceTable::new(),
            actualizing: FxHashSet::default(),
            released: FxHashSet::default(),
            disposing: false,
            logger,
            counters,
        };
        state.install_builtins()?;
        Ok(state)
    }

    /// Map the builtin types and singletons
    fn install_builtins(&mut self) -> Result<()> {
        let builtins: Vec<(BuiltinType, usize)> = self.types.iter().collect();
        for (ty, address) in builtins {
            self.map
                .bridge_associate(address, Object::type_object(ty.name()))?;
            self.refresh_strength(address);
        }

        let none = self.singletons.none();
        self.map
            .associate(none, Object::deferred_marker(DeferredMarker::None))?;

        for value in [true, false] {
            let address = self.singletons.bool(value);
            self.map.bridge_associate(address, Object::bool(value))?;
            self.refresh_strength(address);
        }

        self.actualizers.insert(
            self.types.address(BuiltinType::Type),
            Arc::new(actualize_type_object),
        );
        Ok(())
    }

    /// Re-derive strength of a mapped address from its native refcount
    pub(crate) fn refresh_strength(&mut self, address: usize) {
        // SAFETY: mapped addresses point to live native objects.
        let refcount = unsafe { header::read_refcount(address) };
        self.map.update_strength(address, refcount);
    }

    /// Allocate a block of `size` zero bytes
    pub(crate) fn alloc_block(&mut self, size: usize) -> Result<usize> {
        let address = self.allocator.alloc(size)?;
        self.released.remove(&address);
        Ok(address)
    }

    /// Return a block to the allocator
    pub(crate) fn free_block(&mut self, address: usize) -> Result<()> {
        self.allocator.free(address)?;
        self.released.insert(address);
        Ok(())
    }

    pub(crate) fn type_address(&self, ty: BuiltinType) -> usize {
        self.types.address(ty)
    }

    /// Whether the object at `address` has the builtin type `ty`
    pub(crate) fn has_type(&self, address: usize, ty: BuiltinType) -> bool {
        // SAFETY: callers only pass mapped or freshly allocated addresses.
        unsafe { header::read_type(address) == self.types.address(ty) }
    }
}
