//! Entries of one provider binding.
//!
//! The map is only mutated under its lock; entry state is read and written
//! without it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::ResourceEntry;
use crate::provider::BoundProvider;
use crate::state::ResourceState;
use crate::tile::{BindingSlot, ResourceType, TileId, ZoomLevel};

/// Collection key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub zoom: ZoomLevel,
    pub tile: TileId,
}

pub struct ResourceCollection {
    slot: BindingSlot,
    provider: BoundProvider,
    entries: Mutex<HashMap<EntryKey, Arc<ResourceEntry>>>,
    /// Cleared once the provider is unbound or replaced.
    active: AtomicBool,
}

impl ResourceCollection {
    pub fn new(slot: BindingSlot, provider: BoundProvider) -> Arc<Self> {
        Arc::new(Self {
            slot,
            provider,
            entries: Mutex::new(HashMap::new()),
            active: AtomicBool::new(true),
        })
    }

    pub fn slot(&self) -> BindingSlot {
        self.slot
    }

    pub fn resource_type(&self) -> ResourceType {
        self.slot.resource_type
    }

    pub fn provider(&self) -> &BoundProvider {
        &self.provider
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// The entry for (tile, zoom), created in `Unknown` if absent.
    pub fn obtain_or_create(self: &Arc<Self>, tile: TileId, zoom: ZoomLevel) -> Arc<ResourceEntry> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(EntryKey { zoom, tile }).or_insert_with(|| {
            Arc::new(ResourceEntry::new(
                self.resource_type(),
                tile,
                zoom,
                Arc::downgrade(self),
            ))
        });
        Arc::clone(entry)
    }

    pub fn get(&self, tile: TileId, zoom: ZoomLevel) -> Option<Arc<ResourceEntry>> {
        self.entries.lock().get(&EntryKey { zoom, tile }).cloned()
    }

    /// Snapshot of entries accepted by `filter`.
    ///
    /// The filter may set its `stop` flag to end the scan early.
    pub fn for_each<F>(&self, mut filter: F) -> Vec<Arc<ResourceEntry>>
    where
        F: FnMut(&Arc<ResourceEntry>, &mut bool) -> bool,
    {
        let entries = self.entries.lock();
        let mut matched = Vec::new();
        let mut stop = false;
        for entry in entries.values() {
            if filter(entry, &mut stop) {
                matched.push(Arc::clone(entry));
            }
            if stop {
                break;
            }
        }
        matched
    }

    /// Snapshot of every entry.
    pub fn all(&self) -> Vec<Arc<ResourceEntry>> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn contains_state(&self, state: ResourceState) -> bool {
        !self
            .for_each(|entry, stop| {
                *stop = entry.state() == state;
                *stop
            })
            .is_empty()
    }

    pub fn remove(&self, tile: TileId, zoom: ZoomLevel) -> Option<Arc<ResourceEntry>> {
        self.entries.lock().remove(&EntryKey { zoom, tile })
    }

    /// Remove `entry` only if it is the one stored under its key.
    pub fn remove_entry(&self, entry: &Arc<ResourceEntry>) -> bool {
        let key = EntryKey {
            zoom: entry.zoom(),
            tile: entry.tile(),
        };
        let removed = {
            let mut entries = self.entries.lock();
            let same = entries
                .get(&key)
                .is_some_and(|stored| Arc::ptr_eq(stored, entry));
            if same {
                entries.remove(&key)
            } else {
                None
            }
        };
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Entry count per state, for diagnostics.
    pub fn state_histogram(&self) -> BTreeMap<ResourceState, usize> {
        let mut histogram = BTreeMap::new();
        for entry in self.entries.lock().values() {
            *histogram.entry(entry.state()).or_insert(0) += 1;
        }
        histogram
    }
}

impl std::fmt::Debug for ResourceCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCollection")
            .field("slot", &self.slot)
            .field("provider", &self.provider)
            .field("active", &self.is_active())
            .field("entries", &self.len())
            .finish()
    }
}
