//! Request scheduler: turns needed tiles into fetch tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::collection::ResourceCollection;
use crate::entry::ResourceEntry;
use crate::signals::RenderSignals;
use crate::state::ResourceState;
use crate::tile::{NeededTiles, TileId, ZoomLevel};
use crate::worker::{CancellationToken, TaskHandle, WorkerPool};

/// Request counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestStats {
    pub submitted: u64,
    pub ready: u64,
    pub unavailable: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct RequestCounters {
    submitted: AtomicU64,
    ready: AtomicU64,
    unavailable: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Issues cancellable fetch tasks for needed tiles.
pub struct RequestScheduler {
    workers: WorkerPool,
    signals: Arc<dyn RenderSignals>,
    counters: Arc<RequestCounters>,
}

impl RequestScheduler {
    pub fn new(workers: WorkerPool, signals: Arc<dyn RenderSignals>) -> Self {
        Self {
            workers,
            signals,
            counters: Arc::new(RequestCounters::default()),
        }
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Request every needed tile missing from the active collections.
    ///
    /// Returns the number of tasks submitted.
    pub fn request_needed(
        &self,
        collections: &[Arc<ResourceCollection>],
        needed: &NeededTiles,
    ) -> usize {
        let mut submitted = 0;
        for collection in collections.iter().filter(|c| c.is_active()) {
            for tile in &needed.tiles {
                if self.request_tile(collection, *tile, needed.zoom) {
                    submitted += 1;
                }
            }
        }
        if submitted > 0 {
            tracing::debug!(submitted, zoom = %needed.zoom, "requested tiles");
        }
        submitted
    }

    /// Submit a fetch task for (tile, zoom) if its entry is still `Unknown`.
    pub fn request_tile(
        &self,
        collection: &Arc<ResourceCollection>,
        tile: TileId,
        zoom: ZoomLevel,
    ) -> bool {
        let entry = collection.obtain_or_create(tile, zoom);
        if !entry.try_transition(ResourceState::Unknown, ResourceState::Requesting) {
            return false;
        }

        let task = TaskHandle::new();
        entry.set_request_task(task.clone());
        let published = entry.try_transition(ResourceState::Requesting, ResourceState::Requested);
        debug_assert!(published, "Requesting is owned by the scheduler");

        let body_entry = Arc::clone(&entry);
        let signals = Arc::clone(&self.signals);
        let counters = Arc::clone(&self.counters);
        let done_counters = Arc::clone(&self.counters);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.workers.submit(
            &task,
            move |token| process_request(&body_entry, token, signals.as_ref(), &counters),
            move |was_cancelled| complete_request(&entry, was_cancelled, &done_counters),
        );
        true
    }

    pub fn stats(&self) -> RequestStats {
        RequestStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            ready: self.counters.ready.load(Ordering::Relaxed),
            unavailable: self.counters.unavailable.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Task body, on a worker thread.
///
/// Losing any CAS means eviction got there first: request cancellation so the
/// completion handler cleans up, and keep no data.
fn process_request(
    entry: &Arc<ResourceEntry>,
    token: &CancellationToken,
    signals: &dyn RenderSignals,
    counters: &RequestCounters,
) {
    if !entry.try_transition(ResourceState::Requested, ResourceState::ProcessingRequest) {
        token.cancel();
        return;
    }

    match entry.obtain_data() {
        Ok(true) => {
            if entry.try_transition(ResourceState::ProcessingRequest, ResourceState::Ready) {
                counters.ready.fetch_add(1, Ordering::Relaxed);
                signals.request_resources_upload();
            } else {
                entry.release_source_data();
                token.cancel();
            }
        }
        Ok(false) => {
            if entry.try_transition(ResourceState::ProcessingRequest, ResourceState::Unavailable) {
                counters.unavailable.fetch_add(1, Ordering::Relaxed);
                signals.request_redraw();
            } else {
                token.cancel();
            }
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                tile = %entry.tile(),
                zoom = %entry.zoom(),
                error = %e,
                "request failed, will retry"
            );
            if entry.try_transition(
                ResourceState::ProcessingRequest,
                ResourceState::JustBeforeDeath,
            ) {
                entry.remove_from_collection();
            } else {
                token.cancel();
            }
        }
    }
}

/// Completion handler, on a worker thread.
fn complete_request(entry: &Arc<ResourceEntry>, was_cancelled: bool, counters: &RequestCounters) {
    entry.clear_request_task();
    if !was_cancelled {
        return;
    }
    counters.cancelled.fetch_add(1, Ordering::Relaxed);

    let dead = [
        ResourceState::Requested,
        ResourceState::Ready,
        ResourceState::Unavailable,
    ]
    .into_iter()
    .any(|state| entry.try_transition(state, ResourceState::JustBeforeDeath))
        || entry.state() == ResourceState::JustBeforeDeath;

    if dead {
        entry.release_source_data();
        entry.remove_from_collection();
    }
}
