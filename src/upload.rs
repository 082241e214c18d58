//! Upload pipeline: moves Ready data onto the device and evicts junk.
//!
//! Everything here runs on the device-owning thread: the render thread in
//! per-frame mode, or the dedicated upload thread in wakeup mode.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::atlas::AtlasAllocator;
use crate::collection::ResourceCollection;
use crate::config::{upload_timing_enabled, UploadBudget};
use crate::device::Device;
use crate::entry::{ResourceEntry, UploadContext};
use crate::error::consistency_violation;
use crate::signals::RenderSignals;
use crate::state::ResourceState;
use crate::symbols::SymbolRegistry;
use crate::tile::NeededTiles;

/// Result of one upload pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub uploaded: usize,
    /// Ready entries were left behind by the budget or by failed uploads.
    pub more_available: bool,
}

/// Result of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupOutcome {
    /// Entries whose device data was released.
    pub unloaded: usize,
    pub removed: usize,
    /// Entries caught mid-transition and left for the next pass.
    pub transient: usize,
}

impl CleanupOutcome {
    fn absorb(&mut self, other: CleanupOutcome) {
        self.unloaded += other.unloaded;
        self.removed += other.removed;
        self.transient += other.transient;
    }
}

enum Eviction {
    Removed { unloaded: bool },
    Transient(ResourceState),
}

pub struct UploadPipeline {
    device: Arc<dyn Device>,
    atlas: AtlasAllocator,
    symbols: Arc<SymbolRegistry>,
    signals: Arc<dyn RenderSignals>,
    transient_warning_passes: u32,
    /// Whether per-upload timing is enabled (cached from MAPTILE_UPLOAD_TIMING).
    upload_timing: bool,
}

impl UploadPipeline {
    pub fn new(
        device: Arc<dyn Device>,
        atlas: AtlasAllocator,
        symbols: Arc<SymbolRegistry>,
        signals: Arc<dyn RenderSignals>,
        transient_warning_passes: u32,
    ) -> Self {
        Self {
            device,
            atlas,
            symbols,
            signals,
            transient_warning_passes,
            upload_timing: upload_timing_enabled(),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn atlas(&self) -> &AtlasAllocator {
        &self.atlas
    }

    pub fn symbols(&self) -> &Arc<SymbolRegistry> {
        &self.symbols
    }

    fn context(&self) -> UploadContext<'_> {
        UploadContext {
            device: &self.device,
            atlas: &self.atlas,
            symbols: &self.symbols,
        }
    }

    /// Upload Ready entries of active collections, at most `budget` of them.
    pub fn upload_resources(
        &self,
        collections: &[Arc<ResourceCollection>],
        budget: UploadBudget,
    ) -> UploadOutcome {
        let mut outcome = UploadOutcome::default();
        let ctx = self.context();

        for collection in collections.iter().filter(|c| c.is_active()) {
            if budget.is_exhausted(outcome.uploaded) {
                if collection.contains_state(ResourceState::Ready) {
                    outcome.more_available = true;
                    break;
                }
                continue;
            }

            // One extra match tells us whether the budget left anything behind.
            let mut matched = 0usize;
            let uploaded_before = outcome.uploaded;
            let ready = collection.for_each(|entry, stop| {
                if entry.state() != ResourceState::Ready {
                    return false;
                }
                matched += 1;
                *stop = budget.is_exhausted(uploaded_before + matched - 1);
                true
            });

            for entry in ready {
                if budget.is_exhausted(outcome.uploaded) {
                    outcome.more_available = true;
                    break;
                }
                if !entry.try_transition(ResourceState::Ready, ResourceState::Uploading) {
                    continue;
                }
                if self.upload_entry(&entry, &ctx) {
                    outcome.uploaded += 1;
                } else {
                    outcome.more_available = true;
                }
            }
        }
        outcome
    }

    fn upload_entry(&self, entry: &Arc<ResourceEntry>, ctx: &UploadContext<'_>) -> bool {
        let t0 = self.upload_timing.then(Instant::now);
        match entry.upload_to_gpu(ctx) {
            Ok(()) => {
                let published =
                    entry.try_transition(ResourceState::Uploading, ResourceState::Uploaded);
                debug_assert!(published, "Uploading is owned by the uploader");
                if let Some(t) = t0 {
                    tracing::info!(
                        tile = %entry.tile(),
                        zoom = %entry.zoom(),
                        elapsed = ?t.elapsed(),
                        "upload timing"
                    );
                }
                self.signals.request_redraw();
                true
            }
            Err(e) => {
                tracing::error!(
                    resource = ?entry.resource_type(),
                    tile = %entry.tile(),
                    zoom = %entry.zoom(),
                    error = %e,
                    "upload failed, will retry"
                );
                entry.try_transition(ResourceState::Uploading, ResourceState::Ready);
                false
            }
        }
    }

    /// Evict every entry not in `needed`; inactive collections lose everything.
    pub fn cleanup_junk_resources(
        &self,
        collections: &[Arc<ResourceCollection>],
        needed: &NeededTiles,
    ) -> CleanupOutcome {
        let mut outcome = CleanupOutcome::default();
        for collection in collections {
            let keep = collection.is_active().then_some(needed);
            outcome.absorb(self.cleanup_collection(collection, keep));
        }
        if outcome.removed > 0 || outcome.transient > 0 {
            tracing::debug!(
                unloaded = outcome.unloaded,
                removed = outcome.removed,
                transient = outcome.transient,
                "cleaned up junk resources"
            );
        }
        outcome
    }

    /// Evict entries of one collection; `keep = None` treats all as junk.
    ///
    /// Entries caught mid-transition are retried on the next pass.
    pub fn cleanup_collection(
        &self,
        collection: &ResourceCollection,
        keep: Option<&NeededTiles>,
    ) -> CleanupOutcome {
        let junk = collection.for_each(|entry, _| {
            let needed = keep.is_some_and(|needed| needed.contains(entry.tile(), entry.zoom()));
            if needed {
                entry.reset_transient_passes();
            }
            !needed
        });

        let mut outcome = CleanupOutcome::default();
        for entry in junk {
            match self.evict(&entry) {
                Eviction::Removed { unloaded } => {
                    outcome.unloaded += usize::from(unloaded);
                    outcome.removed += usize::from(collection.remove_entry(&entry));
                }
                Eviction::Transient(state) => {
                    outcome.transient += 1;
                    let passes = entry.note_transient_pass();
                    if passes == self.transient_warning_passes {
                        tracing::warn!(
                            tile = %entry.tile(),
                            zoom = %entry.zoom(),
                            state = ?state,
                            passes,
                            "entry stuck mid-transition"
                        );
                    }
                }
            }
        }
        outcome
    }

    /// Tear down a collection whose binding is gone.
    ///
    /// An entry still `Requesting` is left for the next call; one found
    /// `Uploading` or `Unloading` is a consistency violation.
    pub fn release_resources_from(&self, collection: &ResourceCollection) -> CleanupOutcome {
        collection.deactivate();
        let mut outcome = CleanupOutcome::default();
        for entry in collection.all() {
            match self.evict(&entry) {
                Eviction::Removed { unloaded } => {
                    outcome.unloaded += usize::from(unloaded);
                    outcome.removed += usize::from(collection.remove_entry(&entry));
                }
                Eviction::Transient(ResourceState::Requesting) => outcome.transient += 1,
                Eviction::Transient(state) => {
                    outcome.transient += 1;
                    consistency_violation(&format!(
                        "{:?} {}@{} in {state:?} while releasing {}",
                        entry.resource_type(),
                        entry.tile(),
                        entry.zoom(),
                        collection.slot()
                    ));
                }
            }
        }
        tracing::debug!(
            slot = %collection.slot(),
            unloaded = outcome.unloaded,
            removed = outcome.removed,
            "released collection"
        );
        outcome
    }

    /// Drive one entry towards `JustBeforeDeath`.
    fn evict(&self, entry: &Arc<ResourceEntry>) -> Eviction {
        use ResourceState::*;

        if entry.try_transition(Unknown, JustBeforeDeath) {
            return Eviction::Removed { unloaded: false };
        }
        if entry.try_transition(Requested, JustBeforeDeath)
            || entry.try_transition(ProcessingRequest, JustBeforeDeath)
        {
            entry.cancel_request();
            return Eviction::Removed { unloaded: false };
        }
        if entry.try_transition(Ready, JustBeforeDeath) {
            entry.release_source_data();
            return Eviction::Removed { unloaded: false };
        }
        if entry.try_transition(Unavailable, JustBeforeDeath) {
            return Eviction::Removed { unloaded: false };
        }
        if entry.try_transition(Uploaded, Unloading) {
            entry.unload_from_gpu(&self.context());
            let unloaded = entry.try_transition(Unloading, Unloaded);
            debug_assert!(unloaded, "Unloading is owned by the evictor");
            entry.try_transition(Unloaded, JustBeforeDeath);
            return Eviction::Removed { unloaded: true };
        }
        if entry.try_transition(Unloaded, JustBeforeDeath) {
            return Eviction::Removed { unloaded: false };
        }

        match entry.state() {
            JustBeforeDeath => Eviction::Removed { unloaded: false },
            state => Eviction::Transient(state),
        }
    }
}

/// One unit of device-thread work run by [`UploadWorker`].
pub(crate) trait DevicePass: Send + Sync + 'static {
    /// First thing the upload thread does.
    fn on_start(&self);

    /// Returns `true` while uploads remain.
    fn run_pass(&self) -> bool;

    /// Last thing the upload thread does.
    fn on_stop(&self);
}

#[derive(Default)]
struct WakeupFlags {
    pending: bool,
    stop: bool,
}

/// Condition the upload thread sleeps on.
#[derive(Default)]
pub(crate) struct WakeupSignal {
    flags: Mutex<WakeupFlags>,
    cond: Condvar,
}

impl WakeupSignal {
    pub fn notify(&self) {
        self.flags.lock().pending = true;
        self.cond.notify_one();
    }

    fn request_stop(&self) {
        self.flags.lock().stop = true;
        self.cond.notify_one();
    }

    fn stop_requested(&self) -> bool {
        self.flags.lock().stop
    }

    /// Sleep until notified; `false` once a stop was requested.
    fn wait(&self) -> bool {
        let mut flags = self.flags.lock();
        while !flags.pending && !flags.stop {
            self.cond.wait(&mut flags);
        }
        flags.pending = false;
        !flags.stop
    }
}

/// Dedicated thread that owns the device in wakeup mode.
pub(crate) struct UploadWorker {
    signal: Arc<WakeupSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UploadWorker {
    pub fn start(signal: Arc<WakeupSignal>, pass: Arc<dyn DevicePass>) -> Self {
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("maptile-upload".into())
            .spawn(move || {
                pass.on_start();
                while thread_signal.wait() {
                    while pass.run_pass() {
                        if thread_signal.stop_requested() {
                            break;
                        }
                    }
                }
                pass.on_stop();
                tracing::debug!("upload thread stopped");
            })
            .expect("failed to spawn maptile upload thread");

        Self {
            signal,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn wake(&self) {
        self.signal.notify();
    }

    /// Stop the thread after its teardown and wait for it.
    pub fn stop(&self) {
        self.signal.request_stop();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        let guard = self.handle.lock();
        match guard.as_ref() {
            Some(h) => !h.is_finished(),
            None => false,
        }
    }
}

impl Drop for UploadWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
