//! Resource lifecycle states and their CAS-guarded transitions.
//!
//! ```text
//! Unknown -> Requesting -> Requested -> ProcessingRequest -> Ready | Unavailable
//! Ready -> Uploading -> Uploaded -> Unloading -> Unloaded -> JustBeforeDeath
//! Uploading -> Ready                      (failed upload, retried later)
//! Unknown | Requested | ProcessingRequest | Ready | Unavailable | Unloaded -> JustBeforeDeath
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Lifecycle stage of a cached resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum ResourceState {
    /// Entry exists but nothing was requested yet.
    Unknown = 0,
    /// Request task is being set up.
    Requesting,
    /// Request task was submitted and has not started.
    Requested,
    /// A worker is fetching data from the provider.
    ProcessingRequest,
    /// Provider confirmed there is no data for this tile.
    Unavailable,
    /// Data is in main memory, waiting for upload.
    Ready,
    /// Data is being uploaded to the device.
    Uploading,
    /// Data is resident on the device.
    Uploaded,
    /// Device data is being released.
    Unloading,
    /// Device data was released.
    Unloaded,
    /// Entry is about to be removed from its collection.
    JustBeforeDeath,
}

impl ResourceState {
    pub const ALL: [ResourceState; 11] = [
        ResourceState::Unknown,
        ResourceState::Requesting,
        ResourceState::Requested,
        ResourceState::ProcessingRequest,
        ResourceState::Unavailable,
        ResourceState::Ready,
        ResourceState::Uploading,
        ResourceState::Uploaded,
        ResourceState::Unloading,
        ResourceState::Unloaded,
        ResourceState::JustBeforeDeath,
    ];

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ResourceState::Unknown,
            1 => ResourceState::Requesting,
            2 => ResourceState::Requested,
            3 => ResourceState::ProcessingRequest,
            4 => ResourceState::Unavailable,
            5 => ResourceState::Ready,
            6 => ResourceState::Uploading,
            7 => ResourceState::Uploaded,
            8 => ResourceState::Unloading,
            9 => ResourceState::Unloaded,
            _ => ResourceState::JustBeforeDeath,
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Unknown, Requesting)
                | (Requesting, Requested)
                | (Requested, ProcessingRequest)
                | (ProcessingRequest, Ready)
                | (ProcessingRequest, Unavailable)
                | (Ready, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, Ready)
                | (Uploaded, Unloading)
                | (Unloading, Unloaded)
                | (Unknown, JustBeforeDeath)
                | (Requested, JustBeforeDeath)
                | (ProcessingRequest, JustBeforeDeath)
                | (Ready, JustBeforeDeath)
                | (Unavailable, JustBeforeDeath)
                | (Unloaded, JustBeforeDeath)
        )
    }

    /// States in which the entry owns a device resource.
    pub fn holds_device_resource(self) -> bool {
        matches!(
            self,
            ResourceState::Uploading | ResourceState::Uploaded | ResourceState::Unloading
        )
    }

    /// States only ever held for the duration of a single operation.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ResourceState::Requesting | ResourceState::Uploading | ResourceState::Unloading
        )
    }
}

/// Atomically updated [`ResourceState`].
#[derive(Debug)]
pub struct AtomicResourceState(AtomicU8);

impl AtomicResourceState {
    pub fn new(state: ResourceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ResourceState {
        ResourceState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `expected` to `next` if the current state is `expected`.
    ///
    /// A `false` return means another actor already moved the state; the
    /// caller backs off without side effects.
    pub fn try_transition(&self, expected: ResourceState, next: ResourceState) -> bool {
        debug_assert!(
            expected.can_transition_to(next),
            "illegal state edge {expected:?} -> {next:?}"
        );
        self.0
            .compare_exchange(expected as u8, next as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
