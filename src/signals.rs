//! Notifications sent back to the renderer.

/// Renderer hooks; called from worker and device threads.
pub trait RenderSignals: Send + Sync {
    /// Something visible changed; draw another frame.
    fn request_redraw(&self);

    /// New data is Ready and waits for upload.
    fn request_resources_upload(&self);
}

/// Signals sink for renderers that poll every frame anyway.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSignals;

impl RenderSignals for NoSignals {
    fn request_redraw(&self) {}

    fn request_resources_upload(&self) {}
}
