//! Error types for the rendering pipeline
//!
//! Most failures inside the pipeline degrade to a simpler render path and are only
//! logged. The types here cover what a backend can report and the few conditions
//! that are surfaced to the caller.

/// Failures reported by a [`GraphicsBackend`](crate::GraphicsBackend) implementation
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A GPU resource could not be allocated
    #[error("failed to allocate {what}: {reason}")]
    Allocation { what: &'static str, reason: String },

    /// A transfer buffer could not be mapped for host writes
    #[error("transfer buffer {0} could not be mapped")]
    MapFailed(u64),

    /// A handle does not refer to a live resource
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },

    /// A shader program could not be built from its configuration
    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// The operation is not available on this backend
    #[error("operation is not supported by this backend: {0}")]
    Unsupported(&'static str),

    /// Waiting for the device failed
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),

    /// Asynchronous buffer mapping failed
    #[error("buffer mapping failed: {0}")]
    BufferAsync(#[from] wgpu::BufferAsyncError),
}

/// Errors surfaced by [`Renderer`](crate::Renderer) operations
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The color manager is enabled but its 3D LUT could not be loaded
    #[error("failed to load the 3D color lookup table")]
    LutLoad,

    /// The picture carries no decoder buffer
    #[error("video picture has no buffer attached")]
    MissingBuffer,

    /// The renderer has not validated its render target yet
    #[error("renderer has not been validated")]
    NotValidated,

    /// The capture was requested with a zero-sized target
    #[error("invalid capture size {width}x{height}")]
    InvalidCaptureSize { width: u32, height: u32 },

    #[error(transparent)]
    Backend(#[from] BackendError),
}
