//! Video frame rendering pipeline for wgpu
//!
//! This crate takes decoded planar, semi-planar and packed YUV frames from a video
//! decoder and draws them to a graphics surface. It converts them to RGB, splits
//! interlaced fields, scales them with either a fused single-pass shader or an
//! offscreen two-pass convolution filter, and applies dithering and 3D LUT color
//! correction on the way out.
//!
//! The graphics API is reached only through [`GraphicsBackend`]; [`WgpuBackend`]
//! is the bundled implementation.

pub mod backend;
pub mod color_management;
pub mod error;
pub mod format;
pub(crate) mod format_adapter;
pub mod frame_ring;
pub mod geometry;
pub mod renderer;
pub mod settings;
pub mod shader_chain;
pub(crate) mod staging;
pub mod texture_set;
pub mod video_buffer;
mod wgpu_backend;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{BackendCapabilities, GraphicsBackend, RenderTarget};
pub use color_management::{ColorManager, DisabledColorManager};
pub use error::{BackendError, RenderError};
pub use format::{ColorMatrix, Field, PixelFormat, PlaneLayout};
pub use frame_ring::NUM_BUFFERS;
pub use renderer::{RenderCapture, RenderFeature, RenderFlags, RenderInfo, Renderer};
pub use settings::{MemorySettings, RendererSettings, SettingsSource, VideoSettings};
pub use shader_chain::{RenderQuality, ScalingMethod};
pub use video_buffer::{BufferRef, VideoBuffer, VideoPicture};
pub use wgpu_backend::WgpuBackend;
