//! Graphics backend interface
//!
//! The renderer never talks to a graphics API directly. Capability queries, GPU
//! resources, shader programs and draw submission all go through [`GraphicsBackend`],
//! which keeps the render state machine free of platform details and lets it run
//! against a recording backend in tests.

use crate::{
    error::BackendError,
    format::{ColorMatrix, Field, MAX_PLANES, PixelFormat},
    geometry::Rect,
};

/// Handle of a plane texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Handle of a host-mappable transfer buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferBufferHandle(pub u64);

/// Handle of an offscreen render target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffscreenHandle(pub u64);

/// Handle of a 3D lookup table texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LutHandle(pub u64);

/// Handle of a compiled shader program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderHandle(pub u64);

/// Features reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    /// Name of the GPU vendor or renderer
    pub vendor: String,
    /// Textures may have non-power-of-two sizes
    pub npot_textures: bool,
    /// Rectangle textures addressed in texels are available
    pub rectangle_textures: bool,
    /// Host-mapped transfer buffers can feed texture uploads
    pub transfer_buffers: bool,
    /// Offscreen render targets are available
    pub offscreen_rendering: bool,
    /// Programmable shaders are available
    pub shaders: bool,
    /// 16-bit normalized single channel textures are available
    pub sixteen_bit_textures: bool,
    /// Required byte alignment of transfer buffer rows
    pub transfer_row_alignment: usize,
    /// Byte offset of plane data inside transfer buffers
    pub transfer_offset: usize,
    /// The display expects studio-range RGB
    pub limited_color_range: bool,
}

/// A platform specific capability override
struct CapabilityQuirk {
    /// Lowercase substring of the vendor name
    vendor: &'static str,
    /// Operating system the quirk applies to (`std::env::consts::OS` naming)
    os: &'static str,
    description: &'static str,
    apply: fn(&mut BackendCapabilities),
}

fn disable_transfer_buffers(capabilities: &mut BackendCapabilities) {
    capabilities.transfer_buffers = false;
}

fn offset_transfer_uploads(capabilities: &mut BackendCapabilities) {
    capabilities.transfer_offset = 16;
}

const CAPABILITY_QUIRKS: &[CapabilityQuirk] = &[
    CapabilityQuirk {
        vendor: "intel",
        os: "macos",
        description: "transfer buffer uploads show ripple artifacts",
        apply: disable_transfer_buffers,
    },
    CapabilityQuirk {
        vendor: "nvidia",
        os: "macos",
        description: "uploads from transfer buffer offset zero corrupt the alpha channel",
        apply: offset_transfer_uploads,
    },
];

impl BackendCapabilities {
    /// Applies the platform quirk table for the given operating system
    pub fn with_quirks(mut self, os: &str) -> Self {
        let vendor = self.vendor.to_lowercase();
        for quirk in CAPABILITY_QUIRKS {
            if quirk.os == os && vendor.contains(quirk.vendor) {
                tracing::info!("Applying capability quirk for {} on {}: {}", quirk.vendor, quirk.os, quirk.description);
                (quirk.apply)(&mut self);
            }
        }
        self
    }
}

/// Texture sampling filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerFilter {
    Nearest,
    #[default]
    Linear,
}

/// Plane texture creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: crate::format::TexelFormat,
    pub filter: SamplerFilter,
}

/// Where the pixels of a texture upload come from
#[derive(Debug, Clone, Copy)]
pub enum UploadSource<'a> {
    /// Host memory
    Host(&'a [u8]),
    /// A transfer buffer that has been handed back to the GPU
    Transfer(TransferBufferHandle),
}

/// A rectangular texture update
#[derive(Debug, Clone, Copy)]
pub struct TextureUpload<'a> {
    pub source: UploadSource<'a>,
    /// Byte offset of the first texel in the source
    pub offset: usize,
    /// Bytes between the starts of consecutive source rows
    pub row_pitch: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Destination of clears and draws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTarget {
    /// The display surface
    Surface,
    /// An offscreen intermediate
    Offscreen(OffscreenHandle),
    /// The still-frame capture target
    Capture,
}

/// A loaded 3D lookup table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LutBinding {
    pub handle: LutHandle,
    /// Edge length of the cube
    pub size: u32,
}

/// Output post-processing baked into the last shader of the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputStage {
    /// Ordered dithering
    pub dither: bool,
    /// Target bit depth of the dithering
    pub dither_depth: u32,
    /// Expand the studio-range output of the lookup table to full range
    pub full_range: bool,
    /// Color correction table
    pub lut: Option<LutBinding>,
}

/// Configuration of the YUV to RGB conversion program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct YuvShaderConfig {
    pub format: PixelFormat,
    /// Bits per texel channel of the plane textures (8 or 16)
    pub texture_bits: u32,
    pub color_matrix: ColorMatrix,
    /// The source uses the full 0-255 range
    pub full_range_source: bool,
    /// Textures are addressed in texels instead of normalized coordinates
    pub unnormalized: bool,
    pub nonlinear_stretch: bool,
    /// Keep the RGB result in studio range instead of expanding it to full range
    pub limited_output: bool,
    /// Present in single-pass mode only
    pub output: Option<OutputStage>,
}

impl YuvShaderConfig {
    /// Factor mapping sampled texture values onto the source's component range
    pub fn sample_scale(&self) -> f32 {
        let bits = self.format.bits_per_component();
        if self.texture_bits == 16 && bits < 16 {
            65535.0 / ((1u32 << bits) - 1) as f32
        } else {
            1.0
        }
    }

    /// Affine YUV to RGB transform with brightness and contrast folded in
    ///
    /// # Arguments
    /// * `black` - Black level offset added to every channel
    /// * `contrast` - Gain applied before the black offset
    ///
    /// # Returns
    /// Column-major 4x4 matrix applied to `(Y, Cb, Cr, 1)`
    pub fn conversion_matrix(&self, black: f32, contrast: f32) -> [[f32; 4]; 4] {
        let (kr, kb) = self.color_matrix.luma_weights();
        let kg = 1.0 - kr - kb;

        let (luma_scale, chroma_scale, luma_offset) = if self.full_range_source {
            (1.0, 1.0, 0.0)
        } else {
            (255.0 / 219.0, 255.0 / 224.0, 16.0 / 255.0)
        };
        let chroma_offset = 128.0 / 255.0;

        let sy = contrast * luma_scale;
        let sc = contrast * chroma_scale;

        let r_cr = 2.0 * (1.0 - kr);
        let g_cb = -2.0 * kb * (1.0 - kb) / kg;
        let g_cr = -2.0 * kr * (1.0 - kr) / kg;
        let b_cb = 2.0 * (1.0 - kb);

        let mut matrix = [
            [sy, sy, sy, 0.0],
            [0.0, sc * g_cb, sc * b_cb, 0.0],
            [sc * r_cr, sc * g_cr, 0.0, 0.0],
            [
                black - sy * luma_offset - sc * r_cr * chroma_offset,
                black - sy * luma_offset - sc * (g_cb + g_cr) * chroma_offset,
                black - sy * luma_offset - sc * b_cb * chroma_offset,
                1.0,
            ],
        ];

        if self.limited_output {
            // rgb * 219/255 + 16/255
            for column in matrix.iter_mut() {
                for value in column.iter_mut().take(3) {
                    *value *= 219.0 / 255.0;
                }
            }
            for value in matrix[3].iter_mut().take(3) {
                *value += 16.0 / 255.0;
            }
        }

        matrix
    }
}

/// Convolution kernels of the high quality scalers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvolutionKernel {
    Cubic,
    Lanczos2,
    Lanczos3,
    Spline36,
}

impl ConvolutionKernel {
    /// Kernel radius in source pixels
    pub fn radius(&self) -> u32 {
        match self {
            ConvolutionKernel::Cubic | ConvolutionKernel::Lanczos2 => 2,
            ConvolutionKernel::Lanczos3 | ConvolutionKernel::Spline36 => 3,
        }
    }
}

/// Second stage filter programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    /// Plain sampling
    Default,
    /// Plain sampling with non-linear horizontal stretch
    Stretch,
    /// Separable convolution; `fast` limits the window to two taps per side
    Convolution { kernel: ConvolutionKernel, fast: bool },
}

/// Configuration of a second stage filter program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterShaderConfig {
    pub kind: FilterKind,
    pub nonlinear_stretch: bool,
    /// Present for convolution filters, which end the chain in multi-pass mode
    pub output: Option<OutputStage>,
}

/// Quad vertex in target pixels with a normalized content coordinate
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct QuadVertex {
    /// Position in target pixels
    pub position: [f32; 2],
    /// Position within the sampled content, (0,0) top-left to (1,1) bottom-right
    pub coord: [f32; 2],
}

impl QuadVertex {
    /// Builds a triangle strip over the given corners
    ///
    /// `corners` are the positions of the content's top-left, top-right,
    /// bottom-right and bottom-left corners.
    pub fn strip(corners: [[f32; 2]; 4]) -> [QuadVertex; 4] {
        [
            QuadVertex { position: corners[0], coord: [0.0, 0.0] },
            QuadVertex { position: corners[1], coord: [1.0, 0.0] },
            QuadVertex { position: corners[3], coord: [0.0, 1.0] },
            QuadVertex { position: corners[2], coord: [1.0, 1.0] },
        ]
    }
}

/// One YUV conversion draw
#[derive(Debug, Clone, PartialEq)]
pub struct YuvDraw {
    pub shader: ShaderHandle,
    /// Texture sampled for each plane index (aliased planes repeat a handle)
    pub planes: [TextureHandle; MAX_PLANES],
    /// Sampling rectangle of each plane
    pub plane_rects: [Rect; MAX_PLANES],
    /// Size of the luma texture in texels
    pub texture_size: (f32, f32),
    pub vertices: [QuadVertex; 4],
    pub projection: [[f32; 4]; 4],
    pub black: f32,
    pub contrast: f32,
    pub alpha: f32,
    /// Non-linear stretch exponent, 1.0 disables it
    pub stretch: f32,
    pub field: Field,
    /// Only draw the rows belonging to `field`
    pub stipple: bool,
    pub blend: bool,
}

/// One second stage filter draw from an offscreen intermediate
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDraw {
    pub shader: ShaderHandle,
    pub source: OffscreenHandle,
    pub filter: SamplerFilter,
    /// Size of the offscreen intermediate in pixels
    pub source_size: (f32, f32),
    /// Sampled region of the intermediate, normalized
    pub source_rect: Rect,
    pub vertices: [QuadVertex; 4],
    pub projection: [[f32; 4]; 4],
    pub alpha: f32,
    pub stretch: f32,
    pub blend: bool,
}

/// Display, resource and shader services needed by the renderer
///
/// All calls happen on the thread that owns the graphics context.
pub trait GraphicsBackend {
    /// Reports the features of the device
    fn capabilities(&self) -> BackendCapabilities;

    /// Size of the display surface in pixels
    fn surface_size(&self) -> (u32, u32);

    /// Current viewport
    fn viewport(&self) -> Rect;

    fn set_viewport(&mut self, viewport: Rect);

    /// Creates a plane texture with clamp-to-edge addressing
    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<TextureHandle, BackendError>;

    /// Allocated size of a texture, which may exceed the requested size
    fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)>;

    fn set_texture_filter(&mut self, texture: TextureHandle, filter: SamplerFilter);

    fn upload_texture(&mut self, texture: TextureHandle, upload: &TextureUpload<'_>) -> Result<(), BackendError>;

    fn delete_texture(&mut self, texture: TextureHandle);

    /// Creates a transfer buffer of `size` bytes, mapped for host writes
    fn create_transfer_buffer(&mut self, size: usize) -> Result<TransferBufferHandle, BackendError>;

    /// Maps a transfer buffer for host writes
    fn map_transfer_buffer(&mut self, buffer: TransferBufferHandle) -> Result<(), BackendError>;

    /// Hands a transfer buffer back to the GPU
    fn unmap_transfer_buffer(&mut self, buffer: TransferBufferHandle);

    /// Writes into a mapped transfer buffer through `write`
    fn write_transfer_buffer(&mut self, buffer: TransferBufferHandle, offset: usize, len: usize, write: &mut dyn FnMut(&mut [u8])) -> Result<(), BackendError>;

    fn delete_transfer_buffer(&mut self, buffer: TransferBufferHandle);

    /// Creates an RGBA offscreen target usable as a render target and as a texture
    fn create_offscreen(&mut self, width: u32, height: u32) -> Result<OffscreenHandle, BackendError>;

    fn delete_offscreen(&mut self, offscreen: OffscreenHandle);

    /// Creates a 3D lookup table from `size`³ RGB triplets of 16-bit values
    fn create_lut(&mut self, size: u32, data: &[u16]) -> Result<LutHandle, BackendError>;

    fn delete_lut(&mut self, lut: LutHandle);

    fn compile_yuv_shader(&mut self, config: &YuvShaderConfig) -> Result<ShaderHandle, BackendError>;

    fn compile_filter_shader(&mut self, config: &FilterShaderConfig) -> Result<ShaderHandle, BackendError>;

    fn delete_shader(&mut self, shader: ShaderHandle);

    fn clear(&mut self, target: RenderTarget, color: [f32; 4]) -> Result<(), BackendError>;

    /// Fills rectangles given in target pixels
    fn fill_rects(&mut self, target: RenderTarget, rects: &[Rect], color: [f32; 4]) -> Result<(), BackendError>;

    fn draw_yuv(&mut self, target: RenderTarget, draw: &YuvDraw) -> Result<(), BackendError>;

    fn draw_filter(&mut self, target: RenderTarget, draw: &FilterDraw) -> Result<(), BackendError>;

    /// Creates the capture target, cleared to black
    fn begin_capture(&mut self, width: u32, height: u32) -> Result<(), BackendError>;

    /// Reads the capture target as tightly packed BGRA rows and releases it
    fn end_capture(&mut self) -> Result<Vec<u8>, BackendError>;

    /// Blocks until all submitted GPU work has completed
    fn finish(&mut self);

    /// Submits pending work without waiting
    fn flush(&mut self);
}
