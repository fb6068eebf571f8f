//! Pixel formats and plane geometry
//!
//! Every supported decoder format maps onto one of three plane layouts. The layout
//! table decides how many textures a frame owns, which plane indices alias another
//! plane's texture, how many pixels one texel carries and how far chroma is
//! subsampled. Everything else in the upload path is driven by this table.

use serde::Deserialize;

/// Number of plane slots a frame exposes to the shaders
pub const MAX_PLANES: usize = 3;

/// Number of texture sets kept per frame (progressive, top field, bottom field)
pub const MAX_FIELDS: usize = 3;

/// Decoded pixel formats accepted from the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit planar 4:2:0 (YV12 / I420)
    Yuv420P,
    /// 9-bit planar 4:2:0 in 16-bit little-endian samples
    Yuv420P9,
    /// 10-bit planar 4:2:0 in 16-bit little-endian samples
    Yuv420P10,
    /// 12-bit planar 4:2:0 in 16-bit little-endian samples
    Yuv420P12,
    /// 14-bit planar 4:2:0 in 16-bit little-endian samples
    Yuv420P14,
    /// 16-bit planar 4:2:0
    Yuv420P16,
    /// Luma plane followed by an interleaved CbCr plane
    Nv12,
    /// Packed 4:2:2, byte order Y0 U Y1 V
    Yuyv422,
    /// Packed 4:2:2, byte order U Y0 V Y1
    Uyvy422,
}

impl PixelFormat {
    /// Returns the human-readable name of this format
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Yuv420P => "YUV420P",
            PixelFormat::Yuv420P9 => "YUV420P9",
            PixelFormat::Yuv420P10 => "YUV420P10",
            PixelFormat::Yuv420P12 => "YUV420P12",
            PixelFormat::Yuv420P14 => "YUV420P14",
            PixelFormat::Yuv420P16 => "YUV420P16",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuyv422 => "YUYV422",
            PixelFormat::Uyvy422 => "UYVY422",
        }
    }

    /// Returns the plane layout family this format belongs to
    pub fn layout(&self) -> PlaneLayout {
        match self {
            PixelFormat::Nv12 => PlaneLayout::SemiPlanar420,
            PixelFormat::Yuyv422 | PixelFormat::Uyvy422 => PlaneLayout::Packed422,
            _ => PlaneLayout::Planar420,
        }
    }

    /// Significant bits per component
    pub fn bits_per_component(&self) -> u32 {
        match self {
            PixelFormat::Yuv420P9 => 9,
            PixelFormat::Yuv420P10 => 10,
            PixelFormat::Yuv420P12 => 12,
            PixelFormat::Yuv420P14 => 14,
            PixelFormat::Yuv420P16 => 16,
            _ => 8,
        }
    }

    /// Bytes per sample in the decoder's buffers (1 or 2)
    pub fn bytes_per_sample(&self) -> usize {
        if self.bits_per_component() > 8 { 2 } else { 1 }
    }

    /// Returns true for the packed formats that cannot be sampled with nearest filtering
    pub fn is_packed(&self) -> bool {
        self.layout() == PlaneLayout::Packed422
    }
}

/// Plane layout families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneLayout {
    /// Three independent planes, chroma subsampled by two in both directions
    Planar420,
    /// Luma plane plus one interleaved chroma plane
    SemiPlanar420,
    /// One interleaved plane with two pixels per texel
    Packed422,
}

/// Static description of a plane layout
#[derive(Debug, PartialEq, Eq)]
pub struct LayoutDescriptor {
    /// Number of planes that own a texture
    pub owned_planes: usize,
    /// Plane whose texture each plane index samples from
    pub alias: [usize; MAX_PLANES],
    /// Pixels carried by one texel, horizontally and vertically
    pub pixels_per_texel: (u32, u32),
    /// Chroma subsampling shift, horizontally and vertically
    pub chroma_shift: (u32, u32),
}

const PLANAR_420: LayoutDescriptor = LayoutDescriptor {
    owned_planes: 3,
    alias: [0, 1, 2],
    pixels_per_texel: (1, 1),
    chroma_shift: (1, 1),
};

const SEMI_PLANAR_420: LayoutDescriptor = LayoutDescriptor {
    owned_planes: 2,
    alias: [0, 1, 1],
    pixels_per_texel: (1, 1),
    chroma_shift: (1, 1),
};

const PACKED_422: LayoutDescriptor = LayoutDescriptor {
    owned_planes: 1,
    alias: [0, 0, 0],
    pixels_per_texel: (2, 1),
    chroma_shift: (0, 0),
};

impl PlaneLayout {
    /// Returns the static descriptor for this layout
    pub fn descriptor(&self) -> &'static LayoutDescriptor {
        match self {
            PlaneLayout::Planar420 => &PLANAR_420,
            PlaneLayout::SemiPlanar420 => &SEMI_PLANAR_420,
            PlaneLayout::Packed422 => &PACKED_422,
        }
    }

    /// Returns true when `plane` owns its texture rather than aliasing another plane
    pub fn owns_plane(&self, plane: usize) -> bool {
        self.descriptor().alias[plane] == plane && plane < self.descriptor().owned_planes
    }
}

/// Texel formats used for plane textures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexelFormat {
    /// One 8-bit normalized channel
    R8,
    /// Two 8-bit normalized channels
    Rg8,
    /// Four 8-bit normalized channels
    Rgba8,
    /// One 16-bit normalized channel
    R16,
}

impl TexelFormat {
    /// Size of one texel in bytes
    pub fn bytes_per_texel(&self) -> usize {
        match self {
            TexelFormat::R8 => 1,
            TexelFormat::Rg8 | TexelFormat::R16 => 2,
            TexelFormat::Rgba8 => 4,
        }
    }
}

/// Texel format for `plane` of `format`
///
/// High bit depth planar formats use 16-bit textures when the backend supports them;
/// otherwise samples are down-converted to 8 bits during the copy.
pub fn texel_format(format: PixelFormat, plane: usize, sixteen_bit_textures: bool) -> TexelFormat {
    match format.layout() {
        PlaneLayout::Planar420 if format.bytes_per_sample() == 2 && sixteen_bit_textures => TexelFormat::R16,
        PlaneLayout::Planar420 => TexelFormat::R8,
        PlaneLayout::SemiPlanar420 if plane == 0 => TexelFormat::R8,
        PlaneLayout::SemiPlanar420 => TexelFormat::Rg8,
        PlaneLayout::Packed422 => TexelFormat::Rgba8,
    }
}

/// YUV to RGB matrix coefficients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMatrix {
    /// ITU-R BT.601
    #[default]
    Bt601,
    /// ITU-R BT.709
    Bt709,
    /// ITU-R BT.2020 non-constant luminance
    Bt2020,
}

impl ColorMatrix {
    /// Luma weights of the red and blue components (Kr, Kb)
    pub fn luma_weights(&self) -> (f32, f32) {
        match self {
            ColorMatrix::Bt601 => (0.299, 0.114),
            ColorMatrix::Bt709 => (0.2126, 0.0722),
            ColorMatrix::Bt2020 => (0.2627, 0.0593),
        }
    }
}

/// One of the three texture sets of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Field {
    /// Whole progressive frame
    #[default]
    Full,
    /// Even lines of an interlaced frame
    Top,
    /// Odd lines of an interlaced frame
    Bottom,
}

impl Field {
    /// All fields in texture-set order
    pub const ALL: [Field; MAX_FIELDS] = [Field::Full, Field::Top, Field::Bottom];

    /// Index of this field's texture set
    pub fn index(&self) -> usize {
        match self {
            Field::Full => 0,
            Field::Top => 1,
            Field::Bottom => 2,
        }
    }

    /// Vertical shift applied to texture heights (0 for the full frame, 1 for fields)
    pub fn height_shift(&self) -> u32 {
        if *self == Field::Full { 0 } else { 1 }
    }
}

/// Staging geometry of one frame
///
/// Strides are in bytes and are rounded up to `row_alignment`, which the upload path
/// sets to the backend's transfer row alignment when transfer buffers are used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneGeometry {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per sample in the staging image (after any down-conversion)
    pub bytes_per_sample: usize,
    /// Chroma subsampling shift
    pub chroma_shift: (u32, u32),
    /// Byte stride of each plane
    pub strides: [usize; MAX_PLANES],
    /// Number of rows of each plane
    pub rows: [u32; MAX_PLANES],
    /// Byte size of each plane
    pub sizes: [usize; MAX_PLANES],
    /// Width of each plane in texels
    pub texel_widths: [u32; MAX_PLANES],
}

impl PlaneGeometry {
    /// Computes the staging geometry for a frame
    ///
    /// # Arguments
    /// * `format` - Decoder pixel format
    /// * `width` - Frame width in pixels
    /// * `height` - Frame height in pixels
    /// * `bytes_per_sample` - Staging bytes per sample (1 when down-converting)
    /// * `row_alignment` - Required stride alignment in bytes (1 for none)
    pub fn new(format: PixelFormat, width: u32, height: u32, bytes_per_sample: usize, row_alignment: usize) -> Self {
        let layout = format.layout();
        let chroma_shift = layout.descriptor().chroma_shift;
        let w = width as usize;
        let (mut strides, rows, texel_widths) = match layout {
            PlaneLayout::Planar420 => {
                let chroma_width = width >> chroma_shift.0;
                (
                    [bytes_per_sample * w, bytes_per_sample * chroma_width as usize, bytes_per_sample * chroma_width as usize],
                    [height, height >> chroma_shift.1, height >> chroma_shift.1],
                    [width, chroma_width, chroma_width],
                )
            }
            // interleaved CbCr pairs make the chroma row as wide as the luma row
            PlaneLayout::SemiPlanar420 => ([w, w, 0], [height, height >> chroma_shift.1, 0], [width, width >> 1, 0]),
            PlaneLayout::Packed422 => ([w * 2, 0, 0], [height, 0, 0], [width >> 1, 0, 0]),
        };

        let alignment = row_alignment.max(1);
        for stride in strides.iter_mut() {
            *stride = stride.div_ceil(alignment) * alignment;
        }

        let sizes = [0usize, 1, 2].map(|p| strides[p] * rows[p] as usize);

        Self {
            width,
            height,
            bytes_per_sample,
            chroma_shift,
            strides,
            rows,
            sizes,
            texel_widths,
        }
    }
}
