//! Decoder buffer interface and plane copy routines
//!
//! Decoded frames live in buffers owned by the decoder's pool. The renderer holds
//! them through [`BufferRef`], which acquires on creation and releases on drop, so
//! every acquisition is matched by exactly one release on every exit path.

use crate::format::{ColorMatrix, MAX_PLANES, PixelFormat};
use std::sync::Arc;

/// A reference-counted picture buffer owned by the decoder
///
/// `acquire` and `release` adjust the decoder's reference count; the buffer returns
/// to the decoder's pool when the count drops to zero.
pub trait VideoBuffer: Send + Sync {
    /// Pixel format of the stored picture
    fn format(&self) -> PixelFormat;

    /// Plane data, empty slices for planes the format does not use
    fn planes(&self) -> [&[u8]; MAX_PLANES];

    /// Byte stride of each plane
    fn strides(&self) -> [usize; MAX_PLANES];

    /// Increments the decoder-side reference count
    fn acquire(&self);

    /// Decrements the decoder-side reference count
    fn release(&self);
}

/// Scoped acquisition of a [`VideoBuffer`]
///
/// Holds one decoder reference for its whole lifetime.
pub struct BufferRef {
    buffer: Arc<dyn VideoBuffer>,
}

impl BufferRef {
    /// Acquires `buffer` and wraps it
    pub fn new(buffer: Arc<dyn VideoBuffer>) -> Self {
        buffer.acquire();
        Self { buffer }
    }

    /// The referenced buffer
    pub fn buffer(&self) -> &dyn VideoBuffer {
        self.buffer.as_ref()
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        self.buffer.release();
    }
}

impl std::fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRef").field("format", &self.buffer.format()).finish()
    }
}

/// A decoded picture handed over by the decoder
#[derive(Clone)]
pub struct VideoPicture {
    /// Decoder buffer holding the pixels
    pub buffer: Option<Arc<dyn VideoBuffer>>,
    /// Picture width in pixels
    pub width: u32,
    /// Picture height in pixels
    pub height: u32,
    /// Display width, used for the display aspect ratio
    pub display_width: u32,
    /// Display height, used for the display aspect ratio
    pub display_height: u32,
    /// YUV to RGB matrix of the source
    pub color_matrix: ColorMatrix,
    /// Whether the source uses the full 0-255 range instead of studio range
    pub full_range: bool,
}

impl VideoPicture {
    /// Creates a picture with square pixels and studio-range color
    ///
    /// The matrix follows the usual convention of BT.709 for HD sizes and BT.601 below.
    pub fn new(buffer: Arc<dyn VideoBuffer>, width: u32, height: u32) -> Self {
        Self {
            buffer: Some(buffer),
            width,
            height,
            display_width: width,
            display_height: height,
            color_matrix: if width >= 1280 || height > 576 { ColorMatrix::Bt709 } else { ColorMatrix::Bt601 },
            full_range: false,
        }
    }

    /// Pixel format of the attached buffer
    pub fn format(&self) -> Option<PixelFormat> {
        self.buffer.as_ref().map(|buffer| buffer.format())
    }
}

/// Copies `rows` rows of `row_bytes` bytes between two strided planes
///
/// Stops early at the first row that does not fit in either slice.
pub(crate) fn copy_plane(dst: &mut [u8], dst_stride: usize, src: &[u8], src_stride: usize, row_bytes: usize, rows: usize) {
    for row in 0..rows {
        let src_start = row * src_stride;
        let dst_start = row * dst_stride;
        let (Some(src_row), Some(dst_row)) = (src.get(src_start..src_start + row_bytes), dst.get_mut(dst_start..dst_start + row_bytes)) else {
            tracing::warn!("Plane copy truncated at row {row} of {rows}");
            return;
        };
        dst_row.copy_from_slice(src_row);
    }
}

/// Copies a plane of 16-bit little-endian samples into 8-bit samples
///
/// # Arguments
/// * `dst` - Destination plane
/// * `dst_stride` - Destination stride in bytes
/// * `src` - Source plane
/// * `src_stride` - Source stride in bytes
/// * `samples` - Samples per row
/// * `rows` - Number of rows
/// * `bits` - Significant bits per source sample
pub(crate) fn copy_plane_to_8bit(dst: &mut [u8], dst_stride: usize, src: &[u8], src_stride: usize, samples: usize, rows: usize, bits: u32) {
    let shift = bits.saturating_sub(8);
    for row in 0..rows {
        let src_start = row * src_stride;
        let dst_start = row * dst_stride;
        let (Some(src_row), Some(dst_row)) = (src.get(src_start..src_start + samples * 2), dst.get_mut(dst_start..dst_start + samples)) else {
            tracing::warn!("Plane down-conversion truncated at row {row} of {rows}");
            return;
        };
        for (out, sample) in dst_row.iter_mut().zip(src_row.chunks_exact(2)) {
            let value = u16::from_le_bytes([sample[0], sample[1]]) >> shift;
            *out = value.min(255) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeVideoBuffer;

    #[test]
    fn test_buffer_ref_releases_on_drop() {
        let buffer = Arc::new(FakeVideoBuffer::solid(PixelFormat::Yuv420P, 16, 16, [16, 128, 128]));
        {
            let _first = BufferRef::new(buffer.clone());
            let _second = BufferRef::new(buffer.clone());
            assert_eq!(buffer.ref_count(), 2);
        }
        assert_eq!(buffer.ref_count(), 0);
    }

    #[test]
    fn test_copy_plane_respects_strides() {
        let src = [1u8, 2, 3, 9, 4, 5, 6, 9];
        let mut dst = [0u8; 10];
        copy_plane(&mut dst, 5, &src, 4, 3, 2);
        assert_eq!(dst, [1, 2, 3, 0, 0, 4, 5, 6, 0, 0]);
    }

    #[test]
    fn test_copy_plane_truncates_short_source() {
        let src = [7u8; 4];
        let mut dst = [0u8; 8];
        copy_plane(&mut dst, 4, &src, 4, 4, 2);
        assert_eq!(dst, [7, 7, 7, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn test_down_conversion() {
        // 10-bit samples 1023, 512 and 64
        let src: Vec<u8> = [1023u16, 512, 64].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut dst = [0u8; 3];
        copy_plane_to_8bit(&mut dst, 3, &src, 6, 3, 1, 10);
        assert_eq!(dst, [255, 128, 16]);
    }
}
