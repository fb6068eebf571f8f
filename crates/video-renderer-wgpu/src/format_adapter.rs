//! Texture allocation and upload for the three plane layouts
//!
//! All layouts share one protocol; the differences (owned planes, aliasing, texel
//! formats, pixels per texel, chroma subsampling) come from the layout table in
//! [`crate::format`].

use crate::{
    backend::{GraphicsBackend, SamplerFilter, TextureDescriptor, TextureUpload, UploadSource},
    error::BackendError,
    format::{Field, MAX_PLANES, PixelFormat, PlaneGeometry, texel_format},
    frame_ring::FrameSlot,
    geometry::Rect,
    staging::StagingImage,
    texture_set::YuvPlane,
    video_buffer::{copy_plane, copy_plane_to_8bit},
};

/// Frame and backend parameters shared by allocation and upload
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FrameFormat {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Stage planes in transfer buffers
    pub transfer_buffers: bool,
    /// Row alignment required by transfer buffer uploads
    pub transfer_row_alignment: usize,
    /// Byte offset of plane data inside transfer buffers
    pub transfer_offset: usize,
    pub sixteen_bit_textures: bool,
    /// Texture coordinates are normalized to 0..1
    pub normalized: bool,
}

impl FrameFormat {
    /// Samples are narrowed to 8 bits while copying
    fn down_converts(&self) -> bool {
        self.format.bytes_per_sample() == 2 && !self.sixteen_bit_textures
    }

    fn staging_geometry(&self, row_alignment: usize) -> PlaneGeometry {
        let bytes_per_sample = if self.down_converts() { 1 } else { self.format.bytes_per_sample() };
        PlaneGeometry::new(self.format, self.width, self.height, bytes_per_sample, row_alignment)
    }
}

/// Allocates staging memory and textures for a slot
///
/// Any textures the slot already has are deleted first. When transfer buffers
/// cannot be allocated the slot falls back to host memory.
pub(crate) fn create_textures(backend: &mut dyn GraphicsBackend, slot: &mut FrameSlot, frame: &FrameFormat) -> Result<(), BackendError> {
    delete_textures(backend, slot);

    let staging = if frame.transfer_buffers {
        match StagingImage::with_transfer_buffers(backend, frame.staging_geometry(frame.transfer_row_alignment), frame.transfer_offset) {
            Ok(staging) => staging,
            Err(e) => {
                tracing::warn!("Transfer buffers unavailable, staging {} frame in host memory: {e}", frame.format.name());
                StagingImage::host(frame.staging_geometry(1))
            }
        }
    } else {
        StagingImage::host(frame.staging_geometry(1))
    };

    let layout = frame.format.layout();
    let descriptor = layout.descriptor();
    let texel_widths = staging.geometry.texel_widths;
    let rows = staging.geometry.rows;
    slot.staging = Some(staging);

    for field in Field::ALL {
        let planes = slot.textures.field_mut(field);
        for plane in 0..MAX_PLANES {
            if !layout.owns_plane(plane) {
                let owner = planes[descriptor.alias[plane]];
                planes[plane] = YuvPlane { owned: false, ..owner };
                continue;
            }

            let width = texel_widths[plane];
            let height = rows[plane] >> field.height_shift();
            let format = texel_format(frame.format, plane, frame.sixteen_bit_textures);
            planes[plane] = YuvPlane {
                format,
                pixels_per_texel: descriptor.pixels_per_texel,
                ..Default::default()
            };
            if width == 0 || height == 0 {
                continue;
            }

            let texture = backend.create_texture(&TextureDescriptor {
                width,
                height,
                format,
                filter: SamplerFilter::Linear,
            })?;
            let (texture_width, texture_height) = match backend.texture_size(texture) {
                Some((w, h)) if w > 0 && h > 0 => (w, h),
                size => {
                    tracing::warn!("Invalid texture size {size:?} for plane {plane}, clamping to 1x1");
                    (1, 1)
                }
            };

            planes[plane].texture = Some(texture);
            planes[plane].owned = true;
            planes[plane].texture_width = texture_width;
            planes[plane].texture_height = texture_height;
        }
    }

    tracing::debug!("Created {} textures for {}x{} frame", frame.format.name(), frame.width, frame.height);
    Ok(())
}

/// Releases a slot's decoder buffer, textures and staging memory
pub(crate) fn delete_textures(backend: &mut dyn GraphicsBackend, slot: &mut FrameSlot) {
    slot.video_buffer = None;

    for planes in slot.textures.fields.iter_mut() {
        for plane in planes.iter_mut() {
            if let (true, Some(texture)) = (plane.owned, plane.texture) {
                backend.delete_texture(texture);
            }
            *plane = YuvPlane::default();
        }
    }

    if let Some(staging) = slot.staging.take() {
        staging.release(backend);
    }
    slot.loaded = false;
}

/// Copies the slot's decoder buffer into its textures
///
/// # Arguments
/// * `backend` - Graphics backend
/// * `slot` - Frame slot to upload
/// * `frame` - Frame parameters the slot was allocated with
/// * `field` - Field being displayed; fields upload into the per-field textures
/// * `source` - Displayed region of the frame, for the sampling rectangles
///
/// # Returns
/// False when the slot has no decoder buffer or its staging memory is unusable
pub(crate) fn upload(backend: &mut dyn GraphicsBackend, slot: &mut FrameSlot, frame: &FrameFormat, field: Field, source: Rect) -> bool {
    let Some(video_buffer) = slot.video_buffer.as_ref() else {
        return false;
    };
    if slot.loaded {
        return true;
    }
    let Some(staging) = slot.staging.as_mut() else {
        tracing::warn!("Frame slot has no staging memory");
        return false;
    };

    if let Err(e) = staging.map(backend) {
        tracing::warn!("Failed to map transfer buffers: {e}");
        return false;
    }

    let buffer = video_buffer.buffer();
    let src_planes = buffer.planes();
    let src_strides = buffer.strides();
    let geometry = staging.geometry.clone();
    let down_convert = frame.down_converts();
    let bits = frame.format.bits_per_component();

    for plane in 0..MAX_PLANES {
        if geometry.sizes[plane] == 0 {
            continue;
        }
        let texel_bytes = texel_format(frame.format, plane, frame.sixteen_bit_textures).bytes_per_texel();
        let row_bytes = geometry.texel_widths[plane] as usize * texel_bytes;
        let rows = geometry.rows[plane] as usize;
        let dst_stride = geometry.strides[plane];
        let result = staging.write_plane(backend, plane, &mut |dst| {
            if down_convert {
                copy_plane_to_8bit(dst, dst_stride, src_planes[plane], src_strides[plane], geometry.texel_widths[plane] as usize, rows, bits);
            } else {
                copy_plane(dst, dst_stride, src_planes[plane], src_strides[plane], row_bytes, rows);
            }
        });
        if let Err(e) = result {
            tracing::warn!("Failed to stage plane {plane}: {e}");
        }
    }

    staging.unmap(backend);

    let layout = frame.format.layout();
    for plane in 0..MAX_PLANES {
        if !layout.owns_plane(plane) {
            continue;
        }
        let Some((source_data, base)) = staging.upload_source(plane) else {
            continue;
        };
        let stride = geometry.strides[plane];
        let width = geometry.texel_widths[plane];
        let rows = geometry.rows[plane];
        let texel_bytes = texel_format(frame.format, plane, frame.sixteen_bit_textures).bytes_per_texel();

        if field == Field::Full {
            let target = &slot.textures.field(Field::Full)[plane];
            load_plane(backend, target, source_data, base, stride, width, rows, texel_bytes);
        } else {
            let top = &slot.textures.field(Field::Top)[plane];
            load_plane(backend, top, source_data, base, stride * 2, width, rows >> 1, texel_bytes);
            let bottom = &slot.textures.field(Field::Bottom)[plane];
            load_plane(backend, bottom, source_data, base + stride, stride * 2, width, rows >> 1, texel_bytes);
        }
    }

    slot.loaded = true;
    slot.textures.calculate_source_rects(source, frame.width, frame.height, layout.descriptor().chroma_shift, frame.normalized);
    true
}

/// Uploads one plane image, replicating the last row and column into the texture padding
#[allow(clippy::too_many_arguments)]
fn load_plane(backend: &mut dyn GraphicsBackend, plane: &YuvPlane, source: UploadSource<'_>, offset: usize, row_pitch: usize, width: u32, height: u32, texel_bytes: usize) {
    let Some(texture) = plane.texture else {
        return;
    };
    if width == 0 || height == 0 {
        return;
    }

    let mut uploads = vec![TextureUpload {
        source,
        offset,
        row_pitch,
        x: 0,
        y: 0,
        width,
        height,
    }];
    if height < plane.texture_height {
        uploads.push(TextureUpload {
            source,
            offset: offset + row_pitch * (height as usize - 1),
            row_pitch,
            x: 0,
            y: height,
            width,
            height: 1,
        });
    }
    if width < plane.texture_width {
        uploads.push(TextureUpload {
            source,
            offset: offset + texel_bytes * (width as usize - 1),
            row_pitch,
            x: width,
            y: 0,
            width: 1,
            height,
        });
    }

    for upload in &uploads {
        if let Err(e) = backend.upload_texture(texture, upload) {
            tracing::warn!("Texture upload failed: {e}");
        }
    }
}
