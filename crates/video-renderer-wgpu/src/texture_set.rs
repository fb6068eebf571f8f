//! GPU textures of one buffered frame
//!
//! A frame keeps three texture sets: the progressive frame and the two fields of an
//! interlaced frame. Each set holds one entry per plane index; planes that share
//! another plane's texture carry the same handle with `owned == false`.

use crate::{
    backend::TextureHandle,
    format::{Field, MAX_FIELDS, MAX_PLANES, TexelFormat},
    geometry::Rect,
};

/// One plane texture of one field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YuvPlane {
    pub texture: Option<TextureHandle>,
    /// The texture belongs to this plane and is deleted with it
    pub owned: bool,
    pub format: TexelFormat,
    /// Allocated texture size in texels
    pub texture_width: u32,
    pub texture_height: u32,
    /// Content extent in texture coordinates
    pub width: f32,
    pub height: f32,
    /// Pixels per texel, horizontally and vertically
    pub pixels_per_texel: (u32, u32),
    /// Sampling rectangle in texture coordinates
    pub rect: Rect,
}

impl Default for YuvPlane {
    fn default() -> Self {
        Self {
            texture: None,
            owned: false,
            format: TexelFormat::R8,
            texture_width: 0,
            texture_height: 0,
            width: 0.0,
            height: 0.0,
            pixels_per_texel: (1, 1),
            rect: Rect::default(),
        }
    }
}

/// Textures of one frame, indexed by field and plane
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextureSet {
    pub fields: [[YuvPlane; MAX_PLANES]; MAX_FIELDS],
}

impl TextureSet {
    pub fn field(&self, field: Field) -> &[YuvPlane; MAX_PLANES] {
        &self.fields[field.index()]
    }

    pub fn field_mut(&mut self, field: Field) -> &mut [YuvPlane; MAX_PLANES] {
        &mut self.fields[field.index()]
    }

    /// Returns true when the progressive luma texture exists
    pub fn is_allocated(&self) -> bool {
        self.fields[Field::Full.index()][0].texture.is_some()
    }

    /// Recomputes the sampling rectangle of every plane of every field
    ///
    /// Field rectangles are shifted by half a row (a full row for chroma, which is
    /// sited between the luma rows of both fields) and halved vertically. Chroma
    /// rectangles are divided by the subsampling factor. Everything is then
    /// expressed in texels and, for normalized addressing, in texture units.
    ///
    /// # Arguments
    /// * `source` - Displayed region of the frame in pixels
    /// * `frame_width` - Frame width in pixels
    /// * `frame_height` - Frame height in pixels
    /// * `chroma_shift` - Chroma subsampling shift of the layout
    /// * `normalized` - Texture coordinates are normalized to 0..1
    pub fn calculate_source_rects(&mut self, source: Rect, frame_width: u32, frame_height: u32, chroma_shift: (u32, u32), normalized: bool) {
        for field in Field::ALL {
            for (plane_index, plane) in self.fields[field.index()].iter_mut().enumerate() {
                plane.rect = source;
                plane.width = frame_width as f32;
                plane.height = frame_height as f32;

                if field != Field::Full {
                    let mut offset_y = 0.5;
                    if plane_index != 0 {
                        offset_y += 0.5;
                    }
                    if field == Field::Bottom {
                        offset_y = -offset_y;
                    }

                    plane.rect.y1 += offset_y;
                    plane.rect.y2 += offset_y;

                    plane.height *= 0.5;
                    plane.rect.y1 *= 0.5;
                    plane.rect.y2 *= 0.5;
                }

                if plane_index != 0 {
                    let divisor_x = (1u32 << chroma_shift.0) as f32;
                    let divisor_y = (1u32 << chroma_shift.1) as f32;
                    plane.width /= divisor_x;
                    plane.height /= divisor_y;
                    plane.rect.x1 /= divisor_x;
                    plane.rect.x2 /= divisor_x;
                    plane.rect.y1 /= divisor_y;
                    plane.rect.y2 /= divisor_y;
                }

                if plane.texture_width == 0 || plane.texture_height == 0 || plane.pixels_per_texel.0 == 0 || plane.pixels_per_texel.1 == 0 {
                    continue;
                }

                let (ppt_x, ppt_y) = (plane.pixels_per_texel.0 as f32, plane.pixels_per_texel.1 as f32);
                plane.height /= ppt_y;
                plane.rect.y1 /= ppt_y;
                plane.rect.y2 /= ppt_y;
                plane.width /= ppt_x;
                plane.rect.x1 /= ppt_x;
                plane.rect.x2 /= ppt_x;

                if normalized {
                    let (texture_width, texture_height) = (plane.texture_width as f32, plane.texture_height as f32);
                    plane.height /= texture_height;
                    plane.rect.y1 /= texture_height;
                    plane.rect.y2 /= texture_height;
                    plane.width /= texture_width;
                    plane.rect.x1 /= texture_width;
                    plane.rect.x2 /= texture_width;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planar_set(width: u32, height: u32) -> TextureSet {
        let mut set = TextureSet::default();
        for field in Field::ALL {
            for (plane_index, plane) in set.fields[field.index()].iter_mut().enumerate() {
                let shift = if plane_index == 0 { 0 } else { 1 };
                plane.texture = Some(TextureHandle((field.index() * 3 + plane_index) as u64));
                plane.owned = true;
                plane.texture_width = width >> shift;
                plane.texture_height = (height >> field.height_shift()) >> shift;
            }
        }
        set
    }

    fn assert_near(actual: f32, expected: f32) {
        if (actual - expected).abs() > 1e-5 {
            panic!("Expected {expected}, got {actual}");
        }
    }

    #[test]
    fn test_full_frame_rects_are_unit() {
        let mut set = planar_set(1920, 1080);
        set.calculate_source_rects(Rect::from_size(1920.0, 1080.0), 1920, 1080, (1, 1), true);
        for plane in set.field(Field::Full) {
            assert_eq!(plane.rect, Rect::new(0.0, 0.0, 1.0, 1.0));
            assert_near(plane.width, 1.0);
            assert_near(plane.height, 1.0);
        }
    }

    #[test]
    fn test_field_offsets() {
        let mut set = planar_set(64, 64);
        set.calculate_source_rects(Rect::from_size(64.0, 64.0), 64, 64, (1, 1), false);

        let top = set.field(Field::Top);
        assert_eq!(top[0].rect, Rect::new(0.0, 0.25, 64.0, 32.25));
        assert_eq!(top[1].rect, Rect::new(0.0, 0.25, 32.0, 16.25));

        let bottom = set.field(Field::Bottom);
        assert_eq!(bottom[0].rect, Rect::new(0.0, -0.25, 64.0, 31.75));
        assert_eq!(bottom[2].rect, Rect::new(0.0, -0.25, 32.0, 15.75));
    }

    #[test]
    fn test_packed_pixels_per_texel() {
        let mut set = TextureSet::default();
        for plane in set.field_mut(Field::Full).iter_mut() {
            plane.texture = Some(TextureHandle(1));
            plane.texture_width = 32;
            plane.texture_height = 32;
            plane.pixels_per_texel = (2, 1);
        }
        set.calculate_source_rects(Rect::from_size(64.0, 32.0), 64, 32, (0, 0), true);
        let plane = set.field(Field::Full)[1];
        assert_eq!(plane.rect, Rect::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn test_zero_sized_planes_are_skipped() {
        let mut set = TextureSet::default();
        set.calculate_source_rects(Rect::from_size(16.0, 16.0), 16, 16, (1, 1), true);
        assert_eq!(set.field(Field::Full)[0].rect, Rect::from_size(16.0, 16.0));
        assert!(!set.is_allocated());
    }
}
