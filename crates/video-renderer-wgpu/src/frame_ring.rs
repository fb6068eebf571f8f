//! Ring of buffered frames
//!
//! Each slot binds a decoder buffer reference to the staging memory and textures
//! its pixels are uploaded into. The decoder hands frames over by slot index and is
//! responsible for not reusing a slot that is still on screen.

use crate::{
    staging::StagingImage,
    texture_set::TextureSet,
    video_buffer::{BufferRef, VideoBuffer},
};
use std::sync::Arc;

/// Maximum number of buffered frames
pub const NUM_BUFFERS: usize = 6;

/// One buffered frame
#[derive(Debug, Default)]
pub struct FrameSlot {
    pub(crate) video_buffer: Option<BufferRef>,
    pub(crate) staging: Option<StagingImage>,
    pub textures: TextureSet,
    /// The textures hold the pixels of `video_buffer`
    pub loaded: bool,
}

impl FrameSlot {
    pub fn has_video_buffer(&self) -> bool {
        self.video_buffer.is_some()
    }
}

/// Fixed-capacity set of frame slots
#[derive(Debug)]
pub struct FrameRing {
    slots: [FrameSlot; NUM_BUFFERS],
    active: usize,
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| FrameSlot::default()),
            active: NUM_BUFFERS,
        }
    }

    /// Sets the number of slots in use, clamped to `1..=NUM_BUFFERS`
    pub fn set_buffer_size(&mut self, count: usize) {
        let clamped = count.clamp(1, NUM_BUFFERS);
        if clamped != count {
            tracing::warn!("Buffer count {count} out of range, using {clamped}");
        }
        self.active = clamped;
    }

    /// Number of slots in use
    pub fn buffer_count(&self) -> usize {
        self.active
    }

    /// Takes a reference on `buffer` for slot `index`
    ///
    /// A reference still held by the slot is released.
    pub fn add_video_picture(&mut self, buffer: Arc<dyn VideoBuffer>, index: usize) {
        let Some(slot) = self.slot_mut(index) else {
            return;
        };
        slot.video_buffer = Some(BufferRef::new(buffer));
        slot.loaded = false;
    }

    /// Releases the decoder reference of slot `index`, if any
    pub fn release_buffer(&mut self, index: usize) {
        if let Some(slot) = self.slot_mut(index) {
            slot.video_buffer = None;
        }
    }

    /// Releases the decoder references of all slots in use
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut().take(self.active) {
            slot.video_buffer = None;
        }
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        let slot = self.slots.get(index);
        if slot.is_none() {
            tracing::warn!("Frame slot {index} out of range");
        }
        slot
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut FrameSlot> {
        let slot = self.slots.get_mut(index);
        if slot.is_none() {
            tracing::warn!("Frame slot {index} out of range");
        }
        slot
    }

    /// All slots, including those beyond the active count
    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut FrameSlot> {
        self.slots.iter_mut()
    }

    pub fn is_loaded(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|slot| slot.loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{format::PixelFormat, test_support::FakeVideoBuffer};

    fn frame() -> Arc<FakeVideoBuffer> {
        Arc::new(FakeVideoBuffer::solid(PixelFormat::Yuv420P, 8, 8, [16, 128, 128]))
    }

    #[test]
    fn test_add_then_release_restores_count() {
        let mut ring = FrameRing::new();
        let buffer = frame();
        for index in 0..NUM_BUFFERS {
            ring.add_video_picture(buffer.clone(), index);
            assert_eq!(buffer.ref_count(), 1);
            assert!(!ring.is_loaded(index));
            ring.release_buffer(index);
            assert_eq!(buffer.ref_count(), 0);
        }
    }

    #[test]
    fn test_replacing_releases_previous() {
        let mut ring = FrameRing::new();
        let first = frame();
        let second = frame();
        ring.add_video_picture(first.clone(), 2);
        ring.add_video_picture(second.clone(), 2);
        assert_eq!(first.ref_count(), 0);
        assert_eq!(second.ref_count(), 1);
    }

    #[test]
    fn test_release_empty_and_out_of_range() {
        let mut ring = FrameRing::new();
        let buffer = frame();
        ring.release_buffer(0);
        ring.add_video_picture(buffer.clone(), NUM_BUFFERS);
        assert_eq!(buffer.ref_count(), 0);
        assert!(ring.slot(NUM_BUFFERS).is_none());
    }

    #[test]
    fn test_reset_releases_active_slots() {
        let mut ring = FrameRing::new();
        let buffer = frame();
        ring.add_video_picture(buffer.clone(), 0);
        ring.add_video_picture(buffer.clone(), 3);
        assert_eq!(buffer.ref_count(), 2);
        ring.reset();
        assert_eq!(buffer.ref_count(), 0);
    }

    #[test]
    fn test_buffer_size_is_clamped() {
        let mut ring = FrameRing::new();
        ring.set_buffer_size(0);
        assert_eq!(ring.buffer_count(), 1);
        ring.set_buffer_size(64);
        assert_eq!(ring.buffer_count(), NUM_BUFFERS);
        ring.set_buffer_size(3);
        assert_eq!(ring.buffer_count(), 3);
    }
}
