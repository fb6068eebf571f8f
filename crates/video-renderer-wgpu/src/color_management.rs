//! Display color management
//!
//! A [`ColorManager`] owns the calibration state and produces a 3D lookup table for
//! the current display profile. The renderer keeps at most one table resident on
//! the GPU and reloads it only when the manager reports that its configuration no
//! longer matches the token of the loaded table.

use crate::{
    backend::{GraphicsBackend, LutBinding, OutputStage},
    error::RenderError,
    settings::RendererSettings,
};

/// Source of display calibration lookup tables
pub trait ColorManager {
    /// Color management is switched on
    fn is_enabled(&self) -> bool;

    /// Returns true while `token` still describes the active calibration for `flags`
    fn check_configuration(&self, token: i32, flags: u32) -> bool;

    /// Edge length of the lookup table cube
    fn lut_size(&self) -> Option<u32>;

    /// Builds the lookup table as `size`³ RGB triplets, red varying fastest
    ///
    /// `token` is updated to identify the calibration the table was built for.
    fn load_video_3d_lut(&mut self, flags: u32, token: &mut i32, size: u32) -> Option<Vec<u16>>;
}

/// Color manager for displays without calibration
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledColorManager;

impl ColorManager for DisabledColorManager {
    fn is_enabled(&self) -> bool {
        false
    }

    fn check_configuration(&self, _token: i32, _flags: u32) -> bool {
        true
    }

    fn lut_size(&self) -> Option<u32> {
        None
    }

    fn load_video_3d_lut(&mut self, _flags: u32, _token: &mut i32, _size: u32) -> Option<Vec<u16>> {
        None
    }
}

/// Renderer-side color management state
#[derive(Debug)]
pub(crate) struct ColorState {
    /// Color correction is applied to the output
    pub enabled: bool,
    /// Calibration token of the loaded table
    pub token: i32,
    pub lut: Option<LutBinding>,
}

impl Default for ColorState {
    fn default() -> Self {
        Self {
            enabled: false,
            token: -1,
            lut: None,
        }
    }
}

impl ColorState {
    /// The manager's state differs from what the renderer uses
    pub fn changed(&self, manager: &dyn ColorManager, flags: u32) -> bool {
        self.enabled != manager.is_enabled() || (self.enabled && !manager.check_configuration(self.token, flags))
    }

    /// Replaces the resident lookup table with a fresh one from `manager`
    pub fn load_lut(&mut self, backend: &mut dyn GraphicsBackend, manager: &mut dyn ColorManager, flags: u32) -> Result<(), RenderError> {
        self.delete_lut(backend);

        let size = manager.lut_size().ok_or(RenderError::LutLoad)?;
        let Some(data) = manager.load_video_3d_lut(flags, &mut self.token, size) else {
            tracing::error!("Error loading the 3D LUT");
            return Err(RenderError::LutLoad);
        };
        let expected = (size as usize).pow(3) * 3;
        if data.len() < expected {
            tracing::error!("3D LUT has {} values, expected {expected}", data.len());
            return Err(RenderError::LutLoad);
        }

        tracing::debug!("Creating {size}x{size}x{size} 3D LUT");
        let handle = backend.create_lut(size, &data[..expected])?;
        self.lut = Some(LutBinding { handle, size });
        Ok(())
    }

    pub fn delete_lut(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(lut) = self.lut.take() {
            tracing::debug!("Deleting 3D LUT");
            backend.delete_lut(lut.handle);
        }
    }

    /// Output stage for the last shader of the chain
    ///
    /// # Arguments
    /// * `settings` - Dithering preferences
    /// * `full_range_display` - The display expects full-range RGB
    pub fn output_stage(&self, settings: &RendererSettings, full_range_display: bool) -> OutputStage {
        OutputStage {
            dither: settings.dither,
            dither_depth: settings.dither_depth,
            full_range: self.enabled && full_range_display,
            lut: if self.enabled { self.lut } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeBackend, FakeColorManager};

    #[test]
    fn test_disabled_manager_never_changes() {
        let state = ColorState::default();
        assert!(!state.changed(&DisabledColorManager, 0));
    }

    #[test]
    fn test_load_replaces_resident_lut() {
        let mut backend = FakeBackend::new();
        let mut manager = FakeColorManager::new(4);
        let mut state = ColorState::default();

        state.load_lut(&mut backend, &mut manager, 0).unwrap();
        state.load_lut(&mut backend, &mut manager, 0).unwrap();
        assert_eq!(backend.live_luts(), 1);
        assert_eq!(state.lut.map(|lut| lut.size), Some(4));
        assert_eq!(state.token, manager.token);

        state.delete_lut(&mut backend);
        assert_eq!(backend.live_luts(), 0);
    }

    #[test]
    fn test_load_failure() {
        let mut backend = FakeBackend::new();
        let mut manager = FakeColorManager::new(4);
        manager.fail_load = true;
        let mut state = ColorState::default();
        assert!(matches!(state.load_lut(&mut backend, &mut manager, 0), Err(RenderError::LutLoad)));
        assert!(state.lut.is_none());
    }

    #[test]
    fn test_stale_token_is_a_change() {
        let mut manager = FakeColorManager::new(2);
        let mut state = ColorState {
            enabled: true,
            ..Default::default()
        };
        assert!(state.changed(&manager, 0));
        state.token = manager.token;
        assert!(!state.changed(&manager, 0));
        manager.token += 1;
        assert!(state.changed(&manager, 0));
    }

    #[test]
    fn test_output_stage_without_color_management() {
        let state = ColorState::default();
        let stage = state.output_stage(&RendererSettings::default(), true);
        assert!(!stage.full_range);
        assert!(stage.lut.is_none());
        assert_eq!(stage.dither_depth, 8);
    }
}
