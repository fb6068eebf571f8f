//! Renderer configuration
//!
//! User preferences come from a read-only key/value store behind [`SettingsSource`].
//! They are read once into [`RendererSettings`] when the renderer is created. Per-video
//! adjustments that change while playing live in [`VideoSettings`] and are pushed
//! into the renderer by the player.

use crate::shader_chain::ScalingMethod;
use serde::Deserialize;
use std::collections::HashMap;

/// Enables ordered dithering of the output
pub const SETTING_DITHER: &str = "videoscreen.dither";
/// Target bit depth of the dithering
pub const SETTING_DITHER_DEPTH: &str = "videoscreen.ditherdepth";
/// Minimum scale change in percent before high quality scalers are used
pub const SETTING_HQ_SCALERS: &str = "videoplayer.hqscalers";
/// Allows the expensive Lanczos3 and Spline36 scalers
pub const SETTING_ENABLE_HQ_HW_SCALERS: &str = "videoplayer.enablehighqualityhwscalers";
/// Highest frame rate at which automatic scaling picks a high quality scaler
pub const SETTING_AUTO_SCALE_MAX_FPS: &str = "videoplayer.autoscalemaxfps";
/// Exponent applied to the pixel ratio for non-linear stretch
pub const SETTING_NONLIN_STRETCH_RATIO: &str = "videoplayer.nonlinstretchratio";

/// Read-only typed key/value store
pub trait SettingsSource {
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_int(&self, key: &str) -> Option<i64>;
    fn get_float(&self, key: &str) -> Option<f64>;
}

/// In-memory settings store, loadable from a flat JSON object
///
/// ```
/// use video_renderer_wgpu::{MemorySettings, SettingsSource};
///
/// let settings = MemorySettings::from_json(r#"{ "videoscreen.dither": true }"#).unwrap();
/// assert_eq!(settings.get_bool("videoscreen.dither"), Some(true));
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct MemorySettings {
    values: HashMap<String, serde_json::Value>,
}

impl MemorySettings {
    /// Parses settings from a JSON object of key/value pairs
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Sets a single value
    pub fn set(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.values.insert(key.to_string(), value.into());
    }
}

impl SettingsSource for MemorySettings {
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key)?.as_bool()
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key)?.as_i64()
    }

    fn get_float(&self, key: &str) -> Option<f64> {
        self.values.get(key)?.as_f64()
    }
}

/// Renderer preferences read from the settings store
#[derive(Debug, Clone, PartialEq)]
pub struct RendererSettings {
    /// Ordered dithering of the output
    pub dither: bool,
    /// Target bit depth of the dithering
    pub dither_depth: u32,
    /// Minimum scale change in percent before high quality scalers are offered
    pub hq_scalers_threshold: f32,
    /// Allows Lanczos3 and Spline36
    pub enable_hq_hw_scalers: bool,
    /// Highest frame rate at which automatic scaling picks Lanczos3 (fast)
    pub auto_scale_max_fps: f32,
    /// Exponent applied to the pixel ratio for non-linear stretch
    pub nonlin_stretch_ratio: f32,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            dither: false,
            dither_depth: 8,
            hq_scalers_threshold: 20.0,
            enable_hq_hw_scalers: false,
            auto_scale_max_fps: 30.0,
            nonlin_stretch_ratio: 0.5,
        }
    }
}

impl RendererSettings {
    /// Reads the renderer preferences, keeping defaults for missing keys
    pub fn from_source(source: &dyn SettingsSource) -> Self {
        let defaults = Self::default();
        Self {
            dither: source.get_bool(SETTING_DITHER).unwrap_or(defaults.dither),
            dither_depth: source.get_int(SETTING_DITHER_DEPTH).map(|depth| depth.clamp(1, 16) as u32).unwrap_or(defaults.dither_depth),
            hq_scalers_threshold: source.get_int(SETTING_HQ_SCALERS).map(|t| t as f32).unwrap_or(defaults.hq_scalers_threshold),
            enable_hq_hw_scalers: source.get_bool(SETTING_ENABLE_HQ_HW_SCALERS).unwrap_or(defaults.enable_hq_hw_scalers),
            auto_scale_max_fps: source.get_float(SETTING_AUTO_SCALE_MAX_FPS).map(|fps| fps as f32).unwrap_or(defaults.auto_scale_max_fps),
            nonlin_stretch_ratio: source.get_float(SETTING_NONLIN_STRETCH_RATIO).map(|r| r as f32).unwrap_or(defaults.nonlin_stretch_ratio),
        }
    }
}

/// Per-video adjustments set by the player
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// Requested scaling method
    pub scaling_method: ScalingMethod,
    /// Brightness in percent, 50 is neutral
    pub brightness: f32,
    /// Contrast in percent, 50 is neutral
    pub contrast: f32,
    /// Zoom factor
    pub zoom: f32,
    /// Vertical shift of the picture
    pub vertical_shift: f32,
    /// Aspect ratio of one display pixel
    pub pixel_ratio: f32,
    /// Stretch the picture non-linearly instead of uniformly
    pub non_linear_stretch: bool,
    /// A disc menu is shown, which disables non-linear stretch
    pub menu_active: bool,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            scaling_method: ScalingMethod::Linear,
            brightness: 50.0,
            contrast: 50.0,
            zoom: 1.0,
            vertical_shift: 0.0,
            pixel_ratio: 1.0,
            non_linear_stretch: false,
            menu_active: false,
        }
    }
}
