//! Renderer state machine
//!
//! A renderer starts unconfigured. [`Renderer::configure`] records the source
//! format and geometry; the first [`Renderer::render_update`] or
//! [`Renderer::update`] afterwards validates it, which rebuilds shaders and
//! allocates textures for every frame slot. [`Renderer::flush`] drops back to
//! unvalidated and [`Renderer::uninit`] to unconfigured.

use crate::{
    backend::{BackendCapabilities, GraphicsBackend, RenderTarget, SamplerFilter, YuvShaderConfig},
    color_management::{ColorManager, ColorState},
    error::RenderError,
    format::{ColorMatrix, Field, PixelFormat, TexelFormat, texel_format},
    format_adapter::{self, FrameFormat},
    frame_ring::{FrameRing, NUM_BUFFERS},
    geometry::{Rect, ViewGeometry, ViewParams, black_bars, frame_aspect_ratio},
    settings::{RendererSettings, SettingsSource, VideoSettings},
    shader_chain::{ColorContext, DrawParams, FilterRequest, RenderQuality, ScalerSupport, ScalingMethod, ShaderChain},
    video_buffer::VideoPicture,
};
use std::sync::{Arc, Mutex};

/// Per-frame render flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RenderFlags(pub u32);

impl RenderFlags {
    /// Draw the top field of an interlaced frame
    pub const TOP: RenderFlags = RenderFlags(1 << 0);
    /// Draw the bottom field of an interlaced frame
    pub const BOTTOM: RenderFlags = RenderFlags(1 << 1);
    /// Interleave both fields of an interlaced frame
    pub const WEAVE: RenderFlags = RenderFlags(1 << 2);
    /// No overlays are composed over this frame
    pub const NO_OSD: RenderFlags = RenderFlags(1 << 3);

    pub fn contains(&self, other: RenderFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RenderFlags {
    type Output = RenderFlags;

    fn bitor(self, rhs: RenderFlags) -> RenderFlags {
        RenderFlags(self.0 | rhs.0)
    }
}

/// Optional renderer features a player may query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderFeature {
    Brightness,
    Contrast,
    Gamma,
    Noise,
    Sharpness,
    NonLinearStretch,
    Stretch,
    Zoom,
    VerticalShift,
    PixelRatio,
    PostProcess,
    Rotation,
}

/// Static renderer limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderInfo {
    /// Highest number of frames the renderer can buffer
    pub max_buffer_count: usize,
}

/// A captured still frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderCapture {
    pub width: u32,
    pub height: u32,
    /// Tightly packed BGRA rows, top row first
    pub pixels: Vec<u8>,
}

/// Source parameters recorded by [`Renderer::configure`]
#[derive(Debug, Clone, Copy, PartialEq)]
struct SourceConfig {
    format: PixelFormat,
    width: u32,
    height: u32,
    display_width: u32,
    display_height: u32,
    color_matrix: ColorMatrix,
    full_range: bool,
    fps: f32,
    flags: u32,
    orientation: u32,
}

/// Draws decoded frames through a [`GraphicsBackend`]
pub struct Renderer<B: GraphicsBackend> {
    backend: B,
    settings: RendererSettings,
    video: VideoSettings,
    color_manager: Box<dyn ColorManager>,
    color: ColorState,
    context_lock: Arc<Mutex<()>>,
    ring: FrameRing,
    chain: ShaderChain,
    capabilities: BackendCapabilities,
    source: Option<SourceConfig>,
    view: ViewGeometry,
    configured: bool,
    validated: bool,
    render_index: usize,
    transfer_buffers: bool,
    normalized: bool,
    clear_color: f32,
}

impl<B: GraphicsBackend> Renderer<B> {
    /// Creates an unconfigured renderer
    ///
    /// # Arguments
    /// * `backend` - Graphics backend all drawing goes through
    /// * `settings` - User preferences, read once
    /// * `color_manager` - Display calibration source
    pub fn new(backend: B, settings: &dyn SettingsSource, color_manager: Box<dyn ColorManager>) -> Self {
        let capabilities = backend.capabilities();
        Self {
            backend,
            settings: RendererSettings::from_source(settings),
            video: VideoSettings::default(),
            color_manager,
            color: ColorState::default(),
            context_lock: Arc::new(Mutex::new(())),
            ring: FrameRing::new(),
            chain: ShaderChain::new(),
            capabilities,
            source: None,
            view: ViewGeometry::default(),
            configured: false,
            validated: false,
            render_index: 0,
            transfer_buffers: false,
            normalized: true,
            clear_color: 0.0,
        }
    }

    /// Shares the graphics context lock with the embedder
    pub fn with_context_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.context_lock = lock;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Current view geometry
    pub fn view(&self) -> &ViewGeometry {
        &self.view
    }

    /// Number of passes used per frame
    pub fn render_quality(&self) -> RenderQuality {
        self.chain.quality()
    }

    /// Scaling method in effect after support checks
    pub fn scaling_method(&self) -> ScalingMethod {
        self.chain.method()
    }

    /// Prepares the renderer for a new source
    ///
    /// Reconfiguring with identical parameters only refreshes the view geometry.
    ///
    /// # Arguments
    /// * `picture` - First picture of the source
    /// * `fps` - Source frame rate
    /// * `flags` - Player flags, passed through to the color manager
    /// * `orientation` - Clockwise rotation in degrees
    pub fn configure(&mut self, picture: &VideoPicture, fps: f32, flags: u32, orientation: u32) -> Result<(), RenderError> {
        let format = picture.format().ok_or(RenderError::MissingBuffer)?;
        let source = SourceConfig {
            format,
            width: picture.width,
            height: picture.height,
            display_width: picture.display_width,
            display_height: picture.display_height,
            color_matrix: picture.color_matrix,
            full_range: picture.full_range,
            fps,
            flags,
            orientation,
        };

        if self.configured && self.source == Some(source) {
            tracing::debug!("Configuration unchanged");
            self.manage_render_area();
            return Ok(());
        }

        self.source = Some(source);
        self.manage_render_area();

        self.configured = true;
        self.chain.invalidate_filter();
        self.validated = false;
        self.chain.reset_stretch();

        self.capabilities = self.backend.capabilities().with_quirks(std::env::consts::OS);
        self.transfer_buffers = self.capabilities.transfer_buffers;
        self.clear_color = if self.capabilities.limited_color_range { 16.0 / 255.0 } else { 0.0 };

        if self.color_manager.is_enabled() {
            if !self.color_manager.check_configuration(self.color.token, flags) {
                tracing::debug!("Color management configuration changed, reloading 3D LUT");
                if let Err(e) = self.color.load_lut(&mut self.backend, self.color_manager.as_mut(), flags) {
                    self.configured = false;
                    self.source = None;
                    return Err(e);
                }
            }
            self.color.enabled = true;
        } else {
            self.color.enabled = false;
        }

        tracing::info!("Configured {} {}x{} at {fps:.3} fps, orientation {orientation}", format.name(), picture.width, picture.height);
        Ok(())
    }

    /// Returns true when `picture` needs a reconfiguration
    pub fn config_changed(&self, picture: &VideoPicture) -> bool {
        match (picture.format(), self.source) {
            (Some(format), Some(source)) => format != source.format,
            _ => false,
        }
    }

    /// Hands a decoded picture to slot `index`
    pub fn add_video_picture(&mut self, picture: &VideoPicture, index: usize) -> Result<(), RenderError> {
        let buffer = picture.buffer.clone().ok_or(RenderError::MissingBuffer)?;
        self.ring.add_video_picture(buffer, index);
        Ok(())
    }

    /// Returns the decoder buffer of slot `index`
    pub fn release_buffer(&mut self, index: usize) {
        self.ring.release_buffer(index);
    }

    /// Returns all decoder buffers
    pub fn reset(&mut self) {
        self.ring.reset();
    }

    /// Sets the number of frame slots in use
    pub fn set_buffer_size(&mut self, count: usize) {
        self.ring.set_buffer_size(count);
    }

    pub fn set_video_settings(&mut self, video: VideoSettings) {
        self.video = video;
    }

    pub fn video_settings(&self) -> &VideoSettings {
        &self.video
    }

    /// Drops all textures; the next draw validates again
    pub fn flush(&mut self) {
        if !self.validated {
            return;
        }

        self.backend.finish();
        for index in 0..self.ring.buffer_count() {
            if let Some(slot) = self.ring.slot_mut(index) {
                format_adapter::delete_textures(&mut self.backend, slot);
            }
        }
        self.backend.finish();

        self.validated = false;
        self.chain.release_offscreen(&mut self.backend);
        self.render_index = 0;
    }

    /// Refreshes the view geometry and validates if needed
    pub fn update(&mut self) {
        if !self.configured {
            return;
        }
        self.manage_render_area();
        self.chain.invalidate_filter();
        self.validate_render_target();
    }

    /// Draws a frame onto the surface
    ///
    /// # Arguments
    /// * `index` - Slot to draw
    /// * `blend_index` - Slot drawn first, with `index` blended over it at half opacity
    /// * `clear` - Every surface pixel must be written, even when nothing is drawn
    /// * `flags` - Field selection
    /// * `alpha` - Opacity of the video, 255 is opaque
    pub fn render_update(&mut self, index: usize, blend_index: Option<usize>, clear: bool, flags: RenderFlags, alpha: u8) {
        self.render_index = blend_index.unwrap_or(index);

        if !self.validate_renderer() {
            if clear {
                self.clear_back_buffer();
            }
            return;
        }

        self.manage_render_area();

        if clear {
            if alpha == 255 {
                self.draw_black_bars();
            } else {
                self.clear_back_buffer();
            }
        }

        let (width, height) = self.backend.surface_size();
        let target_size = (width as f32, height as f32);
        let opacity = alpha as f32 / 255.0;
        if !self.render(RenderTarget::Surface, target_size, flags, self.render_index, opacity, alpha < 255) && clear {
            self.clear_back_buffer();
        }

        if blend_index.is_some() {
            self.render_index = index;
            self.render(RenderTarget::Surface, target_size, flags, index, 0.5, true);
        }

        self.backend.flush();
    }

    /// Renders the current frame into an offscreen capture of the given size
    pub fn render_capture(&mut self, width: u32, height: u32) -> Result<RenderCapture, RenderError> {
        if !self.validated {
            return Err(RenderError::NotValidated);
        }
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidCaptureSize { width, height });
        }

        let saved_view = self.view;
        let saved_viewport = self.backend.viewport();
        let orientation = self.source.map_or(0, |source| source.orientation);
        self.view = saved_view.with_dest(Rect::from_size(width as f32, height as f32), orientation);
        self.backend.set_viewport(Rect::from_size(width as f32, height as f32));

        let pixels = self.backend.begin_capture(width, height).and_then(|()| {
            if !self.render(RenderTarget::Capture, (width as f32, height as f32), RenderFlags::NO_OSD, self.render_index, 1.0, false) {
                tracing::warn!("Nothing rendered into the capture");
            }
            self.backend.end_capture()
        });

        self.backend.set_viewport(saved_viewport);
        self.view = saved_view;

        Ok(RenderCapture { width, height, pixels: pixels? })
    }

    /// Reports whether an optional feature is available
    pub fn supports_feature(&self, feature: RenderFeature) -> bool {
        match feature {
            RenderFeature::Brightness | RenderFeature::Contrast | RenderFeature::NonLinearStretch => self.chain.has_render_method(),
            RenderFeature::Gamma | RenderFeature::Noise | RenderFeature::Sharpness => false,
            RenderFeature::Stretch | RenderFeature::Zoom | RenderFeature::VerticalShift | RenderFeature::PixelRatio | RenderFeature::PostProcess | RenderFeature::Rotation => true,
        }
    }

    /// Reports whether a scaling method can be used for the current source
    pub fn supports_scaling(&self, method: ScalingMethod) -> bool {
        self.scaler_support().supports(method)
    }

    pub fn render_info(&self) -> RenderInfo {
        RenderInfo { max_buffer_count: NUM_BUFFERS }
    }

    /// Releases every GPU resource and returns to the unconfigured state
    pub fn uninit(&mut self) {
        tracing::debug!("Cleaning up GPU resources");
        let lock = Arc::clone(&self.context_lock);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        self.backend.finish();
        for slot in self.ring.slots_mut() {
            format_adapter::delete_textures(&mut self.backend, slot);
        }
        self.color.delete_lut(&mut self.backend);
        self.chain.release_offscreen(&mut self.backend);

        self.validated = false;
        self.configured = false;
    }

    fn manage_render_area(&mut self) {
        let Some(source) = self.source else {
            return;
        };
        let params = ViewParams {
            source_aspect: frame_aspect_ratio(source.display_width, source.display_height),
            orientation: source.orientation,
            zoom: self.video.zoom,
            pixel_ratio: self.video.pixel_ratio,
            vertical_shift: self.video.vertical_shift,
        };
        self.view = ViewGeometry::new(source.width, source.height, self.backend.viewport(), &params);
    }

    fn frame_format(&self, source: &SourceConfig) -> FrameFormat {
        FrameFormat {
            format: source.format,
            width: source.width,
            height: source.height,
            transfer_buffers: self.transfer_buffers,
            transfer_row_alignment: self.capabilities.transfer_row_alignment,
            transfer_offset: self.capabilities.transfer_offset,
            sixteen_bit_textures: self.capabilities.sixteen_bit_textures,
            normalized: self.normalized,
        }
    }

    fn scaler_support(&self) -> ScalerSupport {
        ScalerSupport {
            format: self.source.map(|source| source.format),
            source_size: self.source.map_or((0, 0), |source| (source.width, source.height)),
            dest_size: (self.view.dest.width(), self.view.dest.height()),
            hq_scalers_threshold: self.settings.hq_scalers_threshold,
            enable_hq_hw_scalers: self.settings.enable_hq_hw_scalers,
            offscreen_rendering: self.capabilities.offscreen_rendering,
            shaders: self.capabilities.shaders,
        }
    }

    /// Checks that the current slot can be drawn, validating first if needed
    fn validate_renderer(&mut self) -> bool {
        if !self.configured {
            return false;
        }
        // the validation pass only allocates
        if self.validate_render_target() {
            return false;
        }
        self.ring.slot(self.render_index).is_some_and(|slot| slot.textures.is_allocated())
    }

    /// Rebuilds shaders and textures when unvalidated
    ///
    /// Returns true when the validation ran and succeeded.
    fn validate_render_target(&mut self) -> bool {
        if self.validated {
            return false;
        }
        let Some(source) = self.source else {
            return false;
        };

        self.normalized = self.capabilities.npot_textures || !self.capabilities.rectangle_textures;

        self.backend.finish();
        for slot in self.ring.slots_mut() {
            format_adapter::delete_textures(&mut self.backend, slot);
        }

        self.chain.invalidate_filter();
        self.update_video_filter();
        self.load_shaders();
        if !self.chain.has_render_method() {
            return false;
        }

        tracing::info!("Using {} texture coordinates", if self.normalized { "normalized" } else { "texel" });

        let frame = self.frame_format(&source);
        let frame_count = self.ring.buffer_count();
        for (index, slot) in self.ring.slots_mut().take(frame_count).enumerate() {
            if let Err(e) = format_adapter::create_textures(&mut self.backend, slot, &frame) {
                tracing::warn!("Failed to create textures for slot {index}: {e}");
            }
        }

        self.validated = true;
        true
    }

    fn update_video_filter(&mut self) {
        let Some(source) = self.source else {
            return;
        };
        let request = FilterRequest {
            method: self.video.scaling_method,
            nonlinear_stretch: self.video.non_linear_stretch,
            pixel_ratio: self.video.pixel_ratio,
            fps: source.fps,
            source_size: (source.width, source.height),
            surface_size: self.backend.surface_size(),
            flags: source.flags,
        };
        let support = self.scaler_support();
        let mut color = ColorContext {
            state: &mut self.color,
            manager: self.color_manager.as_mut(),
            settings: &self.settings,
            full_range_display: !self.capabilities.limited_color_range,
        };
        if let Some(filter) = self.chain.update_video_filter(&mut self.backend, &request, &support, &mut color) {
            self.set_texture_filter(filter);
        }
    }

    fn load_shaders(&mut self) {
        let Some(source) = self.source else {
            return;
        };
        let texture_bits = if texel_format(source.format, 0, self.capabilities.sixteen_bit_textures) == TexelFormat::R16 { 16 } else { 8 };
        let template = YuvShaderConfig {
            format: source.format,
            texture_bits,
            color_matrix: source.color_matrix,
            full_range_source: source.full_range,
            unnormalized: !self.normalized,
            nonlinear_stretch: false,
            limited_output: self.color.enabled || self.capabilities.limited_color_range,
            output: None,
        };
        let output = self.color.output_stage(&self.settings, !self.capabilities.limited_color_range);
        self.chain.load_shaders(&mut self.backend, &template, output);
    }

    fn set_texture_filter(&mut self, filter: SamplerFilter) {
        for slot in self.ring.slots_mut() {
            for planes in slot.textures.fields.iter() {
                for plane in planes.iter().filter(|plane| plane.owned) {
                    if let Some(texture) = plane.texture {
                        self.backend.set_texture_filter(texture, filter);
                    }
                }
            }
        }
    }

    fn draw_params(&self, target_size: (f32, f32), alpha: f32, blend: bool) -> DrawParams {
        let stretch = if self.chain.nonlinear_stretch() && !self.video.menu_active {
            self.video.pixel_ratio.powf(self.settings.nonlin_stretch_ratio)
        } else {
            1.0
        };
        DrawParams {
            black: self.video.brightness * 0.01 - 0.5,
            contrast: self.video.contrast * 0.02,
            alpha,
            stretch,
            blend,
            target_size,
            corners: self.view.corners,
        }
    }

    /// Uploads slot `index` and draws it onto `target`
    ///
    /// Returns false when the slot has nothing to upload or no conversion shader exists.
    fn render(&mut self, target: RenderTarget, target_size: (f32, f32), flags: RenderFlags, index: usize, alpha: f32, blend: bool) -> bool {
        let Some(source) = self.source else {
            return false;
        };
        let weave = flags.contains(RenderFlags::WEAVE);
        let field = if flags.contains(RenderFlags::TOP) {
            Field::Top
        } else if flags.contains(RenderFlags::BOTTOM) {
            Field::Bottom
        } else {
            Field::Full
        };
        // weaving samples both field texture sets
        let upload_field = if weave { Field::Top } else { field };

        let frame = self.frame_format(&source);
        let source_rect = self.view.source;
        let Some(slot) = self.ring.slot_mut(index) else {
            return false;
        };
        if !format_adapter::upload(&mut self.backend, slot, &frame, upload_field, source_rect) {
            return false;
        }
        let textures = slot.textures.clone();

        if !self.chain.has_render_method() {
            return false;
        }

        self.update_video_filter();
        if self.chain.needs_reload() {
            self.load_shaders();
        }

        let params = self.draw_params(target_size, alpha, blend);
        let source_size = (source.width, source.height);
        let result = if weave {
            let scaled = source.width as f32 != self.view.dest.width() || source.height as f32 != self.view.dest.height();
            self.chain.render_weave(
                &mut self.backend,
                target,
                textures.field(Field::Top),
                textures.field(Field::Bottom),
                &params,
                source_size,
                scaled,
                self.capabilities.offscreen_rendering,
                self.normalized,
            )
        } else {
            match self.chain.quality() {
                RenderQuality::SinglePass => {
                    self.chain.release_unused_offscreen(&mut self.backend);
                    self.chain.render_single_pass(&mut self.backend, target, textures.field(field), field, &params, false)
                }
                RenderQuality::MultiPass => self
                    .chain
                    .render_to_offscreen(&mut self.backend, textures.field(field), field, &params, source_size, self.normalized, false)
                    .and_then(|()| self.chain.render_from_offscreen(&mut self.backend, target, &params)),
            }
        };
        if let Err(e) = result {
            tracing::warn!("Frame draw failed: {e}");
        }
        true
    }

    fn clear_back_buffer(&mut self) {
        let c = self.clear_color;
        if let Err(e) = self.backend.clear(RenderTarget::Surface, [c, c, c, 0.0]) {
            tracing::warn!("Clear failed: {e}");
        }
    }

    fn draw_black_bars(&mut self) {
        let (width, height) = self.backend.surface_size();
        let bars = black_bars(&self.view.corners, width as f32, height as f32);
        if bars.is_empty() {
            return;
        }
        let c = self.clear_color;
        if let Err(e) = self.backend.fill_rects(RenderTarget::Surface, &bars, [c, c, c, 1.0]) {
            tracing::warn!("Drawing black bars failed: {e}");
        }
    }
}

impl<B: GraphicsBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        self.uninit();
        self.chain.free(&mut self.backend);
    }
}
