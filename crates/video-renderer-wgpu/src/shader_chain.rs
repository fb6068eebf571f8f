//! Conversion and scaling shader chain
//!
//! Frames are drawn either in a single pass, where the YUV conversion shader
//! samples the plane textures straight onto the target, or in two passes, where
//! the conversion writes an RGB intermediate at source resolution and a
//! convolution filter scales that intermediate onto the target. The chain picks
//! the mode from the requested scaling method and owns the shaders and the
//! offscreen intermediate of the active mode.

use crate::{
    backend::{
        ConvolutionKernel, FilterDraw, FilterKind, FilterShaderConfig, GraphicsBackend, OffscreenHandle, OutputStage, QuadVertex, RenderTarget, SamplerFilter, ShaderHandle, YuvDraw,
        YuvShaderConfig,
    },
    color_management::{ColorManager, ColorState},
    error::BackendError,
    format::{Field, MAX_PLANES, PixelFormat},
    geometry::{Point, Rect, orthographic},
    settings::RendererSettings,
    texture_set::YuvPlane,
};
use serde::Deserialize;

/// Scaling methods a user can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMethod {
    Nearest,
    Linear,
    Cubic,
    Lanczos2,
    Lanczos3Fast,
    Lanczos3,
    Spline36Fast,
    Spline36,
    BicubicSoftware,
    LanczosSoftware,
    SincSoftware,
    Sinc8,
    Nedi,
    Auto,
}

impl ScalingMethod {
    /// Returns the human-readable name of this method
    pub fn name(&self) -> &'static str {
        match self {
            ScalingMethod::Nearest => "Nearest",
            ScalingMethod::Linear => "Linear",
            ScalingMethod::Cubic => "Cubic",
            ScalingMethod::Lanczos2 => "Lanczos2",
            ScalingMethod::Lanczos3Fast => "Lanczos3 (fast)",
            ScalingMethod::Lanczos3 => "Lanczos3",
            ScalingMethod::Spline36Fast => "Spline36 (fast)",
            ScalingMethod::Spline36 => "Spline36",
            ScalingMethod::BicubicSoftware => "Bicubic (software)",
            ScalingMethod::LanczosSoftware => "Lanczos (software)",
            ScalingMethod::SincSoftware => "Sinc (software)",
            ScalingMethod::Sinc8 => "Sinc8",
            ScalingMethod::Nedi => "NEDI",
            ScalingMethod::Auto => "Auto",
        }
    }

    /// Convolution filter implementing this method, for the two-pass scalers
    pub fn convolution(&self) -> Option<FilterKind> {
        let (kernel, fast) = match self {
            ScalingMethod::Cubic => (ConvolutionKernel::Cubic, false),
            ScalingMethod::Lanczos2 => (ConvolutionKernel::Lanczos2, false),
            ScalingMethod::Lanczos3Fast => (ConvolutionKernel::Lanczos3, true),
            ScalingMethod::Lanczos3 => (ConvolutionKernel::Lanczos3, false),
            ScalingMethod::Spline36Fast => (ConvolutionKernel::Spline36, true),
            ScalingMethod::Spline36 => (ConvolutionKernel::Spline36, false),
            _ => return None,
        };
        Some(FilterKind::Convolution { kernel, fast })
    }
}

/// Number of shader passes per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderQuality {
    #[default]
    SinglePass,
    MultiPass,
}

/// State the scaler support check depends on
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ScalerSupport {
    pub format: Option<PixelFormat>,
    pub source_size: (u32, u32),
    pub dest_size: (f32, f32),
    pub hq_scalers_threshold: f32,
    pub enable_hq_hw_scalers: bool,
    pub offscreen_rendering: bool,
    pub shaders: bool,
}

impl ScalerSupport {
    /// Returns true when `method` can be used for the current source and destination
    pub fn supports(&self, method: ScalingMethod) -> bool {
        match method {
            ScalingMethod::Nearest => !self.format.is_some_and(|format| format.is_packed()),
            ScalingMethod::Linear | ScalingMethod::Auto => true,
            ScalingMethod::Cubic
            | ScalingMethod::Lanczos2
            | ScalingMethod::Lanczos3Fast
            | ScalingMethod::Lanczos3
            | ScalingMethod::Spline36Fast
            | ScalingMethod::Spline36 => {
                let (source_width, source_height) = (self.source_size.0 as f32, self.source_size.1 as f32);
                if source_width <= 0.0 || source_height <= 0.0 {
                    return false;
                }

                // skip quality scalers when the size barely changes
                let scale_x = ((source_width - self.dest_size.0) / source_width).abs() * 100.0;
                let scale_y = ((source_height - self.dest_size.1) / source_height).abs() * 100.0;
                if scale_x < self.hq_scalers_threshold && scale_y < self.hq_scalers_threshold {
                    return false;
                }

                if !(self.offscreen_rendering && self.shaders) {
                    return false;
                }
                match method {
                    ScalingMethod::Lanczos3 | ScalingMethod::Spline36 => self.enable_hq_hw_scalers,
                    _ => true,
                }
            }
            _ => false,
        }
    }
}

/// Player state the filter selection depends on
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FilterRequest {
    pub method: ScalingMethod,
    pub nonlinear_stretch: bool,
    pub pixel_ratio: f32,
    pub fps: f32,
    pub source_size: (u32, u32),
    pub surface_size: (u32, u32),
    /// Renderer configuration flags, passed through to the color manager
    pub flags: u32,
}

/// Color management inputs of the shader construction
pub(crate) struct ColorContext<'a> {
    pub state: &'a mut ColorState,
    pub manager: &'a mut dyn ColorManager,
    pub settings: &'a RendererSettings,
    pub full_range_display: bool,
}

impl ColorContext<'_> {
    fn output_stage(&self) -> OutputStage {
        self.state.output_stage(self.settings, self.full_range_display)
    }
}

/// Per-draw parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DrawParams {
    pub black: f32,
    pub contrast: f32,
    pub alpha: f32,
    /// Non-linear stretch exponent
    pub stretch: f32,
    pub blend: bool,
    /// Target size in pixels
    pub target_size: (f32, f32),
    /// Destination corners for the content's top-left, top-right, bottom-right and bottom-left
    pub corners: [Point; 4],
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Offscreen {
    handle: OffscreenHandle,
    width: u32,
    height: u32,
    /// Size of the content written by the last conversion pass
    content: (f32, f32),
}

/// Shader programs and render mode of the renderer
#[derive(Debug, Default)]
pub(crate) struct ShaderChain {
    /// Method last requested by the player, `None` forces re-evaluation
    requested: Option<ScalingMethod>,
    method: Option<ScalingMethod>,
    quality: RenderQuality,
    nonlinear_requested: bool,
    nonlinear_stretch: bool,
    pixel_ratio: f32,
    reload_shaders: bool,
    yuv_shader: Option<ShaderHandle>,
    filter_shader: Option<(ShaderHandle, FilterKind)>,
    offscreen: Option<Offscreen>,
}

fn is_unit_ratio(ratio: f32) -> bool {
    (0.999..=1.001).contains(&ratio)
}

impl ShaderChain {
    pub fn new() -> Self {
        Self {
            pixel_ratio: 1.0,
            ..Default::default()
        }
    }

    pub fn quality(&self) -> RenderQuality {
        self.quality
    }

    /// Effective scaling method
    pub fn method(&self) -> ScalingMethod {
        self.method.unwrap_or(ScalingMethod::Linear)
    }

    pub fn nonlinear_stretch(&self) -> bool {
        self.nonlinear_stretch
    }

    pub fn needs_reload(&self) -> bool {
        self.reload_shaders
    }

    /// A conversion shader is available
    pub fn has_render_method(&self) -> bool {
        self.yuv_shader.is_some()
    }

    pub fn offscreen_size(&self) -> Option<(u32, u32)> {
        self.offscreen.map(|offscreen| (offscreen.width, offscreen.height))
    }

    /// Forces the next [`update_video_filter`](Self::update_video_filter) to re-evaluate
    pub fn invalidate_filter(&mut self) {
        self.requested = None;
    }

    /// Clears the non-linear stretch state for a new source
    pub fn reset_stretch(&mut self) {
        self.nonlinear_stretch = false;
        self.nonlinear_requested = false;
        self.pixel_ratio = 1.0;
    }

    /// Re-evaluates scaling method, render quality and filter shader
    ///
    /// Returns the texture filter to apply to the plane textures when the
    /// selection was re-evaluated.
    pub fn update_video_filter(&mut self, backend: &mut dyn GraphicsBackend, request: &FilterRequest, support: &ScalerSupport, color: &mut ColorContext<'_>) -> Option<SamplerFilter> {
        if self.filter_shader.is_none() {
            match backend.compile_filter_shader(&FilterShaderConfig {
                kind: FilterKind::Default,
                nonlinear_stretch: false,
                output: None,
            }) {
                Ok(shader) => self.filter_shader = Some((shader, FilterKind::Default)),
                Err(e) => {
                    tracing::error!("Error compiling video filter shader: {e}");
                    return None;
                }
            }
        }

        let pixel_ratio_changed = is_unit_ratio(request.pixel_ratio) != is_unit_ratio(self.pixel_ratio);
        let cms_changed = color.state.changed(color.manager, request.flags);
        let mut stretch_changed = false;
        if self.nonlinear_requested != request.nonlinear_stretch || pixel_ratio_changed {
            self.nonlinear_requested = request.nonlinear_stretch;
            self.pixel_ratio = request.pixel_ratio;
            self.reload_shaders = true;
            stretch_changed = true;

            self.nonlinear_stretch = self.nonlinear_requested && !is_unit_ratio(self.pixel_ratio) && support.shaders;
            if self.nonlinear_stretch {
                tracing::debug!("Enabling non-linear stretch");
            } else {
                tracing::debug!("Disabling non-linear stretch");
            }
        }

        if self.requested == Some(request.method) && !stretch_changed && !cms_changed {
            return None;
        }
        self.reload_shaders = true;

        if cms_changed {
            if color.manager.is_enabled() {
                if !color.manager.check_configuration(color.state.token, request.flags) {
                    tracing::debug!("Color management configuration changed, reloading 3D LUT");
                    if let Err(e) = color.state.load_lut(backend, color.manager, request.flags) {
                        tracing::error!("Failed to reload 3D LUT: {e}");
                    }
                }
                color.state.enabled = true;
            } else {
                color.state.enabled = false;
            }
        }

        self.requested = Some(request.method);
        let mut method = request.method;
        if !support.supports(method) {
            tracing::warn!("Scaling method {} is not supported by the renderer", method.name());
            method = ScalingMethod::Linear;
        }

        self.delete_filter_shader(backend);
        self.release_offscreen(backend);

        if method == ScalingMethod::Auto {
            let (source_width, source_height) = request.source_size;
            let scale_sd = source_height < 720 && source_width < 1280;
            let scale_up = source_height < request.surface_size.1 && source_width < request.surface_size.0;
            let scale_fps = request.fps < color.settings.auto_scale_max_fps + 0.01;

            method = if support.supports(ScalingMethod::Lanczos3Fast) && scale_sd && scale_up && scale_fps {
                ScalingMethod::Lanczos3Fast
            } else {
                ScalingMethod::Linear
            };
        }
        self.method = Some(method);

        match method {
            ScalingMethod::Nearest | ScalingMethod::Linear => {
                let filter = if method == ScalingMethod::Nearest { SamplerFilter::Nearest } else { SamplerFilter::Linear };
                self.quality = RenderQuality::SinglePass;
                let kind = if self.nonlinear_stretch { FilterKind::Stretch } else { FilterKind::Default };
                match self.compile_filter(backend, kind, None) {
                    Ok(()) => return Some(filter),
                    Err(e) => tracing::error!("Error compiling video filter shader: {e}"),
                }
            }
            ScalingMethod::Cubic
            | ScalingMethod::Lanczos2
            | ScalingMethod::Lanczos3Fast
            | ScalingMethod::Lanczos3
            | ScalingMethod::Spline36Fast
            | ScalingMethod::Spline36 => {
                let result = self.create_offscreen(backend, request.source_size).and_then(|()| {
                    let kind = method.convolution().unwrap_or(FilterKind::Default);
                    self.compile_filter(backend, kind, Some(color.output_stage()))
                });
                match result {
                    Ok(()) => {
                        tracing::info!("Using {} scaler in two passes", method.name());
                        self.quality = RenderQuality::MultiPass;
                        return Some(SamplerFilter::Linear);
                    }
                    Err(e) => tracing::error!("Failed to set up {} scaler: {e}", method.name()),
                }
            }
            _ => tracing::error!("Scaling method {} is not implemented", method.name()),
        }

        tracing::error!("Falling back to bilinear scaling");
        self.delete_filter_shader(backend);
        self.release_offscreen(backend);
        if let Err(e) = self.compile_filter(backend, FilterKind::Default, None) {
            tracing::error!("Error compiling default video filter shader: {e}");
        }
        self.method = Some(ScalingMethod::Linear);
        self.quality = RenderQuality::SinglePass;
        Some(SamplerFilter::Linear)
    }

    /// Rebuilds the YUV conversion shader
    ///
    /// `template` describes the source; the output stage and non-linear stretch
    /// are only baked in for single-pass rendering, where this is the last shader.
    pub fn load_shaders(&mut self, backend: &mut dyn GraphicsBackend, template: &YuvShaderConfig, output: OutputStage) -> bool {
        self.reload_shaders = false;

        if let Some(shader) = self.yuv_shader.take() {
            backend.delete_shader(shader);
        }

        let single_pass = self.quality == RenderQuality::SinglePass;
        let config = YuvShaderConfig {
            output: if single_pass { Some(output) } else { None },
            nonlinear_stretch: self.nonlinear_stretch && single_pass,
            ..*template
        };

        tracing::info!("Selecting YUV to RGB shader for {}", config.format.name());
        match backend.compile_yuv_shader(&config) {
            Ok(shader) => {
                self.yuv_shader = Some(shader);
                true
            }
            Err(e) => {
                tracing::error!("Error enabling YUV to RGB shader: {e}");
                false
            }
        }
    }

    /// Converts and scales the frame straight onto `target`
    pub fn render_single_pass(&self, backend: &mut dyn GraphicsBackend, target: RenderTarget, planes: &[YuvPlane; MAX_PLANES], field: Field, params: &DrawParams, stipple: bool) -> Result<(), BackendError> {
        let shader = self.yuv_shader.ok_or(BackendError::Unsupported("no YUV shader loaded"))?;
        let corners = params.corners.map(|p| [p.x, p.y]);
        let draw = yuv_draw(shader, planes, QuadVertex::strip(corners), orthographic(params.target_size.0, params.target_size.1), params, field, stipple)?;
        backend.draw_yuv(target, &draw)
    }

    /// Converts the frame into the offscreen intermediate at source resolution
    ///
    /// With `weave` the content is twice the field height, so both fields of
    /// a frame land in the same intermediate.
    #[allow(clippy::too_many_arguments)]
    pub fn render_to_offscreen(&mut self, backend: &mut dyn GraphicsBackend, planes: &[YuvPlane; MAX_PLANES], field: Field, params: &DrawParams, source_size: (u32, u32), normalized: bool, weave: bool) -> Result<(), BackendError> {
        let shader = self.yuv_shader.ok_or(BackendError::Unsupported("no YUV shader loaded"))?;
        if self.offscreen.is_none() {
            self.create_offscreen(backend, source_size)?;
        }
        let Some(offscreen) = self.offscreen.as_mut() else {
            return Err(BackendError::Unsupported("offscreen rendering"));
        };

        let luma = &planes[0];
        let mut width = luma.rect.width();
        let mut height = luma.rect.height();
        if normalized {
            width *= luma.texture_width as f32;
            height *= luma.texture_height as f32;
        }
        width *= luma.pixels_per_texel.0 as f32;
        height *= luma.pixels_per_texel.1 as f32;
        if weave {
            height *= 2.0;
        }
        offscreen.content = (width, height);

        let offscreen_params = DrawParams {
            alpha: 1.0,
            stretch: 1.0,
            blend: false,
            ..*params
        };
        let vertices = QuadVertex::strip([[0.0, 0.0], [width, 0.0], [width, height], [0.0, height]]);
        let projection = orthographic(offscreen.width as f32, offscreen.height as f32);
        let draw = yuv_draw(shader, planes, vertices, projection, &offscreen_params, field, weave)?;
        backend.draw_yuv(RenderTarget::Offscreen(offscreen.handle), &draw)
    }

    /// Scales the offscreen intermediate onto `target` with the filter shader
    pub fn render_from_offscreen(&self, backend: &mut dyn GraphicsBackend, target: RenderTarget, params: &DrawParams) -> Result<(), BackendError> {
        let Some((shader, kind)) = self.filter_shader else {
            tracing::error!("No video filter shader");
            return Err(BackendError::Unsupported("no video filter shader loaded"));
        };
        let Some(offscreen) = self.offscreen else {
            return Err(BackendError::Unsupported("no offscreen intermediate"));
        };

        let filter = match kind {
            FilterKind::Convolution { .. } => SamplerFilter::Nearest,
            _ if self.method == Some(ScalingMethod::Nearest) => SamplerFilter::Nearest,
            _ => SamplerFilter::Linear,
        };
        let (source_width, source_height) = (offscreen.width as f32, offscreen.height as f32);
        let draw = FilterDraw {
            shader,
            source: offscreen.handle,
            filter,
            source_size: (source_width, source_height),
            source_rect: Rect::new(0.0, 0.0, offscreen.content.0 / source_width, offscreen.content.1 / source_height),
            vertices: QuadVertex::strip(params.corners.map(|p| [p.x, p.y])),
            projection: orthographic(params.target_size.0, params.target_size.1),
            alpha: params.alpha,
            stretch: params.stretch,
            blend: params.blend,
        };
        backend.draw_filter(target, &draw)
    }

    /// Interleaves both fields of a frame
    ///
    /// Goes through the intermediate when the frame is scaled or the chain is in
    /// two-pass mode and offscreen rendering is available; otherwise both fields
    /// are drawn directly.
    #[allow(clippy::too_many_arguments)]
    pub fn render_weave(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        target: RenderTarget,
        top: &[YuvPlane; MAX_PLANES],
        bottom: &[YuvPlane; MAX_PLANES],
        params: &DrawParams,
        source_size: (u32, u32),
        scaled: bool,
        offscreen_rendering: bool,
        normalized: bool,
    ) -> Result<(), BackendError> {
        if offscreen_rendering && (scaled || self.quality == RenderQuality::MultiPass) {
            self.render_to_offscreen(backend, top, Field::Top, params, source_size, normalized, true)?;
            self.render_to_offscreen(backend, bottom, Field::Bottom, params, source_size, normalized, true)?;
            self.render_from_offscreen(backend, target, params)
        } else {
            self.release_unused_offscreen(backend);
            self.render_single_pass(backend, target, top, Field::Top, params, true)?;
            self.render_single_pass(backend, target, bottom, Field::Bottom, params, true)
        }
    }

    pub fn release_offscreen(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(offscreen) = self.offscreen.take() {
            backend.delete_offscreen(offscreen.handle);
        }
    }

    /// Drops an intermediate left over from a scaled weave once frames are drawn in one pass again
    pub fn release_unused_offscreen(&mut self, backend: &mut dyn GraphicsBackend) {
        if self.quality == RenderQuality::SinglePass && self.offscreen.is_some() {
            tracing::debug!("Releasing offscreen intermediate outside two-pass mode");
            self.release_offscreen(backend);
        }
    }

    /// Deletes all shaders and the intermediate
    pub fn free(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(shader) = self.yuv_shader.take() {
            backend.delete_shader(shader);
        }
        self.delete_filter_shader(backend);
        self.release_offscreen(backend);
    }

    fn delete_filter_shader(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some((shader, _)) = self.filter_shader.take() {
            backend.delete_shader(shader);
        }
    }

    fn compile_filter(&mut self, backend: &mut dyn GraphicsBackend, kind: FilterKind, output: Option<OutputStage>) -> Result<(), BackendError> {
        let shader = backend.compile_filter_shader(&FilterShaderConfig {
            kind,
            nonlinear_stretch: self.nonlinear_stretch,
            output,
        })?;
        self.filter_shader = Some((shader, kind));
        Ok(())
    }

    fn create_offscreen(&mut self, backend: &mut dyn GraphicsBackend, (width, height): (u32, u32)) -> Result<(), BackendError> {
        let handle = backend.create_offscreen(width.max(1), height.max(1))?;
        tracing::debug!("Created {width}x{height} offscreen intermediate");
        self.offscreen = Some(Offscreen {
            handle,
            width: width.max(1),
            height: height.max(1),
            content: (width as f32, height as f32),
        });
        Ok(())
    }
}

fn yuv_draw(shader: ShaderHandle, planes: &[YuvPlane; MAX_PLANES], vertices: [QuadVertex; 4], projection: [[f32; 4]; 4], params: &DrawParams, field: Field, stipple: bool) -> Result<YuvDraw, BackendError> {
    let textures = planes.map(|plane| plane.texture);
    let [Some(y), Some(u), Some(v)] = textures else {
        return Err(BackendError::Unsupported("frame has no textures"));
    };
    Ok(YuvDraw {
        shader,
        planes: [y, u, v],
        plane_rects: planes.map(|plane| plane.rect),
        texture_size: (planes[0].texture_width as f32, planes[0].texture_height as f32),
        vertices,
        projection,
        black: params.black,
        contrast: params.contrast,
        alpha: params.alpha,
        stretch: params.stretch,
        field,
        stipple,
        blend: params.blend,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        color_management::DisabledColorManager,
        format::ColorMatrix,
        geometry::rotated_corners,
        test_support::{Call, FakeBackend},
    };

    fn support(source: (u32, u32), dest: (f32, f32)) -> ScalerSupport {
        ScalerSupport {
            format: Some(PixelFormat::Yuv420P),
            source_size: source,
            dest_size: dest,
            hq_scalers_threshold: 20.0,
            enable_hq_hw_scalers: false,
            offscreen_rendering: true,
            shaders: true,
        }
    }

    fn request(method: ScalingMethod, source: (u32, u32)) -> FilterRequest {
        FilterRequest {
            method,
            nonlinear_stretch: false,
            pixel_ratio: 1.0,
            fps: 25.0,
            source_size: source,
            surface_size: (1920, 1080),
            flags: 0,
        }
    }

    fn update(chain: &mut ShaderChain, backend: &mut FakeBackend, request: &FilterRequest, support: &ScalerSupport) -> Option<SamplerFilter> {
        let mut state = ColorState::default();
        let mut manager = DisabledColorManager;
        let settings = RendererSettings::default();
        let mut color = ColorContext {
            state: &mut state,
            manager: &mut manager,
            settings: &settings,
            full_range_display: true,
        };
        chain.update_video_filter(backend, request, support, &mut color)
    }

    fn planes(width: u32, height: u32) -> [YuvPlane; MAX_PLANES] {
        [0u64, 1, 2].map(|id| YuvPlane {
            texture: Some(crate::backend::TextureHandle(id)),
            owned: true,
            texture_width: width,
            texture_height: height,
            rect: Rect::new(0.0, 0.0, 1.0, 1.0),
            ..Default::default()
        })
    }

    fn params(dest: Rect) -> DrawParams {
        DrawParams {
            black: 0.0,
            contrast: 1.0,
            alpha: 1.0,
            stretch: 1.0,
            blend: false,
            target_size: (1280.0, 720.0),
            corners: rotated_corners(dest, 0),
        }
    }

    fn template() -> YuvShaderConfig {
        YuvShaderConfig {
            format: PixelFormat::Yuv420P,
            texture_bits: 8,
            color_matrix: ColorMatrix::Bt709,
            full_range_source: false,
            unnormalized: false,
            nonlinear_stretch: false,
            limited_output: false,
            output: None,
        }
    }

    #[test]
    fn test_hq_scaler_threshold() {
        // 1920 -> 1800 is a 6% change
        let nearly = support((1920, 1080), (1800.0, 1012.5));
        assert!(!nearly.supports(ScalingMethod::Lanczos2));
        let downscale = support((1920, 1080), (1280.0, 720.0));
        assert!(downscale.supports(ScalingMethod::Lanczos2));
        assert!(!downscale.supports(ScalingMethod::Lanczos3));
        assert!(ScalerSupport { enable_hq_hw_scalers: true, ..downscale }.supports(ScalingMethod::Lanczos3));
        assert!(!ScalerSupport { offscreen_rendering: false, ..downscale }.supports(ScalingMethod::Cubic));
        assert!(!downscale.supports(ScalingMethod::Nedi));
    }

    #[test]
    fn test_nearest_unsupported_for_packed() {
        let packed = ScalerSupport {
            format: Some(PixelFormat::Yuyv422),
            ..support((720, 576), (1920.0, 1080.0))
        };
        assert!(!packed.supports(ScalingMethod::Nearest));
        assert!(packed.supports(ScalingMethod::Linear));

        let mut backend = FakeBackend::new();
        let mut chain = ShaderChain::new();
        let filter = update(&mut chain, &mut backend, &request(ScalingMethod::Nearest, (720, 576)), &packed);
        assert_eq!(filter, Some(SamplerFilter::Linear));
        assert_eq!(chain.method(), ScalingMethod::Linear);
    }

    #[test]
    fn test_lanczos3_selects_multi_pass() {
        let mut backend = FakeBackend::new();
        let mut chain = ShaderChain::new();
        let support = ScalerSupport {
            enable_hq_hw_scalers: true,
            ..support((1920, 1080), (1280.0, 720.0))
        };
        update(&mut chain, &mut backend, &request(ScalingMethod::Lanczos3, (1920, 1080)), &support);
        assert_eq!(chain.quality(), RenderQuality::MultiPass);
        assert_eq!(chain.method(), ScalingMethod::Lanczos3);
        assert_eq!(chain.offscreen_size(), Some((1920, 1080)));
        assert_eq!(backend.offscreen_sizes(), vec![(1920, 1080)]);
    }

    #[test]
    fn test_unchanged_request_is_skipped() {
        let mut backend = FakeBackend::new();
        let mut chain = ShaderChain::new();
        let support = support((1280, 720), (1280.0, 720.0));
        let request = request(ScalingMethod::Linear, (1280, 720));
        assert!(update(&mut chain, &mut backend, &request, &support).is_some());
        assert!(chain.load_shaders(&mut backend, &template(), OutputStage { dither: false, dither_depth: 8, full_range: false, lut: None }));
        assert!(update(&mut chain, &mut backend, &request, &support).is_none());
        assert!(!chain.needs_reload());

        chain.invalidate_filter();
        assert!(update(&mut chain, &mut backend, &request, &support).is_some());
        assert!(chain.needs_reload());
    }

    #[test]
    fn test_auto_picks_fast_lanczos_for_sd_upscale() {
        let mut backend = FakeBackend::new();
        let mut chain = ShaderChain::new();
        update(&mut chain, &mut backend, &request(ScalingMethod::Auto, (720, 576)), &support((720, 576), (1350.0, 1080.0)));
        assert_eq!(chain.method(), ScalingMethod::Lanczos3Fast);

        let mut chain = ShaderChain::new();
        let mut fast = request(ScalingMethod::Auto, (720, 576));
        fast.fps = 50.0;
        update(&mut chain, &mut backend, &fast, &support((720, 576), (1350.0, 1080.0)));
        assert_eq!(chain.method(), ScalingMethod::Linear);
    }

    #[test]
    fn test_offscreen_failure_falls_back() {
        let mut backend = FakeBackend::new();
        backend.fail_offscreen = true;
        let mut chain = ShaderChain::new();
        let filter = update(&mut chain, &mut backend, &request(ScalingMethod::Cubic, (1920, 1080)), &support((1920, 1080), (1280.0, 720.0)));
        assert_eq!(filter, Some(SamplerFilter::Linear));
        assert_eq!(chain.quality(), RenderQuality::SinglePass);
        assert_eq!(chain.method(), ScalingMethod::Linear);
        assert!(chain.offscreen_size().is_none());
    }

    #[test]
    fn test_non_linear_stretch_needs_pixel_ratio() {
        let mut backend = FakeBackend::new();
        let mut chain = ShaderChain::new();
        let support = support((1280, 720), (1280.0, 720.0));
        let mut stretched = request(ScalingMethod::Linear, (1280, 720));
        stretched.nonlinear_stretch = true;
        update(&mut chain, &mut backend, &stretched, &support);
        assert!(!chain.nonlinear_stretch());

        stretched.pixel_ratio = 1.33;
        update(&mut chain, &mut backend, &stretched, &support);
        assert!(chain.nonlinear_stretch());
        assert!(backend.calls().iter().any(|call| matches!(call, Call::CompileFilter(FilterKind::Stretch))));
    }

    #[test]
    fn test_output_stage_only_in_single_pass() {
        let mut backend = FakeBackend::new();
        let mut chain = ShaderChain::new();
        let output = OutputStage {
            dither: true,
            dither_depth: 6,
            full_range: false,
            lut: None,
        };
        update(&mut chain, &mut backend, &request(ScalingMethod::Cubic, (1920, 1080)), &support((1920, 1080), (1280.0, 720.0)));
        assert!(chain.load_shaders(&mut backend, &template(), output));
        assert_eq!(backend.last_yuv_config().and_then(|config| config.output), None);
        assert!(backend.last_filter_config().and_then(|config| config.output).is_some());

        // back to single pass, the conversion shader carries the output stage
        update(&mut chain, &mut backend, &request(ScalingMethod::Linear, (1920, 1080)), &support((1920, 1080), (1280.0, 720.0)));
        assert!(chain.load_shaders(&mut backend, &template(), output));
        assert_eq!(backend.last_yuv_config().and_then(|config| config.output), Some(output));
    }

    #[test]
    fn test_offscreen_content_size() {
        let mut backend = FakeBackend::new();
        let mut chain = ShaderChain::new();
        update(&mut chain, &mut backend, &request(ScalingMethod::Cubic, (1920, 1080)), &support((1920, 1080), (1280.0, 720.0)));
        chain.load_shaders(&mut backend, &template(), OutputStage { dither: false, dither_depth: 8, full_range: false, lut: None });

        let dest = Rect::from_size(1280.0, 720.0);
        chain.render_to_offscreen(&mut backend, &planes(1920, 1080), Field::Full, &params(dest), (1920, 1080), true, false).unwrap();
        chain.render_from_offscreen(&mut backend, RenderTarget::Surface, &params(dest)).unwrap();

        let filter_draw = backend.filter_draws().last().cloned().unwrap();
        assert_eq!(filter_draw.source_rect, Rect::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(filter_draw.filter, SamplerFilter::Nearest);
        let yuv_draw = backend.yuv_draws().last().cloned().unwrap();
        assert_eq!(yuv_draw.vertices[3].position, [1920.0, 1080.0]);
        assert_eq!(yuv_draw.stretch, 1.0);
    }

    #[test]
    fn test_weave_draws_two_stippled_fields() {
        let mut backend = FakeBackend::new();
        let mut chain = ShaderChain::new();
        update(&mut chain, &mut backend, &request(ScalingMethod::Linear, (1280, 720)), &support((1280, 720), (1280.0, 720.0)));
        chain.load_shaders(&mut backend, &template(), OutputStage { dither: false, dither_depth: 8, full_range: false, lut: None });

        let dest = Rect::from_size(1280.0, 720.0);
        chain
            .render_weave(&mut backend, RenderTarget::Surface, &planes(1280, 360), &planes(1280, 360), &params(dest), (1280, 720), false, true, true)
            .unwrap();
        let draws = backend.yuv_draws();
        assert_eq!(draws.len(), 2);
        assert!(draws.iter().all(|draw| draw.stipple));
        assert_eq!((draws[0].field, draws[1].field), (Field::Top, Field::Bottom));

        // scaled weave goes through the intermediate
        chain
            .render_weave(&mut backend, RenderTarget::Surface, &planes(1280, 360), &planes(1280, 360), &params(dest), (1280, 720), true, true, true)
            .unwrap();
        assert_eq!(backend.yuv_draws().len(), 4);
        assert_eq!(backend.filter_draws().len(), 1);
        assert_eq!(backend.filter_draws()[0].source_rect, Rect::new(0.0, 0.0, 1.0, 1.0));
    }

    #[test]
    fn test_single_pass_releases_weave_intermediate() {
        let mut backend = FakeBackend::new();
        let mut chain = ShaderChain::new();
        update(&mut chain, &mut backend, &request(ScalingMethod::Linear, (1280, 720)), &support((1280, 720), (1920.0, 1080.0)));
        chain.load_shaders(&mut backend, &template(), OutputStage { dither: false, dither_depth: 8, full_range: false, lut: None });

        let dest = Rect::from_size(1920.0, 1080.0);
        chain
            .render_weave(&mut backend, RenderTarget::Surface, &planes(1280, 360), &planes(1280, 360), &params(dest), (1280, 720), true, true, true)
            .unwrap();
        assert_eq!(chain.quality(), RenderQuality::SinglePass);
        assert_eq!(backend.offscreen_sizes(), vec![(1280, 720)]);

        chain.release_unused_offscreen(&mut backend);
        assert!(chain.offscreen_size().is_none());
        assert!(backend.offscreen_sizes().is_empty());

        // an unscaled weave draws directly and leaves nothing behind
        chain
            .render_weave(&mut backend, RenderTarget::Surface, &planes(1280, 360), &planes(1280, 360), &params(dest), (1280, 720), true, true, true)
            .unwrap();
        chain
            .render_weave(&mut backend, RenderTarget::Surface, &planes(1280, 360), &planes(1280, 360), &params(dest), (1280, 720), false, true, true)
            .unwrap();
        assert!(backend.offscreen_sizes().is_empty());
    }

    #[test]
    fn test_multi_pass_keeps_intermediate() {
        let mut backend = FakeBackend::new();
        let mut chain = ShaderChain::new();
        update(&mut chain, &mut backend, &request(ScalingMethod::Cubic, (1920, 1080)), &support((1920, 1080), (1280.0, 720.0)));
        assert_eq!(chain.quality(), RenderQuality::MultiPass);
        chain.release_unused_offscreen(&mut backend);
        assert_eq!(chain.offscreen_size(), Some((1920, 1080)));
    }
}
