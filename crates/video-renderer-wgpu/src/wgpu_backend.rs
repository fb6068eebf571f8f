//! wgpu implementation of the graphics backend
//!
//! Programs are WGSL modules specialized by prepending a block of constants
//! derived from their configuration. Render pipelines are created lazily per
//! program, target format and blend mode. All draws are recorded into one
//! pending command encoder that is submitted on [`GraphicsBackend::flush`].
//!
//! The embedder owns the surface: it hands the current surface texture view to
//! [`WgpuBackend::set_surface_texture`] before rendering and presents it afterwards.

use crate::{
    backend::{
        BackendCapabilities, ConvolutionKernel, FilterDraw, FilterKind, FilterShaderConfig, GraphicsBackend, LutHandle, OffscreenHandle, OutputStage, QuadVertex, RenderTarget,
        SamplerFilter, ShaderHandle, TextureDescriptor, TextureHandle, TextureUpload, TransferBufferHandle, UploadSource, YuvDraw, YuvShaderConfig,
    },
    error::BackendError,
    format::{Field, PlaneLayout, PixelFormat, TexelFormat},
    geometry::{Rect, orthographic},
};
use std::collections::HashMap;
use wgpu::util::DeviceExt;

/// Format of the offscreen intermediate
const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
/// Format of the still-frame capture target, read back as BGRA
const CAPTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Bgra8Unorm;

const OUTPUT_SHADER: &str = include_str!("shaders/output.wgsl");
const YUV_SHADER: &str = include_str!("shaders/yuv_to_rgb.wgsl");
const FILTER_SHADER: &str = include_str!("shaders/video_filter.wgsl");
const SOLID_SHADER: &str = include_str!("shaders/solid.wgsl");

/// Uniform block of the YUV conversion program
#[derive(Debug, Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct YuvUniforms {
    projection: [[f32; 4]; 4],
    conversion: [[f32; 4]; 4],
    plane_rects: [[f32; 4]; 3],
    texture_size: [f32; 2],
    alpha: f32,
    stretch: f32,
    sample_scale: f32,
    field: u32,
    stipple: u32,
    padding: f32,
}

/// Uniform block of the filter program
#[derive(Debug, Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct FilterUniforms {
    projection: [[f32; 4]; 4],
    source_rect: [f32; 4],
    source_size: [f32; 2],
    alpha: f32,
    stretch: f32,
}

/// Uniform block of the solid fill program
#[derive(Debug, Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct SolidUniforms {
    projection: [[f32; 4]; 4],
    color: [f32; 4],
}

impl QuadVertex {
    const ATTRIBUTES: &[wgpu::VertexAttribute] = &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];

    const LAYOUT: wgpu::VertexBufferLayout<'static> = wgpu::VertexBufferLayout {
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: Self::ATTRIBUTES,
        array_stride: std::mem::size_of::<Self>() as wgpu::BufferAddress,
    };
}

const SOLID_VERTEX_LAYOUT: wgpu::VertexBufferLayout<'static> = wgpu::VertexBufferLayout {
    step_mode: wgpu::VertexStepMode::Vertex,
    attributes: &wgpu::vertex_attr_array![0 => Float32x2],
    array_stride: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
};

fn rect_array(rect: Rect) -> [f32; 4] {
    [rect.x1, rect.y1, rect.x2, rect.y2]
}

fn texel_format(format: TexelFormat) -> wgpu::TextureFormat {
    match format {
        TexelFormat::R8 => wgpu::TextureFormat::R8Unorm,
        TexelFormat::Rg8 => wgpu::TextureFormat::Rg8Unorm,
        TexelFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TexelFormat::R16 => wgpu::TextureFormat::R16Unorm,
    }
}

fn output_constants(output: Option<OutputStage>) -> String {
    let output = output.unwrap_or(OutputStage {
        dither: false,
        dither_depth: 8,
        full_range: false,
        lut: None,
    });
    let lut_size = output.lut.map_or(1, |lut| lut.size.max(2));
    format!(
        "const USE_LUT: bool = {};\nconst LUT_SIZE: f32 = {:.1};\nconst FULL_RANGE: bool = {};\nconst DITHER: bool = {};\nconst DITHER_DEPTH: f32 = {:.1};\n",
        output.lut.is_some(),
        lut_size as f32,
        output.full_range,
        output.dither,
        output.dither_depth as f32,
    )
}

/// WGSL source of the YUV conversion program for `config`
pub(crate) fn yuv_shader_source(config: &YuvShaderConfig) -> String {
    let layout = match config.format.layout() {
        PlaneLayout::Planar420 => 0,
        PlaneLayout::SemiPlanar420 => 1,
        PlaneLayout::Packed422 => 2,
    };
    format!(
        "const LAYOUT: u32 = {layout}u;\nconst UYVY: bool = {};\nconst UNNORMALIZED: bool = {};\nconst NONLINEAR_STRETCH: bool = {};\nconst OUTPUT: bool = {};\n{}\n{OUTPUT_SHADER}\n{YUV_SHADER}",
        config.format == PixelFormat::Uyvy422,
        config.unnormalized,
        config.nonlinear_stretch,
        config.output.is_some(),
        output_constants(config.output),
    )
}

/// WGSL source of the filter program for `config`
pub(crate) fn filter_shader_source(config: &FilterShaderConfig) -> String {
    let (convolution, kernel, radius) = match config.kind {
        FilterKind::Convolution { kernel, fast } => {
            let index = match kernel {
                ConvolutionKernel::Cubic => 0,
                ConvolutionKernel::Lanczos2 => 1,
                ConvolutionKernel::Lanczos3 => 2,
                ConvolutionKernel::Spline36 => 3,
            };
            (true, index, if fast { 2 } else { kernel.radius() })
        }
        FilterKind::Default | FilterKind::Stretch => (false, 0, 1),
    };
    let stretch = config.nonlinear_stretch || config.kind == FilterKind::Stretch;
    format!(
        "const CONVOLUTION: bool = {convolution};\nconst KERNEL: u32 = {kernel}u;\nconst RADIUS: i32 = {radius};\nconst NONLINEAR_STRETCH: bool = {stretch};\nconst OUTPUT: bool = {};\n{}\n{OUTPUT_SHADER}\n{FILTER_SHADER}",
        config.output.is_some(),
        output_constants(config.output),
    )
}

#[derive(Debug)]
struct PlaneTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    filter: SamplerFilter,
}

#[derive(Debug)]
struct TransferBuffer {
    buffer: wgpu::Buffer,
    mapped: bool,
}

#[derive(Debug)]
struct RenderTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Copy)]
enum ProgramKind {
    Yuv(YuvShaderConfig),
    Filter(FilterShaderConfig),
}

#[derive(Debug)]
struct ShaderProgram {
    module: wgpu::ShaderModule,
    kind: ProgramKind,
    /// Pipelines by target format and blending
    pipelines: HashMap<(wgpu::TextureFormat, bool), wgpu::RenderPipeline>,
}

/// A [`GraphicsBackend`] drawing with wgpu
#[derive(Debug)]
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: BackendCapabilities,
    surface_format: wgpu::TextureFormat,
    surface_size: (u32, u32),
    surface_view: Option<wgpu::TextureView>,
    viewport: Rect,
    encoder: Option<wgpu::CommandEncoder>,
    next_id: u64,
    textures: HashMap<u64, PlaneTexture>,
    transfer_buffers: HashMap<u64, TransferBuffer>,
    offscreens: HashMap<u64, RenderTexture>,
    luts: HashMap<u64, wgpu::TextureView>,
    shaders: HashMap<u64, ShaderProgram>,
    capture: Option<RenderTexture>,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    dummy_lut: wgpu::TextureView,
    yuv_bind_group_layout: wgpu::BindGroupLayout,
    yuv_pipeline_layout: wgpu::PipelineLayout,
    filter_bind_group_layout: wgpu::BindGroupLayout,
    filter_pipeline_layout: wgpu::PipelineLayout,
    solid_bind_group_layout: wgpu::BindGroupLayout,
    solid_pipeline_layout: wgpu::PipelineLayout,
    solid_module: wgpu::ShaderModule,
    solid_pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

fn texture_entry(binding: u32, view_dimension: wgpu::TextureViewDimension) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn create_sampler(device: &wgpu::Device, filter: wgpu::FilterMode) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(&format!("Plane sampler {filter:?}")),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

fn create_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    vertex_layout: wgpu::VertexBufferLayout<'_>,
    topology: wgpu::PrimitiveTopology,
    format: wgpu::TextureFormat,
    blend: bool,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        cache: None,
        vertex: wgpu::VertexState {
            module,
            buffers: &[vertex_layout],
            compilation_options: Default::default(),
            entry_point: None,
        },
        fragment: Some(wgpu::FragmentState {
            module,
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(if blend { wgpu::BlendState::ALPHA_BLENDING } else { wgpu::BlendState::REPLACE }),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
            entry_point: None,
        }),
        primitive: wgpu::PrimitiveState {
            topology,
            strip_index_format: None,
            // rotation and flips change the winding
            cull_mode: None,
            front_face: wgpu::FrontFace::Ccw,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: false,
            unclipped_depth: false,
        },
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
        depth_stencil: None,
    })
}

impl WgpuBackend {
    /// Creates a backend drawing with `device`
    ///
    /// # Arguments
    /// * `adapter` - Adapter the device was requested from, for the vendor name
    /// * `device` - Device for resource creation
    /// * `queue` - Queue of `device`
    /// * `surface_format` - Format of the surface textures; sRGB formats are drawn through their linear view
    /// * `surface_size` - Initial surface size in pixels
    pub fn new(adapter: &wgpu::Adapter, device: wgpu::Device, queue: wgpu::Queue, surface_format: wgpu::TextureFormat, surface_size: (u32, u32)) -> Self {
        let info = adapter.get_info();
        let capabilities = BackendCapabilities {
            vendor: info.name.clone(),
            npot_textures: true,
            rectangle_textures: false,
            transfer_buffers: true,
            offscreen_rendering: true,
            shaders: true,
            sixteen_bit_textures: device.features().contains(wgpu::Features::TEXTURE_FORMAT_16BIT_NORM),
            transfer_row_alignment: wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize,
            transfer_offset: 0,
            limited_color_range: false,
        };
        tracing::info!("Using {} ({:?}), 16-bit textures: {}", info.name, info.backend, capabilities.sixteen_bit_textures);

        let yuv_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("YUV bind group layout"),
            entries: &[
                uniform_entry(0),
                texture_entry(1, wgpu::TextureViewDimension::D2),
                texture_entry(2, wgpu::TextureViewDimension::D2),
                texture_entry(3, wgpu::TextureViewDimension::D2),
                sampler_entry(4),
                texture_entry(5, wgpu::TextureViewDimension::D3),
                sampler_entry(6),
            ],
        });
        let yuv_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("YUV pipeline layout"),
            bind_group_layouts: &[&yuv_bind_group_layout],
            push_constant_ranges: &[],
        });

        let filter_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Video filter bind group layout"),
            entries: &[
                uniform_entry(0),
                texture_entry(1, wgpu::TextureViewDimension::D2),
                sampler_entry(2),
                texture_entry(3, wgpu::TextureViewDimension::D3),
                sampler_entry(4),
            ],
        });
        let filter_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Video filter pipeline layout"),
            bind_group_layouts: &[&filter_bind_group_layout],
            push_constant_ranges: &[],
        });

        let solid_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Solid bind group layout"),
            entries: &[uniform_entry(0)],
        });
        let solid_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Solid pipeline layout"),
            bind_group_layouts: &[&solid_bind_group_layout],
            push_constant_ranges: &[],
        });
        let solid_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Solid shader"),
            source: wgpu::ShaderSource::Wgsl(SOLID_SHADER.into()),
        });

        // bound whenever no lookup table is loaded
        let dummy_lut = device
            .create_texture_with_data(
                &queue,
                &wgpu::TextureDescriptor {
                    label: Some("Dummy 3D LUT"),
                    size: wgpu::Extent3d {
                        width: 1,
                        height: 1,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D3,
                    format: wgpu::TextureFormat::Rgba16Float,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                },
                wgpu::util::TextureDataOrder::LayerMajor,
                bytemuck::cast_slice(&[half::f16::ZERO; 4]),
            )
            .create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            linear_sampler: create_sampler(&device, wgpu::FilterMode::Linear),
            nearest_sampler: create_sampler(&device, wgpu::FilterMode::Nearest),
            device,
            queue,
            capabilities,
            surface_format: surface_format.remove_srgb_suffix(),
            surface_size,
            surface_view: None,
            viewport: Rect::from_size(surface_size.0 as f32, surface_size.1 as f32),
            encoder: None,
            next_id: 1,
            textures: HashMap::new(),
            transfer_buffers: HashMap::new(),
            offscreens: HashMap::new(),
            luts: HashMap::new(),
            shaders: HashMap::new(),
            capture: None,
            dummy_lut,
            yuv_bind_group_layout,
            yuv_pipeline_layout,
            filter_bind_group_layout,
            filter_pipeline_layout,
            solid_bind_group_layout,
            solid_pipeline_layout,
            solid_module,
            solid_pipelines: HashMap::new(),
        }
    }

    /// Sets the view of the surface texture drawn to by the next frame
    ///
    /// The view must use the linear variant of the surface format.
    pub fn set_surface_texture(&mut self, view: wgpu::TextureView) {
        self.surface_view = Some(view);
    }

    /// Drops the surface texture view, typically right before presenting
    pub fn take_surface_texture(&mut self) -> Option<wgpu::TextureView> {
        self.surface_view.take()
    }

    /// Updates the surface size and resets the viewport to cover it
    pub fn resize(&mut self, width: u32, height: u32) {
        self.surface_size = (width, height);
        self.viewport = Rect::from_size(width as f32, height as f32);
    }

    /// Format pipelines drawing to the surface are created with
    pub fn surface_format(&self) -> wgpu::TextureFormat {
        self.surface_format
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Video renderer encoder") }))
    }

    fn wait_idle(&self) -> Result<(), BackendError> {
        self.device.poll(wgpu::PollType::Wait)?;
        Ok(())
    }

    fn sampler(&self, filter: SamplerFilter) -> &wgpu::Sampler {
        match filter {
            SamplerFilter::Nearest => &self.nearest_sampler,
            SamplerFilter::Linear => &self.linear_sampler,
        }
    }

    /// View, format, size and scissor rectangle of a render target
    fn target(&self, target: RenderTarget) -> Result<(wgpu::TextureView, wgpu::TextureFormat, (u32, u32), Option<[u32; 4]>), BackendError> {
        let clip = |(width, height): (u32, u32)| {
            let x1 = self.viewport.x1.clamp(0.0, width as f32) as u32;
            let y1 = self.viewport.y1.clamp(0.0, height as f32) as u32;
            let x2 = self.viewport.x2.clamp(0.0, width as f32) as u32;
            let y2 = self.viewport.y2.clamp(0.0, height as f32) as u32;
            [x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1)]
        };
        match target {
            RenderTarget::Surface => {
                let view = self.surface_view.clone().ok_or(BackendError::Unsupported("no surface texture set"))?;
                Ok((view, self.surface_format, self.surface_size, Some(clip(self.surface_size))))
            }
            RenderTarget::Offscreen(handle) => {
                let offscreen = self.offscreens.get(&handle.0).ok_or(BackendError::UnknownHandle { kind: "offscreen", id: handle.0 })?;
                Ok((offscreen.view.clone(), OFFSCREEN_FORMAT, (offscreen.width, offscreen.height), None))
            }
            RenderTarget::Capture => {
                let capture = self.capture.as_ref().ok_or(BackendError::Unsupported("no capture in progress"))?;
                let size = (capture.width, capture.height);
                Ok((capture.view.clone(), CAPTURE_FORMAT, size, Some(clip(size))))
            }
        }
    }

    fn program_pipeline(&mut self, shader: ShaderHandle, format: wgpu::TextureFormat, blend: bool) -> Result<(wgpu::RenderPipeline, ProgramKind), BackendError> {
        let program = self.shaders.get_mut(&shader.0).ok_or(BackendError::UnknownHandle { kind: "shader", id: shader.0 })?;
        let kind = program.kind;
        if let Some(pipeline) = program.pipelines.get(&(format, blend)) {
            return Ok((pipeline.clone(), kind));
        }

        let (label, layout) = match kind {
            ProgramKind::Yuv(_) => ("YUV to RGB pipeline", &self.yuv_pipeline_layout),
            ProgramKind::Filter(_) => ("Video filter pipeline", &self.filter_pipeline_layout),
        };
        tracing::debug!("Creating {label} for {format:?}, blend {blend}");
        let pipeline = create_pipeline(&self.device, label, layout, &program.module, QuadVertex::LAYOUT, wgpu::PrimitiveTopology::TriangleStrip, format, blend);
        program.pipelines.insert((format, blend), pipeline.clone());
        Ok((pipeline, kind))
    }

    fn compile(&mut self, label: &str, source: String, kind: ProgramKind) -> Result<ShaderHandle, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::ShaderCompilation(error.to_string()));
        }

        let id = self.allocate_id();
        self.shaders.insert(
            id,
            ShaderProgram {
                module,
                kind,
                pipelines: HashMap::new(),
            },
        );
        Ok(ShaderHandle(id))
    }

    fn lut_view(&self, output: Option<OutputStage>) -> &wgpu::TextureView {
        output.and_then(|output| output.lut).and_then(|lut| self.luts.get(&lut.handle.0)).unwrap_or(&self.dummy_lut)
    }

    /// Records one quad into its own render pass on `target`
    fn draw_quad(&mut self, label: &str, target: RenderTarget, pipeline: &wgpu::RenderPipeline, bind_group: &wgpu::BindGroup, vertices: &wgpu::Buffer, vertex_count: u32) -> Result<(), BackendError> {
        let (view, _, _, scissor) = self.target(target)?;
        if scissor.is_some_and(|[_, _, width, height]| width == 0 || height == 0) {
            return Ok(());
        }

        let encoder = self.encoder();
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            ..Default::default()
        });
        if let Some([x, y, width, height]) = scissor {
            pass.set_scissor_rect(x, y, width, height);
        }
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.set_vertex_buffer(0, vertices.slice(..));
        pass.draw(0..vertex_count, 0..1);
        Ok(())
    }

    /// Maps a buffer and waits for the mapping to complete
    fn map_buffer(&mut self, buffer: &wgpu::Buffer, mode: wgpu::MapMode) -> Result<(), BackendError> {
        // pending copies may still read from the buffer
        GraphicsBackend::flush(self);

        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        buffer.slice(..).map_async(mode, move |result| {
            let _ = sender.send(result);
        });
        self.wait_idle()?;
        pollster::block_on(receiver.receive()).ok_or(BackendError::Unsupported("buffer mapping was cancelled"))??;
        Ok(())
    }
}

impl GraphicsBackend for WgpuBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities.clone()
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    fn viewport(&self) -> Rect {
        self.viewport
    }

    fn set_viewport(&mut self, viewport: Rect) {
        self.viewport = viewport;
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<TextureHandle, BackendError> {
        let format = texel_format(descriptor.format);
        if descriptor.format == TexelFormat::R16 && !self.capabilities.sixteen_bit_textures {
            return Err(BackendError::Unsupported("16-bit normalized textures"));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Plane texture"),
            size: wgpu::Extent3d {
                width: descriptor.width,
                height: descriptor.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let id = self.allocate_id();
        self.textures.insert(
            id,
            PlaneTexture {
                texture,
                view,
                filter: descriptor.filter,
            },
        );
        Ok(TextureHandle(id))
    }

    fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)> {
        self.textures.get(&texture.0).map(|plane| (plane.texture.width(), plane.texture.height()))
    }

    fn set_texture_filter(&mut self, texture: TextureHandle, filter: SamplerFilter) {
        if let Some(plane) = self.textures.get_mut(&texture.0) {
            plane.filter = filter;
        }
    }

    fn upload_texture(&mut self, texture: TextureHandle, upload: &TextureUpload<'_>) -> Result<(), BackendError> {
        let target = self.textures.get(&texture.0).ok_or(BackendError::UnknownHandle { kind: "texture", id: texture.0 })?.texture.clone();
        let destination = wgpu::TexelCopyTextureInfo {
            texture: &target,
            mip_level: 0,
            origin: wgpu::Origin3d { x: upload.x, y: upload.y, z: 0 },
            aspect: wgpu::TextureAspect::All,
        };
        let layout = wgpu::TexelCopyBufferLayout {
            offset: upload.offset as u64,
            bytes_per_row: Some(upload.row_pitch as u32),
            rows_per_image: Some(upload.height),
        };
        let extent = wgpu::Extent3d {
            width: upload.width,
            height: upload.height,
            depth_or_array_layers: 1,
        };

        match upload.source {
            UploadSource::Host(data) => self.queue.write_texture(destination, data, layout, extent),
            UploadSource::Transfer(buffer) => {
                let source = self
                    .transfer_buffers
                    .get(&buffer.0)
                    .ok_or(BackendError::UnknownHandle { kind: "transfer buffer", id: buffer.0 })?
                    .buffer
                    .clone();
                self.encoder().copy_buffer_to_texture(wgpu::TexelCopyBufferInfo { buffer: &source, layout }, destination, extent);
            }
        }
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if let Some(plane) = self.textures.remove(&texture.0) {
            plane.texture.destroy();
        }
    }

    fn create_transfer_buffer(&mut self, size: usize) -> Result<TransferBufferHandle, BackendError> {
        let size = (size as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Transfer buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        });
        let id = self.allocate_id();
        self.transfer_buffers.insert(id, TransferBuffer { buffer, mapped: true });
        Ok(TransferBufferHandle(id))
    }

    fn map_transfer_buffer(&mut self, buffer: TransferBufferHandle) -> Result<(), BackendError> {
        let entry = self.transfer_buffers.get(&buffer.0).ok_or(BackendError::UnknownHandle { kind: "transfer buffer", id: buffer.0 })?;
        if entry.mapped {
            return Ok(());
        }
        let handle = entry.buffer.clone();
        self.map_buffer(&handle, wgpu::MapMode::Write).map_err(|e| {
            tracing::warn!("Mapping transfer buffer {} failed: {e}", buffer.0);
            BackendError::MapFailed(buffer.0)
        })?;
        if let Some(entry) = self.transfer_buffers.get_mut(&buffer.0) {
            entry.mapped = true;
        }
        Ok(())
    }

    fn unmap_transfer_buffer(&mut self, buffer: TransferBufferHandle) {
        match self.transfer_buffers.get_mut(&buffer.0) {
            Some(entry) if entry.mapped => {
                entry.buffer.unmap();
                entry.mapped = false;
            }
            _ => {}
        }
    }

    fn write_transfer_buffer(&mut self, buffer: TransferBufferHandle, offset: usize, len: usize, write: &mut dyn FnMut(&mut [u8])) -> Result<(), BackendError> {
        let entry = self.transfer_buffers.get(&buffer.0).ok_or(BackendError::UnknownHandle { kind: "transfer buffer", id: buffer.0 })?;
        if !entry.mapped {
            return Err(BackendError::MapFailed(buffer.0));
        }

        // mapped ranges start on MAP_ALIGNMENT and span whole words
        let start = offset as u64 / wgpu::MAP_ALIGNMENT * wgpu::MAP_ALIGNMENT;
        let end = ((offset + len) as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT).min(entry.buffer.size());
        let mut view = entry.buffer.slice(start..end).get_mapped_range_mut();
        let begin = (offset as u64 - start) as usize;
        let data = view.get_mut(begin..begin + len).ok_or(BackendError::MapFailed(buffer.0))?;
        write(data);
        Ok(())
    }

    fn delete_transfer_buffer(&mut self, buffer: TransferBufferHandle) {
        if let Some(entry) = self.transfer_buffers.remove(&buffer.0) {
            entry.buffer.destroy();
        }
    }

    fn create_offscreen(&mut self, width: u32, height: u32) -> Result<OffscreenHandle, BackendError> {
        let limit = self.device.limits().max_texture_dimension_2d;
        if width > limit || height > limit {
            return Err(BackendError::Allocation {
                what: "offscreen target",
                reason: format!("{width}x{height} exceeds the texture size limit {limit}"),
            });
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen intermediate"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.allocate_id();
        self.offscreens.insert(id, RenderTexture { texture, view, width, height });
        Ok(OffscreenHandle(id))
    }

    fn delete_offscreen(&mut self, offscreen: OffscreenHandle) {
        if let Some(target) = self.offscreens.remove(&offscreen.0) {
            target.texture.destroy();
        }
    }

    fn create_lut(&mut self, size: u32, data: &[u16]) -> Result<LutHandle, BackendError> {
        let expected = (size as usize).pow(3) * 3;
        if size == 0 || data.len() < expected {
            return Err(BackendError::Allocation {
                what: "3D LUT",
                reason: format!("{} values for a {size}^3 table", data.len()),
            });
        }
        let texels: Vec<half::f16> = data[..expected]
            .chunks_exact(3)
            .flat_map(|rgb| [rgb[0], rgb[1], rgb[2], u16::MAX].map(|value| half::f16::from_f32(value as f32 / 65535.0)))
            .collect();

        let view = self
            .device
            .create_texture_with_data(
                &self.queue,
                &wgpu::TextureDescriptor {
                    label: Some("3D LUT"),
                    size: wgpu::Extent3d {
                        width: size,
                        height: size,
                        depth_or_array_layers: size,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D3,
                    format: wgpu::TextureFormat::Rgba16Float,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                },
                wgpu::util::TextureDataOrder::LayerMajor,
                bytemuck::cast_slice(&texels),
            )
            .create_view(&wgpu::TextureViewDescriptor::default());

        let id = self.allocate_id();
        self.luts.insert(id, view);
        Ok(LutHandle(id))
    }

    fn delete_lut(&mut self, lut: LutHandle) {
        self.luts.remove(&lut.0);
    }

    fn compile_yuv_shader(&mut self, config: &YuvShaderConfig) -> Result<ShaderHandle, BackendError> {
        tracing::debug!("Compiling YUV to RGB program {config:?}");
        self.compile("YUV to RGB shader", yuv_shader_source(config), ProgramKind::Yuv(*config))
    }

    fn compile_filter_shader(&mut self, config: &FilterShaderConfig) -> Result<ShaderHandle, BackendError> {
        tracing::debug!("Compiling video filter program {config:?}");
        self.compile("Video filter shader", filter_shader_source(config), ProgramKind::Filter(*config))
    }

    fn delete_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(&shader.0);
    }

    fn clear(&mut self, target: RenderTarget, color: [f32; 4]) -> Result<(), BackendError> {
        let (view, _, _, _) = self.target(target)?;
        let [r, g, b, a] = color.map(f64::from);
        let encoder = self.encoder();
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Clear pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            ..Default::default()
        });
        Ok(())
    }

    fn fill_rects(&mut self, target: RenderTarget, rects: &[Rect], color: [f32; 4]) -> Result<(), BackendError> {
        if rects.is_empty() {
            return Ok(());
        }
        let (_, format, (width, height), _) = self.target(target)?;

        let pipeline = match self.solid_pipelines.get(&format) {
            Some(pipeline) => pipeline.clone(),
            None => {
                let pipeline = create_pipeline(
                    &self.device,
                    "Solid pipeline",
                    &self.solid_pipeline_layout,
                    &self.solid_module,
                    SOLID_VERTEX_LAYOUT,
                    wgpu::PrimitiveTopology::TriangleList,
                    format,
                    false,
                );
                self.solid_pipelines.insert(format, pipeline.clone());
                pipeline
            }
        };

        let vertices: Vec<[f32; 2]> = rects
            .iter()
            .flat_map(|rect| [[rect.x1, rect.y1], [rect.x2, rect.y1], [rect.x1, rect.y2], [rect.x1, rect.y2], [rect.x2, rect.y1], [rect.x2, rect.y2]])
            .collect();
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Solid vertices"),
            usage: wgpu::BufferUsages::VERTEX,
            contents: bytemuck::cast_slice(&vertices),
        });
        let uniforms = SolidUniforms {
            projection: orthographic(width as f32, height as f32),
            color,
        };
        let uniform_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Solid uniforms"),
            usage: wgpu::BufferUsages::UNIFORM,
            contents: bytemuck::bytes_of(&uniforms),
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Solid bind group"),
            layout: &self.solid_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        self.draw_quad("Black bars pass", target, &pipeline, &bind_group, &vertex_buffer, vertices.len() as u32)
    }

    fn draw_yuv(&mut self, target: RenderTarget, draw: &YuvDraw) -> Result<(), BackendError> {
        let (_, format, _, _) = self.target(target)?;
        let (pipeline, kind) = self.program_pipeline(draw.shader, format, draw.blend)?;
        let ProgramKind::Yuv(config) = kind else {
            return Err(BackendError::Unsupported("draw_yuv with a filter program"));
        };

        let planes = draw
            .planes
            .iter()
            .map(|handle| self.textures.get(&handle.0).ok_or(BackendError::UnknownHandle { kind: "texture", id: handle.0 }))
            .collect::<Result<Vec<_>, _>>()?;

        let uniforms = YuvUniforms {
            projection: draw.projection,
            conversion: config.conversion_matrix(draw.black, draw.contrast),
            plane_rects: draw.plane_rects.map(rect_array),
            texture_size: [draw.texture_size.0, draw.texture_size.1],
            alpha: draw.alpha,
            stretch: draw.stretch,
            sample_scale: config.sample_scale(),
            field: match draw.field {
                Field::Full => 0,
                Field::Top => 1,
                Field::Bottom => 2,
            },
            stipple: u32::from(draw.stipple),
            padding: 0.0,
        };
        let uniform_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("YUV uniforms"),
            usage: wgpu::BufferUsages::UNIFORM,
            contents: bytemuck::bytes_of(&uniforms),
        });
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("YUV vertices"),
            usage: wgpu::BufferUsages::VERTEX,
            contents: bytemuck::cast_slice(&draw.vertices),
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("YUV bind group"),
            layout: &self.yuv_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&planes[0].view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&planes[1].view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&planes[2].view),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(self.sampler(planes[0].filter)),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::TextureView(self.lut_view(config.output)),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: wgpu::BindingResource::Sampler(&self.linear_sampler),
                },
            ],
        });

        self.draw_quad("YUV to RGB pass", target, &pipeline, &bind_group, &vertex_buffer, 4)
    }

    fn draw_filter(&mut self, target: RenderTarget, draw: &FilterDraw) -> Result<(), BackendError> {
        let (_, format, _, _) = self.target(target)?;
        let (pipeline, kind) = self.program_pipeline(draw.shader, format, draw.blend)?;
        let ProgramKind::Filter(config) = kind else {
            return Err(BackendError::Unsupported("draw_filter with a YUV program"));
        };
        let source = self.offscreens.get(&draw.source.0).ok_or(BackendError::UnknownHandle { kind: "offscreen", id: draw.source.0 })?;

        let uniforms = FilterUniforms {
            projection: draw.projection,
            source_rect: rect_array(draw.source_rect),
            source_size: [draw.source_size.0, draw.source_size.1],
            alpha: draw.alpha,
            stretch: draw.stretch,
        };
        let uniform_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Video filter uniforms"),
            usage: wgpu::BufferUsages::UNIFORM,
            contents: bytemuck::bytes_of(&uniforms),
        });
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Video filter vertices"),
            usage: wgpu::BufferUsages::VERTEX,
            contents: bytemuck::cast_slice(&draw.vertices),
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Video filter bind group"),
            layout: &self.filter_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&source.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(self.sampler(draw.filter)),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(self.lut_view(config.output)),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(&self.linear_sampler),
                },
            ],
        });

        self.draw_quad("Video filter pass", target, &pipeline, &bind_group, &vertex_buffer, 4)
    }

    fn begin_capture(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Capture target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: CAPTURE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.capture = Some(RenderTexture { texture, view, width, height });
        self.clear(RenderTarget::Capture, [0.0, 0.0, 0.0, 1.0])
    }

    fn end_capture(&mut self) -> Result<Vec<u8>, BackendError> {
        let capture = self.capture.take().ok_or(BackendError::Unsupported("no capture in progress"))?;
        let row_bytes = capture.width * 4;
        let padded_row_bytes = row_bytes.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Capture readback buffer"),
            size: padded_row_bytes as u64 * capture.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.encoder().copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &capture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes),
                    rows_per_image: Some(capture.height),
                },
            },
            wgpu::Extent3d {
                width: capture.width,
                height: capture.height,
                depth_or_array_layers: 1,
            },
        );

        self.map_buffer(&buffer, wgpu::MapMode::Read)?;
        let pixels = {
            let data = buffer.slice(..).get_mapped_range();
            data.chunks_exact(padded_row_bytes as usize).flat_map(|row| &row[..row_bytes as usize]).copied().collect()
        };
        buffer.unmap();
        capture.texture.destroy();
        Ok(pixels)
    }

    fn finish(&mut self) {
        self.flush();
        if let Err(e) = self.wait_idle() {
            tracing::warn!("Waiting for the GPU failed: {e}");
        }
    }

    fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }
}
