//! Recording fakes for the backend, decoder buffers and color manager

use crate::{
    backend::{
        BackendCapabilities, FilterDraw, FilterKind, FilterShaderConfig, GraphicsBackend, LutHandle, OffscreenHandle, RenderTarget, SamplerFilter, ShaderHandle, TextureDescriptor,
        TextureHandle, TextureUpload, TransferBufferHandle, UploadSource, YuvDraw, YuvShaderConfig,
    },
    color_management::ColorManager,
    error::BackendError,
    format::{MAX_PLANES, PixelFormat, PlaneLayout},
    geometry::Rect,
    video_buffer::VideoBuffer,
};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};

/// A recorded backend call
#[derive(Debug, Clone)]
pub(crate) enum Call {
    CreateTexture(TextureDescriptor),
    DeleteTexture(TextureHandle),
    Upload(TextureHandle),
    CompileYuv(YuvShaderConfig),
    CompileFilter(FilterKind),
    CreateOffscreen(u32, u32),
    Clear(RenderTarget),
    FillRects(RenderTarget, Vec<Rect>),
    DrawYuv(RenderTarget, YuvDraw),
    DrawFilter(RenderTarget, FilterDraw),
    Finish,
    Flush,
}

#[derive(Debug)]
struct FakeTexture {
    width: u32,
    height: u32,
    bytes_per_texel: usize,
    data: Vec<u8>,
}

#[derive(Debug)]
struct FakeTransferBuffer {
    data: Vec<u8>,
    mapped: bool,
}

/// In-memory backend that stores texture contents and records every call
#[derive(Debug)]
pub(crate) struct FakeBackend {
    pub capabilities: BackendCapabilities,
    pub surface: (u32, u32),
    pub viewport: Rect,
    /// Allocate textures with power-of-two sizes
    pub pad_to_power_of_two: bool,
    /// Transfer buffers cannot be created or mapped
    pub fail_transfer_map: bool,
    /// Transfer buffer creation fails once this many have been created
    pub fail_transfer_buffer_after: Option<usize>,
    pub fail_offscreen: bool,
    next_id: u64,
    transfer_buffers_created: usize,
    textures: BTreeMap<u64, FakeTexture>,
    transfer_buffers: BTreeMap<u64, FakeTransferBuffer>,
    offscreens: BTreeMap<u64, (u32, u32)>,
    luts: BTreeMap<u64, u32>,
    capture: Option<(u32, u32)>,
    last_yuv_config: Option<YuvShaderConfig>,
    last_filter_config: Option<FilterShaderConfig>,
    calls: Vec<Call>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            capabilities: BackendCapabilities {
                vendor: "Fake GPU".to_string(),
                npot_textures: true,
                rectangle_textures: false,
                transfer_buffers: false,
                offscreen_rendering: true,
                shaders: true,
                sixteen_bit_textures: true,
                transfer_row_alignment: 256,
                transfer_offset: 16,
                limited_color_range: false,
            },
            surface: (1280, 720),
            viewport: Rect::from_size(1280.0, 720.0),
            pad_to_power_of_two: false,
            fail_transfer_map: false,
            fail_transfer_buffer_after: None,
            fail_offscreen: false,
            next_id: 1,
            transfer_buffers_created: 0,
            textures: BTreeMap::new(),
            transfer_buffers: BTreeMap::new(),
            offscreens: BTreeMap::new(),
            luts: BTreeMap::new(),
            capture: None,
            last_yuv_config: None,
            last_filter_config: None,
            calls: Vec::new(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_luts(&self) -> usize {
        self.luts.len()
    }

    pub fn upload_count(&self) -> usize {
        self.calls.iter().filter(|call| matches!(call, Call::Upload(_))).count()
    }

    pub fn yuv_compile_count(&self) -> usize {
        self.calls.iter().filter(|call| matches!(call, Call::CompileYuv(_))).count()
    }

    /// Texel bytes of a live texture, rows packed at its allocated width
    pub fn texture_data(&self, texture: TextureHandle) -> &[u8] {
        &self.textures[&texture.0].data
    }

    /// Sizes of the live transfer buffers in creation order
    pub fn transfer_buffer_sizes(&self) -> Vec<usize> {
        self.transfer_buffers.values().map(|buffer| buffer.data.len()).collect()
    }

    pub fn transfer_buffer_data(&self, buffer: TransferBufferHandle) -> &[u8] {
        &self.transfer_buffers[&buffer.0].data
    }

    /// Sizes of the live offscreen targets
    pub fn offscreen_sizes(&self) -> Vec<(u32, u32)> {
        self.offscreens.values().copied().collect()
    }

    pub fn last_yuv_config(&self) -> Option<YuvShaderConfig> {
        self.last_yuv_config
    }

    pub fn last_filter_config(&self) -> Option<FilterShaderConfig> {
        self.last_filter_config
    }

    pub fn yuv_draws(&self) -> Vec<YuvDraw> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::DrawYuv(_, draw) => Some(draw.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn filter_draws(&self) -> Vec<FilterDraw> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::DrawFilter(_, draw) => Some(draw.clone()),
                _ => None,
            })
            .collect()
    }

    /// All rectangles filled so far
    pub fn filled_rects(&self) -> Vec<Rect> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::FillRects(_, rects) => Some(rects.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl GraphicsBackend for FakeBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities.clone()
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface
    }

    fn viewport(&self) -> Rect {
        self.viewport
    }

    fn set_viewport(&mut self, viewport: Rect) {
        self.viewport = viewport;
    }

    fn create_texture(&mut self, descriptor: &TextureDescriptor) -> Result<TextureHandle, BackendError> {
        let (width, height) = if self.pad_to_power_of_two {
            (descriptor.width.next_power_of_two(), descriptor.height.next_power_of_two())
        } else {
            (descriptor.width, descriptor.height)
        };
        let bytes_per_texel = descriptor.format.bytes_per_texel();
        let id = self.allocate_id();
        self.textures.insert(
            id,
            FakeTexture {
                width,
                height,
                bytes_per_texel,
                data: vec![0; width as usize * height as usize * bytes_per_texel],
            },
        );
        self.calls.push(Call::CreateTexture(*descriptor));
        Ok(TextureHandle(id))
    }

    fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)> {
        self.textures.get(&texture.0).map(|texture| (texture.width, texture.height))
    }

    fn set_texture_filter(&mut self, _texture: TextureHandle, _filter: SamplerFilter) {}

    fn upload_texture(&mut self, texture: TextureHandle, upload: &TextureUpload<'_>) -> Result<(), BackendError> {
        let source: &[u8] = match upload.source {
            UploadSource::Host(data) => data,
            UploadSource::Transfer(buffer) => &self
                .transfer_buffers
                .get(&buffer.0)
                .ok_or(BackendError::UnknownHandle { kind: "transfer buffer", id: buffer.0 })?
                .data,
        };
        let target = self.textures.get_mut(&texture.0).ok_or(BackendError::UnknownHandle { kind: "texture", id: texture.0 })?;

        let row_bytes = upload.width as usize * target.bytes_per_texel;
        for row in 0..upload.height as usize {
            let src_start = upload.offset + row * upload.row_pitch;
            let dst_start = ((upload.y as usize + row) * target.width as usize + upload.x as usize) * target.bytes_per_texel;
            let (Some(src), Some(dst)) = (source.get(src_start..src_start + row_bytes), target.data.get_mut(dst_start..dst_start + row_bytes)) else {
                break;
            };
            dst.copy_from_slice(src);
        }

        self.calls.push(Call::Upload(texture));
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
        self.calls.push(Call::DeleteTexture(texture));
    }

    fn create_transfer_buffer(&mut self, size: usize) -> Result<TransferBufferHandle, BackendError> {
        let id = self.allocate_id();
        if self.fail_transfer_map {
            return Err(BackendError::MapFailed(id));
        }
        if self.fail_transfer_buffer_after.is_some_and(|limit| self.transfer_buffers_created >= limit) {
            return Err(BackendError::Allocation {
                what: "transfer buffer",
                reason: "limit reached".to_string(),
            });
        }
        self.transfer_buffers_created += 1;
        self.transfer_buffers.insert(id, FakeTransferBuffer { data: vec![0; size], mapped: true });
        Ok(TransferBufferHandle(id))
    }

    fn map_transfer_buffer(&mut self, buffer: TransferBufferHandle) -> Result<(), BackendError> {
        if self.fail_transfer_map {
            return Err(BackendError::MapFailed(buffer.0));
        }
        let target = self.transfer_buffers.get_mut(&buffer.0).ok_or(BackendError::UnknownHandle { kind: "transfer buffer", id: buffer.0 })?;
        target.mapped = true;
        Ok(())
    }

    fn unmap_transfer_buffer(&mut self, buffer: TransferBufferHandle) {
        if let Some(target) = self.transfer_buffers.get_mut(&buffer.0) {
            target.mapped = false;
        }
    }

    fn write_transfer_buffer(&mut self, buffer: TransferBufferHandle, offset: usize, len: usize, write: &mut dyn FnMut(&mut [u8])) -> Result<(), BackendError> {
        let target = self.transfer_buffers.get_mut(&buffer.0).ok_or(BackendError::UnknownHandle { kind: "transfer buffer", id: buffer.0 })?;
        if !target.mapped {
            return Err(BackendError::MapFailed(buffer.0));
        }
        let data = target.data.get_mut(offset..offset + len).ok_or(BackendError::MapFailed(buffer.0))?;
        write(data);
        Ok(())
    }

    fn delete_transfer_buffer(&mut self, buffer: TransferBufferHandle) {
        self.transfer_buffers.remove(&buffer.0);
    }

    fn create_offscreen(&mut self, width: u32, height: u32) -> Result<OffscreenHandle, BackendError> {
        if self.fail_offscreen {
            return Err(BackendError::Allocation {
                what: "offscreen target",
                reason: "disabled".to_string(),
            });
        }
        let id = self.allocate_id();
        self.offscreens.insert(id, (width, height));
        self.calls.push(Call::CreateOffscreen(width, height));
        Ok(OffscreenHandle(id))
    }

    fn delete_offscreen(&mut self, offscreen: OffscreenHandle) {
        self.offscreens.remove(&offscreen.0);
    }

    fn create_lut(&mut self, size: u32, _data: &[u16]) -> Result<LutHandle, BackendError> {
        let id = self.allocate_id();
        self.luts.insert(id, size);
        Ok(LutHandle(id))
    }

    fn delete_lut(&mut self, lut: LutHandle) {
        self.luts.remove(&lut.0);
    }

    fn compile_yuv_shader(&mut self, config: &YuvShaderConfig) -> Result<ShaderHandle, BackendError> {
        self.last_yuv_config = Some(*config);
        self.calls.push(Call::CompileYuv(*config));
        Ok(ShaderHandle(self.allocate_id()))
    }

    fn compile_filter_shader(&mut self, config: &FilterShaderConfig) -> Result<ShaderHandle, BackendError> {
        self.last_filter_config = Some(*config);
        self.calls.push(Call::CompileFilter(config.kind));
        Ok(ShaderHandle(self.allocate_id()))
    }

    fn delete_shader(&mut self, _shader: ShaderHandle) {}

    fn clear(&mut self, target: RenderTarget, _color: [f32; 4]) -> Result<(), BackendError> {
        self.calls.push(Call::Clear(target));
        Ok(())
    }

    fn fill_rects(&mut self, target: RenderTarget, rects: &[Rect], _color: [f32; 4]) -> Result<(), BackendError> {
        self.calls.push(Call::FillRects(target, rects.to_vec()));
        Ok(())
    }

    fn draw_yuv(&mut self, target: RenderTarget, draw: &YuvDraw) -> Result<(), BackendError> {
        self.calls.push(Call::DrawYuv(target, draw.clone()));
        Ok(())
    }

    fn draw_filter(&mut self, target: RenderTarget, draw: &FilterDraw) -> Result<(), BackendError> {
        self.calls.push(Call::DrawFilter(target, draw.clone()));
        Ok(())
    }

    fn begin_capture(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        self.capture = Some((width, height));
        Ok(())
    }

    fn end_capture(&mut self) -> Result<Vec<u8>, BackendError> {
        let (width, height) = self.capture.take().ok_or(BackendError::Unsupported("no capture in progress"))?;
        Ok(vec![0; width as usize * height as usize * 4])
    }

    fn finish(&mut self) {
        self.calls.push(Call::Finish);
    }

    fn flush(&mut self) {
        self.calls.push(Call::Flush);
    }
}

/// Decoder buffer holding generated pixels
#[derive(Debug)]
pub(crate) struct FakeVideoBuffer {
    format: PixelFormat,
    planes: [Vec<u8>; MAX_PLANES],
    strides: [usize; MAX_PLANES],
    refs: AtomicUsize,
}

impl FakeVideoBuffer {
    /// Uniform picture; high bit depth samples are stored as 16-bit little-endian values
    pub fn solid(format: PixelFormat, width: u32, height: u32, yuv: [u8; 3]) -> Self {
        Self::filled(format, width, height, yuv.map(u16::from))
    }

    /// Uniform high bit depth planar picture
    pub fn solid_16(format: PixelFormat, width: u32, height: u32, yuv: [u16; 3]) -> Self {
        Self::filled(format, width, height, yuv)
    }

    /// Neutral chroma with each luma row set to the matching value of `rows`
    pub fn luma_rows(format: PixelFormat, width: u32, height: u32, rows: &[u8]) -> Self {
        let mut buffer = Self::filled(format, width, height, [0, 128, 128]);
        let bytes_per_sample = format.bytes_per_sample();
        let stride = buffer.strides[0];
        for (row, &value) in rows.iter().enumerate().take(height as usize) {
            let line = &mut buffer.planes[0][row * stride..(row + 1) * stride];
            for sample in line.chunks_exact_mut(bytes_per_sample) {
                sample.copy_from_slice(&u16::from(value).to_le_bytes()[..bytes_per_sample]);
            }
        }
        buffer
    }

    fn filled(format: PixelFormat, width: u32, height: u32, yuv: [u16; 3]) -> Self {
        let (w, h) = (width as usize, height as usize);
        let bytes_per_sample = format.bytes_per_sample();
        let sample = |value: u16| u16::to_le_bytes(value)[..bytes_per_sample].to_vec();
        let plane = |value: u16, samples: usize| sample(value).repeat(samples);

        let (planes, strides) = match format.layout() {
            PlaneLayout::Planar420 => (
                [plane(yuv[0], w * h), plane(yuv[1], (w / 2) * (h / 2)), plane(yuv[2], (w / 2) * (h / 2))],
                [w * bytes_per_sample, (w / 2) * bytes_per_sample, (w / 2) * bytes_per_sample],
            ),
            PlaneLayout::SemiPlanar420 => {
                let chroma = [yuv[1] as u8, yuv[2] as u8].repeat((w / 2) * (h / 2));
                ([plane(yuv[0], w * h), chroma, Vec::new()], [w, w, 0])
            }
            PlaneLayout::Packed422 => {
                let [y, u, v] = yuv.map(|value| value as u8);
                let pair = if format == PixelFormat::Uyvy422 { [u, y, v, y] } else { [y, u, y, v] };
                ([pair.repeat((w / 2) * h), Vec::new(), Vec::new()], [w * 2, 0, 0])
            }
        };

        Self {
            format,
            planes,
            strides,
            refs: AtomicUsize::new(0),
        }
    }

    /// Decoder references currently held
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

impl VideoBuffer for FakeVideoBuffer {
    fn format(&self) -> PixelFormat {
        self.format
    }

    fn planes(&self) -> [&[u8]; MAX_PLANES] {
        [&self.planes[0], &self.planes[1], &self.planes[2]]
    }

    fn strides(&self) -> [usize; MAX_PLANES] {
        self.strides
    }

    fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Color manager producing an identity lookup table
#[derive(Debug)]
pub(crate) struct FakeColorManager {
    pub size: u32,
    /// Token of the current calibration
    pub token: i32,
    pub fail_load: bool,
    pub enabled: bool,
}

impl FakeColorManager {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            token: 1,
            fail_load: false,
            enabled: true,
        }
    }
}

impl ColorManager for FakeColorManager {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn check_configuration(&self, token: i32, _flags: u32) -> bool {
        token == self.token
    }

    fn lut_size(&self) -> Option<u32> {
        Some(self.size)
    }

    fn load_video_3d_lut(&mut self, _flags: u32, token: &mut i32, size: u32) -> Option<Vec<u16>> {
        if self.fail_load {
            return None;
        }
        *token = self.token;
        let scale = |i: u32| (i * 65535 / (size - 1).max(1)) as u16;
        let mut data = Vec::with_capacity(size.pow(3) as usize * 3);
        for b in 0..size {
            for g in 0..size {
                for r in 0..size {
                    data.extend_from_slice(&[scale(r), scale(g), scale(b)]);
                }
            }
        }
        Some(data)
    }
}
