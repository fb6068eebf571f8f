//! Headless frame capture
//!
//! Renders a synthetic color bar frame through the full pipeline into an offscreen
//! capture and writes it as a PNG. Useful for checking scalers, field handling and
//! color conversion without a window.
//!
//! # Usage
//! ```bash
//! cargo run --example capture -- bars.png --width 1920 --height 1080 --scaling lanczos3
//! ```

use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use video_renderer_wgpu::{DisabledColorManager, MemorySettings, PixelFormat, Renderer, ScalingMethod, VideoBuffer, VideoPicture, VideoSettings, WgpuBackend};

/// Command-line arguments for the capture tool
#[derive(Parser)]
#[command(version, about = "Renders a synthetic video frame to a PNG")]
struct Args {
    /// Output image file path
    output: PathBuf,

    /// Capture width
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Capture height
    #[arg(long, default_value = "720")]
    height: u32,

    /// Source frame width
    #[arg(long, default_value = "720")]
    source_width: u32,

    /// Source frame height
    #[arg(long, default_value = "576")]
    source_height: u32,

    /// Source pixel format (yuv420p, nv12, yuyv422, uyvy422)
    #[arg(long, short, default_value = "yuv420p")]
    format: String,

    /// Scaling method (nearest, linear, cubic, lanczos2, lanczos3fast, lanczos3, spline36fast, spline36, auto)
    #[arg(long, short, default_value = "linear")]
    scaling: String,

    /// Optional JSON file with renderer settings
    #[arg(long)]
    settings: Option<PathBuf>,
}

/// Studio-range YUV of the 75% color bars
const BARS: [[u8; 3]; 8] = [
    [180, 128, 128],
    [162, 44, 142],
    [131, 156, 44],
    [112, 72, 58],
    [84, 184, 198],
    [65, 100, 212],
    [35, 212, 114],
    [16, 128, 128],
];

/// Frame held in host memory
struct SyntheticFrame {
    format: PixelFormat,
    planes: [Vec<u8>; 3],
    strides: [usize; 3],
}

impl SyntheticFrame {
    fn color_bars(format: PixelFormat, width: u32, height: u32) -> Self {
        let (width, height) = (width as usize, height as usize);
        let bar = |x: usize| BARS[x * BARS.len() / width];
        let (chroma_width, chroma_height) = (width.div_ceil(2), height.div_ceil(2));

        match format {
            PixelFormat::Nv12 => {
                let luma = (0..height).flat_map(|_| (0..width).map(|x| bar(x)[0])).collect();
                let chroma = (0..chroma_height).flat_map(|_| (0..chroma_width).flat_map(|x| [bar(x * 2)[1], bar(x * 2)[2]])).collect();
                Self {
                    format,
                    planes: [luma, chroma, Vec::new()],
                    strides: [width, chroma_width * 2, 0],
                }
            }
            PixelFormat::Yuyv422 | PixelFormat::Uyvy422 => {
                let packed = (0..height)
                    .flat_map(|_| {
                        (0..chroma_width).flat_map(move |x| {
                            let [y0, u, v] = bar(x * 2);
                            let y1 = bar((x * 2 + 1).min(width - 1))[0];
                            if format == PixelFormat::Yuyv422 { [y0, u, y1, v] } else { [u, y0, v, y1] }
                        })
                    })
                    .collect();
                Self {
                    format,
                    planes: [packed, Vec::new(), Vec::new()],
                    strides: [chroma_width * 4, 0, 0],
                }
            }
            _ => {
                let luma = (0..height).flat_map(|_| (0..width).map(|x| bar(x)[0])).collect();
                let u = (0..chroma_height).flat_map(|_| (0..chroma_width).map(|x| bar(x * 2)[1])).collect();
                let v = (0..chroma_height).flat_map(|_| (0..chroma_width).map(|x| bar(x * 2)[2])).collect();
                Self {
                    format: PixelFormat::Yuv420P,
                    planes: [luma, u, v],
                    strides: [width, chroma_width, chroma_width],
                }
            }
        }
    }
}

impl VideoBuffer for SyntheticFrame {
    fn format(&self) -> PixelFormat {
        self.format
    }

    fn planes(&self) -> [&[u8]; 3] {
        [&self.planes[0], &self.planes[1], &self.planes[2]]
    }

    fn strides(&self) -> [usize; 3] {
        self.strides
    }

    fn acquire(&self) {}

    fn release(&self) {}
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let format = match args.format.to_lowercase().as_str() {
        "yuv420p" => PixelFormat::Yuv420P,
        "nv12" => PixelFormat::Nv12,
        "yuyv422" => PixelFormat::Yuyv422,
        "uyvy422" => PixelFormat::Uyvy422,
        _ => {
            eprintln!("Invalid format '{}'. Valid formats: yuv420p, nv12, yuyv422, uyvy422", args.format);
            std::process::exit(1);
        }
    };
    let scaling: ScalingMethod = serde_json::from_value(serde_json::Value::String(args.scaling.to_lowercase()))?;
    let settings = match &args.settings {
        Some(path) => MemorySettings::from_json(&std::fs::read_to_string(path)?)?,
        None => MemorySettings::default(),
    };

    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::PRIMARY,
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))?;

    // 16-bit planes are optional, the renderer falls back to 8-bit textures
    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: None,
        required_features: adapter.features() & wgpu::Features::TEXTURE_FORMAT_16BIT_NORM,
        required_limits: wgpu::Limits::default(),
        memory_hints: wgpu::MemoryHints::default(),
        trace: Default::default(),
    }))?;

    let backend = WgpuBackend::new(&adapter, device, queue, wgpu::TextureFormat::Bgra8Unorm, (args.width, args.height));
    let mut renderer = Renderer::new(backend, &settings, Box::new(DisabledColorManager));
    renderer.set_video_settings(VideoSettings {
        scaling_method: scaling,
        ..Default::default()
    });

    let frame = Arc::new(SyntheticFrame::color_bars(format, args.source_width, args.source_height));
    let picture = VideoPicture::new(frame, args.source_width, args.source_height);
    renderer.configure(&picture, 25.0, 0, 0)?;
    renderer.add_video_picture(&picture, 0)?;
    renderer.update();
    println!("Rendering {} with {}", format.name(), renderer.scaling_method().name());

    let capture = renderer.render_capture(args.width, args.height)?;
    let rgba: Vec<u8> = capture.pixels.chunks_exact(4).flat_map(|bgra| [bgra[2], bgra[1], bgra[0], 255]).collect();
    let image = image::RgbaImage::from_raw(capture.width, capture.height, rgba).ok_or("capture has an unexpected size")?;
    image.save(&args.output)?;
    println!("Saved {}x{} capture to {}", capture.width, capture.height, args.output.display());

    Ok(())
}
