//! Render area geometry
//!
//! Coordinates are in pixels with the origin at the top-left corner and y growing
//! downwards, for both the surface and offscreen targets.

/// Axis-aligned rectangle given by its corners
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Rect {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Rectangle anchored at the origin
    pub fn from_size(width: f32, height: f32) -> Self {
        Self::new(0.0, 0.0, width, height)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// User view adjustments applied when fitting the video into the view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewParams {
    /// Display aspect ratio of the source frame
    pub source_aspect: f32,
    /// Clockwise rotation in degrees (0, 90, 180 or 270)
    pub orientation: u32,
    /// Zoom factor, 1.0 fits the view
    pub zoom: f32,
    /// Aspect ratio of one display pixel
    pub pixel_ratio: f32,
    /// Vertical offset as a fraction of half the view height
    pub vertical_shift: f32,
}

impl Default for ViewParams {
    fn default() -> Self {
        Self {
            source_aspect: 1.0,
            orientation: 0,
            zoom: 1.0,
            pixel_ratio: 1.0,
            vertical_shift: 0.0,
        }
    }
}

/// Source, destination and view rectangles of the current frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewGeometry {
    /// Region of the source frame to display
    pub source: Rect,
    /// Region of the view covered by the video
    pub dest: Rect,
    /// Whole drawable area
    pub view: Rect,
    /// Destination corners for the texture's top-left, top-right, bottom-right and bottom-left
    pub corners: [Point; 4],
}

impl ViewGeometry {
    /// Fits the source into the view and rotates the destination corners
    pub fn new(source_width: u32, source_height: u32, view: Rect, params: &ViewParams) -> Self {
        let dest = fit_destination(view, params);
        Self {
            source: Rect::from_size(source_width as f32, source_height as f32),
            dest,
            view,
            corners: rotated_corners(dest, params.orientation),
        }
    }

    /// Replaces the destination rectangle and recomputes the corners
    pub fn with_dest(&self, dest: Rect, orientation: u32) -> Self {
        Self {
            dest,
            corners: rotated_corners(dest, orientation),
            ..*self
        }
    }
}

/// Display aspect ratio of a frame, 1.0 when the display size is unknown
pub fn frame_aspect_ratio(display_width: u32, display_height: u32) -> f32 {
    if display_width == 0 || display_height == 0 {
        return 1.0;
    }
    display_width as f32 / display_height as f32
}

/// Calculates the destination rectangle that keeps the source aspect ratio
///
/// The video is fitted to the view width or height, whichever is limiting, then
/// zoomed around the view center and shifted vertically.
pub fn fit_destination(view: Rect, params: &ViewParams) -> Rect {
    let pixel_ratio = if params.pixel_ratio > 0.0 { params.pixel_ratio } else { 1.0 };
    let mut aspect = params.source_aspect / pixel_ratio;
    if params.orientation % 180 == 90 {
        aspect = 1.0 / aspect;
    }

    let (mut width, mut height) = if aspect > view.width() / view.height() {
        // Video is wider than the view, fit to width
        (view.width(), view.width() / aspect)
    } else {
        // Video is taller than the view, fit to height
        (view.height() * aspect, view.height())
    };
    width *= params.zoom;
    height *= params.zoom;

    let x = view.x1 + (view.width() - width) * 0.5;
    let y = view.y1 + (view.height() - height) * 0.5 + params.vertical_shift * view.height() * 0.5;

    Rect::new(x, y, x + width, y + height)
}

/// Destination corners in texture-corner order for a clockwise rotation
pub fn rotated_corners(dest: Rect, orientation: u32) -> [Point; 4] {
    let base = [
        Point { x: dest.x1, y: dest.y1 },
        Point { x: dest.x2, y: dest.y1 },
        Point { x: dest.x2, y: dest.y2 },
        Point { x: dest.x1, y: dest.y2 },
    ];
    let steps = ((orientation / 90) % 4) as usize;
    [0, 1, 2, 3].map(|i: usize| base[(i + steps) % 4])
}

/// Orthographic projection mapping pixel coordinates onto clip space, y pointing down
///
/// The matrix is column-major, matching the WGSL `mat4x4` layout.
pub fn orthographic(width: f32, height: f32) -> [[f32; 4]; 4] {
    [
        [2.0 / width, 0.0, 0.0, 0.0],
        [0.0, -2.0 / height, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [-1.0, 1.0, 0.0, 1.0],
    ]
}

/// Rectangles of the view not covered by the video quad
///
/// # Arguments
/// * `corners` - Rotated destination corners
/// * `width` - View width
/// * `height` - View height
///
/// # Returns
/// Up to four rectangles (top, bottom, left, right)
pub fn black_bars(corners: &[Point; 4], width: f32, height: f32) -> Vec<Rect> {
    let left = corners.iter().map(|p| p.x).fold(f32::INFINITY, f32::min);
    let right = corners.iter().map(|p| p.x).fold(f32::NEG_INFINITY, f32::max);
    let top = corners.iter().map(|p| p.y).fold(f32::INFINITY, f32::min);
    let bottom = corners.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max);

    let mut bars = Vec::with_capacity(4);
    if top > 0.0 {
        bars.push(Rect::new(0.0, 0.0, width, top));
    }
    if bottom < height {
        bars.push(Rect::new(0.0, bottom, width, height));
    }
    if left > 0.0 {
        bars.push(Rect::new(0.0, top, left, bottom));
    }
    if right < width {
        bars.push(Rect::new(right, top, width, bottom));
    }
    bars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_params(aspect: f32) -> ViewParams {
        ViewParams {
            source_aspect: aspect,
            ..Default::default()
        }
    }

    fn assert_rect_near(actual: Rect, expected: Rect) {
        let close = |a: f32, b: f32| (a - b).abs() < 1e-2;
        if !(close(actual.x1, expected.x1) && close(actual.y1, expected.y1) && close(actual.x2, expected.x2) && close(actual.y2, expected.y2)) {
            panic!("Rectangle mismatch: expected {expected:?}, got {actual:?}");
        }
    }

    #[test]
    fn test_fit_letterbox() {
        let dest = fit_destination(Rect::from_size(1920.0, 1080.0), &view_params(4.0 / 3.0));
        assert_rect_near(dest, Rect::new(240.0, 0.0, 1680.0, 1080.0));
    }

    #[test]
    fn test_fit_quarter_turn_swaps_aspect() {
        let params = ViewParams {
            source_aspect: 16.0 / 9.0,
            orientation: 90,
            ..Default::default()
        };
        let dest = fit_destination(Rect::from_size(1920.0, 1080.0), &params);
        assert_rect_near(dest, Rect::new(656.25, 0.0, 1263.75, 1080.0));
    }

    #[test]
    fn test_fit_same_aspect() {
        let dest = fit_destination(Rect::from_size(1280.0, 720.0), &view_params(16.0 / 9.0));
        assert!((dest.width() - 1280.0).abs() < 1e-3);
        assert!((dest.height() - 720.0).abs() < 1e-3);
    }

    #[test]
    fn test_rotated_corners() {
        let dest = Rect::new(10.0, 20.0, 110.0, 70.0);
        let upright = rotated_corners(dest, 0);
        assert_eq!(upright[0], Point { x: 10.0, y: 20.0 });
        assert_eq!(upright[2], Point { x: 110.0, y: 70.0 });

        // Texture top-left lands on the destination top-right after a quarter turn
        let quarter = rotated_corners(dest, 90);
        assert_eq!(quarter[0], Point { x: 110.0, y: 20.0 });
        assert_eq!(quarter[3], Point { x: 10.0, y: 20.0 });
    }

    #[test]
    fn test_black_bars_pillarbox() {
        let corners = rotated_corners(Rect::new(240.0, 0.0, 1680.0, 1080.0), 0);
        let bars = black_bars(&corners, 1920.0, 1080.0);
        assert_eq!(bars, vec![Rect::new(0.0, 0.0, 240.0, 1080.0), Rect::new(1680.0, 0.0, 1920.0, 1080.0)]);
    }

    #[test]
    fn test_black_bars_full_cover() {
        let corners = rotated_corners(Rect::from_size(640.0, 480.0), 0);
        assert!(black_bars(&corners, 640.0, 480.0).is_empty());
    }

    #[test]
    fn test_orthographic_corners() {
        let m = orthographic(200.0, 100.0);
        let project = |x: f32, y: f32| (m[0][0] * x + m[3][0], m[1][1] * y + m[3][1]);
        let (left, top) = project(0.0, 0.0);
        let (right, bottom) = project(200.0, 100.0);
        assert!((left + 1.0).abs() < 1e-6 && (top - 1.0).abs() < 1e-6);
        assert!((right - 1.0).abs() < 1e-6 && (bottom + 1.0).abs() < 1e-6);
    }
}
