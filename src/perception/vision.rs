//! Image-processing primitives used by the lane follower.
//!
//! Everything here works on plain `image` buffers: 8-bit grayscale for the
//! edge pipeline, RGB for overlays. Border pixels are handled by clamping
//! coordinates into the image.

use image::{GrayImage, Luma, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub const EDGE: u8 = 255;

/// Finest distance resolution `hough_segments` accepts, in pixels.
pub const MIN_HOUGH_RHO: f64 = 0.1;
/// Finest angle resolution `hough_segments` accepts, in degrees.
pub const MIN_HOUGH_THETA_DEG: f64 = 0.01;

/// Line segment in pixel coordinates, endpoints inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Segment {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Direction angle in radians, `atan2(y2 - y1, x2 - x1)`.
    pub fn angle(&self) -> f64 {
        f64::from(self.y2 - self.y1).atan2(f64::from(self.x2 - self.x1))
    }

    pub fn offset_y(self, dy: i32) -> Self {
        Self {
            y1: self.y1 + dy,
            y2: self.y2 + dy,
            ..self
        }
    }
}

/// Parameters for `hough_segments`.
#[derive(Clone, Copy, Debug)]
pub struct HoughParams {
    /// Distance resolution in pixels.
    pub rho: f64,
    /// Angle resolution in radians.
    pub theta: f64,
    /// Minimum accumulator votes before a line is traced.
    pub threshold: u32,
    pub min_line_length: u32,
    pub max_line_gap: u32,
    /// Seed for the order in which edge points are visited.
    pub seed: u64,
}

pub fn grayscale(image: &RgbImage) -> GrayImage {
    image::imageops::grayscale(image)
}

/// Gaussian blur with an odd `kernel_size`; sigma follows the usual
/// `0.3 * ((k - 1) / 2 - 1) + 0.8` rule.
pub fn gaussian_blur(image: &GrayImage, kernel_size: u32) -> GrayImage {
    let size = kernel_size.max(1) | 1;
    if size == 1 {
        return image.clone();
    }
    let kernel = gaussian_kernel(size);
    let radius = (size / 2) as i64;
    let (width, height) = image.dimensions();

    let mut horizontal = vec![0f32; (width * height) as usize];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = clamp(i64::from(x) + k as i64 - radius, width);
                acc += weight * f32::from(image.get_pixel(sx, y)[0]);
            }
            horizontal[(y * width + x) as usize] = acc;
        }
    }

    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = clamp(i64::from(y) + k as i64 - radius, height);
                acc += weight * horizontal[(sy * width + x) as usize];
            }
            out.put_pixel(x, y, Luma([acc.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

fn gaussian_kernel(size: u32) -> Vec<f32> {
    let sigma = 0.3 * ((f64::from(size) - 1.0) * 0.5 - 1.0) + 0.8;
    let radius = f64::from(size / 2);
    let raw: Vec<f64> = (0..size)
        .map(|i| {
            let d = f64::from(i) - radius;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|w| (w / sum) as f32).collect()
}

fn clamp(v: i64, len: u32) -> u32 {
    v.clamp(0, i64::from(len) - 1) as u32
}

/// Canny edge detection with 3x3 Sobel gradients and L1 magnitude.
///
/// Returns an image where edge pixels are `EDGE` and everything else is 0.
pub fn canny(image: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut out = GrayImage::new(width, height);
    if width < 3 || height < 3 {
        return out;
    }
    let (low, high) = if low > high { (high, low) } else { (low, high) };
    let w = width as usize;
    let h = height as usize;

    let px = |x: i64, y: i64| -> i32 { i32::from(image.get_pixel(clamp(x, width), clamp(y, height))[0]) };
    let mut gx = vec![0i32; w * h];
    let mut gy = vec![0i32; w * h];
    let mut mag = vec![0i32; w * h];
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let dx = (px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2 * px(x - 1, y) + px(x - 1, y + 1));
            let dy = (px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2 * px(x, y - 1) + px(x + 1, y - 1));
            let i = y as usize * w + x as usize;
            gx[i] = dx;
            gy[i] = dy;
            mag[i] = dx.abs() + dy.abs();
        }
    }

    // Non-maximum suppression along the quantised gradient direction.
    const TAN_22_5: f64 = 0.414_213_562_373_095;
    const TAN_67_5: f64 = 2.414_213_562_373_095;
    let at = |x: usize, y: usize| mag[y * w + x];
    let mut strong = Vec::new();
    let mut class = vec![0u8; w * h]; // 0 none, 1 weak, 2 strong
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * w + x;
            let m = mag[i];
            if (m as f32) <= low {
                continue;
            }
            let ax = f64::from(gx[i].abs());
            let ay = f64::from(gy[i].abs());
            let (a, b) = if ay <= ax * TAN_22_5 {
                (at(x - 1, y), at(x + 1, y))
            } else if ay >= ax * TAN_67_5 {
                (at(x, y - 1), at(x, y + 1))
            } else if (gx[i] < 0) != (gy[i] < 0) {
                (at(x - 1, y + 1), at(x + 1, y - 1))
            } else {
                (at(x - 1, y - 1), at(x + 1, y + 1))
            };
            if m > a && m >= b {
                if (m as f32) > high {
                    class[i] = 2;
                    strong.push(i);
                } else {
                    class[i] = 1;
                }
            }
        }
    }

    // Hysteresis: keep weak pixels 8-connected to a strong one.
    let buf: &mut [u8] = &mut out;
    while let Some(i) = strong.pop() {
        if buf[i] == EDGE {
            continue;
        }
        buf[i] = EDGE;
        let (x, y) = ((i % w) as i64, (i / w) as i64);
        for ny in y - 1..=y + 1 {
            for nx in x - 1..=x + 1 {
                if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if class[j] != 0 && buf[j] != EDGE {
                    strong.push(j);
                }
            }
        }
    }
    out
}

/// Progressive probabilistic Hough transform.
///
/// Edge points are visited in a seeded random order. Each point votes in the
/// (rho, theta) accumulator; once a bin reaches `threshold`, the line through
/// it is traced in both directions, tolerating up to `max_line_gap` missing
/// pixels. Points on an accepted segment withdraw their votes and are not
/// visited again.
///
/// Resolutions finer than `MIN_HOUGH_RHO` / `MIN_HOUGH_THETA_DEG` yield no
/// segments; the accumulator would not fit in memory.
///
/// Endpoints come back ordered left to right (top to bottom for vertical
/// segments), so `Segment::angle` stays within `[-pi/2, pi/2]`.
pub fn hough_segments(edges: &GrayImage, params: &HoughParams) -> Vec<Segment> {
    const SHIFT: u32 = 16;
    let (width, height) = edges.dimensions();
    let w = width as i64;
    let h = height as i64;
    if width == 0
        || height == 0
        || !(params.rho >= MIN_HOUGH_RHO)
        || !(params.theta >= MIN_HOUGH_THETA_DEG.to_radians())
    {
        return Vec::new();
    }

    let num_angle = (std::f64::consts::PI / params.theta).round().max(1.0) as usize;
    let num_rho = (((w + h) * 2 + 1) as f64 / params.rho).round() as usize;
    let rho_offset = ((num_rho - 1) / 2) as i64;
    let trig: Vec<(f64, f64)> = (0..num_angle)
        .map(|n| {
            let angle = n as f64 * params.theta;
            (angle.cos() / params.rho, angle.sin() / params.rho)
        })
        .collect();
    let rho_index = |x: i64, y: i64, n: usize| -> usize {
        let (c, s) = trig[n];
        ((x as f64 * c + y as f64 * s).round() as i64 + rho_offset) as usize
    };

    let mut accum = vec![0i32; num_angle * num_rho];
    let mut mask = vec![false; (w * h) as usize];
    let mut points = Vec::new();
    for (x, y, p) in edges.enumerate_pixels() {
        if p[0] != 0 {
            mask[(i64::from(y) * w + i64::from(x)) as usize] = true;
            points.push((i64::from(x), i64::from(y)));
        }
    }
    let mut rng = StdRng::seed_from_u64(params.seed);
    points.shuffle(&mut rng);

    let threshold = params.threshold as i32;
    let min_len = i64::from(params.min_line_length);
    let max_gap = i64::from(params.max_line_gap);
    let mut segments = Vec::new();

    for &(px, py) in &points {
        if !mask[(py * w + px) as usize] {
            continue;
        }

        let mut max_val = threshold - 1;
        let mut max_n = 0;
        for n in 0..num_angle {
            let cell = &mut accum[n * num_rho + rho_index(px, py, n)];
            *cell += 1;
            if *cell > max_val {
                max_val = *cell;
                max_n = n;
            }
        }
        if max_val < threshold {
            continue;
        }

        // Walk along the line perpendicular to the winning normal, in fixed point.
        let (c, s) = trig[max_n];
        let a = -s * params.rho;
        let b = c * params.rho;
        let x_major = a.abs() > b.abs();
        let (x0, y0, dx0, dy0) = if x_major {
            let dy0 = (b * f64::from(1u32 << SHIFT) / a.abs()).round() as i64;
            (px, (py << SHIFT) + (1 << (SHIFT - 1)), a.signum() as i64, dy0)
        } else {
            let dx0 = (a * f64::from(1u32 << SHIFT) / b.abs()).round() as i64;
            ((px << SHIFT) + (1 << (SHIFT - 1)), py, dx0, b.signum() as i64)
        };
        let to_pixel = |x: i64, y: i64| -> (i64, i64) {
            if x_major {
                (x, y >> SHIFT)
            } else {
                (x >> SHIFT, y)
            }
        };

        let mut ends = [(px, py); 2];
        for (k, end) in ends.iter_mut().enumerate() {
            let (dx, dy) = if k == 0 { (dx0, dy0) } else { (-dx0, -dy0) };
            let (mut x, mut y) = (x0, y0);
            let mut gap = 0;
            loop {
                let (j, i) = to_pixel(x, y);
                if j < 0 || j >= w || i < 0 || i >= h {
                    break;
                }
                if mask[(i * w + j) as usize] {
                    gap = 0;
                    *end = (j, i);
                } else {
                    gap += 1;
                    if gap > max_gap {
                        break;
                    }
                }
                x += dx;
                y += dy;
            }
        }

        let good = (ends[1].0 - ends[0].0).abs() >= min_len
            || (ends[1].1 - ends[0].1).abs() >= min_len;

        for (k, end) in ends.iter().enumerate() {
            let (dx, dy) = if k == 0 { (dx0, dy0) } else { (-dx0, -dy0) };
            let (mut x, mut y) = (x0, y0);
            loop {
                let (j, i) = to_pixel(x, y);
                let idx = (i * w + j) as usize;
                if mask[idx] {
                    if good {
                        for n in 0..num_angle {
                            accum[n * num_rho + rho_index(j, i, n)] -= 1;
                        }
                    }
                    mask[idx] = false;
                }
                if (j, i) == *end {
                    break;
                }
                x += dx;
                y += dy;
            }
        }

        if good {
            let [(ax, ay), (bx, by)] = ends;
            let ((x1, y1), (x2, y2)) = if (ax, ay) <= (bx, by) {
                ((ax, ay), (bx, by))
            } else {
                ((bx, by), (ax, ay))
            };
            segments.push(Segment::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32));
        }
    }
    segments
}

/// Rows `from_row..height` of `image`.
pub fn crop_rows(image: &GrayImage, from_row: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    let from_row = from_row.min(height);
    image::imageops::crop_imm(image, 0, from_row, width, height - from_row).to_image()
}

/// Draw a segment with square pen of `thickness` pixels; off-image pixels are skipped.
pub fn draw_segment(image: &mut RgbImage, segment: &Segment, color: Rgb<u8>, thickness: u32) {
    let (mut x, mut y) = (segment.x1, segment.y1);
    let dx = (segment.x2 - segment.x1).abs();
    let dy = -(segment.y2 - segment.y1).abs();
    let sx = if segment.x1 < segment.x2 { 1 } else { -1 };
    let sy = if segment.y1 < segment.y2 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        plot(image, x, y, color, thickness);
        if x == segment.x2 && y == segment.y2 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Outline an axis-aligned rectangle given by its corners.
pub fn draw_rect(
    image: &mut RgbImage,
    (x1, y1): (i32, i32),
    (x2, y2): (i32, i32),
    color: Rgb<u8>,
    thickness: u32,
) {
    for segment in [
        Segment::new(x1, y1, x2, y1),
        Segment::new(x2, y1, x2, y2),
        Segment::new(x2, y2, x1, y2),
        Segment::new(x1, y2, x1, y1),
    ] {
        draw_segment(image, &segment, color, thickness);
    }
}

fn plot(image: &mut RgbImage, cx: i32, cy: i32, color: Rgb<u8>, thickness: u32) {
    let (width, height) = image.dimensions();
    let t = thickness.max(1) as i32;
    let lo = -(t - 1) / 2;
    for oy in lo..lo + t {
        for ox in lo..lo + t {
            let (x, y) = (cx + ox, cy + oy);
            if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
                image.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}
