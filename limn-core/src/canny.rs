//! Canny edge detection over `image` buffers.
//!
//! The pipeline is conditioned on this edge map rather than on the photo
//! itself, which is what keeps the subject's outline in the generated avatar.

use image::{DynamicImage, GrayImage, Luma, RgbImage};

/// Default hysteresis thresholds for portrait-style inputs.
pub const LOW_THRESHOLD: f32 = 100.0;
pub const HIGH_THRESHOLD: f32 = 200.0;

const STRONG: u8 = 255;
const WEAK: u8 = 128;

/// Detects object boundaries in an input photo.
///
/// Deterministic: identical inputs produce an identical edge map. The output
/// keeps the input's spatial dimensions, with edges rendered white on black
/// across all three channels.
#[derive(Clone, Copy, Debug)]
pub struct CannyDetector {
    low_threshold: f32,
    high_threshold: f32,
}

impl Default for CannyDetector {
    fn default() -> Self {
        Self {
            low_threshold: LOW_THRESHOLD,
            high_threshold: HIGH_THRESHOLD,
        }
    }
}

impl CannyDetector {
    pub fn new(low_threshold: f32, high_threshold: f32) -> Self {
        Self {
            low_threshold,
            high_threshold,
        }
    }

    pub fn detect(&self, image: &DynamicImage) -> DynamicImage {
        let gray = image.to_luma8();
        let edges = self.edge_mask(&gray);
        // The pipeline conditions on a 3-channel image.
        let mut rgb = RgbImage::new(edges.width(), edges.height());
        for (x, y, pixel) in edges.enumerate_pixels() {
            let v = pixel.0[0];
            rgb.put_pixel(x, y, image::Rgb([v, v, v]));
        }
        DynamicImage::ImageRgb8(rgb)
    }

    fn edge_mask(&self, gray: &GrayImage) -> GrayImage {
        let (w, h) = (gray.width() as i32, gray.height() as i32);
        let mut out = GrayImage::new(gray.width(), gray.height());
        if w < 3 || h < 3 {
            return out;
        }

        let idx = |x: i32, y: i32| (y * w + x) as usize;

        // 3x3 Sobel gradients, L1 magnitude.
        let mut magnitude = vec![0f32; (w * h) as usize];
        let mut direction = vec![0u8; (w * h) as usize];
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let p =
                    |dx: i32, dy: i32| gray.get_pixel((x + dx) as u32, (y + dy) as u32).0[0] as f32;
                let gx =
                    -p(-1, -1) - 2.0 * p(-1, 0) - p(-1, 1) + p(1, -1) + 2.0 * p(1, 0) + p(1, 1);
                let gy =
                    -p(-1, -1) - 2.0 * p(0, -1) - p(1, -1) + p(-1, 1) + 2.0 * p(0, 1) + p(1, 1);
                magnitude[idx(x, y)] = gx.abs() + gy.abs();
                direction[idx(x, y)] = quantize_direction(gx, gy);
            }
        }

        // Non-maximum suppression: keep only local maxima along the gradient.
        let mut thin = vec![0f32; (w * h) as usize];
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let m = magnitude[idx(x, y)];
                let (dx, dy) = match direction[idx(x, y)] {
                    0 => (1, 0),
                    1 => (1, 1),
                    2 => (0, 1),
                    _ => (1, -1),
                };
                if m >= magnitude[idx(x + dx, y + dy)] && m >= magnitude[idx(x - dx, y - dy)] {
                    thin[idx(x, y)] = m;
                }
            }
        }

        // Double threshold plus hysteresis: weak edges survive only when
        // connected to a strong edge.
        let mut mask = vec![0u8; (w * h) as usize];
        let mut stack = Vec::new();
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let m = thin[idx(x, y)];
                if m >= self.high_threshold {
                    mask[idx(x, y)] = STRONG;
                    stack.push((x, y));
                } else if m >= self.low_threshold {
                    mask[idx(x, y)] = WEAK;
                }
            }
        }
        while let Some((x, y)) = stack.pop() {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        continue;
                    }
                    if mask[idx(nx, ny)] == WEAK {
                        mask[idx(nx, ny)] = STRONG;
                        stack.push((nx, ny));
                    }
                }
            }
        }

        for y in 0..h {
            for x in 0..w {
                if mask[idx(x, y)] == STRONG {
                    out.put_pixel(x as u32, y as u32, Luma([255]));
                }
            }
        }
        out
    }
}

/// Buckets a gradient into one of four directions for suppression.
fn quantize_direction(gx: f32, gy: f32) -> u8 {
    let angle = gy.atan2(gx).to_degrees();
    let angle = if angle < 0.0 { angle + 180.0 } else { angle };
    if !(22.5..157.5).contains(&angle) {
        0
    } else if angle < 67.5 {
        1
    } else if angle < 112.5 {
        2
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn square_image() -> DynamicImage {
        let img = RgbImage::from_fn(64, 64, |x, y| {
            if (16..48).contains(&x) && (16..48).contains(&y) {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn preserves_dimensions() {
        let edges = CannyDetector::default().detect(&square_image());
        assert_eq!((edges.width(), edges.height()), (64, 64));
    }

    #[test]
    fn finds_square_boundary() {
        let edges = CannyDetector::default().detect(&square_image()).to_luma8();
        let lit = edges.pixels().filter(|p| p.0[0] > 0).count();
        assert!(lit > 0, "expected edge pixels along the square boundary");
        // Edges hug the boundary, nowhere near the full area.
        assert!(lit < 64 * 64 / 4);
        // A pixel well inside the square is not an edge.
        assert_eq!(edges.get_pixel(32, 32).0[0], 0);
    }

    #[test]
    fn uniform_image_has_no_edges() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([200, 200, 200])));
        let edges = CannyDetector::default().detect(&img).to_luma8();
        assert!(edges.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let detector = CannyDetector::default();
        let a = detector.detect(&square_image()).to_luma8();
        let b = detector.detect(&square_image()).to_luma8();
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn tiny_image_yields_empty_mask() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([255, 255, 255])));
        let edges = CannyDetector::default().detect(&img).to_luma8();
        assert_eq!((edges.width(), edges.height()), (2, 2));
        assert!(edges.pixels().all(|p| p.0[0] == 0));
    }
}
