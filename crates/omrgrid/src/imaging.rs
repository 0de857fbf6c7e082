//! Pixel-level helpers shared by the pipeline stages.

use image::{GrayImage, Luma};

use crate::config::IlluminationConfig;

/// Sample a grayscale image at a sub-pixel position (pixel centers at
/// integer coordinates) using bilinear interpolation.
///
/// Returns intensity in [0, 255] or `None` outside the interpolable area.
#[inline]
pub(crate) fn bilinear_sample_u8_checked(img: &GrayImage, x: f32, y: f32) -> Option<f32> {
    let (w, h) = img.dimensions();
    if w < 2 || h < 2 || !(x >= 0.0 && y >= 0.0) {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    if x0 >= w - 1 || y0 >= h - 1 {
        return None;
    }

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let stride = w as usize;
    let i00 = y0 as usize * stride + x0 as usize;
    let raw = img.as_raw();
    let p00 = raw[i00] as f32;
    let p10 = raw[i00 + 1] as f32;
    let p01 = raw[i00 + stride] as f32;
    let p11 = raw[i00 + stride + 1] as f32;

    Some(
        (1.0 - fx) * (1.0 - fy) * p00
            + fx * (1.0 - fy) * p10
            + (1.0 - fx) * fy * p01
            + fx * fy * p11,
    )
}

/// Flatten uneven illumination: divide every pixel by its box-filtered local
/// mean so that paper maps to white regardless of exposure gradients.
pub(crate) fn normalize_illumination(gray: &GrayImage, config: &IlluminationConfig) -> GrayImage {
    let smoothed;
    let src = if config.denoise_sigma_px > 0.0 {
        smoothed = imageproc::filter::gaussian_blur_f32(gray, config.denoise_sigma_px);
        &smoothed
    } else {
        gray
    };

    let (w, h) = src.dimensions();
    let radius = ((w.max(h) as f32 * config.background_radius_frac).round() as u32).max(1);
    let background = imageproc::filter::box_filter(src, radius, radius);

    let mut out = GrayImage::new(w, h);
    for ((o, s), b) in out
        .iter_mut()
        .zip(src.as_raw())
        .zip(background.as_raw())
    {
        let bg = (*b).max(1) as f32;
        *o = (255.0 * *s as f32 / bg).round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// 256-bin intensity histogram.
#[derive(Debug, Clone)]
pub(crate) struct Histogram {
    bins: [u32; 256],
    total: u64,
}

impl Histogram {
    pub(crate) fn new() -> Self {
        Self {
            bins: [0; 256],
            total: 0,
        }
    }

    #[inline]
    pub(crate) fn add(&mut self, v: u8) {
        self.bins[v as usize] += 1;
        self.total += 1;
    }

    /// Add every pixel of the clipped rectangle `[x0, x1) × [y0, y1)`.
    pub(crate) fn add_region(&mut self, img: &GrayImage, x0: i64, y0: i64, x1: i64, y1: i64) {
        let (w, h) = img.dimensions();
        let xs = x0.clamp(0, w as i64) as u32..x1.clamp(0, w as i64) as u32;
        let ys = y0.clamp(0, h as i64) as u32..y1.clamp(0, h as i64) as u32;
        for y in ys {
            for x in xs.clone() {
                self.add(img.get_pixel(x, y)[0]);
            }
        }
    }

    /// Smallest intensity with at least `q` of the mass at or below it.
    pub(crate) fn percentile(&self, q: f32) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let target = ((q.clamp(0.0, 1.0) as f64) * self.total as f64).ceil().max(1.0) as u64;
        let mut acc = 0u64;
        for (v, &n) in self.bins.iter().enumerate() {
            acc += n as u64;
            if acc >= target {
                return Some(v as u8);
            }
        }
        Some(255)
    }
}

/// Darkness (`255 - intensity`) of one pixel.
#[inline]
pub(crate) fn darkness(img: &GrayImage, x: u32, y: u32) -> u32 {
    255 - img.get_pixel(x, y)[0] as u32
}

/// Convert a grayscale buffer into an RGB canvas for annotation.
pub(crate) fn gray_to_rgb(gray: &GrayImage) -> image::RgbImage {
    image::RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        let Luma([v]) = *gray.get_pixel(x, y);
        image::Rgb([v, v, v])
    })
}
