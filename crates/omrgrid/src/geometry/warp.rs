use image::{GrayImage, Luma};
use nalgebra::Matrix3;

use crate::homography::project;
use crate::imaging::bilinear_sample_u8_checked;

/// Resample `photo` onto the canonical canvas.
///
/// `h` maps canvas pixels to photo pixels; canvas pixels that land outside
/// the photo are painted white.
pub(crate) fn warp_to_canvas(photo: &GrayImage, h: &Matrix3<f64>, canvas_px: [u32; 2]) -> GrayImage {
    let [w, ht] = canvas_px;
    GrayImage::from_fn(w, ht, |x, y| {
        let [px, py] = project(h, [x as f64, y as f64]);
        let v = bilinear_sample_u8_checked(photo, px as f32, py as f32).unwrap_or(255.0);
        Luma([v.round().clamp(0.0, 255.0) as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_warp_copies_and_pads_white() {
        let photo = GrayImage::from_fn(20, 10, |x, y| Luma([(x * 10 + y) as u8]));
        let out = warp_to_canvas(&photo, &Matrix3::identity(), [25, 10]);
        assert_eq!(out.get_pixel(3, 4)[0], 34);
        assert_eq!(out.get_pixel(22, 2)[0], 255);
    }

    #[test]
    fn translated_warp_samples_between_pixels() {
        let photo = GrayImage::from_fn(8, 8, |x, _| Luma([(x * 20) as u8]));
        let h = Matrix3::new(1.0, 0.0, 0.5, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        let out = warp_to_canvas(&photo, &h, [4, 4]);
        assert_eq!(out.get_pixel(2, 1)[0], 50);
    }
}
