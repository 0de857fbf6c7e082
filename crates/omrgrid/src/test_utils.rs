//! Shared test utilities: "photograph" a rendered canonical sheet through a
//! known homography with an exposure gradient.

use std::io::Cursor;

use image::{GrayImage, Luma};
use nalgebra::Matrix3;

use crate::homography::project;
use crate::imaging::bilinear_sample_u8_checked;

/// Simulated camera.
#[derive(Debug, Clone)]
pub(crate) struct PhotoParams {
    /// Canonical canvas → photo.
    pub homography: Matrix3<f64>,
    pub size: [u32; 2],
    /// Table surface around the sheet.
    pub background: u8,
    /// Exposure gain at the left and right photo edges.
    pub gain: [f32; 2],
    /// Paper reflectance relative to the rendered white.
    pub paper: f32,
}

impl PhotoParams {
    /// Mild rotation, scale and keystone; darker on the left.
    pub fn tilted() -> Self {
        Self {
            homography: Matrix3::new(1.08, 0.05, 70.0, -0.04, 1.1, 90.0, 2e-5, 3e-5, 1.0),
            size: [1000, 1250],
            background: 200,
            gain: [0.65, 1.0],
            paper: 0.95,
        }
    }
}

pub(crate) fn photograph(canonical: &GrayImage, params: &PhotoParams) -> GrayImage {
    let inv = params
        .homography
        .try_inverse()
        .expect("invertible test homography");
    let [w, h] = params.size;
    GrayImage::from_fn(w, h, |x, y| {
        let [cx, cy] = project(&inv, [x as f64, y as f64]);
        let base = bilinear_sample_u8_checked(canonical, cx as f32, cy as f32)
            .map(|v| v * params.paper)
            .unwrap_or(params.background as f32);
        let t = x as f32 / (w - 1) as f32;
        let gain = params.gain[0] + (params.gain[1] - params.gain[0]) * t;
        Luma([(base * gain).round().clamp(0.0, 255.0) as u8])
    })
}

pub(crate) fn encode_png(img: &GrayImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .expect("png encode");
    buf
}
