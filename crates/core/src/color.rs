//! sRGB <-> CIE Lab (D65) conversion on whole images.

use image::{Rgb, RgbImage};
use ndarray::{Array2, ArrayView2, ArrayView3};
use palette::{FromColor, IntoColor, Lab, LinSrgb, Srgb};

use crate::error::ColorizeError;

/// Lightness channel of `rgb` as an `(H, W)` array with L in `[0, 100]`.
pub fn lightness(rgb: &RgbImage) -> Array2<f32> {
    let (w, h) = rgb.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        pixel_to_lab(rgb.get_pixel(x as u32, y as u32)).l
    })
}

fn pixel_to_lab(p: &Rgb<u8>) -> Lab {
    let srgb = Srgb::new(
        p[0] as f32 / 255.0,
        p[1] as f32 / 255.0,
        p[2] as f32 / 255.0,
    );
    let lin: LinSrgb<f32> = srgb.into_linear();
    Lab::from_color(lin)
}

fn lab_to_u8(l: f32, a: f32, b: f32) -> Rgb<u8> {
    let lin: LinSrgb<f32> = Lab::new(l, a, b).into_color();
    let srgb: Srgb<f32> = Srgb::from_linear(lin);
    // Truncating cast after clamping; NaN saturates to 0.
    let quantize = |v: f32| (v * 255.0).clamp(0.0, 255.0) as u8;
    Rgb([quantize(srgb.red), quantize(srgb.green), quantize(srgb.blue)])
}

/// Combine a full-resolution lightness plane with a channels-last `(H, W, 2)`
/// ab prediction into an 8-bit sRGB image.
pub fn compose_lab(lightness: ArrayView2<'_, f32>, ab: ArrayView3<'_, f32>) -> Result<RgbImage, ColorizeError> {
    let (h, w) = lightness.dim();
    if ab.dim() != (h, w, 2) {
        return Err(ColorizeError::shape(
            "recombination",
            format!("[{h}, {w}, 2]"),
            ab.shape(),
        ));
    }

    Ok(RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        lab_to_u8(lightness[[y, x]], ab[[y, x, 0]], ab[[y, x, 1]])
    }))
}
