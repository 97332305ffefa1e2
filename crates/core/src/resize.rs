//! Pure-Rust bilinear resampling for RGB images and f32 planes.
//!
//! Destination pixel centers map onto source coordinates and edges are
//! replicated, which matches OpenCV's `INTER_LINEAR` when upsampling.

use image::{Rgb, RgbImage};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

/// Source neighbours and blend weight for one destination coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tap {
    lo: usize,
    hi: usize,
    frac: f64,
}

fn axis_taps(src_len: usize, dst_len: usize) -> Vec<Tap> {
    let scale = src_len as f64 / dst_len as f64;
    (0..dst_len)
        .map(|dst| {
            let pos = (dst as f64 + 0.5) * scale - 0.5;
            let lo = pos.floor().max(0.0) as usize;
            let lo = lo.min(src_len - 1);
            let hi = (lo + 1).min(src_len - 1);
            let frac = (pos - lo as f64).clamp(0.0, 1.0);
            Tap { lo, hi, frac }
        })
        .collect()
}

#[inline]
fn blend(p00: f64, p10: f64, p01: f64, p11: f64, fx: f64, fy: f64) -> f64 {
    let top = p00 * (1.0 - fx) + p10 * fx;
    let bot = p01 * (1.0 - fx) + p11 * fx;
    top * (1.0 - fy) + bot * fy
}

/// Resize an 8-bit RGB image. Zero-sized targets yield an empty image.
pub fn resize_rgb(src: &RgbImage, dst_w: u32, dst_h: u32) -> RgbImage {
    let (src_w, src_h) = src.dimensions();
    if (src_w, src_h) == (dst_w, dst_h) {
        return src.clone();
    }
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return RgbImage::new(dst_w, dst_h);
    }

    let xs = axis_taps(src_w as usize, dst_w as usize);
    let ys = axis_taps(src_h as usize, dst_h as usize);

    RgbImage::from_fn(dst_w, dst_h, |x, y| {
        let tx = xs[x as usize];
        let ty = ys[y as usize];
        let p00 = src.get_pixel(tx.lo as u32, ty.lo as u32);
        let p10 = src.get_pixel(tx.hi as u32, ty.lo as u32);
        let p01 = src.get_pixel(tx.lo as u32, ty.hi as u32);
        let p11 = src.get_pixel(tx.hi as u32, ty.hi as u32);

        let mut out = [0u8; 3];
        for (c, value) in out.iter_mut().enumerate() {
            let v = blend(
                p00[c] as f64,
                p10[c] as f64,
                p01[c] as f64,
                p11[c] as f64,
                tx.frac,
                ty.frac,
            );
            *value = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

/// Resize a single-channel `(H, W)` plane.
pub fn resize_plane(src: ArrayView2<'_, f32>, dst_h: usize, dst_w: usize) -> Array2<f32> {
    let (src_h, src_w) = src.dim();
    if (src_h, src_w) == (dst_h, dst_w) {
        return src.to_owned();
    }
    if src_h == 0 || src_w == 0 {
        return Array2::zeros((dst_h, dst_w));
    }

    let xs = axis_taps(src_w, dst_w);
    let ys = axis_taps(src_h, dst_h);

    Array2::from_shape_fn((dst_h, dst_w), |(y, x)| {
        let (tx, ty) = (xs[x], ys[y]);
        blend(
            src[[ty.lo, tx.lo]] as f64,
            src[[ty.lo, tx.hi]] as f64,
            src[[ty.hi, tx.lo]] as f64,
            src[[ty.hi, tx.hi]] as f64,
            tx.frac,
            ty.frac,
        ) as f32
    })
}

/// Resize a channels-last `(H, W, C)` array, each channel independently.
pub fn resize_channels_last(src: ArrayView3<'_, f32>, dst_h: usize, dst_w: usize) -> Array3<f32> {
    let (src_h, src_w, channels) = src.dim();
    if (src_h, src_w) == (dst_h, dst_w) {
        return src.to_owned();
    }
    if src_h == 0 || src_w == 0 {
        return Array3::zeros((dst_h, dst_w, channels));
    }

    let xs = axis_taps(src_w, dst_w);
    let ys = axis_taps(src_h, dst_h);

    Array3::from_shape_fn((dst_h, dst_w, channels), |(y, x, c)| {
        let (tx, ty) = (xs[x], ys[y]);
        blend(
            src[[ty.lo, tx.lo, c]] as f64,
            src[[ty.lo, tx.hi, c]] as f64,
            src[[ty.hi, tx.lo, c]] as f64,
            src[[ty.hi, tx.hi, c]] as f64,
            tx.frac,
            ty.frac,
        ) as f32
    })
}
