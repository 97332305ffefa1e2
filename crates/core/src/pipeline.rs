//! Per-request colorization: decode, guard, Lab split, inference, upscale,
//! recombine and encode.
//!
//! Every call owns its buffers; the only shared state is the predictor.

use std::io::Cursor;
use std::time::Instant;

use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};
use ndarray::{Array2, ArrayView2};
use tracing::{debug, error};

use crate::color;
use crate::error::ColorizeError;
use crate::model::{ChromaPredictor, DOWNSCALE_CEILING, LUMINANCE_CENTER, NETWORK_INPUT_SIZE};
use crate::resize;

#[derive(Debug, Clone)]
pub struct ColorizedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Dimensions after the downscale guard.
///
/// Images within the ceiling pass through. Otherwise the larger side becomes
/// exactly the ceiling and the smaller side is scaled with integer
/// truncation, never below one pixel.
pub fn guarded_dimensions(width: u32, height: u32) -> (u32, u32) {
    if width <= DOWNSCALE_CEILING && height <= DOWNSCALE_CEILING {
        return (width, height);
    }

    let ceiling = DOWNSCALE_CEILING as u64;
    let scale_side = |side: u32, larger: u32| -> u32 {
        ((side as u64 * ceiling) / larger as u64).max(1) as u32
    };

    if width >= height {
        (DOWNSCALE_CEILING, scale_side(height, width))
    } else {
        (scale_side(width, height), DOWNSCALE_CEILING)
    }
}

/// Decode an upload to 8-bit RGB, upright according to its EXIF orientation.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, ColorizeError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| ColorizeError::Decode(image::ImageError::IoError(err)))?;
    let mut decoder = reader.into_decoder().map_err(ColorizeError::Decode)?;
    // Unreadable EXIF is not worth rejecting the pixels over.
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);

    let mut decoded = DynamicImage::from_decoder(decoder).map_err(ColorizeError::Decode)?;
    decoded.apply_orientation(orientation);
    Ok(decoded.to_rgb8())
}

pub fn encode_png(rgb: &RgbImage) -> Result<Vec<u8>, ColorizeError> {
    let mut buf = Cursor::new(Vec::new());
    rgb.write_to(&mut buf, ImageFormat::Png)
        .map_err(ColorizeError::Encode)?;
    Ok(buf.into_inner())
}

/// Resize lightness to the network's square input and center it around zero.
pub fn network_input(lightness: ArrayView2<'_, f32>) -> Array2<f32> {
    let mut input = resize::resize_plane(lightness, NETWORK_INPUT_SIZE, NETWORK_INPUT_SIZE);
    input -= LUMINANCE_CENTER;
    input
}

/// Colorize an already-decoded image. Output dimensions equal the guarded
/// input dimensions.
pub fn colorize_rgb(predictor: &dyn ChromaPredictor, rgb: RgbImage) -> Result<RgbImage, ColorizeError> {
    let (src_w, src_h) = rgb.dimensions();
    if src_w == 0 || src_h == 0 {
        return Err(ColorizeError::shape(
            "decoded image",
            "non-empty [H, W, 3]",
            &[src_h as usize, src_w as usize, 3],
        ));
    }

    let (width, height) = guarded_dimensions(src_w, src_h);
    let rgb = if (width, height) == (src_w, src_h) {
        rgb
    } else {
        debug!(src_w, src_h, width, height, "Downscaling oversized upload");
        resize::resize_rgb(&rgb, width, height)
    };

    let l_full = color::lightness(&rgb);
    let input = network_input(l_full.view());

    let started = Instant::now();
    let ab = predictor.predict(input.view())?;
    let (channels, pred_h, pred_w) = ab.dim();
    if channels != 2 || pred_h == 0 || pred_w == 0 {
        error!(shape = ?ab.shape(), "Predictor returned malformed chroma");
        return Err(ColorizeError::shape("prediction", "[2, H, W]", ab.shape()));
    }
    debug!(
        pred_h,
        pred_w,
        inference_ms = started.elapsed().as_millis() as u64,
        "Chroma predicted"
    );

    let ab_hw = ab.view().permuted_axes([1, 2, 0]);
    let ab_full = resize::resize_channels_last(ab_hw, height as usize, width as usize);

    color::compose_lab(l_full.view(), ab_full.view())
}

/// Full request pipeline from uploaded bytes to PNG bytes.
pub fn colorize(predictor: &dyn ChromaPredictor, bytes: &[u8]) -> Result<ColorizedImage, ColorizeError> {
    let rgb = decode_rgb(bytes)?;
    let colorized = colorize_rgb(predictor, rgb)?;
    let (width, height) = colorized.dimensions();
    let png = encode_png(&colorized)?;

    Ok(ColorizedImage { png, width, height })
}
