//! Image decoding and encoding.
//!
//! Animated sources (GIF, APNG, animated WebP) keep their original bytes so they
//! can be persisted without a lossy round-trip through a single bitmap.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder, DynamicImage, Frames, ImageFormat};

use crate::domain::entities::WebImage;
use crate::domain::errors::WebImageError;

/// Decoding parameters.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Keep multi-frame data for animated formats.
    pub allow_animated: bool,
    /// Display scale attached to the decoded image.
    pub scale: f32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            allow_animated: true,
            scale: 1.0,
        }
    }
}

/// Decodes encoded bytes into a [`WebImage`].
///
/// # Errors
/// Returns `DecodeFailed` if the format is unknown or the data is malformed.
pub fn decode(data: &Bytes, options: DecodeOptions) -> Result<WebImage, WebImageError> {
    if data.is_empty() {
        return Err(WebImageError::decode("no data"));
    }

    let format = image::guess_format(data)
        .map_err(|e| WebImageError::decode(format!("unknown format: {e}")))?;

    let (bitmap, frames) = match animation_frames(data, format) {
        Some(frames) => first_frame(frames, options.allow_animated)?,
        None => {
            let bitmap = image::load_from_memory_with_format(data, format)
                .map_err(|e| WebImageError::decode(e.to_string()))?;
            (bitmap, 1)
        }
    };

    let mut image = WebImage::new(bitmap)
        .with_scale(options.scale)
        .with_format(format);
    if frames > 1 {
        image = image.with_animation(data.clone(), frames);
    }

    Ok(image)
}

/// Encodes an image for persistence.
///
/// Animated images return their original bytes. Bare bitmaps are encoded as PNG
/// when they have an alpha channel and as JPEG otherwise.
///
/// # Errors
/// Returns `DecodeFailed` if the encoder rejects the bitmap.
pub fn encode(image: &WebImage) -> Result<Bytes, WebImageError> {
    if let Some(data) = image.animated_data() {
        return Ok(data.clone());
    }

    let mut buffer = Cursor::new(Vec::new());
    if image.has_alpha() {
        image
            .bitmap()
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|e| WebImageError::decode(format!("PNG encode failed: {e}")))?;
    } else {
        DynamicImage::ImageRgb8(image.bitmap().to_rgb8())
            .write_to(&mut buffer, ImageFormat::Jpeg)
            .map_err(|e| WebImageError::decode(format!("JPEG encode failed: {e}")))?;
    }

    Ok(Bytes::from(buffer.into_inner()))
}

/// Frame iterator for animated sources, `None` for still images.
fn animation_frames(data: &[u8], format: ImageFormat) -> Option<Frames<'_>> {
    match format {
        ImageFormat::Gif => GifDecoder::new(Cursor::new(data))
            .ok()
            .map(AnimationDecoder::into_frames),
        ImageFormat::Png => {
            let decoder = PngDecoder::new(Cursor::new(data)).ok()?;
            if !decoder.is_apng().unwrap_or(false) {
                return None;
            }
            decoder.apng().ok().map(AnimationDecoder::into_frames)
        }
        ImageFormat::WebP => {
            let decoder = WebPDecoder::new(Cursor::new(data)).ok()?;
            decoder
                .has_animation()
                .then(|| decoder.into_frames())
        }
        _ => None,
    }
}

/// Decodes the first frame and, when `count_rest` is set, walks the remaining
/// frames once to count them. Frames are never decoded twice.
fn first_frame(
    mut frames: Frames<'_>,
    count_rest: bool,
) -> Result<(DynamicImage, u32), WebImageError> {
    let first = frames
        .next()
        .ok_or_else(|| WebImageError::decode("animation has no frames"))?
        .map_err(|e| WebImageError::decode(e.to_string()))?;
    let rest = if count_rest {
        frames.filter(Result::is_ok).count()
    } else {
        0
    };
    let count = u32::try_from(rest + 1).unwrap_or(u32::MAX);
    Ok((DynamicImage::ImageRgba8(first.into_buffer()), count))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Encodes a solid RGBA square as PNG.
    pub fn png_bytes(width: u32, height: u32) -> Bytes {
        let bitmap = DynamicImage::new_rgba8(width, height);
        let mut buffer = Cursor::new(Vec::new());
        bitmap
            .write_to(&mut buffer, ImageFormat::Png)
            .expect("encode png fixture");
        Bytes::from(buffer.into_inner())
    }

    /// Encodes a two-frame GIF.
    pub fn animated_gif_bytes() -> Bytes {
        use image::codecs::gif::GifEncoder;
        use image::{Delay, Frame, RgbaImage};

        let mut buffer = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut buffer);
            let frames = (0..2u8).map(|i| {
                Frame::from_parts(
                    RgbaImage::from_pixel(4, 4, image::Rgba([i * 100, 0, 0, 255])),
                    0,
                    0,
                    Delay::from_numer_denom_ms(100, 1),
                )
            });
            encoder.encode_frames(frames).expect("encode gif fixture");
        }
        Bytes::from(buffer)
    }
}
