//! Decoded image value carried through the pipeline.

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};

/// A decoded image plus what is needed to persist it without loss.
#[derive(Debug, Clone)]
pub struct WebImage {
    bitmap: DynamicImage,
    scale: f32,
    format: Option<ImageFormat>,
    animated_data: Option<Bytes>,
    frame_count: u32,
}

impl WebImage {
    /// Wraps a bare bitmap with no source bytes attached.
    #[must_use]
    pub fn new(bitmap: DynamicImage) -> Self {
        Self {
            bitmap,
            scale: 1.0,
            format: None,
            animated_data: None,
            frame_count: 1,
        }
    }

    /// Sets the display scale.
    #[must_use]
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = if scale > 0.0 { scale } else { 1.0 };
        self
    }

    /// Records the format the bitmap was decoded from.
    #[must_use]
    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Attaches the original bytes of a multi-frame image.
    #[must_use]
    pub fn with_animation(mut self, data: Bytes, frame_count: u32) -> Self {
        self.animated_data = Some(data);
        self.frame_count = frame_count.max(1);
        self
    }

    /// Returns the first frame.
    #[must_use]
    pub const fn bitmap(&self) -> &DynamicImage {
        &self.bitmap
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.bitmap.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.bitmap.height()
    }

    /// Display scale (1.0, 2.0, 3.0 ...).
    #[must_use]
    pub const fn scale(&self) -> f32 {
        self.scale
    }

    /// Source format, if known.
    #[must_use]
    pub const fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    /// Original bytes for animated images.
    #[must_use]
    pub const fn animated_data(&self) -> Option<&Bytes> {
        self.animated_data.as_ref()
    }

    /// Number of frames; 1 for still images.
    #[must_use]
    pub const fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Returns true if the image carries more than one frame.
    #[must_use]
    pub const fn is_animated(&self) -> bool {
        self.frame_count > 1
    }

    /// Returns true if the bitmap has an alpha channel.
    #[must_use]
    pub fn has_alpha(&self) -> bool {
        self.bitmap.color().has_alpha()
    }

    /// Memory cost of the decoded bitmap: height x width x 4 bytes.
    #[must_use]
    pub fn cost(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height()) * 4
    }
}

impl From<DynamicImage> for WebImage {
    fn from(bitmap: DynamicImage) -> Self {
        Self::new(bitmap)
    }
}
