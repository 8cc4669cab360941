//! Frame decoding and display conversion
//!
//! Turns a finalized byte sequence into a fixed-size pixel buffer ready for
//! the display consumer. The codec auto-detects the format from the byte
//! stream; the microscope only ever sends baseline JPEG.
//!
//! Decoding, scaling and channel reordering all run on the worker thread, so
//! this is the most expensive step per frame. Scaling uses bilinear
//! interpolation.

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::error::DecodeError;

/// Default output width in pixels
pub const DEFAULT_OUTPUT_WIDTH: u32 = 600;

/// Default output height in pixels
pub const DEFAULT_OUTPUT_HEIGHT: u32 = 400;

/// Pixel layout expected by the display consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    /// 3 bytes per pixel, red first
    #[default]
    Rgb,
    /// 3 bytes per pixel, blue first
    Bgr,
    /// 4 bytes per pixel, red first, opaque alpha
    Rgba,
}

impl ChannelOrder {
    /// Bytes per pixel in this layout
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ChannelOrder::Rgb | ChannelOrder::Bgr => 3,
            ChannelOrder::Rgba => 4,
        }
    }

    /// Parse from environment variable string
    pub fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "rgb" | "rgb24" => Self::Rgb,
            "bgr" | "bgr24" => Self::Bgr,
            "rgba" | "rgba32" => Self::Rgba,
            _ => {
                log::warn!("Unknown channel order '{}', defaulting to 'rgb'", s);
                Self::Rgb
            }
        }
    }
}

/// A decoded, scaled, display-ready frame
///
/// Immutable once built; row-major, tightly packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    channel_order: ChannelOrder,
    pixels: Vec<u8>,
}

impl DecodedImage {
    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel layout
    pub fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    /// Raw pixel bytes
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Take ownership of the pixel bytes
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// Pixel at (x, y) as a byte slice of `bytes_per_pixel` length
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.channel_order.bytes_per_pixel();
        let offset = (y as usize * self.width as usize + x as usize) * bpp;
        self.pixels.get(offset..offset + bpp)
    }
}

/// Decodes finalized frames into [`DecodedImage`]s of a fixed size
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    output_width: u32,
    output_height: u32,
    channel_order: ChannelOrder,
    filter: FilterType,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(
            DEFAULT_OUTPUT_WIDTH,
            DEFAULT_OUTPUT_HEIGHT,
            ChannelOrder::default(),
        )
    }
}

impl FrameDecoder {
    /// Create a decoder producing `output_width` x `output_height` images
    pub fn new(output_width: u32, output_height: u32, channel_order: ChannelOrder) -> Self {
        Self {
            output_width,
            output_height,
            channel_order,
            filter: FilterType::Triangle,
        }
    }

    /// Output size as (width, height)
    pub fn output_size(&self) -> (u32, u32) {
        (self.output_width, self.output_height)
    }

    /// Decode, scale and reorder one frame
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Image`] if the bytes are not a decodable image
    /// and [`DecodeError::Empty`] if either the source image or the configured
    /// output size has no pixels.
    pub fn decode(&self, data: &[u8]) -> Result<DecodedImage, DecodeError> {
        if self.output_width == 0 || self.output_height == 0 {
            return Err(DecodeError::Empty {
                width: self.output_width,
                height: self.output_height,
            });
        }

        let decoded = image::load_from_memory(data)?;
        let (width, height) = (decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(DecodeError::Empty { width, height });
        }

        let rgb = decoded.to_rgb8();
        let scaled = if (width, height) == (self.output_width, self.output_height) {
            rgb
        } else {
            imageops::resize(&rgb, self.output_width, self.output_height, self.filter)
        };

        Ok(DecodedImage {
            width: self.output_width,
            height: self.output_height,
            channel_order: self.channel_order,
            pixels: reorder_channels(scaled, self.channel_order),
        })
    }
}

/// Convert packed RGB24 into the requested layout
fn reorder_channels(rgb: RgbImage, order: ChannelOrder) -> Vec<u8> {
    match order {
        ChannelOrder::Rgb => rgb.into_raw(),
        ChannelOrder::Bgr => {
            let mut raw = rgb.into_raw();
            for px in raw.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            raw
        }
        ChannelOrder::Rgba => {
            let raw = rgb.into_raw();
            let mut out = Vec::with_capacity(raw.len() / 3 * 4);
            for px in raw.chunks_exact(3) {
                out.extend_from_slice(px);
                out.push(0xFF);
            }
            out
        }
    }
}
