//! Synthetic stream generation for testing
//!
//! Produces JHCMD stream datagrams around real JPEG images, so decoded pixels
//! can be checked against the colour that went in.
//!
//! # Example
//!
//! ```rust,ignore
//! use wifi_scope_lib::test_utils::{encode_test_jpeg, FragmentGenerator, Rgb};
//!
//! let mut gen = FragmentGenerator::default();
//!
//! // Fragments for a solid red frame, then the start of the next frame
//! let mut datagrams = gen.fragment_frame(&encode_test_jpeg(64, 48, Rgb::RED));
//! datagrams.extend(gen.fragment_frame(&[]));
//! ```

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::protocol::{encode_fragment, FragmentHeader, HEADER_LEN, MAX_DATAGRAM_LEN};

/// RGB color for test patterns
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    /// Red component (0-255)
    pub r: u8,
    /// Green component (0-255)
    pub g: u8,
    /// Blue component (0-255)
    pub b: u8,
}

impl Rgb {
    /// Pure red color
    pub const RED: Rgb = Rgb { r: 255, g: 0, b: 0 };
    /// Pure green color
    pub const GREEN: Rgb = Rgb { r: 0, g: 255, b: 0 };
    /// Pure blue color
    pub const BLUE: Rgb = Rgb { r: 0, g: 0, b: 255 };
    /// Pure white color
    pub const WHITE: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
    /// Pure black color
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };
    /// Medium gray color
    pub const GRAY: Rgb = Rgb {
        r: 128,
        g: 128,
        b: 128,
    };
}

/// Encode a solid-colour image as a baseline JPEG
///
/// # Panics
///
/// Panics if the encoder rejects the dimensions (zero or over 65535).
pub fn encode_test_jpeg(width: u32, height: u32, color: Rgb) -> Vec<u8> {
    let pixels: Vec<u8> = std::iter::repeat([color.r, color.g, color.b])
        .take(width as usize * height as usize)
        .flatten()
        .collect();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, 90)
        .write_image(&pixels, width, height, ExtendedColorType::Rgb8)
        .expect("test JPEG should encode");
    jpeg
}

/// Check if data starts with the JPEG SOI marker (0xFFD8)
#[inline]
pub fn is_jpeg_data(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] == 0xD8
}

/// Generates stream datagrams the way the camera fragments frames
#[derive(Debug)]
pub struct FragmentGenerator {
    /// Maximum payload bytes per datagram (excluding header)
    pub max_payload_size: usize,
    /// Id assigned to the next frame
    next_frame_id: u16,
}

impl Default for FragmentGenerator {
    fn default() -> Self {
        Self::new(MAX_DATAGRAM_LEN - HEADER_LEN)
    }
}

impl FragmentGenerator {
    /// Create a generator with the given payload size, starting at frame 1
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size: max_payload_size.max(1),
            next_frame_id: 1,
        }
    }

    /// Start numbering frames at `frame_id`
    pub fn with_start_frame_id(mut self, frame_id: u16) -> Self {
        self.next_frame_id = frame_id;
        self
    }

    /// Id the next generated frame will carry
    pub fn next_frame_id(&self) -> u16 {
        self.next_frame_id
    }

    /// Split `frame` into datagrams of at most `max_payload_size` payload bytes
    ///
    /// Always yields at least the index-zero datagram, even for empty input.
    /// Fragment indices wrap at 256.
    pub fn fragment_frame(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let chunks: Vec<&[u8]> = if frame.is_empty() {
            vec![frame]
        } else {
            frame.chunks(self.max_payload_size).collect()
        };
        self.emit(&chunks)
    }

    /// Split `frame` into exactly `count` slices of near-equal length
    ///
    /// The last slice takes the remainder.
    pub fn fragment_frame_into(&mut self, frame: &[u8], count: usize) -> Vec<Vec<u8>> {
        let count = count.max(1);
        let step = frame.len() / count;
        let chunks: Vec<&[u8]> = (0..count)
            .map(|i| {
                let start = i * step;
                let end = if i + 1 == count {
                    frame.len()
                } else {
                    start + step
                };
                &frame[start..end]
            })
            .collect();
        self.emit(&chunks)
    }

    fn emit(&mut self, chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                encode_fragment(
                    FragmentHeader {
                        frame_id,
                        fragment_index: i as u8,
                    },
                    chunk,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_fragment;

    #[test]
    fn test_encoded_jpeg_has_markers() {
        let jpeg = encode_test_jpeg(16, 16, Rgb::GRAY);

        assert!(is_jpeg_data(&jpeg));
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_is_jpeg_data() {
        assert!(is_jpeg_data(&[0xFF, 0xD8]));
        assert!(is_jpeg_data(&[0xFF, 0xD8, 0xFF, 0xE0]));
        assert!(!is_jpeg_data(&[]));
        assert!(!is_jpeg_data(&[0xFF]));
        assert!(!is_jpeg_data(&[0xFF, 0xD9]));
    }

    #[test]
    fn test_fragment_small_frame() {
        let mut gen = FragmentGenerator::new(1000);
        let packets = gen.fragment_frame(&[0xAB; 100]);

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), HEADER_LEN + 100);
    }

    #[test]
    fn test_fragment_large_frame() {
        let mut gen = FragmentGenerator::new(100);
        let packets = gen.fragment_frame(&[0u8; 250]);

        assert_eq!(packets.len(), 3);
        let indices: Vec<u8> = packets
            .iter()
            .map(|p| parse_fragment(p).unwrap().0.fragment_index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(parse_fragment(&packets[2]).unwrap().1.len(), 50);
    }

    #[test]
    fn test_empty_frame_yields_start_marker() {
        let mut gen = FragmentGenerator::default();
        let packets = gen.fragment_frame(&[]);

        assert_eq!(packets.len(), 1);
        let (header, payload) = parse_fragment(&packets[0]).unwrap();
        assert!(header.starts_frame());
        assert!(payload.is_empty());
    }

    #[test]
    fn test_frame_ids_increment_and_wrap() {
        let mut gen = FragmentGenerator::new(10).with_start_frame_id(u16::MAX);

        let first = gen.fragment_frame(&[1]);
        let second = gen.fragment_frame(&[2]);

        assert_eq!(parse_fragment(&first[0]).unwrap().0.frame_id, u16::MAX);
        assert_eq!(parse_fragment(&second[0]).unwrap().0.frame_id, 0);
        assert_eq!(gen.next_frame_id(), 1);
    }

    #[test]
    fn test_fragment_into_exact_count() {
        let mut gen = FragmentGenerator::default();
        let packets = gen.fragment_frame_into(&[9u8; 10], 3);

        assert_eq!(packets.len(), 3);
        let lens: Vec<usize> = packets
            .iter()
            .map(|p| parse_fragment(p).unwrap().1.len())
            .collect();
        assert_eq!(lens, vec![3, 3, 4]);
    }
}
