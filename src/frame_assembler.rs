//! Frame assembly from JHCMD stream fragments
//!
//! Concatenates fragment payloads in arrival order and cuts frames on the
//! fragment-index-zero marker. The assembler is transport-agnostic so the
//! receive loop, the replay path and the tests all share it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use wifi_scope_lib::frame_assembler::{FinalizeDecision, FrameAssembler, ProcessResult};
//!
//! let mut assembler = FrameAssembler::new();
//!
//! for datagram in datagrams {
//!     if let ProcessResult::FrameStarted { previous, .. } = assembler.process_packet(&datagram) {
//!         if let FinalizeDecision::Finalized(frame) = previous {
//!             decode(frame);
//!         }
//!     }
//! }
//! ```
//!
//! # Lost first fragments
//!
//! Fragments are never reordered and there is no end-of-frame marker, so when
//! the index-zero fragment of a frame is lost, the rest of that frame is
//! appended to whatever the previous frame left in the buffer. With
//! [`MergePolicy::Faithful`] (the default) the merged bytes are handed on and
//! usually fail to decode. [`MergePolicy::DiscardMerged`] watches the frame id
//! of every fragment and drops a buffer that mixed frames.

use crate::protocol::parse_fragment;

/// Buffers at or below this length are never decoded
pub const DEFAULT_MIN_FRAME_LEN: usize = 8;

/// Typical encoded frame size, used to size the buffer up front
const INITIAL_CAPACITY: usize = 64 * 1024;

/// How to treat a buffer that absorbed fragments from more than one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Keep merged bytes and let the decoder reject them
    #[default]
    Faithful,
    /// Drop buffers whose fragments carried different frame ids
    DiscardMerged,
}

impl MergePolicy {
    /// Parse from environment variable string
    pub fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "faithful" | "keep" => Self::Faithful,
            "discard" | "discard-merged" | "discard_merged" => Self::DiscardMerged,
            _ => {
                log::warn!("Unknown merge policy '{}', defaulting to 'faithful'", s);
                Self::Faithful
            }
        }
    }
}

/// Assembler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// Buffer empty, no frame in progress
    Idle,
    /// Buffer holds one or more fragments
    Accumulating,
}

/// What happened to the previous buffer when a new frame started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeDecision {
    /// Buffer is long enough to be an image
    Finalized(Vec<u8>),
    /// Buffer was at or below the minimum length (often empty) and dropped
    TooShort(usize),
    /// Buffer mixed fragments of several frames and was dropped
    Merged(usize),
}

/// Result of processing a single datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// Payload appended to the current frame
    Accumulating,
    /// Fragment index zero: the previous buffer was finalized or dropped
    /// and a new frame started
    FrameStarted {
        /// Id of the frame that just started
        frame_id: u16,
        /// Decision taken on the previous buffer
        previous: FinalizeDecision,
    },
    /// Datagram was malformed and ignored
    Skipped,
}

/// Assembles complete encoded frames from stream fragments
#[derive(Debug)]
pub struct FrameAssembler {
    /// Payload bytes of the frame in progress, in arrival order
    frame_buffer: Vec<u8>,
    /// Frame id taken from the last index-zero fragment
    current_frame_id: Option<u16>,
    /// Whether the buffer absorbed a fragment from another frame
    merged: bool,
    /// Finalize only buffers longer than this
    min_frame_len: usize,
    merge_policy: MergePolicy,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    /// Create an assembler with the default minimum length and faithful merging
    pub fn new() -> Self {
        Self::with_options(DEFAULT_MIN_FRAME_LEN, MergePolicy::default())
    }

    /// Create an assembler with explicit options
    ///
    /// # Arguments
    /// * `min_frame_len` - Buffers of this length or shorter are discarded.
    /// * `merge_policy` - Treatment of buffers that mixed frames.
    pub fn with_options(min_frame_len: usize, merge_policy: MergePolicy) -> Self {
        Self {
            frame_buffer: Vec::with_capacity(INITIAL_CAPACITY),
            current_frame_id: None,
            merged: false,
            min_frame_len,
            merge_policy,
        }
    }

    /// Reset the assembler state
    pub fn reset(&mut self) {
        self.frame_buffer.clear();
        self.current_frame_id = None;
        self.merged = false;
    }

    /// Get current buffer size
    pub fn buffer_len(&self) -> usize {
        self.frame_buffer.len()
    }

    /// Current state of the state machine
    pub fn state(&self) -> AssemblerState {
        if self.frame_buffer.is_empty() {
            AssemblerState::Idle
        } else {
            AssemblerState::Accumulating
        }
    }

    /// Frame id of the frame in progress, if a start marker has been seen
    pub fn current_frame_id(&self) -> Option<u16> {
        self.current_frame_id
    }

    /// Active merge policy
    pub fn merge_policy(&self) -> MergePolicy {
        self.merge_policy
    }

    /// Process a single datagram
    ///
    /// Returns [`ProcessResult::FrameStarted`] exactly once per index-zero
    /// fragment, carrying the fate of the previous buffer.
    pub fn process_packet(&mut self, datagram: &[u8]) -> ProcessResult {
        let (header, payload) = match parse_fragment(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::trace!("Dropping malformed datagram: {}", e);
                return ProcessResult::Skipped;
            }
        };

        if !header.starts_frame() {
            if self.current_frame_id != Some(header.frame_id) && !self.merged {
                // Start marker of this frame never arrived
                log::debug!(
                    "Fragment {} of frame {} arrived without its start (current: {:?})",
                    header.fragment_index,
                    header.frame_id,
                    self.current_frame_id
                );
                self.merged = true;
            }
            self.frame_buffer.extend_from_slice(payload);
            return ProcessResult::Accumulating;
        }

        let previous = self.finalize();
        self.current_frame_id = Some(header.frame_id);
        self.frame_buffer.extend_from_slice(payload);

        ProcessResult::FrameStarted {
            frame_id: header.frame_id,
            previous,
        }
    }

    /// Decide the fate of the current buffer and leave it empty
    fn finalize(&mut self) -> FinalizeDecision {
        let frame_size = self.frame_buffer.len();
        let merged = std::mem::take(&mut self.merged);

        if frame_size <= self.min_frame_len {
            self.frame_buffer.clear();
            return FinalizeDecision::TooShort(frame_size);
        }

        if merged && self.merge_policy == MergePolicy::DiscardMerged {
            log::warn!(
                "Discarding {} byte frame assembled from several frame ids",
                frame_size
            );
            self.frame_buffer.clear();
            return FinalizeDecision::Merged(frame_size);
        }

        log::debug!(
            "Complete frame {:?}: {} bytes",
            self.current_frame_id,
            frame_size
        );
        let frame = std::mem::replace(&mut self.frame_buffer, Vec::with_capacity(frame_size));
        FinalizeDecision::Finalized(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_fragment, FragmentHeader};

    fn fragment(frame_id: u16, fragment_index: u8, payload: &[u8]) -> Vec<u8> {
        encode_fragment(
            FragmentHeader {
                frame_id,
                fragment_index,
            },
            payload,
        )
    }

    #[test]
    fn test_assembler_creation() {
        let assembler = FrameAssembler::new();
        assert_eq!(assembler.buffer_len(), 0);
        assert_eq!(assembler.state(), AssemblerState::Idle);
        assert_eq!(assembler.current_frame_id(), None);
        assert_eq!(assembler.merge_policy(), MergePolicy::Faithful);
    }

    #[test]
    fn test_short_datagram_skipped() {
        let mut assembler = FrameAssembler::new();
        assembler.process_packet(&fragment(1, 0, &[1, 2, 3]));

        assert_eq!(
            assembler.process_packet(&[0x01, 0x00, 0x00, 0x01]),
            ProcessResult::Skipped
        );
        assert_eq!(assembler.process_packet(&[]), ProcessResult::Skipped);
        assert_eq!(assembler.buffer_len(), 3);
        assert_eq!(assembler.current_frame_id(), Some(1));
    }

    #[test]
    fn test_continuation_fragments_append_in_arrival_order() {
        let mut assembler = FrameAssembler::new();
        assembler.process_packet(&fragment(3, 0, &[0xA0]));

        // Indices deliberately out of order: arrival order wins
        let payloads: [&[u8]; 3] = [&[0xA2, 0xA2], &[0xA1], &[0xA3, 0xA3, 0xA3]];
        for (payload, index) in payloads.iter().zip([2u8, 1, 3]) {
            assert_eq!(
                assembler.process_packet(&fragment(3, index, payload)),
                ProcessResult::Accumulating
            );
        }

        assert_eq!(assembler.buffer_len(), 1 + 2 + 1 + 3);
        assert_eq!(assembler.state(), AssemblerState::Accumulating);

        let result = assembler.process_packet(&fragment(4, 0, &[]));
        let expected = vec![0xA0, 0xA2, 0xA2, 0xA1, 0xA3, 0xA3, 0xA3];
        assert_eq!(
            result,
            ProcessResult::FrameStarted {
                frame_id: 4,
                previous: FinalizeDecision::TooShort(7),
            }
        );
        // Same bytes with a lower threshold are finalized intact
        let mut assembler = FrameAssembler::with_options(0, MergePolicy::Faithful);
        assembler.process_packet(&fragment(3, 0, &[0xA0]));
        assembler.process_packet(&fragment(3, 2, &[0xA2, 0xA2]));
        assembler.process_packet(&fragment(3, 1, &[0xA1]));
        assembler.process_packet(&fragment(3, 3, &[0xA3, 0xA3, 0xA3]));
        assert_eq!(
            assembler.process_packet(&fragment(4, 0, &[])),
            ProcessResult::FrameStarted {
                frame_id: 4,
                previous: FinalizeDecision::Finalized(expected),
            }
        );
    }

    #[test]
    fn test_first_start_discards_empty_buffer() {
        let mut assembler = FrameAssembler::new();

        let result = assembler.process_packet(&fragment(10, 0, &[1, 2, 3, 4]));
        assert_eq!(
            result,
            ProcessResult::FrameStarted {
                frame_id: 10,
                previous: FinalizeDecision::TooShort(0),
            }
        );
        assert_eq!(assembler.buffer_len(), 4);
        assert_eq!(assembler.current_frame_id(), Some(10));
    }

    #[test]
    fn test_min_frame_len_boundary() {
        let mut assembler = FrameAssembler::new();

        // Exactly 8 bytes is not enough
        assembler.process_packet(&fragment(1, 0, &[0u8; 8]));
        let result = assembler.process_packet(&fragment(2, 0, &[0u8; 9]));
        assert!(matches!(
            result,
            ProcessResult::FrameStarted {
                previous: FinalizeDecision::TooShort(8),
                ..
            }
        ));

        // 9 bytes is
        let result = assembler.process_packet(&fragment(3, 0, &[]));
        assert!(matches!(
            result,
            ProcessResult::FrameStarted {
                previous: FinalizeDecision::Finalized(ref f),
                ..
            } if f.len() == 9
        ));
    }

    #[test]
    fn test_buffer_reset_on_each_start() {
        let mut assembler = FrameAssembler::new();
        assembler.process_packet(&fragment(1, 0, &[1u8; 20]));
        assembler.process_packet(&fragment(1, 1, &[2u8; 20]));
        assembler.process_packet(&fragment(2, 0, &[3u8; 5]));

        assert_eq!(assembler.buffer_len(), 5);
    }

    #[test]
    fn test_lost_start_merges_by_default() {
        let mut assembler = FrameAssembler::new();
        assembler.process_packet(&fragment(1, 0, &[1u8; 10]));
        assembler.process_packet(&fragment(1, 1, &[1u8; 10]));
        // Frame 2 start lost, its continuation lands in frame 1's buffer
        assembler.process_packet(&fragment(2, 1, &[2u8; 10]));

        let result = assembler.process_packet(&fragment(3, 0, &[]));
        match result {
            ProcessResult::FrameStarted {
                previous: FinalizeDecision::Finalized(frame),
                ..
            } => {
                assert_eq!(frame.len(), 30);
                assert_eq!(&frame[20..], &[2u8; 10]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_lost_start_discarded_with_policy() {
        let mut assembler = FrameAssembler::with_options(8, MergePolicy::DiscardMerged);
        assembler.process_packet(&fragment(1, 0, &[1u8; 10]));
        assembler.process_packet(&fragment(2, 1, &[2u8; 10]));

        assert_eq!(
            assembler.process_packet(&fragment(3, 0, &[3u8; 10])),
            ProcessResult::FrameStarted {
                frame_id: 3,
                previous: FinalizeDecision::Merged(20),
            }
        );

        // Merge flag does not leak into the next frame
        assembler.process_packet(&fragment(3, 1, &[3u8; 10]));
        assert!(matches!(
            assembler.process_packet(&fragment(4, 0, &[])),
            ProcessResult::FrameStarted {
                previous: FinalizeDecision::Finalized(_),
                ..
            }
        ));
    }

    #[test]
    fn test_orphan_fragments_before_any_start() {
        let mut assembler = FrameAssembler::with_options(8, MergePolicy::DiscardMerged);
        assembler.process_packet(&fragment(7, 3, &[0u8; 50]));

        assert_eq!(assembler.state(), AssemblerState::Accumulating);
        assert!(matches!(
            assembler.process_packet(&fragment(8, 0, &[])),
            ProcessResult::FrameStarted {
                previous: FinalizeDecision::Merged(50),
                ..
            }
        ));
    }

    #[test]
    fn test_frame_id_wraps() {
        let mut assembler = FrameAssembler::new();
        assembler.process_packet(&fragment(u16::MAX, 0, &[1u8; 16]));
        let result = assembler.process_packet(&fragment(0, 0, &[]));

        assert!(matches!(
            result,
            ProcessResult::FrameStarted {
                frame_id: 0,
                previous: FinalizeDecision::Finalized(_),
            }
        ));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut assembler = FrameAssembler::new();
        assembler.process_packet(&fragment(5, 0, &[0x42; 12]));
        assembler.process_packet(&fragment(6, 2, &[0x42; 12]));

        assembler.reset();

        assert_eq!(assembler.state(), AssemblerState::Idle);
        assert_eq!(assembler.buffer_len(), 0);
        assert_eq!(assembler.current_frame_id(), None);
        assert!(!assembler.merged);
    }

    #[test]
    fn test_merge_policy_from_env_str() {
        assert_eq!(MergePolicy::from_env_str("faithful"), MergePolicy::Faithful);
        assert_eq!(
            MergePolicy::from_env_str("DISCARD"),
            MergePolicy::DiscardMerged
        );
        assert_eq!(
            MergePolicy::from_env_str("discard-merged"),
            MergePolicy::DiscardMerged
        );
        assert_eq!(MergePolicy::from_env_str("bogus"), MergePolicy::Faithful);
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::test_utils::{encode_test_jpeg, is_jpeg_data, FragmentGenerator, Rgb};

    #[test]
    fn test_jpeg_frame_assembly_from_fragments() {
        let jpeg = encode_test_jpeg(32, 24, Rgb::BLUE);
        let mut gen = FragmentGenerator::new(100);
        let mut assembler = FrameAssembler::new();

        let mut packets = gen.fragment_frame(&jpeg);
        assert!(packets.len() > 1, "Expected several fragments");
        packets.extend(gen.fragment_frame(&[0u8; 4]));

        let mut frames = Vec::new();
        for packet in &packets {
            if let ProcessResult::FrameStarted {
                previous: FinalizeDecision::Finalized(frame),
                ..
            } = assembler.process_packet(packet)
            {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 1, "Expected exactly 1 frame");
        assert_eq!(frames[0], jpeg);
        assert!(is_jpeg_data(&frames[0]));
    }

    #[test]
    fn test_multiple_frames() {
        let mut gen = FragmentGenerator::new(64);
        let mut assembler = FrameAssembler::new();

        let colors = [Rgb::RED, Rgb::GREEN, Rgb::BLUE];
        let encoded: Vec<Vec<u8>> = colors
            .iter()
            .map(|c| encode_test_jpeg(16, 16, *c))
            .collect();

        let mut packets = Vec::new();
        for jpeg in &encoded {
            packets.extend(gen.fragment_frame(jpeg));
        }
        packets.extend(gen.fragment_frame(&[]));

        let mut frames = Vec::new();
        for packet in &packets {
            if let ProcessResult::FrameStarted {
                previous: FinalizeDecision::Finalized(frame),
                ..
            } = assembler.process_packet(packet)
            {
                frames.push(frame);
            }
        }

        assert_eq!(frames, encoded);
    }
}
