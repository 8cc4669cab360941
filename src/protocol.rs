//! JHCMD wire protocol
//!
//! The microscope speaks two tiny protocols over UDP:
//!
//! - **Commands** (host → device, port 20000): 7-byte strings, `"JHCMD"`
//!   followed by two opaque bytes. The device never answers.
//! - **Fragments** (device → host, port 10900): an 8-byte header followed by a
//!   slice of an encoded JPEG frame.
//!
//! Fragment header layout:
//! - Bytes 0-1: frame id (little-endian, wraps at 65536)
//! - Byte 2: reserved
//! - Byte 3: fragment index (0 = first fragment of a new frame)
//! - Bytes 4-7: reserved

use crate::error::ParseError;

/// Command prefix shared by every control message
pub const COMMAND_PREFIX: &[u8; 5] = b"JHCMD";

/// Length of every control message
pub const COMMAND_LEN: usize = 7;

/// Fixed fragment header length
pub const HEADER_LEN: usize = 8;

/// Largest datagram the device has been observed to send
pub const MAX_DATAGRAM_LEN: usize = 1450;

/// Control commands understood by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Begin a session (`JHCMD 10 00`)
    BeginSession,
    /// Begin streaming (`JHCMD 20 00`)
    BeginStream,
    /// Keep the stream alive (`JHCMD d0 01`)
    Heartbeat,
    /// Stop streaming (`JHCMD d0 02`)
    StopStream,
}

impl Command {
    /// Serialize the command to its 7-byte wire form
    pub fn to_bytes(self) -> [u8; COMMAND_LEN] {
        let (a, b) = match self {
            Command::BeginSession => (0x10, 0x00),
            Command::BeginStream => (0x20, 0x00),
            Command::Heartbeat => (0xD0, 0x01),
            Command::StopStream => (0xD0, 0x02),
        };
        let mut bytes = [0u8; COMMAND_LEN];
        bytes[..COMMAND_PREFIX.len()].copy_from_slice(COMMAND_PREFIX);
        bytes[5] = a;
        bytes[6] = b;
        bytes
    }

    /// Commands sent once when a session starts, in order.
    ///
    /// The heartbeat is sent twice back-to-back.
    pub const STARTUP: [Command; 4] = [
        Command::BeginSession,
        Command::BeginStream,
        Command::Heartbeat,
        Command::Heartbeat,
    ];
}

/// Parsed fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Frame this fragment belongs to
    pub frame_id: u16,
    /// Position of the fragment within its frame
    pub fragment_index: u8,
}

impl FragmentHeader {
    /// Whether this fragment starts a new frame
    #[inline]
    pub fn starts_frame(&self) -> bool {
        self.fragment_index == 0
    }
}

/// Split a datagram into its header and payload
///
/// A datagram of exactly [`HEADER_LEN`] bytes is valid and carries an empty
/// payload.
///
/// # Errors
///
/// Returns [`ParseError::TooShort`] if the datagram is shorter than the header.
#[inline]
pub fn parse_fragment(datagram: &[u8]) -> Result<(FragmentHeader, &[u8]), ParseError> {
    if datagram.len() < HEADER_LEN {
        return Err(ParseError::TooShort {
            len: datagram.len(),
        });
    }

    let header = FragmentHeader {
        frame_id: u16::from_le_bytes([datagram[0], datagram[1]]),
        fragment_index: datagram[3],
    };

    Ok((header, &datagram[HEADER_LEN..]))
}

/// Build a datagram from a header and payload (inverse of [`parse_fragment`])
pub fn encode_fragment(header: FragmentHeader, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
    datagram.extend_from_slice(&header.frame_id.to_le_bytes());
    datagram.push(0); // reserved
    datagram.push(header.fragment_index);
    datagram.extend_from_slice(&[0u8; 4]); // reserved
    datagram.extend_from_slice(payload);
    datagram
}
