//! Datagram replay for testing without the camera.
//!
//! Loads a capture written by [`crate::capture`] and feeds it back to the
//! receive worker as a [`DatagramSource`], honouring the recorded timing.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use wifi_scope_lib::replay::{DatagramReplay, ReplayConfig};
//! use wifi_scope_lib::net::DiscardSink;
//! use wifi_scope_lib::session::StreamSession;
//!
//! let replay = DatagramReplay::load_with_config(
//!     Path::new("capture_20240101_120000.000.bin"),
//!     ReplayConfig { speed: 2.0, ..Default::default() },
//! )?;
//! let session = StreamSession::spawn(replay, DiscardSink, config, None);
//! ```

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::{read_metadata, read_packets, CaptureError, CaptureMetadata, CapturedPacket};
use crate::frame_assembler::{FinalizeDecision, FrameAssembler, ProcessResult};
use crate::net::{DatagramSource, Received};

/// Errors that can occur when loading a capture for replay.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// The capture file could not be read or parsed.
    #[error("failed to load capture: {0}")]
    Capture(#[from] CaptureError),

    /// The capture contains no datagrams.
    #[error("capture is empty")]
    Empty,
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for datagram replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Playback speed multiplier (1.0 = realtime, 2.0 = 2x speed, 0.0 = as fast as possible).
    pub speed: f64,
    /// Whether to loop the replay when reaching the end.
    pub loop_playback: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_playback: false,
        }
    }
}

impl ReplayConfig {
    /// Replay without pacing
    pub fn unpaced() -> Self {
        Self {
            speed: 0.0,
            ..Default::default()
        }
    }

    /// Whether datagrams are held back until their recorded time
    fn is_paced(&self) -> bool {
        self.speed.is_finite() && self.speed > 0.0
    }
}

/// A loaded capture, replayed one datagram per poll.
#[derive(Debug)]
pub struct DatagramReplay {
    packets: Vec<CapturedPacket>,
    metadata: Option<CaptureMetadata>,
    config: ReplayConfig,
    cursor: usize,
    started: Option<Instant>,
    loops: u64,
}

impl DatagramReplay {
    /// Load a capture file, plus its companion `.json` metadata if present.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Capture` if the file cannot be read or is
    /// truncated, and `ReplayError::Empty` if it holds no datagrams.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_config(path, ReplayConfig::default())
    }

    /// Load a capture file with a custom configuration.
    ///
    /// # Errors
    ///
    /// Same as [`DatagramReplay::load`].
    pub fn load_with_config(path: &Path, config: ReplayConfig) -> Result<Self> {
        let packets = read_packets(path)?;
        if packets.is_empty() {
            return Err(ReplayError::Empty);
        }

        let metadata = try_load_metadata(path);
        log::info!("Loaded {} datagrams from {}", packets.len(), path.display());
        if let Some(ref meta) = metadata {
            log::info!(
                "Metadata: peer {}, port {}, {} frames, {} ms",
                meta.peer,
                meta.stream_port,
                meta.total_frames,
                meta.duration_ms
            );
        }

        Ok(Self::from_packets(packets, metadata, config))
    }

    /// Replay datagrams already in memory
    pub fn from_packets(
        packets: Vec<CapturedPacket>,
        metadata: Option<CaptureMetadata>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            packets,
            metadata,
            config,
            cursor: 0,
            started: None,
            loops: 0,
        }
    }

    /// Get the loaded metadata, if available.
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Get the number of loaded datagrams.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Get the total duration of the capture in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.packets.last().map_or(0, |p| p.timestamp_us / 1000)
    }

    /// Completed passes over the capture (only grows when looping).
    #[must_use]
    pub fn loops(&self) -> u64 {
        self.loops
    }

    /// Time at which the datagram at `cursor` is due, relative to start
    fn due_at(&self, packet: &CapturedPacket) -> Duration {
        Duration::from_micros((packet.timestamp_us as f64 / self.config.speed) as u64)
    }
}

impl DatagramSource for DatagramReplay {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        if self.cursor >= self.packets.len() {
            if !self.config.loop_playback || self.packets.is_empty() {
                return Ok(Received::Exhausted);
            }
            log::debug!("Replay loop completed, restarting");
            self.loops += 1;
            self.cursor = 0;
            self.started = None;
        }

        let started = *self.started.get_or_insert_with(Instant::now);
        let packet = &self.packets[self.cursor];

        if self.config.is_paced() && started.elapsed() < self.due_at(packet) {
            return Ok(Received::WouldBlock);
        }

        let len = packet.data.len().min(buf.len());
        buf[..len].copy_from_slice(&packet.data[..len]);
        self.cursor += 1;
        Ok(Received::Datagram(len))
    }
}

/// Try to load metadata from the companion `.json` file.
fn try_load_metadata(path: &Path) -> Option<CaptureMetadata> {
    let json_path = path.with_extension("json");
    if !json_path.exists() {
        return None;
    }
    match read_metadata(&json_path) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::warn!("Ignoring metadata {}: {}", json_path.display(), e);
            None
        }
    }
}

/// Synchronous replay: assemble every frame in a capture, without timing.
///
/// Only buffers that would be handed to the decoder are returned; the last
/// frame in the file is never finalized because no start marker follows it.
///
/// # Errors
///
/// Returns `ReplayError` if the file cannot be loaded.
pub fn replay_all_frames(path: &Path) -> Result<Vec<Vec<u8>>> {
    Ok(FrameIterator::new(path)?.collect())
}

/// Replay a capture and yield finalized frames lazily.
pub struct FrameIterator {
    packets: std::vec::IntoIter<CapturedPacket>,
    assembler: FrameAssembler,
}

impl FrameIterator {
    /// Create a frame iterator from a capture file.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError` if the file cannot be loaded.
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_assembler(path, FrameAssembler::new())
    }

    /// Create with a custom assembler (e.g. a different merge policy).
    ///
    /// # Errors
    ///
    /// Returns `ReplayError` if the file cannot be loaded.
    pub fn with_assembler(path: &Path, assembler: FrameAssembler) -> Result<Self> {
        let packets = read_packets(path)?;
        Ok(Self {
            packets: packets.into_iter(),
            assembler,
        })
    }
}

impl Iterator for FrameIterator {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let packet = self.packets.next()?;
            if let ProcessResult::FrameStarted {
                previous: FinalizeDecision::Finalized(frame),
                ..
            } = self.assembler.process_packet(&packet.data)
            {
                return Some(frame);
            }
        }
    }
}
