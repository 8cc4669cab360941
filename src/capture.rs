//! Datagram capture for offline analysis and replay testing.
//!
//! Records every datagram the stream socket delivers, with its arrival time,
//! so a session can be replayed later without the camera.
//!
//! # File Format
//!
//! - `capture_<ts>.bin`: sequence of `[u64 LE: timestamp_us][u32 LE: length][bytes: data]...`
//! - `capture_<ts>.json`: session and counter metadata
//!
//! Timestamps are microseconds since the capture started.
//!
//! # Example
//!
//! ```ignore
//! let capture = Arc::new(CaptureState::new());
//! capture.start_capture(CaptureMetadata::for_session(&config))?;
//!
//! let session = StreamSession::start(config, Some(Arc::clone(&capture)))?;
//! // ...
//! let result = capture.stop_capture(Path::new("/output"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

use crate::config::SessionConfig;

/// Bytes preceding each datagram in the capture file
const RECORD_HEADER_LEN: usize = 12;

/// Errors that can occur during capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture is not currently active when trying to stop.
    #[error("capture is not active")]
    NotActive,

    /// Capture is already active when trying to start.
    #[error("capture is already active")]
    AlreadyActive,

    /// Failed to acquire lock on internal state.
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// Capture file ends in the middle of a record.
    #[error("truncated record at offset {offset}")]
    Truncated {
        /// Byte offset of the incomplete record
        offset: u64,
    },
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata about the capture session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Camera command endpoint, e.g. `192.168.29.1:20000`.
    #[serde(default)]
    pub peer: String,
    /// Local port the stream was received on.
    #[serde(default)]
    pub stream_port: u16,
    /// Total number of datagrams captured.
    #[serde(default)]
    pub total_packets: u64,
    /// Total number of frames finalized while capturing.
    #[serde(default)]
    pub total_frames: u64,
    /// Capture duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Total bytes captured.
    #[serde(default)]
    pub total_bytes: u64,
    /// Optional description or notes about the capture.
    #[serde(default)]
    pub description: String,
}

impl CaptureMetadata {
    /// Metadata pre-filled with the session's endpoints
    pub fn for_session(config: &SessionConfig) -> Self {
        Self {
            peer: config.peer.to_string(),
            stream_port: config.stream_port,
            ..Default::default()
        }
    }
}

/// Result returned when capture stops successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the saved datagram file.
    pub packets_path: PathBuf,
    /// Path to the saved metadata file.
    pub metadata_path: PathBuf,
    /// Summary of the capture session.
    pub metadata: CaptureMetadata,
}

/// A datagram read back from a capture file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    /// Arrival time relative to capture start (microseconds).
    pub timestamp_us: u64,
    /// Raw datagram, header included.
    pub data: Vec<u8>,
}

/// Thread-safe state for recording datagrams.
///
/// The receive worker calls [`CaptureState::record_packet`] on its hot path;
/// the counters are atomic so status queries never contend with it.
#[derive(Debug)]
pub struct CaptureState {
    /// Whether capture is currently active.
    is_capturing: AtomicBool,
    /// Captured datagrams with their timestamps.
    packets: Mutex<Vec<CapturedPacket>>,
    /// When the capture started.
    start_time: Mutex<Option<Instant>>,
    /// Metadata about the capture session.
    metadata: Mutex<CaptureMetadata>,
    packet_count: AtomicU64,
    byte_count: AtomicU64,
    frame_count: AtomicU64,
}

impl CaptureState {
    /// Creates a new capture state with no active capture.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_capturing: AtomicBool::new(false),
            packets: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            packet_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
            frame_count: AtomicU64::new(0),
        }
    }

    /// Returns whether capture is currently active.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::Acquire)
    }

    /// Returns the current datagram count (lock-free).
    #[must_use]
    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }

    /// Returns the current byte count (lock-free).
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Returns the number of frames finalized while capturing (lock-free).
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Starts a new capture session.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::AlreadyActive` if a capture is already in progress.
    /// Returns `CaptureError::LockError` if the internal mutex cannot be acquired.
    pub fn start_capture(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        self.packets
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .clear();

        self.packet_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);
        self.frame_count.store(0, Ordering::Release);

        *self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = Some(Instant::now());
        *self
            .metadata
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = metadata;

        log::info!("Datagram capture started");
        Ok(())
    }

    /// Records a datagram. Ignored when no capture is active.
    pub fn record_packet(&self, packet: &[u8]) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        let timestamp_us = self
            .start_time
            .lock()
            .ok()
            .and_then(|start| *start)
            .map_or(0, |start| start.elapsed().as_micros() as u64);

        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count
            .fetch_add(packet.len() as u64, Ordering::Relaxed);

        if let Ok(mut packets) = self.packets.lock() {
            packets.push(CapturedPacket {
                timestamp_us,
                data: packet.to_vec(),
            });
        } else {
            log::warn!("Failed to acquire lock for packet recording");
        }
    }

    /// Counts a finalized frame. Ignored when no capture is active.
    pub fn record_frame(&self) {
        if self.is_capturing.load(Ordering::Acquire) {
            self.frame_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stops the capture and saves it to `output_dir`.
    ///
    /// A missing `output_dir` leaves the capture running, so the call can be
    /// retried once the directory exists.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NotActive` if no capture is in progress.
    /// Returns `CaptureError::DirectoryNotFound` if the output directory doesn't exist.
    /// Returns `CaptureError::Io` if file operations fail.
    /// Returns `CaptureError::Json` if metadata serialization fails.
    pub fn stop_capture(&self, output_dir: &Path) -> Result<CaptureResult> {
        if !self.is_capturing() {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        if self
            .is_capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        let duration_ms = self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .map_or(0, |t| t.elapsed().as_millis() as u64);

        let metadata = {
            let mut meta = self
                .metadata
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?;
            meta.duration_ms = duration_ms;
            meta.total_packets = self.packet_count.load(Ordering::Acquire);
            meta.total_bytes = self.byte_count.load(Ordering::Acquire);
            meta.total_frames = self.frame_count.load(Ordering::Acquire);
            meta.clone()
        };

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let packets_path = output_dir.join(format!("capture_{}.bin", timestamp));
        let metadata_path = output_dir.join(format!("capture_{}.json", timestamp));

        let packets = std::mem::take(
            &mut *self
                .packets
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?,
        );
        write_packets(&packets_path, &packets)?;
        write_metadata(&metadata_path, &metadata)?;

        log::info!(
            "Capture stopped: {} datagrams, {} bytes, {} frames, {} ms",
            metadata.total_packets,
            metadata.total_bytes,
            metadata.total_frames,
            duration_ms
        );

        Ok(CaptureResult {
            packets_path,
            metadata_path,
            metadata,
        })
    }

    /// Cancels the current capture without saving.
    pub fn cancel_capture(&self) {
        self.is_capturing.store(false, Ordering::Release);
        if let Ok(mut packets) = self.packets.lock() {
            packets.clear();
        }
        log::info!("Capture cancelled");
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes datagrams in the capture file format.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be written.
pub fn write_packets(path: &Path, packets: &[CapturedPacket]) -> Result<()> {
    let mut file = BufWriter::new(std::fs::File::create(path)?);

    for packet in packets {
        file.write_all(&packet.timestamp_us.to_le_bytes())?;
        file.write_all(&(packet.data.len() as u32).to_le_bytes())?;
        file.write_all(&packet.data)?;
    }

    file.flush()?;
    log::debug!("Saved {} datagrams to {}", packets.len(), path.display());
    Ok(())
}

/// Writes capture metadata as pretty JSON.
///
/// # Errors
///
/// Returns `CaptureError::Json` or `CaptureError::Io` on failure.
pub fn write_metadata(path: &Path, metadata: &CaptureMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)?;
    log::debug!("Saved metadata to {}", path.display());
    Ok(())
}

/// Reads datagrams from a capture file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read and
/// `CaptureError::Truncated` if it ends inside a record.
pub fn read_packets(path: &Path) -> Result<Vec<CapturedPacket>> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;

    let mut packets = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let truncated = CaptureError::Truncated {
            offset: offset as u64,
        };
        let header = bytes
            .get(offset..offset + RECORD_HEADER_LEN)
            .ok_or(truncated)?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&header[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[8..]);
        let len = u32::from_le_bytes(len) as usize;

        let start = offset + RECORD_HEADER_LEN;
        let data = bytes
            .get(start..start + len)
            .ok_or(CaptureError::Truncated {
                offset: offset as u64,
            })?;

        packets.push(CapturedPacket {
            timestamp_us: u64::from_le_bytes(ts),
            data: data.to_vec(),
        });
        offset = start + len;
    }

    Ok(packets)
}

/// Reads capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    let metadata: CaptureMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}
