//! `wifi-scope` - Receiver for JHCMD WiFi microscope video
//!
//! Drives the camera's command channel, reassembles the fragmented JPEG
//! stream it sends back, decodes each frame to a fixed-size pixel buffer and
//! hands it to a display consumer through a bounded queue.

pub mod capture;
pub mod config;
pub mod decoder;
pub mod error;
pub mod frame_assembler;
pub mod handoff;
pub mod net;
pub mod protocol;
pub mod replay;
pub mod session;
pub mod test_utils;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::{CaptureMetadata, CaptureState};
use crate::config::SessionConfig;
use crate::decoder::DecodedImage;
use crate::net::DiscardSink;
use crate::replay::{DatagramReplay, ReplayConfig};
use crate::session::StreamSession;

/// Replay a capture file instead of talking to the camera
const REPLAY_ENV: &str = "WIFISCOPE_REPLAY";

/// Replay speed multiplier (0 = as fast as possible)
const REPLAY_SPEED_ENV: &str = "WIFISCOPE_REPLAY_SPEED";

/// Record the received datagrams into this directory
const CAPTURE_DIR_ENV: &str = "WIFISCOPE_CAPTURE_DIR";

/// Display refresh period
const REDRAW_INTERVAL: Duration = Duration::from_millis(50);

/// Build information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Application version from Cargo.toml
    pub version: String,
    /// Git commit hash (short)
    pub git_hash: String,
    /// Build timestamp
    pub build_time: String,
}

/// Get build information (version, git hash, build time)
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("BUILD_GIT_HASH").to_string(),
        build_time: env!("BUILD_TIMESTAMP").to_string(),
    }
}

/// What the display currently shows
#[derive(Debug)]
pub struct DisplayState {
    /// Most recently shown image
    pub frame: Option<DecodedImage>,
    /// Images shown since startup
    pub frames_shown: u64,
    /// When the last image was shown
    pub last_shown: Option<Instant>,
    report_started: Instant,
    report_frames: u64,
}

impl Default for DisplayState {
    fn default() -> Self {
        Self {
            frame: None,
            frames_shown: 0,
            last_shown: None,
            report_started: Instant::now(),
            report_frames: 0,
        }
    }
}

impl DisplayState {
    /// Time between frame-rate log lines
    const REPORT_INTERVAL: Duration = Duration::from_secs(5);

    /// Replace the displayed image
    pub fn show(&mut self, image: DecodedImage) {
        self.frame = Some(image);
        self.frames_shown += 1;
        self.report_frames += 1;
        self.last_shown = Some(Instant::now());

        let elapsed = self.report_started.elapsed();
        if elapsed >= Self::REPORT_INTERVAL {
            log::info!(
                "Displaying {:.1} fps ({} frames total)",
                self.report_frames as f64 / elapsed.as_secs_f64(),
                self.frames_shown
            );
            self.report_started = Instant::now();
            self.report_frames = 0;
        }
    }

    /// Show the next pending image, one per redraw tick
    ///
    /// Returns whether an image was taken.
    pub fn refresh(&mut self, session: &StreamSession) -> bool {
        match session.poll_latest() {
            Some(image) => {
                self.show(image);
                true
            }
            None => false,
        }
    }
}

/// Run the viewer
///
/// Initializes logging, starts a session against the camera (or a recorded
/// capture) and refreshes the display until the user presses Enter or the
/// session ends on its own.
///
/// # Errors
///
/// Returns an error if the sockets cannot be opened, a replay file cannot be
/// loaded, the capture cannot be saved, or the session fails.
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let info = build_info();
    log::info!(
        "wifi-scope {} ({}, built {}) starting up",
        info.version,
        info.git_hash,
        info.build_time
    );

    let config = SessionConfig::from_env();
    log::debug!("Session config: {:?}", config);

    let capture = match std::env::var_os(CAPTURE_DIR_ENV) {
        Some(dir) => {
            let dir = capture_dir(PathBuf::from(dir))?;
            let state = Arc::new(CaptureState::new());
            state.start_capture(CaptureMetadata::for_session(&config))?;
            Some((dir, state))
        }
        None => None,
    };
    let capture_state = capture.as_ref().map(|(_, state)| Arc::clone(state));

    let mut session = match std::env::var_os(REPLAY_ENV) {
        Some(path) => {
            let replay = DatagramReplay::load_with_config(Path::new(&path), replay_config())
                .with_context(|| format!("failed to load replay {}", Path::new(&path).display()))?;
            StreamSession::spawn(replay, DiscardSink, config, capture_state)
        }
        None => StreamSession::start(config, capture_state)
            .context("failed to open camera sockets")?,
    };

    let done = Arc::new(AtomicBool::new(false));
    spawn_done_listener(Arc::clone(&done));
    log::info!("Press Enter to stop");

    let mut display = DisplayState::default();
    while !done.load(Ordering::Acquire) && !session.state().is_terminal() {
        display.refresh(&session);
        std::thread::sleep(REDRAW_INTERVAL);
    }

    session.request_shutdown();
    let result = session.join();

    if let Some((dir, state)) = capture {
        let saved = state.stop_capture(&dir)?;
        log::info!("Capture saved to {}", saved.packets_path.display());
    }

    let stats = result.context("stream session failed")?;
    log::info!(
        "Stopped after {} frames shown: {}",
        display.frames_shown,
        serde_json::to_string(&stats)?
    );
    Ok(())
}

/// Check the capture directory up front so a bad path fails before recording
fn capture_dir(dir: PathBuf) -> anyhow::Result<PathBuf> {
    anyhow::ensure!(
        dir.is_dir(),
        "{} '{}' is not a directory",
        CAPTURE_DIR_ENV,
        dir.display()
    );
    Ok(dir)
}

fn replay_config() -> ReplayConfig {
    let speed = std::env::var(REPLAY_SPEED_ENV)
        .ok()
        .and_then(|s| match s.trim().parse::<f64>() {
            Ok(speed) => Some(speed),
            Err(_) => {
                log::warn!("Invalid {} '{}', replaying in real time", REPLAY_SPEED_ENV, s);
                None
            }
        })
        .unwrap_or(1.0);

    ReplayConfig {
        speed,
        ..Default::default()
    }
}

/// The "Done" control: a line on stdin sets `done`. EOF is ignored so a
/// detached stdin does not end the session immediately.
fn spawn_done_listener(done: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) => log::debug!("stdin closed, stop control disabled"),
            Ok(_) => {
                log::info!("Stop requested");
                done.store(true, Ordering::Release);
            }
            Err(e) => log::warn!("Failed to read stdin: {}", e),
        }
    });
}
