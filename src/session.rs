//! Streaming session: the receive worker and its supervisor handle
//!
//! [`StreamWorker`] owns everything on the network side (control sink,
//! datagram source, frame assembler, decoder) and runs on one dedicated
//! thread. [`StreamSession`] is the handle the display side keeps: it polls
//! decoded images, requests shutdown and collects the worker's outcome.
//!
//! ```text
//! DatagramSource → FrameAssembler → FrameDecoder → HandoffQueue → consumer
//!                        ↓
//!                 heartbeat (frame_id % 25 == 0) → CommandSink
//! ```
//!
//! Fatal conditions (socket setup failures, a zero-length read) end the
//! worker in [`SessionState::Failed`] and are returned from
//! [`StreamSession::join`]; the caller decides whether to exit or restart.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::capture::CaptureState;
use crate::config::SessionConfig;
use crate::decoder::{DecodedImage, FrameDecoder};
use crate::error::SessionError;
use crate::frame_assembler::{FinalizeDecision, FrameAssembler, ProcessResult};
use crate::handoff::HandoffQueue;
use crate::net::{CommandSink, ControlChannel, DatagramSource, Received, StreamSocket};
use crate::protocol::Command;

/// Log a progress line every this many queued frames
const PROGRESS_LOG_INTERVAL: u64 = 250;

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Sockets open, startup commands not yet sent
    Starting,
    /// Receive loop active
    Running,
    /// Loop exited on request or end of input
    Stopped,
    /// Loop exited on a fatal error
    Failed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    /// Whether the worker has exited
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Lock-free state shared between the worker and its handle
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Running counters updated by the worker (lock-free)
#[derive(Debug, Default)]
pub struct SessionStats {
    datagrams: AtomicU64,
    bytes: AtomicU64,
    malformed: AtomicU64,
    recv_errors: AtomicU64,
    frames_started: AtomicU64,
    frames_finalized: AtomicU64,
    short_discards: AtomicU64,
    merged_discards: AtomicU64,
    decode_failures: AtomicU64,
    rate_limited: AtomicU64,
    frames_queued: AtomicU64,
    frames_evicted: AtomicU64,
    heartbeats: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Datagrams received
    pub datagrams: u64,
    /// Bytes received
    pub bytes: u64,
    /// Datagrams shorter than the fragment header
    pub malformed: u64,
    /// Transient receive errors
    pub recv_errors: u64,
    /// Index-zero fragments seen
    pub frames_started: u64,
    /// Buffers handed to the decoder path
    pub frames_finalized: u64,
    /// Buffers too short to decode
    pub short_discards: u64,
    /// Buffers dropped for mixing frames
    pub merged_discards: u64,
    /// Buffers the decoder rejected
    pub decode_failures: u64,
    /// Buffers skipped by the frame-rate limit
    pub rate_limited: u64,
    /// Images pushed to the hand-off queue
    pub frames_queued: u64,
    /// Images evicted from a full hand-off queue
    pub frames_evicted: u64,
    /// Heartbeats sent after startup
    pub heartbeats: u64,
}

impl SessionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            datagrams: load(&self.datagrams),
            bytes: load(&self.bytes),
            malformed: load(&self.malformed),
            recv_errors: load(&self.recv_errors),
            frames_started: load(&self.frames_started),
            frames_finalized: load(&self.frames_finalized),
            short_discards: load(&self.short_discards),
            merged_discards: load(&self.merged_discards),
            decode_failures: load(&self.decode_failures),
            rate_limited: load(&self.rate_limited),
            frames_queued: load(&self.frames_queued),
            frames_evicted: load(&self.frames_evicted),
            heartbeats: load(&self.heartbeats),
        }
    }
}

/// Outcome of one [`StreamWorker::poll_once`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing was pending (or a transient error was swallowed)
    Idle,
    /// One datagram was processed
    Datagram,
    /// The source is finished
    Exhausted,
}

/// The receive loop and everything it owns
pub struct StreamWorker<S, C> {
    source: S,
    sink: C,
    assembler: FrameAssembler,
    decoder: FrameDecoder,
    queue: Arc<HandoffQueue<DecodedImage>>,
    stats: Arc<SessionStats>,
    capture: Option<Arc<CaptureState>>,
    heartbeat_interval: u16,
    min_frame_interval: Option<Duration>,
    idle_backoff: Duration,
    last_queued: Option<Instant>,
    recv_buf: Vec<u8>,
}

impl<S: DatagramSource, C: CommandSink> StreamWorker<S, C> {
    /// Build a worker publishing into `queue`
    pub fn new(
        source: S,
        sink: C,
        config: &SessionConfig,
        queue: Arc<HandoffQueue<DecodedImage>>,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            source,
            sink,
            assembler: FrameAssembler::with_options(config.min_frame_len, config.merge_policy),
            decoder: FrameDecoder::new(
                config.output_width,
                config.output_height,
                config.channel_order,
            ),
            queue,
            stats,
            capture: None,
            heartbeat_interval: config.heartbeat_interval,
            min_frame_interval: config.min_frame_interval(),
            idle_backoff: config.idle_backoff,
            last_queued: None,
            recv_buf: vec![0u8; config.max_datagram_len.max(1)],
        }
    }

    /// Record every received datagram into `capture`
    pub fn with_capture(mut self, capture: Arc<CaptureState>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// The frame assembler (for inspection)
    pub fn assembler(&self) -> &FrameAssembler {
        &self.assembler
    }

    /// The command sink (for inspection)
    pub fn sink(&self) -> &C {
        &self.sink
    }

    /// Send the session start sequence
    pub fn start(&mut self) {
        for command in Command::STARTUP {
            self.send(command);
        }
        log::info!("Startup commands sent, waiting for stream");
    }

    /// Send the stop command
    pub fn stop(&mut self) {
        self.send(Command::StopStream);
    }

    /// Poll the source once and process at most one datagram
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PeerClosed`] on a zero-length read.
    pub fn poll_once(&mut self) -> Result<Step, SessionError> {
        let len = match self.source.recv_datagram(&mut self.recv_buf) {
            Ok(Received::Datagram(len)) => len,
            Ok(Received::WouldBlock) => return Ok(Step::Idle),
            Ok(Received::Exhausted) => return Ok(Step::Exhausted),
            Ok(Received::Closed) => return Err(SessionError::PeerClosed),
            Err(e) => {
                SessionStats::bump(&self.stats.recv_errors);
                log::trace!("Receive error (ignored): {}", e);
                return Ok(Step::Idle);
            }
        };

        let datagram = &self.recv_buf[..len];
        SessionStats::bump(&self.stats.datagrams);
        self.stats.bytes.fetch_add(len as u64, Ordering::Relaxed);
        if let Some(capture) = &self.capture {
            capture.record_packet(datagram);
        }

        match self.assembler.process_packet(datagram) {
            ProcessResult::Accumulating => {}
            ProcessResult::Skipped => SessionStats::bump(&self.stats.malformed),
            ProcessResult::FrameStarted { frame_id, previous } => {
                self.on_frame_started(frame_id, previous);
            }
        }

        Ok(Step::Datagram)
    }

    /// Run until `running` is cleared, the source is exhausted or a fatal
    /// error occurs. Sends the stop command on the way out.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that ended the loop.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), SessionError> {
        let mut result = Ok(());

        while running.load(Ordering::Acquire) {
            match self.poll_once() {
                Ok(Step::Datagram) => {}
                Ok(Step::Idle) => {
                    if !self.idle_backoff.is_zero() {
                        thread::sleep(self.idle_backoff);
                    }
                }
                Ok(Step::Exhausted) => {
                    log::info!("Datagram source exhausted");
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.stop();
        result
    }

    /// Keep-alive, then finalize-or-discard of the previous buffer
    fn on_frame_started(&mut self, frame_id: u16, previous: FinalizeDecision) {
        SessionStats::bump(&self.stats.frames_started);

        if self.heartbeat_interval > 0 && frame_id % self.heartbeat_interval == 0 {
            log::debug!("Heartbeat at frame {}", frame_id);
            self.send(Command::Heartbeat);
            SessionStats::bump(&self.stats.heartbeats);
        }

        let frame = match previous {
            FinalizeDecision::Finalized(frame) => frame,
            FinalizeDecision::TooShort(len) => {
                log::trace!("Discarding {} byte buffer before frame {}", len, frame_id);
                SessionStats::bump(&self.stats.short_discards);
                return;
            }
            FinalizeDecision::Merged(_) => {
                SessionStats::bump(&self.stats.merged_discards);
                return;
            }
        };

        SessionStats::bump(&self.stats.frames_finalized);
        if let Some(capture) = &self.capture {
            capture.record_frame();
        }

        if let (Some(interval), Some(last)) = (self.min_frame_interval, self.last_queued) {
            if last.elapsed() < interval {
                SessionStats::bump(&self.stats.rate_limited);
                return;
            }
        }

        match self.decoder.decode(&frame) {
            Ok(image) => {
                if self.queue.push(image).is_some() {
                    SessionStats::bump(&self.stats.frames_evicted);
                }
                self.last_queued = Some(Instant::now());
                let queued = self.stats.frames_queued.fetch_add(1, Ordering::Relaxed) + 1;
                if queued % PROGRESS_LOG_INTERVAL == 0 {
                    log::info!("Queued {} frames", queued);
                }
            }
            Err(e) => {
                SessionStats::bump(&self.stats.decode_failures);
                log::warn!("Invalid image, raw len {}: {}", frame.len(), e);
            }
        }
    }

    /// Fire-and-forget; the device never acknowledges
    fn send(&mut self, command: Command) {
        if let Err(e) = self.sink.send_command(command) {
            log::warn!("Failed to send {:?}: {}", command, e);
        }
    }
}

/// Handle to a running session, held by the display side
pub struct StreamSession {
    running: Arc<AtomicBool>,
    state: Arc<StateCell>,
    queue: Arc<HandoffQueue<DecodedImage>>,
    stats: Arc<SessionStats>,
    handle: Option<JoinHandle<Result<(), SessionError>>>,
}

impl StreamSession {
    /// Open the camera sockets and start the worker thread
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ControlSocket`] or [`SessionError::StreamSocket`]
    /// if either socket cannot be set up. No thread is started in that case.
    pub fn start(
        config: SessionConfig,
        capture: Option<Arc<CaptureState>>,
    ) -> Result<Self, SessionError> {
        let control = ControlChannel::open(config.peer)?;
        let stream = StreamSocket::bind(config.stream_port)?;
        log::info!("Listening on port {}...", config.stream_port);

        Ok(Self::spawn(stream, control, config, capture))
    }

    /// Start a worker thread over arbitrary endpoints
    pub fn spawn<S, C>(
        source: S,
        sink: C,
        config: SessionConfig,
        capture: Option<Arc<CaptureState>>,
    ) -> Self
    where
        S: DatagramSource + 'static,
        C: CommandSink + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(StateCell::new(SessionState::Starting));
        let queue = Arc::new(HandoffQueue::new(config.queue_capacity));
        let stats = Arc::new(SessionStats::default());

        let mut worker =
            StreamWorker::new(source, sink, &config, Arc::clone(&queue), Arc::clone(&stats));
        if let Some(capture) = capture {
            worker = worker.with_capture(capture);
        }

        let running_worker = Arc::clone(&running);
        let state_worker = Arc::clone(&state);
        let handle = thread::spawn(move || {
            worker.start();
            state_worker.set(SessionState::Running);

            let result = worker.run(&running_worker);
            match &result {
                Ok(()) => {
                    log::info!("Stream worker stopped");
                    state_worker.set(SessionState::Stopped);
                }
                Err(e) => {
                    log::error!("Stream worker failed: {}", e);
                    state_worker.set(SessionState::Failed);
                }
            }
            result
        });

        Self {
            running,
            state,
            queue,
            stats,
            handle: Some(handle),
        }
    }

    /// Take the oldest decoded image, if any; never blocks
    pub fn poll_latest(&self) -> Option<DecodedImage> {
        self.queue.try_pop()
    }

    /// Ask the worker to exit after its current iteration
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared hand-off queue (for consumers that want to wait on it)
    pub fn queue(&self) -> Arc<HandoffQueue<DecodedImage>> {
        Arc::clone(&self.queue)
    }

    /// Whether the worker thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Request shutdown and wait for the worker
    ///
    /// # Errors
    ///
    /// Returns the worker's fatal error, [`SessionError::WorkerPanicked`] if
    /// the thread panicked, or [`SessionError::NotRunning`] if already joined.
    pub fn join(&mut self) -> Result<StatsSnapshot, SessionError> {
        let handle = self.handle.take().ok_or(SessionError::NotRunning)?;
        self.request_shutdown();

        match handle.join() {
            Ok(result) => result.map(|()| self.stats.snapshot()),
            Err(_) => {
                self.state.set(SessionState::Failed);
                Err(SessionError::WorkerPanicked)
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.join();
        }
    }
}
