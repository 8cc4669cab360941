//! Error types shared by the receive pipeline.

use std::io;
use thiserror::Error;

/// Errors that end a streaming session.
///
/// Every variant is terminal for the worker: the session moves to
/// [`SessionState::Failed`](crate::session::SessionState::Failed) and the
/// error is handed back to whoever joins it.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The outbound command socket could not be created or connected.
    #[error("control socket to {peer} failed: {source}")]
    ControlSocket {
        /// Peer address the socket was being connected to.
        peer: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The inbound stream socket could not be created, bound or configured.
    #[error("stream socket on port {port} failed: {source}")]
    StreamSocket {
        /// Local port the socket was being bound to.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A zero-length read on the stream socket.
    #[error("stream peer closed the connection")]
    PeerClosed,

    /// The session was already stopped or joined.
    #[error("session is not running")]
    NotRunning,

    /// The worker thread panicked.
    #[error("worker thread panicked")]
    WorkerPanicked,
}

/// Errors from parsing a fragment header.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Datagram is shorter than the fixed header.
    #[error("datagram too short: {len} bytes")]
    TooShort {
        /// Actual datagram length.
        len: usize,
    },
}

/// Errors from decoding a finalized frame.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The image codec rejected the byte sequence.
    #[error("invalid image: {0}")]
    Image(#[from] image::ImageError),

    /// The decoded image has a zero dimension.
    #[error("decoded image is empty ({width}x{height})")]
    Empty {
        /// Decoded width.
        width: u32,
        /// Decoded height.
        height: u32,
    },
}
