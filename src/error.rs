//! Error types for the speed test client.

use std::fmt;

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;

/// Structural WebSocket failures that indicate a server is incompatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// The peer sent a control frame with an unknown opcode.
    UnknownControlOpcode,
    /// A frame arrived with reserved bits set without a negotiated extension.
    InvalidReservedBits,
    /// The peer fragmented a control frame.
    FragmentedControlFrame,
    /// The opening handshake was refused with an HTTP error response.
    HandshakeRejected,
}

impl ProtocolErrorKind {
    /// Whether failover should abandon the remaining attempts against the
    /// server that produced this error. Frame-level violations will not get
    /// better on retry; a rejected handshake may (token expiry, transient
    /// overload), so it is retried like any other failure.
    pub fn skips_server(self) -> bool {
        matches!(
            self,
            ProtocolErrorKind::UnknownControlOpcode
                | ProtocolErrorKind::InvalidReservedBits
                | ProtocolErrorKind::FragmentedControlFrame
        )
    }
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolErrorKind::UnknownControlOpcode => "unknown control opcode",
            ProtocolErrorKind::InvalidReservedBits => "invalid reserved bits",
            ProtocolErrorKind::FragmentedControlFrame => "fragmented control frame",
            ProtocolErrorKind::HandshakeRejected => "handshake rejected",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while locating servers or running a measurement.
#[derive(Debug, Error)]
pub enum SpeedTestError {
    /// The server advertises no usable URL for the requested mode and test.
    #[error("no test URL for the requested mode on {0}")]
    InvalidTestUrl(String),
    /// The Locate API has no measurement servers to offer.
    #[error("measurement servers are out of capacity")]
    OutOfCapacity,
    /// The Locate API signaled that the client exceeded its quota.
    #[error("locate API rate limit exceeded")]
    RateLimited,
    /// The Locate API HTTP request failed.
    #[error("locate request failed: {0}")]
    Locate(#[from] reqwest::Error),
    /// The Locate API answered with an unexpected status code.
    #[error("locate API returned status {0}")]
    LocateStatus(reqwest::StatusCode),
    /// The driver ran out of servers without capturing a more specific error.
    #[error("no measurement servers available")]
    NoServersAvailable,
    /// A phase ended in a way that is not attributable to the transport.
    #[error("test failed: {0}")]
    TestFailed(String),
    /// A structural WebSocket-level error; retrying the same server may be pointless.
    #[error("websocket protocol error: {0}")]
    Protocol(ProtocolErrorKind),
    /// A TCP/TLS-level WebSocket error; treated as transient.
    #[error("websocket transport error: {0}")]
    Transport(Box<tungstenite::Error>),
    /// `start` was called while another session was still running.
    #[error("a measurement session is already running")]
    SessionActive,
    /// An operation exceeded its time limit.
    #[error("timeout occurred")]
    Timeout,
    /// The user cancelled the measurement.
    #[error("test cancelled")]
    Cancelled,
    /// JSON serialization or deserialization failed.
    #[error("serialize/deserialize error: {0}")]
    Json(#[from] serde_json::Error),
    /// The URL could not be parsed.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SpeedTestError {
    /// True when failover should skip the remaining attempts for this server.
    pub fn skips_server(&self) -> bool {
        matches!(self, SpeedTestError::Protocol(kind) if kind.skips_server())
    }
}

/// Fallback classification for transports that do not expose structured
/// error codes: match the error's human-readable message against the three
/// canonical frame-level violations.
pub(crate) fn protocol_kind_from_message(message: &str) -> Option<ProtocolErrorKind> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("unknown control") {
        Some(ProtocolErrorKind::UnknownControlOpcode)
    } else if lower.contains("reserved bit") {
        Some(ProtocolErrorKind::InvalidReservedBits)
    } else if lower.contains("fragmented control") || lower.contains("must not be fragmented") {
        Some(ProtocolErrorKind::FragmentedControlFrame)
    } else {
        None
    }
}

// Classifies on conversion: structured protocol variants first, the message
// fallback second, everything else is transport-level. The large tungstenite
// error is boxed to keep SpeedTestError small.
impl From<tungstenite::Error> for SpeedTestError {
    fn from(e: tungstenite::Error) -> Self {
        match &e {
            tungstenite::Error::Protocol(p) => match p {
                WsProtocolError::UnknownControlFrameType(_) => {
                    SpeedTestError::Protocol(ProtocolErrorKind::UnknownControlOpcode)
                }
                WsProtocolError::NonZeroReservedBits => {
                    SpeedTestError::Protocol(ProtocolErrorKind::InvalidReservedBits)
                }
                WsProtocolError::FragmentedControlFrame => {
                    SpeedTestError::Protocol(ProtocolErrorKind::FragmentedControlFrame)
                }
                _ => SpeedTestError::Transport(Box::new(e)),
            },
            tungstenite::Error::Http(_) => {
                SpeedTestError::Protocol(ProtocolErrorKind::HandshakeRejected)
            }
            _ => match protocol_kind_from_message(&e.to_string()) {
                Some(kind) => SpeedTestError::Protocol(kind),
                None => SpeedTestError::Transport(Box::new(e)),
            },
        }
    }
}

/// A `Result` type alias using [`SpeedTestError`].
pub type Result<T> = std::result::Result<T, SpeedTestError>;
