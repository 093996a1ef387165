//! # nnws
//!
//! Client-side WebSocket (RFC 6455) over any duplex byte stream.
//!
//! The crate is split into a sans-IO core and an optional tokio integration:
//!
//! - [`client::WebSocketClient`] is the connection state machine. It is driven by explicit
//!   inputs ("connected", "bytes arrived", "bytes written", "timer fired") and produces
//!   [`client::Event`]s for the consumer and [`client::Command`]s for whatever owns the socket.
//!   Nothing in the core touches a clock or a socket, so every transition can be tested with an
//!   injected [`std::time::Instant`] and in-memory buffers.
//! - [`native::WebSocket`] hosts the state machine on a tokio task over TCP or TLS.
//!
//! # Features
//! - `rustls-ring` (default): use the ring crypto provider for `wss://`
//! - `rustls-aws-lc-rs`: use the aws-lc-rs crypto provider for `wss://`
//! - `simd`: SIMD-accelerated UTF-8 validation
//!
//! # Client Example
//! ```no_run
//! use nnws::{Options, client::Event, native::WebSocket};
//!
//! async fn run() -> nnws::Result<()> {
//!     let (ws, mut events) =
//!         WebSocket::connect("wss://echo.websocket.org".parse()?, Options::default())?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::Opened { .. } => ws.send_text("hello").await?,
//!             Event::Text(text) => {
//!                 println!("{text}");
//!                 ws.close().await?;
//!             }
//!             Event::Closed { status, .. } => {
//!                 println!("closed with {}", u16::from(status));
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Protocol Handling
//!
//! - **Ping frames**: answered with a pong carrying the same payload, unless
//!   [`Options::with_auto_pong_disabled`] is set. The ping is still surfaced as a frame event.
//! - **Pong frames**: surfaced without any automatic action.
//! - **Close frames**: answered with a close echo, then the stream is torn down and the
//!   negotiated status is reported.

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Emits a `tracing` event when the configured [`VerboseLevel`](options::VerboseLevel) allows it.
macro_rules! log_at {
    ($verbose:expr, error, $($arg:tt)+) => {
        if $verbose >= $crate::options::VerboseLevel::Error {
            ::tracing::error!($($arg)+)
        }
    };
    ($verbose:expr, info, $($arg:tt)+) => {
        if $verbose >= $crate::options::VerboseLevel::Info {
            ::tracing::info!($($arg)+)
        }
    };
    ($verbose:expr, debug, $($arg:tt)+) => {
        if $verbose >= $crate::options::VerboseLevel::Debug {
            ::tracing::debug!($($arg)+)
        }
    };
    ($verbose:expr, trace, $($arg:tt)+) => {
        if $verbose >= $crate::options::VerboseLevel::Trace {
            ::tracing::trace!($($arg)+)
        }
    };
}

pub mod client;
pub mod close;
pub mod codec;
pub mod fragment;
pub mod frame;
pub mod handshake;
#[doc(hidden)]
pub mod mask;
pub mod native;
pub mod options;
pub mod transport;
pub mod utf8;

pub use client::{Command, ConnectionState, Event, Message, WebSocketClient};
pub use close::CloseCode;
pub use frame::{Frame, OpCode};
pub use options::{Options, PayloadLimitBehavior, VerboseLevel};
use thiserror::Error;

/// Result type for WebSocket operations.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors that can occur during WebSocket operations.
#[derive(Error, Debug)]
pub enum WebSocketError {
    // ---- handshake / connection ----
    /// URL scheme is not ws:// or wss://.
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The URL has no host to connect to.
    #[error("URL has no host")]
    MissingHost,

    /// The HTTP response head could not be parsed.
    #[error("Malformed HTTP response")]
    InvalidHttpResponse,

    /// HTTP status code not valid for WebSocket upgrade.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Missing or invalid "Upgrade: websocket" header.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// Missing or invalid "Connection: upgrade" header.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// Sec-WebSocket-Accept is missing or does not match the key we sent.
    #[error("Invalid Sec-WebSocket-Accept header")]
    InvalidAcceptKey,

    /// The server selected a sub-protocol that was never offered.
    #[error("Server selected an unrequested sub-protocol: {0}")]
    InvalidSubprotocol(String),

    /// The server tried to negotiate an extension, none are supported.
    #[error("Server negotiated an unsupported extension: {0}")]
    UnsupportedExtension(String),

    /// The transport did not connect within the connect timeout.
    #[error("Connect timed out")]
    ConnectTimeout,

    /// The peer did not answer our close frame within the close timeout.
    #[error("Close handshake timed out")]
    CloseTimeout,

    // ---- wire format ----
    /// A frame arrived with the wrong mask bit for its direction.
    #[error("Invalid mask bit")]
    InvalidMaskBit,

    /// Control frame payload exceeds 125 bytes.
    #[error("Control frame payload too large")]
    ControlFramePayloadSize,

    /// Reserved bits in frame header are not zero.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Control frame is fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Payload contains invalid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// 64-bit payload length with the most significant bit set.
    #[error("Invalid payload length")]
    InvalidPayloadLength,

    /// Close frame has invalid format.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Close frame contains a status code that may not appear on the wire.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Close frame reason is not valid UTF-8.
    #[error("Invalid close reason")]
    InvalidCloseReason,

    // ---- framing ----
    /// Control opcode in the reserved range 0xB-0xF.
    #[error("Unknown control frame type (opcode={0:#x})")]
    UnknownControlFrameType(u8),

    /// Data opcode in the reserved range 0x3-0x7.
    #[error("Unknown data frame type (opcode={0:#x})")]
    UnknownDataFrameType(u8),

    /// Continuation frame without initial frame.
    #[error("Continuation frame without an initiating frame")]
    HeadlessContinuationFrame,

    /// A new data frame started before the fragmented message was terminated.
    #[error("Fragmented message was not terminated")]
    LackOfContinuationFrameTermination,

    /// Message payload exceeds configured maximum.
    #[error("Message too big ({size} bytes, limit {limit})")]
    MessageTooBig { size: usize, limit: usize },

    // ---- transport ----
    /// The active read did not complete within the read timeout.
    #[error("Read timed out")]
    ReadTimeout,

    /// The active write did not complete within the write timeout.
    #[error("Write timed out")]
    WriteTimeout,

    /// A delimited read buffered too many bytes without seeing its terminator.
    #[error("Terminator not found within {0} bytes")]
    DelimiterNotFound(usize),

    /// Connection has been closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The host went to the background and background operation is not allowed.
    #[error("Connection dropped while running in the background")]
    Backgrounded,

    /// I/O error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    // ---- api ----
    /// URL parsing error.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Operation not permitted in the current connection state.
    #[error("Cannot {operation} while {state}")]
    IllegalState {
        operation: &'static str,
        state: ConnectionState,
    },

    /// Rejected configuration.
    #[error("Configuration error: {0}")]
    InvalidConfig(String),
}

impl WebSocketError {
    /// Returns `true` if this is a protocol-level error (RFC 6455 violation).
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidMaskBit
                | Self::ControlFramePayloadSize
                | Self::ReservedBitsNotZero
                | Self::ControlFrameFragmented
                | Self::InvalidUTF8
                | Self::InvalidPayloadLength
                | Self::InvalidCloseFrame
                | Self::InvalidCloseCode(_)
                | Self::InvalidCloseReason
                | Self::UnknownControlFrameType(_)
                | Self::UnknownDataFrameType(_)
                | Self::HeadlessContinuationFrame
                | Self::LackOfContinuationFrameTermination
                | Self::MessageTooBig { .. }
        )
    }

    /// Returns `true` if this is a handshake error.
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedScheme(_)
                | Self::MissingHost
                | Self::InvalidHttpResponse
                | Self::InvalidStatusCode(_)
                | Self::InvalidUpgradeHeader
                | Self::InvalidConnectionHeader
                | Self::InvalidAcceptKey
                | Self::InvalidSubprotocol(_)
                | Self::UnsupportedExtension(_)
                | Self::ConnectTimeout
        )
    }

    /// Returns `true` if the error came from the byte stream rather than the protocol.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::ReadTimeout
                | Self::WriteTimeout
                | Self::DelimiterNotFound(_)
                | Self::ConnectionClosed
                | Self::Backgrounded
                | Self::IoError(_)
        )
    }

    /// Returns `true` if this is a data validation error (invalid UTF-8 or size limit).
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidUTF8 | Self::InvalidCloseReason | Self::MessageTooBig { .. }
        )
    }

    /// Returns `true` if the connection is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Returns the underlying I/O error, if any.
    pub fn as_io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }

    /// The status reported to the consumer when this error tears the connection down.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidUTF8 | Self::InvalidCloseReason => CloseCode::InvalidPayload,
            Self::MessageTooBig { .. } => CloseCode::MessageTooBig,
            err if err.is_protocol_error() => CloseCode::ProtocolError,
            _ => CloseCode::AbnormalClosure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(
            WebSocketError::InvalidUTF8.close_code(),
            CloseCode::InvalidPayload
        );
        assert_eq!(
            WebSocketError::MessageTooBig { size: 11, limit: 10 }.close_code(),
            CloseCode::MessageTooBig
        );
        assert_eq!(
            WebSocketError::ReservedBitsNotZero.close_code(),
            CloseCode::ProtocolError
        );
        assert_eq!(
            WebSocketError::HeadlessContinuationFrame.close_code(),
            CloseCode::ProtocolError
        );
        assert_eq!(
            WebSocketError::ReadTimeout.close_code(),
            CloseCode::AbnormalClosure
        );
        assert_eq!(
            WebSocketError::CloseTimeout.close_code(),
            CloseCode::AbnormalClosure
        );
    }

    #[test]
    fn test_error_groups() {
        assert!(WebSocketError::InvalidAcceptKey.is_handshake_error());
        assert!(!WebSocketError::InvalidAcceptKey.is_protocol_error());
        assert!(WebSocketError::UnknownDataFrameType(0x3).is_protocol_error());
        assert!(WebSocketError::WriteTimeout.is_transport_error());
        assert!(WebSocketError::InvalidUTF8.is_data_error());

        let io = WebSocketError::from(std::io::Error::other("reset"));
        assert!(io.is_transport_error());
        assert!(io.as_io_error().is_some());
    }
}
