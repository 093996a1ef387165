//! Close status codes and the bookkeeping of the closing handshake.

use bytes::{BufMut, Bytes, BytesMut};

use self::CloseCode::*;
use crate::{Result, WebSocketError};

/// Status codes representing the reasons why an endpoint is closing the WebSocket connection.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum CloseCode {
    /// 1000, the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001, the endpoint is going away (server shutdown, page navigation).
    GoingAway,
    /// 1002, the peer violated the protocol.
    ProtocolError,
    /// 1003, the endpoint received a type of data it cannot accept.
    UnsupportedData,
    /// 1005, no status code was present in the close frame. Never sent on the wire.
    NoStatus,
    /// 1006, the connection dropped without a closing handshake. Never sent on the wire.
    AbnormalClosure,
    /// 1007, message data was inconsistent with its type (e.g. non-UTF-8 text).
    InvalidPayload,
    /// 1008, generic policy violation.
    PolicyViolation,
    /// 1009, the message is too big to process.
    MessageTooBig,
    /// 1010, the client expected an extension the server did not negotiate.
    MandatoryExtension,
    /// 1011, the server hit an unexpected condition.
    InternalError,
    /// 1012, the server is restarting.
    ServiceRestart,
    /// 1013, the server is overloaded; try again later.
    TryAgainLater,
    /// 1014, a gateway received an invalid upstream response.
    BadGateway,
    #[doc(hidden)]
    /// 1015, TLS handshake failure. Never sent on the wire.
    TlsHandshake,
    #[doc(hidden)]
    /// 1004 and 1016-2999, reserved for future versions of the protocol.
    Reserved(u16),
    /// 3000-3999, registered with IANA for libraries and frameworks.
    Registered(u16),
    /// 4000-4999, private use by applications.
    Private(u16),
    #[doc(hidden)]
    /// Anything outside of the ranges above.
    Bad(u16),
}

impl CloseCode {
    /// Whether the code may be carried in a close frame.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            Bad(_) | Reserved(_) | NoStatus | AbnormalClosure | TlsHandshake
        )
    }

    /// Codes that only ever describe a close locally and never travel on the wire.
    pub fn is_local_only(self) -> bool {
        matches!(self, NoStatus | AbnormalClosure | TlsHandshake)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Normal,
            1001 => GoingAway,
            1002 => ProtocolError,
            1003 => UnsupportedData,
            1005 => NoStatus,
            1006 => AbnormalClosure,
            1007 => InvalidPayload,
            1008 => PolicyViolation,
            1009 => MessageTooBig,
            1010 => MandatoryExtension,
            1011 => InternalError,
            1012 => ServiceRestart,
            1013 => TryAgainLater,
            1014 => BadGateway,
            1015 => TlsHandshake,
            1004 | 1016..=2999 => Reserved(code),
            3000..=3999 => Registered(code),
            4000..=4999 => Private(code),
            _ => Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            Normal => 1000,
            GoingAway => 1001,
            ProtocolError => 1002,
            UnsupportedData => 1003,
            NoStatus => 1005,
            AbnormalClosure => 1006,
            InvalidPayload => 1007,
            PolicyViolation => 1008,
            MessageTooBig => 1009,
            MandatoryExtension => 1010,
            InternalError => 1011,
            ServiceRestart => 1012,
            TryAgainLater => 1013,
            BadGateway => 1014,
            TlsHandshake => 1015,
            Reserved(code) | Registered(code) | Private(code) | Bad(code) => code,
        }
    }
}

/// Decoded body of a close frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClosePayload {
    pub code: Option<CloseCode>,
    pub reason: Option<String>,
}

impl ClosePayload {
    /// Validates and decodes a close frame body.
    ///
    /// An empty body carries no status. A body of exactly one byte, a code that may not
    /// travel on the wire, or a reason that is not UTF-8 are all rejected.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        match payload.len() {
            0 => Ok(Self::default()),
            1 => Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let raw = u16::from_be_bytes([payload[0], payload[1]]);
                let code = CloseCode::from(raw);
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode(raw));
                }

                let reason = match &payload[2..] {
                    [] => None,
                    bytes => Some(
                        std::str::from_utf8(bytes)
                            .map_err(|_| WebSocketError::InvalidCloseReason)?
                            .to_owned(),
                    ),
                };

                Ok(Self {
                    code: Some(code),
                    reason,
                })
            }
        }
    }

    /// Wire encoding: big-endian code followed by the reason bytes.
    pub fn encode(code: CloseCode, reason: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(code.into());
        buf.put_slice(reason);
        buf.freeze()
    }
}

/// Which side sent the first close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    Client,
    Server,
}

/// Record kept while a connection is closing.
///
/// `client_code` is what we put in our close frame, `server_code` is what the peer put in
/// theirs. Both are `None` when the corresponding frame carried no status.
#[derive(Debug, Clone)]
pub struct CloseNegotiation {
    pub initiator: CloseInitiator,
    pub client_code: Option<CloseCode>,
    pub server_code: Option<CloseCode>,
    /// Our close frame has been completely written.
    pub close_flushed: bool,
    /// The peer's close frame has been received.
    pub peer_close_received: bool,
}

impl CloseNegotiation {
    pub fn client_initiated(code: CloseCode) -> Self {
        Self {
            initiator: CloseInitiator::Client,
            client_code: Some(code),
            server_code: None,
            close_flushed: false,
            peer_close_received: false,
        }
    }

    /// The peer's close frame arrived first; our echo repeats its code.
    pub fn server_initiated(code: Option<CloseCode>) -> Self {
        Self {
            initiator: CloseInitiator::Server,
            client_code: code,
            server_code: code,
            close_flushed: false,
            peer_close_received: true,
        }
    }

    pub fn on_peer_close(&mut self, code: Option<CloseCode>) {
        self.server_code = code;
        self.peer_close_received = true;
    }

    /// Both close frames have crossed the wire.
    pub fn is_complete(&self) -> bool {
        self.close_flushed && self.peer_close_received
    }

    /// Status reported when the connection finishes closing.
    pub fn final_status(&self) -> CloseCode {
        match (self.server_code, self.peer_close_received) {
            (Some(code), true) => code,
            (None, true) => NoStatus,
            _ => AbnormalClosure,
        }
    }
}
