//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data Frames**: `Text`, `Binary` and `Continuation`.
//! - **Control Frames**: `Close`, `Ping` and `Pong`. They are never fragmented and carry at
//!   most [`MAX_CONTROL_PAYLOAD`] bytes.
//!
//! ```rust
//! use nnws::{close::CloseCode, frame::Frame};
//!
//! let text_frame = Frame::text("Hello, WebSocket!");
//! let ping = Frame::ping("are you there?");
//! let close = Frame::close(CloseCode::Normal, b"done");
//!
//! // Fragmented message
//! let first = Frame::text("Hello, ").with_fin(false);
//! let last = Frame::continuation("World!");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    WebSocketError,
    close::{CloseCode, ClosePayload},
};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible header: 2 bytes, 8 bytes of extended length and a 4 byte mask.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code, see [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when parsing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Continuation`, `Text` and `Binary`.
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    /// Reserved values are reported as unknown control or data frame types depending on
    /// the high bit of the opcode nibble.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            v if v & 0x8 != 0 => Err(WebSocketError::UnknownControlFrameType(v)),
            v => Err(WebSocketError::UnknownDataFrameType(v)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

impl From<Frame> for (OpCode, Bytes) {
    fn from(val: Frame) -> Self {
        (val.opcode, val.payload)
    }
}

impl<T> From<(OpCode, T)> for Frame
where
    T: Into<Bytes>,
{
    fn from((opcode, payload): (OpCode, T)) -> Self {
        Self::new(true, opcode, None, payload)
    }
}

/// A single WebSocket frame.
///
/// Frames received from the server are never masked, so `mask` is only populated on frames
/// that are about to be written by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub(crate) fin: bool,
    /// The opcode of the frame, defining its type.
    pub(crate) opcode: OpCode,
    /// The masking key for client-to-server frames.
    pub(crate) mask: Option<[u8; 4]>,
    /// The unmasked payload.
    pub(crate) payload: Bytes,
}

impl Frame {
    /// Creates a text frame with the given payload.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Creates a binary frame with the given payload.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Creates a ping frame with the given payload.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// Creates a pong frame with the given payload.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Creates a continuation frame with the given payload.
    ///
    /// The first fragment of a message is a `Text` or `Binary` frame with `fin` cleared,
    /// followed by continuation frames, the last of which has `fin` set.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload)
    }

    /// Creates a close frame with a close code and reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        Self::close_raw(ClosePayload::encode(code, reason.as_ref()))
    }

    /// Creates a close frame with an arbitrary payload, including an empty one.
    pub fn close_raw<T: Into<Bytes>>(payload: T) -> Self {
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Low-level constructor for creating frames with full control.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Sets the fin flag and returns self for method chaining.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets a specific masking key (builder pattern).
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Splits a data frame into frames of at most `partition` payload bytes.
    ///
    /// The first fragment keeps the original opcode, the rest are continuations, and only
    /// the last one has `fin` set. A payload that already fits is returned untouched.
    pub(crate) fn into_fragments(self, partition: usize) -> impl Iterator<Item = Frame> {
        struct Split {
            index: usize,
            max_size: usize,
            frame: Option<Frame>,
        }

        impl Iterator for Split {
            type Item = Frame;

            fn next(&mut self) -> Option<Self::Item> {
                let mut frame = self.frame.take()?;
                if frame.payload.len() <= self.max_size {
                    if self.index != 0 {
                        frame.fin = true;
                        frame.opcode = OpCode::Continuation;
                    }
                    Some(frame)
                } else {
                    let opcode = if self.index == 0 {
                        frame.opcode
                    } else {
                        OpCode::Continuation
                    };
                    self.index += 1;
                    let chunk = frame.payload.split_to(self.max_size);
                    let mask = frame.mask;
                    self.frame = Some(frame);
                    Some(Frame::new(false, opcode, mask, chunk))
                }
            }
        }

        Split {
            index: 0,
            max_size: partition.max(1),
            frame: Some(self),
        }
    }

    #[inline(always)]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    #[inline(always)]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame and returns its payload.
    #[inline(always)]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Consumes the frame and returns its opcode, fin flag and payload.
    #[inline(always)]
    pub fn into_parts(self) -> (OpCode, bool, Bytes) {
        (self.opcode, self.fin, self.payload)
    }

    /// Returns whether this is the final frame in a message.
    #[inline(always)]
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    #[inline(always)]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Extracts the close code from a close frame's payload, if one is present.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = CloseCode::from(u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?));
        Some(code)
    }

    /// Extracts the close reason from a close frame's payload.
    pub fn close_reason(&self) -> Result<Option<&str>, WebSocketError> {
        match self.payload.get(2..) {
            None | Some([]) => Ok(None),
            Some(reason) => std::str::from_utf8(reason)
                .map(Some)
                .map_err(|_| WebSocketError::InvalidCloseReason),
        }
    }

    /// Checks the constraints every control frame must satisfy.
    pub(crate) fn check_control(&self) -> Result<(), WebSocketError> {
        if !self.opcode.is_control() {
            return Ok(());
        }
        if !self.fin {
            return Err(WebSocketError::ControlFrameFragmented);
        }
        if self.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFramePayloadSize);
        }
        Ok(())
    }

    /// Generates and sets a random mask if none is already set.
    #[inline]
    pub(crate) fn set_random_mask_if_not_set(&mut self) {
        if self.mask.is_none() {
            self.mask = Some(rand::random());
        }
    }

    /// Writes the frame header, choosing the shortest length encoding.
    #[inline]
    pub(crate) fn write_head(&self, dst: &mut BytesMut) {
        let first_byte = (self.fin as u8) << 7 | u8::from(self.opcode);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();

        dst.put_u8(first_byte);
        if len < 126 {
            dst.put_u8(len as u8 | mask_bit);
        } else if len < 65536 {
            dst.put_u8(126 | mask_bit);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}
