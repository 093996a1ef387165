//! # codec
//!
//! Byte-level encoding and decoding of WebSocket frames according to RFC 6455.
//!
//! The [`Decoder`] parses the header (FIN, RSV1-3, [`OpCode`], mask bit, the three length
//! tiers) and validates it before the payload is available, so a reader can always learn
//! exactly how many more bytes a frame needs. The [`Encoder`] serializes frames, masking
//! everything a client writes.
//!
//! The codec does **not** reassemble fragmented messages or validate text. That is done by
//! [`MessageAssembler`](crate::fragment::MessageAssembler) one layer up.
//!
//! ```text
//! Network bytes → Decoder → Frame(OpCode::Text, FIN=0)
//! Network bytes → Decoder → Frame(OpCode::Continuation, FIN=1)
//!        ↓
//! MessageAssembler validates and joins the fragments
//! ```
//!
//! [`OpCode`]: crate::OpCode

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec;

use crate::{
    Result, WebSocketError,
    frame::{self, Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE, OpCode},
};

/// Which end of the connection a codec serves. Clients mask what they send and expect
/// unmasked frames back, servers the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Header that has been parsed while the payload is still outstanding.
#[derive(Debug, Clone, Copy)]
struct ReadState {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    /// Payload bytes not yet handed out.
    payload_len: usize,
    /// Payload bytes of this frame already handed out as slices.
    consumed: usize,
}

/// Result of a decoding step.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame.
    Frame(Frame),
    /// At least this many additional bytes are needed before the next step can complete.
    NeedMore(usize),
}

/// A decoder for WebSocket frames.
///
/// Header parsing and payload extraction are separate steps: once a header has been
/// validated it is kept until the buffer holds the whole payload.
///
/// With [`with_payload_slices`](Self::with_payload_slices) a data frame with a larger payload is
/// handed out as consecutive frames of at most that size: the first keeps the opcode, the rest
/// are continuations, and only the last carries the original FIN bit.
pub struct Decoder {
    role: Role,
    /// Header waiting for its payload.
    state: Option<ReadState>,
    /// Frames announcing a larger payload are rejected before any of it is read.
    max_payload_size: Option<usize>,
    /// Largest payload handed out per data frame.
    slice_size: Option<usize>,
}

impl Decoder {
    pub fn new(role: Role, max_payload_size: Option<usize>) -> Self {
        Self {
            role,
            state: None,
            max_payload_size,
            slice_size: None,
        }
    }

    /// Splits data frame payloads larger than `size` so no more than `size` bytes of a
    /// payload are buffered at once.
    pub fn with_payload_slices(mut self, size: usize) -> Self {
        self.slice_size = Some(size.max(1));
        self
    }

    /// Drops any partially parsed frame.
    pub fn reset(&mut self) {
        self.state = None;
    }

    /// Decodes the next frame from `src`, consuming its bytes.
    ///
    /// Returns [`Decoded::NeedMore`] with the number of missing bytes when `src` does not yet
    /// hold a whole frame. Header violations are reported as soon as the header is complete.
    pub fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Decoded> {
        if let Some(state) = self.state.take() {
            return Ok(self.finish(state, src));
        }

        if src.remaining() < 2 {
            return Ok(Decoded::NeedMore(2 - src.remaining()));
        }

        let fin = src[0] & 0b1000_0000 != 0;
        if src[0] & 0b0111_0000 != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }
        let opcode = frame::OpCode::try_from(src[0] & 0b0000_1111)?;

        let masked = src[1] & 0b1000_0000 != 0;
        if masked != (self.role == Role::Server) {
            return Err(WebSocketError::InvalidMaskBit);
        }

        let length_code = src[1] & 0x7F;
        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + extra + (masked as usize * 4);
        if src.remaining() < header_size {
            return Ok(Decoded::NeedMore(header_size - src.remaining()));
        }

        src.advance(2);

        let payload_len: usize = match extra {
            0 => usize::from(length_code),
            2 => usize::from(src.get_u16()),
            _ => {
                let len = src.get_u64();
                if len & (1 << 63) != 0 {
                    return Err(WebSocketError::InvalidPayloadLength);
                }
                usize::try_from(len).map_err(|_| WebSocketError::MessageTooBig {
                    size: usize::MAX,
                    limit: self.max_payload_size.unwrap_or(usize::MAX),
                })?
            }
        };

        let mask = masked.then(|| src.get_u32().to_be_bytes());

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFramePayloadSize);
            }
        }
        if let Some(limit) = self.max_payload_size {
            if payload_len > limit {
                return Err(WebSocketError::MessageTooBig {
                    size: payload_len,
                    limit,
                });
            }
        }

        Ok(self.finish(
            ReadState {
                fin,
                opcode,
                mask,
                payload_len,
                consumed: 0,
            },
            src,
        ))
    }

    fn finish(&mut self, mut state: ReadState, src: &mut BytesMut) -> Decoded {
        let take = match self.slice_size {
            Some(size) if state.opcode.is_data() => state.payload_len.min(size),
            _ => state.payload_len,
        };
        if src.remaining() < take {
            let missing = take - src.remaining();
            self.state = Some(state);
            return Decoded::NeedMore(missing);
        }

        if let Some(mut mask) = state.mask {
            mask.rotate_left(state.consumed % 4);
            crate::mask::apply_mask(&mut src[..take], mask);
        }

        let payload = src.split_to(take).freeze();
        state.payload_len -= take;
        if state.payload_len == 0 {
            return Decoded::Frame(Frame::new(state.fin, state.opcode, state.mask, payload));
        }

        let slice = Frame::new(false, state.opcode, state.mask, payload);
        state.opcode = OpCode::Continuation;
        state.consumed += take;
        self.state = Some(state);
        Decoded::Frame(slice)
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode_frame(src)? {
            Decoded::Frame(frame) => Ok(Some(frame)),
            Decoded::NeedMore(_) => Ok(None),
        }
    }
}

/// WebSocket frame encoder.
///
/// A client encoder masks every frame, generating a fresh random key unless the frame
/// already carries one.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    /// Encodes a frame into a standalone buffer.
    pub fn encode_frame(&mut self, frame: Frame) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        codec::Encoder::encode(self, frame, &mut dst)?;
        Ok(dst.freeze())
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    #[inline(always)]
    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.check_control()?;

        if self.role == Role::Client {
            frame.set_random_mask_if_not_set();
        }

        dst.reserve(MAX_HEAD_SIZE + frame.payload.len());
        frame.write_head(dst);

        let index = dst.len();
        dst.extend_from_slice(&frame.payload);

        if let Some(mask) = frame.mask {
            crate::mask::apply_mask(&mut dst[index..], mask);
        }

        Ok(())
    }
}
