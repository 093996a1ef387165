//! Reassembly of fragmented messages.
//!
//! A message is a `Text` or `Binary` frame followed by zero or more `Continuation` frames, the
//! last one with `fin` set. [`MessageAssembler`] enforces that sequencing, validates text
//! incrementally as fragments arrive, and applies the configured payload limit: either the
//! message is rejected, or it is handed out in chunks as it grows.

use bytes::{Bytes, BytesMut};

use crate::{
    Result, WebSocketError,
    frame::{Frame, OpCode},
    options::PayloadLimitBehavior,
    utf8::Utf8Buffer,
};

/// Kind of data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Something ready for the consumer after a data frame was pushed.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// A complete message. Text payloads are valid UTF-8.
    Message { kind: MessageKind, payload: Bytes },
    /// Part of a message that outgrew the payload limit in split mode.
    Chunk {
        kind: MessageKind,
        payload: Bytes,
        index: usize,
        is_final: bool,
    },
}

enum Body {
    Text(Utf8Buffer),
    Binary(BytesMut),
}

impl Body {
    fn new(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Text => Self::Text(Utf8Buffer::new()),
            MessageKind::Binary => Self::Binary(BytesMut::new()),
        }
    }

    fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Binary(_) => MessageKind::Binary,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Text(buf) => buf.len(),
            Self::Binary(buf) => buf.len(),
        }
    }

    fn append(&mut self, payload: &[u8]) -> Result<()> {
        match self {
            Self::Text(buf) => buf.append(payload).map(|_| ()),
            Self::Binary(buf) => {
                buf.extend_from_slice(payload);
                Ok(())
            }
        }
    }

    /// Bytes [`take_partial`](Self::take_partial) would return.
    fn ready_len(&self) -> usize {
        match self {
            Self::Text(buf) => buf.valid_len(),
            Self::Binary(buf) => buf.len(),
        }
    }

    /// Everything that can be handed out without splitting a code point.
    fn take_partial(&mut self) -> Bytes {
        match self {
            Self::Text(buf) => buf.take_valid(),
            Self::Binary(buf) => buf.split().freeze(),
        }
    }

    fn finish(&mut self) -> Result<Bytes> {
        match self {
            Self::Text(buf) => buf.finish(),
            Self::Binary(buf) => Ok(buf.split().freeze()),
        }
    }
}

struct Partial {
    body: Body,
    /// Number of chunks already delivered for this message.
    chunks: usize,
}

/// Joins data frames into messages.
pub struct MessageAssembler {
    limit: usize,
    behavior: PayloadLimitBehavior,
    partial: Option<Partial>,
}

impl MessageAssembler {
    pub fn new(limit: usize, behavior: PayloadLimitBehavior) -> Self {
        Self {
            limit,
            behavior,
            partial: None,
        }
    }

    /// Whether a fragmented message is in progress.
    pub fn is_assembling(&self) -> bool {
        self.partial.is_some()
    }

    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feeds a data frame. Control frames are not accepted here.
    ///
    /// Returns the message or chunk that became ready, if any. Any error is fatal for the
    /// connection and leaves the assembler reset.
    pub fn push(&mut self, frame: &Frame) -> Result<Option<Delivery>> {
        let result = self.push_inner(frame);
        if result.is_err() {
            self.partial = None;
        }
        result
    }

    fn push_inner(&mut self, frame: &Frame) -> Result<Option<Delivery>> {
        let mut partial = match (frame.opcode(), self.partial.take()) {
            (OpCode::Continuation, Some(partial)) => partial,
            (OpCode::Continuation, None) => return Err(WebSocketError::HeadlessContinuationFrame),
            (OpCode::Text | OpCode::Binary, Some(_)) => {
                return Err(WebSocketError::LackOfContinuationFrameTermination);
            }
            (OpCode::Text, None) => Partial {
                body: Body::new(MessageKind::Text),
                chunks: 0,
            },
            (OpCode::Binary, None) => Partial {
                body: Body::new(MessageKind::Binary),
                chunks: 0,
            },
            (opcode, _) => {
                return Err(WebSocketError::UnknownControlFrameType(u8::from(opcode)));
            }
        };

        let size = partial.body.len() + frame.payload().len();
        if size > self.limit && self.behavior == PayloadLimitBehavior::Error {
            return Err(WebSocketError::MessageTooBig {
                size,
                limit: self.limit,
            });
        }

        partial.body.append(frame.payload())?;
        let kind = partial.body.kind();

        if frame.is_fin() {
            let payload = partial.body.finish()?;
            if partial.chunks == 0 {
                return Ok(Some(Delivery::Message { kind, payload }));
            }
            return Ok(Some(Delivery::Chunk {
                kind,
                payload,
                index: partial.chunks,
                is_final: true,
            }));
        }

        if self.behavior == PayloadLimitBehavior::Split
            && partial.body.ready_len() > 0
            && partial.body.ready_len() >= self.limit
        {
            let payload = partial.body.take_partial();
            let index = partial.chunks;
            partial.chunks += 1;
            self.partial = Some(partial);
            return Ok(Some(Delivery::Chunk {
                kind,
                payload,
                index,
                is_final: false,
            }));
        }

        self.partial = Some(partial);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler(limit: usize, behavior: PayloadLimitBehavior) -> MessageAssembler {
        MessageAssembler::new(limit, behavior)
    }

    #[test]
    fn test_single_frame_messages() {
        let mut asm = assembler(1024, PayloadLimitBehavior::Error);
        assert_eq!(
            asm.push(&Frame::text("hi")).unwrap(),
            Some(Delivery::Message {
                kind: MessageKind::Text,
                payload: Bytes::from_static(b"hi"),
            })
        );
        assert_eq!(
            asm.push(&Frame::binary(vec![1, 2])).unwrap(),
            Some(Delivery::Message {
                kind: MessageKind::Binary,
                payload: Bytes::from_static(&[1, 2]),
            })
        );
    }

    #[test]
    fn test_fragmented_text() {
        let mut asm = assembler(1024, PayloadLimitBehavior::Error);
        assert_eq!(asm.push(&Frame::text("Hel").with_fin(false)).unwrap(), None);
        assert!(asm.is_assembling());
        assert_eq!(asm.push(&Frame::continuation("l").with_fin(false)).unwrap(), None);
        assert_eq!(
            asm.push(&Frame::continuation("o")).unwrap(),
            Some(Delivery::Message {
                kind: MessageKind::Text,
                payload: Bytes::from_static(b"Hello"),
            })
        );
        assert!(!asm.is_assembling());
    }

    #[test]
    fn test_code_point_split_across_fragments() {
        let bytes = "€".as_bytes();
        let mut asm = assembler(1024, PayloadLimitBehavior::Error);
        assert_eq!(
            asm.push(&Frame::text(bytes[..1].to_vec()).with_fin(false)).unwrap(),
            None
        );
        assert_eq!(
            asm.push(&Frame::continuation(bytes[1..].to_vec())).unwrap(),
            Some(Delivery::Message {
                kind: MessageKind::Text,
                payload: Bytes::from_static("€".as_bytes()),
            })
        );
    }

    #[test]
    fn test_invalid_utf8_fails_before_fin() {
        let mut asm = assembler(1024, PayloadLimitBehavior::Error);
        assert!(matches!(
            asm.push(&Frame::text(vec![b'a', 0xFF]).with_fin(false)),
            Err(WebSocketError::InvalidUTF8)
        ));
        assert!(!asm.is_assembling());
    }

    #[test]
    fn test_truncated_code_point_at_fin() {
        let mut asm = assembler(1024, PayloadLimitBehavior::Error);
        assert!(matches!(
            asm.push(&Frame::text(vec![0xE2, 0x82])),
            Err(WebSocketError::InvalidUTF8)
        ));
    }

    #[test]
    fn test_binary_is_not_validated() {
        let mut asm = assembler(1024, PayloadLimitBehavior::Error);
        assert!(asm.push(&Frame::binary(vec![0xFF, 0xFE])).unwrap().is_some());
    }

    #[test]
    fn test_headless_continuation() {
        let mut asm = assembler(1024, PayloadLimitBehavior::Error);
        assert!(matches!(
            asm.push(&Frame::continuation("x")),
            Err(WebSocketError::HeadlessContinuationFrame)
        ));
    }

    #[test]
    fn test_unterminated_fragmented_message() {
        let mut asm = assembler(1024, PayloadLimitBehavior::Error);
        asm.push(&Frame::text("a").with_fin(false)).unwrap();
        assert!(matches!(
            asm.push(&Frame::binary("b")),
            Err(WebSocketError::LackOfContinuationFrameTermination)
        ));
    }

    #[test]
    fn test_limit_error_mode() {
        let mut asm = assembler(10, PayloadLimitBehavior::Error);
        asm.push(&Frame::binary(vec![0u8; 6]).with_fin(false)).unwrap();
        assert!(matches!(
            asm.push(&Frame::continuation(vec![0u8; 6])),
            Err(WebSocketError::MessageTooBig { size: 12, limit: 10 })
        ));
    }

    #[test]
    fn test_limit_split_mode() {
        let mut asm = assembler(10, PayloadLimitBehavior::Split);
        assert_eq!(
            asm.push(&Frame::binary(vec![1u8; 6]).with_fin(false)).unwrap(),
            None
        );
        assert_eq!(
            asm.push(&Frame::continuation(vec![2u8; 6]).with_fin(false)).unwrap(),
            Some(Delivery::Chunk {
                kind: MessageKind::Binary,
                payload: Bytes::from([vec![1u8; 6], vec![2u8; 6]].concat()),
                index: 0,
                is_final: false,
            })
        );
        assert_eq!(
            asm.push(&Frame::continuation(vec![3u8; 2])).unwrap(),
            Some(Delivery::Chunk {
                kind: MessageKind::Binary,
                payload: Bytes::from(vec![3u8; 2]),
                index: 1,
                is_final: true,
            })
        );
    }

    #[test]
    fn test_split_mode_holds_back_incomplete_code_point() {
        let mut asm = assembler(4, PayloadLimitBehavior::Split);
        // "abcd" then the first byte of "é"
        let first = Frame::text(vec![b'a', b'b', b'c', b'd', 0xC3]).with_fin(false);
        assert_eq!(
            asm.push(&first).unwrap(),
            Some(Delivery::Chunk {
                kind: MessageKind::Text,
                payload: Bytes::from_static(b"abcd"),
                index: 0,
                is_final: false,
            })
        );
        assert_eq!(
            asm.push(&Frame::continuation(vec![0xA9])).unwrap(),
            Some(Delivery::Chunk {
                kind: MessageKind::Text,
                payload: Bytes::from_static("é".as_bytes()),
                index: 1,
                is_final: true,
            })
        );
    }

    #[test]
    fn test_split_mode_never_emits_empty_text_chunk() {
        let mut asm = assembler(2, PayloadLimitBehavior::Split);
        // the first three bytes of a four-byte code point
        let frame = Frame::text(vec![0xF0, 0x9F, 0x98]).with_fin(false);
        assert_eq!(asm.push(&frame).unwrap(), None);
        assert_eq!(
            asm.push(&Frame::continuation(vec![0x80])).unwrap(),
            Some(Delivery::Message {
                kind: MessageKind::Text,
                payload: Bytes::from_static("😀".as_bytes()),
            })
        );
    }

    #[test]
    fn test_split_mode_chunk_at_limit() {
        let mut asm = assembler(4, PayloadLimitBehavior::Split);
        assert_eq!(
            asm.push(&Frame::binary(vec![1u8; 4]).with_fin(false)).unwrap(),
            Some(Delivery::Chunk {
                kind: MessageKind::Binary,
                payload: Bytes::from(vec![1u8; 4]),
                index: 0,
                is_final: false,
            })
        );
    }

    #[test]
    fn test_split_mode_small_message_is_whole() {
        let mut asm = assembler(10, PayloadLimitBehavior::Split);
        asm.push(&Frame::text("abc").with_fin(false)).unwrap();
        assert_eq!(
            asm.push(&Frame::continuation("def")).unwrap(),
            Some(Delivery::Message {
                kind: MessageKind::Text,
                payload: Bytes::from_static(b"abcdef"),
            })
        );
    }
}
