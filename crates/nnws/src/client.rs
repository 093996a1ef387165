//! The client connection state machine.
//!
//! ```text
//!            open()           handshake ok
//!  Closed ───────────► Connecting ───────────► Open
//!    ▲                     │                     │ close() / peer close
//!    │  open failed        │                     ▼
//!    ├─────────────────────┘                  Closing
//!    │  both close frames exchanged, timeout,    │
//!    └─────────── error or stream lost ──────────┘
//! ```
//!
//! [`WebSocketClient`] owns no socket and reads no clock. The host feeds it with the
//! `on_*` inputs, passing the current [`Instant`] where timing matters, and then drains:
//!
//! - [`poll_command`](WebSocketClient::poll_command): what to do with the transport
//!   (connect, half-close, disconnect),
//! - [`transmit`](WebSocketClient::transmit): bytes to write, acknowledged through
//!   [`on_written`](WebSocketClient::on_written),
//! - [`poll_event`](WebSocketClient::poll_event): notifications for the consumer,
//! - [`next_deadline`](WebSocketClient::next_deadline): when to call
//!   [`on_timer`](WebSocketClient::on_timer).
//!
//! See [`native`](crate::native) for a host built on tokio.

use std::{
    collections::VecDeque,
    fmt, io,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use url::Url;

use crate::{
    Result, WebSocketError,
    close::{CloseCode, CloseNegotiation, ClosePayload},
    codec::{Decoded, Decoder, Encoder, Role},
    fragment::{Delivery, MessageAssembler, MessageKind},
    frame::{Frame, MAX_CONTROL_PAYLOAD, OpCode},
    handshake::{Endpoint, HEAD_TERMINATOR, Handshake},
    options::{Options, PayloadLimitBehavior},
    transport::{ReadTask, TransportScheduler, WriteTask},
};

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        })
    }
}

/// A complete data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    fn into_frame(self) -> Frame {
        match self {
            Self::Text(text) => Frame::text(text),
            Self::Binary(data) => Frame::binary(data),
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data.into())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

/// Notifications for the consumer, in the order they happened.
#[derive(Debug)]
pub enum Event {
    /// The handshake succeeded.
    Opened { protocol: Option<String> },
    /// The connection never opened. No `Closed` event follows.
    OpenFailed(WebSocketError),
    /// An open connection ended. `status` is the peer's close code when the closing handshake
    /// completed, otherwise the code describing the failure.
    Closed {
        status: CloseCode,
        error: Option<WebSocketError>,
    },
    /// Every frame received, before message-level events derived from it.
    ///
    /// In split mode a data frame larger than the payload limit is reported as the slices it
    /// was read in.
    Frame(Frame),
    Text(String),
    /// Part of a text message delivered in split mode.
    TextChunk {
        text: String,
        index: usize,
        is_final: bool,
    },
    Binary(Bytes),
    /// Part of a binary message delivered in split mode.
    BinaryChunk {
        data: Bytes,
        index: usize,
        is_final: bool,
    },
}

/// Requests for whoever owns the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a TCP connection, wrapped in TLS when `secure`, then call
    /// [`on_connected`](WebSocketClient::on_connected).
    Connect {
        host: String,
        port: u16,
        secure: bool,
        timeout: Option<Duration>,
    },
    /// Stop writing; the read side stays open.
    ShutdownWrite,
    /// Drop the stream.
    Disconnect,
}

/// Identifies transport tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Handshake,
    Frame,
    Data,
    Control,
    Close,
}

enum ConnectPhase {
    /// Waiting for the transport.
    Dialing,
    /// Request sent, waiting for the response head.
    Upgrading,
}

enum State {
    Closed,
    Connecting {
        endpoint: Endpoint,
        handshake: Handshake,
        phase: ConnectPhase,
        deadline: Option<Instant>,
    },
    Open,
    Closing {
        record: CloseNegotiation,
        deadline: Option<Instant>,
    },
}

/// A client-side WebSocket connection without I/O.
pub struct WebSocketClient {
    url: Url,
    options: Options,
    state: State,
    protocol: Option<String>,
    transport: TransportScheduler<Tag>,
    decoder: Decoder,
    encoder: Encoder,
    /// Frame bytes delivered by the transport but not yet decoded.
    inbound: BytesMut,
    assembler: MessageAssembler,
    events: VecDeque<Event>,
    commands: VecDeque<Command>,
}

impl WebSocketClient {
    pub fn new(url: Url, options: Options) -> Self {
        let decoder = match options.payload_limit_behavior {
            PayloadLimitBehavior::Error => {
                Decoder::new(Role::Client, Some(options.max_payload_size))
            }
            PayloadLimitBehavior::Split => {
                Decoder::new(Role::Client, None).with_payload_slices(options.max_payload_size)
            }
        };

        Self {
            transport: TransportScheduler::new(options.verbose),
            decoder,
            encoder: Encoder::new(Role::Client),
            assembler: MessageAssembler::new(
                options.max_payload_size,
                options.payload_limit_behavior,
            ),
            inbound: BytesMut::new(),
            url,
            options,
            state: State::Closed,
            protocol: None,
            events: VecDeque::new(),
            commands: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.state {
            State::Closed => ConnectionState::Closed,
            State::Connecting { .. } => ConnectionState::Connecting,
            State::Open => ConnectionState::Open,
            State::Closing { .. } => ConnectionState::Closing,
        }
    }

    /// Sub-protocol selected by the server for the current connection.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    // ---- consumer operations ----

    /// Starts connecting. Only valid while closed; a closed client may be opened again.
    ///
    /// A URL or configuration that cannot work is reported as [`Event::OpenFailed`].
    pub fn open(&mut self, now: Instant) -> Result<()> {
        if !matches!(self.state, State::Closed) {
            return Err(self.illegal("open"));
        }

        self.reset_connection();

        let endpoint = match self
            .options
            .validate()
            .and_then(|_| Endpoint::from_url(&self.url))
        {
            Ok(endpoint) => endpoint,
            Err(err) => {
                log_at!(self.options.verbose, error, url = %self.url, "cannot open: {err}");
                self.events.push_back(Event::OpenFailed(err));
                return Ok(());
            }
        };

        log_at!(self.options.verbose, info, url = %self.url, "connecting");
        self.commands.push_back(Command::Connect {
            host: endpoint.host.clone(),
            port: endpoint.port,
            secure: endpoint.secure,
            timeout: self.options.connect_timeout,
        });
        self.state = State::Connecting {
            endpoint,
            handshake: Handshake::new(),
            phase: ConnectPhase::Dialing,
            deadline: self.options.connect_timeout.map(|t| now + t),
        };
        Ok(())
    }

    /// Starts a normal (1000) close.
    pub fn close(&mut self, now: Instant) -> Result<()> {
        self.close_with_reason(CloseCode::Normal, "", now)
    }

    pub fn close_with_status(&mut self, code: CloseCode, now: Instant) -> Result<()> {
        self.close_with_reason(code, "", now)
    }

    /// Starts the closing handshake.
    ///
    /// While open, queued writes that have not started are dropped and a close frame is sent.
    /// While connecting, the attempt is abandoned and reported as [`Event::OpenFailed`].
    /// While already closing this does nothing.
    pub fn close_with_reason(&mut self, code: CloseCode, reason: &str, now: Instant) -> Result<()> {
        match self.state {
            State::Closed => Err(self.illegal("close")),
            State::Closing { .. } => Ok(()),
            State::Connecting { .. } => {
                log_at!(self.options.verbose, info, "close requested while connecting");
                self.fail_open(WebSocketError::ConnectionClosed);
                Ok(())
            }
            State::Open => {
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode(code.into()));
                }
                if reason.len() + 2 > MAX_CONTROL_PAYLOAD {
                    return Err(WebSocketError::ControlFramePayloadSize);
                }

                log_at!(self.options.verbose, info, code = u16::from(code), reason, "closing");
                self.transport.discard_pending_writes();
                self.assembler.reset();
                self.state = State::Closing {
                    record: CloseNegotiation::client_initiated(code),
                    deadline: self.close_deadline(now),
                };
                self.write_frame(Frame::close(code, reason), Tag::Close, now)
            }
        }
    }

    /// Queues a message, fragmenting it when it exceeds the configured fragment size.
    pub fn send(&mut self, message: impl Into<Message>, now: Instant) -> Result<()> {
        if !matches!(self.state, State::Open) {
            return Err(self.illegal("send"));
        }

        let frame = message.into().into_frame();
        match self.options.fragment_size {
            Some(size) if frame.payload().len() > size => {
                for fragment in frame.into_fragments(size) {
                    self.write_frame(fragment, Tag::Data, now)?;
                }
                Ok(())
            }
            _ => self.write_frame(frame, Tag::Data, now),
        }
    }

    pub fn send_text(&mut self, text: impl Into<String>, now: Instant) -> Result<()> {
        self.send(Message::Text(text.into()), now)
    }

    pub fn send_binary(&mut self, data: impl Into<Bytes>, now: Instant) -> Result<()> {
        self.send(Message::Binary(data.into()), now)
    }

    /// Queues a single frame exactly as given, e.g. a ping or a hand-made fragment.
    ///
    /// Close frames must go through [`close_with_reason`](Self::close_with_reason).
    pub fn send_frame(&mut self, frame: Frame, now: Instant) -> Result<()> {
        if !matches!(self.state, State::Open) {
            return Err(self.illegal("send"));
        }
        if frame.opcode() == OpCode::Close {
            return Err(self.illegal("send a raw close frame"));
        }

        let tag = if frame.opcode().is_control() {
            Tag::Control
        } else {
            Tag::Data
        };
        self.write_frame(frame, tag, now)
    }

    // ---- outputs ----

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn poll_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    /// Bytes waiting to be written to the stream.
    pub fn transmit(&self) -> Option<Bytes> {
        match self.state {
            State::Closed => None,
            _ => self.transport.transmit(),
        }
    }

    /// Earliest instant at which [`on_timer`](Self::on_timer) should run.
    pub fn next_deadline(&self) -> Option<Instant> {
        let own = match &self.state {
            State::Connecting { deadline, .. } | State::Closing { deadline, .. } => *deadline,
            _ => None,
        };
        match (own, self.transport.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ---- transport inputs ----

    /// The transport requested by [`Command::Connect`] is established.
    pub fn on_connected(&mut self, now: Instant) {
        let State::Connecting {
            endpoint,
            handshake,
            phase,
            deadline,
        } = &mut self.state
        else {
            log_at!(self.options.verbose, debug, state = %self.state(), "ignoring connected");
            return;
        };
        if !matches!(phase, ConnectPhase::Dialing) {
            return;
        }

        *phase = ConnectPhase::Upgrading;
        *deadline = None;

        let request = handshake.request(endpoint, &self.options);
        log_at!(self.options.verbose, debug, resource = %endpoint.resource, "sending upgrade request");
        log_at!(self.options.verbose, trace, "{}", String::from_utf8_lossy(&request));

        self.transport.enqueue_write(
            WriteTask {
                tag: Tag::Handshake,
                data: request,
                timeout: self.options.write_timeout,
            },
            now,
        );
        self.transport.enqueue_read(
            ReadTask::until(
                Tag::Handshake,
                Bytes::from_static(HEAD_TERMINATOR),
                self.options.read_timeout,
            ),
            now,
        );
    }

    /// Bytes arrived from the stream.
    pub fn on_bytes(&mut self, data: &[u8], now: Instant) {
        if matches!(self.state, State::Closed) {
            return;
        }
        self.transport.on_bytes(data);
        self.drive_reads(now);
    }

    /// The stream accepted `n` bytes of [`transmit`](Self::transmit).
    pub fn on_written(&mut self, n: usize, now: Instant) {
        if matches!(self.state, State::Closed) {
            return;
        }
        if let Some(Tag::Close) = self.transport.on_written(n, now) {
            if let State::Closing { record, .. } = &mut self.state {
                record.close_flushed = true;
            }
            self.maybe_finish_close();
        }
    }

    /// Expires whichever deadline has passed.
    pub fn on_timer(&mut self, now: Instant) {
        match &self.state {
            State::Connecting {
                deadline: Some(deadline),
                ..
            } if *deadline <= now => {
                log_at!(self.options.verbose, error, "connect timed out");
                return self.fail_open(WebSocketError::ConnectTimeout);
            }
            State::Closing {
                deadline: Some(deadline),
                ..
            } if *deadline <= now => {
                log_at!(self.options.verbose, error, "peer did not answer the close frame");
                return self.fail(WebSocketError::CloseTimeout);
            }
            _ => {}
        }

        if let Some(err) = self.transport.on_timer(now) {
            self.fail(err);
        }
    }

    /// The stream reported an error; the connection is lost.
    pub fn on_stream_error(&mut self, err: io::Error) {
        self.fail(err.into());
    }

    /// The peer closed the stream.
    pub fn on_stream_closed(&mut self) {
        match &self.state {
            State::Closed => {}
            State::Closing { record, .. } if record.peer_close_received => {
                let status = record.final_status();
                self.commands.push_back(Command::Disconnect);
                self.finish(status, None);
            }
            _ => self.fail(WebSocketError::ConnectionClosed),
        }
    }

    /// The host application moved to the background.
    pub fn on_backgrounded(&mut self) {
        if self.options.keep_working_in_background {
            log_at!(self.options.verbose, debug, "staying connected in the background");
            return;
        }
        self.fail(WebSocketError::Backgrounded);
    }

    // ---- internals ----

    fn illegal(&self, operation: &'static str) -> WebSocketError {
        WebSocketError::IllegalState {
            operation,
            state: self.state(),
        }
    }

    fn close_deadline(&self, now: Instant) -> Option<Instant> {
        self.options.close_timeout.map(|t| now + t)
    }

    fn reset_connection(&mut self) {
        self.transport.abort();
        self.decoder.reset();
        self.assembler.reset();
        self.inbound.clear();
        self.protocol = None;
    }

    fn write_frame(&mut self, frame: Frame, tag: Tag, now: Instant) -> Result<()> {
        let data = self.encoder.encode_frame(frame)?;
        self.transport.enqueue_write(
            WriteTask {
                tag,
                data,
                timeout: self.options.write_timeout,
            },
            now,
        );
        Ok(())
    }

    fn read_frame_bytes(&mut self, len: usize, now: Instant) {
        self.transport
            .enqueue_read(ReadTask::exact(Tag::Frame, len, self.options.read_timeout), now);
    }

    fn drive_reads(&mut self, now: Instant) {
        while !matches!(self.state, State::Closed) {
            let Some(result) = self.transport.poll_read(now) else {
                break;
            };
            match result {
                Ok((Tag::Handshake, head)) => self.on_handshake_response(&head, now),
                Ok((_, data)) => {
                    self.inbound.extend_from_slice(&data);
                    self.decode_frames(now);
                }
                Err(err) => self.fail(err),
            }
        }
    }

    fn on_handshake_response(&mut self, head: &[u8], now: Instant) {
        let State::Connecting { handshake, .. } = &self.state else {
            return;
        };

        match handshake.verify(head, &self.options.protocols) {
            Ok(protocol) => {
                log_at!(self.options.verbose, info, protocol = ?protocol, "connection open");
                self.protocol = protocol.clone();
                self.state = State::Open;
                self.events.push_back(Event::Opened { protocol });
                self.read_frame_bytes(2, now);
            }
            Err(err) => {
                log_at!(self.options.verbose, error, "handshake failed: {err}");
                self.fail_open(err);
            }
        }
    }

    fn decode_frames(&mut self, now: Instant) {
        loop {
            match self.decoder.decode_frame(&mut self.inbound) {
                Ok(Decoded::Frame(frame)) => {
                    log_at!(
                        self.options.verbose,
                        trace,
                        opcode = ?frame.opcode(),
                        fin = frame.is_fin(),
                        len = frame.payload().len(),
                        "frame received"
                    );
                    self.on_frame(frame, now);
                    if matches!(self.state, State::Closed) {
                        return;
                    }
                }
                Ok(Decoded::NeedMore(len)) => return self.read_frame_bytes(len, now),
                Err(err) => return self.fail(err),
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) {
        match frame.opcode() {
            OpCode::Close => self.on_peer_close(frame, now),
            OpCode::Ping => {
                let reply = (matches!(self.state, State::Open) && !self.options.disable_auto_pong)
                    .then(|| Frame::pong(frame.payload().clone()));
                self.events.push_back(Event::Frame(frame));
                if let Some(pong) = reply {
                    if let Err(err) = self.write_frame(pong, Tag::Control, now) {
                        self.fail(err);
                    }
                }
            }
            OpCode::Pong => self.events.push_back(Event::Frame(frame)),
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                if matches!(self.state, State::Closing { .. }) {
                    log_at!(self.options.verbose, debug, "dropping data frame while closing");
                    return;
                }
                match self.assembler.push(&frame) {
                    Ok(delivery) => {
                        self.events.push_back(Event::Frame(frame));
                        if let Some(delivery) = delivery {
                            match message_event(delivery) {
                                Ok(event) => self.events.push_back(event),
                                Err(err) => self.fail(err),
                            }
                        }
                    }
                    Err(err) => self.fail(err),
                }
            }
        }
    }

    fn on_peer_close(&mut self, frame: Frame, now: Instant) {
        let close = match ClosePayload::parse(frame.payload()) {
            Ok(close) => close,
            Err(err) => return self.fail(err),
        };
        log_at!(
            self.options.verbose,
            info,
            code = ?close.code.map(u16::from),
            reason = ?close.reason,
            "close frame received"
        );
        self.events.push_back(Event::Frame(frame));

        match &mut self.state {
            State::Open => {
                self.transport.discard_pending_writes();
                self.assembler.reset();
                let echo = match close.code {
                    Some(code) => Frame::close(code, ""),
                    None => Frame::close_raw(Bytes::new()),
                };
                self.state = State::Closing {
                    record: CloseNegotiation::server_initiated(close.code),
                    deadline: self.close_deadline(now),
                };
                if let Err(err) = self.write_frame(echo, Tag::Close, now) {
                    self.fail(err);
                }
            }
            State::Closing { record, .. } => {
                record.on_peer_close(close.code);
                self.maybe_finish_close();
            }
            _ => {}
        }
    }

    fn maybe_finish_close(&mut self) {
        let State::Closing { record, .. } = &self.state else {
            return;
        };
        if !record.is_complete() {
            return;
        }

        let status = record.final_status();
        self.commands.push_back(Command::ShutdownWrite);
        self.commands.push_back(Command::Disconnect);
        self.finish(status, None);
    }

    /// Tears down an open or closing connection.
    fn fail(&mut self, err: WebSocketError) {
        match self.state {
            State::Closed => return,
            State::Connecting { .. } => return self.fail_open(err),
            State::Open | State::Closing { .. } => {}
        }

        log_at!(self.options.verbose, error, "connection failed: {err}");
        self.commands.push_back(Command::Disconnect);
        self.finish(err.close_code(), Some(err));
    }

    fn fail_open(&mut self, err: WebSocketError) {
        self.commands.push_back(Command::Disconnect);
        self.reset_connection();
        self.state = State::Closed;
        self.events.push_back(Event::OpenFailed(err));
    }

    fn finish(&mut self, status: CloseCode, error: Option<WebSocketError>) {
        log_at!(self.options.verbose, info, status = u16::from(status), "connection closed");
        self.reset_connection();
        self.state = State::Closed;
        self.events.push_back(Event::Closed { status, error });
    }
}

fn utf8_string(payload: Bytes) -> Result<String> {
    String::from_utf8(payload.to_vec()).map_err(|_| WebSocketError::InvalidUTF8)
}

fn message_event(delivery: Delivery) -> Result<Event> {
    Ok(match delivery {
        Delivery::Message {
            kind: MessageKind::Text,
            payload,
        } => Event::Text(utf8_string(payload)?),
        Delivery::Message {
            kind: MessageKind::Binary,
            payload,
        } => Event::Binary(payload),
        Delivery::Chunk {
            kind: MessageKind::Text,
            payload,
            index,
            is_final,
        } => Event::TextChunk {
            text: utf8_string(payload)?,
            index,
            is_final,
        },
        Delivery::Chunk {
            kind: MessageKind::Binary,
            payload,
            index,
            is_final,
        } => Event::BinaryChunk {
            data: payload,
            index,
            is_final,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> WebSocketClient {
        WebSocketClient::new("ws://localhost:9001/".parse().unwrap(), Options::default())
    }

    #[test]
    fn test_open_issues_connect() {
        let now = Instant::now();
        let mut ws = client();
        ws.open(now).unwrap();

        assert_eq!(ws.state(), ConnectionState::Connecting);
        assert_eq!(
            ws.poll_command(),
            Some(Command::Connect {
                host: "localhost".into(),
                port: 9001,
                secure: false,
                timeout: Some(Duration::from_secs(10)),
            })
        );
        assert_eq!(ws.next_deadline(), Some(now + Duration::from_secs(10)));
        assert!(ws.transmit().is_none());
    }

    #[test]
    fn test_open_twice_is_illegal() {
        let now = Instant::now();
        let mut ws = client();
        ws.open(now).unwrap();
        assert!(matches!(
            ws.open(now),
            Err(WebSocketError::IllegalState {
                operation: "open",
                state: ConnectionState::Connecting
            })
        ));
    }

    #[test]
    fn test_connected_sends_request() {
        let now = Instant::now();
        let mut ws = client();
        ws.open(now).unwrap();
        ws.on_connected(now);

        let request = ws.transmit().unwrap();
        assert!(request.starts_with(b"GET / HTTP/1.1\r\n"));
        assert_eq!(ws.next_deadline(), None);
    }

    #[test]
    fn test_send_requires_open() {
        let mut ws = client();
        assert!(matches!(
            ws.send_text("x", Instant::now()),
            Err(WebSocketError::IllegalState { operation: "send", .. })
        ));
        assert!(matches!(
            ws.close(Instant::now()),
            Err(WebSocketError::IllegalState { operation: "close", .. })
        ));
    }

    #[test]
    fn test_invalid_url_reports_open_failure() {
        let mut ws =
            WebSocketClient::new("ftp://example.com".parse().unwrap(), Options::default());
        ws.open(Instant::now()).unwrap();
        assert!(matches!(
            ws.poll_event(),
            Some(Event::OpenFailed(WebSocketError::UnsupportedScheme(_)))
        ));
        assert_eq!(ws.state(), ConnectionState::Closed);
        assert!(ws.poll_command().is_none());
    }

    #[test]
    fn test_message_conversions() {
        assert_eq!(Message::from("a"), Message::Text("a".into()));
        assert_eq!(
            Message::from(vec![1u8]),
            Message::Binary(Bytes::from_static(&[1]))
        );
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }
}
