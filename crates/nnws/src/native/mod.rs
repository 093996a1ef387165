//! Tokio host for [`WebSocketClient`].
//!
//! [`WebSocket::connect`] spawns a task that owns the socket and the state machine. The task
//! carries out the machine's [`Command`]s, feeds it socket reads, drains its pending writes and
//! fires its timers. The returned [`WebSocket`] handle forwards consumer operations to the task,
//! and every [`Event`] is delivered on the returned channel.
//!
//! ```text
//!   WebSocket handle ──requests──► driver task ──events──► UnboundedReceiver<Event>
//!                                     │    ▲
//!                        transmit()   │    │ on_bytes() / on_written() / on_timer()
//!                                     ▼    │
//!                                 TCP / TLS stream
//! ```

mod stream;

use std::{future::Future, io, sync::Arc, time::Instant};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_rustls::{
    TlsConnector,
    rustls::{self, crypto::CryptoProvider, pki_types::ServerName},
};
use url::Url;

pub use self::stream::MaybeTlsStream;
use crate::{
    Result, WebSocketError,
    client::{Command, ConnectionState, Event, Message, WebSocketClient},
    close::CloseCode,
    frame::Frame,
    options::Options,
};

/// Size of the buffer used for each socket read.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// A TCP stream, TLS-wrapped for `wss://`.
pub type TcpWebSocketStream = MaybeTlsStream<TcpStream>;

/// Establishes the byte stream requested by [`Command::Connect`].
///
/// [`TcpDialer`] is used by [`WebSocket::connect`]. Tests and custom transports can supply
/// their own through [`WebSocket::connect_with`].
pub trait Dialer: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn dial(
        &mut self,
        host: String,
        port: u16,
        secure: bool,
    ) -> BoxFuture<'static, io::Result<Self::Stream>>;
}

/// Connects over TCP, adding TLS for secure endpoints.
#[derive(Clone, Default)]
pub struct TcpDialer {
    connector: Option<TlsConnector>,
    server_name: Option<String>,
    no_delay: bool,
}

impl TcpDialer {
    pub fn from_options(options: &Options) -> Self {
        Self {
            connector: options.tls_connector.clone(),
            server_name: options.tls_server_name.clone(),
            no_delay: options.no_delay,
        }
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpWebSocketStream;

    fn dial(
        &mut self,
        host: String,
        port: u16,
        secure: bool,
    ) -> BoxFuture<'static, io::Result<Self::Stream>> {
        let connector = self.connector.clone();
        let server_name = self.server_name.clone();
        let no_delay = self.no_delay;

        Box::pin(async move {
            let tcp_stream = TcpStream::connect((host.as_str(), port)).await?;
            let _ = tcp_stream.set_nodelay(no_delay);

            if !secure {
                return Ok(MaybeTlsStream::Plain(tcp_stream));
            }

            let connector = match connector {
                Some(connector) => connector,
                None => tls_connector()?,
            };
            let domain = ServerName::try_from(server_name.unwrap_or(host))
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;

            let tls_stream = connector.connect(domain, tcp_stream).await?;
            Ok(MaybeTlsStream::Tls(Box::new(tls_stream)))
        })
    }
}

type Reply = oneshot::Sender<Result<()>>;

enum Request {
    Open(Reply),
    Send(Message, Reply),
    SendFrame(Frame, Reply),
    Close(CloseCode, String, Reply),
}

/// Handle to a connection running on a tokio task.
///
/// Dropping every clone of the handle closes an open connection gracefully and ends the task
/// once it is closed.
#[derive(Clone)]
pub struct WebSocket {
    requests: mpsc::UnboundedSender<Request>,
}

impl WebSocket {
    /// Starts connecting to `url` over TCP or TLS.
    ///
    /// Must be called from within a tokio runtime. The first event is either
    /// [`Event::Opened`] or [`Event::OpenFailed`].
    ///
    /// ```no_run
    /// use nnws::{Options, native::WebSocket};
    ///
    /// #[tokio::main]
    /// async fn main() -> nnws::Result<()> {
    ///     let (ws, mut events) =
    ///         WebSocket::connect("ws://localhost:9001".parse()?, Options::default())?;
    ///     while let Some(event) = events.recv().await {
    ///         println!("{event:?}");
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub fn connect(url: Url, options: Options) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        let dialer = TcpDialer::from_options(&options);
        Self::connect_with(url, options, dialer)
    }

    /// Like [`connect`](Self::connect), with a custom transport.
    pub fn connect_with<D: Dialer>(
        url: Url,
        options: Options,
        dialer: D,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        options.validate()?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut client = WebSocketClient::new(url, options);
        client.open(Instant::now())?;

        let driver = Driver {
            client,
            dialer,
            requests: requests_rx,
            events: events_tx,
            dialing: None,
            reader: None,
            writer: None,
        };
        tokio::spawn(driver.run());

        Ok((
            Self {
                requests: requests_tx,
            },
            events_rx,
        ))
    }

    /// Opens the connection again after it closed.
    pub async fn reopen(&self) -> Result<()> {
        self.request(Request::Open).await
    }

    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        self.request(|reply| Request::Send(message, reply)).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Text(text.into())).await
    }

    pub async fn send_binary(&self, data: impl Into<bytes::Bytes>) -> Result<()> {
        self.send(Message::Binary(data.into())).await
    }

    /// Sends a single frame as-is, see [`WebSocketClient::send_frame`].
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.request(|reply| Request::SendFrame(frame, reply)).await
    }

    pub async fn close(&self) -> Result<()> {
        self.close_with_reason(CloseCode::Normal, "").await
    }

    pub async fn close_with_status(&self, code: CloseCode) -> Result<()> {
        self.close_with_reason(code, "").await
    }

    pub async fn close_with_reason(&self, code: CloseCode, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.request(|reply| Request::Close(code, reason, reply))
            .await
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Request) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .map_err(|_| WebSocketError::ConnectionClosed)?;
        rx.await.map_err(|_| WebSocketError::ConnectionClosed)?
    }
}

struct Driver<D: Dialer> {
    client: WebSocketClient,
    dialer: D,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<Event>,
    dialing: Option<BoxFuture<'static, io::Result<D::Stream>>>,
    reader: Option<ReadHalf<D::Stream>>,
    writer: Option<WriteHalf<D::Stream>>,
}

impl<D: Dialer> Driver<D> {
    async fn run(mut self) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut handle_alive = true;

        loop {
            self.apply_commands().await;
            while let Some(event) = self.client.poll_event() {
                let _ = self.events.send(event);
            }

            if !handle_alive && self.client.state() == ConnectionState::Closed {
                break;
            }

            let transmit = self.client.transmit();
            let deadline = self.client.next_deadline();

            tokio::select! {
                request = self.requests.recv(), if handle_alive => match request {
                    Some(request) => self.on_request(request),
                    None => {
                        handle_alive = false;
                        if self.client.state() != ConnectionState::Closed {
                            let _ = self.client.close(Instant::now());
                        }
                    }
                },
                result = dial(&mut self.dialing) => {
                    self.dialing = None;
                    match result {
                        Ok(stream) => {
                            let (reader, writer) = tokio::io::split(stream);
                            self.reader = Some(reader);
                            self.writer = Some(writer);
                            self.client.on_connected(Instant::now());
                        }
                        Err(err) => self.client.on_stream_error(err),
                    }
                },
                result = read_some(&mut self.reader, &mut buf) => match result {
                    Ok(0) => self.client.on_stream_closed(),
                    Ok(n) => self.client.on_bytes(&buf[..n], Instant::now()),
                    Err(err) => self.client.on_stream_error(err),
                },
                result = write_some(&mut self.writer, transmit.as_deref()) => match result {
                    Ok(0) => self.client.on_stream_error(io::ErrorKind::WriteZero.into()),
                    Ok(n) => {
                        if let Err(err) = self.flush().await {
                            self.client.on_stream_error(err);
                        } else {
                            self.client.on_written(n, Instant::now());
                        }
                    }
                    Err(err) => self.client.on_stream_error(err),
                },
                _ = sleep_until(deadline) => self.client.on_timer(Instant::now()),
            }
        }

        log_at!(self.client.options().verbose, debug, url = %self.client.url(), "driver finished");
    }

    async fn apply_commands(&mut self) {
        while let Some(command) = self.client.poll_command() {
            match command {
                Command::Connect {
                    host, port, secure, ..
                } => {
                    self.dialing = Some(self.dialer.dial(host, port, secure));
                }
                Command::ShutdownWrite => {
                    if let Some(writer) = self.writer.as_mut() {
                        let _ = writer.shutdown().await;
                    }
                }
                Command::Disconnect => {
                    self.dialing = None;
                    self.reader = None;
                    self.writer = None;
                }
            }
        }
    }

    fn on_request(&mut self, request: Request) {
        let now = Instant::now();
        let (result, reply) = match request {
            Request::Open(reply) => (self.client.open(now), reply),
            Request::Send(message, reply) => (self.client.send(message, now), reply),
            Request::SendFrame(frame, reply) => (self.client.send_frame(frame, now), reply),
            Request::Close(code, reason, reply) => {
                (self.client.close_with_reason(code, &reason, now), reply)
            }
        };
        let _ = reply.send(result);
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }
}

async fn dial<S>(dialing: &mut Option<BoxFuture<'static, io::Result<S>>>) -> io::Result<S> {
    match dialing {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn write_some<W: AsyncWrite + Unpin>(writer: &mut Option<W>, data: Option<&[u8]>) -> io::Result<usize> {
    match (writer, data) {
        (Some(writer), Some(data)) => writer.write(data).await,
        _ => std::future::pending().await,
    }
}

fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
            None => std::future::pending().await,
        }
    }
}

/// Creates a TLS connector trusting the webpki root certificates.
fn tls_connector() -> io::Result<TlsConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = match CryptoProvider::get_default().cloned() {
        Some(provider) => provider,
        None => default_provider()?,
    };

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(feature = "rustls-ring")]
fn default_provider() -> io::Result<Arc<CryptoProvider>> {
    Ok(Arc::new(rustls::crypto::ring::default_provider()))
}

#[cfg(all(feature = "rustls-aws-lc-rs", not(feature = "rustls-ring")))]
fn default_provider() -> io::Result<Arc<CryptoProvider>> {
    Ok(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

#[cfg(not(any(feature = "rustls-ring", feature = "rustls-aws-lc-rs")))]
fn default_provider() -> io::Result<Arc<CryptoProvider>> {
    Err(io::Error::other(
        "no rustls crypto provider: set Options::tls_connector or enable `rustls-ring` or `rustls-aws-lc-rs`",
    ))
}
