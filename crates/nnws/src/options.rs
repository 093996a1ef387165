//! WebSocket connection configuration options.

use std::time::Duration;

use tokio_rustls::TlsConnector;

use crate::{Result, WebSocketError};

/// Default limit on the size of a single incoming message: 16 MiB.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default time allowed to establish the transport connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for the peer to answer our close frame.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Verbosity of the connection's diagnostic output. Levels are cumulative, `Debug` also
/// emits everything `Info` and `Error` would.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum VerboseLevel {
    #[default]
    None,
    Error,
    Info,
    Debug,
    Trace,
}

/// What to do when an incoming message grows past [`Options::max_payload_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadLimitBehavior {
    /// Fail the connection with a "message too big" error.
    #[default]
    Error,
    /// Deliver the message in chunks, each at most roughly the limit in size.
    Split,
}

/// Configuration options for a WebSocket connection.
///
/// # Common Patterns
///
/// ```rust
/// use std::time::Duration;
///
/// use nnws::{Options, PayloadLimitBehavior, VerboseLevel};
///
/// let options = Options::default()
///     .with_origin("https://example.com")
///     .with_protocols(["chat", "superchat"])
///     .with_read_timeout(Duration::from_secs(30))
///     .with_max_payload_size(1024 * 1024)
///     .with_payload_limit_behavior(PayloadLimitBehavior::Split)
///     .with_verbose(VerboseLevel::Info);
///
/// assert!(options.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct Options {
    /// Value of the `Origin` header, omitted when `None`.
    pub origin: Option<String>,

    /// Sub-protocols offered in `Sec-WebSocket-Protocol`, in order of preference.
    pub protocols: Vec<String>,

    /// Time allowed for the transport to connect.
    ///
    /// Default: 10 seconds. `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,

    /// Time allowed for each pending read (handshake response, frame header, frame payload)
    /// to complete once it becomes active.
    ///
    /// Default: `None` (no timeout)
    pub read_timeout: Option<Duration>,

    /// Time allowed for each queued write to drain once it becomes active.
    ///
    /// Default: `None` (no timeout)
    pub write_timeout: Option<Duration>,

    /// Time allowed for the peer's close frame to arrive after we entered the closing state.
    ///
    /// Default: 5 seconds. `None` waits for the peer or the transport indefinitely.
    pub close_timeout: Option<Duration>,

    /// Maximum size of an incoming message, in bytes.
    ///
    /// Default: 16 MiB
    pub max_payload_size: usize,

    /// What happens when an incoming message exceeds [`max_payload_size`](Self::max_payload_size).
    ///
    /// Default: [`PayloadLimitBehavior::Error`]
    pub payload_limit_behavior: PayloadLimitBehavior,

    /// Outgoing messages larger than this are sent as several fragments.
    ///
    /// Default: `None` (every message is a single frame)
    pub fragment_size: Option<usize>,

    /// Keep the connection alive when the host application moves to the background.
    ///
    /// Default: `false`
    pub keep_working_in_background: bool,

    /// Do not answer pings automatically.
    ///
    /// Default: `false`
    pub disable_auto_pong: bool,

    /// Diagnostic output level.
    ///
    /// Default: [`VerboseLevel::None`]
    pub verbose: VerboseLevel,

    /// Enables TCP_NODELAY on the underlying socket.
    ///
    /// Default: `false`
    pub no_delay: bool,

    /// TLS connector used for `wss://`. A connector trusting the webpki roots is built when
    /// this is `None`.
    pub tls_connector: Option<TlsConnector>,

    /// Server name presented during the TLS handshake, defaults to the URL host.
    pub tls_server_name: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            origin: None,
            protocols: Vec::new(),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            read_timeout: None,
            write_timeout: None,
            close_timeout: Some(DEFAULT_CLOSE_TIMEOUT),
            max_payload_size: MAX_PAYLOAD_SIZE,
            payload_limit_behavior: PayloadLimitBehavior::Error,
            fragment_size: None,
            keep_working_in_background: false,
            disable_auto_pong: false,
            verbose: VerboseLevel::None,
            no_delay: false,
            tls_connector: None,
            tls_server_name: None,
        }
    }
}

impl Options {
    /// Sets the `Origin` header sent with the upgrade request.
    pub fn with_origin(self, origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..self
        }
    }

    /// Sets the sub-protocols offered to the server.
    pub fn with_protocols<I, S>(self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_read_timeout(self, timeout: Duration) -> Self {
        Self {
            read_timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_write_timeout(self, timeout: Duration) -> Self {
        Self {
            write_timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: Some(timeout),
            ..self
        }
    }

    /// Disables every timeout, including the connect and close timeouts.
    pub fn without_timeouts(self) -> Self {
        Self {
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            close_timeout: None,
            ..self
        }
    }

    /// Sets the maximum size of an incoming message.
    pub fn with_max_payload_size(self, size: usize) -> Self {
        Self {
            max_payload_size: size,
            ..self
        }
    }

    pub fn with_payload_limit_behavior(self, behavior: PayloadLimitBehavior) -> Self {
        Self {
            payload_limit_behavior: behavior,
            ..self
        }
    }

    /// Fragments outgoing messages into frames of at most `size` payload bytes.
    pub fn with_fragment_size(self, size: usize) -> Self {
        Self {
            fragment_size: Some(size),
            ..self
        }
    }

    pub fn with_background_operation(self) -> Self {
        Self {
            keep_working_in_background: true,
            ..self
        }
    }

    pub fn with_auto_pong_disabled(self) -> Self {
        Self {
            disable_auto_pong: true,
            ..self
        }
    }

    pub fn with_verbose(self, verbose: VerboseLevel) -> Self {
        Self { verbose, ..self }
    }

    /// Enables TCP_NODELAY on the TCP stream.
    pub fn with_no_delay(self) -> Self {
        Self {
            no_delay: true,
            ..self
        }
    }

    /// Uses a custom TLS connector for `wss://` URLs.
    pub fn with_tls_connector(self, connector: TlsConnector) -> Self {
        Self {
            tls_connector: Some(connector),
            ..self
        }
    }

    pub fn with_tls_server_name(self, name: impl Into<String>) -> Self {
        Self {
            tls_server_name: Some(name.into()),
            ..self
        }
    }

    /// Checks the options for values that could never work.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(WebSocketError::InvalidConfig(msg.to_owned()));

        if self.max_payload_size == 0 {
            return invalid("max_payload_size must be greater than 0");
        }
        if self.fragment_size == Some(0) {
            return invalid("fragment_size must be greater than 0");
        }
        let timeouts = [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("close_timeout", self.close_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout == Some(Duration::ZERO) {
                return Err(WebSocketError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if let Some(protocol) = self
            .protocols
            .iter()
            .find(|p| p.is_empty() || p.contains([',', ' ', '\r', '\n']))
        {
            return Err(WebSocketError::InvalidConfig(format!(
                "invalid sub-protocol token {protocol:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(options.close_timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.read_timeout, None);
        assert_eq!(options.max_payload_size, 16 * 1024 * 1024);
        assert_eq!(options.payload_limit_behavior, PayloadLimitBehavior::Error);
        assert!(!options.disable_auto_pong);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let options = Options::default()
            .with_protocols(["chat"])
            .with_fragment_size(1024)
            .without_timeouts();
        assert_eq!(options.protocols, vec!["chat".to_string()]);
        assert_eq!(options.fragment_size, Some(1024));
        assert_eq!(options.connect_timeout, None);
        assert_eq!(options.close_timeout, None);
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        assert!(Options::default().with_max_payload_size(0).validate().is_err());
        assert!(Options::default().with_fragment_size(0).validate().is_err());
        assert!(
            Options::default()
                .with_read_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(Options::default().with_protocols(["a,b"]).validate().is_err());
        assert!(Options::default().with_protocols([""]).validate().is_err());
    }

    #[test]
    fn test_verbose_levels_are_ordered() {
        assert!(VerboseLevel::Trace > VerboseLevel::Debug);
        assert!(VerboseLevel::Info >= VerboseLevel::Error);
        assert!(VerboseLevel::None < VerboseLevel::Error);
    }
}
