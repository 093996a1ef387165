//! The HTTP/1.1 upgrade that opens a WebSocket connection (RFC 6455 Section 4).

use std::fmt::Write as _;

use base64::prelude::*;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use url::{Host, Url};

use crate::{Result, WebSocketError, options::Options};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this crate speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// End of an HTTP message head.
pub(crate) const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

const MAX_RESPONSE_HEADERS: usize = 64;

/// Where a `ws://` or `wss://` URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host to connect to, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// `true` for `wss://`.
    pub secure: bool,
    /// Path and query sent in the request line.
    pub resource: String,
    /// Value of the `Host` header; the port is omitted when it is the scheme default.
    pub authority: String,
}

impl Endpoint {
    pub fn from_url(url: &Url) -> Result<Self> {
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => return Err(WebSocketError::UnsupportedScheme(other.to_owned())),
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_owned(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(WebSocketError::MissingHost),
        };
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });

        let mut resource = match url.path() {
            "" => "/".to_owned(),
            path => path.to_owned(),
        };
        if let Some(query) = url.query() {
            resource.push('?');
            resource.push_str(query);
        }

        let mut authority = url.host_str().unwrap_or(&host).to_owned();
        if let Some(port) = url.port() {
            let _ = write!(authority, ":{port}");
        }

        Ok(Self {
            host,
            port,
            secure,
            resource,
            authority,
        })
    }
}

/// Random 16-byte nonce, base64 encoded.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// The `Sec-WebSocket-Accept` value a server must answer `key` with.
pub fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// One opening handshake: the key we send and the accept value we expect back.
#[derive(Debug, Clone)]
pub struct Handshake {
    key: String,
    accept: String,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    /// Starts a handshake with a fresh random key.
    pub fn new() -> Self {
        Self::with_key(generate_key())
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        let key = key.into();
        let accept = accept_key(key.as_bytes());
        Self { key, accept }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The upgrade request.
    pub fn request(&self, endpoint: &Endpoint, options: &Options) -> Bytes {
        let mut req = String::with_capacity(256);
        let _ = write!(req, "GET {} HTTP/1.1\r\n", endpoint.resource);
        let _ = write!(req, "Host: {}\r\n", endpoint.authority);
        req.push_str("Upgrade: websocket\r\n");
        req.push_str("Connection: Upgrade\r\n");
        let _ = write!(req, "Sec-WebSocket-Key: {}\r\n", self.key);
        let _ = write!(req, "Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n");
        if let Some(origin) = &options.origin {
            let _ = write!(req, "Origin: {origin}\r\n");
        }
        if !options.protocols.is_empty() {
            let _ = write!(
                req,
                "Sec-WebSocket-Protocol: {}\r\n",
                options.protocols.join(", ")
            );
        }
        req.push_str("\r\n");
        Bytes::from(req)
    }

    /// Validates the response head, returning the sub-protocol the server selected.
    pub fn verify(&self, head: &[u8], offered_protocols: &[String]) -> Result<Option<String>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) | Err(_) => {
                return Err(WebSocketError::InvalidHttpResponse);
            }
        }

        if response.version != Some(1) {
            return Err(WebSocketError::InvalidHttpResponse);
        }
        let code = response.code.ok_or(WebSocketError::InvalidHttpResponse)?;
        if code != 101 {
            return Err(WebSocketError::InvalidStatusCode(code));
        }

        let headers = response.headers;

        if !header(headers, "upgrade").is_some_and(|h| h.trim().eq_ignore_ascii_case("websocket"))
        {
            return Err(WebSocketError::InvalidUpgradeHeader);
        }

        if !header(headers, "connection").is_some_and(|h| {
            h.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        }) {
            return Err(WebSocketError::InvalidConnectionHeader);
        }

        if header(headers, "sec-websocket-accept").map(str::trim) != Some(self.accept.as_str()) {
            return Err(WebSocketError::InvalidAcceptKey);
        }

        if let Some(extensions) = header(headers, "sec-websocket-extensions") {
            if !extensions.trim().is_empty() {
                return Err(WebSocketError::UnsupportedExtension(
                    extensions.trim().to_owned(),
                ));
            }
        }

        match header(headers, "sec-websocket-protocol").map(str::trim) {
            None | Some("") => Ok(None),
            Some(protocol) if offered_protocols.iter().any(|p| p == protocol) => {
                Ok(Some(protocol.to_owned()))
            }
            Some(protocol) => Err(WebSocketError::InvalidSubprotocol(protocol.to_owned())),
        }
    }
}

fn header<'h>(headers: &'h [httparse::Header<'_>], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

#[cfg(test)]
mod tests {
    use base64::prelude::*;

    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn response(extra: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
             {extra}\r\n"
        )
    }

    #[test]
    fn test_accept_key_known_vector() {
        assert_eq!(
            accept_key(SAMPLE_KEY.as_bytes()),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generated_key_is_16_bytes() {
        let key = generate_key();
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_endpoint_from_url() {
        let ep = Endpoint::from_url(&"ws://example.com/chat?room=1".parse().unwrap()).unwrap();
        assert_eq!(ep.host, "example.com");
        assert_eq!(ep.port, 80);
        assert!(!ep.secure);
        assert_eq!(ep.resource, "/chat?room=1");
        assert_eq!(ep.authority, "example.com");

        let ep = Endpoint::from_url(&"wss://example.com:9443".parse().unwrap()).unwrap();
        assert_eq!(ep.port, 9443);
        assert!(ep.secure);
        assert_eq!(ep.resource, "/");
        assert_eq!(ep.authority, "example.com:9443");

        let ep = Endpoint::from_url(&"ws://[::1]:8080/".parse().unwrap()).unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.authority, "[::1]:8080");
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            Endpoint::from_url(&"http://example.com".parse().unwrap()),
            Err(WebSocketError::UnsupportedScheme(s)) if s == "http"
        ));
    }

    #[test]
    fn test_request_contents() {
        let ep = Endpoint::from_url(&"ws://example.com/chat".parse().unwrap()).unwrap();
        let options = Options::default()
            .with_origin("http://example.com")
            .with_protocols(["chat", "superchat"]);
        let req = Handshake::with_key(SAMPLE_KEY).request(&ep, &options);
        let req = std::str::from_utf8(&req).unwrap();

        assert!(req.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(req.contains("Host: example.com\r\n"));
        assert!(req.contains("Upgrade: websocket\r\n"));
        assert!(req.contains("Connection: Upgrade\r\n"));
        assert!(req.contains(&format!("Sec-WebSocket-Key: {SAMPLE_KEY}\r\n")));
        assert!(req.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(req.contains("Origin: http://example.com\r\n"));
        assert!(req.contains("Sec-WebSocket-Protocol: chat, superchat\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_request_without_optional_headers() {
        let ep = Endpoint::from_url(&"ws://example.com".parse().unwrap()).unwrap();
        let req = Handshake::with_key(SAMPLE_KEY).request(&ep, &Options::default());
        let req = std::str::from_utf8(&req).unwrap();
        assert!(!req.contains("Origin:"));
        assert!(!req.contains("Sec-WebSocket-Protocol:"));
    }

    #[test]
    fn test_verify_ok() {
        let hs = Handshake::with_key(SAMPLE_KEY);
        assert_eq!(hs.verify(response("").as_bytes(), &[]).unwrap(), None);

        let offered = vec!["chat".to_string()];
        let resp = response("Sec-WebSocket-Protocol: chat\r\n");
        assert_eq!(
            hs.verify(resp.as_bytes(), &offered).unwrap().as_deref(),
            Some("chat")
        );
    }

    #[test]
    fn test_verify_header_case_and_token_list() {
        let resp = "HTTP/1.1 101 Switching Protocols\r\n\
                    upgrade: WebSocket\r\n\
                    connection: keep-alive, Upgrade\r\n\
                    sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        assert!(Handshake::with_key(SAMPLE_KEY).verify(resp.as_bytes(), &[]).is_ok());
    }

    #[test]
    fn test_verify_status() {
        let resp = "HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n";
        assert!(matches!(
            Handshake::with_key(SAMPLE_KEY).verify(resp.as_bytes(), &[]),
            Err(WebSocketError::InvalidStatusCode(403))
        ));
    }

    #[test]
    fn test_verify_missing_upgrade() {
        let resp = "HTTP/1.1 101 Switching Protocols\r\n\
                    Connection: Upgrade\r\n\
                    Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        assert!(matches!(
            Handshake::with_key(SAMPLE_KEY).verify(resp.as_bytes(), &[]),
            Err(WebSocketError::InvalidUpgradeHeader)
        ));
    }

    #[test]
    fn test_verify_wrong_connection() {
        let resp = "HTTP/1.1 101 Switching Protocols\r\n\
                    Upgrade: websocket\r\n\
                    Connection: close\r\n\
                    Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        assert!(matches!(
            Handshake::with_key(SAMPLE_KEY).verify(resp.as_bytes(), &[]),
            Err(WebSocketError::InvalidConnectionHeader)
        ));
    }

    #[test]
    fn test_verify_accept_mismatch() {
        let hs = Handshake::with_key("AAAAAAAAAAAAAAAAAAAAAA==");
        assert!(matches!(
            hs.verify(response("").as_bytes(), &[]),
            Err(WebSocketError::InvalidAcceptKey)
        ));
    }

    #[test]
    fn test_verify_unrequested_protocol() {
        let resp = response("Sec-WebSocket-Protocol: other\r\n");
        assert!(matches!(
            Handshake::with_key(SAMPLE_KEY).verify(resp.as_bytes(), &["chat".to_string()]),
            Err(WebSocketError::InvalidSubprotocol(p)) if p == "other"
        ));
    }

    #[test]
    fn test_verify_extension_rejected() {
        let resp = response("Sec-WebSocket-Extensions: permessage-deflate\r\n");
        assert!(matches!(
            Handshake::with_key(SAMPLE_KEY).verify(resp.as_bytes(), &[]),
            Err(WebSocketError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn test_verify_garbage() {
        assert!(matches!(
            Handshake::with_key(SAMPLE_KEY).verify(b"not http\r\n\r\n", &[]),
            Err(WebSocketError::InvalidHttpResponse)
        ));
    }
}
