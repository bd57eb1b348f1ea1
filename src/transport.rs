//! The simple connector transport: a TCP (optionally TLS) socket carrying a connect /
//! send / non-blocking-receive / disconnect-on-error cycle.
//!
//! Grounded on `send_data.c`'s `simple_connector_send_buffer` and
//! `simple_connector_receive_response`: send is a single best-effort write of the
//! header followed by the body, with any short write treated as a failure that closes
//! the connection; receive is opportunistic and non-blocking, discarding whatever
//! comes back after logging a truncated, non-printable-scrubbed sample.

use std::sync::Arc;
use std::time::Duration;

use hyper_rustls::ConfigBuilderExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use crate::buffer::SendBuffer;
use crate::config::{ConnectorSpecificConfig, ConnectorType, InstanceConfig};
use crate::error::TransportError;

/// Unifies a plain [`TcpStream`] and a TLS-wrapped one behind one object-safe trait so
/// the send/receive code paths don't need to duplicate per connection kind.
trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Builds a `rustls::ClientConfig` trusting the platform's native root store, the same
/// trust policy the Pub/Sub gRPC channel uses for its own TLS.
pub fn build_tls_client_config() -> Result<Arc<rustls::ClientConfig>, String> {
    let config = rustls::ClientConfig::builder()
        .with_native_roots()
        .map_err(|e| e.to_string())?
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Builds the HTTP/1.1 request header for HTTP-framed connectors (Graphite HTTP, JSON
/// HTTP, OpenTSDB HTTP, Prometheus remote-write), so [`SimpleConnector::send`] can write
/// it verbatim ahead of the body. Plain (non-HTTP) connectors never call this; their
/// `send_buffer` fields stay unframed.
///
/// The `Host:` header carries the *destination* this connector is configured to talk
/// to, not the originating host's name, matching how an HTTP client always frames a
/// request against the server it is connecting to.
pub fn prepare_http_header(config: &InstanceConfig, content_type: &str, body_len: usize) -> String {
    let path = match &config.connector_specific {
        ConnectorSpecificConfig::PrometheusRemoteWrite { remote_write_path } => remote_write_path.as_str(),
        _ => "/",
    };

    let mut header = format!("POST {path} HTTP/1.1\r\nHost: {}\r\n", host_header_value(&config.destination));
    header.push_str(&format!("Content-Type: {content_type}\r\n"));
    header.push_str(&format!("Content-Length: {body_len}\r\n"));
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        header.push_str(&format!("Authorization: Basic {encoded}\r\n"));
    }
    header.push_str("Connection: keep-alive\r\n\r\n");
    header
}

/// Whether a connector type frames its payload as an HTTP request rather than sending
/// it as a raw stream, matching `ConnectorType::supports_tls`'s HTTP-framed set.
pub fn is_http_framed(connector_type: ConnectorType) -> bool {
    matches!(
        connector_type,
        ConnectorType::GraphiteHttp | ConnectorType::JsonHttp | ConnectorType::OpentsdbHttp | ConnectorType::PrometheusRemoteWrite
    )
}

/// The `destination` config field is a space-separated list of `host:port` candidates,
/// tried in order by [`SimpleConnector::ensure_connected`]; the `Host:` header always
/// names the first one, matching `simple_connector_update_buffered_bytes`'s use of the
/// configured destination's first entry.
fn first_destination(destination: &str) -> &str {
    destination.split_whitespace().next().unwrap_or(destination)
}

fn host_header_value(destination: &str) -> &str {
    let first = first_destination(destination);
    first.rsplit_once(':').map_or(first, |(host, _port)| host)
}

/// Connection lifecycle state, mirroring the instance's implicit
/// connected/disconnected bookkeeping in `simple_connector_data`.
pub enum ConnectionState {
    Disconnected,
    Connected(Box<dyn Stream>),
}

/// The transport for one instance: owns the current connection (if any) and the
/// destination/timeout it reconnects to.
pub struct SimpleConnector {
    destination: String,
    timeout: Duration,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    state: ConnectionState,
    consecutive_failures: u32,
}

/// Maximum bytes of an unexpected response body to log before discarding it, matching
/// `exporting_discard_response`'s truncated sample.
const DISCARD_SAMPLE_LEN: usize = 1024;

impl SimpleConnector {
    pub fn new(destination: impl Into<String>, timeout: Duration) -> Self {
        Self { destination: destination.into(), timeout, tls_config: None, state: ConnectionState::Disconnected, consecutive_failures: 0 }
    }

    /// Builds a connector that negotiates TLS on top of each TCP candidate before the
    /// connection is considered established.
    pub fn new_tls(destination: impl Into<String>, timeout: Duration, tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            destination: destination.into(),
            timeout,
            tls_config: Some(tls_config),
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Connects if not already connected, trying each whitespace-separated candidate in
    /// `destination` in order and using the first one that succeeds within `timeout`.
    /// Returns `true` if a fresh connection was established this call (used by the
    /// caller to bump the reconnect counter).
    pub async fn ensure_connected(&mut self) -> Result<bool, TransportError> {
        if self.is_connected() {
            return Ok(false);
        }

        let candidates: Vec<&str> = self.destination.split_whitespace().collect();
        let candidates = if candidates.is_empty() { vec![self.destination.as_str()] } else { candidates };

        let mut last_err = None;
        for candidate in candidates {
            match self.try_connect(candidate).await {
                Ok(stream) => {
                    info!(destination = %candidate, "connected");
                    self.state = ConnectionState::Connected(stream);
                    return Ok(true);
                }
                Err(e) => {
                    warn!(destination = %candidate, error = %e, "candidate failed, trying next");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TransportError::Connect {
            destination: self.destination.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no destination candidates configured"),
        }))
    }

    async fn try_connect(&self, candidate: &str) -> Result<Box<dyn Stream>, TransportError> {
        let tcp = timeout(self.timeout, TcpStream::connect(candidate))
            .await
            .map_err(|_| TransportError::Connect {
                destination: candidate.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|e| TransportError::Connect { destination: candidate.to_string(), source: e })?;

        let Some(tls_config) = &self.tls_config else {
            return Ok(Box::new(tcp));
        };

        let host = candidate.rsplit_once(':').map_or(candidate, |(host, _)| host);
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::TlsHandshake { destination: candidate.to_string(), source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()) })?;

        let connector = TlsConnector::from(tls_config.clone());
        let tls_stream = timeout(self.timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::TlsHandshake {
                destination: candidate.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timed out"),
            })?
            .map_err(|e| TransportError::TlsHandshake { destination: candidate.to_string(), source: e })?;

        Ok(Box::new(tls_stream))
    }

    /// Sends the buffer's header followed by its body. A missing/empty buffer is a
    /// defensive no-op that still counts as a failure, matching the original's
    /// NULL-buffer safety check in `simple_connector_send_buffer`.
    pub async fn send(&mut self, buf: &SendBuffer) -> Result<usize, TransportError> {
        if buf.is_empty() {
            self.consecutive_failures += 1;
            return Err(TransportError::EmptyBuffer);
        }

        let stream = match &mut self.state {
            ConnectionState::Connected(s) => s,
            ConnectionState::Disconnected => {
                return Err(TransportError::Send {
                    destination: self.destination.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotConnected, "not connected"),
                })
            }
        };

        let write_result = async {
            if !buf.header.is_empty() {
                stream.write_all(buf.header.as_bytes()).await?;
            }
            stream.write_all(&buf.body).await?;
            stream.flush().await
        }
        .await;

        match write_result {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(buf.header.len() + buf.body.len())
            }
            Err(e) => {
                warn!(destination = %self.destination, error = %e, "send failed, disconnecting");
                self.state = ConnectionState::Disconnected;
                self.consecutive_failures += 1;
                Err(TransportError::Send { destination: self.destination.clone(), source: e })
            }
        }
    }

    /// Opportunistically drains and discards any pending response, non-blocking.
    /// Returns the number of bytes received, or disconnects on a zero-byte read
    /// (peer closed) or a hard error.
    pub async fn receive_and_discard(&mut self) -> Result<usize, TransportError> {
        let stream = match &mut self.state {
            ConnectionState::Connected(s) => s,
            ConnectionState::Disconnected => return Ok(0),
        };

        let mut scratch = [0u8; DISCARD_SAMPLE_LEN];
        let mut total = 0usize;
        loop {
            match timeout(Duration::from_millis(0), stream.read(&mut scratch)).await {
                Err(_elapsed) => break, // no data ready right now (EAGAIN/EWOULDBLOCK equivalent)
                Ok(Ok(0)) => {
                    warn!(destination = %self.destination, "connection closed by peer");
                    self.state = ConnectionState::Disconnected;
                    return Err(TransportError::ClosedByPeer(self.destination.clone()));
                }
                Ok(Ok(n)) => {
                    total += n;
                    log_discarded_sample(&scratch[..n]);
                    if n < scratch.len() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!(destination = %self.destination, error = %e, "receive failed, disconnecting");
                    self.state = ConnectionState::Disconnected;
                    return Err(TransportError::Receive { destination: self.destination.clone(), source: e });
                }
            }
        }
        Ok(total)
    }

    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

fn log_discarded_sample(bytes: &[u8]) {
    let sample: String = bytes
        .iter()
        .take(DISCARD_SAMPLE_LEN)
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { ' ' })
        .collect();
    tracing::debug!(sample = %sample, "discarded unexpected response");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExportingOptions;
    use crate::pattern::SimplePattern;

    fn http_config() -> InstanceConfig {
        InstanceConfig {
            name: "remote".into(),
            connector_type: ConnectorType::PrometheusRemoteWrite,
            destination: "metrics.example.com:9201".into(),
            username: None,
            password: None,
            prefix: None,
            label_prefix: None,
            update_every: 10,
            buffer_on_failures: 10,
            timeout: Duration::from_secs(1),
            options: ExportingOptions::empty(),
            charts_pattern: SimplePattern::parse("").unwrap(),
            hosts_pattern: SimplePattern::parse("").unwrap(),
            connector_specific: ConnectorSpecificConfig::PrometheusRemoteWrite { remote_write_path: "/api/v1/write".into() },
        }
    }

    #[test]
    fn http_header_uses_destination_host_and_configured_path() {
        let header = prepare_http_header(&http_config(), "application/x-protobuf", 42);
        assert!(header.starts_with("POST /api/v1/write HTTP/1.1\r\n"));
        assert!(header.contains("Host: metrics.example.com\r\n"));
        assert!(header.contains("Content-Length: 42\r\n"));
        assert!(header.ends_with("\r\n\r\n"));
    }

    #[test]
    fn http_framed_connector_types_are_recognized() {
        assert!(is_http_framed(ConnectorType::PrometheusRemoteWrite));
        assert!(!is_http_framed(ConnectorType::Graphite));
    }

    #[test]
    fn host_header_value_uses_only_the_first_destination_candidate() {
        assert_eq!(host_header_value("one.example.com:2003 two.example.com:2003"), "one.example.com");
    }

    #[tokio::test]
    async fn connect_tries_each_whitespace_separated_candidate_in_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            listener.accept().await.unwrap();
        });

        // "127.0.0.1:1" refuses immediately (nothing listens on a privileged port); the
        // second candidate is the real listener.
        let destination = format!("127.0.0.1:1 {addr}");
        let mut connector = SimpleConnector::new(destination, Duration::from_millis(200));
        assert!(connector.ensure_connected().await.unwrap());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn sending_an_empty_buffer_is_a_counted_failure() {
        let mut connector = SimpleConnector::new("127.0.0.1:0", Duration::from_millis(50));
        let buf = SendBuffer::default();
        let result = connector.send(&buf).await;
        assert!(matches!(result, Err(TransportError::EmptyBuffer)));
        assert_eq!(connector.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn sending_while_disconnected_fails_without_panicking() {
        let mut connector = SimpleConnector::new("127.0.0.1:0", Duration::from_millis(50));
        let mut buf = SendBuffer::default();
        buf.buffered_metrics = 1;
        buf.body = b"hello".to_vec();
        let result = connector.send(&buf).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connect_send_receive_round_trip_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"ack").await.unwrap();
            n
        });

        let mut connector = SimpleConnector::new(addr.to_string(), Duration::from_secs(1));
        assert!(connector.ensure_connected().await.unwrap());

        let mut out = SendBuffer::default();
        out.buffered_metrics = 1;
        out.body = b"ping".to_vec();
        let sent = connector.send(&out).await.unwrap();
        assert_eq!(sent, 4);

        let received_len = server.await.unwrap();
        assert_eq!(received_len, 4);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let received = connector.receive_and_discard().await.unwrap();
        assert_eq!(received, 3);
    }
}
