//! Listen address parsing, binding, and client target URLs.
//!
//! Address formats:
//!
//! - `unix:<path>` (or a bare path) - Unix domain socket
//! - `tcp4:<host>:<port>` / `tcp6:[<host>]:<port>` / `tcp:<host>:<port>`
//!
//! TCP targets are normalized to `dns:///<addr>` for clients; UDS targets
//! are `unix:<path>`. [`connect`] understands both forms.

use std::path::PathBuf;

use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::debug;

use crate::error::{PluginError, Result};

/// The longest socket path accepted, in bytes.
///
/// `sun_path` is 104 bytes on the BSDs and 108 on Linux; staying a margin
/// below both keeps one configuration portable.
pub const MAX_UDS_PATH: usize = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// ADDRESS
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// Unix domain socket at the given path.
    Unix(PathBuf),
    /// TCP socket (IPv4 or IPv6) at the given `host:port`.
    Tcp(String),
}

impl ListenAddress {
    /// Parse an address string, validating UDS length limits eagerly.
    pub fn parse(address: &str) -> Result<Self> {
        if address.is_empty() {
            return Err(PluginError::AddressInvalid("empty address".into()));
        }
        if let Some(rest) = address
            .strip_prefix("tcp4:")
            .or_else(|| address.strip_prefix("tcp6:"))
            .or_else(|| address.strip_prefix("tcp:"))
        {
            if rest.is_empty() {
                return Err(PluginError::AddressInvalid(address.into()));
            }
            return Ok(Self::Tcp(rest.to_string()));
        }
        let path = address.strip_prefix("unix:").unwrap_or(address);
        if path.len() > MAX_UDS_PATH {
            return Err(PluginError::SocketPathTooLong {
                path: path.to_string(),
                length: path.len(),
                max: MAX_UDS_PATH,
            });
        }
        Ok(Self::Unix(PathBuf::from(path)))
    }

    /// Bind the address, returning the listener and the client target URL.
    pub async fn bind(&self) -> Result<BoundTransport> {
        match self {
            Self::Unix(path) => {
                let listener =
                    UnixListener::bind(path).map_err(|source| PluginError::BindFailed {
                        address: path.display().to_string(),
                        source,
                    })?;
                debug!(path = %path.display(), "bound unix socket");
                Ok(BoundTransport {
                    target_url: format!("unix:{}", path.display()),
                    incoming: BoundListener::Unix(listener),
                })
            }
            Self::Tcp(hostport) => {
                let listener =
                    TcpListener::bind(hostport)
                        .await
                        .map_err(|source| PluginError::BindFailed {
                            address: hostport.clone(),
                            source,
                        })?;
                let local = listener
                    .local_addr()
                    .map_err(|source| PluginError::BindFailed {
                        address: hostport.clone(),
                        source,
                    })?;
                debug!(%local, "bound tcp socket");
                Ok(BoundTransport {
                    target_url: format!("dns:///{local}"),
                    incoming: BoundListener::Tcp(listener),
                })
            }
        }
    }
}

/// A bound listener plus the URL clients use to reach it.
#[derive(Debug)]
pub struct BoundTransport {
    /// `dns:///<addr>` for TCP, `unix:<path>` for UDS.
    pub target_url: String,
    /// The bound listener.
    pub incoming: BoundListener,
}

/// Either flavor of bound listener.
#[derive(Debug)]
pub enum BoundListener {
    /// Bound Unix socket.
    Unix(UnixListener),
    /// Bound TCP socket.
    Tcp(TcpListener),
}

impl BoundListener {
    /// Convert into a stream of connections for `serve_with_incoming`.
    pub(crate) fn into_incoming(
        self,
    ) -> futures::stream::BoxStream<'static, std::io::Result<Connection>> {
        use futures::StreamExt;
        match self {
            Self::Unix(listener) => UnixListenerStream::new(listener)
                .map(|conn| conn.map(Connection::Unix))
                .boxed(),
            Self::Tcp(listener) => TcpListenerStream::new(listener)
                .map(|conn| conn.map(Connection::Tcp))
                .boxed(),
        }
    }
}

/// One accepted connection of either flavor.
#[derive(Debug)]
pub enum Connection {
    /// Accepted Unix socket connection.
    Unix(tokio::net::UnixStream),
    /// Accepted TCP connection.
    Tcp(tokio::net::TcpStream),
}

impl tokio::io::AsyncRead for Connection {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Connection {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Self::Tcp(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => std::pin::Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl tonic::transport::server::Connected for Connection {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLIENT CONNECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Connect a gRPC channel to a controller target URL.
///
/// Accepts the `dns:///<addr>` and `unix:<path>` forms produced by
/// [`ListenAddress::bind`].
pub async fn connect(target_url: &str) -> Result<Channel> {
    if let Some(path) = target_url.strip_prefix("unix:") {
        let path = path.to_string();
        // The endpoint URI is ignored; every connection goes to the socket.
        let channel = Endpoint::try_from("http://[::1]:0")
            .map_err(|e| PluginError::Transport(e.to_string()))?
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    UnixStream::connect(path)
                        .await
                        .map(hyper_util::rt::TokioIo::new)
                }
            }))
            .await?;
        return Ok(channel);
    }
    let addr = target_url
        .strip_prefix("dns:///")
        .unwrap_or(target_url);
    let channel = Endpoint::try_from(format!("http://{addr}"))
        .map_err(|e| PluginError::Transport(e.to_string()))?
        .connect()
        .await?;
    Ok(channel)
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_with_and_without_prefix() {
        assert_eq!(
            ListenAddress::parse("unix:/tmp/pc.sock").unwrap(),
            ListenAddress::Unix(PathBuf::from("/tmp/pc.sock"))
        );
        assert_eq!(
            ListenAddress::parse("/tmp/pc.sock").unwrap(),
            ListenAddress::Unix(PathBuf::from("/tmp/pc.sock"))
        );
    }

    #[test]
    fn parses_tcp_flavors() {
        for addr in ["tcp:127.0.0.1:0", "tcp4:0.0.0.0:0", "tcp6:[::1]:0"] {
            assert!(matches!(
                ListenAddress::parse(addr).unwrap(),
                ListenAddress::Tcp(_)
            ));
        }
    }

    #[test]
    fn rejects_overlong_socket_path() {
        let long: String = std::iter::repeat('a').take(MAX_UDS_PATH + 1).collect();
        let err = ListenAddress::parse(&long).unwrap_err();
        assert!(matches!(err, PluginError::SocketPathTooLong { .. }));
    }

    #[tokio::test]
    async fn tcp_bind_reports_dns_target() {
        let addr = ListenAddress::parse("tcp4:127.0.0.1:0").unwrap();
        let bound = addr.bind().await.unwrap();
        assert!(bound.target_url.starts_with("dns:///"));
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be bound as a socket
        let addr = ListenAddress::parse(&dir.path().display().to_string()).unwrap();
        let err = addr.bind().await.unwrap_err();
        assert!(matches!(err, PluginError::BindFailed { .. }));
    }
}
