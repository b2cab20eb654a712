//! TCP and implicit-TLS session factory.

use super::{Connector, NntpConnection, NntpIo, NntpSession};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio_rustls::TlsConnector;

/// Client TLS configuration trusting the Mozilla root set, on the `ring`
/// provider `nntp-rs` uses as well
pub fn build_tls_config() -> Result<Arc<ClientConfig>> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(format!("unsupported protocol versions: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Opens real sessions against one news server
pub struct NntpConnector {
    server: ServerConfig,
    tls: OnceCell<TlsConnector>,
}

impl std::fmt::Debug for NntpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NntpConnector")
            .field("host", &self.server.host)
            .field("port", &self.server.port)
            .field("tls", &self.server.tls)
            .finish()
    }
}

impl NntpConnector {
    /// Create a connector; TLS state is built on first use and shared by every session
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            tls: OnceCell::new(),
        }
    }

    /// Server this connector dials
    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    async fn tls_connector(&self) -> Result<&TlsConnector> {
        self.tls
            .get_or_try_init(|| async { build_tls_config().map(TlsConnector::from) })
            .await
    }

    async fn open(&self) -> Result<NntpConnection> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        let tcp = TcpStream::connect(&addr).await?;
        tcp.set_nodelay(true)?;

        let io: Box<dyn NntpIo> = if self.server.tls {
            let connector = self.tls_connector().await?;
            let name = ServerName::try_from(self.server.host.clone())
                .map_err(|e| Error::Tls(format!("invalid server name: {}", e)))?;
            let stream = connector
                .connect(name, tcp)
                .await
                .map_err(|e| Error::Tls(format!("handshake with {} failed: {}", addr, e)))?;
            Box::new(stream)
        } else {
            Box::new(tcp)
        };

        NntpConnection::handshake(io, &self.server).await
    }
}

#[async_trait]
impl Connector for NntpConnector {
    async fn connect(&self) -> Result<Box<dyn NntpSession>> {
        let conn = tokio::time::timeout(self.server.connect_timeout, self.open())
            .await
            .map_err(|_| Error::Timeout)??;
        tracing::debug!(
            host = %self.server.host,
            port = self.server.port,
            tls = self.server.tls,
            "opened NNTP session"
        );
        Ok(Box::new(conn))
    }
}
