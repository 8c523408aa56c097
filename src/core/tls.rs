use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// TLS client configuration shared by every connection of a multiplexer.
#[derive(Clone)]
pub(crate) struct TlsConnectorInner {
    connector: TlsConnector,
}

impl TlsConnectorInner {
    /// Creates a connector trusting Mozilla's root certificates
    /// (`webpki-roots`), with `ring` as the crypto provider.
    pub(crate) fn new() -> crate::Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Runs the TLS handshake over an open socket.
    pub(crate) async fn connect(
        &self,
        host: String,
        stream: TcpStream,
    ) -> io::Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.connector.connect(server_name, stream).await
    }
}

impl std::fmt::Debug for TlsConnectorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsConnectorInner")
    }
}
