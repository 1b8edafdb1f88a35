use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{BypassError, Result};
use crate::outbound::TcpConn;

static CLIENT_CONFIG: Lazy<std::result::Result<Arc<ClientConfig>, String>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map(|builder| {
            Arc::new(
                builder
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .map_err(|e| e.to_string())
});

/// Shared client configuration trusting the Mozilla root set.
fn client_config() -> Result<Arc<ClientConfig>> {
    CLIENT_CONFIG
        .as_ref()
        .cloned()
        .map_err(|e| BypassError::ConfigError(format!("TLS setup failed: {}", e)))
}

/// Run a client handshake over an already dialed stream.
pub(crate) async fn connect(
    server_name: &str,
    stream: Box<dyn TcpConn>,
    alpn: &[&[u8]],
) -> Result<TlsStream<Box<dyn TcpConn>>> {
    let mut config = (*client_config()?).clone();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| BypassError::InvalidAddress(format!("invalid TLS name: {}", server_name)))?;
    let connector = TlsConnector::from(Arc::new(config));
    Ok(connector.connect(name, stream).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builds() {
        assert!(client_config().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_server_name() {
        let (a, _b) = tokio::io::duplex(16);
        let err = connect("bad name!", Box::new(a), &[]).await.err().unwrap();
        assert!(matches!(err, BypassError::InvalidAddress(_)));
    }
}
