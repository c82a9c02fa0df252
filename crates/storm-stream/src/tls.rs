//! TLS configuration for transports.
//!
//! The transport consumes prebuilt `rustls` configs, so anything rustls
//! can express (custom certificate verifiers, client identities, protocol
//! version restrictions) plugs in unchanged. The constructors here cover
//! the common cases: a server with one certificate chain, optionally
//! demanding client certificates, and a client trusting a given root set.

use std::io;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Server-side TLS settings.
#[derive(Clone)]
pub struct TlsServerOptions {
    config: Arc<ServerConfig>,
}

impl TlsServerOptions {
    /// Use a prebuilt rustls config.
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Serve one certificate chain without client authentication.
    pub fn from_single_cert(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, rustls::Error> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Serve one certificate chain and require clients to present a
    /// certificate signed by one of `client_roots`.
    pub fn from_single_cert_with_client_auth(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        client_roots: RootCertStore,
    ) -> Result<Self, rustls::Error> {
        let verifier = WebPkiClientVerifier::builder(Arc::new(client_roots))
            .build()
            .map_err(|err| rustls::Error::General(err.to_string()))?;
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Acceptor for per-connection handshakes.
    #[must_use]
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }
}

impl std::fmt::Debug for TlsServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerOptions").finish_non_exhaustive()
    }
}

/// Client-side TLS settings.
#[derive(Clone)]
pub struct TlsClientOptions {
    config: Arc<ClientConfig>,
    /// Overrides the SNI/validation name derived from the target host.
    server_name: Option<String>,
}

impl TlsClientOptions {
    /// Use a prebuilt rustls config (custom verifiers, client identity,
    /// pinned protocol versions).
    #[must_use]
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            server_name: None,
        }
    }

    /// Trust the given roots, no client certificate.
    #[must_use]
    pub fn with_root_certificates(roots: RootCertStore) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
            server_name: None,
        }
    }

    /// Validate the server certificate against `name` instead of the
    /// host in the connect address.
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Connector for per-connection handshakes.
    #[must_use]
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    /// Resolve the `ServerName` used for SNI and certificate validation
    /// when connecting to `host`.
    pub fn server_name_for(&self, host: &str) -> io::Result<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_string()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TLS server name: {name}"),
            )
        })
    }
}

impl std::fmt::Debug for TlsClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientOptions")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_override_wins() {
        let options =
            TlsClientOptions::with_root_certificates(RootCertStore::empty()).server_name("pinned");
        let name = options.server_name_for("actual-host").unwrap();
        assert_eq!(name.to_str(), "pinned");
    }

    #[test]
    fn server_name_defaults_to_host() {
        let options = TlsClientOptions::with_root_certificates(RootCertStore::empty());
        let name = options.server_name_for("example.com").unwrap();
        assert_eq!(name.to_str(), "example.com");
    }

    #[test]
    fn ip_literals_are_valid_server_names() {
        let options = TlsClientOptions::with_root_certificates(RootCertStore::empty());
        options.server_name_for("127.0.0.1").unwrap();
    }
}
