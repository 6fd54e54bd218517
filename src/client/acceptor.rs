use std::sync::Arc;

use rustls::server::Acceptor;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use super::{CertClient, ClientError};

/// Accepts TLS connections with certificates from a [`CertClient`].
///
/// The client hello is read first so an uncached server name can be fetched
/// before the handshake needs it.
#[derive(Clone)]
pub struct CertAcceptor {
    client: CertClient,
    config: Arc<ServerConfig>,
}

impl CertAcceptor {
    pub fn new(client: CertClient) -> Result<Self, rustls::Error> {
        Self::with_alpn_protocols(client, Vec::new())
    }

    pub fn with_alpn_protocols(
        client: CertClient,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Self, rustls::Error> {
        let mut config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()?
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(client.clone()));
        config.alpn_protocols = alpn_protocols;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn client(&self) -> &CertClient {
        &self.client
    }

    pub async fn accept<IO>(&self, io: IO) -> Result<TlsStream<IO>, AcceptError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = LazyConfigAcceptor::new(Acceptor::default(), io).await?;
        let server_name = handshake
            .client_hello()
            .server_name()
            .ok_or(AcceptError::MissingServerName)?
            .to_owned();
        self.client.get_certificate(&server_name).await?;
        Ok(handshake.into_stream(Arc::clone(&self.config)).await?)
    }
}

#[derive(Error, Debug)]
pub enum AcceptError {
    #[error("tls io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("client hello without server name")]
    MissingServerName,
    #[error(transparent)]
    Certificate(#[from] ClientError),
}
