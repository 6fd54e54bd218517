use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;

use super::ClientError;
use crate::http_helper::{http, HttpRequestError, Method, Response};
use crate::protocol::{
    cert_path, ocsp_path, CertResponse, StaplingResponse, HEADER_EXPIRE_AT, HEADER_TTL,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pulls artifacts from a certificate server.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_cert(&self, domain: &str) -> Result<CertResponse, ClientError>;

    /// `Ok(None)` when the server holds no stapling for `fingerprint`.
    async fn fetch_stapling(
        &self,
        domain: &str,
        fingerprint: &str,
    ) -> Result<Option<StaplingResponse>, ClientError>;
}

/// [`Fetcher`] over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    base: String,
    client: reqwest::Client,
}

impl HttpFetcher {
    /// `server` may omit the scheme, `http://` is assumed.
    pub fn new(server: &str) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(HttpRequestError::from)?;
        Ok(Self::with_client(server, client))
    }

    pub fn with_client(server: &str, client: reqwest::Client) -> Self {
        Self {
            base: normalize_server(server),
            client,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }
}

pub(crate) fn normalize_server(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        server.to_owned()
    } else {
        format!("http://{}", server)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_cert(&self, domain: &str) -> Result<CertResponse, ClientError> {
        let url = format!("{}{}", self.base, cert_path(domain));
        let response = http(&self.client, &url, Method::Get, None)
            .await
            .map_err(|err| match err.status_code() {
                Some(403) => ClientError::NotPermitted(domain.to_owned()),
                Some(503) => ClientError::Expired(domain.to_owned()),
                _ => ClientError::Http(err),
            })?;
        let body = response.bytes().await.map_err(HttpRequestError::from)?;
        serde_json::from_slice(&body).map_err(|err| ClientError::Protocol(err.to_string()))
    }

    async fn fetch_stapling(
        &self,
        domain: &str,
        fingerprint: &str,
    ) -> Result<Option<StaplingResponse>, ClientError> {
        let url = format!("{}{}", self.base, ocsp_path(domain, fingerprint));
        let response = match http(&self.client, &url, Method::Get, None).await {
            Ok(response) => response,
            Err(err) if err.status_code() == Some(404) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let expire_at = header_i64(&response, &HEADER_EXPIRE_AT)?;
        let ttl = header_i64(&response, &HEADER_TTL)?;
        let der = response.bytes().await.map_err(HttpRequestError::from)?;
        Ok(Some(StaplingResponse {
            der: der.to_vec(),
            expire_at,
            ttl,
        }))
    }
}

fn header_i64(response: &Response, name: &http::HeaderName) -> Result<i64, ClientError> {
    response
        .headers()
        .get(name)
        .ok_or_else(|| ClientError::Protocol(format!("missing {} header", name)))?
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| ClientError::Protocol(format!("malformed {} header", name)))
}
