//! The wire contract between the certificate server and its clients.
//!
//! Paths, header names and JSON field names are shared with existing
//! deployments and must not change.

use std::fmt;

use http::HeaderName;
use serde::{Deserialize, Serialize};

/// `X-Expire-At`: absolute expiry of a stapling response, epoch seconds.
pub const HEADER_EXPIRE_AT: HeaderName = HeaderName::from_static("x-expire-at");
/// `X-TTL`: seconds until the client should poll again.
pub const HEADER_TTL: HeaderName = HeaderName::from_static("x-ttl");
pub const OCSP_RESPONSE_CONTENT_TYPE: &str = "application/ocsp-response";
pub const OCSP_REQUEST_CONTENT_TYPE: &str = "application/ocsp-request";

pub fn cert_path(domain: &str) -> String {
    format!("/cert/{}", domain)
}

pub fn ocsp_path(domain: &str, fingerprint: &str) -> String {
    format!("/ocsp/{}?fp={}", domain, fingerprint)
}

/// Body of `GET /cert/{domain}`.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CertResponse {
    #[serde(rename = "type")]
    pub cert_type: i32,
    /// PEM chain, leaf first.
    pub cert: String,
    /// PEM private key, PKCS#1 or SEC1.
    pub pkey: String,
    pub fingerprint: String,
    /// Seconds since the epoch.
    pub expire_at: i64,
    /// Seconds.
    pub ttl: i64,
}

impl fmt::Debug for CertResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResponse")
            .field("cert_type", &self.cert_type)
            .field("fingerprint", &self.fingerprint)
            .field("expire_at", &self.expire_at)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// `GET /ocsp/{domain}` answered with a response to staple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaplingResponse {
    pub der: Vec<u8>,
    pub expire_at: i64,
    pub ttl: i64,
}
