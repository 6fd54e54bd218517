use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{CipherSuite, NamedGroup, SignatureScheme};
use thiserror::Error;

use crate::codec::{self, CodecError, KeyClass, LeafInfo};
use crate::domain::DomainError;

const ECDSA_SIGNATURE_SCHEMES: [SignatureScheme; 3] = [
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ECDSA_NISTP521_SHA512,
];

/// The negotiation context a certificate is requested for.
///
/// There is no real handshake on the issuing side, so the profile stands in
/// for one: a manager picks the key type that the listed signature schemes,
/// groups and cipher suites would accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloProfile {
    pub server_name: String,
    pub signature_schemes: Vec<SignatureScheme>,
    pub groups: Vec<NamedGroup>,
    pub cipher_suites: Vec<CipherSuite>,
}

impl HelloProfile {
    /// A profile without any ECDSA preference, which yields RSA material.
    pub fn plain(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            signature_schemes: Vec::new(),
            groups: Vec::new(),
            cipher_suites: Vec::new(),
        }
    }

    pub fn ecdsa(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            signature_schemes: ECDSA_SIGNATURE_SCHEMES.to_vec(),
            groups: vec![
                NamedGroup::secp256r1,
                NamedGroup::secp384r1,
                NamedGroup::secp521r1,
            ],
            cipher_suites: vec![
                CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
        }
    }

    pub fn for_class(server_name: impl Into<String>, preferred: KeyClass) -> Self {
        match preferred {
            KeyClass::Ecdsa => Self::ecdsa(server_name),
            KeyClass::Rsa => Self::plain(server_name),
        }
    }

    pub fn supports_ecdsa(&self) -> bool {
        self.signature_schemes
            .iter()
            .any(|scheme| ECDSA_SIGNATURE_SCHEMES.contains(scheme))
    }

    pub fn cert_name(&self) -> CertName {
        let key_class = if self.supports_ecdsa() {
            KeyClass::Ecdsa
        } else {
            KeyClass::Rsa
        };
        CertName::new(self.server_name.clone(), key_class)
    }
}

/// Identifies one piece of key material: a domain and its key class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertName {
    pub domain: String,
    pub key_class: KeyClass,
}

impl CertName {
    pub fn new(domain: impl Into<String>, key_class: KeyClass) -> Self {
        Self {
            domain: domain.into(),
            key_class,
        }
    }

    /// `example.com` for ECDSA and `example.com+rsa` for RSA, so both key
    /// classes of a domain can be held side by side.
    pub fn cache_key(&self) -> String {
        match self.key_class {
            KeyClass::Ecdsa => self.domain.clone(),
            KeyClass::Rsa => format!("{}+rsa", self.domain),
        }
    }
}

impl Display for CertName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// A certificate chain with its private key, as handed out by a manager.
pub struct IssuedCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub leaf: LeafInfo,
}

impl IssuedCert {
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, CodecError> {
        let leaf = LeafInfo::parse(chain.first().ok_or(CodecError::MissingCertificate)?)?;
        Ok(Self { chain, key, leaf })
    }

    /// Parses the storage format produced by [`IssuedCert::to_pem`].
    pub fn from_pem(data: &[u8]) -> Result<Self, CodecError> {
        let key = codec::decode_private_key(data)?;
        let chain = codec::decode_chain(data)?;
        Self::new(chain, key)
    }

    /// Private key first, then the chain from leaf to the last intermediate.
    pub fn to_pem(&self) -> Result<String, CodecError> {
        let (_, key) = codec::encode_private_key(&self.key)?;
        Ok(format!("{}{}", key, codec::encode_chain(&self.chain)))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.leaf.not_after <= now
    }
}

impl Debug for IssuedCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCert")
            .field("chain_len", &self.chain.len())
            .field("leaf", &self.leaf)
            .finish_non_exhaustive()
    }
}

/// Issues and serves certificates, and answers HTTP-01 challenges for the
/// orders it has in flight.
#[async_trait]
pub trait CertManager: Send + Sync {
    async fn certificate(&self, profile: &HelloProfile) -> Result<Arc<IssuedCert>, ManagerError>;

    fn http01_challenge_response(&self, token: &str) -> Result<String, ManagerError>;
}

/// Produces the current certificate of a watched key on demand.
pub type CertSupplier =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<IssuedCert>, ManagerError>> + Send + Sync>;

/// A DER encoded OCSP response and the certificate it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stapling {
    pub der: Vec<u8>,
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    pub fingerprint: String,
}

/// Keeps OCSP responses fresh for watched certificates.
pub trait StaplingRegistry: Send + Sync {
    /// Registers `key` for stapling maintenance. Watching a key twice is a
    /// no-op.
    fn watch(&self, key: &str, supplier: CertSupplier);

    fn stapling(&self, key: &str) -> Result<Arc<Stapling>, StaplingError>;
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("host not permitted: {0}")]
    NotPermitted(String),
    #[error("acme challenge token not found")]
    ChallengeNotFound,
    #[error("invalid server name: {0}")]
    InvalidName(DomainError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("acme error: {0}")]
    Acme(String),
    #[error("certificate cache error: {0}")]
    Cache(String),
    #[error("certificate issuance failed: {0}")]
    Issuance(String),
}

impl From<DomainError> for ManagerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotPermitted(name) => ManagerError::NotPermitted(name),
            err => ManagerError::InvalidName(err),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StaplingError {
    #[error("no ocsp stapling cached for {0}")]
    CacheMiss(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_select_key_class() {
        let ecdsa = HelloProfile::ecdsa("example.com");
        assert!(ecdsa.supports_ecdsa());
        assert_eq!(ecdsa.cert_name().cache_key(), "example.com");

        let plain = HelloProfile::for_class("example.com", KeyClass::Rsa);
        assert!(!plain.supports_ecdsa());
        assert_eq!(plain.cert_name().cache_key(), "example.com+rsa");
    }

    #[test]
    fn policy_errors_stay_distinct() {
        let err = ManagerError::from(DomainError::NotPermitted("evil.test".to_owned()));
        assert!(matches!(err, ManagerError::NotPermitted(_)));
        let err = ManagerError::from(DomainError::Empty);
        assert!(matches!(err, ManagerError::InvalidName(_)));
    }
}
