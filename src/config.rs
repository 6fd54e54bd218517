use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::TimeDelta;
use thiserror::Error;

use crate::codec::KeyClass;
use crate::domain::HostPolicy;

pub const LETS_ENCRYPT_STAGING_DIRECTORY: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_PRODUCTION_DIRECTORY: &str =
    "https://acme-v02.api.letsencrypt.org/directory";

const DEFAULT_RENEW_BEFORE_DAYS: i64 = 30;

/// Credentials binding a new ACME account to an existing CA account.
#[derive(Clone, PartialEq, Eq)]
pub struct ExternalAccountBinding {
    pub kid: String,
    key: Vec<u8>,
}

impl ExternalAccountBinding {
    /// `key` is the base64url HMAC key handed out by the CA, with or without
    /// padding.
    pub fn new(kid: impl Into<String>, key: &str) -> Result<Self, ConfigError> {
        let key = URL_SAFE_NO_PAD.decode(key.trim().trim_end_matches('='))?;
        if key.is_empty() {
            return Err(ConfigError::EmptyEabKey);
        }
        Ok(Self {
            kid: kid.into(),
            key,
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for ExternalAccountBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalAccountBinding")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// What kind of certificates to issue, and how to register the account
/// that issues them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerConfig {
    pub key_class: KeyClass,
    pub eab: Option<ExternalAccountBinding>,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            key_class: KeyClass::Ecdsa,
            eab: None,
        }
    }
}

impl IssuerConfig {
    /// External account binding needs both the key id and the key.
    pub fn new(
        force_rsa: bool,
        eab_kid: Option<&str>,
        eab_key: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let key_class = if force_rsa {
            KeyClass::Rsa
        } else {
            KeyClass::Ecdsa
        };
        let eab = match (non_empty(eab_kid), non_empty(eab_key)) {
            (Some(kid), Some(key)) => Some(ExternalAccountBinding::new(kid, key)?),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteEab),
        };
        Ok(Self { key_class, eab })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Configuration of an [`AcmeManager`](crate::AcmeManager).
///
/// Defaults to the Let's Encrypt staging directory, which has far more
/// forgiving rate limits than production.
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    pub directory_url: String,
    pub contact: Vec<String>,
    pub renew_before: TimeDelta,
    pub host_policy: HostPolicy,
    pub issuer: IssuerConfig,
}

impl AcmeConfig {
    pub fn new(host_policy: HostPolicy) -> Self {
        Self {
            directory_url: LETS_ENCRYPT_STAGING_DIRECTORY.to_owned(),
            contact: Vec::new(),
            renew_before: TimeDelta::days(DEFAULT_RENEW_BEFORE_DAYS),
            host_policy,
            issuer: IssuerConfig::default(),
        }
    }

    /// Builds the host policy from exact domains and regex patterns, see
    /// [`HostPolicy::from_lists`].
    pub fn from_host_lists(domains: &[String], patterns: &[String]) -> Result<Self, ConfigError> {
        Ok(Self::new(HostPolicy::from_lists(domains, patterns)?))
    }

    pub fn directory(mut self, directory_url: impl Into<String>) -> Self {
        self.directory_url = directory_url.into();
        self
    }

    pub fn directory_lets_encrypt(self, production: bool) -> Self {
        self.directory(if production {
            LETS_ENCRYPT_PRODUCTION_DIRECTORY
        } else {
            LETS_ENCRYPT_STAGING_DIRECTORY
        })
    }

    /// Adds a contact, e.g. `mailto:admin@example.com`.
    pub fn contact_push(mut self, contact: impl Into<String>) -> Self {
        self.contact.push(contact.into());
        self
    }

    /// Adds `mailto:` contact for a bare email address; empty input is
    /// ignored.
    pub fn email(self, email: &str) -> Self {
        let email = email.trim();
        if email.is_empty() {
            self
        } else {
            self.contact_push(format!("mailto:{}", email))
        }
    }

    pub fn renew_before_days(mut self, days: u32) -> Self {
        self.renew_before = TimeDelta::days(i64::from(days));
        self
    }

    pub fn issuer(mut self, issuer: IssuerConfig) -> Self {
        self.issuer = issuer;
        self
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("external account binding needs both a key id and a key")]
    IncompleteEab,
    #[error("external account binding key is not base64url: {0}")]
    EabKey(#[from] base64::DecodeError),
    #[error("external account binding key is empty")]
    EmptyEabKey,
    #[error("invalid host pattern: {0}")]
    Pattern(#[from] regex::Error),
}
