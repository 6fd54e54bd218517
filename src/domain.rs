use std::collections::HashSet;

use regex::Regex;
use thiserror::Error;

/// Canonicalizes a requested server name.
///
/// Server names sent by some clients are not converted to punycode, and
/// `example.com` must map to the same entry as `EXAMPLE.COM`. The UTS #46
/// non-transitional mapping takes care of both. The transitional mapping
/// would fold `ς` into `σ` and is deliberately not used.
pub fn normalize_domain(raw: &str) -> Result<String, DomainError> {
    let trimmed = raw.trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(DomainError::Empty);
    }
    if !trimmed.trim_start_matches('.').contains('.') {
        return Err(DomainError::SingleLabel(raw.to_owned()));
    }
    let ascii = idna::domain_to_ascii(trimmed)
        .map_err(|_| DomainError::InvalidCharacter(raw.to_owned()))?;
    let valid_bytes = ascii
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if !valid_bytes || ascii.split('.').any(str::is_empty) {
        return Err(DomainError::InvalidCharacter(raw.to_owned()));
    }
    Ok(ascii)
}

/// Normalizes `raw` and checks the result against `policy`.
pub fn resolve_domain(raw: &str, policy: &HostPolicy) -> Result<String, DomainError> {
    let name = normalize_domain(raw)?;
    policy.check(&name)?;
    Ok(name)
}

/// Decides which normalized domain names may be served.
#[derive(Debug, Clone, Default)]
pub enum HostPolicy {
    #[default]
    AllowAll,
    /// Exact match against a set of normalized names.
    Whitelist(HashSet<String>),
    /// The first matching pattern admits the name, no match rejects it.
    Patterns(Vec<Regex>),
}

impl HostPolicy {
    /// Builds an exact whitelist. Entries are normalized like requested
    /// names; entries that cannot be normalized are skipped.
    pub fn whitelist<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .filter_map(|host| match normalize_domain(host.as_ref()) {
                Ok(name) => Some(name),
                Err(err) => {
                    log::warn!("ignoring whitelist entry {:?}: {}", host.as_ref(), err);
                    None
                }
            })
            .collect();
        HostPolicy::Whitelist(hosts)
    }

    pub fn patterns<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HostPolicy::Patterns(patterns))
    }

    /// Domains take precedence over patterns; with neither every name is
    /// allowed.
    pub fn from_lists(domains: &[String], patterns: &[String]) -> Result<Self, regex::Error> {
        if !domains.is_empty() {
            Ok(Self::whitelist(domains))
        } else if !patterns.is_empty() {
            Self::patterns(patterns)
        } else {
            Ok(HostPolicy::AllowAll)
        }
    }

    pub fn check(&self, name: &str) -> Result<(), DomainError> {
        let allowed = match self {
            HostPolicy::AllowAll => true,
            HostPolicy::Whitelist(hosts) => hosts.contains(name),
            HostPolicy::Patterns(patterns) => patterns.iter().any(|p| p.is_match(name)),
        };
        if allowed {
            Ok(())
        } else {
            Err(DomainError::NotPermitted(name.to_owned()))
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("missing server name")]
    Empty,
    #[error("server name component count invalid: {0:?}")]
    SingleLabel(String),
    #[error("server name contains invalid character: {0:?}")]
    InvalidCharacter(String),
    #[error("host not permitted: {0}")]
    NotPermitted(String),
}

impl DomainError {
    pub fn is_not_permitted(&self) -> bool {
        matches!(self, DomainError::NotPermitted(_))
    }
}
