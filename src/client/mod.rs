//! Client side cache of certificates and OCSP staplings.
//!
//! A [`CertClient`] keeps one [`CachedArtifact`] per domain. Entries are
//! immutable: every change swaps a new `Arc` into the map, so a reader
//! always sees a certificate together with the stapling that belongs to it.

mod acceptor;
mod fetch;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;

pub use acceptor::{AcceptError, CertAcceptor};
pub use fetch::{Fetcher, HttpFetcher};

use crate::codec::{self, has_stapling, CodecError, LeafInfo};
use crate::domain::{normalize_domain, DomainError, HostPolicy};
use crate::http_helper::HttpRequestError;
use crate::protocol::{CertResponse, StaplingResponse};
use crate::ttl::{Clock, SystemClock};

const FIRST_FETCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const REFRESH_FETCH_TIMEOUT: Duration = Duration::from_secs(1);
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const REFRESH_ATTEMPTS: usize = 3;
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Staplings expiring within this many seconds are never served.
const STAPLING_SERVE_MARGIN_SECS: i64 = 60;
/// Staplings expiring within this many seconds are dropped when their
/// refresh fails.
const STAPLING_ABANDON_MARGIN_SECS: i64 = 120;

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Domains this client may request; empty allows every domain.
    pub allow_domains: Vec<String>,
    /// Domains fetched while the client is constructed.
    pub preload_domains: Vec<String>,
    /// Preload in the background instead of before `new` returns.
    pub preload_async: bool,
    pub disable_stapling: bool,
}

/// An OCSP response held for a cached certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedStapling {
    pub der: Vec<u8>,
    pub expire_at: DateTime<Utc>,
}

/// Everything cached for one domain.
#[derive(Clone)]
pub struct CachedArtifact {
    /// The signing identity handed to rustls, with the stapling (if any)
    /// already attached.
    pub certified: Arc<CertifiedKey>,
    pub cert_type: i32,
    pub leaf: LeafInfo,
    /// The fingerprint the server assigned, echoed back on stapling
    /// requests. Falls back to the locally computed one.
    pub fingerprint: String,
    pub cert_expire_at: DateTime<Utc>,
    pub cert_refresh_at: DateTime<Utc>,
    pub stapling: Option<CachedStapling>,
    /// `None` means due now.
    pub stapling_refresh_at: Option<DateTime<Utc>>,
}

impl CachedArtifact {
    /// Decodes a certificate response received at `now`.
    pub fn from_response(response: &CertResponse, now: DateTime<Utc>) -> Result<Self, ClientError> {
        let (chain, key) =
            codec::decode_pem_bundle(response.cert.as_bytes(), response.pkey.as_bytes())?;
        let leaf = LeafInfo::parse(chain.first().ok_or(CodecError::MissingCertificate)?)?;
        let fingerprint = if response.fingerprint.is_empty() {
            leaf.fingerprint.clone()
        } else {
            if response.fingerprint != leaf.fingerprint {
                log::debug!(
                    "server fingerprint {} differs from computed {}",
                    response.fingerprint,
                    leaf.fingerprint
                );
            }
            response.fingerprint.clone()
        };
        let certified = codec::certified_key(chain, &key)?;
        let cert_expire_at = timestamp(response.expire_at)?;
        Ok(Self {
            certified: Arc::new(certified),
            cert_type: response.cert_type,
            leaf,
            fingerprint,
            cert_expire_at,
            cert_refresh_at: refresh_at(now, response.ttl, cert_expire_at),
            stapling: None,
            stapling_refresh_at: None,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Takes over the certificate of `fresh`. The stapling is kept unless
    /// the certificate itself changed.
    fn replace_certificate(&self, fresh: CachedArtifact) -> Self {
        if fresh.fingerprint == self.fingerprint {
            let stapling = self.stapling.clone();
            let stapling_refresh_at = self.stapling_refresh_at;
            return fresh.with_stapling(stapling, stapling_refresh_at);
        }
        fresh
    }

    fn with_stapling(
        &self,
        stapling: Option<CachedStapling>,
        stapling_refresh_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut certified = CertifiedKey::clone(&self.certified);
        certified.ocsp = stapling.as_ref().map(|s| s.der.clone());
        Self {
            certified: Arc::new(certified),
            stapling,
            stapling_refresh_at,
            ..self.clone()
        }
    }

    fn without_stapling(&self) -> Self {
        self.with_stapling(None, None)
    }
}

impl fmt::Debug for CachedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedArtifact")
            .field("cert_type", &self.cert_type)
            .field("leaf", &self.leaf)
            .field("fingerprint", &self.fingerprint)
            .field("cert_expire_at", &self.cert_expire_at)
            .field("cert_refresh_at", &self.cert_refresh_at)
            .field("stapling", &self.stapling.as_ref().map(|s| s.expire_at))
            .field("stapling_refresh_at", &self.stapling_refresh_at)
            .finish_non_exhaustive()
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, ClientError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ClientError::Protocol(format!("timestamp out of range: {}", secs)))
}

/// `now + ttl`, never later than `expire_at`. TTLs too large to represent
/// saturate at `expire_at`.
fn refresh_at(now: DateTime<Utc>, ttl: i64, expire_at: DateTime<Utc>) -> DateTime<Utc> {
    TimeDelta::try_seconds(ttl.max(0))
        .and_then(|ttl| now.checked_add_signed(ttl))
        .map_or(expire_at, |at| at.min(expire_at))
}

fn stapling_from_response(
    response: StaplingResponse,
    now: DateTime<Utc>,
) -> Result<(CachedStapling, DateTime<Utc>), ClientError> {
    let expire_at = timestamp(response.expire_at)?;
    let refresh = refresh_at(now, response.ttl, expire_at);
    Ok((
        CachedStapling {
            der: response.der,
            expire_at,
        },
        refresh,
    ))
}

/// Caches certificates fetched from a certificate server and keeps them
/// fresh in the background.
#[derive(Clone)]
pub struct CertClient {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    policy: HostPolicy,
    disable_stapling: bool,
    cache: DashMap<String, Arc<CachedArtifact>>,
}

impl CertClient {
    /// Connects to the server at `server` (`host:port` or a URL).
    pub async fn new(server: &str, options: Options) -> Result<Self, ClientError> {
        let fetcher = HttpFetcher::new(server)?;
        Ok(Self::with_fetcher(Arc::new(fetcher), Arc::new(SystemClock), options).await)
    }

    pub async fn with_fetcher(
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
        options: Options,
    ) -> Self {
        let policy = if options.allow_domains.is_empty() {
            HostPolicy::AllowAll
        } else {
            HostPolicy::whitelist(&options.allow_domains)
        };
        let client = Self {
            inner: Arc::new(Inner {
                fetcher,
                clock,
                policy,
                disable_stapling: options.disable_stapling,
                cache: DashMap::new(),
            }),
        };
        tokio::spawn(refresh_loop(Arc::downgrade(&client.inner)));

        if !options.preload_domains.is_empty() {
            let preload = client.clone().preload(options.preload_domains);
            if options.preload_async {
                tokio::spawn(preload);
            } else {
                preload.await;
            }
        }
        client
    }

    fn preload(self, domains: Vec<String>) -> impl Future<Output = ()> + Send + 'static {
        async move {
            for domain in domains {
                match self.get_certificate(&domain).await {
                    Ok(_) => log::info!("preloaded certificate for {}", domain),
                    Err(err) => log::warn!("preloading certificate for {} failed: {}", domain, err),
                }
            }
        }
    }

    /// Returns the certificate for `name`, fetching it on a cache miss.
    pub async fn get_certificate(&self, name: &str) -> Result<Arc<CertifiedKey>, ClientError> {
        let domain = normalize_domain(name)?;
        if let Some(artifact) = self.inner.cached(&domain) {
            return self.inner.serve(&domain, artifact);
        }

        self.inner.policy.check(&domain)?;
        let artifact = Arc::new(self.inner.load(&domain).await?);
        self.inner.cache.insert(domain.clone(), Arc::clone(&artifact));
        self.inner.serve(&domain, artifact)
    }

    /// The cached entry for `name`, without fetching or checking expiry.
    pub fn cached(&self, name: &str) -> Option<Arc<CachedArtifact>> {
        let domain = normalize_domain(name).ok()?;
        self.inner.cached(&domain)
    }

    /// Runs one refresh pass over every cached entry. Returns the first
    /// certificate error, else the first stapling error.
    pub async fn refresh_due(&self) -> Result<(), ClientError> {
        self.inner.refresh_pass().await
    }

    /// What the background loop runs on every tick: [`Self::refresh_due`]
    /// with bounded retries.
    pub async fn refresh_with_retry(&self) -> Result<(), ClientError> {
        self.inner.refresh_with_retry().await
    }
}

impl fmt::Debug for CertClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertClient")
            .field("entries", &self.inner.cache.len())
            .field("disable_stapling", &self.inner.disable_stapling)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertClient {
    /// Serves cached entries only; [`CertAcceptor`] warms the cache before
    /// the handshake continues.
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let domain = normalize_domain(client_hello.server_name()?).ok()?;
        let artifact = self.inner.cached(&domain)?;
        match self.inner.serve(&domain, artifact) {
            Ok(key) => Some(key),
            Err(err) => {
                log::warn!("not serving certificate for {}: {}", domain, err);
                None
            }
        }
    }
}

async fn refresh_loop(inner: Weak<Inner>) {
    let mut interval = tokio::time::interval(REFRESH_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let _ = inner.refresh_with_retry().await;
    }
}

impl Inner {
    fn cached(&self, domain: &str) -> Option<Arc<CachedArtifact>> {
        self.cache.get(domain).map(|entry| Arc::clone(entry.value()))
    }

    fn stapling_applicable(&self, artifact: &CachedArtifact) -> bool {
        !self.disable_stapling
            && has_stapling(artifact.cert_type)
            && !artifact.leaf.ocsp_servers.is_empty()
    }

    fn serve(
        &self,
        domain: &str,
        artifact: Arc<CachedArtifact>,
    ) -> Result<Arc<CertifiedKey>, ClientError> {
        let now = self.clock.now();
        if artifact.cert_expire_at <= now {
            return Err(ClientError::Expired(domain.to_owned()));
        }
        let margin = TimeDelta::seconds(STAPLING_SERVE_MARGIN_SECS);
        match &artifact.stapling {
            Some(stapling) if stapling.expire_at - now <= margin => {
                let cleared = Arc::new(artifact.without_stapling());
                if let Some(mut slot) = self.cache.get_mut(domain) {
                    if Arc::ptr_eq(slot.value(), &artifact) {
                        *slot = Arc::clone(&cleared);
                    }
                }
                log::debug!("dropped stapling of {} close to its expiry", domain);
                Ok(Arc::clone(&cleared.certified))
            }
            _ => Ok(Arc::clone(&artifact.certified)),
        }
    }

    async fn load(&self, domain: &str) -> Result<CachedArtifact, ClientError> {
        let artifact = self.fetch_cert(domain, FIRST_FETCH_TIMEOUT).await?;
        if !self.stapling_applicable(&artifact) {
            return Ok(artifact);
        }
        match self
            .fetch_stapling(domain, artifact.fingerprint(), FIRST_FETCH_TIMEOUT)
            .await
        {
            Ok(Some((stapling, refresh))) => {
                Ok(artifact.with_stapling(Some(stapling), Some(refresh)))
            }
            Ok(None) => Ok(artifact),
            Err(err) => {
                log::warn!("fetching stapling for {} failed: {}", domain, err);
                Ok(artifact)
            }
        }
    }

    async fn fetch_cert(
        &self,
        domain: &str,
        limit: Duration,
    ) -> Result<CachedArtifact, ClientError> {
        let response = with_timeout(limit, self.fetcher.fetch_cert(domain)).await?;
        CachedArtifact::from_response(&response, self.clock.now())
    }

    async fn fetch_stapling(
        &self,
        domain: &str,
        fingerprint: &str,
        limit: Duration,
    ) -> Result<Option<(CachedStapling, DateTime<Utc>)>, ClientError> {
        let response = with_timeout(limit, self.fetcher.fetch_stapling(domain, fingerprint)).await?;
        response
            .map(|response| stapling_from_response(response, self.clock.now()))
            .transpose()
    }

    async fn refresh_with_retry(&self) -> Result<(), ClientError> {
        let mut attempt = 1;
        loop {
            match self.refresh_pass().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < REFRESH_ATTEMPTS => {
                    log::debug!("refresh attempt {} failed: {}", attempt, err);
                    attempt += 1;
                    tokio::time::sleep(REFRESH_RETRY_DELAY).await;
                }
                Err(err) => {
                    log::error!("refresh failed after {} attempts: {}", attempt, err);
                    return Err(err);
                }
            }
        }
    }

    async fn refresh_pass(&self) -> Result<(), ClientError> {
        let snapshot: Vec<(String, Arc<CachedArtifact>)> = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut cert_error = None;
        let mut stapling_error = None;
        for (domain, current) in snapshot {
            let now = self.clock.now();
            let cert_due = current.cert_refresh_at <= now;
            let stapling_due = |artifact: &CachedArtifact| {
                self.stapling_applicable(artifact)
                    && artifact.stapling_refresh_at.map_or(true, |at| at <= now)
            };
            if !cert_due && !stapling_due(&current) {
                continue;
            }

            let mut next = CachedArtifact::clone(&current);
            if cert_due {
                match self.fetch_cert(&domain, REFRESH_FETCH_TIMEOUT).await {
                    Ok(fresh) => {
                        log::debug!("refreshed certificate for {}", domain);
                        next = next.replace_certificate(fresh);
                    }
                    Err(err) => {
                        log::warn!("refreshing certificate for {} failed: {}", domain, err);
                        cert_error.get_or_insert(err);
                    }
                }
            }

            if stapling_due(&next) {
                match self
                    .fetch_stapling(&domain, next.fingerprint(), REFRESH_FETCH_TIMEOUT)
                    .await
                {
                    Ok(Some((stapling, refresh))) => {
                        log::debug!("refreshed stapling for {}", domain);
                        next = next.with_stapling(Some(stapling), Some(refresh));
                    }
                    Ok(None) => next = next.without_stapling(),
                    Err(err) => {
                        log::warn!("refreshing stapling for {} failed: {}", domain, err);
                        let margin = TimeDelta::seconds(STAPLING_ABANDON_MARGIN_SECS);
                        let abandon = next
                            .stapling
                            .as_ref()
                            .is_some_and(|s| s.expire_at - now <= margin);
                        if abandon {
                            log::warn!("dropping stapling of {} close to its expiry", domain);
                            next = next.without_stapling();
                        }
                        stapling_error.get_or_insert(err);
                    }
                }
            }

            self.cache.insert(domain, Arc::new(next));
        }

        match cert_error.or(stapling_error) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ClientError::Timeout(limit))?
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid server name: {0}")]
    InvalidName(DomainError),
    #[error("domain name not permitted: {0}")]
    NotPermitted(String),
    #[error("certificate for {0} expired")]
    Expired(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Http(#[from] HttpRequestError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ClientError {
    /// Policy errors are final; retrying them never helps.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ClientError::NotPermitted(_) | ClientError::InvalidName(_))
    }
}

impl From<DomainError> for ClientError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotPermitted(name) => ClientError::NotPermitted(name),
            err => ClientError::InvalidName(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_at_is_clamped_to_expiry() {
        let now = DateTime::from_timestamp(1_900_000_000, 0).unwrap();
        let expire_at = now + TimeDelta::hours(1);
        assert_eq!(refresh_at(now, 60, expire_at), now + TimeDelta::seconds(60));
        assert_eq!(refresh_at(now, 7200, expire_at), expire_at);
        assert_eq!(refresh_at(now, -5, expire_at), now);
    }

    #[test]
    fn unrepresentable_ttls_saturate_at_expiry() {
        let now = DateTime::from_timestamp(1_900_000_000, 0).unwrap();
        let expire_at = now + TimeDelta::days(90);
        assert_eq!(refresh_at(now, i64::MAX, expire_at), expire_at);
        assert_eq!(refresh_at(now, 1_000_000_000_000_000_000, expire_at), expire_at);
    }
}
