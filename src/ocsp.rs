//! OCSP stapling maintenance for the certificates the server hands out.
//!
//! Every watched key owns an [`ArcSwapOption`] holding its latest response.
//! Readers load it without locking. A background loop refetches a response
//! once half of its validity window has passed or the certificate behind
//! the key changed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ring::digest;
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::task::JoinHandle;
use x509_parser::prelude::{FromDer, X509Certificate};
use yasna::models::{GeneralizedTime, ObjectIdentifier};
use yasna::{BERReader, BERReaderSeq, Tag};

use crate::http_helper::{http, Body, HttpRequestError, Method};
use crate::manager::{CertSupplier, IssuedCert, Stapling, StaplingError, StaplingRegistry};
use crate::protocol::OCSP_REQUEST_CONTENT_TYPE;
use crate::ttl::Clock;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const OID_SHA1: &[u64] = &[1, 3, 14, 3, 2, 26];
const OID_OCSP_BASIC: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 1, 1];

/// A [`StaplingRegistry`] that queries the OCSP responders named in the
/// watched certificates.
#[derive(Clone)]
pub struct OcspManager {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, Arc<Watched>>,
}

struct Watched {
    supplier: CertSupplier,
    stapling: ArcSwapOption<Stapling>,
}

impl OcspManager {
    pub fn new(clock: Arc<dyn Clock>) -> Result<Self, OcspError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(HttpRequestError::from)?;
        Ok(Self::with_client(client, clock))
    }

    pub fn with_client(client: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                clock,
                entries: DashMap::new(),
            }),
        }
    }

    /// Starts the periodic refresh. The task ends once every handle to
    /// this manager is dropped.
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(refresh_loop(inner))
    }

    /// Runs one refresh pass over every watched key.
    pub async fn refresh_all(&self) {
        self.inner.refresh_all().await
    }
}

async fn refresh_loop(inner: Weak<Inner>) {
    let mut interval = tokio::time::interval(REFRESH_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            log::debug!("ocsp manager dropped, stopping refresh");
            return;
        };
        inner.refresh_all().await;
    }
}

impl StaplingRegistry for OcspManager {
    fn watch(&self, key: &str, supplier: CertSupplier) {
        let watched = match self.inner.entries.entry(key.to_owned()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(vacant) => {
                let watched = Arc::new(Watched {
                    supplier,
                    stapling: ArcSwapOption::empty(),
                });
                vacant.insert(Arc::clone(&watched));
                watched
            }
        };
        log::info!("watching ocsp stapling for {}", key);
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        tokio::spawn(async move { inner.refresh_entry(&key, &watched).await });
    }

    fn stapling(&self, key: &str) -> Result<Arc<Stapling>, StaplingError> {
        self.inner
            .entries
            .get(key)
            .and_then(|watched| watched.stapling.load_full())
            .ok_or_else(|| StaplingError::CacheMiss(key.to_owned()))
    }
}

impl Inner {
    async fn refresh_all(&self) {
        let snapshot: Vec<(String, Arc<Watched>)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        futures::future::join_all(
            snapshot
                .iter()
                .map(|(key, watched)| self.refresh_entry(key, watched)),
        )
        .await;
    }

    async fn refresh_entry(&self, key: &str, watched: &Watched) {
        let cert = match (watched.supplier)().await {
            Ok(cert) => cert,
            Err(err) => {
                log::warn!("ocsp: no certificate for {}: {}", key, err);
                return;
            }
        };
        let current = watched.stapling.load_full();
        let rotated = current
            .as_deref()
            .is_some_and(|s| s.fingerprint != cert.leaf.fingerprint);
        let stale = match current.as_deref() {
            Some(stapling) => rotated || half_life_passed(stapling, self.clock.now()),
            None => true,
        };
        if !stale {
            return;
        }

        match self.fetch(&cert).await {
            Ok(Some(stapling)) => {
                log::debug!(
                    "ocsp: refreshed stapling for {}, next update {}",
                    key,
                    stapling.next_update
                );
                watched.stapling.store(Some(Arc::new(stapling)));
            }
            Ok(None) => {
                log::debug!("ocsp: {} has no responder or issuer, not stapling", key);
                if rotated {
                    watched.stapling.store(None);
                }
            }
            Err(err) => log::warn!("ocsp: refreshing stapling for {} failed: {}", key, err),
        }
    }

    async fn fetch(&self, cert: &IssuedCert) -> Result<Option<Stapling>, OcspError> {
        let (Some(url), Some(leaf), Some(issuer)) = (
            cert.leaf.ocsp_servers.first(),
            cert.chain.first(),
            cert.chain.get(1),
        ) else {
            return Ok(None);
        };
        let request = build_request(leaf, issuer)?;
        let response = http(
            &self.client,
            url,
            Method::Post,
            Some(Body {
                content_type: OCSP_REQUEST_CONTENT_TYPE,
                bytes: request,
            }),
        )
        .await?;
        let der = response
            .bytes()
            .await
            .map_err(HttpRequestError::from)?
            .to_vec();
        let parsed = parse_response(&der)?;
        if parsed.status == CertStatus::Revoked {
            log::warn!("ocsp: certificate {} is revoked", cert.leaf.fingerprint);
        }
        Ok(Some(Stapling {
            der,
            this_update: parsed.this_update,
            next_update: parsed.next_update,
            fingerprint: cert.leaf.fingerprint.clone(),
        }))
    }
}

fn half_life_passed(stapling: &Stapling, now: DateTime<Utc>) -> bool {
    let half = (stapling.next_update - stapling.this_update) / 2;
    stapling.this_update + half <= now
}

/// Builds a DER `OCSPRequest` for `leaf` with a SHA-1 `CertID`.
pub fn build_request(
    leaf: &CertificateDer<'_>,
    issuer: &CertificateDer<'_>,
) -> Result<Vec<u8>, OcspError> {
    let (_, leaf) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|err| OcspError::Certificate(err.to_string()))?;
    let (_, issuer) = X509Certificate::from_der(issuer.as_ref())
        .map_err(|err| OcspError::Certificate(err.to_string()))?;

    let sha1 = &digest::SHA1_FOR_LEGACY_USE_ONLY;
    let issuer_name_hash = digest::digest(sha1, leaf.tbs_certificate.issuer.as_raw());
    let issuer_key_hash = digest::digest(
        sha1,
        &issuer.tbs_certificate.subject_pki.subject_public_key.data,
    );
    let serial = leaf.raw_serial();

    Ok(yasna::construct_der(|w| {
        w.write_sequence(|w| {
            w.next().write_sequence(|w| {
                w.next().write_sequence_of(|w| {
                    w.next().write_sequence(|w| {
                        w.next().write_sequence(|w| {
                            w.next().write_sequence(|w| {
                                w.next().write_oid(&ObjectIdentifier::from_slice(OID_SHA1));
                                w.next().write_null();
                            });
                            w.next().write_bytes(issuer_name_hash.as_ref());
                            w.next().write_bytes(issuer_key_hash.as_ref());
                            w.next().write_bigint_bytes(serial, true);
                        });
                    });
                });
            });
        });
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub status: CertStatus,
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
}

/// Reads the first `SingleResponse` of a successful basic OCSP response.
pub fn parse_response(der: &[u8]) -> Result<ParsedResponse, OcspError> {
    let (status, response_bytes) = yasna::parse_der(der, |r| {
        r.read_sequence(|r| {
            let status = r.next().read_enum()?;
            let bytes = if peek_tag(r) == Some(Tag::context(0)) {
                Some(r.next().read_tagged(Tag::context(0), |r| {
                    r.read_sequence(|r| {
                        let oid = r.next().read_oid()?;
                        let response = r.next().read_bytes()?;
                        Ok((oid, response))
                    })
                })?)
            } else {
                None
            };
            Ok((status, bytes))
        })
    })?;
    if status != 0 {
        return Err(OcspError::Status(status));
    }
    let (oid, basic) = response_bytes.ok_or(OcspError::UnsupportedResponseType)?;
    if oid != ObjectIdentifier::from_slice(OID_OCSP_BASIC) {
        return Err(OcspError::UnsupportedResponseType);
    }

    let responses = yasna::parse_der(&basic, |r| {
        r.read_sequence(|r| {
            let responses = r.next().read_sequence(|r| {
                if peek_tag(r) == Some(Tag::context(0)) {
                    r.next().read_der()?;
                }
                r.next().read_der()?;
                r.next().read_generalized_time()?;
                let responses = r.next().collect_sequence_of(read_single_response)?;
                skip_tagged(r, 1)?;
                Ok(responses)
            })?;
            r.next().read_der()?;
            r.next().read_bitvec_bytes()?;
            skip_tagged(r, 0)?;
            Ok(responses)
        })
    })?;

    let single = responses
        .into_iter()
        .next()
        .ok_or(OcspError::NoSingleResponse)?;
    Ok(ParsedResponse {
        status: single.status,
        this_update: to_chrono(&single.this_update)?,
        next_update: to_chrono(&single.next_update.ok_or(OcspError::MissingNextUpdate)?)?,
    })
}

struct SingleResponse {
    status: CertStatus,
    this_update: GeneralizedTime,
    next_update: Option<GeneralizedTime>,
}

fn read_single_response(r: BERReader) -> yasna::ASN1Result<SingleResponse> {
    r.read_sequence(|r| {
        r.next().read_der()?;
        let status = match peek_tag(r) {
            Some(tag) if tag == Tag::context(0) => CertStatus::Good,
            Some(tag) if tag == Tag::context(1) => CertStatus::Revoked,
            _ => CertStatus::Unknown,
        };
        r.next().read_der()?;
        let this_update = r.next().read_generalized_time()?;
        let next_update = if peek_tag(r) == Some(Tag::context(0)) {
            Some(
                r.next()
                    .read_tagged(Tag::context(0), |r| r.read_generalized_time())?,
            )
        } else {
            None
        };
        skip_tagged(r, 1)?;
        Ok(SingleResponse {
            status,
            this_update,
            next_update,
        })
    })
}

fn peek_tag(r: &mut BERReaderSeq) -> Option<Tag> {
    r.next().lookahead_tag().ok()
}

fn skip_tagged(r: &mut BERReaderSeq, number: u64) -> yasna::ASN1Result<()> {
    if peek_tag(r) == Some(Tag::context(number)) {
        r.next().read_der()?;
    }
    Ok(())
}

fn to_chrono(time: &GeneralizedTime) -> Result<DateTime<Utc>, OcspError> {
    DateTime::from_timestamp(time.datetime().unix_timestamp(), 0).ok_or(OcspError::Time)
}

#[derive(Error, Debug)]
pub enum OcspError {
    #[error("invalid certificate: {0}")]
    Certificate(String),
    #[error("malformed ocsp response: {0}")]
    Asn1(#[from] yasna::ASN1Error),
    #[error("ocsp responder answered with status {0}")]
    Status(i64),
    #[error("not a basic ocsp response")]
    UnsupportedResponseType,
    #[error("ocsp response without single response")]
    NoSingleResponse,
    #[error("ocsp response without nextUpdate")]
    MissingNextUpdate,
    #[error("ocsp timestamp out of range")]
    Time,
    #[error(transparent)]
    Http(#[from] HttpRequestError),
}
