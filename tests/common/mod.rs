#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use ssl_cert_server::client::{ClientError, Fetcher};
use ssl_cert_server::codec;
use ssl_cert_server::protocol::{CertResponse, StaplingResponse};
use time::OffsetDateTime;
use tokio::sync::Barrier;
use yasna::models::ObjectIdentifier;
use yasna::Tag;

pub const OCSP_URL: &str = "http://ocsp.example.net";

const OID_AUTHORITY_INFO_ACCESS: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 1];
const OID_ACCESS_OCSP: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 1];

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

/// A fixed instant well inside the validity of every test certificate.
pub fn epoch() -> DateTime<Utc> {
    at(1_900_000_000)
}

pub struct TestCert {
    pub der: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
    pub fingerprint: String,
    pub not_after: DateTime<Utc>,
}

/// A self-signed ECDSA certificate, optionally naming an OCSP responder.
pub fn test_cert(domain: &str, not_after: DateTime<Utc>, ocsp_url: Option<&str>) -> TestCert {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![domain.to_owned()]).unwrap();
    params.not_after = OffsetDateTime::from_unix_timestamp(not_after.timestamp()).unwrap();
    if let Some(url) = ocsp_url {
        params.custom_extensions.push(CustomExtension::from_oid_content(
            OID_AUTHORITY_INFO_ACCESS,
            authority_info_access(url),
        ));
    }
    let cert = params.self_signed(&key_pair).unwrap();
    TestCert {
        der: cert.der().clone(),
        key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        fingerprint: codec::fingerprint(cert.der()),
        not_after,
    }
}

fn authority_info_access(url: &str) -> Vec<u8> {
    yasna::construct_der(|w| {
        w.write_sequence_of(|w| {
            w.next().write_sequence(|w| {
                w.next()
                    .write_oid(&ObjectIdentifier::from_slice(OID_ACCESS_OCSP));
                w.next()
                    .write_tagged_implicit(Tag::context(6), |w| w.write_bytes(url.as_bytes()));
            });
        });
    })
}

pub fn cert_response(cert: &TestCert, ttl: i64) -> CertResponse {
    CertResponse {
        cert_type: 0,
        cert: cert.cert_pem.clone(),
        pkey: cert.key_pem.clone(),
        fingerprint: cert.fingerprint.clone(),
        expire_at: cert.not_after.timestamp(),
        ttl,
    }
}

pub fn stapling_response(der: &[u8], expire_at: DateTime<Utc>, ttl: i64) -> StaplingResponse {
    StaplingResponse {
        der: der.to_vec(),
        expire_at: expire_at.timestamp(),
        ttl,
    }
}

#[derive(Debug, Clone)]
pub enum StaplingReply {
    Found(StaplingResponse),
    Absent,
}

/// A scripted [`Fetcher`]. Certificates are looked up by domain, staplings
/// by certificate fingerprint.
#[derive(Default)]
pub struct MockFetcher {
    certs: Mutex<HashMap<String, CertResponse>>,
    staplings: Mutex<HashMap<String, StaplingReply>>,
    failing_certs: Mutex<HashSet<String>>,
    failing_staplings: Mutex<HashSet<String>>,
    barrier: Option<Arc<Barrier>>,
    pub cert_fetches: AtomicUsize,
    pub stapling_fetches: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every certificate fetch waits on `barrier` before answering.
    pub fn with_barrier(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier: Some(barrier),
            ..Self::default()
        }
    }

    pub fn set_cert(&self, domain: &str, response: CertResponse) {
        self.certs
            .lock()
            .unwrap()
            .insert(domain.to_owned(), response);
    }

    pub fn set_stapling(&self, fingerprint: &str, reply: StaplingReply) {
        self.staplings
            .lock()
            .unwrap()
            .insert(fingerprint.to_owned(), reply);
    }

    pub fn fail_cert(&self, domain: &str, fail: bool) {
        toggle(&self.failing_certs, domain, fail);
    }

    pub fn fail_stapling(&self, domain: &str, fail: bool) {
        toggle(&self.failing_staplings, domain, fail);
    }

    pub fn cert_fetches(&self) -> usize {
        self.cert_fetches.load(Ordering::SeqCst)
    }

    pub fn stapling_fetches(&self) -> usize {
        self.stapling_fetches.load(Ordering::SeqCst)
    }
}

fn toggle(set: &Mutex<HashSet<String>>, domain: &str, on: bool) {
    let mut set = set.lock().unwrap();
    if on {
        set.insert(domain.to_owned());
    } else {
        set.remove(domain);
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch_cert(&self, domain: &str) -> Result<CertResponse, ClientError> {
        self.cert_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        if self.failing_certs.lock().unwrap().contains(domain) {
            return Err(ClientError::Protocol(format!(
                "certificate failure for {}",
                domain
            )));
        }
        self.certs
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .ok_or_else(|| ClientError::Protocol(format!("no certificate for {}", domain)))
    }

    async fn fetch_stapling(
        &self,
        domain: &str,
        fingerprint: &str,
    ) -> Result<Option<StaplingResponse>, ClientError> {
        self.stapling_fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing_staplings.lock().unwrap().contains(domain) {
            return Err(ClientError::Protocol(format!(
                "stapling failure for {}",
                domain
            )));
        }
        match self.staplings.lock().unwrap().get(fingerprint) {
            Some(StaplingReply::Found(response)) => Ok(Some(response.clone())),
            Some(StaplingReply::Absent) | None => Ok(None),
        }
    }
}
