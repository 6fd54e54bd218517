use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, ExternalAccountKey,
    Identifier, NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{
    CertificateParams, DistinguishedName, KeyPair, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::Mutex;

use crate::codec::{self, KeyClass};
use crate::config::AcmeConfig;
use crate::domain::normalize_domain;
use crate::manager::{CertManager, CertName, HelloProfile, IssuedCert, ManagerError};
use crate::ttl::Clock;
use crate::Cache;

const RSA_KEY_BITS: usize = 2048;
const ORDER_POLL_ATTEMPTS: usize = 20;
const ORDER_POLL_MAX_DELAY: Duration = Duration::from_secs(10);

/// A [`CertManager`] that issues certificates from an ACME directory using
/// HTTP-01 challenges.
///
/// Certificates are kept in memory and in the configured [`Cache`]. Orders
/// for the same name never run concurrently; a certificate that is inside
/// its renew-before window keeps being served while a replacement is
/// ordered in the background.
pub struct AcmeManager<C: Cache + 'static> {
    inner: Arc<Inner<C>>,
}

struct Inner<C: Cache + 'static> {
    config: AcmeConfig,
    cache: C,
    clock: Arc<dyn Clock>,
    certs: DashMap<String, Arc<IssuedCert>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    renewing: DashSet<String>,
    tokens: DashMap<String, String>,
    account: Mutex<Option<Account>>,
}

impl<C: Cache + 'static> AcmeManager<C> {
    pub fn new(config: AcmeConfig, cache: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                clock,
                certs: DashMap::new(),
                locks: DashMap::new(),
                renewing: DashSet::new(),
                tokens: DashMap::new(),
                account: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.inner.config
    }
}

#[async_trait]
impl<C: Cache + 'static> CertManager for AcmeManager<C> {
    async fn certificate(&self, profile: &HelloProfile) -> Result<Arc<IssuedCert>, ManagerError> {
        let domain = normalize_domain(&profile.server_name)?;
        self.inner.config.host_policy.check(&domain)?;
        let name = CertName::new(domain, profile.cert_name().key_class);
        Inner::certificate(&self.inner, name).await
    }

    fn http01_challenge_response(&self, token: &str) -> Result<String, ManagerError> {
        self.inner
            .tokens
            .get(token)
            .map(|key_auth| key_auth.value().clone())
            .ok_or(ManagerError::ChallengeNotFound)
    }
}

impl<C: Cache + 'static> Inner<C> {
    async fn certificate(
        self: &Arc<Self>,
        name: CertName,
    ) -> Result<Arc<IssuedCert>, ManagerError> {
        let key = name.cache_key();
        if let Some(cert) = self.serve_from_memory(&name, self.clock.now()) {
            return Ok(cert);
        }

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;
        let now = self.clock.now();
        if let Some(cert) = self.serve_from_memory(&name, now) {
            return Ok(cert);
        }

        if let Some(cert) = self.load_cached(&name).await? {
            if !cert.is_expired_at(now) {
                log::info!("loaded cached certificate for {}", name);
                let cert = Arc::new(cert);
                self.certs.insert(key, Arc::clone(&cert));
                if self.needs_renewal(&cert, now) {
                    self.spawn_renewal(name);
                }
                return Ok(cert);
            }
            log::info!("cached certificate for {} expired", name);
        }

        self.issue(&name).await
    }

    fn serve_from_memory(
        self: &Arc<Self>,
        name: &CertName,
        now: DateTime<Utc>,
    ) -> Option<Arc<IssuedCert>> {
        let cert = self.certs.get(&name.cache_key()).map(|c| Arc::clone(c.value()))?;
        if cert.is_expired_at(now) {
            return None;
        }
        if self.needs_renewal(&cert, now) {
            self.spawn_renewal(name.clone());
        }
        Some(cert)
    }

    fn needs_renewal(&self, cert: &IssuedCert, now: DateTime<Utc>) -> bool {
        cert.leaf.not_after - self.config.renew_before <= now
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(key.to_owned()).or_default().value())
    }

    fn spawn_renewal(self: &Arc<Self>, name: CertName) {
        let key = name.cache_key();
        if !self.renewing.insert(key.clone()) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let lock = inner.lock_for(&key);
            let _guard = lock.lock().await;
            let current = inner.certs.get(&key).map(|c| Arc::clone(c.value()));
            let now = inner.clock.now();
            let due = current.map_or(true, |cert| inner.needs_renewal(&cert, now));
            if due {
                log::info!("renewing certificate for {}", name);
                if let Err(err) = inner.issue(&name).await {
                    log::warn!("renewal of {} failed: {}", name, err);
                }
            }
            inner.renewing.remove(&key);
        });
    }

    async fn load_cached(&self, name: &CertName) -> Result<Option<IssuedCert>, ManagerError> {
        let pem = self
            .cache
            .load_cert(name, &self.config.directory_url)
            .await
            .map_err(|err| ManagerError::Cache(err.to_string()))?;
        match pem {
            Some(pem) => match IssuedCert::from_pem(&pem) {
                Ok(cert) => Ok(Some(cert)),
                Err(err) => {
                    log::warn!("ignoring unreadable cached certificate for {}: {}", name, err);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn issue(&self, name: &CertName) -> Result<Arc<IssuedCert>, ManagerError> {
        log::info!("ordering certificate for {}", name);
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(name.domain.clone())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(acme_error)?;

        let mut tokens = Vec::new();
        let result = self.complete_order(&mut order, name, &mut tokens).await;
        for token in &tokens {
            self.tokens.remove(token);
        }
        let cert = Arc::new(result?);
        log::info!(
            "issued certificate for {}, valid until {}",
            name,
            cert.leaf.not_after
        );

        match cert.to_pem() {
            Ok(pem) => {
                if let Err(err) = self
                    .cache
                    .store_cert(name, &self.config.directory_url, pem.as_bytes())
                    .await
                {
                    log::error!("could not store certificate for {}: {}", name, err);
                }
            }
            Err(err) => log::error!("could not encode certificate for {}: {}", name, err),
        }
        self.certs.insert(name.cache_key(), Arc::clone(&cert));
        Ok(cert)
    }

    async fn complete_order(
        &self,
        order: &mut Order,
        name: &CertName,
        tokens: &mut Vec<String>,
    ) -> Result<IssuedCert, ManagerError> {
        let authorizations = order.authorizations().await.map_err(acme_error)?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(ManagerError::Issuance(format!(
                        "authorization for {} is {:?}",
                        name.domain, status
                    )))
                }
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    ManagerError::Acme(format!("no http-01 challenge offered for {}", name.domain))
                })?;
            let key_auth = order.key_authorization(challenge);
            self.tokens
                .insert(challenge.token.clone(), key_auth.as_str().to_owned());
            tokens.push(challenge.token.clone());
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(acme_error)?;
        }

        poll_order(order, OrderStatus::Ready).await?;

        let key_class = name.key_class;
        let key_pair = tokio::task::spawn_blocking(move || generate_key_pair(key_class))
            .await
            .map_err(|err| ManagerError::Issuance(err.to_string()))??;
        let mut params = CertificateParams::new(vec![name.domain.clone()])
            .map_err(|err| ManagerError::Issuance(err.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|err| ManagerError::Issuance(err.to_string()))?;
        order.finalize(csr.der()).await.map_err(acme_error)?;

        poll_order(order, OrderStatus::Valid).await?;
        let chain_pem = order
            .certificate()
            .await
            .map_err(acme_error)?
            .ok_or_else(|| ManagerError::Issuance("no certificate in valid order".to_owned()))?;

        let chain = codec::decode_chain(chain_pem.as_bytes())?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok(IssuedCert::new(chain, key)?)
    }

    async fn account(&self) -> Result<Account, ManagerError> {
        let mut slot = self.account.lock().await;
        if let Some(account) = slot.as_ref() {
            return Ok(account.clone());
        }

        let directory_url = &self.config.directory_url;
        let contact = &self.config.contact;
        let cached = self
            .cache
            .load_account(contact, directory_url)
            .await
            .map_err(|err| ManagerError::Cache(err.to_string()))?;
        let account = match cached {
            Some(json) => {
                let credentials: AccountCredentials = serde_json::from_slice(&json)
                    .map_err(|err| ManagerError::Cache(err.to_string()))?;
                log::info!("using cached acme account");
                Account::from_credentials(credentials)
                    .await
                    .map_err(acme_error)?
            }
            None => {
                let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
                let eab = self
                    .config
                    .issuer
                    .eab
                    .as_ref()
                    .map(|eab| ExternalAccountKey::new(eab.kid.clone(), eab.key()));
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &contact_refs,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    directory_url,
                    eab.as_ref(),
                )
                .await
                .map_err(acme_error)?;
                log::info!("registered acme account at {}", directory_url);
                match serde_json::to_vec(&credentials) {
                    Ok(json) => {
                        if let Err(err) =
                            self.cache.store_account(contact, directory_url, &json).await
                        {
                            log::error!("could not store acme account: {}", err);
                        }
                    }
                    Err(err) => log::error!("could not serialize acme account: {}", err),
                }
                account
            }
        };
        *slot = Some(account.clone());
        Ok(account)
    }
}

async fn poll_order(order: &mut Order, wanted: OrderStatus) -> Result<(), ManagerError> {
    let mut delay = Duration::from_millis(250);
    for _ in 0..ORDER_POLL_ATTEMPTS {
        let state = order.refresh().await.map_err(acme_error)?;
        if state.status == wanted {
            return Ok(());
        }
        if state.status == OrderStatus::Invalid {
            return Err(ManagerError::Issuance(format!(
                "order became invalid: {:?}",
                state.error
            )));
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(ORDER_POLL_MAX_DELAY);
    }
    Err(ManagerError::Issuance(format!(
        "order did not become {:?} in time",
        wanted
    )))
}

fn generate_key_pair(key_class: KeyClass) -> Result<KeyPair, ManagerError> {
    let issuance = |err: &dyn std::fmt::Display| ManagerError::Issuance(err.to_string());
    match key_class {
        KeyClass::Ecdsa => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| issuance(&e)),
        KeyClass::Rsa => {
            let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
                .map_err(|e| issuance(&e))?;
            let der = private.to_pkcs8_der().map_err(|e| issuance(&e))?;
            let pkcs8 = PrivatePkcs8KeyDer::from(der.as_bytes());
            KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &PKCS_RSA_SHA256)
                .map_err(|e| issuance(&e))
        }
    }
}

fn acme_error(err: instant_acme::Error) -> ManagerError {
    ManagerError::Acme(err.to_string())
}
