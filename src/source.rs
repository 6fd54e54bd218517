use std::sync::Arc;

use futures::FutureExt;

use crate::codec::KeyClass;
use crate::manager::{
    CertManager, CertName, CertSupplier, HelloProfile, IssuedCert, ManagerError, Stapling,
    StaplingError, StaplingRegistry,
};

/// Obtains certificates from the manager with the deployment's key
/// preference, and keeps every served name under stapling maintenance.
pub struct CertificateSource {
    manager: Arc<dyn CertManager>,
    registry: Arc<dyn StaplingRegistry>,
    preferred: KeyClass,
}

impl CertificateSource {
    pub fn new(
        manager: Arc<dyn CertManager>,
        registry: Arc<dyn StaplingRegistry>,
        preferred: KeyClass,
    ) -> Self {
        Self {
            manager,
            registry,
            preferred,
        }
    }

    pub fn profile(&self, domain: &str) -> HelloProfile {
        HelloProfile::for_class(domain, self.preferred)
    }

    pub fn cert_name(&self, domain: &str) -> CertName {
        CertName::new(domain, self.preferred)
    }

    /// `domain` must already be normalized.
    pub async fn certificate(&self, domain: &str) -> Result<Arc<IssuedCert>, ManagerError> {
        let profile = self.profile(domain);
        let cert = self.manager.certificate(&profile).await?;

        let key = self.cert_name(domain).cache_key();
        let manager = Arc::clone(&self.manager);
        let supplier: CertSupplier = Arc::new(move || {
            let manager = Arc::clone(&manager);
            let profile = profile.clone();
            async move { manager.certificate(&profile).await }.boxed()
        });
        self.registry.watch(&key, supplier);

        Ok(cert)
    }

    pub fn http01_challenge_response(&self, token: &str) -> Result<String, ManagerError> {
        self.manager.http01_challenge_response(token)
    }
}

/// Looks up the OCSP response held for a domain.
pub struct StaplingSource {
    registry: Arc<dyn StaplingRegistry>,
    preferred: KeyClass,
}

impl StaplingSource {
    pub fn new(registry: Arc<dyn StaplingRegistry>, preferred: KeyClass) -> Self {
        Self {
            registry,
            preferred,
        }
    }

    /// Returns `Ok(None)` when the held response staples a different
    /// certificate than `fingerprint`: the caller's certificate rotated and
    /// no response for it is available yet.
    pub fn stapling(
        &self,
        domain: &str,
        fingerprint: Option<&str>,
    ) -> Result<Option<Arc<Stapling>>, StaplingError> {
        let key = CertName::new(domain, self.preferred).cache_key();
        let stapling = self.registry.stapling(&key)?;
        match fingerprint {
            Some(fp) if !fp.is_empty() && !fp.eq_ignore_ascii_case(&stapling.fingerprint) => {
                Ok(None)
            }
            _ => Ok(Some(stapling)),
        }
    }
}
