use std::fmt::{self, Display};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::digest::{Context, SHA256};

use crate::manager::CertName;
use crate::{AccountCache, CertCache};

/// Keeps certificates and account credentials as files in one directory.
///
/// The directory is created on the first store. File names are derived from
/// a hash of the key and the ACME directory URL, so staging and production
/// material never collide.
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_if_exist(&self, file: &str) -> Result<Option<Vec<u8>>, std::io::Error> {
        let path = self.dir.join(file);
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write(&self, file: &str, contents: &[u8]) -> Result<(), std::io::Error> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(file), contents).await
    }

    fn hashed_file_name<'a>(
        prefix: &str,
        parts: impl IntoIterator<Item = &'a str>,
        directory_url: &str,
    ) -> String {
        let mut ctx = Context::new(&SHA256);
        for part in parts {
            ctx.update(part.as_bytes());
            ctx.update(&[0]);
        }
        ctx.update(directory_url.as_bytes());
        format!("{}{}", prefix, URL_SAFE_NO_PAD.encode(ctx.finish()))
    }

    fn cached_cert_file_name(name: &CertName, directory_url: &str) -> String {
        let key = name.cache_key();
        Self::hashed_file_name("cached_cert_", [key.as_str()], directory_url)
    }

    fn cached_account_file_name(contact: &[String], directory_url: &str) -> String {
        Self::hashed_file_name(
            "cached_account_",
            contact.iter().map(String::as_str),
            directory_url,
        )
    }
}

impl Display for DirCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirCache({})", self.dir.display())
    }
}

#[async_trait]
impl CertCache for DirCache {
    type EC = std::io::Error;
    async fn load_cert(
        &self,
        name: &CertName,
        directory_url: &str,
    ) -> Result<Option<Vec<u8>>, Self::EC> {
        let file_name = Self::cached_cert_file_name(name, directory_url);
        self.read_if_exist(&file_name).await
    }
    async fn store_cert(
        &self,
        name: &CertName,
        directory_url: &str,
        cert: &[u8],
    ) -> Result<(), Self::EC> {
        let file_name = Self::cached_cert_file_name(name, directory_url);
        self.write(&file_name, cert).await
    }
}

#[async_trait]
impl AccountCache for DirCache {
    type EA = std::io::Error;
    async fn load_account(
        &self,
        contact: &[String],
        directory_url: &str,
    ) -> Result<Option<Vec<u8>>, Self::EA> {
        let file_name = Self::cached_account_file_name(contact, directory_url);
        self.read_if_exist(&file_name).await
    }
    async fn store_account(
        &self,
        contact: &[String],
        directory_url: &str,
        account: &[u8],
    ) -> Result<(), Self::EA> {
        let file_name = Self::cached_account_file_name(contact, directory_url);
        self.write(&file_name, account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::KeyClass;

    const STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
    const PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

    #[tokio::test]
    async fn stores_and_loads_per_name_and_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(tmp.path().join("secret-dir"));
        let ecdsa = CertName::new("example.com", KeyClass::Ecdsa);
        let rsa = CertName::new("example.com", KeyClass::Rsa);

        assert_eq!(cache.load_cert(&ecdsa, STAGING).await.unwrap(), None);
        cache.store_cert(&ecdsa, STAGING, b"ecdsa").await.unwrap();
        cache.store_cert(&rsa, STAGING, b"rsa").await.unwrap();

        assert_eq!(
            cache.load_cert(&ecdsa, STAGING).await.unwrap().as_deref(),
            Some(&b"ecdsa"[..])
        );
        assert_eq!(
            cache.load_cert(&rsa, STAGING).await.unwrap().as_deref(),
            Some(&b"rsa"[..])
        );
        assert_eq!(cache.load_cert(&ecdsa, PRODUCTION).await.unwrap(), None);
    }

    #[tokio::test]
    async fn accounts_are_keyed_by_contact() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(tmp.path());
        let admin = vec!["mailto:admin@example.com".to_owned()];
        let ops = vec!["mailto:ops@example.com".to_owned()];

        cache.store_account(&admin, STAGING, b"{}").await.unwrap();
        assert!(cache.load_account(&admin, STAGING).await.unwrap().is_some());
        assert!(cache.load_account(&ops, STAGING).await.unwrap().is_none());
    }
}
