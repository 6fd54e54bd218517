use std::fmt::{Debug, Display};

use async_trait::async_trait;

use crate::manager::CertName;

pub trait Cache: CertCache + AccountCache + Display {}

impl<T> Cache for T where T: CertCache + AccountCache + Display {}

/// Persists issued certificates as PEM bundles, private key first.
#[async_trait]
pub trait CertCache: Send + Sync + Display {
    type EC: Debug + Display;
    async fn load_cert(
        &self,
        name: &CertName,
        directory_url: &str,
    ) -> Result<Option<Vec<u8>>, Self::EC>;
    async fn store_cert(
        &self,
        name: &CertName,
        directory_url: &str,
        cert: &[u8],
    ) -> Result<(), Self::EC>;
}

/// Persists serialized ACME account credentials.
#[async_trait]
pub trait AccountCache: Send + Sync + Display {
    type EA: Debug + Display;
    async fn load_account(
        &self,
        contact: &[String],
        directory_url: &str,
    ) -> Result<Option<Vec<u8>>, Self::EA>;
    async fn store_account(
        &self,
        contact: &[String],
        directory_url: &str,
        account: &[u8],
    ) -> Result<(), Self::EA>;
}
