//! Centralized [ACME] certificate and OCSP stapling distribution for TLS terminators.
//!
//! One process talks to the certificate authority, keeps issued certificates in a persistent
//! cache and fetches OCSP responses for them. Any number of TLS terminating processes pull
//! certificates and staplings from it over a small HTTP protocol and keep their own in-memory
//! copy fresh in the background.
//!
//! ## Server
//!
//! The binary in this crate runs the server. Certificates are issued with HTTP-01 challenges,
//! so the port serving `/.well-known/acme-challenge/` must be reachable from the CA (usually by
//! forwarding port 80 of the frontend to it).
//!
//! Library users can assemble a server from a [CertManager] and a [StaplingRegistry]:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ssl_cert_server::{
//!     caches::DirCache, codec::KeyClass, domain::HostPolicy, ocsp::OcspManager,
//!     server::{self, AppState}, ttl::SystemClock, AcmeConfig, AcmeManager,
//!     CertificateSource, StaplingSource,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let clock = Arc::new(SystemClock);
//!     let config = AcmeConfig::new(HostPolicy::whitelist(["example.com"]))
//!         .contact_push("mailto:admin@example.com");
//!     let manager = Arc::new(AcmeManager::new(config, DirCache::new("./secret-dir"), clock.clone()));
//!     let ocsp = Arc::new(OcspManager::new(clock.clone())?);
//!     ocsp.spawn_refresh();
//!
//!     let state = AppState::new(
//!         CertificateSource::new(manager, ocsp.clone(), KeyClass::Ecdsa),
//!         StaplingSource::new(ocsp, KeyClass::Ecdsa),
//!         clock,
//!     );
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8999").await?;
//!     server::serve(listener, Arc::new(state)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Client
//!
//! [client::CertClient] caches certificates and staplings per domain and implements
//! [rustls::server::ResolvesServerCert]. Since a resolver cannot wait for a fetch,
//! [client::CertAcceptor] reads the client hello first, warms the cache for the requested
//! server name and only then completes the handshake.
//!
//! ```rust,no_run
//! use ssl_cert_server::client::{CertAcceptor, CertClient, Options};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = CertClient::new("127.0.0.1:8999", Options::default()).await?;
//!     let acceptor = CertAcceptor::new(client)?;
//!     let listener = tokio::net::TcpListener::bind("[::]:443").await?;
//!     loop {
//!         let (tcp, _) = listener.accept().await?;
//!         let acceptor = acceptor.clone();
//!         tokio::spawn(async move {
//!             match acceptor.accept(tcp).await {
//!                 Ok(_tls) => { /* serve the connection */ }
//!                 Err(err) => log::warn!("handshake failed: {}", err),
//!             }
//!         });
//!     }
//! }
//! ```
//!
//! ## Account and certificate caching
//!
//! A server using the let's encrypt production directory must persist both the account and the
//! issued certificates to stay within the rate limits. [caches::DirCache] stores them in a
//! directory. Other persistence layers may implement the [Cache] trait, or the underlying
//! [CertCache] and [AccountCache] traits. [caches::TestCache] issues certificates from a
//! throwaway CA for environments without an ACME directory.
//!
//! [ACME]: https://en.wikipedia.org/wiki/Automatic_Certificate_Management_Environment

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod acme;
mod cache;
pub mod caches;
pub mod client;
pub mod codec;
mod config;
pub mod domain;
mod http_helper;
mod manager;
pub mod ocsp;
pub mod protocol;
pub mod server;
mod source;
pub mod ttl;

pub use tokio_rustls;

pub use acme::AcmeManager;
pub use cache::*;
pub use config::*;
pub use http_helper::HttpRequestError;
pub use manager::*;
pub use source::*;
