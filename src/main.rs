use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ssl_cert_server::caches::{DirCache, TestCache};
use ssl_cert_server::ocsp::OcspManager;
use ssl_cert_server::server::{self, AppState};
use ssl_cert_server::ttl::{Clock, SystemClock};
use ssl_cert_server::{
    AcmeConfig, AcmeManager, CertManager, CertificateSource, IssuerConfig, StaplingSource,
};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(version, about = "Issues certificates and OCSP staplings for TLS terminators")]
struct Args {
    /// Address the HTTP server listens on.
    #[arg(long, env = "SSL_CERT_SERVER_LISTEN", default_value = "127.0.0.1:8999")]
    listen: SocketAddr,

    /// Use the Let's Encrypt staging directory.
    #[arg(long, env = "SSL_CERT_SERVER_STAGING")]
    staging: bool,

    /// Directory holding the account and issued certificates.
    #[arg(long, env = "SSL_CERT_SERVER_CACHE_DIR", default_value = "./secret-dir")]
    cache_dir: PathBuf,

    /// Renew certificates this many days before they expire.
    #[arg(long, env = "SSL_CERT_SERVER_BEFORE", default_value_t = 30)]
    before: u32,

    /// Contact email registered with the ACME account.
    #[arg(long, env = "SSL_CERT_SERVER_EMAIL", default_value = "")]
    email: String,

    /// Issue RSA certificates instead of ECDSA.
    #[arg(long, env = "SSL_CERT_SERVER_FORCE_RSA")]
    force_rsa: bool,

    /// Allowed domain; may be repeated.
    #[arg(long = "domain", env = "SSL_CERT_SERVER_DOMAINS", value_delimiter = ',')]
    domains: Vec<String>,

    /// Regex of allowed domains; may be repeated. Ignored when a domain
    /// is given.
    #[arg(long = "pattern", env = "SSL_CERT_SERVER_PATTERNS", value_delimiter = ',')]
    patterns: Vec<String>,

    /// External account binding key id.
    #[arg(long, env = "SSL_CERT_SERVER_EAB_KID")]
    eab_kid: Option<String>,

    /// External account binding HMAC key, base64url encoded.
    #[arg(long, env = "SSL_CERT_SERVER_EAB_KEY", hide_env_values = true)]
    eab_key: Option<String>,

    /// Serve certificates signed by a throwaway CA instead of using ACME.
    #[arg(long, env = "SSL_CERT_SERVER_SELF_SIGNED")]
    self_signed: bool,

    #[arg(long, env = "SSL_CERT_SERVER_LOG_LEVEL", default_value = "info")]
    log_level: log::Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    simple_logger::init_with_level(args.log_level)?;

    let issuer = IssuerConfig::new(
        args.force_rsa,
        args.eab_kid.as_deref(),
        args.eab_key.as_deref(),
    )?;
    let key_class = issuer.key_class;
    let config = AcmeConfig::from_host_lists(&args.domains, &args.patterns)?
        .directory_lets_encrypt(!args.staging)
        .email(&args.email)
        .renew_before_days(args.before)
        .issuer(issuer);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let manager: Arc<dyn CertManager> = if args.self_signed {
        let cache: TestCache = TestCache::new()?;
        log::warn!("serving self-signed certificates, trust this CA:\n{}", cache.ca_pem());
        Arc::new(AcmeManager::new(config, cache, Arc::clone(&clock)))
    } else {
        log::info!(
            "using acme directory {} with cache {}",
            config.directory_url,
            args.cache_dir.display()
        );
        Arc::new(AcmeManager::new(
            config,
            DirCache::new(args.cache_dir),
            Arc::clone(&clock),
        ))
    };

    let ocsp = Arc::new(OcspManager::new(Arc::clone(&clock))?);
    ocsp.spawn_refresh();

    let state = AppState::new(
        CertificateSource::new(manager, ocsp.clone(), key_class),
        StaplingSource::new(ocsp, key_class),
        clock,
    );
    let listener = TcpListener::bind(args.listen).await?;
    log::info!("listening on http://{}", listener.local_addr()?);
    server::serve(listener, Arc::new(state)).await?;
    Ok(())
}
