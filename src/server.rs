//! HTTP surface of the certificate server.
//!
//! Three routes share one listener: certificate bundles, OCSP staplings
//! and HTTP-01 challenge responses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::codec::{self, CodecError};
use crate::domain::{normalize_domain, DomainError};
use crate::manager::{IssuedCert, ManagerError, StaplingError};
use crate::protocol::{CertResponse, HEADER_EXPIRE_AT, HEADER_TTL, OCSP_RESPONSE_CONTENT_TYPE};
use crate::source::{CertificateSource, StaplingSource};
use crate::ttl::{compute_ttl, Clock};

pub struct AppState {
    pub certs: CertificateSource,
    pub staplings: StaplingSource,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(certs: CertificateSource, staplings: StaplingSource, clock: Arc<dyn Clock>) -> Self {
        Self {
            certs,
            staplings,
            clock,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/cert/{domain}", get(certificate))
        .route("/ocsp/{domain}", get(stapling))
        .route("/.well-known/acme-challenge/{token}", get(challenge))
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

/// Serves the router until the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn certificate(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> Result<Json<CertResponse>, ServeError> {
    let domain = normalize_domain(&domain).map_err(ServeError::InvalidDomain)?;
    let cert = state
        .certs
        .certificate(&domain)
        .await
        .map_err(|err| match err {
            ManagerError::NotPermitted(name) => ServeError::NotPermitted(name),
            err => ServeError::Manager(domain.clone(), err),
        })?;
    let response = cert_response(&cert, state.clock.now(), &mut rand::thread_rng())
        .map_err(|err| err.for_domain(&domain))?;
    Ok(Json(response))
}

/// Shapes an issued certificate into the wire response. Fails with
/// [`ServeError::Expired`] once the leaf is no longer valid.
pub fn cert_response<R: Rng + ?Sized>(
    cert: &IssuedCert,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<CertResponse, ServeError> {
    let expire_at = cert.leaf.not_after;
    let ttl = compute_ttl(expire_at - now, rng).ok_or(ServeError::Expired {
        what: "certificate",
        domain: String::new(),
    })?;
    let (key_class, pkey) = codec::encode_private_key(&cert.key)?;
    Ok(CertResponse {
        cert_type: key_class.code(),
        cert: codec::encode_chain(&cert.chain),
        pkey,
        fingerprint: cert.leaf.fingerprint.clone(),
        expire_at: expire_at.timestamp(),
        ttl,
    })
}

#[derive(Deserialize)]
struct StaplingQuery {
    fp: Option<String>,
}

async fn stapling(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
    Query(query): Query<StaplingQuery>,
) -> Result<Response, ServeError> {
    let domain = normalize_domain(&domain).map_err(ServeError::InvalidDomain)?;
    let stapling = match state.staplings.stapling(&domain, query.fp.as_deref()) {
        Ok(Some(stapling)) => stapling,
        Ok(None) => return Ok(StatusCode::NO_CONTENT.into_response()),
        Err(StaplingError::CacheMiss(_)) => return Err(ServeError::NoStapling(domain)),
    };

    let ttl = compute_ttl(
        stapling.next_update - state.clock.now(),
        &mut rand::thread_rng(),
    )
    .ok_or_else(|| ServeError::Expired {
        what: "ocsp stapling",
        domain: domain.clone(),
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(OCSP_RESPONSE_CONTENT_TYPE),
    );
    headers.insert(
        HEADER_EXPIRE_AT,
        HeaderValue::from(stapling.next_update.timestamp()),
    );
    headers.insert(HEADER_TTL, HeaderValue::from(ttl));
    Ok((headers, stapling.der.clone()).into_response())
}

async fn challenge(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<String, ServeError> {
    state
        .certs
        .http01_challenge_response(&token)
        .map_err(|err| match err {
            ManagerError::ChallengeNotFound => ServeError::UnknownToken(token.clone()),
            err => ServeError::Manager(token.clone(), err),
        })
}

async fn access_log(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_owned());
    let response = next.run(request).await;
    log::info!(
        "{} {} {} {} {:?}",
        remote,
        response.status().as_u16(),
        method,
        uri,
        start.elapsed()
    );
    response
}

/// Request failures and the status each one is answered with.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("invalid domain name: {0}")]
    InvalidDomain(DomainError),
    #[error("domain name not permitted: {0}")]
    NotPermitted(String),
    #[error("{what} expired for {domain:?}")]
    Expired { what: &'static str, domain: String },
    #[error("no ocsp stapling for {0}")]
    NoStapling(String),
    #[error("unknown acme challenge token {0:?}")]
    UnknownToken(String),
    #[error("failed getting certificate for {0}: {1}")]
    Manager(String, ManagerError),
    #[error("failed encoding certificate: {0}")]
    Codec(#[from] CodecError),
}

impl ServeError {
    fn for_domain(self, domain: &str) -> Self {
        match self {
            ServeError::Expired { what, .. } => ServeError::Expired {
                what,
                domain: domain.to_owned(),
            },
            err => err,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::InvalidDomain(_) => StatusCode::BAD_REQUEST,
            ServeError::NotPermitted(_) => StatusCode::FORBIDDEN,
            ServeError::Expired { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::NoStapling(_) | ServeError::UnknownToken(_) => StatusCode::NOT_FOUND,
            ServeError::Manager(..) | ServeError::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{}", self);
        } else {
            log::warn!("{}", self);
        }
        let body = match status {
            StatusCode::BAD_REQUEST => "Invalid domain name.",
            StatusCode::FORBIDDEN => "Domain name not permitted.",
            StatusCode::NOT_FOUND => "Not found.",
            StatusCode::SERVICE_UNAVAILABLE => "Resource expired.",
            _ => "Internal server error.",
        };
        (status, body).into_response()
    }
}
