mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use ssl_cert_server::client::{CertClient, ClientError, Options};
use ssl_cert_server::codec;
use ssl_cert_server::ttl::ManualClock;
use tokio::sync::Barrier;

use common::{
    cert_response, epoch, stapling_response, test_cert, MockFetcher, StaplingReply, TestCert,
    OCSP_URL,
};

const DOMAIN: &str = "example.com";

struct Harness {
    fetcher: Arc<MockFetcher>,
    clock: Arc<ManualClock>,
    client: CertClient,
}

async fn harness(fetcher: MockFetcher, options: Options) -> Harness {
    let fetcher = Arc::new(fetcher);
    let clock = Arc::new(ManualClock::new(epoch()));
    let client = CertClient::with_fetcher(fetcher.clone(), clock.clone(), options).await;
    Harness {
        fetcher,
        clock,
        client,
    }
}

/// A certificate valid for 90 days from the epoch, with an OCSP responder.
fn stapled_cert(domain: &str) -> TestCert {
    test_cert(domain, epoch() + TimeDelta::days(90), Some(OCSP_URL))
}

/// Serves `cert` with `cert_ttl`, and a stapling for it expiring after
/// `stapling_lifetime` with `stapling_ttl`.
fn serve(
    fetcher: &MockFetcher,
    domain: &str,
    cert: &TestCert,
    cert_ttl: i64,
    stapling: &[u8],
    stapling_lifetime: TimeDelta,
    stapling_ttl: i64,
) {
    fetcher.set_cert(domain, cert_response(cert, cert_ttl));
    fetcher.set_stapling(
        &cert.fingerprint,
        StaplingReply::Found(stapling_response(
            stapling,
            epoch() + stapling_lifetime,
            stapling_ttl,
        )),
    );
}

#[tokio::test]
async fn first_read_fetches_certificate_and_stapling() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 3600, b"staple", TimeDelta::hours(24), 3600);
    let h = harness(fetcher, Options::default()).await;

    let key = h.client.get_certificate("Example.COM.").await.unwrap();
    assert_eq!(key.cert[0], cert.der);
    assert_eq!(key.ocsp.as_deref(), Some(&b"staple"[..]));
    assert_eq!(h.fetcher.cert_fetches(), 1);
    assert_eq!(h.fetcher.stapling_fetches(), 1);

    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(cached.fingerprint(), cert.fingerprint);
    assert_eq!(cached.cert_expire_at, cert.not_after);
    assert_eq!(cached.cert_refresh_at, epoch() + TimeDelta::seconds(3600));
    assert_eq!(
        cached.stapling_refresh_at,
        Some(epoch() + TimeDelta::seconds(3600))
    );

    // A hit is answered from memory.
    let again = h.client.get_certificate(DOMAIN).await.unwrap();
    assert!(Arc::ptr_eq(&key, &again));
    assert_eq!(h.fetcher.cert_fetches(), 1);
}

#[tokio::test]
async fn stapling_close_to_expiry_is_cleared_on_read() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 3600, b"staple", TimeDelta::hours(1), 3000);
    let h = harness(fetcher, Options::default()).await;

    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert!(key.ocsp.is_some());

    h.clock.advance(TimeDelta::hours(1) - TimeDelta::seconds(30));
    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.ocsp, None);
    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(cached.stapling, None);
    assert_eq!(cached.certified.ocsp, None);
    assert_eq!(h.fetcher.cert_fetches(), 1);
}

#[tokio::test]
async fn names_outside_the_allow_list_are_never_fetched() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 3600, b"staple", TimeDelta::hours(24), 3600);
    let options = Options {
        allow_domains: vec![DOMAIN.to_owned()],
        ..Options::default()
    };
    let h = harness(fetcher, options).await;

    let err = h.client.get_certificate("evil.test").await.unwrap_err();
    assert!(matches!(err, ClientError::NotPermitted(ref name) if name == "evil.test"));
    assert!(err.is_permanent());
    assert_eq!(h.fetcher.cert_fetches(), 0);
    assert!(h.client.cached("evil.test").is_none());

    h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(h.fetcher.cert_fetches(), 1);
}

#[tokio::test]
async fn invalid_names_are_rejected() {
    let h = harness(MockFetcher::new(), Options::default()).await;
    let err = h.client.get_certificate("localhost").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidName(_)));
    assert_eq!(h.fetcher.cert_fetches(), 0);
}

#[tokio::test]
async fn missing_stapling_is_not_an_error() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    fetcher.set_cert(DOMAIN, cert_response(&cert, 3600));
    fetcher.set_stapling(&cert.fingerprint, StaplingReply::Absent);
    let h = harness(fetcher, Options::default()).await;

    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.ocsp, None);
    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(cached.stapling, None);
    assert_eq!(cached.stapling_refresh_at, None);

    // The stapling stays due, and asking again is still not an error.
    h.client.refresh_due().await.unwrap();
    assert_eq!(h.fetcher.stapling_fetches(), 2);
    assert_eq!(h.client.cached(DOMAIN).unwrap().stapling, None);
}

#[tokio::test]
async fn certificates_without_responder_skip_stapling() {
    let fetcher = MockFetcher::new();
    let cert = test_cert(DOMAIN, epoch() + TimeDelta::days(90), None);
    fetcher.set_cert(DOMAIN, cert_response(&cert, 3600));
    let h = harness(fetcher, Options::default()).await;

    h.client.get_certificate(DOMAIN).await.unwrap();
    h.client.refresh_due().await.unwrap();
    assert_eq!(h.fetcher.stapling_fetches(), 0);
}

#[tokio::test]
async fn no_stapling_certificate_types_skip_stapling() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    let mut response = cert_response(&cert, 3600);
    response.cert_type = codec::NO_STAPLING_TYPE;
    fetcher.set_cert(DOMAIN, response);
    let h = harness(fetcher, Options::default()).await;

    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.ocsp, None);
    assert_eq!(h.fetcher.stapling_fetches(), 0);
}

#[tokio::test]
async fn disabled_stapling_is_never_fetched() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 60, b"staple", TimeDelta::hours(24), 60);
    let options = Options {
        disable_stapling: true,
        ..Options::default()
    };
    let h = harness(fetcher, options).await;

    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.ocsp, None);
    h.clock.advance(TimeDelta::seconds(61));
    h.client.refresh_due().await.unwrap();
    assert_eq!(h.fetcher.cert_fetches(), 2);
    assert_eq!(h.fetcher.stapling_fetches(), 0);
}

#[tokio::test]
async fn refresh_is_a_no_op_when_nothing_is_due() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 3600, b"staple", TimeDelta::hours(24), 3600);
    let h = harness(fetcher, Options::default()).await;

    h.client.get_certificate(DOMAIN).await.unwrap();
    let before = h.client.cached(DOMAIN).unwrap();
    h.clock.advance(TimeDelta::seconds(3599));
    h.client.refresh_due().await.unwrap();
    h.client.refresh_due().await.unwrap();

    let after = h.client.cached(DOMAIN).unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(h.fetcher.cert_fetches(), 1);
    assert_eq!(h.fetcher.stapling_fetches(), 1);
}

#[tokio::test]
async fn due_entries_are_refreshed() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 60, b"staple-1", TimeDelta::hours(24), 60);
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate(DOMAIN).await.unwrap();

    serve(&h.fetcher, DOMAIN, &cert, 3600, b"staple-2", TimeDelta::hours(48), 3600);
    h.clock.advance(TimeDelta::seconds(60));
    h.client.refresh_due().await.unwrap();

    let cached = h.client.cached(DOMAIN).unwrap();
    let stapling = cached.stapling.as_ref().unwrap();
    assert_eq!(stapling.der, b"staple-2");
    assert_eq!(stapling.expire_at, epoch() + TimeDelta::hours(48));
    assert_eq!(
        cached.cert_refresh_at,
        epoch() + TimeDelta::seconds(60 + 3600)
    );
    assert_eq!(cached.certified.ocsp.as_deref(), Some(&b"staple-2"[..]));
    assert_eq!(h.fetcher.cert_fetches(), 2);
    assert_eq!(h.fetcher.stapling_fetches(), 2);
}

#[tokio::test]
async fn failed_stapling_refresh_keeps_the_old_stapling() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 3600, b"staple", TimeDelta::hours(1), 60);
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate(DOMAIN).await.unwrap();

    h.fetcher.fail_stapling(DOMAIN, true);
    h.clock.advance(TimeDelta::seconds(61));
    let err = h.client.refresh_due().await.unwrap_err();
    assert!(err.to_string().contains("stapling failure"));

    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(cached.stapling.as_ref().unwrap().der, b"staple");
    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.ocsp.as_deref(), Some(&b"staple"[..]));
}

#[tokio::test]
async fn failed_stapling_refresh_abandons_a_stapling_about_to_expire() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 3600, b"staple", TimeDelta::seconds(200), 10);
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate(DOMAIN).await.unwrap();

    h.fetcher.fail_stapling(DOMAIN, true);
    h.clock.advance(TimeDelta::seconds(100));
    assert!(h.client.refresh_due().await.is_err());

    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(cached.stapling, None);
    assert_eq!(cached.certified.ocsp, None);
    assert_eq!(cached.fingerprint(), cert.fingerprint);
}

#[tokio::test(start_paused = true)]
async fn failed_certificate_refresh_serves_the_old_certificate_until_expiry() {
    let fetcher = MockFetcher::new();
    let cert = test_cert(DOMAIN, epoch() + TimeDelta::hours(1), None);
    fetcher.set_cert(DOMAIN, cert_response(&cert, 60));
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate(DOMAIN).await.unwrap();

    h.fetcher.fail_cert(DOMAIN, true);
    h.clock.advance(TimeDelta::seconds(120));
    let err = h.client.refresh_with_retry().await.unwrap_err();
    assert!(err.to_string().contains("certificate failure"));
    assert_eq!(h.fetcher.cert_fetches(), 1 + 3);

    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.cert[0], cert.der);

    h.clock.advance(TimeDelta::hours(1));
    let err = h.client.get_certificate(DOMAIN).await.unwrap_err();
    assert!(matches!(err, ClientError::Expired(ref name) if name == DOMAIN));
}

#[tokio::test]
async fn certificate_errors_take_priority_over_stapling_errors() {
    let fetcher = MockFetcher::new();
    let a = stapled_cert("a.example.com");
    let b = stapled_cert("b.example.com");
    serve(&fetcher, "a.example.com", &a, 60, b"staple-a", TimeDelta::hours(24), 60);
    serve(&fetcher, "b.example.com", &b, 60, b"staple-b", TimeDelta::hours(24), 60);
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate("a.example.com").await.unwrap();
    h.client.get_certificate("b.example.com").await.unwrap();

    h.fetcher.fail_stapling("a.example.com", true);
    h.fetcher.fail_cert("b.example.com", true);
    h.clock.advance(TimeDelta::seconds(61));
    let err = h.client.refresh_due().await.unwrap_err();
    assert!(
        err.to_string().contains("certificate failure for b.example.com"),
        "{}",
        err
    );
}

#[tokio::test]
async fn rotated_certificate_drops_the_stapling_of_the_old_one() {
    let fetcher = MockFetcher::new();
    let old = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &old, 60, b"staple-old", TimeDelta::hours(24), 3600);
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate(DOMAIN).await.unwrap();

    let new = stapled_cert(DOMAIN);
    h.fetcher.set_cert(DOMAIN, cert_response(&new, 3600));
    h.fetcher.set_stapling(&new.fingerprint, StaplingReply::Absent);
    h.clock.advance(TimeDelta::seconds(61));
    h.client.refresh_due().await.unwrap();

    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(cached.fingerprint(), new.fingerprint);
    assert_eq!(cached.stapling, None);
    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.cert[0], new.der);
    assert_eq!(key.ocsp, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_a_stapling_of_another_certificate() {
    let fetcher = MockFetcher::new();
    let first = stapled_cert(DOMAIN);
    let second = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &first, 60, b"staple-first", TimeDelta::hours(24), 3600);
    fetcher.set_stapling(
        &second.fingerprint,
        StaplingReply::Found(stapling_response(
            b"staple-second",
            epoch() + TimeDelta::hours(24),
            3600,
        )),
    );
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate(DOMAIN).await.unwrap();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let client = h.client.clone();
            let first = first.der.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let key = client.get_certificate(DOMAIN).await.unwrap();
                    let expected: &[u8] = if key.cert[0] == first {
                        b"staple-first"
                    } else {
                        b"staple-second"
                    };
                    if let Some(ocsp) = &key.ocsp {
                        assert_eq!(ocsp.as_slice(), expected);
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    h.fetcher.set_cert(DOMAIN, cert_response(&second, 3600));
    h.clock.advance(TimeDelta::seconds(61));
    h.client.refresh_due().await.unwrap();

    for reader in readers {
        reader.await.unwrap();
    }
    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.cert[0], second.der);
    assert_eq!(key.ocsp.as_deref(), Some(&b"staple-second"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_misses_each_fetch() {
    let fetcher = MockFetcher::with_barrier(Arc::new(Barrier::new(2)));
    let cert = test_cert(DOMAIN, epoch() + TimeDelta::days(90), None);
    fetcher.set_cert(DOMAIN, cert_response(&cert, 3600));
    let h = harness(fetcher, Options::default()).await;

    let both = futures::future::join(
        h.client.get_certificate(DOMAIN),
        h.client.get_certificate(DOMAIN),
    );
    let (a, b) = tokio::time::timeout(Duration::from_secs(10), both)
        .await
        .expect("both misses reach the fetcher");
    assert_eq!(a.unwrap().cert[0], cert.der);
    assert_eq!(b.unwrap().cert[0], cert.der);
    assert_eq!(h.fetcher.cert_fetches(), 2);
}

#[tokio::test]
async fn preload_fills_the_cache_before_construction_returns() {
    let fetcher = MockFetcher::new();
    let cert = test_cert(DOMAIN, epoch() + TimeDelta::days(90), None);
    fetcher.set_cert(DOMAIN, cert_response(&cert, 3600));
    let options = Options {
        preload_domains: vec![DOMAIN.to_owned(), "missing.example.com".to_owned()],
        ..Options::default()
    };
    let h = harness(fetcher, options).await;

    assert!(h.client.cached(DOMAIN).is_some());
    assert!(h.client.cached("missing.example.com").is_none());
    assert_eq!(h.fetcher.cert_fetches(), 2);
}

#[tokio::test]
async fn expired_certificates_are_not_served() {
    let fetcher = MockFetcher::new();
    let cert = test_cert(DOMAIN, epoch() - TimeDelta::hours(1), None);
    fetcher.set_cert(DOMAIN, cert_response(&cert, 3600));
    let h = harness(fetcher, Options::default()).await;

    let err = h.client.get_certificate(DOMAIN).await.unwrap_err();
    assert!(matches!(err, ClientError::Expired(_)));
}

#[tokio::test]
async fn oversized_ttls_saturate_at_expiry() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, i64::MAX, b"staple", TimeDelta::hours(24), i64::MAX);
    let h = harness(fetcher, Options::default()).await;

    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.ocsp.as_deref(), Some(&b"staple"[..]));
    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(cached.cert_refresh_at, cert.not_after);
    assert_eq!(
        cached.stapling_refresh_at,
        Some(epoch() + TimeDelta::hours(24))
    );
}

#[tokio::test]
async fn oversized_ttls_on_refresh_keep_the_entry_alive() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 60, b"staple-1", TimeDelta::hours(24), 60);
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate(DOMAIN).await.unwrap();

    serve(&h.fetcher, DOMAIN, &cert, i64::MAX, b"staple-2", TimeDelta::hours(24), i64::MAX);
    h.clock.advance(TimeDelta::seconds(61));
    h.client.refresh_due().await.unwrap();

    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(cached.cert_refresh_at, cert.not_after);
    assert_eq!(cached.stapling.as_ref().unwrap().der, b"staple-2");
    h.client.refresh_due().await.unwrap();
    assert_eq!(h.fetcher.cert_fetches(), 2);
}

#[tokio::test]
async fn stapling_is_requested_with_the_server_assigned_fingerprint() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    let mut response = cert_response(&cert, 3600);
    response.fingerprint = "server-assigned".to_owned();
    fetcher.set_cert(DOMAIN, response);
    fetcher.set_stapling(
        "server-assigned",
        StaplingReply::Found(stapling_response(
            b"staple",
            epoch() + TimeDelta::hours(24),
            3600,
        )),
    );
    let h = harness(fetcher, Options::default()).await;

    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.ocsp.as_deref(), Some(&b"staple"[..]));
    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(cached.fingerprint(), "server-assigned");
    assert_eq!(cached.leaf.fingerprint, cert.fingerprint);
}

#[tokio::test]
async fn empty_server_fingerprint_falls_back_to_the_computed_one() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 3600, b"staple", TimeDelta::hours(24), 3600);
    let mut response = cert_response(&cert, 3600);
    response.fingerprint.clear();
    fetcher.set_cert(DOMAIN, response);
    let h = harness(fetcher, Options::default()).await;

    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.ocsp.as_deref(), Some(&b"staple"[..]));
    assert_eq!(h.client.cached(DOMAIN).unwrap().fingerprint(), cert.fingerprint);
}

#[tokio::test]
async fn renewed_certificate_keeps_its_stapling_when_the_stapling_refresh_fails() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 60, b"staple", TimeDelta::hours(1), 60);
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate(DOMAIN).await.unwrap();

    h.fetcher.set_cert(DOMAIN, cert_response(&cert, 3600));
    h.fetcher.fail_stapling(DOMAIN, true);
    h.clock.advance(TimeDelta::seconds(61));
    let err = h.client.refresh_due().await.unwrap_err();
    assert!(err.to_string().contains("stapling failure"), "{}", err);

    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(
        cached.cert_refresh_at,
        epoch() + TimeDelta::seconds(61 + 3600)
    );
    assert_eq!(cached.stapling.as_ref().unwrap().der, b"staple");
    assert_eq!(cached.certified.ocsp.as_deref(), Some(&b"staple"[..]));
    assert_eq!(h.fetcher.cert_fetches(), 2);
    assert_eq!(h.fetcher.stapling_fetches(), 2);
}

#[tokio::test]
async fn rotated_certificate_does_not_inherit_a_stapling_when_the_stapling_refresh_fails() {
    let fetcher = MockFetcher::new();
    let old = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &old, 60, b"staple-old", TimeDelta::hours(1), 60);
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate(DOMAIN).await.unwrap();

    let new = stapled_cert(DOMAIN);
    h.fetcher.set_cert(DOMAIN, cert_response(&new, 3600));
    h.fetcher.fail_stapling(DOMAIN, true);
    h.clock.advance(TimeDelta::seconds(61));
    assert!(h.client.refresh_due().await.is_err());

    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(cached.fingerprint(), new.fingerprint);
    assert_eq!(cached.stapling, None);
    let key = h.client.get_certificate(DOMAIN).await.unwrap();
    assert_eq!(key.cert[0], new.der);
    assert_eq!(key.ocsp, None);
}

#[tokio::test]
async fn renewed_certificate_drops_a_stapling_about_to_expire_when_its_refresh_fails() {
    let fetcher = MockFetcher::new();
    let cert = stapled_cert(DOMAIN);
    serve(&fetcher, DOMAIN, &cert, 60, b"staple", TimeDelta::seconds(200), 60);
    let h = harness(fetcher, Options::default()).await;
    h.client.get_certificate(DOMAIN).await.unwrap();

    h.fetcher.set_cert(DOMAIN, cert_response(&cert, 3600));
    h.fetcher.fail_stapling(DOMAIN, true);
    h.clock.advance(TimeDelta::seconds(100));
    assert!(h.client.refresh_due().await.is_err());

    let cached = h.client.cached(DOMAIN).unwrap();
    assert_eq!(
        cached.cert_refresh_at,
        epoch() + TimeDelta::seconds(100 + 3600)
    );
    assert_eq!(cached.stapling, None);
    assert_eq!(cached.certified.ocsp, None);
}
