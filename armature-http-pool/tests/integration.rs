//! Integration tests for armature-http-pool

use armature_http_pool::*;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(config: ClientConfig) -> PooledHttpClient {
    PooledHttpClient::new(config).unwrap()
}

fn single_connection() -> ClientConfig {
    ClientConfig {
        pool: PoolConfig {
            max_per_route: 1,
            max_total: 1,
            ..PoolConfig::default()
        },
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn test_get_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"id":1}]"#))
        .mount(&server)
        .await;

    let client = client(ClientConfig::default());
    let body = assert_ok!(client.get(&format!("{}/users", server.uri())).await);
    assert_eq!(body, r#"[{"id":1}]"#);
}

#[tokio::test]
async fn test_post_json_sends_body_and_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(header("content-type", "application/json; charset=UTF-8"))
        .and(body_string(r#"{"item":"widget"}"#))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(ClientConfig::default());
    let body = client
        .post_json(&format!("{}/orders", server.uri()), r#"{"item":"widget"}"#)
        .await
        .unwrap();
    assert_eq!(body, "created");
}

#[tokio::test]
async fn test_error_status_carries_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such user"))
        .mount(&server)
        .await;

    let client = client(ClientConfig::default());
    let err = assert_err!(client.get(&format!("{}/users/9", server.uri())).await);
    assert_eq!(err.status_code(), Some(404));
    assert_eq!(err.body(), Some("no such user"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_response_decoded_with_request_charset() {
    let (gbk, _, _) = encoding_rs::GBK.encode("你好，世界");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(gbk.into_owned(), "text/plain"))
        .mount(&server)
        .await;

    let client = client(ClientConfig::default());
    let descriptor = RequestDescriptor::get(server.uri()).unwrap().charset("GBK");
    let response = client.execute(&descriptor).await.unwrap();
    assert_eq!(response.text(), "你好，世界");
}

#[tokio::test]
async fn test_duplicate_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client(ClientConfig::default());
    client
        .post_json_with_headers(
            &server.uri(),
            "{}",
            &[("X-Trace", "a"), ("X-Trace", "b"), ("X-Tenant", "acme")],
        )
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let traces: Vec<_> = requests[0].headers.get_all("x-trace").iter().collect();
    assert_eq!(traces, ["a", "b"]);
    assert_eq!(requests[0].headers["x-tenant"], "acme");
}

#[tokio::test]
async fn test_connection_reused_across_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let client = client(ClientConfig::default());
    client.get(&server.uri()).await.unwrap();
    client.get(&server.uri()).await.unwrap();

    let stats = client.stats().unwrap();
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.routes, 1);
}

#[tokio::test]
async fn test_single_connection_serializes_callers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let client = client(single_connection());
    let url = server.uri();
    let start = Instant::now();
    let (a, b) = tokio::join!(client.get(&url), client.get(&url));

    assert_eq!(a.unwrap(), "slow");
    assert_eq!(b.unwrap(), "slow");
    assert!(start.elapsed() >= Duration::from_millis(390));
}

#[tokio::test]
async fn test_waiting_caller_fails_when_connect_timeout_is_short() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let client = client(single_connection());
    let url = server.uri();
    let short = RequestTimeouts::new(-1, 50);
    let (a, b) = tokio::join!(client.execute_get(&url, short), client.execute_get(&url, short));

    assert!(a.is_ok());
    assert!(matches!(b, Err(HttpPoolError::PoolExhausted { .. })));
}

#[tokio::test]
async fn test_concurrent_load_respects_limits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(20)))
        .mount(&server)
        .await;

    let config = ClientConfig {
        pool: PoolConfig {
            max_per_route: 3,
            max_total: 3,
            ..PoolConfig::default()
        },
        ..ClientConfig::default()
    };
    let client = client(config);
    let url = server.uri();

    let calls = (0..16).map(|_| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let result = client.get(&url).await;
            let stats = client.stats().unwrap();
            assert!(stats.leased <= 3);
            result
        }
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    let stats = client.stats().unwrap();
    assert_eq!(stats.leased, 0);
    assert!(stats.idle <= 3);
    assert_eq!(stats.available, 3);
}

#[tokio::test]
async fn test_refused_connection_is_retryable() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client = client(ClientConfig {
        retry: RetryPolicy::fixed(2),
        ..ClientConfig::default()
    });
    let err = assert_err!(client.get(&format!("http://127.0.0.1:{port}/")).await);
    assert!(err.is_retryable());
    assert_eq!(client.stats().unwrap().leased, 0);
}

#[tokio::test]
async fn test_config_file_drives_client() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("configured"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("http-pool.toml");
    std::fs::write(
        &file,
        r#"
        release_connection_eagerly = true

        [pool]
        max_per_route = 2
        max_total = 4

        [retry]
        enabled = true
        max_attempts = 1
        "#,
    )
    .unwrap();

    let client = client(ClientConfig::from_file(&file).unwrap());
    assert_eq!(client.get(&server.uri()).await.unwrap(), "configured");

    let stats = client.stats().unwrap();
    assert_eq!(stats.max_total, 4);
    assert_eq!(stats.max_per_route, 2);
    assert_eq!(stats.idle, 0);
}

struct TestPki {
    ca_pem: String,
    leaf: CertificateDer<'static>,
    leaf_key: Vec<u8>,
}

fn mint_pki() -> TestPki {
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "armature test CA");
    let ca_key = KeyPair::generate().unwrap();
    let ca_pem = ca_params.self_signed(&ca_key).unwrap().pem();
    let issuer = Issuer::from_ca_cert_pem(&ca_pem, ca_key).unwrap();

    let leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let leaf_key = KeyPair::generate().unwrap();
    let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

    TestPki {
        ca_pem,
        leaf: leaf.der().clone(),
        leaf_key: leaf_key.serialize_der(),
    }
}

/// Minimal HTTPS endpoint answering every request with `secure`.
async fn spawn_tls_server(pki: &TestPki) -> SocketAddr {
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
        vec![pki.leaf.clone()],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pki.leaf_key.clone())),
    )
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match tls.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }
                let _ = tls
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 6\r\nconnection: close\r\n\r\nsecure")
                    .await;
                let _ = tls.shutdown().await;
            });
        }
    });
    addr
}

fn tls_config(pki: &TestPki, dir: &tempfile::TempDir, hosts: Option<&[&str]>) -> ClientConfig {
    let certs = dir.path().join("certs");
    std::fs::create_dir_all(&certs).unwrap();
    std::fs::write(certs.join("ca.pem"), &pki.ca_pem).unwrap();

    let mut config = ClientConfig::default();
    config.tls.trusted_certs_path = Some(certs);
    config.tls.trusted_store_password = Some("changeit".to_string());
    config.tls.trusted_hosts = hosts.map(|h| h.iter().map(|s| s.to_string()).collect());
    config
}

#[tokio::test]
async fn test_https_allow_listed_host() {
    let pki = mint_pki();
    let addr = spawn_tls_server(&pki).await;
    let dir = tempfile::tempdir().unwrap();

    let client = client(tls_config(&pki, &dir, Some(&["localhost"])));
    assert_eq!(
        client.tls_context().unwrap().hostname_verifier().mode(),
        VerificationMode::AllowList
    );

    let body = client
        .get(&format!("https://localhost:{}/", addr.port()))
        .await
        .unwrap();
    assert_eq!(body, "secure");
    // The server closed the connection, so nothing is pooled.
    assert_eq!(client.stats().unwrap().idle, 0);
}

#[tokio::test]
async fn test_https_host_outside_allow_list_is_rejected() {
    let pki = mint_pki();
    let addr = spawn_tls_server(&pki).await;
    let dir = tempfile::tempdir().unwrap();

    let client = client(tls_config(&pki, &dir, Some(&["api.example.com"])));
    let err = assert_err!(client.get(&format!("https://localhost:{}/", addr.port())).await);
    assert!(matches!(err, HttpPoolError::Tls(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_https_disabled_verification_accepts_any_host() {
    let pki = mint_pki();
    let addr = spawn_tls_server(&pki).await;
    let dir = tempfile::tempdir().unwrap();

    let client = client(tls_config(&pki, &dir, None));
    assert_eq!(
        client.tls_context().unwrap().hostname_verifier().mode(),
        VerificationMode::Disabled
    );

    // The certificate only names "localhost".
    let body = client
        .get(&format!("https://127.0.0.1:{}/", addr.port()))
        .await
        .unwrap();
    assert_eq!(body, "secure");
}

#[tokio::test]
async fn test_https_allow_list_rejects_name_not_listed() {
    let pki = mint_pki();
    let addr = spawn_tls_server(&pki).await;
    let dir = tempfile::tempdir().unwrap();

    let client = client(tls_config(&pki, &dir, Some(&["localhost"])));
    let err = assert_err!(client.get(&format!("https://127.0.0.1:{}/", addr.port())).await);
    assert!(matches!(err, HttpPoolError::Tls(_)));
}

#[tokio::test]
async fn test_https_untrusted_issuer_is_rejected() {
    let pki = mint_pki();
    let addr = spawn_tls_server(&pki).await;

    // Only the bundled public roots are trusted.
    let client = client(ClientConfig::default());
    let err = assert_err!(client.get(&format!("https://localhost:{}/", addr.port())).await);
    assert!(matches!(err, HttpPoolError::Tls(_)));
}
