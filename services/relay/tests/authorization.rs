
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harness::{expect_closed, relay_config, wait_until, RelayHandle, TestBackend, TEST_TIMEOUT};
use portfwd_relay::{Authorizer, CredentialCheck, Credentials};
use rstest::rstest;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const GOOD_REQUEST: &[u8] = b"GET /?uname=admin&upass=test1234 HTTP/1.1\r\nHost: relay\r\n\r\n";

/// Counts invocations and answers with a fixed verdict.
struct CountingAuthorizer {
    calls: AtomicU64,
    verdict: bool,
}

impl CountingAuthorizer {
    fn new(verdict: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU64::new(0),
            verdict,
        })
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authorizer for CountingAuthorizer {
    async fn authorize(
        &self,
        _client: &mut (dyn AsyncRead + Unpin + Send),
        _peer_addr: SocketAddr,
    ) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict
    }
}

fn credential_check() -> Arc<CredentialCheck> {
    Arc::new(
        CredentialCheck::new(Credentials::new("admin", "test1234"))
            .with_read_timeout(Duration::from_millis(500)),
    )
}

#[tokio::test]
async fn valid_credentials_open_pair() {
    let backend = TestBackend::spawn_echo().await.unwrap();
    let mut config = relay_config("auth-ok", backend.addr);
    config.authentication = true;
    let relay = RelayHandle::spawn_with(config, credential_check())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(relay.listen_addr).await.unwrap();
    stream.write_all(GOOD_REQUEST).await.unwrap();
    wait_until("pair registered", || relay.pairs_active() == 1).await;

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn credential_bytes_are_not_relayed() {
    let backend = TestBackend::spawn_sink().await.unwrap();
    let mut config = relay_config("auth-consume", backend.addr);
    config.authentication = true;
    let relay = RelayHandle::spawn_with(config, credential_check())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(relay.listen_addr).await.unwrap();
    stream.write_all(GOOD_REQUEST).await.unwrap();
    wait_until("pair registered", || relay.pairs_active() == 1).await;

    stream.write_all(b"after auth").await.unwrap();
    stream.shutdown().await.unwrap();

    timeout(TEST_TIMEOUT, async {
        while backend.finished().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("backend never saw EOF");

    assert_eq!(backend.finished().await, vec![b"after auth".to_vec()]);
}

#[rstest]
#[case::wrong_password(b"GET /?uname=admin&upass=nope HTTP/1.1\r\n\r\n")]
#[case::wrong_user(b"GET /?uname=guest&upass=test1234 HTTP/1.1\r\n\r\n")]
#[case::no_fields(b"GET /index.html HTTP/1.1\r\n\r\n")]
#[case::not_http(b"\x16\x03\x01\x00\xa5\x01\x00")]
#[tokio::test]
async fn invalid_credentials_close_client_without_backend(#[case] request: &'static [u8]) {
    let backend = TestBackend::spawn_echo().await.unwrap();
    let mut config = relay_config("auth-bad", backend.addr);
    config.authentication = true;
    let relay = RelayHandle::spawn_with(config, credential_check())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(relay.listen_addr).await.unwrap();
    stream.write_all(request).await.unwrap();

    expect_closed(&mut stream).await;
    wait_until("rejection recorded", || {
        relay.counter(|s| &s.connections_unauthorized) == 1
    })
    .await;

    assert_eq!(backend.connection_count(), 0);
    assert_eq!(relay.counter(|s| &s.pairs_opened), 0);
    assert_eq!(relay.pairs_active(), 0);
}

#[tokio::test]
async fn silent_client_is_rejected_after_read_timeout() {
    let backend = TestBackend::spawn_echo().await.unwrap();
    let mut config = relay_config("auth-silent", backend.addr);
    config.authentication = true;
    let relay = RelayHandle::spawn_with(config, credential_check())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(relay.listen_addr).await.unwrap();
    expect_closed(&mut stream).await;

    assert_eq!(relay.counter(|s| &s.connections_unauthorized), 1);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn disabled_authentication_never_consults_authorizer() {
    let backend = TestBackend::spawn_echo().await.unwrap();
    let authorizer = CountingAuthorizer::new(false);
    let config = relay_config("auth-off", backend.addr);
    assert!(!config.authentication);
    let relay = RelayHandle::spawn_with(config, authorizer.clone())
        .await
        .unwrap();

    for _ in 0..3 {
        let mut stream = TcpStream::connect(relay.listen_addr).await.unwrap();
        stream.write_all(b"open").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&buf, b"open");
    }

    assert_eq!(authorizer.calls(), 0);
    assert_eq!(relay.counter(|s| &s.pairs_opened), 3);
}

#[tokio::test]
async fn enabled_authentication_consults_authorizer_once_per_client() {
    let backend = TestBackend::spawn_echo().await.unwrap();
    let authorizer = CountingAuthorizer::new(false);
    let mut config = relay_config("auth-on", backend.addr);
    config.authentication = true;
    let relay = RelayHandle::spawn_with(config, authorizer.clone())
        .await
        .unwrap();

    for _ in 0..2 {
        let mut stream = TcpStream::connect(relay.listen_addr).await.unwrap();
        expect_closed(&mut stream).await;
    }

    wait_until("both rejections recorded", || authorizer.calls() == 2).await;
    assert_eq!(relay.counter(|s| &s.connections_unauthorized), 2);
    assert_eq!(backend.connection_count(), 0);
}
