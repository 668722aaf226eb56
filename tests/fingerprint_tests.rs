use recon_scan_rs::fingerprint::{fingerprint, http_client};
use recon_scan_rs::probes::banner_probe;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Accepts connections forever; reads whatever stimulus arrives, then
/// writes `payload` and closes.
async fn canned_listener(payload: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(payload).await;
            });
        }
    });
    addr
}

const SSH_BANNER: &[u8] = b"SSH-2.0-testserver\r\n";
const HTTP_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nserver: test-httpd\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

const TIMEOUT: Duration = Duration::from_millis(800);

#[tokio::test]
async fn banner_only_for_unconventional_port() {
    let addr = canned_listener(SSH_BANNER).await;
    let client = http_client(TIMEOUT);

    // The listener port is in neither probe set, mirroring e.g. port 22.
    let (result, annotations) = fingerprint(
        addr.ip(),
        addr.port(),
        "127.0.0.1",
        TIMEOUT,
        &[443],
        &[80],
        &client,
    )
    .await;

    assert!(result.reachable);
    assert!(result.banner.as_deref().unwrap().contains("SSH-2.0"));
    assert!(result.tls.is_none());
    assert!(result.http_headers.is_none());
    // Probes that were never applicable must not be annotated as failures.
    assert!(!annotations.iter().any(|a| a.operation == "tls_certificate"));
    assert!(!annotations.iter().any(|a| a.operation == "http_headers"));
}

#[tokio::test]
async fn tls_probe_attempted_on_tls_port() {
    let addr = canned_listener(SSH_BANNER).await;
    let client = http_client(TIMEOUT);

    let (result, annotations) = fingerprint(
        addr.ip(),
        addr.port(),
        "127.0.0.1",
        TIMEOUT,
        &[addr.port()],
        &[80],
        &client,
    )
    .await;

    // Handshake against a plaintext service fails: absence plus annotation
    // proves the attempt happened.
    assert!(result.tls.is_none());
    assert!(annotations.iter().any(|a| a.operation == "tls_certificate"));
    // The banner grab is independent and still succeeds.
    assert!(result.banner.is_some());
}

#[tokio::test]
async fn http_headers_collected_on_http_port() {
    let addr = canned_listener(HTTP_RESPONSE).await;
    let client = http_client(TIMEOUT);

    let (result, annotations) = fingerprint(
        addr.ip(),
        addr.port(),
        "127.0.0.1",
        TIMEOUT,
        &[443],
        &[addr.port()],
        &client,
    )
    .await;

    let headers = result.http_headers.expect("headers expected");
    assert_eq!(headers.get("server").map(String::as_str), Some("test-httpd"));
    assert!(!annotations.iter().any(|a| a.operation == "http_headers"));
    assert!(result.banner.is_some());
}

#[tokio::test]
async fn failed_http_probe_does_not_invalidate_banner() {
    // Non-HTTP service on a port configured as HTTP-typical.
    let addr = canned_listener(SSH_BANNER).await;
    let client = http_client(TIMEOUT);

    let (result, annotations) = fingerprint(
        addr.ip(),
        addr.port(),
        "127.0.0.1",
        TIMEOUT,
        &[443],
        &[addr.port()],
        &client,
    )
    .await;

    assert!(result.http_headers.is_none());
    assert!(annotations.iter().any(|a| a.operation == "http_headers"));
    assert!(
        result.banner.as_deref().unwrap().contains("SSH-2.0"),
        "banner must survive sibling probe failure"
    );
}

#[tokio::test]
async fn long_banner_is_capped_at_the_read_budget() {
    // A service that talks far more than the 1024-byte banner budget.
    static NOISY: [u8; 4096] = [b'A'; 4096];
    let addr = canned_listener(&NOISY).await;

    let banner = banner_probe(addr, TIMEOUT).await.expect("banner expected");
    assert!(
        banner.len() <= 1024,
        "banner grew past the read budget: {} bytes",
        banner.len()
    );
    assert!(banner.starts_with('A'));
}

#[tokio::test]
async fn non_utf8_banner_is_decoded_lossily() {
    const BINARY: &[u8] = b"\xff\xfeMySQL-5.7\x00\xfd";
    let addr = canned_listener(BINARY).await;

    // Binary payloads degrade to replacement characters, not to absence.
    let banner = banner_probe(addr, TIMEOUT)
        .await
        .expect("lossy banner expected");
    assert!(banner.contains("MySQL-5.7"));
    assert!(banner.contains('\u{FFFD}'));
}

#[tokio::test]
async fn silent_open_port_yields_absent_banner_with_annotation() {
    // Accepts but never writes anything back.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            // Hold the socket open without responding.
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(sock);
            });
        }
    });
    let client = http_client(TIMEOUT);

    let (result, annotations) = fingerprint(
        addr.ip(),
        addr.port(),
        "127.0.0.1",
        Duration::from_millis(300),
        &[443],
        &[80],
        &client,
    )
    .await;

    assert!(result.reachable);
    assert!(result.banner.is_none());
    assert!(annotations.iter().any(|a| a.operation == "banner_grab"));
}
