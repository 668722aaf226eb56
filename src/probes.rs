//! Atomic single-port probe primitives.
//!
//! Every probe here is a pure function of (address, port, timeout) and never
//! returns an error to its caller: failures collapse to a classification or
//! to absence, and the caller decides what to annotate.

use crate::types::CertificateInfo;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use x509_parser::prelude::*;
use x509_parser::time::ASN1Time;
use ::time::format_description::well_known::Rfc3339;

/// Maximum bytes read during a banner grab.
const BANNER_BUDGET: usize = 1024;

/// Classification of a single TCP connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Open,
    Closed,
    TimedOut,
    Error(String),
}

/// Attempt a TCP connection. The socket is dropped immediately on every
/// path; success only asserts that the port accepted a connection.
pub async fn connect_probe(addr: SocketAddr, timeout: Duration) -> ConnectOutcome {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Err(_) => ConnectOutcome::TimedOut,
        Ok(Ok(stream)) => {
            drop(stream);
            ConnectOutcome::Open
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => ConnectOutcome::Closed,
        Ok(Err(e)) => ConnectOutcome::Error(e.to_string()),
    }
}

/// Connect, send a minimal HTTP request line as a stimulus, and read up to
/// [`BANNER_BUDGET`] bytes. Non-UTF8 payloads are decoded lossily rather
/// than treated as failures; an empty or unreadable response is `None`.
pub async fn banner_probe(addr: SocketAddr, timeout: Duration) -> Option<String> {
    let fut = async {
        let mut stream = TcpStream::connect(addr).await.ok()?;
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.ok()?;
        let mut buf = vec![0u8; BANNER_BUDGET];
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.truncate(n);
        let text = String::from_utf8_lossy(&buf).trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    };
    time::timeout(timeout, fut).await.ok().flatten()
}

/// TLS handshake with peer certificate retrieval. Verification is disabled:
/// the certificate is collected as a fingerprint, not trusted. Any handshake
/// failure (including a non-TLS service on the port) yields `None`.
pub async fn tls_certificate_probe(
    addr: SocketAddr,
    server_name: &str,
    timeout: Duration,
) -> Option<CertificateInfo> {
    let fut = async {
        let tcp = TcpStream::connect(addr).await.ok()?;
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .ok()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = connector.connect(server_name, tcp).await.ok()?;
        let cert = tls.get_ref().peer_certificate().ok()??;
        let der = cert.to_der().ok()?;
        parse_certificate(&der)
    };
    time::timeout(timeout, fut).await.ok().flatten()
}

/// Plain HTTP GET against the address; returns the response headers for any
/// status (a 500's headers still identify the server). `None` on transport
/// failure.
pub async fn http_header_probe(
    client: &reqwest::Client,
    addr: SocketAddr,
    timeout: Duration,
) -> Option<BTreeMap<String, String>> {
    let url = format!("http://{addr}/");
    let resp = client.get(&url).timeout(timeout).send().await.ok()?;
    let mut headers = BTreeMap::new();
    for (name, value) in resp.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_string(), v.to_string());
        }
    }
    Some(headers)
}

/// Extract the fields we report from a DER-encoded peer certificate.
fn parse_certificate(der: &[u8]) -> Option<CertificateInfo> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let validity = cert.validity();
    let mut sans = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns) => sans.push(dns.to_string()),
                    GeneralName::IPAddress(ip) => {
                        if let Some(s) = san_ip_to_string(ip) {
                            sans.push(s);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    Some(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: format_asn1_time(&validity.not_before),
        not_after: format_asn1_time(&validity.not_after),
        sans,
    })
}

fn san_ip_to_string(raw: &[u8]) -> Option<String> {
    match raw.len() {
        4 => {
            let arr: [u8; 4] = raw.try_into().ok()?;
            Some(std::net::IpAddr::from(arr).to_string())
        }
        16 => {
            let arr: [u8; 16] = raw.try_into().ok()?;
            Some(std::net::IpAddr::from(arr).to_string())
        }
        _ => None,
    }
}

fn format_asn1_time(t: &ASN1Time) -> String {
    let dt = t.to_datetime();
    dt.format(&Rfc3339).unwrap_or_else(|_| dt.to_string())
}
