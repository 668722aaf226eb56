//! Per-port service fingerprinting policy.
//!
//! The port-to-protocol mapping here is a convention heuristic, not protocol
//! detection: a TLS probe runs on ports in the configured TLS set (443 by
//! default) and an HTTP header probe on ports in the HTTP set (80 by
//! default). A TLS service on an unconventional port will only show up
//! through its banner.

use crate::probes;
use crate::types::{Annotation, PortProbeResult};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Build the HTTP client shared by all header probes of one scan.
pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_default()
}

/// Run the applicable probes against one confirmed-open port.
///
/// The banner grab always runs; TLS and HTTP probes run when the port is in
/// the respective set. Sub-probes are independent: one failing never blocks
/// the others, and each failure becomes field absence plus one annotation.
pub async fn fingerprint(
    addr: IpAddr,
    port: u16,
    server_name: &str,
    probe_timeout: Duration,
    tls_ports: &[u16],
    http_ports: &[u16],
    http: &reqwest::Client,
) -> (PortProbeResult, Vec<Annotation>) {
    let sock = SocketAddr::new(addr, port);

    let banner_fut = probes::banner_probe(sock, probe_timeout);
    let tls_fut = async {
        if tls_ports.contains(&port) {
            Some(probes::tls_certificate_probe(sock, server_name, probe_timeout).await)
        } else {
            None
        }
    };
    let http_fut = async {
        if http_ports.contains(&port) {
            Some(probes::http_header_probe(http, sock, probe_timeout).await)
        } else {
            None
        }
    };
    let (banner, tls_attempt, http_attempt) = tokio::join!(banner_fut, tls_fut, http_fut);

    let mut annotations = Vec::new();
    if banner.is_none() {
        annotations.push(Annotation::probe(
            "banner_grab",
            format!("port {port}: no banner within timeout"),
        ));
    }
    let tls = match tls_attempt {
        Some(Some(cert)) => Some(cert),
        Some(None) => {
            annotations.push(Annotation::probe(
                "tls_certificate",
                format!("port {port}: TLS handshake failed or no peer certificate"),
            ));
            None
        }
        None => None,
    };
    let http_headers = match http_attempt {
        Some(Some(headers)) => Some(headers),
        Some(None) => {
            annotations.push(Annotation::probe(
                "http_headers",
                format!("port {port}: HTTP request failed"),
            ));
            None
        }
        None => None,
    };

    let result = PortProbeResult {
        port,
        reachable: true,
        banner,
        tls,
        http_headers,
    };
    (result, annotations)
}
