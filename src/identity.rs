//! Identity collaborators: geolocation, WHOIS, forward and reverse DNS.
//!
//! Everything here is non-fatal to a scan except forward resolution of a
//! domain target, which the orchestrator escalates when no address comes
//! back. Each function returns a plain `Result`; the orchestrator converts
//! failures into annotations.

use crate::types::GeoInfo;
use anyhow::{anyhow, Context, Result};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

const DEFAULT_GEO_ENDPOINT: &str = "https://api.ipgeolocation.io/ipgeo";
const IANA_WHOIS: &str = "whois.iana.org";
const WHOIS_PORT: u16 = 43;
/// Upper bound on bytes accepted from a WHOIS server; real records are a
/// few KiB, so a response hitting this cap is truncated rather than trusted.
const WHOIS_READ_BUDGET: u64 = 64 * 1024;

/// Client for the ipgeolocation.io HTTP API. The base URL is injectable so
/// tests can point it at a local stub.
#[derive(Debug, Clone)]
pub struct GeoClient {
    http: reqwest::Client,
    base_url: String,
}

impl GeoClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_GEO_ENDPOINT)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// One GET request; anything but a 2xx is a failure.
    pub async fn lookup(&self, ip: IpAddr, api_key: &str, timeout: Duration) -> Result<GeoInfo> {
        let resp = self
            .http
            .get(&self.base_url)
            .query(&[("apiKey", api_key), ("ip", &ip.to_string())])
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("geolocation request for {ip} failed"))?;
        if !resp.status().is_success() {
            return Err(anyhow!(
                "geolocation lookup for {ip} returned status {}",
                resp.status()
            ));
        }
        let body: GeoBody = resp
            .json()
            .await
            .context("geolocation response was not valid JSON")?;
        Ok(body.into())
    }
}

impl Default for GeoClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire shape of the ipgeolocation.io body. Coordinates arrive as strings.
#[derive(Debug, Deserialize)]
struct GeoBody {
    country_name: Option<String>,
    state_prov: Option<String>,
    city: Option<String>,
    latitude: Option<String>,
    longitude: Option<String>,
    isp: Option<String>,
}

impl From<GeoBody> for GeoInfo {
    fn from(body: GeoBody) -> Self {
        GeoInfo {
            country: body.country_name,
            region: body.state_prov,
            city: body.city,
            latitude: body.latitude.and_then(|s| s.parse().ok()),
            longitude: body.longitude.and_then(|s| s.parse().ok()),
            isp: body.isp,
        }
    }
}

/// Raw WHOIS over TCP port 43: query IANA first, then follow a single
/// `refer:` redirect to the authoritative server.
pub async fn whois_lookup(query: &str, timeout: Duration) -> Result<String> {
    let first = whois_query(IANA_WHOIS, WHOIS_PORT, query, timeout).await?;
    if let Some(referral) = parse_referral(&first) {
        if referral != IANA_WHOIS {
            debug!(server = %referral, "following WHOIS referral");
            if let Ok(resp) = whois_query(&referral, WHOIS_PORT, query, timeout).await {
                return Ok(resp);
            }
        }
    }
    Ok(first)
}

async fn whois_query(server: &str, port: u16, query: &str, timeout: Duration) -> Result<String> {
    let fut = async {
        let mut stream = TcpStream::connect((server, port)).await?;
        stream.write_all(query.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        let mut buf = Vec::new();
        (&mut stream).take(WHOIS_READ_BUDGET).read_to_end(&mut buf).await?;
        Ok::<_, anyhow::Error>(String::from_utf8_lossy(&buf).into_owned())
    };
    time::timeout(timeout, fut)
        .await
        .map_err(|_| anyhow!("WHOIS query to {server} timed out"))?
        .with_context(|| format!("WHOIS query to {server} failed"))
}

/// Extract the referred server from a `refer:` (or legacy `whois:`) line.
fn parse_referral(response: &str) -> Option<String> {
    for line in response.lines() {
        let line = line.trim();
        for prefix in ["refer:", "whois:"] {
            if let Some(rest) = line.strip_prefix(prefix) {
                let server = rest.trim();
                if !server.is_empty() {
                    return Some(server.to_string());
                }
            }
        }
    }
    None
}

/// Forward-resolve a domain. An NXDOMAIN answer is an empty list, not an
/// error: "this name has no addresses" is data.
pub async fn forward_resolve(domain: &str) -> Result<Vec<IpAddr>> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .context("failed to build DNS resolver from system configuration")?;
    match resolver.lookup_ip(domain).await {
        Ok(lookup) => Ok(lookup.iter().collect()),
        Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("forward DNS lookup for {domain} failed")),
    }
}

/// Reverse-resolve an address to its PTR hostname. A missing PTR record is
/// absence, not an error.
pub async fn reverse_resolve(ip: IpAddr) -> Result<Option<String>> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .context("failed to build DNS resolver from system configuration")?;
    match resolver.reverse_lookup(ip).await {
        Ok(ptr) => Ok(ptr
            .iter()
            .next()
            .map(|name| name.to_string().trim_end_matches('.').to_string())),
        Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reverse DNS lookup for {ip} failed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn referral_parsing() {
        let resp = "% IANA WHOIS server\nrefer:        whois.ripe.net\ndomain: EXAMPLE\n";
        assert_eq!(parse_referral(resp).as_deref(), Some("whois.ripe.net"));
        assert_eq!(parse_referral("no referral here\n"), None);
        assert_eq!(parse_referral("refer:   \n"), None);
    }

    #[test]
    fn geo_body_mapping_parses_coordinates() {
        let body: GeoBody = serde_json::from_str(
            r#"{
                "country_name": "Sweden",
                "state_prov": "Stockholm",
                "city": "Stockholm",
                "latitude": "59.3293",
                "longitude": "18.0686",
                "isp": "Example ISP"
            }"#,
        )
        .unwrap();
        let geo: GeoInfo = body.into();
        assert_eq!(geo.country.as_deref(), Some("Sweden"));
        assert_eq!(geo.latitude, Some(59.3293));
        assert_eq!(geo.longitude, Some(18.0686));
        assert_eq!(geo.isp.as_deref(), Some("Example ISP"));
    }

    #[test]
    fn geo_body_tolerates_missing_and_bad_fields() {
        let body: GeoBody =
            serde_json::from_str(r#"{"country_name": "Sweden", "latitude": "n/a"}"#).unwrap();
        let geo: GeoInfo = body.into();
        assert_eq!(geo.country.as_deref(), Some("Sweden"));
        assert_eq!(geo.latitude, None);
        assert_eq!(geo.city, None);
    }

    #[tokio::test]
    async fn whois_query_caps_oversized_responses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut line = [0u8; 256];
            let _ = sock.read(&mut line).await;
            // Twice the budget; the client must stop reading at the cap.
            let payload = vec![b'x'; WHOIS_READ_BUDGET as usize * 2];
            let _ = sock.write_all(&payload).await;
        });

        let record = whois_query(
            &addr.ip().to_string(),
            addr.port(),
            "example.com",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(record.len() as u64, WHOIS_READ_BUDGET);
    }

    #[tokio::test]
    async fn geo_client_parses_stub_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = sock.read(&mut buf).await;
            let body = r#"{"country_name":"Sweden","state_prov":"Stockholm","city":"Stockholm","latitude":"59.33","longitude":"18.07","isp":"Example ISP"}"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = sock.write_all(resp.as_bytes()).await;
        });

        let client = GeoClient::with_base_url(format!("http://{addr}/ipgeo"));
        let geo = client
            .lookup("203.0.113.5".parse().unwrap(), "key", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(geo.country.as_deref(), Some("Sweden"));
        assert_eq!(geo.latitude, Some(59.33));
    }

    #[tokio::test]
    async fn geo_client_non_2xx_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        });

        let client = GeoClient::with_base_url(format!("http://{addr}/ipgeo"));
        let err = client
            .lookup("203.0.113.5".parse().unwrap(), "bad-key", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
