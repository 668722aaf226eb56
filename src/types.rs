use crate::error::ScanError;
use crate::ports::PortRange;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// The subject of a scan: a literal address, or a domain name that must be
/// resolved to at least one address before any port-level probing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Target {
    Address(IpAddr),
    Domain(String),
}

impl Target {
    /// Parse a target string. An IP literal (v4 or v6) wins; anything else
    /// must look like a plausible DNS name.
    pub fn parse(s: &str) -> Result<Self, ScanError> {
        let s = s.trim();
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Target::Address(ip));
        }
        if is_valid_domain(s) {
            Ok(Target::Domain(s.to_ascii_lowercase()))
        } else {
            Err(ScanError::Configuration(format!(
                "malformed target: {s:?} is neither an IP address nor a domain name"
            )))
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Address(ip) => ip.fmt(f),
            Target::Domain(name) => name.fmt(f),
        }
    }
}

fn is_valid_domain(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Scan depth. Both modes discover open ports; `Passive` additionally
/// fingerprints each open port while `Active` reports reachability only.
/// (The naming is inherited from the tool this replaces and is admittedly
/// inverted from common usage.)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Active,
    Passive,
}

impl FromStr for ScanMode {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ScanMode::Active),
            "passive" => Ok(ScanMode::Passive),
            other => Err(ScanError::Configuration(format!(
                "unknown scan mode {other:?} (expected \"active\" or \"passive\")"
            ))),
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Active => f.write_str("active"),
            ScanMode::Passive => f.write_str("passive"),
        }
    }
}

/// Everything one scan invocation needs. Construct with [`ScanRequest::new`]
/// and adjust with the `with_*` setters; [`ScanRequest::validate`] runs
/// before any I/O.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub target: Target,
    pub mode: ScanMode,
    pub port_range: PortRange,
    /// Upper bound for each individual network operation.
    pub probe_timeout: Duration,
    /// Upper bound for the whole scan; expiry yields a best-effort result.
    pub deadline: Duration,
    /// Max simultaneous in-flight probes.
    pub concurrency: usize,
    /// Ports on which a TLS certificate probe is attempted (port-convention
    /// heuristic, not protocol detection).
    pub tls_ports: Vec<u16>,
    /// Ports on which an HTTP header probe is attempted.
    pub http_ports: Vec<u16>,
    /// Geolocation is skipped entirely when no API key is configured.
    pub geo_api_key: Option<String>,
}

impl ScanRequest {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            mode: ScanMode::Passive,
            port_range: PortRange::default(),
            probe_timeout: Duration::from_secs(5),
            deadline: Duration::from_secs(120),
            concurrency: 256,
            tls_ports: vec![443],
            http_ports: vec![80],
            geo_api_key: None,
        }
    }

    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_port_range(mut self, range: PortRange) -> Self {
        self.port_range = range;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_tls_ports(mut self, ports: Vec<u16>) -> Self {
        self.tls_ports = ports;
        self
    }

    pub fn with_http_ports(mut self, ports: Vec<u16>) -> Self {
        self.http_ports = ports;
        self
    }

    pub fn with_geo_api_key(mut self, key: impl Into<String>) -> Self {
        self.geo_api_key = Some(key.into());
        self
    }

    /// Fail fast on unusable configuration, before any socket is opened.
    pub fn validate(&self) -> Result<(), ScanError> {
        self.port_range.validate()?;
        if self.concurrency == 0 {
            return Err(ScanError::Configuration(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.probe_timeout.is_zero() || self.deadline.is_zero() {
            return Err(ScanError::Configuration(
                "probe timeout and deadline must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Peer certificate fields extracted during a TLS probe. Informational only:
/// the handshake verifies neither the chain nor the hostname.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
    pub sans: Vec<String>,
}

/// Outcome for one open port. Each optional field is independently
/// present/absent; absence means "not applicable or the probe failed",
/// never "not attempted but fine".
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortProbeResult {
    pub port: u16,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<CertificateInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_headers: Option<BTreeMap<String, String>>,
}

impl PortProbeResult {
    /// Reachability-only entry, used by `active` mode which skips
    /// fingerprinting.
    pub fn reachable(port: u16) -> Self {
        Self {
            port,
            reachable: true,
            banner: None,
            tls: None,
            http_headers: None,
        }
    }
}

/// Geolocation record for the target address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub isp: Option<String>,
}

/// Who the target is, independent of which ports are open.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct IdentityInfo {
    pub reverse_dns: Option<String>,
    pub geolocation: Option<GeoInfo>,
    /// Raw WHOIS record text from the authoritative server.
    pub whois: Option<String>,
    /// Forward DNS answers for domain targets; empty for bare-IP targets.
    pub resolved_addresses: Vec<IpAddr>,
}

/// Classification of a non-fatal failure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    /// A connect/read/handshake/HTTP probe failed.
    Probe,
    /// A probe or the whole scan ran out of time.
    Timeout,
    /// A collaborator (geolocation, WHOIS, DNS) failed.
    ExternalService,
}

/// One non-fatal failure, kept so the result explains every gap instead of
/// silently dropping data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub operation: String,
    pub kind: AnnotationKind,
    pub reason: String,
}

impl Annotation {
    pub fn probe(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            kind: AnnotationKind::Probe,
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            kind: AnnotationKind::Timeout,
            reason: reason.into(),
        }
    }

    pub fn external(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            kind: AnnotationKind::ExternalService,
            reason: reason.into(),
        }
    }
}

/// The aggregate outcome of one scan invocation. Closed ports never appear
/// in `ports`; `ports_scanned` records how many were probed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub target: String,
    pub mode: ScanMode,
    pub identity: IdentityInfo,
    /// One entry per open port, ascending by port number.
    pub ports: Vec<PortProbeResult>,
    pub ports_scanned: u32,
    pub open_count: u32,
    pub annotations: Vec<Annotation>,
    pub started_at: String,
    pub finished_at: String,
}
