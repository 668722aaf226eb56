//! Scan orchestrator.
//!
//! Drives one scan invocation through its stages: resolve the target,
//! discover open ports, fingerprint them (passive mode), gather identity
//! data, and assemble everything into one [`ScanResult`]. Identity gathering
//! runs concurrently with port work since neither depends on the other.
//!
//! Partial success is the default outcome model: only an unusable request or
//! an unresolvable domain aborts the scan. Everything else degrades to field
//! absence plus an annotation, and deadline expiry returns whatever was
//! collected so far.

use crate::discovery;
use crate::error::ScanError;
use crate::fingerprint;
use crate::identity::{self, GeoClient};
use crate::ports::PortRange;
use crate::types::{
    Annotation, IdentityInfo, PortProbeResult, ScanMode, ScanRequest, ScanResult, Target,
};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ::time::{format_description::well_known, OffsetDateTime};

/// Run one scan. The only fatal outcomes are a rejected configuration and a
/// domain that resolves to nothing; see the module docs for the rest.
pub async fn run_scan(request: ScanRequest) -> Result<ScanResult, ScanError> {
    run_scan_with_geo(request, GeoClient::new()).await
}

/// Variant that accepts a preconfigured [`GeoClient`], so callers (and
/// tests) can point geolocation at a different endpoint.
pub async fn run_scan_with_geo(
    request: ScanRequest,
    geo: GeoClient,
) -> Result<ScanResult, ScanError> {
    request.validate()?;
    let started_at = now_rfc3339();
    info!(host = %request.target, mode = %request.mode, range = %request.port_range, "scan starting");

    // The overall deadline is a cooperative cancellation signal: on expiry,
    // no new probes are admitted and in-flight ones are discarded. The
    // watchdog also exits once the token is cancelled, and the guard cancels
    // it whenever this function returns, so no timer outlives the scan.
    let cancel = CancellationToken::new();
    {
        let deadline = request.deadline;
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(deadline) => token.cancel(),
            }
        });
    }
    let _deadline_guard = cancel.clone().drop_guard();

    // Resolving: the only stage whose total failure fails the scan. The
    // deadline covers it like every other stage; expiry here yields an empty
    // best-effort result instead of blocking on a slow resolver.
    let (probe_addr, resolved_addresses) =
        match with_cancel(&cancel, resolve_target(&request.target)).await {
            Some(Ok(resolved)) => resolved,
            Some(Err(e)) => return Err(e),
            None => {
                return Ok(assemble(
                    &request.target,
                    request.mode,
                    &request.port_range,
                    IdentityInfo::default(),
                    Vec::new(),
                    vec![Annotation::timeout(
                        "resolution",
                        "scan deadline expired before target resolution completed",
                    )],
                    started_at,
                    now_rfc3339(),
                ));
            }
        };
    debug!(addr = %probe_addr, "probing address selected");

    let identity_fut = gather_identity(&request, probe_addr, resolved_addresses, &geo, &cancel);
    let ports_fut = scan_ports(&request, probe_addr, &cancel);
    let ((identity, identity_annotations), (ports, port_annotations)) =
        tokio::join!(identity_fut, ports_fut);

    let mut annotations = port_annotations;
    annotations.extend(identity_annotations);
    let finished_at = now_rfc3339();

    Ok(assemble(
        &request.target,
        request.mode,
        &request.port_range,
        identity,
        ports,
        annotations,
        started_at,
        finished_at,
    ))
}

/// Pin down the address to probe. For a domain target the full resolved
/// list is kept for the identity record and the first address is probed.
async fn resolve_target(target: &Target) -> Result<(IpAddr, Vec<IpAddr>), ScanError> {
    match target {
        Target::Address(ip) => Ok((*ip, Vec::new())),
        Target::Domain(name) => {
            let addresses = identity::forward_resolve(name)
                .await
                .map_err(|e| ScanError::Resolution(format!("{name}: {e:#}")))?;
            match addresses.first() {
                Some(first) => Ok((*first, addresses.clone())),
                None => Err(ScanError::Resolution(format!(
                    "{name}: no addresses resolved"
                ))),
            }
        }
    }
}

/// Reverse DNS, WHOIS, and geolocation, all concurrent and all non-fatal.
async fn gather_identity(
    request: &ScanRequest,
    addr: IpAddr,
    resolved_addresses: Vec<IpAddr>,
    geo: &GeoClient,
    cancel: &CancellationToken,
) -> (IdentityInfo, Vec<Annotation>) {
    let whois_query = match &request.target {
        Target::Domain(name) => name.clone(),
        Target::Address(ip) => ip.to_string(),
    };

    let (reverse, whois, geolocation) = tokio::join!(
        with_cancel(cancel, identity::reverse_resolve(addr)),
        with_cancel(
            cancel,
            identity::whois_lookup(&whois_query, request.probe_timeout)
        ),
        async {
            match &request.geo_api_key {
                Some(key) => Some(
                    with_cancel(cancel, geo.lookup(addr, key, request.probe_timeout)).await,
                ),
                // Opt-in collaborator: no key, no request, no annotation.
                None => None,
            }
        }
    );

    let mut info = IdentityInfo {
        resolved_addresses,
        ..IdentityInfo::default()
    };
    let mut annotations = Vec::new();

    match reverse {
        None => annotations.push(Annotation::timeout(
            "reverse_dns",
            "scan deadline expired before reverse DNS completed",
        )),
        Some(Ok(hostname)) => info.reverse_dns = hostname,
        Some(Err(e)) => annotations.push(Annotation::external("reverse_dns", format!("{e:#}"))),
    }
    match whois {
        None => annotations.push(Annotation::timeout(
            "whois",
            "scan deadline expired before WHOIS completed",
        )),
        Some(Ok(record)) => info.whois = Some(record),
        Some(Err(e)) => annotations.push(Annotation::external("whois", format!("{e:#}"))),
    }
    match geolocation {
        None => {}
        Some(None) => annotations.push(Annotation::timeout(
            "geolocation",
            "scan deadline expired before geolocation completed",
        )),
        Some(Some(Ok(geo))) => info.geolocation = Some(geo),
        Some(Some(Err(e))) => {
            annotations.push(Annotation::external("geolocation", format!("{e:#}")))
        }
    }

    (info, annotations)
}

/// Discover open ports and, in passive mode, fingerprint each of them under
/// the same concurrency bound.
async fn scan_ports(
    request: &ScanRequest,
    addr: IpAddr,
    cancel: &CancellationToken,
) -> (Vec<PortProbeResult>, Vec<Annotation>) {
    let (open_ports, mut annotations) = discovery::discover_open_ports(
        addr,
        &request.port_range,
        request.probe_timeout,
        request.concurrency,
        cancel,
    )
    .await;
    if cancel.is_cancelled() {
        annotations.push(Annotation::timeout(
            "port_discovery",
            "scan deadline expired during port discovery",
        ));
    }

    let mut entries: Vec<PortProbeResult> = Vec::with_capacity(open_ports.len());
    match request.mode {
        ScanMode::Active => {
            // Minimal footprint: reachability only, no follow-up probes.
            entries.extend(open_ports.iter().map(|&p| PortProbeResult::reachable(p)));
        }
        ScanMode::Passive => {
            let server_name = match &request.target {
                Target::Domain(name) => name.clone(),
                Target::Address(ip) => ip.to_string(),
            };
            let http = fingerprint::http_client(request.probe_timeout);
            let sem = Arc::new(Semaphore::new(request.concurrency.clamp(1, 5_000)));
            let mut set: JoinSet<Option<(PortProbeResult, Vec<Annotation>)>> = JoinSet::new();

            for &port in &open_ports {
                if cancel.is_cancelled() {
                    break;
                }
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = sem.clone().acquire_owned() => permit.expect("semaphore in scope"),
                };
                let cancel = cancel.clone();
                let server_name = server_name.clone();
                let http = http.clone();
                let tls_ports = request.tls_ports.clone();
                let http_ports = request.http_ports.clone();
                let probe_timeout = request.probe_timeout;

                set.spawn(async move {
                    let _permit = permit;

                    tokio::select! {
                        _ = cancel.cancelled() => None,
                        outcome = fingerprint::fingerprint(
                            addr,
                            port,
                            &server_name,
                            probe_timeout,
                            &tls_ports,
                            &http_ports,
                            &http,
                        ) => Some(outcome),
                    }
                });
            }

            while let Some(res) = set.join_next().await {
                if let Ok(Some((entry, mut probe_annotations))) = res {
                    entries.push(entry);
                    annotations.append(&mut probe_annotations);
                }
            }
            if cancel.is_cancelled() && entries.len() < open_ports.len() {
                annotations.push(Annotation::timeout(
                    "fingerprinting",
                    "scan deadline expired during fingerprinting",
                ));
            }
        }
    }

    (entries, annotations)
}

/// Pure assembly of the final record: same inputs, same output, with the
/// two timestamps being explicit inputs rather than hidden reads.
#[allow(clippy::too_many_arguments)]
fn assemble(
    target: &Target,
    mode: ScanMode,
    range: &PortRange,
    identity: IdentityInfo,
    mut ports: Vec<PortProbeResult>,
    annotations: Vec<Annotation>,
    started_at: String,
    finished_at: String,
) -> ScanResult {
    ports.sort_by_key(|entry| entry.port);
    let open_count = ports.len() as u32;
    ScanResult {
        target: target.to_string(),
        mode,
        identity,
        ports,
        ports_scanned: range.len(),
        open_count,
        annotations,
        started_at,
        finished_at,
    }
}

/// Run a future unless the scan deadline fires first.
async fn with_cancel<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        value = fut => Some(value),
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> (IdentityInfo, Vec<PortProbeResult>, Vec<Annotation>) {
        let identity = IdentityInfo {
            reverse_dns: Some("host.example.com".into()),
            ..IdentityInfo::default()
        };
        let ports = vec![
            PortProbeResult::reachable(80),
            PortProbeResult::reachable(22),
            PortProbeResult::reachable(443),
        ];
        let annotations = vec![Annotation::external("whois", "connection refused")];
        (identity, ports, annotations)
    }

    #[test]
    fn assembly_sorts_ports_ascending() {
        let (identity, ports, annotations) = sample_state();
        let result = assemble(
            &Target::Address("203.0.113.5".parse().unwrap()),
            ScanMode::Passive,
            &PortRange::new(1, 1024),
            identity,
            ports,
            annotations,
            "2026-01-01T00:00:00Z".into(),
            "2026-01-01T00:00:30Z".into(),
        );
        let port_order: Vec<u16> = result.ports.iter().map(|p| p.port).collect();
        assert_eq!(port_order, vec![22, 80, 443]);
        assert_eq!(result.open_count, 3);
        assert_eq!(result.ports_scanned, 1024);
    }

    #[test]
    fn assembly_is_idempotent() {
        let (identity, ports, annotations) = sample_state();
        let first = assemble(
            &Target::Domain("example.com".into()),
            ScanMode::Active,
            &PortRange::new(1, 100),
            identity.clone(),
            ports.clone(),
            annotations.clone(),
            "2026-01-01T00:00:00Z".into(),
            "2026-01-01T00:00:30Z".into(),
        );
        let second = assemble(
            &Target::Domain("example.com".into()),
            ScanMode::Active,
            &PortRange::new(1, 100),
            identity,
            ports,
            annotations,
            "2026-01-01T00:00:00Z".into(),
            "2026-01-01T00:00:30Z".into(),
        );
        assert_eq!(first, second);
    }
}
