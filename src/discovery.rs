//! Bounded-concurrency TCP port discovery.

use crate::ports::PortRange;
use crate::probes::{self, ConnectOutcome};
use crate::types::Annotation;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Probe every port in `range` against `addr` and return the open ones in
/// ascending order, plus any discovery-level annotations.
///
/// A `Semaphore` keeps at most `concurrency` connection attempts in flight
/// so a wide range cannot exhaust local file descriptors. Non-open outcomes
/// (closed, filtered, errored) silently omit the port; only the degenerate
/// case where *every* probe errored produces a single aggregated annotation,
/// so an unreachable network yields one reason instead of thousands.
///
/// Cancellation stops admitting new probes and discards in-flight ones;
/// ports already confirmed open are kept. The caller is expected to have
/// validated `range` already.
pub async fn discover_open_ports(
    addr: IpAddr,
    range: &PortRange,
    probe_timeout: Duration,
    concurrency: usize,
    cancel: &CancellationToken,
) -> (Vec<u16>, Vec<Annotation>) {
    let sem = Arc::new(Semaphore::new(concurrency.clamp(1, 5_000)));
    let mut set: JoinSet<Option<(u16, ConnectOutcome)>> = JoinSet::new();

    for port in range.iter() {
        if cancel.is_cancelled() {
            break;
        }
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = sem.clone().acquire_owned() => permit.expect("semaphore in scope"),
        };
        let cancel = cancel.clone();
        let sock = SocketAddr::new(addr, port);

        set.spawn(async move {
            let _permit = permit; // keep permit until the probe completes

            tokio::select! {
                _ = cancel.cancelled() => None,
                outcome = probes::connect_probe(sock, probe_timeout) => Some((port, outcome)),
            }
        });
    }

    let mut open: Vec<u16> = Vec::new();
    let mut probed = 0u32;
    let mut errored = 0u32;
    let mut last_error: Option<String> = None;

    while let Some(res) = set.join_next().await {
        let Ok(Some((port, outcome))) = res else {
            continue; // cancelled in flight or join error: discard
        };
        probed += 1;
        match outcome {
            ConnectOutcome::Open => open.push(port),
            ConnectOutcome::Error(reason) => {
                errored += 1;
                last_error = Some(reason);
            }
            ConnectOutcome::Closed | ConnectOutcome::TimedOut => {}
        }
    }

    // Completion order is arbitrary; callers get a deterministic view.
    open.sort_unstable();

    debug!(
        host = %addr,
        range = %range,
        probed,
        open = open.len(),
        "port discovery finished"
    );

    let mut annotations = Vec::new();
    if let Some(annotation) = aggregate_connect_failures(probed, errored, last_error) {
        annotations.push(annotation);
    }
    (open, annotations)
}

/// One annotation for the all-probes-errored case, instead of one per port.
fn aggregate_connect_failures(
    probed: u32,
    errored: u32,
    last_error: Option<String>,
) -> Option<Annotation> {
    if probed == 0 || errored < probed {
        return None;
    }
    let reason = last_error.unwrap_or_else(|| "unknown error".into());
    Some(Annotation::probe(
        "port_discovery",
        format!("all {probed} connect probes failed: {reason}"),
    ))
}
