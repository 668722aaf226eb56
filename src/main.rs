use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use recon_scan_rs::ports::PortRange;
use recon_scan_rs::scanner;
use recon_scan_rs::types::{ScanMode, ScanRequest, ScanResult, Target};

/// recon-scan-rs: single-target network reconnaissance covering TCP port
/// discovery, service fingerprinting, and identity lookups.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "recon-scan-rs",
    version,
    about = "Single-target network reconnaissance: port discovery, fingerprinting, identity lookups.",
    long_about = None
)]
struct Cli {
    /// Target IPv4/IPv6 address or domain name.
    target: String,

    /// Scan mode: "active" (open ports only) or "passive" (with fingerprinting).
    #[arg(long, default_value = "passive")]
    mode: String,

    /// Port range to scan, e.g. "1-1024" or a single port "443".
    #[arg(long, default_value = "1-1024")]
    ports: String,

    /// Per-probe timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 5000)]
    timeout_ms: u64,

    /// Overall scan deadline in milliseconds; expiry yields a partial result.
    #[arg(long = "deadline-ms", default_value_t = 120_000)]
    deadline_ms: u64,

    /// Max concurrent probes.
    #[arg(long, default_value_t = 256)]
    concurrency: usize,

    /// ipgeolocation.io API key; geolocation is skipped when omitted.
    #[arg(long = "geo-api-key")]
    geo_api_key: Option<String>,

    /// Write the result as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let target = Target::parse(&cli.target)?;
    let mode: ScanMode = cli.mode.parse()?;
    let range = PortRange::parse(&cli.ports)?;

    let mut request = ScanRequest::new(target)
        .with_mode(mode)
        .with_port_range(range)
        .with_probe_timeout(Duration::from_millis(cli.timeout_ms))
        .with_deadline(Duration::from_millis(cli.deadline_ms))
        .with_concurrency(cli.concurrency);
    if let Some(key) = cli.geo_api_key {
        request = request.with_geo_api_key(key);
    }

    println!("recon-scan-rs configuration:");
    println!("  target       : {}", request.target);
    println!("  mode         : {}", request.mode);
    println!("  ports        : {}", request.port_range);
    println!("  timeout_ms   : {}", cli.timeout_ms);
    println!("  deadline_ms  : {}", cli.deadline_ms);
    println!("  concurrency  : {}", request.concurrency);
    println!(
        "  geolocation  : {}",
        if request.geo_api_key.is_some() {
            "enabled"
        } else {
            "<no API key, skipped>"
        }
    );

    let result = scanner::run_scan(request).await?;
    print_result(&result);

    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_result_json(path, &result) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON result to {}", path.display());
        }
    }

    Ok(())
}

fn print_result(result: &ScanResult) {
    println!("\nScan of {} ({} mode)", result.target, result.mode);
    println!("  started  : {}", result.started_at);
    println!("  finished : {}", result.finished_at);

    println!("\nIdentity:");
    println!(
        "  reverse DNS : {}",
        result.identity.reverse_dns.as_deref().unwrap_or("<none>")
    );
    if result.identity.resolved_addresses.is_empty() {
        println!("  addresses   : <target was a literal address>");
    } else {
        let addrs: Vec<String> = result
            .identity
            .resolved_addresses
            .iter()
            .map(|a| a.to_string())
            .collect();
        println!("  addresses   : {}", addrs.join(", "));
    }
    match &result.identity.geolocation {
        Some(geo) => println!(
            "  geolocation : {} / {} / {} ({})",
            geo.country.as_deref().unwrap_or("?"),
            geo.region.as_deref().unwrap_or("?"),
            geo.city.as_deref().unwrap_or("?"),
            geo.isp.as_deref().unwrap_or("unknown ISP")
        ),
        None => println!("  geolocation : <none>"),
    }
    println!(
        "  whois       : {}",
        if result.identity.whois.is_some() {
            "<record captured, see JSON output>"
        } else {
            "<none>"
        }
    );

    println!(
        "\nOpen ports: {} (scanned: {})",
        result.open_count, result.ports_scanned
    );
    let mut banner_w = "banner".len();
    for entry in &result.ports {
        if let Some(b) = &entry.banner {
            banner_w = banner_w.max(b.len().min(48));
        }
    }
    let port_w = "port".len().max(5);
    println!(
        "{:>port_w$}  {:<banner_w$}  {:<9}  {}",
        "port", "banner", "tls", "http"
    );
    println!(
        "{:-<port_w$}  {:-<banner_w$}  {:-<9}  {:-<4}",
        "", "", "", ""
    );
    for entry in &result.ports {
        let mut banner = entry
            .banner
            .clone()
            .unwrap_or_default()
            .replace('\r', "\\r")
            .replace('\n', "\\n");
        if banner.len() > 48 {
            banner.truncate(48);
        }
        let tls = match &entry.tls {
            Some(cert) => {
                let mut s = cert.subject.clone();
                if s.len() > 9 {
                    s.truncate(9);
                }
                s
            }
            None => "-".into(),
        };
        let http = match &entry.http_headers {
            Some(h) => format!("{} hdrs", h.len()),
            None => "-".into(),
        };
        println!("{:>port_w$}  {:<banner_w$}  {:<9}  {}", entry.port, banner, tls, http);
    }

    if !result.annotations.is_empty() {
        println!("\nAnnotations ({}):", result.annotations.len());
        for ann in &result.annotations {
            println!("  [{:?}] {}: {}", ann.kind, ann.operation, ann.reason);
        }
    }
}

fn write_result_json(path: &std::path::Path, result: &ScanResult) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, result)?;
    Ok(())
}
