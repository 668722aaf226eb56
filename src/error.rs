use thiserror::Error;

/// Fatal scan errors. Only these two kinds abort a scan: everything else is
/// recorded as an [`Annotation`](crate::types::Annotation) and the scan keeps
/// going with whatever it managed to collect.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The request itself is unusable (bad port range, malformed target,
    /// zero concurrency). Rejected before any I/O happens.
    #[error("invalid scan configuration: {0}")]
    Configuration(String),

    /// A domain target resolved to no usable address. Without an address
    /// there is nothing to probe.
    #[error("target resolution failed: {0}")]
    Resolution(String),
}
