//! Library crate for recon-scan-rs exposing reusable modules.
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod ports;
pub mod probes;
pub mod scanner;
pub mod types;
