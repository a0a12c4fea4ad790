//! Types shared by Tandem crates and the applications that embed them.
//!
//! [`SessionDescription`] and [`IceCandidate`] are what an application
//! carries over its own signaling transport. [`SessionConfig`] holds the
//! settings a coordinator applies to its data channels.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod protocol;

pub use config::{IceServer, SessionConfig};
pub use error::{Error, Result};
pub use protocol::{IceCandidate, SdpType, SessionDescription};

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to `info`.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Like [`init_tracing`] with a caller-chosen fallback directive. Only the
/// first call in a process installs a subscriber.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
