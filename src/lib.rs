//! skiff - SSH/SFTP terminal client core
//!
//! Manages saved remote-host credentials, opens authenticated transports,
//! and streams files and directory trees between the local filesystem and
//! a remote SFTP server through a concurrent, cancellable task pipeline.

pub mod config;
pub mod sftp;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
