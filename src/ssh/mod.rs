//! SSH transport layer
//!
//! Opens authenticated channels to remote hosts and layers SFTP on top.

pub mod client;
pub mod config;
pub mod error;
pub mod known_hosts;

pub use client::{SshClient, Transport};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use known_hosts::{get_known_hosts, HostKeyVerification, KnownHostsStore};
