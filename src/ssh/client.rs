//! SSH transport factory built on russh
//!
//! `SshClient::connect` dials, verifies the host key, authenticates, and
//! returns a [`Transport`]: one authenticated connection from which
//! subsystem channels (SFTP) are multiplexed.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{Channel, Disconnect};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::known_hosts::{get_known_hosts, HostKeyVerification};

/// SSH transport factory
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect to the SSH server, verify its host key, and authenticate
    pub async fn connect(self) -> Result<Transport, SshError> {
        self.config.validate()?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler {
            host: self.config.host.clone(),
            port: self.config.port,
            strict: self.config.strict_host_key_checking,
        };

        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))??;

        debug!("SSH handshake completed");

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key { pem, passphrase } => {
                let pem = std::str::from_utf8(pem)
                    .map_err(|_| SshError::KeyError("key material is not valid UTF-8".into()))?;
                let key = russh::keys::decode_secret_key(pem, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;

                handle
                    .authenticate_publickey(
                        &self.config.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), None),
                    )
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);

        Ok(Transport {
            handle,
            config: self.config,
        })
    }
}

/// An authenticated SSH connection plus the parameters used to open it.
///
/// The connection parameters are retained because the external transfer
/// engine re-uses them to build its own ssh invocation.
pub struct Transport {
    handle: client::Handle<ClientHandler>,
    config: SshConfig,
}

impl Transport {
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Open a session channel with the given subsystem started on it
    pub async fn open_subsystem(&self, name: &str) -> Result<Channel<client::Msg>, SshError> {
        let channel = self.handle.channel_open_session().await?;
        channel
            .request_subsystem(true, name)
            .await
            .map_err(|e| SshError::ProtocolError(format!("{} subsystem: {}", name, e)))?;
        Ok(channel)
    }

    /// Gracefully close the connection
    pub async fn disconnect(&self) -> Result<(), SshError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

/// Client handler for russh callbacks: host key verification
struct ClientHandler {
    host: String,
    port: u16,
    strict: bool,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let known_hosts = get_known_hosts();

        match known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                if self.strict {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}), strict mode rejects",
                        self.host, self.port, fingerprint
                    );
                    return Err(SshError::HostKeyRejected(format!(
                        "unknown host {}:{} (fingerprint: {}); add it to known_hosts \
                         or disable strict host key checking",
                        self.host, self.port, fingerprint
                    )));
                }

                if known_hosts.is_degraded() {
                    warn!(
                        "known_hosts unusable; accepting key for {}:{} WITHOUT verification \
                         (fingerprint: {})",
                        self.host, self.port, fingerprint
                    );
                    return Ok(true);
                }

                info!(
                    "New host {}:{}, adding to known_hosts (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = known_hosts.add_host(&self.host, self.port, server_public_key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} has changed (expected {}, got {}); this could be a \
                     man-in-the-middle attack. Remove the old entry from known_hosts \
                     if the change is legitimate",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}
