//! SSH connection configuration

use serde::{Deserialize, Serialize};

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Strict host key checking
    /// - true: reject connections to unknown hosts
    /// - false: auto-accept unknown hosts, still reject changed keys
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication with in-memory key material
    /// (PEM/OpenSSH bytes, e.g. decrypted from the host store)
    Key {
        /// Private key content
        pem: Vec<u8>,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(pem: Vec<u8>, passphrase: Option<String>) -> Self {
        Self::Key { pem, passphrase }
    }

    /// Key material for engines that re-use the credential outside the
    /// transport (e.g. a temporary identity file for rsync)
    pub fn key_bytes(&self) -> Option<&[u8]> {
        match self {
            AuthMethod::Key { pem, .. } => Some(pem),
            AuthMethod::Password { .. } => None,
        }
    }
}

impl SshConfig {
    /// Validate host, port and username before dialing
    pub fn validate(&self) -> Result<(), super::error::SshError> {
        use super::error::SshError;

        if self.host.is_empty() {
            return Err(SshError::InvalidConfig("host is required".into()));
        }
        if self.port == 0 {
            return Err(SshError::InvalidConfig("invalid port number".into()));
        }
        if self.username.is_empty() {
            return Err(SshError::InvalidConfig("username is required".into()));
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::Password {
                password: String::new(),
            },
            timeout_secs: 30,
            strict_host_key_checking: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_host() {
        let config = SshConfig {
            username: "admin".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = SshConfig {
            host: "example.com".into(),
            port: 0,
            username: "admin".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_password_auth() {
        let config = SshConfig {
            host: "example.com".into(),
            username: "admin".into(),
            auth: AuthMethod::password("secret"),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
