//! Known-hosts store for SSH host key verification
//!
//! Reads and appends `~/.ssh/known_hosts` in standard OpenSSH syntax.
//! If the file cannot be read or parsed, the store enters a degraded mode
//! in which every key verifies as unknown and is accepted with a loud
//! warning; `SshConfig::strict_host_key_checking` refuses unknown hosts
//! and is the gate that disables that fallback.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Key differs from the known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// One known_hosts entry: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    /// host (or `[host]:port`) -> keys, possibly several types per host
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
    /// Set when the file could not be read/parsed; verification is then
    /// skipped entirely and every key reports Unknown.
    degraded: AtomicBool,
}

impl KnownHostsStore {
    /// Open the store at the default `~/.ssh/known_hosts` location
    pub fn open_default() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".known_hosts"));
        Self::with_path(path)
    }

    /// Open the store at a custom path (used by tests)
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
            degraded: AtomicBool::new(false),
        };

        if let Err(e) = store.load() {
            warn!(
                "Failed to load known_hosts from {:?}: {}. \
                 Host key verification DISABLED for this run - connections are \
                 vulnerable to man-in-the-middle attacks. Fix or remove the file, \
                 or enable strict_host_key_checking to refuse instead.",
                store.path, e
            );
            store.degraded.store(true, Ordering::Relaxed);
        }

        store
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            // First run: create an empty file with owner-only permissions
            self.create_empty()?;
            return Ok(());
        }

        let content = fs::read_to_string(&self.path).map_err(SshError::IoError)?;
        let mut hosts = self.hosts.write();
        let mut entries = 0usize;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias...] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return Err(SshError::ProtocolError(format!(
                    "malformed known_hosts line: {:?}",
                    line
                )));
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) are opaque; skip them
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entries += 1;
            }
        }

        debug!(
            "Loaded {} known host entries ({} unique hosts)",
            entries,
            hosts.len()
        );
        Ok(())
    }

    fn create_empty(&self) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(SshError::IoError)?;
        }

        let mut options = OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        match options.open(&self.path) {
            Ok(_) => {
                info!("Created empty known_hosts at {:?}", self.path);
                Ok(())
            }
            // Another connection attempt may have created it between our
            // exists() check and now
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(SshError::IoError(e)),
        }
    }

    /// Verify a host's public key against the store
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let fingerprint = fingerprint(key);

        if self.is_degraded() {
            return HostKeyVerification::Unknown { fingerprint };
        }

        let actual_b64 = BASE64.encode(key.public_key_bytes());
        let actual_type = key.algorithm().to_string();
        let hosts = self.hosts.read();

        // Exact `[host]:port` entry wins over a bare-host entry
        for lookup in [make_key(host, port), host.to_lowercase()] {
            let Some(entries) = hosts.get(&lookup) else {
                continue;
            };
            for entry in entries {
                if entry.key_type != actual_type {
                    continue;
                }
                if entry.key_data == actual_b64 {
                    return HostKeyVerification::Verified;
                }
                return HostKeyVerification::Changed {
                    expected_fingerprint: fingerprint_from_b64(&entry.key_data),
                    actual_fingerprint: fingerprint,
                };
            }
            // Host known, but no key of this type stored: treat as new
            debug!("Host {} known but no {} key stored", lookup, actual_type);
            return HostKeyVerification::Unknown { fingerprint };
        }

        HostKeyVerification::Unknown { fingerprint }
    }

    /// Add a host key to the cache and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup = make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().to_string();

        {
            let mut hosts = self.hosts.write();
            hosts.entry(lookup.clone()).or_default().push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64.clone(),
            });
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(SshError::IoError)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(SshError::IoError)?;
        writeln!(file, "{} {} {}", lookup, key_type, key_b64).map_err(SshError::IoError)?;

        info!("Added {} host key for {} to known_hosts", key_type, lookup);
        Ok(())
    }
}

/// `host` for port 22, `[host]:port` otherwise (OpenSSH convention)
fn make_key(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Strip brackets and port: `[host]:port` -> `host`
fn normalize_hostname(host: &str) -> String {
    let host = host.trim_start_matches('[');
    match host.find("]:") {
        Some(idx) => host[..idx].to_lowercase(),
        None => host.trim_end_matches(']').to_lowercase(),
    }
}

/// SHA256 fingerprint in OpenSSH presentation form
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    format!(
        "SHA256:{}",
        BASE64.encode(hasher.finalize()).trim_end_matches('=')
    )
}

fn fingerprint_from_b64(stored: &str) -> String {
    match BASE64.decode(stored) {
        Ok(bytes) => {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            format!(
                "SHA256:{}",
                BASE64.encode(hasher.finalize()).trim_end_matches('=')
            )
        }
        Err(_) => "unknown".to_string(),
    }
}

/// Process-wide store; guarded so concurrent first connections do not
/// double-create the file.
static KNOWN_HOSTS: std::sync::OnceLock<KnownHostsStore> = std::sync::OnceLock::new();

pub fn get_known_hosts() -> &'static KnownHostsStore {
    KNOWN_HOSTS.get_or_init(KnownHostsStore::open_default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("github.com"), "github.com");
        assert_eq!(normalize_hostname("[github.com]:22"), "github.com");
        assert_eq!(normalize_hostname("[srv.example.com]:2222"), "srv.example.com");
    }

    #[test]
    fn test_make_key() {
        assert_eq!(make_key("github.com", 22), "github.com");
        assert_eq!(make_key("Server.com", 2222), "[server.com]:2222");
    }

    #[test]
    fn test_creates_file_with_restricted_mode() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ssh").join("known_hosts");
        let store = KnownHostsStore::with_path(path.clone());

        assert!(!store.is_degraded());
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_malformed_file_degrades() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        fs::write(&path, "garbage-without-enough-fields\n").unwrap();

        let store = KnownHostsStore::with_path(path);
        assert!(store.is_degraded());
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        fs::write(&path, "# comment\n\nhost.example ssh-ed25519 AAAA\n").unwrap();

        let store = KnownHostsStore::with_path(path);
        assert!(!store.is_degraded());
    }
}
