//! Path handling across the local/remote boundary
//!
//! Remote SFTP paths always use `/` regardless of either OS; local paths
//! use the platform separator. rsync on Windows (cygwin/msys builds) only
//! accepts forward-slash local paths, hence [`to_slash`].

use std::path::{Path, PathBuf};

/// Join local path components using the platform-native separator
pub fn join_local_path(base: &str, component: &str) -> String {
    let mut path = PathBuf::from(base);
    path.push(component);
    path.to_string_lossy().to_string()
}

/// Join remote SFTP path components using `/`
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Parent of a remote path (`/a/b/c` -> `/a/b`, `/a` -> `/`)
pub fn remote_parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

/// Last component of a remote path
pub fn remote_file_name(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

/// Parent of a local path as a string
pub fn local_parent(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Convert a path to forward-slash form (no-op on paths that already use `/`)
pub fn to_slash(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home", "f.txt"), "/home/f.txt");
        assert_eq!(join_remote_path("/home/", "f.txt"), "/home/f.txt");
        assert_eq!(join_remote_path("/", "home"), "/home");
    }

    #[test]
    fn test_remote_parent() {
        assert_eq!(remote_parent("/a/b/c"), "/a/b");
        assert_eq!(remote_parent("/a/b/"), "/a");
        assert_eq!(remote_parent("/a"), "/");
        assert_eq!(remote_parent("/"), "/");
    }

    #[test]
    fn test_remote_file_name() {
        assert_eq!(remote_file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(remote_file_name("/a/b/"), "b");
    }

    #[test]
    fn test_to_slash() {
        assert_eq!(to_slash("C:\\Users\\me\\key.pem"), "C:/Users/me/key.pem");
        assert_eq!(to_slash("/already/unix"), "/already/unix");
    }
}
