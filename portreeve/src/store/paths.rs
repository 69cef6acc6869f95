//! On-disk layout of the daemon's config root.
//!
//! Everything the daemon persists lives under one directory (mode `0700`):
//!
//! ```text
//! ~/.portreeve/
//!   daemon.state              state document, mode 0600
//!   daemon.state.checksum     hex SHA-256 of the state bytes
//!   backups/                  daemon.state.backup.<ISO>, newest 5 kept
//!   daemon.pid                daemon PID, mode 0600
//!   config.json               user registry overrides + policy
//!   config-backups/           config-<ISO>.json, newest 10 kept
//!   auth.token                bearer token for the transport shell
//!   audit.log                 append-only JSON lines
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Resolves the daemon's config root.
///
/// `$PORTREEVE_HOME` wins when set; otherwise `~/.portreeve` under the
/// user's home directory.
///
/// # Errors
///
/// Returns an error when no home directory can be determined.
pub fn default_config_root() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("PORTREEVE_HOME") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    home::home_dir()
        .map(|home| home.join(".portreeve"))
        .ok_or_else(|| Error::InvalidInput {
            field: "home_directory".into(),
            message: "cannot determine home directory".into(),
        })
}

/// The resolved file layout under a config root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    /// Lays out paths under `root` without touching the filesystem.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The config root itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Primary state document.
    #[must_use]
    pub fn state(&self) -> PathBuf {
        self.root.join("daemon.state")
    }

    /// Companion checksum of the state document.
    #[must_use]
    pub fn state_checksum(&self) -> PathBuf {
        self.root.join("daemon.state.checksum")
    }

    /// Directory of rotating state backups.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// A timestamped backup file name inside [`Self::backups_dir`].
    #[must_use]
    pub fn backup_file(&self, stamp: &str) -> PathBuf {
        self.backups_dir().join(format!("daemon.state.backup.{stamp}"))
    }

    /// The daemon PID file.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    /// User configuration overrides.
    #[must_use]
    pub fn user_config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Directory of rotating user-config backups.
    #[must_use]
    pub fn config_backups_dir(&self) -> PathBuf {
        self.root.join("config-backups")
    }

    /// A timestamped config backup inside [`Self::config_backups_dir`].
    #[must_use]
    pub fn config_backup_file(&self, stamp: &str) -> PathBuf {
        self.config_backups_dir().join(format!("config-{stamp}.json"))
    }

    /// The bearer token consumed by the transport shell.
    #[must_use]
    pub fn auth_token(&self) -> PathBuf {
        self.root.join("auth.token")
    }

    /// Append-only audit log.
    #[must_use]
    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.log")
    }
}

/// Filesystem-stamp shape shared by state and config backups: an ISO-8601
/// UTC timestamp with colons dropped so the name is legal everywhere.
#[must_use]
pub fn backup_stamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// Creates a directory (and parents) with `0700` on Unix.
pub(crate) fn create_private_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    set_dir_mode(path)
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> Result<()> {
    Ok(())
}

/// Sets `0600` on a file on Unix; a no-op elsewhere.
pub(crate) fn set_file_private(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_layout_under_root() {
        let paths = StorePaths::new("/var/lib/portreeve");
        assert_eq!(paths.state(), PathBuf::from("/var/lib/portreeve/daemon.state"));
        assert_eq!(
            paths.state_checksum(),
            PathBuf::from("/var/lib/portreeve/daemon.state.checksum")
        );
        assert_eq!(paths.pid_file(), PathBuf::from("/var/lib/portreeve/daemon.pid"));
        assert_eq!(paths.user_config(), PathBuf::from("/var/lib/portreeve/config.json"));
        assert!(paths.backup_file("X").ends_with("backups/daemon.state.backup.X"));
        assert!(paths
            .config_backup_file("X")
            .ends_with("config-backups/config-X.json"));
    }

    #[test]
    fn test_backup_stamp_is_filename_safe() {
        let stamp = backup_stamp(chrono::Utc::now());
        assert!(!stamp.contains(':'));
        assert!(!stamp.contains('/'));
        assert!(stamp.ends_with('Z'));
    }

    #[test]
    fn test_backup_stamps_sort_chronologically() {
        let earlier = backup_stamp(chrono::Utc::now() - chrono::Duration::seconds(10));
        let later = backup_stamp(chrono::Utc::now());
        assert!(earlier < later);
    }

    #[test]
    #[serial]
    fn test_default_config_root_env_override() {
        let saved = std::env::var("PORTREEVE_HOME").ok();
        std::env::set_var("PORTREEVE_HOME", "/tmp/portreeve-test-root");
        assert_eq!(
            default_config_root().unwrap(),
            PathBuf::from("/tmp/portreeve-test-root")
        );
        match saved {
            Some(val) => std::env::set_var("PORTREEVE_HOME", val),
            None => std::env::remove_var("PORTREEVE_HOME"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_private_dir_and_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        create_private_dir(&nested).unwrap();
        let mode = std::fs::metadata(&nested).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        let file = nested.join("f");
        std::fs::write(&file, b"x").unwrap();
        set_file_private(&file).unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
