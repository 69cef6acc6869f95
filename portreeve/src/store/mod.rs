//! Crash-safe persistence for the daemon's registry.
//!
//! The store owns the file layout under the config root and gives the rest
//! of the daemon value-level access to one [`StateDocument`]. Writes are
//! atomic (temp file + self-verification + rename) and checksummed;
//! reads verify and fall back through rotating backups before conceding an
//! empty state. External readers never observe a torn write.

pub mod document;
pub mod lockfile;
pub mod paths;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub use document::StateDocument;
pub use lockfile::FileLock;
pub use paths::{backup_stamp, default_config_root, StorePaths};

/// Newest state backups kept on disk.
pub const STATE_BACKUP_CAP: usize = 5;

/// The outcome of loading state from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedState {
    /// The document that was loaded (possibly empty).
    pub document: StateDocument,
    /// Where the document came from.
    pub source: LoadSource,
}

/// Provenance of a loaded state document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// The primary state file verified.
    Primary,
    /// The primary failed and this backup was promoted over it.
    Backup(PathBuf),
    /// Nothing existed on disk; a fresh daemon.
    Fresh,
    /// Primary and every backup failed verification; starting empty.
    Corrupt {
        /// What failed, for the one-time startup warning.
        details: String,
    },
}

/// Crash-safe, checksum-verified home for the daemon's state.
#[derive(Debug)]
pub struct StateStore {
    paths: StorePaths,
}

impl StateStore {
    /// Creates a store over `root`, creating the directory tree (`0700`)
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = StorePaths::new(root);
        paths::create_private_dir(paths.root())?;
        paths::create_private_dir(&paths.backups_dir())?;
        Ok(Self { paths })
    }

    /// The resolved layout this store writes into.
    #[must_use]
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Persists `document` atomically.
    ///
    /// Protocol: back up the current state file (rotating, newest
    /// [`STATE_BACKUP_CAP`] kept) → take the advisory lock → serialize and
    /// hash → write `*.tmp` twins → re-read and re-verify the temp file →
    /// rename state, then checksum. A crash between the two renames leaves
    /// a pair that fails verification and is healed by the next load's
    /// backup recovery.
    ///
    /// # Errors
    ///
    /// Returns an error when any step fails; the previous state file is
    /// left untouched in that case.
    pub fn save(&self, document: &StateDocument) -> Result<()> {
        self.backup_current_state()?;

        let _lock = FileLock::acquire(&self.paths.state())?;

        let mut stamped = document.clone();
        stamped.saved_at = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&stamped)?;
        let checksum = hex_sha256(&bytes);

        let state_tmp = self.paths.state().with_extension("state.tmp");
        let checksum_tmp = self.paths.state_checksum().with_extension("checksum.tmp");
        fs::write(&state_tmp, &bytes)?;
        fs::write(&checksum_tmp, checksum.as_bytes())?;
        paths::set_file_private(&state_tmp)?;
        paths::set_file_private(&checksum_tmp)?;

        // Self-verification: reread what actually hit the disk.
        let verify = fs::read(&state_tmp)?;
        let reparse_ok = StateDocument::parse(&verify).is_ok();
        if !reparse_ok || hex_sha256(&verify) != checksum {
            let _ = fs::remove_file(&state_tmp);
            let _ = fs::remove_file(&checksum_tmp);
            return Err(Error::Internal(
                "state self-verification failed; temp files discarded".into(),
            ));
        }

        fs::rename(&state_tmp, self.paths.state())?;
        fs::rename(&checksum_tmp, self.paths.state_checksum())?;
        Ok(())
    }

    /// Loads state, recovering from backups when the primary fails.
    ///
    /// Never fails on corruption: the worst outcome is an empty document
    /// with [`LoadSource::Corrupt`] so the daemon can surface its one-time
    /// warning.
    ///
    /// # Errors
    ///
    /// Only genuine I/O errors (e.g. an unreadable directory) surface.
    pub fn load(&self) -> Result<LoadedState> {
        if !self.paths.state().exists() {
            return Ok(LoadedState {
                document: StateDocument::empty(),
                source: LoadSource::Fresh,
            });
        }

        match self.verify_pair(&self.paths.state(), &self.paths.state_checksum()) {
            Ok(document) => Ok(LoadedState {
                document,
                source: LoadSource::Primary,
            }),
            Err(primary_failure) => self.recover_from_backups(&primary_failure),
        }
    }

    /// Walks backups newest-first; the first one that verifies is copied
    /// over the primary and returned.
    fn recover_from_backups(&self, primary_failure: &str) -> Result<LoadedState> {
        let mut backups = self.list_backups()?;
        backups.reverse(); // list_backups is oldest-first

        for backup in backups {
            let bytes = match fs::read(&backup) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            // Backups carry no sidecar checksum; structural validation is
            // the verification step.
            if let Ok(document) = StateDocument::parse(&bytes) {
                fs::copy(&backup, self.paths.state())?;
                fs::write(self.paths.state_checksum(), hex_sha256(&bytes).as_bytes())?;
                paths::set_file_private(&self.paths.state())?;
                paths::set_file_private(&self.paths.state_checksum())?;
                return Ok(LoadedState {
                    document,
                    source: LoadSource::Backup(backup),
                });
            }
        }

        Ok(LoadedState {
            document: StateDocument::empty(),
            source: LoadSource::Corrupt {
                details: primary_failure.to_string(),
            },
        })
    }

    /// Verifies a state/checksum pair: parse, structural checks, digest
    /// comparison.
    fn verify_pair(&self, state: &Path, checksum: &Path) -> std::result::Result<StateDocument, String> {
        let bytes = fs::read(state).map_err(|e| format!("cannot read state: {e}"))?;
        let document = StateDocument::parse(&bytes)?;

        let recorded = fs::read_to_string(checksum)
            .map_err(|e| format!("cannot read checksum: {e}"))?;
        if recorded.trim() != hex_sha256(&bytes) {
            return Err("checksum mismatch".to_string());
        }
        Ok(document)
    }

    /// Copies the current state file into the backup directory and prunes
    /// old backups past the cap. A missing state file is not an error.
    fn backup_current_state(&self) -> Result<()> {
        if !self.paths.state().exists() {
            return Ok(());
        }
        let stamp = backup_stamp(Utc::now());
        let backup = self.paths.backup_file(&stamp);
        fs::copy(self.paths.state(), &backup)?;
        paths::set_file_private(&backup)?;
        rotate_backups(&self.paths.backups_dir(), STATE_BACKUP_CAP)?;
        Ok(())
    }

    /// Backup files sorted oldest-first by modification time.
    fn list_backups(&self) -> Result<Vec<PathBuf>> {
        sorted_by_mtime(&self.paths.backups_dir())
    }
}

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Prunes a backup directory down to its newest `cap` files by mtime.
pub(crate) fn rotate_backups(dir: &Path, cap: usize) -> Result<()> {
    let files = sorted_by_mtime(dir)?;
    if files.len() <= cap {
        return Ok(());
    }
    for stale in &files[..files.len() - cap] {
        let _ = fs::remove_file(stale);
    }
    Ok(())
}

/// Regular files in `dir`, oldest-first by mtime (ties broken by name so
/// rotation is deterministic).
fn sorted_by_mtime(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            let modified = entry
                .metadata()?
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            entries.push((modified, path));
        }
    }
    entries.sort();
    Ok(entries.into_iter().map(|(_, path)| path).collect())
}
