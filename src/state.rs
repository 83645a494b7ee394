//! Persistent client state
//!
//! On-disk layout under the invoking user's home:
//! ```text
//! ~/.config/emrys/
//!   access_token                  (0600)
//!   projects/<project>/
//!     .data_sync_metadata         (JSON)
//!   <jid>-ssh-key-{user,miner}    (0600)
//! ~/.emrys/
//!   <jid>/                        (job workspace)
//! ```
//!
//! The miner runs as root through sudo. Everything written here is handed
//! back to `SUDO_USER` so the user can still read and remove it.

use crate::token::TokenError;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use nix::unistd::{chown, Uid, User};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Name of the per-project sync metadata file
pub const SYNC_METADATA_FILE: &str = ".data_sync_metadata";

/// Home directory of the user who invoked us, even under sudo.
pub fn home_dir() -> Result<PathBuf> {
    if let Some(user) = sudo_user() {
        return Ok(user.dir);
    }
    dirs::home_dir().context("Cannot determine home directory")
}

/// `~/.config/emrys`
pub fn config_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".config").join("emrys"))
}

/// `~/.emrys`, parent of every job workspace
pub fn jobs_root() -> Result<PathBuf> {
    Ok(home_dir()?.join(".emrys"))
}

/// Which side of a notebook job an ssh key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    User,
    Miner,
}

impl KeyRole {
    fn suffix(self) -> &'static str {
        match self {
            KeyRole::User => "user",
            KeyRole::Miner => "miner",
        }
    }
}

/// `<config>/<jid>-ssh-key-<role>`
pub fn ssh_key_path(config_dir: &Path, job_id: &str, role: KeyRole) -> PathBuf {
    config_dir.join(format!("{}-ssh-key-{}", job_id, role.suffix()))
}

/// The sudo-invoking user, when running as root under sudo
fn sudo_user() -> Option<User> {
    if !Uid::effective().is_root() {
        return None;
    }
    let name = std::env::var("SUDO_USER").ok()?;
    match User::from_name(&name) {
        Ok(user) => user,
        Err(e) => {
            warn!("Cannot look up SUDO_USER {}: {}", name, e);
            None
        }
    }
}

/// Hand a path back to the sudo-invoking user. No-op outside sudo.
pub fn restore_ownership(path: &Path) -> Result<()> {
    if let Some(user) = sudo_user() {
        chown(path, Some(user.uid), Some(user.gid))
            .with_context(|| format!("Failed to chown {}", path.display()))?;
    }
    Ok(())
}

/// Create a directory (and parents) with the given mode.
pub fn create_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to chmod {}", path.display()))?;
    restore_ownership(path)
}

/// Write a file readable only by its owner (0600), parent directory 0700.
pub fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_with_mode(parent, 0o700)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(contents)?;
    // mode() only applies on creation
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    restore_ownership(path)
}

/// Access token file
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `~/.config/emrys/access_token`
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(config_dir()?.join("access_token")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<String, TokenError> {
        let mut contents = String::new();
        match fs::File::open(&self.path) {
            Ok(mut f) => {
                f.read_to_string(&mut contents)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(TokenError::Missing),
            Err(e) => return Err(e.into()),
        }
        let token = contents.trim().to_string();
        if token.is_empty() {
            return Err(TokenError::Missing);
        }
        Ok(token)
    }

    pub fn save(&self, token: &str) -> Result<()> {
        write_private_file(&self.path, token.as_bytes())
    }
}

// ============================================================================
// Dataset sync metadata
// ============================================================================

/// Sync record for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSyncMeta {
    /// Modification time, nanoseconds since the epoch
    pub mtime_nanos: i64,
    /// base64 of the file's md5 digest
    pub md5: String,
}

/// `relative_path -> FileSyncMeta` for a dataset directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncMetadata {
    pub files: HashMap<String, FileSyncMeta>,
}

impl SyncMetadata {
    /// `<config>/projects/<project>/.data_sync_metadata`
    pub fn path_for(config_dir: &Path, project: &str) -> PathBuf {
        config_dir
            .join("projects")
            .join(project)
            .join(SYNC_METADATA_FILE)
    }

    /// Load stored metadata; a missing file is an empty mapping.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Corrupt sync metadata at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            create_dir_with_mode(parent, 0o755)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        restore_ownership(path)
    }

    /// Hash every regular file under `dir`. Files whose mtime matches
    /// `previous` reuse the stored digest instead of being re-read.
    pub fn compute(dir: &Path, previous: Option<&SyncMetadata>) -> Result<Self> {
        let mut files = HashMap::new();
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)?
                .to_string_lossy()
                .replace('\\', "/");
            let mtime_nanos = entry
                .metadata()?
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0);

            if let Some(prev) = previous.and_then(|p| p.files.get(&rel)) {
                if prev.mtime_nanos == mtime_nanos {
                    files.insert(rel, prev.clone());
                    continue;
                }
            }

            let md5 = md5_base64(entry.path())?;
            debug!("Hashed {} -> {}", rel, md5);
            files.insert(rel, FileSyncMeta { mtime_nanos, md5 });
        }
        Ok(Self { files })
    }

    /// Relative paths present locally whose content the remote lacks.
    pub fn diff(&self, remote: &SyncMetadata) -> Vec<String> {
        let mut changed: Vec<String> = self
            .files
            .iter()
            .filter(|(path, meta)| {
                remote
                    .files
                    .get(*path)
                    .map(|r| r.md5 != meta.md5)
                    .unwrap_or(true)
            })
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();
        changed
    }
}

fn md5_base64(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(STANDARD.encode(hasher.finalize()))
}
