//! Atomic state persistence with backups and advisory file locking.
//!
//! Layout: the state file holds a single-line metadata header followed by
//! the pretty-printed state document. Saves go through a temp file in a
//! sibling `tmp/` directory, are fsynced, then renamed into place after the
//! previous file rotates into the backup chain. Every save and load runs
//! under an exclusive `fs2` lock on a sibling `.lock` file; an in-process
//! mutex serializes lock ownership inside the daemon.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use panemux_core::{SharedAppState, StateValidationError};

/// Current on-disk format version.
const FORMAT_VERSION: &str = "1.0";

/// Metadata header written before the state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMetadata {
    pub format_version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub checksum: String,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("state file not found: {0}")]
    NotFound(PathBuf),

    #[error("lock timeout for {path} after {timeout:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("state file corrupt at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("no usable backup for {0}")]
    NoUsableBackup(PathBuf),

    #[error("state validation failed: {0}")]
    Validation(#[from] StateValidationError),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Repository configuration.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub state_path: PathBuf,
    pub lock_timeout: Duration,
    pub backup_rotation: usize,
}

impl RepositoryConfig {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            lock_timeout: Duration::from_secs(30),
            backup_rotation: 5,
        }
    }
}

/// File-size / mtime / lock snapshot for the `status` surface.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryStats {
    pub state_path: PathBuf,
    pub backup_path: PathBuf,
    pub file_size: u64,
    pub mod_time: Option<DateTime<Utc>>,
    pub is_locked: bool,
}

/// The only component allowed to touch on-disk state.
pub struct FileRepository {
    state_path: PathBuf,
    lock_path: PathBuf,
    backup_path: PathBuf,
    temp_dir: PathBuf,
    lock_timeout: Duration,
    backup_rotation: usize,
    /// Serializes OS-lock ownership among in-process callers.
    op_mutex: Mutex<()>,
    busy: AtomicBool,
}

impl FileRepository {
    pub fn new(config: RepositoryConfig) -> Self {
        let dir = config
            .state_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = config
            .state_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".into());
        Self {
            lock_path: dir.join(format!("{file_name}.lock")),
            backup_path: dir.join(format!("{file_name}.backup")),
            temp_dir: dir.join("tmp"),
            state_path: config.state_path,
            lock_timeout: config.lock_timeout,
            backup_rotation: config.backup_rotation.max(1),
            op_mutex: Mutex::new(()),
            busy: AtomicBool::new(false),
        }
    }

    /// Create the data and temp directories.
    pub fn initialize(&self) -> Result<(), RepositoryError> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&self.temp_dir)?;
        Ok(())
    }

    /// Atomically persist `state`.
    pub fn save(&self, state: &SharedAppState) -> Result<(), RepositoryError> {
        let _serial = self.op_mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.busy.store(true, Ordering::SeqCst);
        let result = self.save_locked(state);
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    fn save_locked(&self, state: &SharedAppState) -> Result<(), RepositoryError> {
        let _lock = self.acquire_os_lock()?;

        fs::create_dir_all(&self.temp_dir)?;
        let temp_path = self.temp_dir.join(format!(
            "state_{}_{}.tmp",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));

        let state_bytes = serde_json::to_vec_pretty(state)?;
        let metadata = StateMetadata {
            format_version: FORMAT_VERSION.into(),
            timestamp: Utc::now(),
            checksum: format!("{:016x}", fnv1a64(&state_bytes)),
        };
        let header = serde_json::to_vec(&metadata)?;

        let write_result = (|| -> Result<(), RepositoryError> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&header)?;
            file.write_all(b"\n")?;
            file.write_all(&state_bytes)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            drop(file);

            self.backup_existing_file()?;
            fs::rename(&temp_path, &self.state_path)?;
            Ok(())
        })();

        if write_result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        write_result
    }

    /// Load the newest valid state, falling back through the backup chain.
    pub fn load(&self) -> Result<SharedAppState, RepositoryError> {
        let _serial = self.op_mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.busy.store(true, Ordering::SeqCst);
        let result = self.load_locked();
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    fn load_locked(&self) -> Result<SharedAppState, RepositoryError> {
        let _lock = self.acquire_os_lock()?;

        let data = match fs::read(&self.state_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound(self.state_path.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        match parse_document(&data) {
            Ok(state) => Ok(state),
            Err(reason) => {
                warn!(
                    path = %self.state_path.display(),
                    %reason,
                    "state file corrupt, trying backups"
                );
                self.load_from_backups()
            }
        }
    }

    fn load_from_backups(&self) -> Result<SharedAppState, RepositoryError> {
        for path in self.backup_chain() {
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(_) => continue,
            };
            match parse_document(&data) {
                Ok(state) => {
                    warn!(backup = %path.display(), "recovered state from backup");
                    return Ok(state);
                }
                Err(reason) => {
                    debug!(backup = %path.display(), %reason, "backup unusable");
                }
            }
        }
        Err(RepositoryError::NoUsableBackup(self.state_path.clone()))
    }

    /// Backup paths, newest first.
    fn backup_chain(&self) -> Vec<PathBuf> {
        let mut chain = vec![self.backup_path.clone()];
        for i in 1..=self.backup_rotation {
            chain.push(PathBuf::from(format!(
                "{}.{i}",
                self.backup_path.display()
            )));
        }
        chain
    }

    /// Repository statistics for the `status` control surface.
    pub fn stats(&self) -> RepositoryStats {
        let (file_size, mod_time) = match fs::metadata(&self.state_path) {
            Ok(meta) => (
                meta.len(),
                meta.modified().ok().map(DateTime::<Utc>::from),
            ),
            Err(_) => (0, None),
        };
        RepositoryStats {
            state_path: self.state_path.clone(),
            backup_path: self.backup_path.clone(),
            file_size,
            mod_time,
            is_locked: self.busy.load(Ordering::SeqCst),
        }
    }

    // ------------------------------------------------------------------
    // locking
    // ------------------------------------------------------------------

    fn acquire_os_lock(&self) -> Result<OsLock, RepositoryError> {
        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    if file.try_lock_exclusive().is_ok() {
                        return Ok(OsLock {
                            file: Some(file),
                            path: self.lock_path.clone(),
                        });
                    }
                    // Created the file but lost the flock race.
                    drop(file);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.remove_stale_lock()?;
                }
                Err(e) => return Err(e.into()),
            }

            if start.elapsed() >= self.lock_timeout {
                return Err(RepositoryError::LockTimeout {
                    path: self.lock_path.clone(),
                    timeout: self.lock_timeout,
                });
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Remove the lock file when its mtime is older than the lock timeout.
    fn remove_stale_lock(&self) -> Result<(), RepositoryError> {
        let meta = match fs::metadata(&self.lock_path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if age > self.lock_timeout {
            warn!(path = %self.lock_path.display(), ?age, "removing stale repository lock");
            match fs::remove_file(&self.lock_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // backups
    // ------------------------------------------------------------------

    fn backup_existing_file(&self) -> Result<(), RepositoryError> {
        if !self.state_path.exists() {
            return Ok(());
        }
        self.rotate_backups()?;
        fs::copy(&self.state_path, &self.backup_path)?;
        Ok(())
    }

    fn rotate_backups(&self) -> Result<(), RepositoryError> {
        for i in (1..self.backup_rotation).rev() {
            let older = PathBuf::from(format!("{}.{i}", self.backup_path.display()));
            let newer = PathBuf::from(format!("{}.{}", self.backup_path.display(), i + 1));
            if older.exists() {
                let _ = fs::remove_file(&newer);
                fs::rename(&older, &newer)?;
            }
        }
        if self.backup_path.exists() {
            fs::rename(
                &self.backup_path,
                PathBuf::from(format!("{}.1", self.backup_path.display())),
            )?;
        }
        Ok(())
    }
}

/// Guard holding the OS advisory lock; releases and removes on every exit.
struct OsLock {
    file: Option<File>,
    path: PathBuf,
}

impl Drop for OsLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
        let _ = fs::remove_file(&self.path);
    }
}

/// Parse a header+state document, verifying the header and the invariants.
fn parse_document(data: &[u8]) -> Result<SharedAppState, String> {
    let newline = data
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| "missing metadata header".to_string())?;
    let (header_bytes, rest) = data.split_at(newline);
    let state_bytes = strip_trailing_newline(&rest[1..]);

    let metadata: StateMetadata = serde_json::from_slice(header_bytes)
        .map_err(|e| format!("invalid metadata header: {e}"))?;
    if metadata.format_version.is_empty() {
        return Err("metadata missing format version".into());
    }
    if !metadata.checksum.is_empty() {
        let actual = format!("{:016x}", fnv1a64(state_bytes));
        if actual != metadata.checksum {
            return Err(format!(
                "checksum mismatch: header {} != computed {actual}",
                metadata.checksum
            ));
        }
    }

    let state: SharedAppState = serde_json::from_slice(state_bytes)
        .map_err(|e| format!("invalid state document: {e}"))?;
    state.validate().map_err(|e| e.to_string())?;
    Ok(state)
}

fn strip_trailing_newline(bytes: &[u8]) -> &[u8] {
    match bytes.last() {
        Some(b'\n') => &bytes[..bytes.len() - 1],
        _ => bytes,
    }
}

/// FNV-1a 64-bit digest used for the header checksum.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
