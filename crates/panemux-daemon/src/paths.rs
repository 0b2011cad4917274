//! Filesystem layout for the daemon's runtime artifacts.
//!
//! Everything lives under a per-user base directory:
//! `$XDG_RUNTIME_DIR/panemux` or `/tmp/panemux-<uid>` as fallback, with
//! `state/` and `logs/` beneath it.

use std::path::{Path, PathBuf};

const APP_NAME: &str = "panemux";

/// Resolved path set for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub base_dir: PathBuf,
    pub socket: PathBuf,
    pub process_lock: PathBuf,
    pub state_file: PathBuf,
    pub log_file: PathBuf,
}

/// Per-user base directory.
///
/// `$XDG_RUNTIME_DIR/panemux`, falling back to `/tmp/panemux-<uid>`.
pub fn base_dir() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        if !xdg_runtime.is_empty() {
            return PathBuf::from(xdg_runtime).join(APP_NAME);
        }
    }
    // SAFETY: getuid() is always safe to call
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{APP_NAME}-{uid}"))
}

/// Path set for `session` under `base`.
pub fn session_paths(base: &Path, session: &str) -> SessionPaths {
    SessionPaths {
        base_dir: base.to_path_buf(),
        socket: base.join(format!("{session}.sock")),
        process_lock: base.join(format!("{session}.lock")),
        state_file: base.join("state").join(format!("{session}.json")),
        log_file: base.join("logs").join(format!("{session}.log")),
    }
}

/// Path set for `session` under the default base directory.
pub fn default_session_paths(session: &str) -> SessionPaths {
    session_paths(&base_dir(), session)
}

impl SessionPaths {
    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join("state")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Create the base, state and log directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.state_dir())?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_paths_layout() {
        let paths = session_paths(Path::new("/run/user/1000/panemux"), "work");
        assert_eq!(
            paths.socket,
            Path::new("/run/user/1000/panemux/work.sock")
        );
        assert_eq!(
            paths.process_lock,
            Path::new("/run/user/1000/panemux/work.lock")
        );
        assert_eq!(
            paths.state_file,
            Path::new("/run/user/1000/panemux/state/work.json")
        );
        assert_eq!(
            paths.log_file,
            Path::new("/run/user/1000/panemux/logs/work.log")
        );
    }

    #[test]
    fn base_dir_is_absolute() {
        assert!(base_dir().is_absolute());
    }

    #[test]
    fn ensure_dirs_creates_tree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = session_paths(&tmp.path().join("panemux"), "work");
        paths.ensure_dirs().expect("should create");
        assert!(paths.state_dir().is_dir());
        assert!(paths.log_dir().is_dir());
    }
}
