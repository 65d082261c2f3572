//! OS-specific directory resolution.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("could not determine OS configuration directory")]
    NoConfigDir,

    #[error("platform I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the server keeps its files.
///
/// Follows OS conventions (XDG on Linux, Known Folders on Windows,
/// Library on macOS) unless a root is given explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDirs {
    /// Holds `config.ron`.
    pub config_dir: PathBuf,
    /// Holds `quay.log` when file logging is enabled.
    pub log_dir: PathBuf,
}

const APP_NAME: &str = "quay";

impl PlatformDirs {
    /// Resolve the OS directories without creating them.
    pub fn resolve() -> Result<Self, PlatformError> {
        let base = dirs::config_dir().ok_or(PlatformError::NoConfigDir)?;
        Ok(Self::resolve_with_root(&base))
    }

    /// Lay the directories out under `root` (used for `--config` and in tests).
    pub fn resolve_with_root(root: &Path) -> Self {
        let app_dir = root.join(APP_NAME);
        Self {
            config_dir: app_dir.clone(),
            log_dir: app_dir.join("logs"),
        }
    }

    /// Use `config_dir` as given, with logs beneath it.
    pub fn from_config_dir(config_dir: PathBuf) -> Self {
        Self {
            log_dir: config_dir.join("logs"),
            config_dir,
        }
    }

    pub fn create_dirs(&self) -> Result<(), PlatformError> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_absolute() {
        let dirs = PlatformDirs::resolve().unwrap();
        assert!(dirs.config_dir.is_absolute());
        assert!(dirs.log_dir.starts_with(&dirs.config_dir));
    }

    #[test]
    fn test_directory_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = PlatformDirs::resolve_with_root(tmp.path());
        dirs.create_dirs().unwrap();
        assert!(dirs.config_dir.ends_with(APP_NAME));
        assert!(dirs.config_dir.exists());
        assert!(dirs.log_dir.exists());
    }

    #[test]
    fn test_explicit_config_dir() {
        let dirs = PlatformDirs::from_config_dir(PathBuf::from("/srv/quay"));
        assert_eq!(dirs.config_dir, PathBuf::from("/srv/quay"));
        assert_eq!(dirs.log_dir, PathBuf::from("/srv/quay").join("logs"));
    }
}
