// The "desktop players disabled" marker file.
//
// The only state this library persists. The file `.wnp_nodp` in the user's
// home directory disables native desktop-player adapters by merely existing;
// its contents are never read. With no resolvable home directory, desktop
// players count as enabled.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use tracing::debug;

pub const FLAG_FILE_NAME: &str = ".wnp_nodp";

/// The marker file at a specific path.
#[derive(Clone, Debug)]
pub struct DesktopFlag {
    path: PathBuf,
}

impl DesktopFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$HOME/.wnp_nodp` (`%USERPROFILE%\.wnp_nodp` on Windows).
    pub fn locate() -> Option<Self> {
        BaseDirs::new().map(|dirs| Self::new(dirs.home_dir().join(FLAG_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        !self.path.exists()
    }

    /// Remove the marker to enable, create it to disable. Returns `enabled`.
    pub fn set_enabled(&self, enabled: bool) -> io::Result<bool> {
        if enabled {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        } else {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&self.path)?;
        }
        debug!(path = %self.path.display(), enabled, "desktop players flag set");
        Ok(enabled)
    }
}

/// Whether native desktop-player adapters should run.
pub fn desktop_players_enabled() -> bool {
    DesktopFlag::locate().is_none_or(|flag| flag.is_enabled())
}

/// Persist the desktop-players setting for future runs.
pub fn set_desktop_players_enabled(enabled: bool) -> io::Result<bool> {
    let flag = DesktopFlag::locate()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?;
    flag.set_enabled(enabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_when_marker_absent() {
        let dir = tempfile::tempdir().unwrap();
        let flag = DesktopFlag::new(dir.path().join(FLAG_FILE_NAME));
        assert!(flag.is_enabled());
    }

    #[test]
    fn disabling_creates_marker_and_enabling_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let flag = DesktopFlag::new(dir.path().join(FLAG_FILE_NAME));

        assert!(!flag.set_enabled(false).unwrap());
        assert!(flag.path().exists());
        assert!(!flag.is_enabled());

        // Idempotent both ways.
        assert!(!flag.set_enabled(false).unwrap());
        assert!(flag.set_enabled(true).unwrap());
        assert!(flag.set_enabled(true).unwrap());
        assert!(!flag.path().exists());
        assert!(flag.is_enabled());
    }

    #[test]
    fn marker_contents_are_irrelevant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FLAG_FILE_NAME);
        fs::write(&path, "enabled=true").unwrap();
        assert!(!DesktopFlag::new(path).is_enabled());
    }

    #[test]
    fn located_flag_lives_in_home() {
        if let Some(flag) = DesktopFlag::locate() {
            assert_eq!(flag.path().file_name().unwrap(), FLAG_FILE_NAME);
        }
    }
}
