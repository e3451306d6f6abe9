//! Per-conversion staging directories.
//!
//! A [`StagingSession`] owns a private directory under the staging root
//! with two children: `pixels/` (stage-1 output) and `safe/` (stage-2
//! output). Dropping the session restores owner-only permissions and removes
//! the tree, whichever way the conversion ended.

use crate::error::SafePdfError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

const PIXELS_DIR: &str = "pixels";
const SAFE_DIR: &str = "safe";

pub struct StagingSession {
    pixel_dir: PathBuf,
    safe_dir: PathBuf,
    opened: bool,
    root: TempDir,
}

impl StagingSession {
    /// Create a fresh session directory inside `staging_root`.
    pub fn create(staging_root: &Path) -> Result<Self, SafePdfError> {
        create_private_dir(staging_root)?;

        let root = tempfile::Builder::new()
            .prefix("conversion-")
            .tempdir_in(staging_root)
            .map_err(|e| {
                SafePdfError::io(
                    format!("creating staging directory in '{}'", staging_root.display()),
                    e,
                )
            })?;

        let pixel_dir = root.path().join(PIXELS_DIR);
        let safe_dir = root.path().join(SAFE_DIR);
        for dir in [&pixel_dir, &safe_dir] {
            std::fs::create_dir(dir)
                .map_err(|e| SafePdfError::io(format!("creating '{}'", dir.display()), e))?;
        }
        debug!("Staging session at '{}'", root.path().display());

        Ok(Self {
            pixel_dir,
            safe_dir,
            opened: false,
            root,
        })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn pixel_dir(&self) -> &Path {
        &self.pixel_dir
    }

    pub fn safe_dir(&self) -> &Path {
        &self.safe_dir
    }

    /// Let the unprivileged container user write into the stage directories.
    pub fn open_for_container(&mut self) -> Result<(), SafePdfError> {
        self.opened = true;
        for dir in [&self.pixel_dir, &self.safe_dir] {
            set_mode(dir, 0o777)?;
        }
        Ok(())
    }
}

impl Drop for StagingSession {
    fn drop(&mut self) {
        if self.opened {
            for dir in [&self.pixel_dir, &self.safe_dir] {
                if let Err(e) = set_mode(dir, 0o700) {
                    debug!("Could not restore permissions on '{}': {}", dir.display(), e);
                }
            }
        }
        debug!("Removing staging session '{}'", self.root.path().display());
        // `root` is removed when the TempDir field drops.
    }
}

fn create_private_dir(dir: &Path) -> Result<(), SafePdfError> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(|e| SafePdfError::io(format!("creating '{}'", dir.display()), e))
}

#[cfg(unix)]
fn set_mode(dir: &Path, mode: u32) -> Result<(), SafePdfError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode))
        .map_err(|e| SafePdfError::io(format!("changing permissions of '{}'", dir.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_dir: &Path, _mode: u32) -> Result<(), SafePdfError> {
    Ok(())
}
