//! # safepdf-image
//!
//! Locate and stream the sanitiser container image that ships alongside
//! `edgequake-safepdf`.
//!
//! The release bundle carries two artifacts in its resource directory:
//!
//! | File               | Contents                                              |
//! |--------------------|-------------------------------------------------------|
//! | `container.tar.gz` | gzip-compressed `podman save` / `docker save` export  |
//! | `image-id.txt`     | the image id the runtime reports once it is loaded    |
//!
//! The id file is what makes installation idempotent: the host compares it
//! against the id the container runtime currently reports and only loads
//! the archive on mismatch.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use safepdf_image::{ImageArtifacts, DEFAULT_CHUNK_SIZE};
//!
//! let artifacts = ImageArtifacts::locate().expect("resources missing");
//! let expected = artifacts.expected_image_id().expect("id unreadable");
//!
//! // Stream the decompressed tarball into any writer (normally the stdin
//! // of `podman load`). The archive is never held in memory as a whole.
//! let mut sink = std::io::sink();
//! let bytes = artifacts
//!     .stream_into(&mut sink, DEFAULT_CHUNK_SIZE, None)
//!     .expect("stream failed");
//! eprintln!("image {expected}: {bytes} bytes");
//! ```
//!
//! ## Environment variable overrides
//!
//! - `SAFEPDF_RESOURCE_DIR`: directory holding the two artifacts.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use thiserror::Error;

// ── Public constants ─────────────────────────────────────────────────────────

/// File name of the compressed image export.
pub const ARCHIVE_FILE_NAME: &str = "container.tar.gz";

/// File name of the expected image id.
pub const IMAGE_ID_FILE_NAME: &str = "image-id.txt";

/// Chunk size used when feeding the runtime's import channel.
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024;

/// Environment variable overriding the resource directory.
pub const RESOURCE_DIR_ENV: &str = "SAFEPDF_RESOURCE_DIR";

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned while locating or streaming image artifacts.
#[derive(Error, Debug)]
pub enum ImageArchiveError {
    /// A required artifact is not present in the resource directory.
    #[error("Container image artifact missing: '{path}'")]
    MissingArtifact { path: PathBuf },

    /// An artifact exists but could not be read.
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The id file is empty once whitespace is trimmed.
    #[error("Image id file '{path}' is empty")]
    EmptyImageId { path: PathBuf },

    /// gzip decoding failed part-way through the archive.
    #[error("Failed to decompress '{path}': {source}")]
    Decompress {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The destination stopped accepting data (e.g. `load` exited early).
    #[error("Image import channel closed: {0}")]
    Write(#[source] std::io::Error),
}

// ── Resource directory resolution ────────────────────────────────────────────

/// Returns the directory that holds the shipped image artifacts.
///
/// Resolution order (first match wins):
///
/// 1. `SAFEPDF_RESOURCE_DIR`
/// 2. `<exe-dir>/../share/safepdf` (system packages, relocatable bundles)
/// 3. `<data-dir>/safepdf` (e.g. `~/.local/share/safepdf`)
pub fn resource_dir() -> PathBuf {
    let override_dir = std::env::var_os(RESOURCE_DIR_ENV).map(PathBuf::from);
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    resource_dir_from(override_dir, exe_dir)
}

fn resource_dir_from(override_dir: Option<PathBuf>, exe_dir: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
        return dir;
    }

    if let Some(exe_dir) = exe_dir {
        let bundled = exe_dir.join("..").join("share").join("safepdf");
        if bundled.join(IMAGE_ID_FILE_NAME).exists() {
            return bundled;
        }
    }

    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(std::env::temp_dir)
        .join("safepdf")
}

// ── Artifacts ────────────────────────────────────────────────────────────────

/// Paths to the compressed image export and its expected id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifacts {
    archive: PathBuf,
    image_id: PathBuf,
}

impl ImageArtifacts {
    /// Locate the artifacts in [`resource_dir`].
    pub fn locate() -> Result<Self, ImageArchiveError> {
        Self::in_dir(resource_dir())
    }

    /// Locate the artifacts in an explicit directory.
    ///
    /// Both files must exist; nothing is read yet.
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self, ImageArchiveError> {
        let dir = dir.as_ref();
        let archive = dir.join(ARCHIVE_FILE_NAME);
        let image_id = dir.join(IMAGE_ID_FILE_NAME);

        for path in [&archive, &image_id] {
            if !path.is_file() {
                return Err(ImageArchiveError::MissingArtifact { path: path.clone() });
            }
        }

        Ok(Self { archive, image_id })
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive
    }

    pub fn image_id_path(&self) -> &Path {
        &self.image_id
    }

    /// Read the expected image id, trimmed of surrounding whitespace.
    pub fn expected_image_id(&self) -> Result<String, ImageArchiveError> {
        let raw =
            std::fs::read_to_string(&self.image_id).map_err(|source| ImageArchiveError::Read {
                path: self.image_id.clone(),
                source,
            })?;

        let id = raw.trim();
        if id.is_empty() {
            return Err(ImageArchiveError::EmptyImageId {
                path: self.image_id.clone(),
            });
        }
        Ok(id.to_string())
    }

    /// Decompress the archive into `writer`, `chunk_size` bytes at a time.
    ///
    /// `on_progress` receives the running total of decompressed bytes after
    /// every chunk. Returns the total number of bytes written.
    pub fn stream_into<W: Write + ?Sized>(
        &self,
        writer: &mut W,
        chunk_size: usize,
        on_progress: Option<&dyn Fn(u64)>,
    ) -> Result<u64, ImageArchiveError> {
        let file = std::fs::File::open(&self.archive).map_err(|source| ImageArchiveError::Read {
            path: self.archive.clone(),
            source,
        })?;

        let mut decoder = GzDecoder::new(std::io::BufReader::new(file));
        let mut chunk = vec![0u8; chunk_size.max(1)];
        let mut written: u64 = 0;

        loop {
            match decoder.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    writer
                        .write_all(&chunk[..n])
                        .map_err(ImageArchiveError::Write)?;
                    written += n as u64;
                    if let Some(cb) = on_progress {
                        cb(written);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ImageArchiveError::Decompress {
                        path: self.archive.clone(),
                        source,
                    });
                }
            }
        }

        writer.flush().map_err(ImageArchiveError::Write)?;
        Ok(written)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
