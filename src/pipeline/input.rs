//! Input preparation for the disposable-VM channel.
//!
//! The VM reads the whole document from its stdin. In development mode the
//! stage code travels first, as a length-declared payload:
//!
//! ```text
//! u16 L (big-endian) | L bytes of payload | document bytes … <EOF>
//! ```

use crate::error::{ProtocolError, SafePdfError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Largest payload a two-byte length field can declare.
pub const MAX_DEV_PAYLOAD: u64 = u16::MAX as u64;

/// Stage code sent ahead of the document in development mode.
#[derive(Debug, Clone)]
pub struct DevPayload {
    source: PathBuf,
    bytes: Vec<u8>,
}

impl DevPayload {
    /// Load the payload from `path`. Oversized payloads are rejected before
    /// any VM is started.
    pub async fn load(path: &Path) -> Result<Self, SafePdfError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| SafePdfError::io(format!("inspecting '{}'", path.display()), e))?
            .len();
        if size > MAX_DEV_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: MAX_DEV_PAYLOAD,
            }
            .into());
        }
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SafePdfError::io(format!("reading '{}'", path.display()), e))?;
        debug!("Loaded {} byte dev payload from '{}'", bytes.len(), path.display());
        Self::from_bytes(path.to_path_buf(), bytes)
    }

    fn from_bytes(source: PathBuf, bytes: Vec<u8>) -> Result<Self, SafePdfError> {
        if bytes.len() as u64 > MAX_DEV_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len() as u64,
                max: MAX_DEV_PAYLOAD,
            }
            .into());
        }
        Ok(Self { source, bytes })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Length prefix followed by the payload.
    pub fn preamble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.bytes.len());
        // Bounded by MAX_DEV_PAYLOAD at construction.
        out.extend_from_slice(&(self.bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }
}

/// Open the untrusted document for streaming into the VM.
pub async fn open_document(path: &Path) -> Result<tokio::fs::File, SafePdfError> {
    tokio::fs::File::open(path)
        .await
        .map_err(|_| SafePdfError::InputNotReadable {
            path: path.to_path_buf(),
        })
}
