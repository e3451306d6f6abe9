//! Error types for the edgequake-safepdf library.
//!
//! Two error types mirror the two sides of the trust boundary:
//!
//! * [`SafePdfError`]: everything that can stop a conversion: environment
//!   problems on the host, stage failures, output placement, illegal state
//!   transitions. Returned from every public entry point.
//!
//! * [`ProtocolError`]: the isolated context sent something that violates
//!   the pixel or progress contract. These are always attacker-reachable, so
//!   each variant carries enough context for a human-readable explanation but
//!   never any of the offending payload beyond a bounded summary.
//!
//! [`SafePdfError::kind`] maps every variant onto the failure taxonomy used
//! by callers to decide what to report (environment errors are reported
//! before any isolated execution; nothing is ever retried automatically).

use crate::document::{DocumentId, DocumentState};
use safepdf_image::ImageArchiveError;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    /// Missing tooling, unreadable input, unwritable output location.
    Environment,
    /// Malformed or out-of-bounds data from the isolated context.
    Protocol,
    /// The isolated process exited non-zero or could not be driven.
    Stage,
    /// The safe PDF could not be placed, or the original not archived.
    Output,
    /// A document state transition was attempted out of order.
    State,
    /// Unexpected host-side failure.
    Internal,
}

/// All fatal errors returned by the edgequake-safepdf library.
#[derive(Debug, Error)]
pub enum SafePdfError {
    // ── Environment errors ────────────────────────────────────────────────
    /// Input document was not found at the given path.
    #[error("Input file not found: '{path}'")]
    InputNotFound { path: PathBuf },

    /// Input document exists but cannot be opened for reading.
    #[error("Input file is not readable: '{path}'\nTry: chmod +r {path:?}")]
    InputNotReadable { path: PathBuf },

    /// The requested safe output does not end in `.pdf`.
    #[error("Safe PDF filename must end in '.pdf': '{path}'")]
    OutputNotPdf { path: PathBuf },

    /// The directory that should receive the safe PDF does not exist.
    #[error("Output directory does not exist: '{path}'")]
    OutputDirMissing { path: PathBuf },

    /// The output location is a file, not a directory.
    #[error("Output path is not a directory: '{path}'")]
    OutputDirNotDirectory { path: PathBuf },

    /// The output directory cannot be written to.
    #[error("Output directory is not writable: '{path}'")]
    OutputDirUnwritable { path: PathBuf },

    /// The safe output would land on the untrusted input itself.
    #[error("Safe PDF would overwrite the original document: '{path}'\nTry: choose a different output filename or suffix")]
    OutputIsInput { path: PathBuf },

    /// The suffix was changed after an explicit output path was set.
    #[error("Cannot change the output suffix once an output filename has been set")]
    SuffixNotApplicable,

    /// No container runtime executable on this host.
    #[error("{runtime} is not installed\nInstall it, or point SAFEPDF_CONTAINER_RUNTIME at the executable.")]
    RuntimeNotFound { runtime: String },

    /// A host-side helper program (qrexec client, reassembler) is missing.
    #[error("Required program not found: '{program}'")]
    ProgramNotFound { program: String },

    /// The shipped container image artifacts are missing or unreadable.
    #[error("Container image resources unavailable: {0}")]
    ImageArtifacts(#[from] ImageArchiveError),

    /// OCR language code rejected before it reached any stage.
    #[error("Invalid OCR language code: '{code}'")]
    InvalidOcrLanguage { code: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Protocol violations ───────────────────────────────────────────────
    /// The isolated context broke the pixel or progress contract.
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    // ── Stage failures ────────────────────────────────────────────────────
    /// The isolated command could not be launched.
    #[error("Failed to launch {stage}: {source}")]
    SpawnFailed {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The isolated command exited unsuccessfully or was terminated.
    #[error("{stage} failed ({status})")]
    StageFailed { stage: &'static str, status: String },

    /// The image could not be brought to the expected version.
    #[error("Failed to install the container image (expected id {expected})")]
    InstallFailed { expected: String },

    // ── Output errors ─────────────────────────────────────────────────────
    /// The safe PDF could not be moved to the caller's output path.
    #[error("Failed to write safe PDF to '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document was converted but the original could not be archived.
    #[error("Converted, but failed to archive original '{path}': {source}")]
    ArchiveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── State errors ──────────────────────────────────────────────────────
    /// A document state transition was requested from the wrong state.
    #[error("Document {id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: DocumentId,
        from: DocumentState,
        to: DocumentState,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Host-side I/O error not covered by a more specific variant.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SafePdfError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        use SafePdfError::*;
        match self {
            InputNotFound { .. }
            | InputNotReadable { .. }
            | OutputNotPdf { .. }
            | OutputDirMissing { .. }
            | OutputDirNotDirectory { .. }
            | OutputDirUnwritable { .. }
            | OutputIsInput { .. }
            | SuffixNotApplicable
            | RuntimeNotFound { .. }
            | ProgramNotFound { .. }
            | ImageArtifacts(_)
            | InvalidOcrLanguage { .. }
            | InvalidConfig(_) => ErrorKind::Environment,
            Protocol(_) => ErrorKind::Protocol,
            SpawnFailed { .. } | StageFailed { .. } | InstallFailed { .. } => ErrorKind::Stage,
            OutputWriteFailed { .. } | ArchiveFailed { .. } => ErrorKind::Output,
            InvalidTransition { .. } => ErrorKind::State,
            Io { .. } | Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SafePdfError::Io {
            context: context.into(),
            source,
        }
    }
}

/// A violation of the trust-boundary contract by the isolated context.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The VM declared a document with no pages.
    #[error("isolated context reported zero pages")]
    ZeroPages,

    /// Page geometry outside `[1, max]` in either dimension.
    #[error("page {page}: dimensions {width}x{height} outside 1..={max}")]
    DimensionOutOfBounds {
        page: usize,
        width: u64,
        height: u64,
        max: u16,
    },

    /// The stream ended before a declared field or frame was complete.
    #[error("{what}: expected {expected} bytes, stream ended after {received}")]
    Truncated {
        what: String,
        expected: u64,
        received: u64,
    },

    /// Bytes followed the last declared page.
    #[error("unexpected data after page {pages}")]
    TrailingData { pages: usize },

    /// Stage 1 left an incomplete page triple behind.
    #[error("page {page}: missing '{file}'")]
    MissingPageFile { page: usize, file: String },

    /// A width/height file did not hold a decimal integer.
    #[error("page {page}: malformed {field}: {value:?}")]
    MalformedGeometry {
        page: usize,
        field: &'static str,
        value: String,
    },

    /// An `.rgb` file does not match its declared geometry.
    #[error("page {page}: pixel data is {actual} bytes, expected {expected}")]
    PixelLengthMismatch {
        page: usize,
        expected: u64,
        actual: u64,
    },

    /// Stage 2 did not leave exactly one safe PDF behind.
    #[error("stage 2 produced {found} file(s); expected only '{expected}'")]
    UnexpectedStageOutput { found: usize, expected: String },

    /// The development payload cannot be length-prefixed in two bytes.
    #[error("development payload is {size} bytes; at most {max} can be declared")]
    PayloadTooLarge { size: u64, max: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_error_display() {
        let e = ProtocolError::DimensionOutOfBounds {
            page: 2,
            width: 0,
            height: 480,
            max: 10_000,
        };
        let msg = e.to_string();
        assert!(msg.contains("page 2"), "got: {msg}");
        assert!(msg.contains("0x480"), "got: {msg}");
    }

    #[test]
    fn protocol_errors_classify_as_protocol() {
        let e: SafePdfError = ProtocolError::ZeroPages.into();
        assert_eq!(e.kind(), ErrorKind::Protocol);
        assert!(e.to_string().contains("zero pages"));
    }

    #[test]
    fn runtime_not_found_is_environment() {
        let e = SafePdfError::RuntimeNotFound {
            runtime: "podman".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Environment);
        assert!(e.to_string().starts_with("podman is not installed"));
    }

    #[test]
    fn stage_failure_display() {
        let e = SafePdfError::StageFailed {
            stage: "document-to-pixels",
            status: "exit status: 1".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Stage);
        assert!(e.to_string().contains("document-to-pixels"));
    }

    #[test]
    fn archive_failure_is_output() {
        let e = SafePdfError::ArchiveFailed {
            path: PathBuf::from("/docs/a.docx"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(e.kind(), ErrorKind::Output);
        assert!(e.to_string().contains("a.docx"));
    }
}
