//! Stage 2: rebuild a PDF from validated page rasters.
//!
//! The container provider runs this stage inside its sandbox; the
//! disposable-VM provider runs it on the host through [`CommandReassembler`].
//! Either way the contract is the same: read the pixel directory, write
//! exactly one `safe-output-compressed.pdf` into an empty output directory.

use crate::error::SafePdfError;
use crate::isolation::exec::{find_program, run_stage, StageCommand};
use crate::ocr::OcrSettings;
use crate::progress::ProgressReporter;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Stage name used in logs and errors.
pub const STAGE_PIXELS_TO_PDF: &str = "pixels-to-pdf";

/// Default name of the host-side reassembler executable.
pub const DEFAULT_REASSEMBLER: &str = "safepdf-pixels-to-pdf";

/// Turns a directory of page triples into a single PDF.
#[async_trait]
pub trait Reassembler: Send + Sync {
    /// Read `pixel_dir`, write the PDF into `safe_dir`. OCR settings are
    /// passed to the stage explicitly.
    async fn reassemble(
        &self,
        pixel_dir: &Path,
        safe_dir: &Path,
        ocr: &OcrSettings,
        progress: &ProgressReporter,
    ) -> Result<(), SafePdfError>;
}

/// Runs a local reassembler program: `<program> [args…] <pixel-dir> <safe-dir>`.
///
/// OCR configuration is handed over as `OCR` / `OCR_LANGUAGE` in the child's
/// environment only. Its output lines follow the progress protocol.
#[derive(Debug, Clone)]
pub struct CommandReassembler {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandReassembler {
    /// Resolve `program` (a path or a name on `PATH`).
    pub fn locate(program: impl AsRef<Path>) -> Result<Self, SafePdfError> {
        let program = program.as_ref();
        let resolved = find_program(program).ok_or_else(|| SafePdfError::ProgramNotFound {
            program: program.display().to_string(),
        })?;
        Ok(Self {
            program: resolved,
            args: Vec::new(),
        })
    }

    /// Arguments placed before the two directories.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, pixel_dir: &Path, safe_dir: &Path, ocr: &OcrSettings) -> StageCommand {
        let mut cmd = StageCommand::new(STAGE_PIXELS_TO_PDF, &self.program)
            .args(&self.args)
            .arg(pixel_dir)
            .arg(safe_dir);
        for (key, value) in ocr.env_pairs() {
            cmd = cmd.env(key, value);
        }
        cmd
    }
}

#[async_trait]
impl Reassembler for CommandReassembler {
    async fn reassemble(
        &self,
        pixel_dir: &Path,
        safe_dir: &Path,
        ocr: &OcrSettings,
        progress: &ProgressReporter,
    ) -> Result<(), SafePdfError> {
        let cmd = self.command(pixel_dir, safe_dir, ocr);
        run_stage(&cmd, progress).await
    }
}
