//! The document entity: one conversion job and its state machine.
//!
//! ```text
//! Unconverted ──▶ Converting ──┬──▶ Safe
//!                              └──▶ Failed
//! ```
//!
//! Paths are validated when they are set, so a `Document` that exists always
//! points at a readable input. The output location is re-validated by the
//! pipeline immediately before conversion starts, since the default output
//! path is derived lazily from the input.

use crate::error::SafePdfError;
use crate::ocr::OcrLanguage;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Suffix appended to the input stem when no output path is given.
pub const SAFE_EXTENSION: &str = "-safe.pdf";

/// Directory (beside the input) receiving originals after a safe conversion.
pub const ARCHIVE_DIR_NAME: &str = "unsafe";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing document id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DocumentId(u64);

impl DocumentId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversion state of a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DocumentState {
    Unconverted,
    Converting,
    Safe,
    Failed,
}

/// One untrusted input and where its safe PDF should land.
#[derive(Debug)]
pub struct Document {
    id: DocumentId,
    input: PathBuf,
    output: Option<PathBuf>,
    suffix: String,
    ocr_language: Option<OcrLanguage>,
    archive: bool,
    state: DocumentState,
    failure: Option<String>,
}

impl Document {
    /// Create a document for `input`, which must exist and be readable.
    pub fn new(input: impl AsRef<Path>) -> Result<Self, SafePdfError> {
        let input = normalize(input.as_ref())?;
        validate_input(&input)?;

        let doc = Self {
            id: DocumentId::next(),
            input,
            output: None,
            suffix: SAFE_EXTENSION.to_string(),
            ocr_language: None,
            archive: false,
            state: DocumentState::Unconverted,
            failure: None,
        };
        info!("Assigning ID '{}' to doc '{}'", doc.id, doc.input.display());
        Ok(doc)
    }

    /// Set an explicit output path. It must end in `.pdf`, its directory
    /// must be writable, and it must not be the input.
    pub fn with_output(mut self, output: impl AsRef<Path>) -> Result<Self, SafePdfError> {
        let output = normalize(output.as_ref())?;
        validate_output(&output)?;
        ensure_not_input(&self.input, &output)?;
        self.output = Some(output);
        Ok(self)
    }

    pub fn with_ocr_language(mut self, language: Option<OcrLanguage>) -> Self {
        self.ocr_language = language;
        self
    }

    /// Move the original into `unsafe/` beside it once the document is safe.
    pub fn with_archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    /// Keep the output file name but place it in `dir`.
    pub fn set_output_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), SafePdfError> {
        let dir = normalize(dir.as_ref())?;
        if !dir.exists() {
            return Err(SafePdfError::OutputDirMissing { path: dir });
        }
        if !dir.is_dir() {
            return Err(SafePdfError::OutputDirNotDirectory { path: dir });
        }
        probe_writable(&dir)?;

        let file_name = self
            .output_path()
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| SafePdfError::Internal("output path has no file name".into()))?;
        let output = dir.join(file_name);
        ensure_not_input(&self.input, &output)?;
        self.output = Some(output);
        Ok(())
    }

    /// Change the suffix used for the default output name.
    pub fn set_suffix(&mut self, suffix: impl Into<String>) -> Result<(), SafePdfError> {
        if self.output.is_some() {
            return Err(SafePdfError::SuffixNotApplicable);
        }
        let suffix = suffix.into();
        ensure_not_input(&self.input, &self.default_output(&suffix))?;
        self.suffix = suffix;
        Ok(())
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    /// The explicit output path, or `<input-stem><suffix>` beside the input.
    pub fn output_path(&self) -> PathBuf {
        match &self.output {
            Some(p) => p.clone(),
            None => self.default_output(&self.suffix),
        }
    }

    fn default_output(&self, suffix: &str) -> PathBuf {
        let stem = self
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.input.with_file_name(format!("{stem}{suffix}"))
    }

    pub fn ocr_language(&self) -> Option<&OcrLanguage> {
        self.ocr_language.as_ref()
    }

    pub fn archive_after_conversion(&self) -> bool {
        self.archive
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    /// Final explanation recorded when the document failed.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_unconverted(&self) -> bool {
        self.state == DocumentState::Unconverted
    }

    pub fn is_converting(&self) -> bool {
        self.state == DocumentState::Converting
    }

    pub fn is_safe(&self) -> bool {
        self.state == DocumentState::Safe
    }

    pub fn is_failed(&self) -> bool {
        self.state == DocumentState::Failed
    }

    /// Re-check the output location right before conversion.
    ///
    /// Links created after the output was set can still make it resolve to
    /// the input, so the identity check is repeated here.
    pub fn validate_output(&self) -> Result<(), SafePdfError> {
        let output = self.output_path();
        validate_output(&output)?;
        ensure_not_input(&self.input, &output)
    }

    pub(crate) fn mark_as_converting(&mut self) -> Result<(), SafePdfError> {
        self.transition(DocumentState::Unconverted, DocumentState::Converting)
    }

    pub(crate) fn mark_as_safe(&mut self) -> Result<(), SafePdfError> {
        self.transition(DocumentState::Converting, DocumentState::Safe)
    }

    pub(crate) fn mark_as_failed(&mut self, reason: impl Into<String>) -> Result<(), SafePdfError> {
        self.transition(DocumentState::Converting, DocumentState::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, from: DocumentState, to: DocumentState) -> Result<(), SafePdfError> {
        if self.state != from {
            return Err(SafePdfError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }
        debug!("Marking doc {} as {:?}", self.id, to);
        self.state = to;
        Ok(())
    }

    /// Move the original input into `<input-dir>/unsafe/`.
    ///
    /// Returns the archived path. Called by the pipeline after the document
    /// became safe; an existing file of the same name is replaced.
    pub(crate) fn archive(&self) -> Result<PathBuf, SafePdfError> {
        let fail = |source| SafePdfError::ArchiveFailed {
            path: self.input.clone(),
            source,
        };

        let parent = self.input.parent().ok_or_else(|| {
            fail(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "input has no parent directory",
            ))
        })?;
        let file_name = self.input.file_name().ok_or_else(|| {
            fail(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "input has no file name",
            ))
        })?;

        let archive_dir = parent.join(ARCHIVE_DIR_NAME);
        std::fs::create_dir_all(&archive_dir).map_err(fail)?;
        let target = archive_dir.join(file_name);
        std::fs::rename(&self.input, &target).map_err(fail)?;

        info!(
            "Archived original of doc {} to '{}'",
            self.id,
            target.display()
        );
        Ok(target)
    }
}

fn normalize(path: &Path) -> Result<PathBuf, SafePdfError> {
    std::path::absolute(path)
        .map_err(|e| SafePdfError::io(format!("resolving '{}'", path.display()), e))
}

fn validate_input(path: &Path) -> Result<(), SafePdfError> {
    if path.is_dir() {
        return Err(SafePdfError::InputNotReadable {
            path: path.to_path_buf(),
        });
    }
    match std::fs::File::open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SafePdfError::InputNotFound {
            path: path.to_path_buf(),
        }),
        Err(_) => Err(SafePdfError::InputNotReadable {
            path: path.to_path_buf(),
        }),
    }
}

fn validate_output(path: &Path) -> Result<(), SafePdfError> {
    let is_pdf = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if !is_pdf {
        return Err(SafePdfError::OutputNotPdf {
            path: path.to_path_buf(),
        });
    }

    let parent = path
        .parent()
        .ok_or_else(|| SafePdfError::OutputDirMissing {
            path: path.to_path_buf(),
        })?;
    if !parent.is_dir() {
        return Err(SafePdfError::OutputDirMissing {
            path: parent.to_path_buf(),
        });
    }
    probe_writable(parent)
}

/// Reject an output that names the input file, directly or through links.
///
/// A missing output cannot be the input, so failing to canonicalise it is
/// not an error.
fn ensure_not_input(input: &Path, output: &Path) -> Result<(), SafePdfError> {
    let same = input == output
        || match (input.canonicalize(), output.canonicalize()) {
            (Ok(input), Ok(output)) => input == output,
            _ => false,
        };
    if same {
        return Err(SafePdfError::OutputIsInput {
            path: output.to_path_buf(),
        });
    }
    Ok(())
}

/// Create and immediately remove a scratch file in `dir`.
fn probe_writable(dir: &Path) -> Result<(), SafePdfError> {
    tempfile::Builder::new()
        .prefix(".safepdf-probe")
        .tempfile_in(dir)
        .map(drop)
        .map_err(|_| SafePdfError::OutputDirUnwritable {
            path: dir.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sample(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, b"%PDF-1.4\n").unwrap();
        p
    }

    #[test]
    fn default_output_uses_safe_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Document::new(sample(dir.path(), "sample.pdf")).unwrap();
        assert_eq!(doc.output_path(), dir.path().join("sample-safe.pdf"));
        assert!(doc.is_unconverted());
        assert!(doc.failure().is_none());
    }

    #[test]
    fn nonexistent_input_is_environment_error() {
        let err = Document::new("/definitely/not/a/real/file.pdf").unwrap_err();
        assert!(matches!(err, SafePdfError::InputNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::Environment);
    }

    #[test]
    fn directory_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Document::new(dir.path()),
            Err(SafePdfError::InputNotReadable { .. })
        ));
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let input = sample(dir.path(), "a.pdf");
        let a = Document::new(&input).unwrap();
        let b = Document::new(&input).unwrap();
        assert!(b.id() > a.id());
    }

    #[test]
    fn output_must_be_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let docx = dir.path().join("document.docx");
        let err = Document::new(sample(dir.path(), "in.pdf"))
            .unwrap()
            .with_output(&docx)
            .unwrap_err();
        assert!(matches!(err, SafePdfError::OutputNotPdf { .. }));
        assert!(!docx.exists());
    }

    #[test]
    fn output_dir_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = Document::new(sample(dir.path(), "in.pdf"))
            .unwrap()
            .with_output(dir.path().join("missing").join("out.pdf"))
            .unwrap_err();
        assert!(matches!(err, SafePdfError::OutputDirMissing { .. }));
    }

    #[test]
    fn set_output_dir_keeps_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let mut doc = Document::new(sample(dir.path(), "report.docx")).unwrap();
        doc.set_output_dir(out.path()).unwrap();
        assert_eq!(doc.output_path(), out.path().join("report-safe.pdf"));
    }

    #[test]
    fn set_output_dir_rejects_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = sample(dir.path(), "not-a-dir");
        let mut doc = Document::new(sample(dir.path(), "in.pdf")).unwrap();
        assert!(matches!(
            doc.set_output_dir(&file),
            Err(SafePdfError::OutputDirNotDirectory { .. })
        ));
    }

    #[test]
    fn suffix_only_applies_without_explicit_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = Document::new(sample(dir.path(), "in.pdf")).unwrap();
        doc.set_suffix("-clean.pdf").unwrap();
        assert_eq!(doc.output_path(), dir.path().join("in-clean.pdf"));

        let mut doc = doc.with_output(dir.path().join("x.pdf")).unwrap();
        assert!(matches!(
            doc.set_suffix("-other.pdf"),
            Err(SafePdfError::SuffixNotApplicable)
        ));
    }

    #[test]
    fn output_cannot_be_the_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = sample(dir.path(), "report.pdf");
        let err = Document::new(&input)
            .unwrap()
            .with_output(&input)
            .unwrap_err();
        assert!(matches!(err, SafePdfError::OutputIsInput { .. }));
        assert_eq!(err.kind(), ErrorKind::Environment);
        assert!(input.exists());
    }

    #[test]
    fn output_through_dot_dot_is_still_the_input() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let input = sample(dir.path(), "report.pdf");
        let err = Document::new(&input)
            .unwrap()
            .with_output(dir.path().join("sub").join("..").join("report.pdf"))
            .unwrap_err();
        assert!(matches!(err, SafePdfError::OutputIsInput { .. }));
    }

    #[test]
    fn suffix_cannot_turn_output_into_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = sample(dir.path(), "x.pdf");
        let mut doc = Document::new(&input).unwrap();
        assert!(matches!(
            doc.set_suffix(".pdf"),
            Err(SafePdfError::OutputIsInput { .. })
        ));
        assert_eq!(doc.output_path(), dir.path().join("x-safe.pdf"));
    }

    #[test]
    fn output_dir_cannot_point_back_at_the_input() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let input = sample(dir.path(), "report.pdf");
        let mut doc = Document::new(&input)
            .unwrap()
            .with_output(out.path().join("report.pdf"))
            .unwrap();
        assert!(matches!(
            doc.set_output_dir(dir.path()),
            Err(SafePdfError::OutputIsInput { .. })
        ));
        assert_eq!(doc.output_path(), out.path().join("report.pdf"));
    }

    #[cfg(unix)]
    #[test]
    fn late_symlink_to_input_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let input = sample(dir.path(), "report.pdf");
        let link = dir.path().join("link.pdf");
        let doc = Document::new(&input).unwrap().with_output(&link).unwrap();
        std::os::unix::fs::symlink(&input, &link).unwrap();
        assert!(matches!(
            doc.validate_output(),
            Err(SafePdfError::OutputIsInput { .. })
        ));
    }

    #[test]
    fn state_machine_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = Document::new(sample(dir.path(), "in.pdf")).unwrap();
        doc.mark_as_converting().unwrap();
        assert!(doc.is_converting());
        doc.mark_as_safe().unwrap();
        assert!(doc.is_safe());
    }

    #[test]
    fn terminal_states_are_final() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = Document::new(sample(dir.path(), "in.pdf")).unwrap();
        doc.mark_as_converting().unwrap();
        doc.mark_as_failed("stage 1 exited with 1").unwrap();
        assert_eq!(doc.failure(), Some("stage 1 exited with 1"));

        for result in [
            doc.mark_as_safe(),
            doc.mark_as_converting(),
            doc.mark_as_failed("again"),
        ] {
            let err = result.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::State);
        }
        assert!(doc.is_failed());
    }

    #[test]
    fn cannot_finish_without_converting() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = Document::new(sample(dir.path(), "in.pdf")).unwrap();
        assert!(doc.mark_as_safe().is_err());
        assert!(doc.mark_as_failed("nope").is_err());
        assert!(doc.is_unconverted());
    }

    #[test]
    fn archive_moves_original_beside_it() {
        let dir = tempfile::tempdir().unwrap();
        let input = sample(dir.path(), "invoice.docx");
        let doc = Document::new(&input).unwrap().with_archive(true);

        let archived = doc.archive().unwrap();
        assert_eq!(archived, dir.path().join("unsafe").join("invoice.docx"));
        assert!(archived.exists());
        assert!(!input.exists());
    }

    #[test]
    fn archive_failure_is_loud() {
        let dir = tempfile::tempdir().unwrap();
        let input = sample(dir.path(), "invoice.docx");
        // A regular file where the archive directory should go.
        std::fs::write(dir.path().join(ARCHIVE_DIR_NAME), b"").unwrap();

        let doc = Document::new(&input).unwrap();
        let err = doc.archive().unwrap_err();
        assert!(matches!(err, SafePdfError::ArchiveFailed { .. }));
        assert!(input.exists());
    }
}
