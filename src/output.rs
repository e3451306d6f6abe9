//! Serialisable outcome of a batch conversion.

use crate::document::{Document, DocumentId, DocumentState};
use crate::error::{ErrorKind, SafePdfError};
use crate::isolation::{InstallStatus, ProviderKind};
use serde::Serialize;
use std::path::PathBuf;

/// What happened to one document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentOutcome {
    pub id: DocumentId,
    pub input: PathBuf,
    pub output: PathBuf,
    pub state: DocumentState,
    /// Where the original was moved, when archiving succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_to: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl DocumentOutcome {
    pub(crate) fn new(
        document: &Document,
        result: &Result<Option<PathBuf>, SafePdfError>,
    ) -> Self {
        let (archived_to, error, error_kind) = match result {
            Ok(archived) => (archived.clone(), None, None),
            Err(e) => (None, Some(e.to_string()), Some(e.kind())),
        };
        Self {
            id: document.id(),
            input: document.input_path().to_path_buf(),
            output: document.output_path(),
            state: document.state(),
            archived_to,
            error,
            error_kind,
        }
    }

    pub fn is_safe(&self) -> bool {
        self.state == DocumentState::Safe
    }
}

/// Summary of [`crate::convert_documents`].
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub provider: ProviderKind,
    pub install: InstallStatus,
    pub documents: Vec<DocumentOutcome>,
    pub safe: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl ConversionReport {
    pub(crate) fn new(
        provider: ProviderKind,
        install: InstallStatus,
        documents: Vec<DocumentOutcome>,
        duration_ms: u64,
    ) -> Self {
        let safe = documents.iter().filter(|d| d.is_safe()).count();
        let failed = documents
            .iter()
            .filter(|d| d.state == DocumentState::Failed)
            .count();
        Self {
            provider,
            install,
            documents,
            safe,
            failed,
            duration_ms,
        }
    }

    /// True when every document became safe and nothing else went wrong.
    pub fn all_safe(&self) -> bool {
        self.documents
            .iter()
            .all(|d| d.is_safe() && d.error.is_none())
    }
}
