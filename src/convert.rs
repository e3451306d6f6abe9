//! Conversion entry points: the document state machine around a provider.
//!
//! ```text
//! validate output ──▶ Converting ──▶ provider.convert ──┬──▶ Safe ──▶ archive?
//!  (Environment err,                                    └──▶ Failed
//!   state untouched)
//! ```
//!
//! Providers only run stages; everything that changes a [`Document`] happens
//! here, so a document ends in exactly one terminal state no matter which
//! provider or which error stopped it.

use crate::config::ConversionConfig;
use crate::document::{Document, DocumentState};
use crate::error::SafePdfError;
use crate::isolation::{build_provider, IsolationProvider};
use crate::ocr::OcrSettings;
use crate::output::{ConversionReport, DocumentOutcome};
use crate::pipeline::finalize::clear_stale_output;
use crate::progress::{ProgressReporter, ProgressSinkRef};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Sanitise one document.
///
/// This is the primary entry point for the library. The provider is built
/// from `config` and installed before the document is touched.
///
/// # Errors
/// - Environment errors (missing runtime, unwritable output) are returned
///   before anything runs; the document stays `Unconverted`.
/// - Any stage, protocol or output error leaves the document `Failed`, with
///   the message available from [`Document::failure`].
/// - [`SafePdfError::ArchiveFailed`] leaves the document `Safe`: the PDF was
///   written, only moving the original failed.
pub async fn convert(document: &mut Document, config: &ConversionConfig) -> Result<(), SafePdfError> {
    let provider = build_provider(config)?;
    provider.install().await?;
    convert_with_provider(provider.as_ref(), document, config.sink())
        .await
        .map(|_| ())
}

/// Sanitise several documents with one provider.
///
/// The provider is installed once; at most
/// [`IsolationProvider::max_parallel_conversions`] documents are in flight.
/// Per-document failures are recorded in the report, not returned.
pub async fn convert_documents(
    documents: &mut [Document],
    config: &ConversionConfig,
) -> Result<ConversionReport, SafePdfError> {
    let start = Instant::now();
    let provider = build_provider(config)?;
    let install = provider.install().await?;
    let limit = provider.max_parallel_conversions().max(1);
    let sink = config.sink();
    info!(
        "Converting {} document(s) with the {} provider, {} at a time",
        documents.len(),
        provider.kind(),
        limit
    );

    let mut results: Vec<(usize, Result<Option<PathBuf>, SafePdfError>)> =
        stream::iter(documents.iter_mut().enumerate().map(|(i, doc)| {
            let provider = Arc::clone(&provider);
            let sink = Arc::clone(&sink);
            async move { (i, convert_with_provider(provider.as_ref(), doc, sink).await) }
        }))
        .buffer_unordered(limit)
        .collect()
        .await;
    results.sort_by_key(|(i, _)| *i);

    let outcomes = results
        .iter()
        .map(|(i, result)| DocumentOutcome::new(&documents[*i], result))
        .collect();
    let report = ConversionReport::new(
        provider.kind(),
        install,
        outcomes,
        start.elapsed().as_millis() as u64,
    );
    info!(
        "Conversion finished: {} safe, {} failed, {}ms",
        report.safe, report.failed, report.duration_ms
    );
    Ok(report)
}

/// Sanitise one document with an already installed provider.
///
/// Returns where the original was archived, if archiving was requested.
pub async fn convert_with_provider(
    provider: &dyn IsolationProvider,
    document: &mut Document,
    sink: ProgressSinkRef,
) -> Result<Option<PathBuf>, SafePdfError> {
    document.validate_output()?;

    let progress = ProgressReporter::new(document.id(), sink);
    document.mark_as_converting()?;
    progress.state_changed(DocumentState::Converting);
    info!(
        "[doc {}] converting '{}' -> '{}'",
        document.id(),
        document.input_path().display(),
        document.output_path().display()
    );

    let ocr = OcrSettings::new(document.ocr_language().cloned());
    let result = match clear_stale_output(&document.output_path()) {
        Ok(()) => provider.convert(document, &ocr, &progress).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("[doc {}] conversion failed: {}", document.id(), e);
        document.mark_as_failed(e.to_string())?;
        progress.state_changed(DocumentState::Failed);
        return Err(e);
    }

    document.mark_as_safe()?;
    progress.state_changed(DocumentState::Safe);
    info!("[doc {}] safe PDF at '{}'", document.id(), document.output_path().display());

    if !document.archive_after_conversion() {
        return Ok(None);
    }
    match document.archive() {
        Ok(path) => Ok(Some(path)),
        Err(e) => {
            warn!("[doc {}] {}", document.id(), e);
            Err(e)
        }
    }
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(document: &mut Document, config: &ConversionConfig) -> Result<(), SafePdfError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| SafePdfError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(document, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::isolation::{InstallStatus, ProviderKind};
    use crate::progress::tests::RecordingSink;
    use crate::progress::ProgressEvent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a fixed PDF, or fails with a stage error.
    struct FakeProvider {
        fail: bool,
        installs: AtomicUsize,
        conversions: AtomicUsize,
    }

    impl FakeProvider {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                installs: AtomicUsize::new(0),
                conversions: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IsolationProvider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Container
        }

        async fn install(&self) -> Result<InstallStatus, SafePdfError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(InstallStatus::UpToDate)
        }

        async fn convert(
            &self,
            document: &Document,
            _ocr: &OcrSettings,
            progress: &ProgressReporter,
        ) -> Result<(), SafePdfError> {
            self.conversions.fetch_add(1, Ordering::SeqCst);
            progress.emit(ProgressEvent::new("working", 50.0));
            if self.fail {
                return Err(SafePdfError::StageFailed {
                    stage: "document-to-pixels",
                    status: "exit status: 1".into(),
                });
            }
            std::fs::write(document.output_path(), b"%PDF-1.7 safe").unwrap();
            Ok(())
        }
    }

    fn input(dir: &std::path::Path, name: &str) -> Document {
        let p = dir.join(name);
        std::fs::write(&p, b"untrusted").unwrap();
        Document::new(&p).unwrap()
    }

    fn config_with(provider: Arc<FakeProvider>, sink: Arc<RecordingSink>) -> ConversionConfig {
        ConversionConfig::builder()
            .provider(provider)
            .progress_sink(sink)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn success_marks_safe_and_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = input(dir.path(), "sample.pdf");
        let sink = Arc::new(RecordingSink::default());
        let config = config_with(Arc::new(FakeProvider::new(false)), sink.clone());

        convert(&mut doc, &config).await.unwrap();
        assert!(doc.is_safe());
        assert!(dir.path().join("sample-safe.pdf").exists());

        let states: Vec<_> = sink.states.lock().unwrap().iter().map(|(_, s)| *s).collect();
        assert_eq!(states, vec![DocumentState::Converting, DocumentState::Safe]);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn stage_failure_marks_failed_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = input(dir.path(), "sample.pdf");
        let config = config_with(
            Arc::new(FakeProvider::new(true)),
            Arc::new(RecordingSink::default()),
        );

        let err = convert(&mut doc, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stage);
        assert!(doc.is_failed());
        assert!(doc.failure().unwrap().contains("document-to-pixels"));
        assert!(!dir.path().join("sample-safe.pdf").exists());
    }

    #[tokio::test]
    async fn stale_output_is_removed_even_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = input(dir.path(), "sample.pdf");
        let stale = dir.path().join("sample-safe.pdf");
        std::fs::write(&stale, b"old run").unwrap();
        let config = config_with(
            Arc::new(FakeProvider::new(true)),
            Arc::new(RecordingSink::default()),
        );

        assert!(convert(&mut doc, &config).await.is_err());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn unwritable_output_is_reported_before_converting() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let mut doc = input(dir.path(), "sample.pdf")
            .with_output(out_dir.join("x.pdf"))
            .unwrap();
        // Output directory disappears after the document was created.
        std::fs::remove_dir(&out_dir).unwrap();

        let provider = Arc::new(FakeProvider::new(false));
        let config = config_with(provider.clone(), Arc::new(RecordingSink::default()));
        let err = convert(&mut doc, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Environment);
        assert!(doc.is_unconverted());
        assert_eq!(provider.conversions.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_resolving_to_input_never_touches_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("report.pdf");
        let link = dir.path().join("report-link.pdf");
        let mut doc = input(dir.path(), "report.pdf").with_output(&link).unwrap();
        // The output becomes an alias of the input after validation at set time.
        std::os::unix::fs::symlink(&original, &link).unwrap();

        let provider = Arc::new(FakeProvider::new(true));
        let err = convert_with_provider(
            provider.as_ref(),
            &mut doc,
            Arc::new(RecordingSink::default()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SafePdfError::OutputIsInput { .. }));
        assert_eq!(err.kind(), ErrorKind::Environment);
        assert!(doc.is_unconverted());
        assert_eq!(provider.conversions.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&original).unwrap(), b"untrusted");
        assert!(link.exists());
    }

    #[tokio::test]
    async fn suffix_equal_to_extension_keeps_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = input(dir.path(), "x.pdf");
        assert!(matches!(
            doc.set_suffix(".pdf"),
            Err(SafePdfError::OutputIsInput { .. })
        ));

        let config = config_with(
            Arc::new(FakeProvider::new(true)),
            Arc::new(RecordingSink::default()),
        );
        assert!(convert(&mut doc, &config).await.is_err());
        assert!(doc.is_failed());
        assert_eq!(std::fs::read(dir.path().join("x.pdf")).unwrap(), b"untrusted");
    }

    #[tokio::test]
    async fn documents_cannot_be_converted_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = input(dir.path(), "sample.pdf");
        let config = config_with(
            Arc::new(FakeProvider::new(false)),
            Arc::new(RecordingSink::default()),
        );
        convert(&mut doc, &config).await.unwrap();
        let err = convert(&mut doc, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(doc.is_safe());
    }

    #[tokio::test]
    async fn archive_moves_original_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = input(dir.path(), "invoice.docx").with_archive(true);
        let provider = Arc::new(FakeProvider::new(false));

        let archived = convert_with_provider(
            provider.as_ref(),
            &mut doc,
            Arc::new(RecordingSink::default()),
        )
        .await
        .unwrap();
        assert_eq!(archived, Some(dir.path().join("unsafe").join("invoice.docx")));
        assert!(doc.is_safe());
        assert!(!dir.path().join("invoice.docx").exists());
    }

    #[tokio::test]
    async fn archive_failure_keeps_document_safe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("unsafe"), b"file in the way").unwrap();
        let mut doc = input(dir.path(), "invoice.docx").with_archive(true);
        let provider = Arc::new(FakeProvider::new(false));

        let err = convert_with_provider(
            provider.as_ref(),
            &mut doc,
            Arc::new(RecordingSink::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SafePdfError::ArchiveFailed { .. }));
        assert!(doc.is_safe());
        assert!(dir.path().join("invoice-safe.pdf").exists());
    }

    #[tokio::test]
    async fn batch_installs_once_and_reports_each_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut docs = vec![
            input(dir.path(), "a.pdf"),
            input(dir.path(), "b.pdf"),
            input(dir.path(), "c.pdf"),
        ];
        let provider = Arc::new(FakeProvider::new(false));
        let config = config_with(provider.clone(), Arc::new(RecordingSink::default()));

        let report = convert_documents(&mut docs, &config).await.unwrap();
        assert_eq!(provider.installs.load(Ordering::SeqCst), 1);
        assert_eq!(report.safe, 3);
        assert!(report.all_safe());
        assert_eq!(report.documents[1].input, dir.path().join("b.pdf"));
        assert!(docs.iter().all(Document::is_safe));
    }

    #[tokio::test]
    async fn batch_records_failures_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let mut docs = vec![input(dir.path(), "a.pdf"), input(dir.path(), "b.pdf")];
        let config = config_with(
            Arc::new(FakeProvider::new(true)),
            Arc::new(RecordingSink::default()),
        );

        let report = convert_documents(&mut docs, &config).await.unwrap();
        assert_eq!(report.failed, 2);
        assert!(report.documents.iter().all(|d| d.error_kind == Some(ErrorKind::Stage)));
    }

    #[test]
    fn sync_wrapper_runs_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = input(dir.path(), "sample.pdf");
        let config = config_with(
            Arc::new(FakeProvider::new(false)),
            Arc::new(RecordingSink::default()),
        );
        convert_sync(&mut doc, &config).unwrap();
        assert!(doc.is_safe());
    }
}
