//! Disposable-VM provider (Qubes OS).
//!
//! Stage 1 runs in a fresh, network-less VM reached through
//! `qrexec-client-vm`. The document goes in on stdin; page rasters come
//! back on stdout as a binary stream (see [`crate::protocol::pixels`]).
//! Every page is bounds-checked and persisted to a private staging
//! directory, then stage 2 runs on the host through a [`Reassembler`].
//!
//! ```text
//! host                              disposable VM
//! ────                              ─────────────
//! [u16 len | dev payload]  ──────▶
//! document bytes, EOF      ──────▶  render
//!                          ◀──────  u16 N
//!                          ◀──────  N × (u16 w | u16 h | w*h*3 bytes)
//! reassemble locally
//! ```
//!
//! The writer and the reader run concurrently, so a VM that starts
//! answering early cannot deadlock the host on a full pipe.

use super::exec::{find_program, StageCommand};
use super::staging::StagingSession;
use super::{InstallStatus, IsolationProvider, ProviderKind, STAGE_DOCUMENT_TO_PIXELS};
use crate::config::ConversionConfig;
use crate::document::Document;
use crate::error::SafePdfError;
use crate::ocr::OcrSettings;
use crate::pipeline::finalize::{expect_single_output, move_into_place};
use crate::pipeline::input::{open_document, DevPayload};
use crate::pipeline::reassemble::{CommandReassembler, Reassembler};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::protocol::pixels::PixelStreamReader;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

/// qrexec service for released stage code.
pub const SERVICE_CONVERT: &str = "dz.Convert";

/// qrexec service that accepts stage code ahead of the document.
pub const SERVICE_CONVERT_DEV: &str = "dz.ConvertDev";

pub struct DispVmProvider {
    client: PathBuf,
    target: String,
    dev_payload: Option<PathBuf>,
    reassembler: Arc<dyn Reassembler>,
    staging_root: PathBuf,
    max_dimension: u16,
}

impl DispVmProvider {
    /// Check that the qrexec client and the local reassembler exist.
    pub fn from_config(config: &ConversionConfig) -> Result<Self, SafePdfError> {
        let reassembler = CommandReassembler::locate(&config.reassembler)?
            .with_args(config.reassembler_args.iter().cloned());
        Self::with_reassembler(config, Arc::new(reassembler))
    }

    pub fn with_reassembler(
        config: &ConversionConfig,
        reassembler: Arc<dyn Reassembler>,
    ) -> Result<Self, SafePdfError> {
        let client =
            find_program(&config.qrexec_client).ok_or_else(|| SafePdfError::ProgramNotFound {
                program: config.qrexec_client.display().to_string(),
            })?;
        Ok(Self {
            client,
            target: config.dispvm_target.clone(),
            dev_payload: config.dev_payload.clone(),
            reassembler,
            staging_root: config.staging_root.clone(),
            max_dimension: config.max_dimension,
        })
    }

    fn service(&self) -> &'static str {
        if self.dev_payload.is_some() {
            SERVICE_CONVERT_DEV
        } else {
            SERVICE_CONVERT
        }
    }

    /// Run stage 1 in a disposable VM and persist its pages to `pixel_dir`.
    async fn document_to_pixels(
        &self,
        document: &Document,
        pixel_dir: &Path,
        ocr: &OcrSettings,
        progress: &ProgressReporter,
    ) -> Result<usize, SafePdfError> {
        // Rejected before any VM is started.
        let preamble = match &self.dev_payload {
            Some(path) => Some(DevPayload::load(path).await?.preamble()),
            None => None,
        };
        let input = open_document(document.input_path()).await?;

        let cmd = StageCommand::new(STAGE_DOCUMENT_TO_PIXELS, &self.client)
            .arg(&self.target)
            .arg(self.service());
        info!("> {}", cmd.display());

        let mut child = cmd
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SafePdfError::SpawnFailed {
                stage: STAGE_DOCUMENT_TO_PIXELS,
                source,
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SafePdfError::Internal("qrexec: stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SafePdfError::Internal("qrexec: stdout was not captured".into()))?;

        let exchange = tokio::try_join!(
            send_document(stdin, preamble, input),
            receive_pages(
                BufReader::new(stdout),
                self.max_dimension,
                pixel_dir,
                ocr,
                progress
            ),
        );
        let pages = match exchange {
            Ok(((), pages)) => pages,
            Err(e) => {
                // Drop the VM; nothing it sends from here on is read.
                if let Err(kill_err) = child.kill().await {
                    debug!("Could not kill qrexec client: {}", kill_err);
                }
                return Err(e);
            }
        };

        let status = child
            .wait()
            .await
            .map_err(|e| SafePdfError::io("waiting for qrexec", e))?;
        if !status.success() {
            return Err(SafePdfError::StageFailed {
                stage: STAGE_DOCUMENT_TO_PIXELS,
                status: status.to_string(),
            });
        }
        Ok(pages)
    }
}

async fn send_document<W, R>(
    mut stdin: W,
    preamble: Option<Vec<u8>>,
    mut input: R,
) -> Result<(), SafePdfError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let send_err = |e| SafePdfError::io("sending document to the disposable VM", e);
    if let Some(preamble) = preamble {
        stdin.write_all(&preamble).await.map_err(send_err)?;
    }
    let sent = tokio::io::copy(&mut input, &mut stdin)
        .await
        .map_err(send_err)?;
    // Closing stdin is the end-of-input signal.
    stdin.shutdown().await.map_err(send_err)?;
    drop(stdin);
    debug!("Sent {} document bytes", sent);
    Ok(())
}

async fn receive_pages<R>(
    stdout: R,
    max_dimension: u16,
    pixel_dir: &Path,
    ocr: &OcrSettings,
    progress: &ProgressReporter,
) -> Result<usize, SafePdfError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = PixelStreamReader::new(stdout, max_dimension);
    let n = reader.read_page_count().await?;
    let share = ocr.stage1_share();

    for index in 1..=n {
        let page = reader.read_page(index).await?;
        page.persist(pixel_dir).await?;
        progress.emit(ProgressEvent::new(
            format!("Converting page {index}/{n} to pixels"),
            index as f64 / n as f64 * share,
        ));
    }

    reader.expect_end(n).await?;
    Ok(n)
}

#[async_trait]
impl IsolationProvider for DispVmProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DisposableVm
    }

    /// The VM template is provisioned by the Qubes administrator.
    async fn install(&self) -> Result<InstallStatus, SafePdfError> {
        Ok(InstallStatus::UpToDate)
    }

    async fn convert(
        &self,
        document: &Document,
        ocr: &OcrSettings,
        progress: &ProgressReporter,
    ) -> Result<(), SafePdfError> {
        let session = StagingSession::create(&self.staging_root)?;

        let pages = self
            .document_to_pixels(document, session.pixel_dir(), ocr, progress)
            .await?;
        info!("[doc {}] received {} page(s)", document.id(), pages);

        self.reassembler
            .reassemble(session.pixel_dir(), session.safe_dir(), ocr, progress)
            .await?;

        let produced = expect_single_output(session.safe_dir())?;
        move_into_place(&produced, &document.output_path())?;
        progress.emit(ProgressEvent::new("Safe PDF created", 100.0));
        Ok(())
    }
}
