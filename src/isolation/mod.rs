//! Isolation providers: where untrusted rendering actually runs.
//!
//! ```text
//!            ┌────────────────────────┐
//!            │ dyn IsolationProvider  │  chosen once, at startup
//!            └───────────┬────────────┘
//!          ┌─────────────┴──────────────┐
//!   ContainerProvider             DispVmProvider
//!   podman/docker, both           qrexec to a fresh VM for stage 1,
//!   stages in throwaway           binary pixel stream back,
//!   containers                    stage 2 on the host
//! ```
//!
//! A provider never touches document state. It runs the two stages for one
//! document and leaves the safe PDF at the document's output path, or
//! returns the error that stopped it; [`crate::convert`] owns the state
//! machine around it.

pub mod container;
pub mod dispvm;
pub mod exec;
pub mod staging;

use crate::config::ConversionConfig;
use crate::document::Document;
use crate::error::SafePdfError;
use crate::ocr::OcrSettings;
use crate::progress::ProgressReporter;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

pub use container::{ContainerProvider, ContainerRuntime, RuntimeKind};
pub use dispvm::DispVmProvider;

/// Stage name used in logs and errors.
pub const STAGE_DOCUMENT_TO_PIXELS: &str = "document-to-pixels";

/// Which backend runs the untrusted stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Container,
    DisposableVm,
}

impl ProviderKind {
    /// Disposable VMs when the qrexec client is installed, containers otherwise.
    pub fn detect(qrexec_client: &Path) -> Self {
        if qrexec_client.is_file() {
            ProviderKind::DisposableVm
        } else {
            ProviderKind::Container
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Container => "container",
            ProviderKind::DisposableVm => "dispvm",
        })
    }
}

impl FromStr for ProviderKind {
    type Err = SafePdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" => Ok(ProviderKind::Container),
            "dispvm" | "disposable-vm" | "qubes" => Ok(ProviderKind::DisposableVm),
            other => Err(SafePdfError::InvalidConfig(format!(
                "unknown provider '{other}' (expected 'container' or 'dispvm')"
            ))),
        }
    }
}

/// Result of [`IsolationProvider::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStatus {
    /// The expected image or template was already in place.
    UpToDate,
    /// The provider loaded it just now.
    Installed,
}

/// A backend that runs stage 1 (and possibly stage 2) in isolation.
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Make sure the execution context is ready. Idempotent.
    async fn install(&self) -> Result<InstallStatus, SafePdfError>;

    /// Run both stages for `document` and place the safe PDF at its output
    /// path. Progress is reported in arrival order.
    async fn convert(
        &self,
        document: &Document,
        ocr: &OcrSettings,
        progress: &ProgressReporter,
    ) -> Result<(), SafePdfError>;

    /// Number of documents that may be converted at once.
    ///
    /// Both built-in providers return 1: no per-conversion timeout or
    /// resource budget exists yet to contain several hostile documents.
    fn max_parallel_conversions(&self) -> usize {
        1
    }
}

/// Build the provider named by `config`, detecting one if none is set.
///
/// Missing tooling is reported here, before anything is spawned.
pub fn build_provider(config: &ConversionConfig) -> Result<Arc<dyn IsolationProvider>, SafePdfError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let kind = config
        .provider_kind
        .unwrap_or_else(|| ProviderKind::detect(&config.qrexec_client));
    info!("Using {} isolation provider", kind);

    Ok(match kind {
        ProviderKind::Container => Arc::new(ContainerProvider::from_config(config)?),
        ProviderKind::DisposableVm => Arc::new(DispVmProvider::from_config(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_follows_qrexec_client() {
        assert_eq!(
            ProviderKind::detect(Path::new("/nonexistent/qrexec-client-vm")),
            ProviderKind::Container
        );
        let f = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(ProviderKind::detect(f.path()), ProviderKind::DisposableVm);
    }

    #[test]
    fn provider_names_parse() {
        assert_eq!("container".parse::<ProviderKind>().unwrap(), ProviderKind::Container);
        assert_eq!("DispVM".parse::<ProviderKind>().unwrap(), ProviderKind::DisposableVm);
        assert!("vmware".parse::<ProviderKind>().is_err());
        assert_eq!(ProviderKind::DisposableVm.to_string(), "dispvm");
    }

    #[test]
    fn missing_runtime_fails_before_spawning() {
        let config = ConversionConfig::builder()
            .provider_kind(ProviderKind::Container)
            .container_runtime("/nonexistent/podman")
            .build()
            .unwrap();
        let err = build_provider(&config).err().unwrap();
        assert!(matches!(err, SafePdfError::RuntimeNotFound { .. }));
    }

    #[test]
    fn missing_qrexec_client_fails_before_spawning() {
        let config = ConversionConfig::builder()
            .provider_kind(ProviderKind::DisposableVm)
            .qrexec_client("/nonexistent/qrexec-client-vm")
            .build()
            .unwrap();
        let err = build_provider(&config).err().unwrap();
        assert!(matches!(err, SafePdfError::ProgramNotFound { .. }));
    }
}
