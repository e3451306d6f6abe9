//! Configuration for document sanitisation.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. The config only holds *locations and
//! limits*; per-document options (output path, OCR language, archiving) live
//! on [`crate::Document`].
//!
//! # Design choice: builder over constructor
//! Most callers only ever touch one or two fields (the provider, a progress
//! sink). The builder lets them rely on platform defaults for the rest, and
//! `build()` is the single place limits are validated.

use crate::error::SafePdfError;
use crate::isolation::{IsolationProvider, ProviderKind};
use crate::pipeline::pages::DEFAULT_MAX_DIMENSION;
use crate::pipeline::reassemble::DEFAULT_REASSEMBLER;
use crate::progress::{NoopProgressSink, ProgressSink, ProgressSinkRef};
use safepdf_image::DEFAULT_CHUNK_SIZE;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Image the container stages run in.
pub const DEFAULT_IMAGE_NAME: &str = "dangerzone.rocks/dangerzone";

/// qrexec target that spawns a fresh disposable VM per call.
pub const DEFAULT_DISPVM_TARGET: &str = "@dispvm:dz-dvm";

/// Client used to reach the disposable VM.
pub const DEFAULT_QREXEC_CLIENT: &str = "/usr/bin/qrexec-client-vm";

/// Configuration for sanitising documents.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_safepdf::{ConversionConfig, ProviderKind};
///
/// let config = ConversionConfig::builder()
///     .provider_kind(ProviderKind::Container)
///     .max_dimension(8_000)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Force a provider instead of detecting one. Default: detect.
    ///
    /// Detection picks the disposable-VM provider when the qrexec client is
    /// present (Qubes OS) and the container provider otherwise.
    pub provider_kind: Option<ProviderKind>,

    /// Pre-constructed provider. Takes precedence over `provider_kind`.
    pub provider: Option<Arc<dyn IsolationProvider>>,

    /// Container runtime executable (path or name on `PATH`).
    ///
    /// Falls back to `SAFEPDF_CONTAINER_RUNTIME`, then `podman` on Linux and
    /// `docker` elsewhere.
    pub container_runtime: Option<PathBuf>,

    /// Container image holding the stage code. Default: [`DEFAULT_IMAGE_NAME`].
    pub image_name: String,

    /// Directory with `container.tar.gz` and `image-id.txt`.
    /// Default: [`safepdf_image::resource_dir`].
    pub resource_dir: Option<PathBuf>,

    /// Parent of the per-conversion staging directories.
    /// Default: `<config-dir>/safepdf/tmp`.
    pub staging_root: PathBuf,

    /// qrexec target for the disposable VM. Default: [`DEFAULT_DISPVM_TARGET`].
    pub dispvm_target: String,

    /// qrexec client executable. Default: [`DEFAULT_QREXEC_CLIENT`].
    pub qrexec_client: PathBuf,

    /// Stage-code bundle sent ahead of the document (development mode).
    pub dev_payload: Option<PathBuf>,

    /// Host-side stage-2 program used by the disposable-VM provider.
    /// Default: [`DEFAULT_REASSEMBLER`] on `PATH`.
    pub reassembler: PathBuf,

    /// Arguments placed before the pixel and output directories.
    pub reassembler_args: Vec<String>,

    /// Upper bound for page width and height in pixels. Default: 10 000.
    ///
    /// Bounds the largest page buffer the host will ever allocate
    /// (`max² × 3` bytes, 300 MB at the default).
    pub max_dimension: u16,

    /// Chunk size used when streaming the image archive into `load`.
    /// Default: 10 240 bytes.
    pub image_chunk_size: usize,

    /// Receives progress events and state changes. Default: no-op.
    pub progress_sink: Option<ProgressSinkRef>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            provider_kind: None,
            provider: None,
            container_runtime: None,
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            resource_dir: None,
            staging_root: default_staging_root(),
            dispvm_target: DEFAULT_DISPVM_TARGET.to_string(),
            qrexec_client: PathBuf::from(DEFAULT_QREXEC_CLIENT),
            dev_payload: None,
            reassembler: PathBuf::from(DEFAULT_REASSEMBLER),
            reassembler_args: Vec::new(),
            max_dimension: DEFAULT_MAX_DIMENSION,
            image_chunk_size: DEFAULT_CHUNK_SIZE,
            progress_sink: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("provider_kind", &self.provider_kind)
            .field(
                "provider",
                &self.provider.as_ref().map(|_| "<dyn IsolationProvider>"),
            )
            .field("container_runtime", &self.container_runtime)
            .field("image_name", &self.image_name)
            .field("resource_dir", &self.resource_dir)
            .field("staging_root", &self.staging_root)
            .field("dispvm_target", &self.dispvm_target)
            .field("qrexec_client", &self.qrexec_client)
            .field("dev_payload", &self.dev_payload)
            .field("reassembler", &self.reassembler)
            .field("max_dimension", &self.max_dimension)
            .field("image_chunk_size", &self.image_chunk_size)
            .field(
                "progress_sink",
                &self.progress_sink.as_ref().map(|_| "<dyn ProgressSink>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// The configured sink, or a no-op one.
    pub fn sink(&self) -> ProgressSinkRef {
        self.progress_sink
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressSink))
    }

    /// Resource directory holding the shipped image artifacts.
    pub fn resource_dir(&self) -> PathBuf {
        self.resource_dir
            .clone()
            .unwrap_or_else(safepdf_image::resource_dir)
    }
}

fn default_staging_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("safepdf")
        .join("tmp")
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn provider_kind(mut self, kind: ProviderKind) -> Self {
        self.config.provider_kind = Some(kind);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn IsolationProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn container_runtime(mut self, runtime: impl Into<PathBuf>) -> Self {
        self.config.container_runtime = Some(runtime.into());
        self
    }

    pub fn image_name(mut self, name: impl Into<String>) -> Self {
        self.config.image_name = name.into();
        self
    }

    pub fn resource_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.resource_dir = Some(dir.into());
        self
    }

    pub fn staging_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_root = dir.into();
        self
    }

    pub fn dispvm_target(mut self, target: impl Into<String>) -> Self {
        self.config.dispvm_target = target.into();
        self
    }

    pub fn qrexec_client(mut self, client: impl Into<PathBuf>) -> Self {
        self.config.qrexec_client = client.into();
        self
    }

    pub fn dev_payload(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dev_payload = Some(path.into());
        self
    }

    pub fn reassembler(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.reassembler = program.into();
        self
    }

    pub fn reassembler_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.reassembler_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_dimension(mut self, max: u16) -> Self {
        self.config.max_dimension = max;
        self
    }

    pub fn image_chunk_size(mut self, bytes: usize) -> Self {
        self.config.image_chunk_size = bytes;
        self
    }

    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.config.progress_sink = Some(sink);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, SafePdfError> {
        let c = &self.config;
        if c.max_dimension == 0 {
            return Err(SafePdfError::InvalidConfig(
                "max_dimension must be ≥ 1".into(),
            ));
        }
        if c.image_chunk_size == 0 {
            return Err(SafePdfError::InvalidConfig(
                "image_chunk_size must be ≥ 1".into(),
            ));
        }
        if c.image_name.trim().is_empty() {
            return Err(SafePdfError::InvalidConfig("image_name is empty".into()));
        }
        if c.dispvm_target.trim().is_empty() {
            return Err(SafePdfError::InvalidConfig("dispvm_target is empty".into()));
        }
        if c.staging_root.as_os_str().is_empty() {
            return Err(SafePdfError::InvalidConfig("staging_root is empty".into()));
        }
        Ok(self.config)
    }
}
