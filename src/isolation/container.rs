//! Container provider: both stages run in throwaway, locked-down containers.
//!
//! Every invocation starts a fresh container from the shipped image with:
//!
//! - no network (`--network none`)
//! - a fixed unprivileged user (`-u dangerzone`)
//! - no new privileges and no capabilities (`--cap-drop all`)
//! - removal on exit (`--rm`)
//! - only the mounts the current stage needs
//!
//! Podman additionally maps the container's users into the invoking user's
//! range (`--userns keep-id`). Docker outside Linux runs in a helper VM and
//! gets an explicit `--platform`.
//!
//! ## Image lifecycle
//!
//! [`ContainerProvider::install`] compares the id the runtime reports for
//! the image with `image-id.txt` from the resource directory. Only on a
//! mismatch is the stale image removed and `container.tar.gz` streamed into
//! `<runtime> load`.

use super::exec::{capture, find_program, run_stage, StageCommand};
use super::staging::StagingSession;
use super::{InstallStatus, IsolationProvider, ProviderKind, STAGE_DOCUMENT_TO_PIXELS};
use crate::config::ConversionConfig;
use crate::document::Document;
use crate::error::SafePdfError;
use crate::ocr::OcrSettings;
use crate::pipeline::finalize::{expect_single_output, move_into_place};
use crate::pipeline::pages::validate_pixel_dir;
use crate::pipeline::reassemble::{Reassembler, STAGE_PIXELS_TO_PDF};
use crate::progress::ProgressReporter;
use async_trait::async_trait;
use safepdf_image::ImageArtifacts;
use serde::Serialize;
use std::cell::Cell;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info, warn};

/// Environment variable naming the container runtime executable.
pub const RUNTIME_ENV: &str = "SAFEPDF_CONTAINER_RUNTIME";

/// Unprivileged user the stages run as inside the image.
const CONTAINER_USER: &str = "dangerzone";

/// Entry point of the stage code inside the image.
const STAGE_ENTRYPOINT: [&str; 2] = ["/usr/bin/python3", "/usr/local/bin/dangerzone.py"];

const STAGE_INPUT_NAME: &str = "input_file";

/// Which container tool drives the stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Podman,
    Docker,
}

impl RuntimeKind {
    /// Podman on Linux, Docker everywhere else.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "linux") {
            RuntimeKind::Podman
        } else {
            RuntimeKind::Docker
        }
    }

    pub fn program_name(self) -> &'static str {
        match self {
            RuntimeKind::Podman => "podman",
            RuntimeKind::Docker => "docker",
        }
    }

    fn from_program(program: &Path) -> Option<Self> {
        let name = program.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.contains("podman") {
            Some(RuntimeKind::Podman)
        } else if name.contains("docker") {
            Some(RuntimeKind::Docker)
        } else {
            None
        }
    }
}

/// A resolved container runtime executable.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    kind: RuntimeKind,
    path: PathBuf,
}

impl ContainerRuntime {
    /// Resolve the runtime: explicit `program`, then `SAFEPDF_CONTAINER_RUNTIME`,
    /// then the platform default on `PATH`.
    pub fn resolve(program: Option<&Path>) -> Result<Self, SafePdfError> {
        let requested = program.map(Path::to_path_buf).or_else(|| {
            std::env::var_os(RUNTIME_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        });

        let (kind, program) = match requested {
            Some(p) => (
                RuntimeKind::from_program(&p).unwrap_or_else(RuntimeKind::platform_default),
                p,
            ),
            None => {
                let kind = RuntimeKind::platform_default();
                (kind, PathBuf::from(kind.program_name()))
            }
        };

        let path = find_program(&program).ok_or_else(|| SafePdfError::RuntimeNotFound {
            runtime: program.display().to_string(),
        })?;
        debug!("Container runtime: {:?} at '{}'", kind, path.display());
        Ok(Self { kind, path })
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `run` plus the hardening flags applied to every stage container.
    pub fn security_args(&self) -> Vec<&'static str> {
        let mut args = vec!["run", "--network", "none", "-u", CONTAINER_USER];
        match self.kind {
            RuntimeKind::Podman => {
                args.extend(["--security-opt", "no-new-privileges"]);
                args.extend(["--userns", "keep-id"]);
            }
            RuntimeKind::Docker => {
                args.push("--security-opt=no-new-privileges:true");
                if !cfg!(target_os = "linux") {
                    args.extend(["--platform", "linux/amd64"]);
                }
            }
        }
        args.extend(["--cap-drop", "all", "--rm"]);
        args
    }
}

/// Runs both stages in containers.
#[derive(Debug)]
pub struct ContainerProvider {
    runtime: ContainerRuntime,
    image: String,
    resource_dir: PathBuf,
    staging_root: PathBuf,
    max_dimension: u16,
    chunk_size: usize,
}

impl ContainerProvider {
    /// Resolve the runtime named by `config`. Fails with
    /// [`SafePdfError::RuntimeNotFound`] when it is not installed.
    pub fn from_config(config: &ConversionConfig) -> Result<Self, SafePdfError> {
        let runtime = ContainerRuntime::resolve(config.container_runtime.as_deref())?;
        Self::new(runtime, config)
    }

    pub fn new(runtime: ContainerRuntime, config: &ConversionConfig) -> Result<Self, SafePdfError> {
        // Bind-mount specs are colon separated.
        if config.staging_root.to_string_lossy().contains(':') {
            return Err(SafePdfError::InvalidConfig(format!(
                "staging root '{}' must not contain ':'",
                config.staging_root.display()
            )));
        }
        Ok(Self {
            runtime,
            image: config.image_name.clone(),
            resource_dir: config.resource_dir(),
            staging_root: config.staging_root.clone(),
            max_dimension: config.max_dimension,
            chunk_size: config.image_chunk_size,
        })
    }

    pub fn runtime(&self) -> &ContainerRuntime {
        &self.runtime
    }

    fn stage_command(
        &self,
        stage: &'static str,
        mounts: &[OsString],
        ocr: Option<&OcrSettings>,
    ) -> StageCommand {
        let mut cmd = StageCommand::new(stage, self.runtime.path()).args(self.runtime.security_args());
        for mount in mounts {
            cmd = cmd.arg("-v").arg(mount);
        }
        if let Some(ocr) = ocr {
            for (key, value) in ocr.env_pairs() {
                cmd = cmd.arg("-e").arg(format!("{key}={value}"));
            }
        }
        cmd.arg(&self.image)
            .args(STAGE_ENTRYPOINT)
            .arg(stage)
    }

    fn document_to_pixels(&self, input: &Path, pixel_dir: &Path) -> StageCommand {
        self.stage_command(
            STAGE_DOCUMENT_TO_PIXELS,
            &[
                mount(input, "/tmp/input_file:ro"),
                mount(pixel_dir, "/dangerzone"),
            ],
            None,
        )
    }

    fn pixels_to_pdf(&self, pixel_dir: &Path, safe_dir: &Path, ocr: &OcrSettings) -> StageCommand {
        self.stage_command(
            STAGE_PIXELS_TO_PDF,
            &[mount(pixel_dir, "/dangerzone:ro"), mount(safe_dir, "/safezone")],
            Some(ocr),
        )
    }

    /// Copy the document into the session so only that file is mounted.
    async fn stage_input(&self, input: &Path, session: &StagingSession) -> Result<PathBuf, SafePdfError> {
        let staged = session.path().join(STAGE_INPUT_NAME);
        tokio::fs::copy(input, &staged)
            .await
            .map_err(|_| SafePdfError::InputNotReadable {
                path: input.to_path_buf(),
            })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o644))
                .await
                .map_err(|e| SafePdfError::io(format!("preparing '{}'", staged.display()), e))?;
        }
        Ok(staged)
    }

    /// Ids of the images the runtime currently has under our name.
    async fn installed_image_ids(&self) -> Result<Vec<String>, SafePdfError> {
        let output = capture(
            "image list",
            self.runtime.path(),
            &["image", "list", "--format", "{{.ID}}", self.image.as_str()],
        )
        .await?;
        if !output.status.success() {
            return Err(SafePdfError::StageFailed {
                stage: "image list",
                status: output.status.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Best effort: a leftover image only wastes disk space.
    async fn remove_image(&self, id: &str) {
        match capture("image remove", self.runtime.path(), &["rmi", "--force", id]).await {
            Ok(out) if out.status.success() => info!("Removed stale image {}", id),
            Ok(out) => warn!(
                "Couldn't delete old container image {} ({}): {}",
                id,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => warn!("Couldn't delete old container image {}: {}", id, e),
        }
    }

    /// Stream the decompressed image archive into `<runtime> load`.
    async fn load_image(&self, artifacts: ImageArtifacts) -> Result<u64, SafePdfError> {
        let runtime = self.runtime.path().to_path_buf();
        let chunk_size = self.chunk_size;
        info!("> {} load", runtime.display());

        tokio::task::spawn_blocking(move || -> Result<u64, SafePdfError> {
            let mut child = std::process::Command::new(&runtime)
                .arg("load")
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|source| SafePdfError::SpawnFailed {
                    stage: "image load",
                    source,
                })?;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| SafePdfError::Internal("image load: stdin was not captured".into()))?;

            let next_report = Cell::new(0u64);
            let report = |written: u64| {
                if written >= next_report.get() {
                    debug!("Loaded {} MiB of the container image", written >> 20);
                    next_report.set(written + (64 << 20));
                }
            };
            let streamed = artifacts.stream_into(&mut stdin, chunk_size, Some(&report));
            drop(stdin);

            let status = child
                .wait()
                .map_err(|e| SafePdfError::io("waiting for image load", e))?;
            if !status.success() {
                return Err(SafePdfError::StageFailed {
                    stage: "image load",
                    status: status.to_string(),
                });
            }
            Ok(streamed?)
        })
        .await
        .map_err(|e| SafePdfError::Internal(format!("image load task failed: {e}")))?
    }
}

fn mount(host: &Path, target: &str) -> OsString {
    let mut spec = host.as_os_str().to_os_string();
    spec.push(":");
    spec.push(target);
    spec
}

/// Runtimes report ids with or without the `sha256:` prefix and often
/// truncated to 12 characters.
fn ids_match(reported: &str, expected: &str) -> bool {
    let a = reported.trim().trim_start_matches("sha256:");
    let b = expected.trim().trim_start_matches("sha256:");
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= 12 && long.starts_with(short)
}

#[async_trait]
impl Reassembler for ContainerProvider {
    async fn reassemble(
        &self,
        pixel_dir: &Path,
        safe_dir: &Path,
        ocr: &OcrSettings,
        progress: &ProgressReporter,
    ) -> Result<(), SafePdfError> {
        let cmd = self.pixels_to_pdf(pixel_dir, safe_dir, ocr);
        run_stage(&cmd, progress).await
    }
}

#[async_trait]
impl IsolationProvider for ContainerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Container
    }

    async fn install(&self) -> Result<InstallStatus, SafePdfError> {
        let artifacts = ImageArtifacts::in_dir(&self.resource_dir)?;
        let expected = artifacts.expected_image_id()?;

        let installed = self.installed_image_ids().await?;
        if installed.iter().any(|id| ids_match(id, &expected)) {
            debug!("Container image {} is up to date", expected);
            return Ok(InstallStatus::UpToDate);
        }

        for stale in &installed {
            self.remove_image(stale).await;
        }

        info!("Installing container image {}", expected);
        let bytes = self.load_image(artifacts).await?;
        info!("Streamed {} bytes into the container runtime", bytes);

        let installed = self.installed_image_ids().await?;
        if installed.iter().any(|id| ids_match(id, &expected)) {
            Ok(InstallStatus::Installed)
        } else {
            Err(SafePdfError::InstallFailed { expected })
        }
    }

    async fn convert(
        &self,
        document: &Document,
        ocr: &OcrSettings,
        progress: &ProgressReporter,
    ) -> Result<(), SafePdfError> {
        let mut session = StagingSession::create(&self.staging_root)?;
        session.open_for_container()?;

        let input = self.stage_input(document.input_path(), &session).await?;
        run_stage(&self.document_to_pixels(&input, session.pixel_dir()), progress).await?;

        let pages = validate_pixel_dir(session.pixel_dir(), self.max_dimension).await?;
        info!("[doc {}] stage 1 produced {} page(s)", document.id(), pages);

        self.reassemble(session.pixel_dir(), session.safe_dir(), ocr, progress)
            .await?;

        let produced = expect_single_output(session.safe_dir())?;
        move_into_place(&produced, &document.output_path())
    }
}
