//! Child-process plumbing shared by both providers.
//!
//! Every stage invocation goes through [`run_stage`]: the command line is
//! logged, the process is spawned with `kill_on_drop` so an abandoned
//! conversion never leaves it running, and its combined stdout/stderr is
//! decoded line by line into progress events. Lines are capped at
//! [`MAX_LINE_BYTES`]; the host never holds more than that per stream.

use crate::error::SafePdfError;
use crate::progress::ProgressReporter;
use crate::protocol::progress::{invalid_output, parse_line, MAX_LINE_BYTES};
use futures::stream::{self, Stream};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// A fully assembled stage invocation.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub stage: &'static str,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Extra variables for the child only. The host environment is untouched.
    pub envs: Vec<(OsString, OsString)>,
}

impl StageCommand {
    pub fn new(stage: &'static str, program: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Human-readable, shell-quoted form for logs.
    pub fn display(&self) -> String {
        quote_command(&self.program, &self.args)
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .kill_on_drop(true);
        cmd
    }
}

/// Run a stage to completion, forwarding each output line as a progress event.
///
/// Succeeds only if the process exits with status 0. Output is consumed
/// while the process runs, one line at a time.
pub async fn run_stage(cmd: &StageCommand, progress: &ProgressReporter) -> Result<(), SafePdfError> {
    info!("> {}", cmd.display());

    let mut child = cmd
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SafePdfError::SpawnFailed {
            stage: cmd.stage,
            source,
        })?;

    let stdout = child.stdout.take().ok_or_else(|| {
        SafePdfError::Internal(format!("{}: stdout was not captured", cmd.stage))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        SafePdfError::Internal(format!("{}: stderr was not captured", cmd.stage))
    })?;

    let lines = bounded_lines(stdout).merge(bounded_lines(stderr));
    tokio::pin!(lines);

    while let Some(line) = lines.next().await {
        match line {
            Ok(StageLine::Text(line)) if line.trim().is_empty() => continue,
            Ok(StageLine::Text(line)) => progress.emit(parse_line(&line)),
            Ok(StageLine::NotUtf8) => progress.emit(invalid_output("<non-UTF-8 data>")),
            Ok(StageLine::Overlong) => {
                warn!("{}: discarded a line longer than {} bytes", cmd.stage, MAX_LINE_BYTES);
                progress.emit(invalid_output(&format!(
                    "<line longer than {MAX_LINE_BYTES} bytes>"
                )));
            }
            Err(e) => {
                warn!("{}: stopped reading output: {}", cmd.stage, e);
                break;
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| SafePdfError::io(format!("waiting for {}", cmd.stage), e))?;
    debug!("{} exited with {}", cmd.stage, status);

    if status.success() {
        Ok(())
    } else {
        Err(SafePdfError::StageFailed {
            stage: cmd.stage,
            status: status.to_string(),
        })
    }
}

// ── Bounded line reading ─────────────────────────────────────────────────────

/// One line of stage output.
#[derive(Debug, PartialEq)]
enum StageLine {
    Text(String),
    NotUtf8,
    /// Longer than [`MAX_LINE_BYTES`]; its content was dropped.
    Overlong,
}

fn bounded_lines<R>(reader: R) -> impl Stream<Item = std::io::Result<StageLine>>
where
    R: AsyncRead + Unpin,
{
    stream::unfold(Some(BufReader::new(reader)), |state| async move {
        let mut reader = state?;
        match read_bounded_line(&mut reader).await {
            Ok(Some(line)) => Some((Ok(line), Some(reader))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
}

/// Read up to the next `\n` (or EOF), keeping at most [`MAX_LINE_BYTES`].
///
/// Returns `None` at EOF. Bytes past the cap are consumed from the reader
/// and thrown away, so memory stays bounded whatever the child writes.
async fn read_bounded_line<R>(reader: &mut R) -> std::io::Result<Option<StageLine>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut overlong = false;
    let mut read_any = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if !read_any {
                return Ok(None);
            }
            break;
        }
        read_any = true;

        let (chunk, used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..i], i + 1, true),
            None => (available, available.len(), false),
        };
        let keep = chunk.len().min(MAX_LINE_BYTES - buf.len());
        buf.extend_from_slice(&chunk[..keep]);
        overlong |= keep < chunk.len();

        reader.consume(used);
        if done {
            break;
        }
    }

    if overlong {
        return Ok(Some(StageLine::Overlong));
    }
    Ok(Some(match String::from_utf8(buf) {
        Ok(text) => StageLine::Text(text),
        Err(_) => StageLine::NotUtf8,
    }))
}

/// Run a short helper command and capture its output.
pub async fn capture(
    stage: &'static str,
    program: &Path,
    args: &[&str],
) -> Result<std::process::Output, SafePdfError> {
    let args: Vec<OsString> = args.iter().map(OsString::from).collect();
    info!("> {}", quote_command(program, &args));
    Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| SafePdfError::SpawnFailed { stage, source })
}

// ── Program lookup ───────────────────────────────────────────────────────────

/// Resolve `name` to an executable path.
///
/// Names containing a path separator are taken as paths; bare names are
/// searched for in `PATH`.
pub fn find_program(name: impl AsRef<Path>) -> Option<PathBuf> {
    find_program_in(name.as_ref(), std::env::var_os("PATH"))
}

fn find_program_in(name: &Path, path_var: Option<OsString>) -> Option<PathBuf> {
    if name.components().count() > 1 {
        return is_executable(name).then(|| name.to_path_buf());
    }
    std::env::split_paths(&path_var?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

// ── Logging helpers ──────────────────────────────────────────────────────────

fn quote_command(program: &Path, args: &[OsString]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(OsString::as_os_str))
        .map(|a| shell_quote(&a.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%{}".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
