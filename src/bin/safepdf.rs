//! CLI binary for edgequake-safepdf.
//!
//! A thin shim over the library crate that maps CLI flags to `Document`s
//! and a `ConversionConfig`, and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_safepdf::{
    convert_documents, ConversionConfig, ConversionReport, Document, DocumentId, DocumentState,
    OcrLanguage, ProgressEvent, ProgressSink, ProviderKind,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress sink using indicatif ────────────────────────────────────────

/// Terminal progress sink: one bar tracking the percentage of the document
/// currently in flight, plus a log line per finished document.
struct CliProgressSink {
    bar: ProgressBar,
    /// Display names, keyed by document id.
    names: HashMap<DocumentId, String>,
    /// Wall-clock start per document, for elapsed reporting.
    start_times: Mutex<HashMap<DocumentId, Instant>>,
    total: usize,
    done: AtomicUsize,
}

impl CliProgressSink {
    fn new(documents: &[Document]) -> Arc<Self> {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.set_message("Checking isolation provider…");
        bar.enable_steady_tick(Duration::from_millis(80));

        let names = documents
            .iter()
            .map(|d| {
                let name = d
                    .input_path()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| d.input_path().display().to_string());
                (d.id(), name)
            })
            .collect();

        Arc::new(Self {
            bar,
            names,
            start_times: Mutex::new(HashMap::new()),
            total: documents.len(),
            done: AtomicUsize::new(0),
        })
    }

    fn name(&self, doc: DocumentId) -> &str {
        self.names.get(&doc).map(String::as_str).unwrap_or("?")
    }

    fn elapsed(&self, doc: DocumentId) -> String {
        let secs = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut t| t.remove(&doc))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        format!("{secs:.1}s")
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for CliProgressSink {
    fn on_progress(&self, doc: DocumentId, event: &ProgressEvent) {
        if event.error {
            self.bar
                .println(format!("  {} {}  {}", red("✗"), self.name(doc), red(&event.text)));
            return;
        }
        if event.percentage >= 0.0 {
            self.bar.set_position(event.percentage.min(100.0) as u64);
        }
        self.bar.set_message(event.text.clone());
    }

    fn on_state_change(&self, doc: DocumentId, state: DocumentState) {
        match state {
            DocumentState::Converting => {
                if let Ok(mut t) = self.start_times.lock() {
                    t.insert(doc, Instant::now());
                }
                let n = self.done.load(Ordering::SeqCst) + 1;
                self.bar.set_prefix(format!("[{n}/{}] {}", self.total, self.name(doc)));
                self.bar.set_position(0);
                self.bar.reset_eta();
            }
            DocumentState::Safe => {
                self.done.fetch_add(1, Ordering::SeqCst);
                self.bar.println(format!(
                    "  {} {:<32}  {}",
                    green("✓"),
                    self.name(doc),
                    dim(&self.elapsed(doc)),
                ));
            }
            DocumentState::Failed => {
                self.done.fetch_add(1, Ordering::SeqCst);
                self.bar.println(format!(
                    "  {} {:<32}  {}",
                    red("✗"),
                    self.name(doc),
                    dim(&self.elapsed(doc)),
                ));
            }
            DocumentState::Unconverted => {}
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Sanitise one document next to the original (invoice-safe.pdf)
  safepdf invoice.docx

  # Choose the output file name
  safepdf --output-filename clean.pdf scan.pdf

  # Add an OCR text layer (Tesseract language codes, joined with +)
  safepdf --ocr-lang eng+deu letter.pdf

  # Sanitise a batch and move the originals into ./unsafe/
  safepdf --archive *.pdf

  # Machine-readable report
  safepdf --json --no-progress report.pdf > report.json

PROVIDERS:
  container   Both stages in throwaway containers (podman on Linux, docker
              elsewhere). The image is loaded on first run.
  dispvm      Stage 1 in a Qubes disposable VM, stage 2 on this host.
  Default: dispvm when qrexec-client-vm is installed, container otherwise.

ENVIRONMENT VARIABLES:
  SAFEPDF_CONTAINER_RUNTIME  Container runtime executable (path or name)
  SAFEPDF_RESOURCE_DIR       Directory holding container.tar.gz and image-id.txt
  RUST_LOG                   Override the log filter (e.g. edgequake_safepdf=debug)
"#;

/// Convert untrusted documents into safe PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "safepdf",
    version,
    about = "Convert untrusted documents into safe PDFs",
    long_about = "Convert potentially dangerous documents (PDF, office files, images) into \
safe PDFs. Each page is rendered to raw pixels inside a network-less container or a \
disposable VM, then a new PDF is built from those pixels alone, optionally with OCR.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Documents to sanitise.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Safe PDF path (only with a single input). Default: <name>-safe.pdf.
    #[arg(long)]
    output_filename: Option<PathBuf>,

    /// OCR language code(s), e.g. eng or eng+deu. Default: no OCR.
    #[arg(long, env = "SAFEPDF_OCR_LANG", value_parser = parse_ocr_lang)]
    ocr_lang: Option<OcrLanguage>,

    /// Move originals into an `unsafe/` directory after conversion.
    #[arg(long)]
    archive: bool,

    /// Isolation provider: container or dispvm. Default: detected.
    #[arg(long, env = "SAFEPDF_PROVIDER", value_parser = parse_provider)]
    provider: Option<ProviderKind>,

    /// Container runtime executable (podman or docker).
    #[arg(long, env = "SAFEPDF_CONTAINER_RUNTIME")]
    runtime: Option<PathBuf>,

    /// Print a JSON conversion report on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "SAFEPDF_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SAFEPDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SAFEPDF_QUIET")]
    quiet: bool,
}

fn parse_ocr_lang(s: &str) -> std::result::Result<OcrLanguage, String> {
    s.parse().map_err(|e: edgequake_safepdf::SafePdfError| e.to_string())
}

fn parse_provider(s: &str) -> std::result::Result<ProviderKind, String> {
    s.parse().map_err(|e: edgequake_safepdf::SafePdfError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs unless --verbose.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Documents ────────────────────────────────────────────────────────
    let mut documents = build_documents(&cli)?;

    // ── Build config ─────────────────────────────────────────────────────
    let sink = if show_progress {
        Some(CliProgressSink::new(&documents))
    } else {
        None
    };
    let config = build_config(&cli, sink.clone())?;

    // ── Run conversion ───────────────────────────────────────────────────
    let result = convert_documents(&mut documents, &config).await;
    if let Some(ref s) = sink {
        s.finish();
    }
    let report = result.context("Conversion failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&report);
    }

    if !report.all_safe() {
        std::process::exit(1);
    }
    Ok(())
}

/// Validate inputs and per-document options up front.
fn build_documents(cli: &Cli) -> Result<Vec<Document>> {
    if cli.output_filename.is_some() && cli.inputs.len() > 1 {
        anyhow::bail!("--output-filename can only be used with a single input document");
    }

    cli.inputs
        .iter()
        .map(|input| {
            let mut doc = Document::new(input)
                .with_context(|| format!("Cannot use {:?}", input))?
                .with_ocr_language(cli.ocr_lang.clone())
                .with_archive(cli.archive);
            if let Some(ref out) = cli.output_filename {
                doc = doc
                    .with_output(out)
                    .with_context(|| format!("Cannot write to {:?}", out))?;
            } else {
                doc.validate_output()
                    .with_context(|| format!("Cannot write a safe copy of {:?}", input))?;
            }
            Ok(doc)
        })
        .collect()
}

/// Map CLI args to `ConversionConfig`.
fn build_config(cli: &Cli, sink: Option<Arc<CliProgressSink>>) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder();
    if let Some(kind) = cli.provider {
        builder = builder.provider_kind(kind);
    }
    if let Some(ref runtime) = cli.runtime {
        builder = builder.container_runtime(runtime);
    }
    if let Some(sink) = sink {
        builder = builder.progress_sink(sink as Arc<dyn ProgressSink>);
    }
    builder.build().context("Invalid configuration")
}

fn print_summary(report: &ConversionReport) {
    for doc in report.documents.iter().filter(|d| !d.is_safe() || d.error.is_some()) {
        eprintln!(
            "{} {}  {}",
            red("✘"),
            bold(&doc.input.display().to_string()),
            red(doc.error.as_deref().unwrap_or("not converted")),
        );
    }
    for doc in report.documents.iter().filter(|d| d.is_safe()) {
        eprintln!("   {} {}", dim("→"), doc.output.display());
    }

    let total = report.documents.len();
    if report.failed == 0 {
        eprintln!(
            "{} {} document(s) converted safely  {}",
            green("✔"),
            bold(&report.safe.to_string()),
            dim(&format!("{}ms", report.duration_ms)),
        );
    } else {
        eprintln!(
            "{} {}/{} document(s) converted  ({} failed)  {}",
            if report.safe == 0 { red("✘") } else { cyan("⚠") },
            bold(&report.safe.to_string()),
            total,
            red(&report.failed.to_string()),
            dim(&format!("{}ms", report.duration_ms)),
        );
    }
}
