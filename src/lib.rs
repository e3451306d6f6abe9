//! # edgequake-safepdf
//!
//! Turn untrusted documents into safe PDFs by rendering them to raw pixels
//! inside an isolated execution context and rebuilding a PDF from nothing
//! but those pixels.
//!
//! ## Why this crate?
//!
//! A document can carry scripts, embedded files, tracking beacons or
//! exploits for the viewer that opens it. Scrubbing those out in place means
//! trusting a parser with hostile input. Instead this crate never parses the
//! document on the host: a throwaway container (or a Qubes disposable VM)
//! renders every page to RGB pixels, and a second isolated stage turns those
//! pixels back into a PDF, optionally with an OCR text layer. Whatever the
//! original contained, only pixels cross the boundary.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Validate  input readable, output location writable
//!  ├─ 2. Install   container image loaded and verified (once per run)
//!  ├─ 3. Stage 1   document-to-pixels, isolated, no network
//!  ├─ 4. Check     page count, dimensions and byte lengths bounded
//!  ├─ 5. Stage 2   pixels-to-pdf (+ OCR), isolated or on the host
//!  └─ 6. Output    <name>-safe.pdf placed atomically, original archived
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_safepdf::{convert, ConversionConfig, Document, OcrLanguage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected: disposable VMs on Qubes, containers elsewhere.
//!     let config = ConversionConfig::default();
//!     let mut doc = Document::new("invoice.docx")?
//!         .with_ocr_language(Some(OcrLanguage::new("eng")?));
//!     convert(&mut doc, &config).await?;
//!     println!("safe copy: {}", doc.output_path().display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `safepdf` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-safepdf = { version = "0.1", default-features = false }
//! ```
//!
//! ## Choosing a Provider
//!
//! | Provider | Stage 1 | Stage 2 | Needs |
//! |----------|---------|---------|-------|
//! | `container` | container | container | podman (Linux) or docker |
//! | `dispvm` | disposable VM | host reassembler | Qubes OS, `qrexec-client-vm` |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod document;
pub mod error;
pub mod isolation;
pub mod ocr;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod protocol;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionConfig, ConversionConfigBuilder};
pub use convert::{convert, convert_documents, convert_sync, convert_with_provider};
pub use document::{Document, DocumentId, DocumentState};
pub use error::{ErrorKind, ProtocolError, SafePdfError};
pub use isolation::{build_provider, InstallStatus, IsolationProvider, ProviderKind};
pub use ocr::{OcrLanguage, OcrSettings};
pub use output::{ConversionReport, DocumentOutcome};
pub use progress::{NoopProgressSink, ProgressEvent, ProgressReporter, ProgressSink, ProgressSinkRef};
