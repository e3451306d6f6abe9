//! Progress events and the sink trait that receives them.
//!
//! Inject an [`Arc<dyn ProgressSink>`] via
//! [`crate::config::ConversionConfigBuilder::progress_sink`] to receive every
//! event the isolated stages report, in arrival order.
//!
//! # Why a sink instead of a channel?
//!
//! Events are delivered synchronously while the stage output is being read,
//! one line or frame at a time, so a slow consumer applies back-pressure to
//! the isolated process instead of growing an unbounded queue on the host.
//! Callers that want a channel can forward from their sink into one.
//!
//! # Example
//!
//! ```rust
//! use edgequake_safepdf::{ConversionConfig, DocumentId, ProgressEvent, ProgressSink};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingSink {
//!     errors: AtomicUsize,
//! }
//!
//! impl ProgressSink for CountingSink {
//!     fn on_progress(&self, doc: DocumentId, event: &ProgressEvent) {
//!         if event.error {
//!             self.errors.fetch_add(1, Ordering::SeqCst);
//!         }
//!         eprintln!("[doc {doc}] {:.0}% {}", event.percentage, event.text);
//!     }
//! }
//!
//! let sink = Arc::new(CountingSink { errors: AtomicUsize::new(0) });
//! let config = ConversionConfig::builder()
//!     .progress_sink(sink as Arc<dyn ProgressSink>)
//!     .build()
//!     .unwrap();
//! ```

use crate::document::{DocumentId, DocumentState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// One status report from an isolated stage.
///
/// `percentage` is `0.0..=100.0` for regular events and `-1.0` for events
/// synthesised from output the host could not decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub error: bool,
    pub text: String,
    pub percentage: f64,
}

impl ProgressEvent {
    pub fn new(text: impl Into<String>, percentage: f64) -> Self {
        Self {
            error: false,
            text: text.into(),
            percentage,
        }
    }

    pub fn failure(text: impl Into<String>, percentage: f64) -> Self {
        Self {
            error: true,
            text: text.into(),
            percentage,
        }
    }
}

/// Receives progress events and document state changes.
///
/// Implementations must be `Send + Sync`: several documents may be in flight
/// when the provider allows parallel conversions. Events for one document
/// always arrive in order. All methods default to no-ops.
pub trait ProgressSink: Send + Sync {
    /// Called for every event a stage reports, including synthesised
    /// `error = true` events for undecodable output.
    fn on_progress(&self, doc: DocumentId, event: &ProgressEvent) {
        let _ = (doc, event);
    }

    /// Called after the pipeline moved a document into a new state.
    fn on_state_change(&self, doc: DocumentId, state: DocumentState) {
        let _ = (doc, state);
    }
}

/// A no-op sink for callers that don't need progress events.
///
/// This is the default when no sink is configured.
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressSinkRef = Arc<dyn ProgressSink>;

/// Binds a sink to one document, logging every event on the way through.
#[derive(Clone)]
pub struct ProgressReporter {
    doc: DocumentId,
    sink: ProgressSinkRef,
}

impl ProgressReporter {
    pub fn new(doc: DocumentId, sink: ProgressSinkRef) -> Self {
        Self { doc, sink }
    }

    pub fn document(&self) -> DocumentId {
        self.doc
    }

    pub fn emit(&self, event: ProgressEvent) {
        if event.error {
            error!("[doc {}] {}% {}", self.doc, event.percentage, event.text);
        } else {
            info!("[doc {}] {}% {}", self.doc, event.percentage, event.text);
        }
        self.sink.on_progress(self.doc, &event);
    }

    pub(crate) fn state_changed(&self, state: DocumentState) {
        self.sink.on_state_change(self.doc, state);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("doc", &self.doc)
            .field("sink", &"<dyn ProgressSink>")
            .finish()
    }
}
