//! OCR language codes and the stage-2 OCR settings derived from them.
//!
//! OCR is the only stage option the host forwards into isolation. The
//! language code ends up as a value in the reassembler's environment, so it
//! is validated against a tight character set before it leaves the host.

use crate::error::SafePdfError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// One or more Tesseract language codes joined with `+`, e.g. `eng`,
/// `chi_sim`, `eng+deu`.
static RE_LANGUAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_]{2,32}(\+[A-Za-z_]{2,32}){0,7}$").unwrap());

/// A validated OCR language code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OcrLanguage(String);

impl OcrLanguage {
    pub fn new(code: impl Into<String>) -> Result<Self, SafePdfError> {
        let code = code.into();
        if RE_LANGUAGE.is_match(&code) {
            Ok(Self(code))
        } else {
            Err(SafePdfError::InvalidOcrLanguage { code })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for OcrLanguage {
    type Err = SafePdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.trim())
    }
}

impl fmt::Display for OcrLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Explicit OCR configuration handed to stage 2.
///
/// Passed as a value into each stage invocation; never written into the
/// host process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OcrSettings {
    language: Option<OcrLanguage>,
}

impl OcrSettings {
    pub fn new(language: Option<OcrLanguage>) -> Self {
        Self { language }
    }

    pub fn enabled(&self) -> bool {
        self.language.is_some()
    }

    pub fn language(&self) -> Option<&OcrLanguage> {
        self.language.as_ref()
    }

    /// Share of the overall progress taken by stage 1.
    ///
    /// With OCR the second stage does substantial work and gets half the bar.
    pub fn stage1_share(&self) -> f64 {
        if self.enabled() {
            50.0
        } else {
            100.0
        }
    }

    /// `(name, value)` pairs understood by the reassembler.
    pub fn env_pairs(&self) -> [(&'static str, String); 2] {
        [
            ("OCR", if self.enabled() { "1" } else { "0" }.to_string()),
            (
                "OCR_LANGUAGE",
                self.language
                    .as_ref()
                    .map(|l| l.as_str().to_string())
                    .unwrap_or_default(),
            ),
        ]
    }
}
