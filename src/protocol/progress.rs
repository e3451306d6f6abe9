//! Line-oriented progress records emitted by the container stages.
//!
//! Each line of combined stdout/stderr is one JSON object:
//!
//! ```json
//! {"error": false, "text": "Converting page 3/12 to pixels", "percentage": 21.5}
//! ```
//!
//! Anything else is surfaced as an error event instead of being dropped, and
//! the stream keeps going.

use crate::progress::ProgressEvent;

/// Longest stage-supplied text forwarded to sinks, in characters.
pub const MAX_TEXT_CHARS: usize = 1024;

/// Longest progress line kept from a stage, in bytes. The remainder of a
/// longer line is drained without being stored.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Decode one progress line. Never fails.
///
/// Undecodable input becomes `(error=true, text="invalid output: <line>",
/// percentage=-1)`.
pub fn parse_line(line: &str) -> ProgressEvent {
    match serde_json::from_str::<ProgressEvent>(line.trim_end_matches('\r')) {
        Ok(mut event) if event.percentage.is_finite() => {
            event.text = sanitize(&event.text);
            event
        }
        _ => invalid_output(line),
    }
}

/// The event reported for output that is not a progress record.
pub fn invalid_output(line: &str) -> ProgressEvent {
    ProgressEvent::failure(format!("invalid output: {}", sanitize(line)), -1.0)
}

/// Replace control characters and cap the length of untrusted text so it
/// cannot forge log lines or terminal escapes.
pub(crate) fn sanitize(text: &str) -> String {
    let mut out: String = text
        .chars()
        .take(MAX_TEXT_CHARS)
        .map(|c| if c.is_control() { '\u{FFFD}' } else { c })
        .collect();
    if text.chars().nth(MAX_TEXT_CHARS).is_some() {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_regular_record() {
        let e = parse_line(r#"{"error": false, "text": "Converting page 1/2", "percentage": 25.0}"#);
        assert!(!e.error);
        assert_eq!(e.text, "Converting page 1/2");
        assert_eq!(e.percentage, 25.0);
    }

    #[test]
    fn decodes_error_record_and_integer_percentage() {
        let e = parse_line(r#"{"error": true, "text": "LibreOffice crashed", "percentage": 40}"#);
        assert!(e.error);
        assert_eq!(e.percentage, 40.0);
    }

    #[test]
    fn malformed_line_becomes_error_event() {
        let e = parse_line("Segmentation fault (core dumped)");
        assert!(e.error);
        assert_eq!(e.percentage, -1.0);
        assert_eq!(e.text, "invalid output: Segmentation fault (core dumped)");
    }

    #[test]
    fn missing_field_is_invalid() {
        let e = parse_line(r#"{"error": false, "text": "no percentage"}"#);
        assert!(e.error);
        assert!(e.text.starts_with("invalid output: "));
    }

    #[test]
    fn percentage_regression_is_accepted() {
        let a = parse_line(r#"{"error": false, "text": "a", "percentage": 80}"#);
        let b = parse_line(r#"{"error": false, "text": "b", "percentage": 10}"#);
        assert!(!a.error && !b.error);
        assert!(b.percentage < a.percentage);
    }

    #[test]
    fn carriage_return_is_tolerated() {
        let e = parse_line("{\"error\": false, \"text\": \"x\", \"percentage\": 1}\r");
        assert!(!e.error);
    }

    #[test]
    fn control_characters_are_neutralised() {
        let e = parse_line(r#"{"error": false, "text": "\u001b[2Jgone", "percentage": 5}"#);
        assert_eq!(e.text, "\u{FFFD}[2Jgone");

        let e = parse_line("bad\u{7}line");
        assert_eq!(e.text, "invalid output: bad\u{FFFD}line");
    }

    #[test]
    fn long_text_is_capped() {
        let long = "x".repeat(MAX_TEXT_CHARS * 2);
        let e = parse_line(&long);
        assert!(e.text.ends_with('…'));
        assert!(e.text.chars().count() <= MAX_TEXT_CHARS + "invalid output: ".len() + 1);
    }
}
