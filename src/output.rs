//! Output capture: harvesting text and image payloads from cell outputs.
//!
//! A cell records an ordered list of output fragments. Each fragment either
//! carries stream text directly (`text`) or a mime bundle (`data`) mapping
//! mime types to encoded payloads. Capture walks the fragments in execution
//! order, concatenates the textual content, collects image payloads, and
//! finally applies an optional hard length cut to the concatenated text.
//!
//! Pure and synchronous; the handlers decide which cells get inspected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{ImageFormat, ImagePayload};

/// Default maximum length of captured text, in characters.
pub const DEFAULT_MAX_OUTPUT_LENGTH: usize = 1500;

/// Mime-bundle key used as the textual fallback when a fragment has no
/// direct `text` field.
const TEXT_PLAIN: &str = "text/plain";

/// One recorded output fragment of a cell.
///
/// This is the subset of a Jupyter output the bridge cares about: stream
/// text, and mime-bundle entries for plain text and the supported image
/// encodings. Unrecognized mime types ride along in `data` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputItem {
    /// Direct text payload (stream-style outputs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Mime bundle (execute_result / display_data style outputs).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
}

impl OutputItem {
    /// A stream-style fragment carrying text directly.
    pub fn stream(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            data: HashMap::new(),
        }
    }

    /// A mime-bundle fragment with a single entry.
    pub fn mime(mime_type: impl Into<String>, payload: impl Into<String>) -> Self {
        let mut data = HashMap::new();
        data.insert(mime_type.into(), payload.into());
        Self { text: None, data }
    }

    /// Add a mime-bundle entry to this fragment.
    pub fn with_mime(mut self, mime_type: impl Into<String>, payload: impl Into<String>) -> Self {
        self.data.insert(mime_type.into(), payload.into());
        self
    }
}

/// Output harvested from one cell. Built fresh per command and never mutated
/// after being attached to a response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub text: String,
    pub is_truncated: bool,
    pub images: Vec<ImagePayload>,
}

impl CapturedOutput {
    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }
}

/// Capture text and images from a cell's output fragments.
///
/// Text: for each fragment, the direct `text` field verbatim if present,
/// otherwise the `text/plain` bundle entry. Images: independently, for each
/// fragment, each supported encoding in fixed order (png, jpeg, svg).
/// Truncation applies to the full concatenation: a hard character cut to
/// exactly `max_length`, no ellipsis.
pub fn capture(outputs: &[OutputItem], max_length: Option<usize>) -> CapturedOutput {
    let mut text = String::new();
    let mut images = Vec::new();

    for fragment in outputs {
        if let Some(t) = &fragment.text {
            text.push_str(t);
        } else if let Some(plain) = fragment.data.get(TEXT_PLAIN) {
            text.push_str(plain);
        }

        for format in ImageFormat::ALL {
            if let Some(payload) = fragment.data.get(format.mime_type()) {
                images.push(ImagePayload {
                    format,
                    data: payload.clone(),
                });
            }
        }
    }

    let mut is_truncated = false;
    if let Some(max) = max_length {
        if text.chars().count() > max {
            text = text.chars().take(max).collect();
            is_truncated = true;
        }
    }

    CapturedOutput {
        text,
        is_truncated,
        images,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_outputs_yield_empty_capture() {
        let captured = capture(&[], Some(DEFAULT_MAX_OUTPUT_LENGTH));
        assert_eq!(captured.text, "");
        assert!(!captured.is_truncated);
        assert!(!captured.has_images());
    }

    #[test]
    fn test_stream_text_taken_verbatim() {
        let outputs = vec![OutputItem::stream("hello\n"), OutputItem::stream("world")];
        let captured = capture(&outputs, None);
        assert_eq!(captured.text, "hello\nworld");
        assert!(!captured.is_truncated);
    }

    #[test]
    fn test_text_plain_fallback_when_no_direct_text() {
        let outputs = vec![OutputItem::mime(TEXT_PLAIN, "42")];
        let captured = capture(&outputs, None);
        assert_eq!(captured.text, "42");
    }

    #[test]
    fn test_direct_text_wins_over_text_plain() {
        let mut fragment = OutputItem::stream("stream wins");
        fragment.data.insert(TEXT_PLAIN.into(), "bundle loses".into());
        let captured = capture(&[fragment], None);
        assert_eq!(captured.text, "stream wins");
    }

    #[test]
    fn test_concatenation_happens_before_truncation() {
        // 3 fragments of 600 chars: the cut applies to the 1800-char whole,
        // not per fragment.
        let outputs = vec![
            OutputItem::stream("a".repeat(600)),
            OutputItem::stream("b".repeat(600)),
            OutputItem::stream("c".repeat(600)),
        ];
        let captured = capture(&outputs, Some(1500));
        assert_eq!(captured.text.chars().count(), 1500);
        assert!(captured.is_truncated);
        assert!(captured.text.starts_with(&"a".repeat(600)));
        assert!(captured.text.ends_with(&"c".repeat(300)));
    }

    #[test]
    fn test_truncation_exact_boundary() {
        let outputs = vec![OutputItem::stream("a".repeat(1500))];
        let captured = capture(&outputs, Some(1500));
        assert_eq!(captured.text.len(), 1500);
        assert!(!captured.is_truncated);
    }

    #[test]
    fn test_truncation_over_limit() {
        let outputs = vec![OutputItem::stream("a".repeat(2000))];
        let captured = capture(&outputs, Some(1500));
        assert_eq!(captured.text, "a".repeat(1500));
        assert!(captured.is_truncated);
    }

    #[test]
    fn test_truncation_counts_characters_not_bytes() {
        let outputs = vec![OutputItem::stream("é".repeat(10))];
        let captured = capture(&outputs, Some(4));
        assert_eq!(captured.text.chars().count(), 4);
        assert_eq!(captured.text, "éééé");
        assert!(captured.is_truncated);
    }

    #[test]
    fn test_no_max_length_means_no_cut() {
        let outputs = vec![OutputItem::stream("x".repeat(5000))];
        let captured = capture(&outputs, None);
        assert_eq!(captured.text.len(), 5000);
        assert!(!captured.is_truncated);
    }

    #[test]
    fn test_image_order_within_fragment_is_png_jpeg_svg() {
        let fragment = OutputItem::mime("image/svg+xml", "<svg/>")
            .with_mime("image/png", "PNGDATA")
            .with_mime("image/jpeg", "JPEGDATA");
        let captured = capture(&[fragment], None);
        let formats: Vec<ImageFormat> = captured.images.iter().map(|i| i.format).collect();
        assert_eq!(
            formats,
            vec![ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Svg]
        );
    }

    #[test]
    fn test_fragment_order_preserved_across_images() {
        let outputs = vec![
            OutputItem::mime("image/svg+xml", "first"),
            OutputItem::mime("image/png", "second"),
        ];
        let captured = capture(&outputs, None);
        assert_eq!(captured.images[0].data, "first");
        assert_eq!(captured.images[0].format, ImageFormat::Svg);
        assert_eq!(captured.images[1].data, "second");
        assert_eq!(captured.images[1].format, ImageFormat::Png);
    }

    #[test]
    fn test_text_and_images_collected_independently() {
        let fragment = OutputItem::stream("a plot\n").with_mime("image/png", "PNGDATA");
        let captured = capture(&[fragment], Some(100));
        assert_eq!(captured.text, "a plot\n");
        assert_eq!(captured.images.len(), 1);
        assert!(captured.has_images());
    }

    #[test]
    fn test_unrecognized_mime_types_are_ignored() {
        let fragment = OutputItem::mime("text/html", "<b>bold</b>");
        let captured = capture(&[fragment], None);
        assert_eq!(captured.text, "");
        assert!(captured.images.is_empty());
    }
}
