//! Turns the free-form text a vision model returns into a [`Caption`].
//!
//! Models asked for "JSON only" still wrap their answer in Markdown fences
//! often enough that extraction is tried in a fixed order: a fence labelled
//! `json`, any fence, then the raw text.

use crate::models::caption::{
    Caption, FAILED_DESCRIPTION, INCOMPLETE_DESCRIPTION, fallback_title,
};
use serde_json::Value;
use tracing::warn;

/// Longest slice of an unparseable response kept as a description.
pub const RAW_EXCERPT_CHARS: usize = 500;

const FENCE: &str = "```";
const LABELED_FENCE: &str = "```json";

/// Strategies for locating the JSON payload inside a model response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extraction {
    /// Text between "```json" and the next fence.
    LabeledFence,
    /// Text between the first two fences, minus a bare language tag line.
    GenericFence,
    /// The whole response, trimmed.
    Raw,
}

impl Extraction {
    pub const ORDER: [Extraction; 3] = [
        Extraction::LabeledFence,
        Extraction::GenericFence,
        Extraction::Raw,
    ];

    /// Returns `None` when the strategy does not apply to `text`.
    pub fn apply(self, text: &str) -> Option<&str> {
        match self {
            Extraction::LabeledFence => {
                let (_, rest) = text.split_once(LABELED_FENCE)?;
                Some(up_to_fence(rest).trim())
            }
            Extraction::GenericFence => {
                let (_, rest) = text.split_once(FENCE)?;
                Some(strip_language_tag(up_to_fence(rest)).trim())
            }
            Extraction::Raw => Some(text.trim()),
        }
    }
}

fn up_to_fence(text: &str) -> &str {
    text.split(FENCE).next().unwrap_or(text)
}

fn strip_language_tag(inner: &str) -> &str {
    match inner.split_once('\n') {
        Some((tag, body)) if is_language_tag(tag.trim()) => body,
        _ => inner,
    }
}

fn is_language_tag(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Locate the JSON text in a response with the first applicable strategy.
pub fn extract_json_text(text: &str) -> (Extraction, &str) {
    Extraction::ORDER
        .iter()
        .find_map(|strategy| strategy.apply(text).map(|found| (*strategy, found)))
        .unwrap_or((Extraction::Raw, text.trim()))
}

/// Parse a model response into a caption, never failing.
///
/// Unparseable JSON keeps an excerpt of the raw answer as the description;
/// JSON without usable `title`/`description` strings gets a generic one.
pub fn parse_caption(raw: &str, filename: &str) -> Caption {
    let (strategy, text) = extract_json_text(raw);

    match serde_json::from_str::<Value>(text) {
        Ok(value) => match (string_field(&value, "title"), string_field(&value, "description")) {
            (Some(title), Some(description)) => Caption::new(title, description),
            _ => {
                warn!(
                    ?strategy,
                    "caption response for {} is missing required fields", filename
                );
                Caption::new(fallback_title(filename), INCOMPLETE_DESCRIPTION)
            }
        },
        Err(err) => {
            warn!(
                ?strategy,
                "could not parse caption response for {} as JSON: {}: {}...",
                filename,
                err,
                raw.chars().take(100).collect::<String>()
            );
            Caption::new(fallback_title(filename), raw_excerpt(raw))
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn raw_excerpt(raw: &str) -> String {
    let excerpt: String = raw.chars().take(RAW_EXCERPT_CHARS).collect();
    if excerpt.trim().is_empty() {
        FAILED_DESCRIPTION.to_string()
    } else {
        excerpt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INNER: &str = r#"{"title": "Sleepy cat", "description": "A cat asleep on a sofa."}"#;

    #[test]
    fn all_wrappings_extract_the_same_payload() {
        let labeled = format!("Here you go:\n```json\n{}\n```\nEnjoy", INNER);
        let generic = format!("```\n{}\n```", INNER);
        let raw = format!("  {}  \n", INNER);

        assert_eq!(extract_json_text(&labeled), (Extraction::LabeledFence, INNER));
        assert_eq!(extract_json_text(&generic), (Extraction::GenericFence, INNER));
        assert_eq!(extract_json_text(&raw), (Extraction::Raw, INNER));

        let expected = Caption::new("Sleepy cat", "A cat asleep on a sofa.");
        for text in [&labeled, &generic, &raw] {
            assert_eq!(parse_caption(text, "cat.png"), expected);
        }
    }

    #[test]
    fn generic_fence_drops_other_language_tags() {
        let upper = format!("```JSON\n{}\n```", INNER);
        assert_eq!(extract_json_text(&upper), (Extraction::GenericFence, INNER));
    }

    #[test]
    fn unterminated_fence_takes_the_rest() {
        let text = format!("```json\n{}", INNER);
        assert_eq!(extract_json_text(&text).1, INNER);
    }

    #[test]
    fn malformed_json_keeps_raw_excerpt() {
        let caption = parse_caption("I think this is a cat.", "cat.png");
        assert_eq!(caption.title, "Image: cat.png");
        assert_eq!(caption.description, "I think this is a cat.");
    }

    #[test]
    fn excerpt_is_capped() {
        let long = "x".repeat(2_000);
        let caption = parse_caption(&long, "cat.png");
        assert_eq!(caption.description.chars().count(), RAW_EXCERPT_CHARS);
    }

    #[test]
    fn blank_response_uses_failure_text() {
        let caption = parse_caption("   ", "cat.png");
        assert_eq!(caption, Caption::fallback("cat.png"));
    }

    #[test]
    fn missing_or_unusable_fields_use_generic_description() {
        for text in [
            r#"{"title": "Only a title"}"#,
            r#"{"title": 3, "description": "numbers are not titles"}"#,
            r#"{"title": "  ", "description": "blank title"}"#,
            r#"["title", "description"]"#,
        ] {
            let caption = parse_caption(text, "cat.png");
            assert_eq!(
                caption,
                Caption::new("Image: cat.png", INCOMPLETE_DESCRIPTION),
                "{text}"
            );
        }
    }

    #[test]
    fn extra_fields_are_ignored() {
        let caption = parse_caption(
            r#"{"title": "t", "description": "d", "tags": ["x"]}"#,
            "cat.png",
        );
        assert_eq!(caption, Caption::new("t", "d"));
    }
}
