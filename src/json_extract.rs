//! Embedded JSON sub-document extraction
//!
//! Site pages ship their initial state as a JSON object inside a `<script>`
//! tag. [`extract_json`] finds that object with a regex anchor and parses it,
//! recovering once from trailing markup the parser refuses.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// Outcome of [`extract_json`]
///
/// Extraction never fails past this boundary; callers must check for
/// [`ExtractedJson::Error`] before treating the result as data.
#[derive(Clone, Debug, PartialEq)]
pub enum ExtractedJson {
    /// A structurally valid JSON document
    Document(Value),
    /// Sentinel carrying a diagnostic message
    Error {
        /// What went wrong
        message: String,
    },
}

impl ExtractedJson {
    /// Whether this is the sentinel error document
    pub fn is_error(&self) -> bool {
        matches!(self, ExtractedJson::Error { .. })
    }

    /// Convert into a `Result`, mapping the sentinel to [`Error::Parse`]
    pub fn into_result(self) -> Result<Value> {
        match self {
            ExtractedJson::Document(value) => Ok(value),
            ExtractedJson::Error { message } => Err(Error::Parse(message)),
        }
    }

    /// Deserialize the document into `T`
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.into_result()?;
        serde_json::from_value(value).map_err(|e| Error::Parse(e.to_string()))
    }

    fn error(message: impl Into<String>) -> Self {
        ExtractedJson::Error {
            message: message.into(),
        }
    }
}

/// Extract the JSON object that starts at the last `{` of the first `anchor` match
///
/// On a "trailing characters" failure the input is cut at the offset the
/// parser reported and parsed one more time.
pub fn extract_json(text: &str, anchor: &Regex) -> ExtractedJson {
    let Some(found) = anchor.find(text) else {
        return ExtractedJson::error(format!("anchor /{}/ not found", anchor.as_str()));
    };

    let start = match found.as_str().rfind('{') {
        Some(brace) => found.start() + brace,
        None => found.end(),
    };
    let candidate = &text[start..];

    match serde_json::from_str::<Value>(candidate) {
        Ok(value) => ExtractedJson::Document(value),
        Err(e) if is_trailing_garbage(&e) => {
            let cut = error_offset(candidate, e.line(), e.column());
            tracing::debug!(
                offset = start + cut,
                "Trailing data after embedded JSON, truncating and retrying"
            );
            match serde_json::from_str::<Value>(&candidate[..cut]) {
                Ok(value) => ExtractedJson::Document(value),
                Err(e) => ExtractedJson::error(format!("embedded JSON still invalid: {}", e)),
            }
        }
        Err(e) => ExtractedJson::error(format!("embedded JSON invalid: {}", e)),
    }
}

fn is_trailing_garbage(e: &serde_json::Error) -> bool {
    e.is_syntax() && e.to_string().starts_with("trailing characters")
}

/// Byte offset of the first trailing character.
///
/// serde_json reports a 1-based line and a column one past the offending byte.
fn error_offset(text: &str, line: usize, column: usize) -> usize {
    let line_start = text
        .match_indices('\n')
        .nth(line.saturating_sub(2))
        .filter(|_| line > 1)
        .map(|(idx, _)| idx + 1)
        .unwrap_or(0);

    let mut offset = (line_start + column.saturating_sub(1)).min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn anchor() -> Regex {
        Regex::new(r#"id="preload-data"[^>]*>\s*\{"#).unwrap()
    }

    #[test]
    fn extracts_object_following_anchor() {
        let html = r#"<html><script id="preload-data" type="application/json">{"post": {"id": 7}}</script>"#;

        // the closing </script> is trailing garbage, so this exercises the retry
        let result = extract_json(html, &anchor());

        assert_eq!(result, ExtractedJson::Document(json!({"post": {"id": 7}})));
    }

    #[test]
    fn clean_document_parses_first_time() {
        let text = r#"id="preload-data"> {"a": [1, 2, 3]}"#;

        let result = extract_json(text, &anchor());

        assert_eq!(result.into_result().unwrap(), json!({"a": [1, 2, 3]}));
    }

    #[test]
    fn trailing_garbage_on_later_line_is_cut() {
        let text = "<div id=\"preload-data\">{\n  \"name\": \"caf\u{e9}\",\n  \"n\": 1\n}\n;window.x = 1;</div>";

        let result = extract_json(text, &anchor());

        assert_eq!(
            result,
            ExtractedJson::Document(json!({"name": "caf\u{e9}", "n": 1}))
        );
    }

    #[test]
    fn missing_anchor_returns_sentinel() {
        let result = extract_json("<html><body>nothing here</body></html>", &anchor());

        assert!(result.is_error());
        match result.into_result() {
            Err(Error::Parse(message)) => assert!(message.contains("not found")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn malformed_document_returns_sentinel() {
        let result = extract_json(r#"id="preload-data">{"a": [1, 2"#, &anchor());

        assert!(result.is_error());
    }

    #[test]
    fn garbage_inside_document_is_not_recovered() {
        let result = extract_json(r#"id="preload-data">{"a": 1 oops}"#, &anchor());

        assert!(result.is_error());
    }

    #[test]
    fn only_first_match_is_used() {
        let text = r#"id="preload-data">{"first": true} <p id="preload-data">{"first": false}"#;

        let result = extract_json(text, &anchor()).into_result().unwrap();

        assert_eq!(result, json!({"first": true}));
    }

    #[test]
    fn large_payload_is_handled() {
        let padding = "<p>filler</p>".repeat(200_000);
        let text = format!(r#"{padding}<script id="preload-data">{{"ok": 1}}</script>{padding}"#);

        let result = extract_json(&text, &anchor());

        assert_eq!(result, ExtractedJson::Document(json!({"ok": 1})));
    }

    #[test]
    fn typed_extraction() {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            ok: u32,
        }

        let wrapper: Wrapper = extract_json(r#"id="preload-data">{"ok": 3}"#, &anchor())
            .into_typed()
            .unwrap();

        assert_eq!(wrapper.ok, 3);
    }
}
