//! JSON extraction utilities for parsing LLM responses.
//!
//! Responses often wrap the JSON payload in markdown fences or surround it
//! with explanatory text. [`extract_json`] tries, in order:
//! 1. The whole (trimmed) response as JSON
//! 2. The contents of each fenced code block
//! 3. The longest JSON object or array that decodes at any offset
//!
//! # Example
//!
//! ```
//! use memo_forge::utils::json_extraction::extract_json;
//!
//! let response = "Here is the result: {\"name\": \"example\", \"value\": 42} Hope it helps.";
//! let json = extract_json(response).unwrap();
//! assert_eq!(json["value"], 42);
//! ```

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn code_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"```[A-Za-z0-9_-]*[ \t]*\r?\n?([\s\S]*?)```").expect("code block regex is valid")
    })
}

/// Extract the JSON payload from an LLM response.
///
/// Returns `None` when no strategy finds a decodable object or array.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Strategy 1: the response is already JSON
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    // Strategy 2: fenced code blocks, first decodable one wins
    for block in code_blocks(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block.trim()) {
            if value.is_object() || value.is_array() {
                return Some(value);
            }
        }
    }

    // Strategy 3: longest value decodable from any opening brace or bracket
    longest_json_value(trimmed)
}

/// Contents of every ``` fenced block in `content`, in order.
pub fn code_blocks(content: &str) -> Vec<&str> {
    code_block_regex()
        .captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}

/// Decode a JSON value starting at every `{` or `[` and keep the one that
/// spans the most bytes. Ties go to the earliest.
pub fn longest_json_value(content: &str) -> Option<Value> {
    let mut best: Option<(usize, Value)> = None;

    for (start, ch) in content.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&content[start..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            let span = stream.byte_offset();
            if best.as_ref().map_or(true, |(len, _)| span > *len) {
                best = Some((span, value));
            }
        }
    }

    best.map(|(_, value)| value)
}

/// Analysis of bracket balance in a piece of text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonStructureAnalysis {
    /// Number of unclosed braces ('{' without matching '}')
    pub unclosed_braces: usize,
    /// Number of unclosed brackets ('[' without matching ']')
    pub unclosed_brackets: usize,
    /// Whether we ended inside a string literal
    pub in_string: bool,
}

impl JsonStructureAnalysis {
    /// True if the text opens structures it never closes.
    pub fn is_truncated(&self) -> bool {
        self.unclosed_braces > 0 || self.unclosed_brackets > 0 || self.in_string
    }
}

/// Scan `s` from its first `{` or `[` and track nesting depth, ignoring
/// brackets inside string literals.
///
/// Used to tell a response cut off by a token limit apart from one that
/// never contained JSON.
pub fn analyze_json_structure(s: &str) -> JsonStructureAnalysis {
    let Some(start) = s.find(['{', '[']) else {
        return JsonStructureAnalysis::default();
    };

    let mut braces: usize = 0;
    let mut brackets: usize = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in s[start..].chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => braces += 1,
            '}' if !in_string => braces = braces.saturating_sub(1),
            '[' if !in_string => brackets += 1,
            ']' if !in_string => brackets = brackets.saturating_sub(1),
            _ => {}
        }
    }

    JsonStructureAnalysis {
        unclosed_braces: braces,
        unclosed_brackets: brackets,
        in_string,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_object() {
        assert_eq!(extract_json(r#"  {"a": 1}  "#), Some(json!({"a": 1})));
    }

    #[test]
    fn test_direct_array() {
        assert_eq!(extract_json("[1, 2, 3]"), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_bare_scalar_is_not_extracted() {
        assert_eq!(extract_json("42"), None);
        assert_eq!(extract_json(r#""just text""#), None);
    }

    #[test]
    fn test_json_code_block() {
        let response = "Sure!\n```json\n{\"title\": \"x\", \"tags\": [\"a\"]}\n```\nDone.";
        assert_eq!(
            extract_json(response),
            Some(json!({"title": "x", "tags": ["a"]}))
        );
    }

    #[test]
    fn test_generic_code_block() {
        let response = "Result:\n```\n[{\"q\": 1}]\n```";
        assert_eq!(extract_json(response), Some(json!([{"q": 1}])));
    }

    #[test]
    fn test_skips_non_json_code_block() {
        let response = "```python\nprint('hi')\n```\n```json\n{\"ok\": true}\n```";
        assert_eq!(extract_json(response), Some(json!({"ok": true})));
    }

    #[test]
    fn test_embedded_in_prose_picks_longest() {
        let response = r#"For example {"a": 1} is small, but the answer is {"question": "q", "answer": "a", "evidence": [1, 2]} as requested."#;
        assert_eq!(
            extract_json(response),
            Some(json!({"question": "q", "answer": "a", "evidence": [1, 2]}))
        );
    }

    #[test]
    fn test_braces_inside_strings() {
        let response = r#"Output: {"code": "fn main() { println!(\"}\"); }"}"#;
        assert_eq!(
            extract_json(response),
            Some(json!({"code": "fn main() { println!(\"}\"); }"}))
        );
    }

    #[test]
    fn test_no_json() {
        assert_eq!(extract_json("I cannot help with that."), None);
        assert_eq!(extract_json(""), None);
    }

    #[test]
    fn test_truncated_json_is_not_extracted() {
        let response = r#"{"questions": [{"q": "one"}, {"q": "tw"#;
        assert_eq!(extract_json(response), Some(json!({"q": "one"})));
        let analysis = analyze_json_structure(response);
        assert!(analysis.is_truncated());
        assert_eq!(analysis.unclosed_braces, 2);
        assert_eq!(analysis.unclosed_brackets, 1);
        assert!(analysis.in_string);
    }

    #[test]
    fn test_complete_structure_is_not_truncated() {
        let analysis = analyze_json_structure(r#"text {"a": "[{"} more"#);
        assert!(!analysis.is_truncated());
        assert!(!analyze_json_structure("no json").is_truncated());
    }

    #[test]
    fn test_code_blocks_in_order() {
        let blocks = code_blocks("```a\none\n```\ntext\n```\ntwo\n```");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].trim(), "one");
        assert_eq!(blocks[1].trim(), "two");
    }
}
