//! Extraction of the JSON payload from agent stdout.
//!
//! Agentic runs interleave exploration noise ("Explored...", "exec rg ...")
//! with the final answer, so the payload is recovered in order of
//! preference: fenced ```json block, first parseable top-level object,
//! outermost brace slice.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)```json\s*([\s\S]*?)\s*```").expect("static regex"))
}

/// Find a JSON object in free-form agent output. Returns the parsed object,
/// or `None` when no object can be recovered.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(caps) = fenced_json_re().captures(s) {
        if let Ok(value) = serde_json::from_str::<Value>(caps[1].trim()) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    // Scan for the first '{' that starts a parseable object.
    for (offset, _) in s.match_indices('{') {
        let tail = &s[offset..];
        let mut stream = serde_json::Deserializer::from_str(tail).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    // Outermost brace slice as a last resort.
    let (l, r) = (s.find('{')?, s.rfind('}')?);
    if r > l {
        if let Ok(value) = serde_json::from_str::<Value>(&s[l..=r]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_block() {
        let text = "Explored src/...\n```json\n{\"schema_version\":\"1.0\",\"vulnerabilities\":[]}\n```\ndone";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["schema_version"], "1.0");
    }

    #[test]
    fn extracts_first_object_from_noise() {
        let text = "exec rg -n transfer { nope\n{\"status\": \"false_positive\", \"confidence\": \"high\"}\ntrailing";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["status"], "false_positive");
    }

    #[test]
    fn rejects_arrays_and_garbage() {
        assert!(extract_json_object("[1, 2, 3]").is_none());
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("").is_none());
    }

    #[test]
    fn nested_objects_parse_whole() {
        let text = r#"{"outer": {"inner": [1, 2]}, "k": "v"}"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["outer"]["inner"][0], 1);
    }
}
