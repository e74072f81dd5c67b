use colored::Colorize;
use serde_json::Value;
use similar::{ChangeTag, TextDiff};

use crate::canonical::encode_value;

/// One `"key":value` line per top-level field of a canonical JSON object,
/// encoded exactly as it appears in the hashed bytes. Input that is not an
/// object is returned unchanged.
pub fn field_lines(canonical_json: &str) -> String {
    match serde_json::from_str::<Value>(canonical_json) {
        Ok(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| format!("{}:{}", encode_value(&Value::String(k.clone())), encode_value(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => canonical_json.to_string(),
    }
}

pub fn format_canonical_diff(old_json: &str, new_json: &str) -> String {
    let old_lines = field_lines(old_json);
    let new_lines = field_lines(new_json);
    let diff = TextDiff::from_lines(&old_lines, &new_lines);
    let mut output = String::new();

    output.push_str(&"───────────────────────────────────────\n".dimmed().to_string());

    for change in diff.iter_all_changes() {
        let line = change.to_string();
        let formatted = match change.tag() {
            ChangeTag::Delete => format!("- {}", line.trim_end()).red().to_string(),
            ChangeTag::Insert => format!("+ {}", line.trim_end()).green().to_string(),
            ChangeTag::Equal => format!("  {}", line.trim_end()),
        };
        output.push_str(&formatted);
        output.push('\n');
    }

    output.push_str(&"───────────────────────────────────────".dimmed().to_string());

    output
}

/// Byte comparison; canonical strings carry no insignificant whitespace.
pub fn has_changes(old_json: &str, new_json: &str) -> bool {
    old_json != new_json
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_lines_keep_order() {
        let lines = field_lines(r#"{"bottle_id":"coco1514","store":"Paris-5","ts":1700050000}"#);
        assert_eq!(lines, "\"bottle_id\":\"coco1514\"\n\"store\":\"Paris-5\"\n\"ts\":1700050000");
    }

    #[test]
    fn test_field_lines_escape_like_encoder() {
        let lines = field_lines(r#"{"vineyard":"Château"}"#);
        assert_eq!(lines, r#""vineyard":"Ch\u00e2teau""#);
    }

    #[test]
    fn test_has_changes_is_exact() {
        assert!(has_changes(r#"{"a":1}"#, r#"{"a":1} "#));
        assert!(!has_changes(r#"{"a":1}"#, r#"{"a":1}"#));
    }

    #[test]
    fn test_format_diff_shows_changed_field() {
        colored::control::set_override(false);
        let old = r#"{"bottle_id":"coco1514","store":"Paris-5","ts":1700050000}"#;
        let new = r#"{"bottle_id":"coco1514","store":"Paris-6","ts":1700050000}"#;
        let diff = format_canonical_diff(old, new);
        assert!(diff.contains("- \"store\":\"Paris-5\""));
        assert!(diff.contains("+ \"store\":\"Paris-6\""));
        assert!(diff.contains("  \"ts\":1700050000"));
    }
}
