//! Turn one agent's raw review output into [`Finding`]s.
//!
//! Structured output (a JSON list of records, or an object wrapping one) is
//! preferred. Anything else is segmented into text blocks and classified with
//! the keyword heuristics. Normalization never fails: unusable input yields an
//! empty list.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::finding::{Category, Finding, Severity};
use crate::core::heuristics::{
    BlockStyle, category_from_text, extract_location, severity_from_text, split_blocks,
    truncate_chars,
};

/// Raw agent output after a first look at its shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    /// Parsed JSON array or object.
    Structured(Value),
    Unstructured(String),
}

impl RawOutput {
    /// Classify raw output. A single surrounding markdown code fence is ignored.
    pub fn classify(raw: &str) -> Self {
        let body = strip_code_fence(raw.trim());
        match serde_json::from_str::<Value>(body) {
            Ok(value @ (Value::Array(_) | Value::Object(_))) => Self::Structured(value),
            _ => Self::Unstructured(raw.to_string()),
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop the info string (e.g. `json`) on the opening fence line.
    match body.split_once('\n') {
        Some((_, inner)) => inner.trim(),
        None => text,
    }
}

/// Field aliases and text segmentation for one agent's output conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialect {
    pub container_keys: &'static [&'static str],
    pub description_keys: &'static [&'static str],
    pub category_keys: &'static [&'static str],
    pub severity_keys: &'static [&'static str],
    pub file_keys: &'static [&'static str],
    pub line_keys: &'static [&'static str],
    pub suggestion_keys: &'static [&'static str],
    pub block_style: BlockStyle,
}

const GENERIC: Dialect = Dialect {
    container_keys: &["findings", "issues", "results"],
    description_keys: &["description", "message", "issue"],
    category_keys: &["category", "type"],
    severity_keys: &["severity", "priority"],
    file_keys: &["file", "path"],
    line_keys: &["line", "line_number"],
    suggestion_keys: &["suggestion", "fix"],
    block_style: BlockStyle::Sections,
};

impl Dialect {
    pub fn for_agent(agent: &str) -> Self {
        match agent {
            "gemini" => Self {
                description_keys: &["message", "description", "issue"],
                category_keys: &["type", "category"],
                file_keys: &["path", "file"],
                block_style: BlockStyle::JoinedBullets,
                ..GENERIC
            },
            "codex" => Self {
                container_keys: &["issues", "findings", "results"],
                description_keys: &["issue", "description", "message"],
                suggestion_keys: &["fix", "suggestion"],
                block_style: BlockStyle::Bullets,
                ..GENERIC
            },
            _ => GENERIC,
        }
    }

    fn records<'a>(&self, value: &'a Value) -> Option<&'a [Value]> {
        match value {
            Value::Array(items) => Some(items),
            Value::Object(map) => self
                .container_keys
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_array))
                .map(Vec::as_slice),
            _ => None,
        }
    }
}

/// Tunables for normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Text blocks shorter than this many characters are discarded.
    pub min_block_chars: usize,
    pub max_description_chars: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            min_block_chars: 20,
            max_description_chars: 500,
        }
    }
}

/// Normalize raw output produced by `source`.
pub fn normalize(source: &str, raw: &str, opts: &NormalizeOptions) -> Vec<Finding> {
    let dialect = Dialect::for_agent(source);
    if let RawOutput::Structured(value) = RawOutput::classify(raw)
        && let Some(records) = dialect.records(&value)
    {
        return records
            .iter()
            .filter_map(|record| record.as_object())
            .map(|record| from_record(source, record, &dialect, opts))
            .collect();
    }
    from_text(source, raw, dialect.block_style, opts)
}

fn from_record(
    source: &str,
    record: &Map<String, Value>,
    dialect: &Dialect,
    opts: &NormalizeOptions,
) -> Finding {
    let description = match string_field(record, dialect.description_keys) {
        Some(text) => text.to_string(),
        None => Value::Object(record.clone()).to_string(),
    };
    let description = truncate_chars(&description, opts.max_description_chars);

    let severity = string_field(record, dialect.severity_keys)
        .and_then(|label| Severity::from_label(label).or_else(|| severity_from_text(label)))
        .or_else(|| severity_from_text(&description))
        .unwrap_or(Severity::Trivial);
    let category = string_field(record, dialect.category_keys)
        .and_then(|label| Category::from_label(label).or_else(|| category_from_text(label)))
        .or_else(|| category_from_text(&description))
        .unwrap_or(Category::BestPractices);

    let (file, line) = match string_field(record, dialect.file_keys) {
        Some(file) => (Some(file.to_string()), line_field(record, dialect.line_keys)),
        None => extract_location(&description),
    };

    Finding {
        id: Uuid::new_v4().to_string(),
        source: source.to_string(),
        category,
        severity,
        file,
        line,
        description,
        suggestion: string_field(record, dialect.suggestion_keys).map(str::to_string),
    }
}

fn from_text(source: &str, raw: &str, style: BlockStyle, opts: &NormalizeOptions) -> Vec<Finding> {
    split_blocks(raw, style)
        .into_iter()
        .filter(|block| block.chars().count() >= opts.min_block_chars)
        .map(|block| {
            let (file, line) = extract_location(&block);
            Finding {
                id: Uuid::new_v4().to_string(),
                source: source.to_string(),
                category: category_from_text(&block).unwrap_or(Category::BestPractices),
                severity: severity_from_text(&block).unwrap_or(Severity::Trivial),
                file,
                line,
                description: truncate_chars(&block, opts.max_description_chars),
                suggestion: None,
            }
        })
        .collect()
}

/// First non-empty string value among `keys`.
fn string_field<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| record.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

/// Positive line number given as a JSON number or a numeric string.
fn line_field(record: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find_map(|value| match value {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse::<u32>().ok(),
            _ => None,
        })
        .filter(|line| *line > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> NormalizeOptions {
        NormalizeOptions::default()
    }

    #[test]
    fn classify_detects_fenced_json() {
        let raw = "```json\n[{\"description\": \"x\"}]\n```";
        assert!(matches!(RawOutput::classify(raw), RawOutput::Structured(_)));
        assert!(matches!(
            RawOutput::classify("plain words"),
            RawOutput::Unstructured(_)
        ));
        assert!(matches!(RawOutput::classify("42"), RawOutput::Unstructured(_)));
    }

    #[test]
    fn explicit_fields_are_preserved() {
        let raw = r#"{"findings": [{"description": "Token logged in plain text",
            "category": "security", "severity": "minor", "file": "src/auth.rs", "line": 12,
            "suggestion": "Redact the token"}]}"#;
        let findings = normalize("claude", raw, &opts());
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.source, "claude");
        assert_eq!(f.category, Category::Security);
        assert_eq!(f.severity, Severity::Minor);
        assert_eq!(f.file.as_deref(), Some("src/auth.rs"));
        assert_eq!(f.line, Some(12));
        assert_eq!(f.suggestion.as_deref(), Some("Redact the token"));
    }

    #[test]
    fn non_enum_labels_are_mapped_through_keywords() {
        let raw = r#"[{"description": "Loop rebuilds the index on every call", "severity": "high", "category": "perf/cache"}]"#;
        let findings = normalize("claude", raw, &opts());
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].category, Category::Performance);
    }

    #[test]
    fn codex_issue_and_fix_aliases() {
        let raw = r#"{"issues": [{"issue": "Duplicate validation logic in api/users.py:30", "fix": "Extract helper"}]}"#;
        let findings = normalize("codex", raw, &opts());
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.category, Category::Quality);
        assert_eq!(f.file.as_deref(), Some("api/users.py"));
        assert_eq!(f.line, Some(30));
        assert_eq!(f.suggestion.as_deref(), Some("Extract helper"));
    }

    #[test]
    fn gemini_message_type_path_aliases() {
        let raw = r#"{"findings": [{"message": "Possible XSS", "type": "security", "path": "web/view.tsx", "line": "0"}]}"#;
        let findings = normalize("gemini", raw, &opts());
        let f = &findings[0];
        assert_eq!(f.description, "Possible XSS");
        assert_eq!(f.category, Category::Security);
        assert_eq!(f.file.as_deref(), Some("web/view.tsx"));
        assert_eq!(f.line, None);
    }

    #[test]
    fn non_record_items_are_skipped() {
        let raw = r#"[1, "text", null, {"description": "Unused import in main.rs"}]"#;
        let findings = normalize("claude", raw, &opts());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].file.as_deref(), Some("main.rs"));
    }

    #[test]
    fn record_without_description_uses_record_text() {
        let raw = r#"[{"severity": "major", "file": "a.rs"}]"#;
        let findings = normalize("claude", raw, &opts());
        assert_eq!(findings[0].severity, Severity::Major);
        assert!(findings[0].description.contains("a.rs"));
    }

    #[test]
    fn unrecognized_json_object_falls_back_to_text() {
        let raw = r#"{"summary": "critical security issue found in src/login.rs:9 during review"}"#;
        let findings = normalize("claude", raw, &opts());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].category, Category::Security);
    }

    #[test]
    fn free_text_uses_heuristics() {
        let raw = "## SQL injection\nUser input is concatenated into the query at db/query.py:42. This is critical.\n\n## Nit\nok";
        let findings = normalize("claude", raw, &opts());
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.severity, Severity::Critical);
        assert_eq!(f.category, Category::Security);
        assert_eq!(f.file.as_deref(), Some("db/query.py"));
        assert_eq!(f.line, Some(42));
        assert_eq!(f.suggestion, None);
    }

    #[test]
    fn short_blocks_are_discarded() {
        let raw = "- too short\n- also tiny";
        assert!(normalize("codex", raw, &opts()).is_empty());
    }

    #[test]
    fn long_descriptions_are_truncated() {
        let long = "x".repeat(900);
        let findings = normalize("unknown-agent", &long, &opts());
        assert_eq!(findings[0].description.chars().count(), 500);
    }

    #[test]
    fn empty_output_yields_nothing() {
        assert!(normalize("claude", "", &opts()).is_empty());
        assert!(normalize("claude", "[]", &opts()).is_empty());
    }
}
