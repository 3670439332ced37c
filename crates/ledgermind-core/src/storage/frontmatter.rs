//! Artifact codec - YAML front-matter plus Markdown body.
//!
//! Every semantic artifact is a single self-describing text blob:
//! front-matter between `---` lines followed by a free-form body. The
//! parser tolerates pure-YAML legacy files with no delimiters.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Parsed artifact front-matter
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArtifactDocument {
    /// Event kind that produced this artifact
    #[serde(default)]
    pub kind: String,
    /// Producer
    #[serde(default)]
    pub source: String,
    /// Sanitized content line
    #[serde(default)]
    pub content: String,
    /// Creation timestamp (RFC 3339; legacy naive timestamps tolerated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Schema version for forward migration
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Context map (decision / proposal / stream fields)
    #[serde(default)]
    pub context: Value,
}

fn default_schema_version() -> u32 {
    1
}

impl ArtifactDocument {
    /// The parsed timestamp, when present and well-formed
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }

    /// Read a string field from the context map
    pub fn context_str(&self, field: &str) -> Option<&str> {
        self.context.get(field).and_then(|v| v.as_str())
    }

    /// Read a string list from the context map
    pub fn context_list(&self, field: &str) -> Vec<String> {
        self.context
            .get(field)
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parse an RFC 3339 timestamp, tolerating naive legacy values
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Legacy artifacts carry naive ISO timestamps with no offset
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Split an artifact blob into front-matter and body.
///
/// Returns `(None, content)` when no parseable front-matter is found.
pub fn parse(content: &str) -> (Option<ArtifactDocument>, String) {
    if let Some(rest) = content.strip_prefix("---") {
        let rest = rest.strip_prefix('\n').unwrap_or(rest);
        if let Some(end) = rest.find("\n---") {
            let front = &rest[..end];
            let body = rest[end + 4..].trim_start_matches('\n').trim();
            match serde_yaml::from_str::<ArtifactDocument>(front) {
                Ok(doc) => return (Some(doc), body.to_string()),
                Err(_) => return (None, body.to_string()),
            }
        }
    }
    // Backward compatibility: pure-YAML files with no delimiters
    match serde_yaml::from_str::<ArtifactDocument>(content) {
        Ok(doc) if !doc.kind.is_empty() || doc.context.is_object() => (Some(doc), String::new()),
        _ => (None, content.to_string()),
    }
}

/// Serialize front-matter and body into a single artifact blob
pub fn stringify(doc: &ArtifactDocument, body: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(doc)?;
    Ok(format!("---\n{}---\n\n{}", yaml, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_doc() -> ArtifactDocument {
        ArtifactDocument {
            kind: "decision".into(),
            source: "agent".into(),
            content: "Use tabs".into(),
            timestamp: Some("2026-07-01T12:00:00+00:00".into()),
            schema_version: 1,
            context: json!({
                "title": "Use tabs",
                "target": "style",
                "status": "active",
                "rationale": "Align with team convention.",
                "namespace": "default",
                "supersedes": [],
            }),
        }
    }

    #[test]
    fn test_roundtrip_preserves_fields() {
        let doc = sample_doc();
        let blob = stringify(&doc, "# Use tabs\n\nRecorded from source: agent").unwrap();
        let (parsed, body) = parse(&blob);
        let parsed = parsed.unwrap();
        assert_eq!(parsed.kind, "decision");
        assert_eq!(parsed.context_str("target"), Some("style"));
        assert_eq!(parsed.context_str("status"), Some("active"));
        assert!(body.starts_with("# Use tabs"));
        assert!(parsed.parsed_timestamp().is_some());
    }

    #[test]
    fn test_pure_yaml_legacy_file() {
        let legacy = "kind: decision\ncontent: old record\ncontext:\n  target: style\n";
        let (parsed, body) = parse(legacy);
        let parsed = parsed.unwrap();
        assert_eq!(parsed.kind, "decision");
        assert_eq!(parsed.context_str("target"), Some("style"));
        assert!(body.is_empty());
    }

    #[test]
    fn test_garbage_yields_none() {
        let (parsed, body) = parse("just some markdown\nwith lines");
        assert!(parsed.is_none());
        assert_eq!(body, "just some markdown\nwith lines");
    }

    #[test]
    fn test_corrupted_frontmatter_yields_none() {
        let (parsed, _) = parse("---\n{invalid: yaml: here\n---\n\nbody");
        assert!(parsed.is_none());
    }

    #[test]
    fn test_naive_timestamp_tolerated() {
        assert!(parse_timestamp("2026-07-01T12:00:00.123456").is_some());
        assert!(parse_timestamp("2026-07-01 12:00:00").is_some());
        assert!(parse_timestamp("not a date").is_none());
    }

    #[test]
    fn test_context_list() {
        let doc = ArtifactDocument {
            context: json!({"supersedes": ["a.md", "b.md"]}),
            ..Default::default()
        };
        assert_eq!(doc.context_list("supersedes"), vec!["a.md", "b.md"]);
        assert!(doc.context_list("missing").is_empty());
    }
}
