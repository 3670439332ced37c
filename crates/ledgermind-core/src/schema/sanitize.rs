//! Content sanitization for inbound events.
//!
//! Layered checks: emptiness, length caps, null bytes, control-character
//! density, Unicode override attacks, HTML stripping, and dangerous URL
//! schemes. Validation failures are never retried.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{MemoryError, Result};

/// Maximum content length in bytes (DoS protection)
pub const MAX_CONTENT_LENGTH: usize = 500_000;

/// Maximum tolerated zero-width characters before rejection
const MAX_ZERO_WIDTH: usize = 10;

/// Bidirectional override code points used in spoofing attacks
const BIDI_OVERRIDES: [char; 6] = [
    '\u{202E}', '\u{202F}', '\u{2066}', '\u{2067}', '\u{2068}', '\u{2069}',
];

/// Zero-width characters that can hide payloads
const ZERO_WIDTH: [char; 4] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

fn html_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->|<[^>]*>").expect("static regex"))
}

fn dangerous_scheme_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(javascript|data|vbscript|mailto|file)\s*:").expect("static regex")
    })
}

/// Sanitize event content, returning the cleaned string.
///
/// All HTML tags and comments are stripped. Rejections surface as
/// [`MemoryError::Validation`].
pub fn sanitize_content(content: &str) -> Result<String> {
    if content.trim().is_empty() {
        return Err(MemoryError::Validation("Content cannot be empty".into()));
    }

    if content.len() > MAX_CONTENT_LENGTH {
        return Err(MemoryError::Validation(format!(
            "Content too long ({} bytes, max {})",
            content.len(),
            MAX_CONTENT_LENGTH
        )));
    }

    if content.contains('\u{0}') {
        return Err(MemoryError::Validation("Content contains null bytes".into()));
    }

    let control_chars = content
        .chars()
        .filter(|c| (*c as u32) < 32 && !matches!(c, '\t' | '\n' | '\r'))
        .count();
    if control_chars * 10 > content.chars().count() {
        return Err(MemoryError::Validation(
            "Content contains too many control characters".into(),
        ));
    }

    if content.chars().any(|c| BIDI_OVERRIDES.contains(&c)) {
        return Err(MemoryError::Validation(
            "Content contains bidirectional override characters".into(),
        ));
    }

    let zero_width = content.chars().filter(|c| ZERO_WIDTH.contains(c)).count();
    if zero_width > MAX_ZERO_WIDTH {
        return Err(MemoryError::Validation(
            "Content contains excessive zero-width characters".into(),
        ));
    }

    // Strip all HTML tags and comments
    let sanitized = html_tag_re().replace_all(content, "").into_owned();

    if dangerous_scheme_re().is_match(&sanitized) {
        return Err(MemoryError::Validation(
            "Content contains dangerous URL scheme".into(),
        ));
    }

    Ok(sanitized)
}

/// Validate a namespace identifier: alphanumeric plus `_` and `-`.
///
/// `"default"` is always accepted.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace == "default" {
        return Ok(());
    }
    if namespace.is_empty()
        || !namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(MemoryError::Validation(format!(
            "Invalid namespace format: {namespace}. Only alphanumeric, underscores, and hyphens allowed."
        )));
    }
    Ok(())
}

/// Reject path-traversal attempts in artifact ids.
pub fn validate_fid(fid: &str) -> Result<()> {
    if fid.contains("..") || fid.starts_with('/') || fid.starts_with('~') {
        return Err(MemoryError::Validation(format!(
            "Invalid file identifier: {fid}"
        )));
    }
    Ok(())
}
