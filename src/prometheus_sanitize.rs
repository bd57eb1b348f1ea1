//! Prometheus metric/label name and value sanitization, shared by the scrape endpoint
//! and the remote-write formatter — the Prometheus data model is identical regardless
//! of which path emits it.
//!
//! Ported near verbatim from the ecosystem's own `metrics-exporter-prometheus`
//! `formatting.rs`, since this is the standard, well-tested implementation of
//! Prometheus's naming rules and there is no reason to deviate from it.

/// Sanitizes a metric name to be valid under the Prometheus data model: first
/// character `[a-zA-Z_:]`, subsequent characters `[a-zA-Z0-9_:]`.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut is_invalid: fn(char) -> bool = invalid_metric_name_start_character;
    for c in name.chars() {
        if is_invalid(c) {
            out.push('_');
        } else {
            out.push(c);
        }
        is_invalid = invalid_metric_name_character;
    }
    out
}

/// Sanitizes a label key: first character `[a-zA-Z_]`, subsequent `[a-zA-Z0-9_]`.
pub fn sanitize_label_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut is_invalid: fn(char) -> bool = invalid_label_key_start_character;
    for c in key.chars() {
        if is_invalid(c) {
            out.push('_');
        } else {
            out.push(c);
        }
        is_invalid = invalid_label_key_character;
    }
    out
}

/// Sanitizes a label value: escapes backslashes, double quotes, and newlines.
pub fn sanitize_label_value(value: &str) -> String {
    sanitize_label_value_or_description(value, false)
}

/// Sanitizes a HELP description: escapes backslashes and newlines, but not quotes.
pub fn sanitize_description(value: &str) -> String {
    sanitize_label_value_or_description(value, true)
}

fn sanitize_label_value_or_description(value: &str, is_desc: bool) -> String {
    let mut sanitized = String::with_capacity(value.len());
    let mut previous_backslash = false;
    for c in value.chars() {
        match c {
            '\n' => sanitized.push_str("\\n"),
            '"' if !is_desc => {
                previous_backslash = false;
                sanitized.push_str("\\\"");
            }
            '\\' => {
                if previous_backslash {
                    sanitized.push_str("\\\\");
                }
                previous_backslash = !previous_backslash;
            }
            c => {
                if previous_backslash {
                    previous_backslash = false;
                    sanitized.push_str("\\\\");
                }
                sanitized.push(c);
            }
        }
    }
    if previous_backslash {
        sanitized.push_str("\\\\");
    }
    sanitized
}

#[inline]
fn invalid_metric_name_start_character(c: char) -> bool {
    !(c.is_ascii_alphabetic() || c == '_' || c == ':')
}

#[inline]
fn invalid_metric_name_character(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[inline]
fn invalid_label_key_start_character(c: char) -> bool {
    !(c.is_ascii_alphabetic() || c == '_')
}

#[inline]
fn invalid_label_key_character(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '_')
}
