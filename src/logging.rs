//! Log redaction: every record that might carry request/response data —
//! headers, form bodies, formatted error text — is passed through
//! `redact()` before it reaches `tracing`, so a stray `Authorization` header
//! or `client_secret` form field never lands in a log sink verbatim.

use std::collections::HashMap;

const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "cookie",
    "password",
    "client_secret",
    "access_token",
    "refresh_token",
    "code_verifier",
];

const MASK: &str = "[redacted]";

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key.trim()))
}

/// Redacts sensitive entries from a header (or form-field) map before it's
/// attached to a log record.
pub fn redact_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            if is_sensitive_key(k) {
                (k.clone(), MASK.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

/// Redacts `key: value` / `key=value` / `"key":"value"` occurrences of a
/// sensitive key inside freeform text, such as a formatted error message
/// that embeds an upstream response body. Best-effort: it does not parse the
/// surrounding structure, only scans each `,`/`&`/`;`-delimited segment of a
/// line for a recognized key followed by a separator, so multiple pairs
/// packed onto one line (a query string, a one-line JSON fragment) are each
/// checked independently rather than just the first.
pub fn redact(text: &str) -> String {
    text.lines()
        .map(redact_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn redact_line(line: &str) -> String {
    line.split_inclusive([',', '&', ';']).map(redact_segment).collect()
}

fn redact_segment(segment: &str) -> String {
    let (body, trailing) = match segment.chars().last() {
        Some(c) if matches!(c, ',' | '&' | ';') => (&segment[..segment.len() - c.len_utf8()], c.to_string()),
        _ => (segment, String::new()),
    };

    let Some(sep_idx) = body.find(|c| c == ':' || c == '=') else {
        return segment.to_string();
    };
    let key = &body[..sep_idx];
    let stripped_key = key.trim().trim_matches('"');
    if !is_sensitive_key(stripped_key) {
        return segment.to_string();
    }
    let sep = &body[sep_idx..=sep_idx];
    let rest = &body[sep_idx + 1..];
    let space = if rest.starts_with(' ') { " " } else { "" };
    format!("{key}{sep}{space}{MASK}{trailing}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_known_header_keys_case_insensitively() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer secret-token".to_string());
        headers.insert("X-Request-Id".to_string(), "abc-123".to_string());

        let redacted = redact_headers(&headers);
        assert_eq!(redacted["Authorization"], "[redacted]");
        assert_eq!(redacted["X-Request-Id"], "abc-123");
    }

    #[test]
    fn redacts_sensitive_lines_in_freeform_text() {
        let text = "client_secret: s3cr3t\nnon_secret_field: 42";
        let redacted = redact(text);
        assert!(redacted.contains("client_secret: [redacted]"));
        assert!(redacted.contains("non_secret_field: 42"));
    }

    #[test]
    fn leaves_lines_without_a_separator_untouched() {
        assert_eq!(redact("just some text"), "just some text");
    }

    #[test]
    fn redacts_json_style_quoted_keys() {
        let text = r#""access_token":"AT12345""#;
        assert_eq!(redact(text), r#""access_token":[redacted]"#);
    }

    #[test]
    fn redacts_every_pair_on_a_line_not_just_the_first() {
        let text = "scope=openid email&refresh_token=RT999secret";
        let redacted = redact(text);
        assert!(redacted.contains("scope=openid email"));
        assert!(redacted.contains("refresh_token=[redacted]"));

        let json_text = r#""scope":"openid email","refresh_token":"RT999secret""#;
        let redacted_json = redact(json_text);
        assert!(redacted_json.contains(r#""scope":"openid email""#));
        assert!(redacted_json.contains(r#""refresh_token":[redacted]"#));
    }
}
