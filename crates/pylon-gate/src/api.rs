//! API identifier derivation.
//!
//! Requests are keyed for rate limiting and logging by an API identifier:
//! the first configured pattern that matches the request, or the literal
//! `"METHOD /path"` when nothing matches.

use pylon_types::ApiLimit;

/// Derives the API identifier for a request.
///
/// Patterns are tried in configuration order; the first match wins. A
/// pattern is `"METHOD /prefix/*"` (path prefix) or `"METHOD /a/{param}/b"`
/// (segment-wise, `{param}` matches exactly one segment).
pub fn api_identifier(method: &str, path: &str, limits: &[ApiLimit]) -> String {
    for limit in limits {
        if pattern_matches(&limit.pattern, method, path) {
            return limit.pattern.clone();
        }
    }
    format!("{method} {path}")
}

fn pattern_matches(pattern: &str, method: &str, path: &str) -> bool {
    let Some((p_method, p_path)) = pattern.split_once(' ') else {
        return false;
    };
    if p_method != method {
        return false;
    }

    if let Some(prefix) = p_path.strip_suffix('*') {
        return path.starts_with(prefix);
    }

    let p_segments: Vec<&str> = p_path.split('/').collect();
    let segments: Vec<&str> = path.split('/').collect();
    if p_segments.len() != segments.len() {
        return false;
    }
    p_segments.iter().zip(&segments).all(|(p, s)| {
        (p.starts_with('{') && p.ends_with('}') && !s.is_empty()) || p == s
    })
}
