//! Deterministic mapping from session ids to orchestrator-safe names.
//!
//! Kubernetes object names must be RFC 1123 labels: lowercase alphanumerics
//! and `-`, at most 63 characters, starting and ending alphanumeric. Session
//! ids are opaque caller-supplied strings, so the mapping filters the id and
//! appends a short content hash — two ids that sanitize identically still
//! get distinct names.

use sha2::{Digest, Sha256};

/// Maximum RFC 1123 label length.
const NAME_MAX: usize = 63;

/// Chars of the id hash appended to every name.
const HASH_LEN: usize = 8;

/// Worker object name for a session: `wg-<sanitized>-<hash8>`, ≤ 63 chars.
pub fn worker_name(session_id: &str) -> String {
    let digest = Sha256::digest(session_id.as_bytes());
    let hash = &hex::encode(digest)[..HASH_LEN];

    // "wg-" prefix + "-" + hash are always present.
    let max_fragment = NAME_MAX - 3 - 1 - HASH_LEN;
    let sanitized = sanitize_fragment(session_id, max_fragment);

    if sanitized.is_empty() {
        format!("wg-{hash}")
    } else {
        format!("wg-{sanitized}-{hash}")
    }
}

/// Sanitize a label *value* (looser grammar than names, same length cap):
/// keeps `[a-z0-9-]` after lowercasing, trims leading/trailing dashes.
pub fn sanitize_label(value: &str) -> String {
    sanitize_fragment(value, NAME_MAX)
}

/// Lowercase, map runs of disallowed chars to a single `-`, trim dashes,
/// truncate to `max`.
fn sanitize_fragment(raw: &str, max: usize) -> String {
    let mut out = String::with_capacity(raw.len().min(max));
    let mut last_dash = true; // suppress leading dash
    for c in raw.chars() {
        let mapped = match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9') => Some(c),
            _ => None,
        };
        match mapped {
            Some(c) => {
                out.push(c);
                last_dash = false;
            }
            None if !last_dash => {
                out.push('-');
                last_dash = true;
            }
            None => {}
        }
        if out.len() >= max {
            break;
        }
    }
    out.truncate(max);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_name_is_deterministic() {
        assert_eq!(worker_name("abc"), worker_name("abc"));
    }

    #[test]
    fn worker_name_is_lowercase_label() {
        let name = worker_name("My Session/42");
        assert!(name.len() <= NAME_MAX);
        assert!(name.starts_with("wg-my-session-42-"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn worker_name_distinct_for_colliding_sanitizations() {
        // Both sanitize to "a-b" but must not collide.
        assert_ne!(worker_name("a b"), worker_name("a_b"));
    }

    #[test]
    fn worker_name_truncates_long_ids() {
        let long = "x".repeat(200);
        let name = worker_name(&long);
        assert!(name.len() <= NAME_MAX);
        assert!(name.starts_with("wg-x"));
    }

    #[test]
    fn worker_name_handles_fully_invalid_id() {
        let name = worker_name("日本語");
        assert!(name.starts_with("wg-"));
        assert!(name.len() > 3);
    }

    #[test]
    fn sanitize_label_collapses_runs() {
        assert_eq!(sanitize_label("a//b..c"), "a-b-c");
        assert_eq!(sanitize_label("--edge--"), "edge");
    }

    #[test]
    fn sanitize_label_empty_input() {
        assert_eq!(sanitize_label("!!!"), "");
    }
}
