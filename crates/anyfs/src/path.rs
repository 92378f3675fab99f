//! Identifier normalization and id algebra.
//!
//! Identifiers are strings. Callers may use `/`, `\` or `|` as separators;
//! every public facade operation normalizes its identifier arguments before
//! any cache lookup or provider call, so cache keys are stable regardless of
//! caller-supplied separator style. The empty string is the root identifier.

/// Separator characters accepted in caller-supplied identifiers.
pub const SEPARATORS: [char; 3] = ['/', '\\', '|'];

/// The canonical separator emitted by [`normalize`].
pub const SEPARATOR: char = '/';

const INVALID_SEGMENT_CHARS: [char; 6] = ['<', '>', ':', '"', '?', '*'];

fn is_separator(c: char) -> bool {
    SEPARATORS.contains(&c)
}

/// Trims leading/trailing separators and collapses every separator run to a
/// single canonical separator. Idempotent.
pub fn normalize(id: &str) -> String {
    let trimmed = id.trim_matches(is_separator);
    let mut out = String::with_capacity(trimmed.len());
    let mut in_separator = false;
    for c in trimmed.chars() {
        if is_separator(c) {
            if !in_separator {
                out.push(SEPARATOR);
            }
            in_separator = true;
        } else {
            out.push(c);
            in_separator = false;
        }
    }
    out
}

/// Splits a normalized identifier into its segments. The root identifier
/// splits into a single empty segment.
pub fn split(id: &str) -> Vec<String> {
    let id = normalize(id);
    let parts: Vec<String> = id
        .split(SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        vec![String::new()]
    } else {
        parts
    }
}

/// The identifier of the parent, or the root identifier for top-level items.
pub fn parent(id: &str) -> String {
    let parts = split(id);
    parts[..parts.len().saturating_sub(1)].join(&SEPARATOR.to_string())
}

/// The final segment of an identifier.
pub fn file_name(id: &str) -> String {
    split(id).last().cloned().unwrap_or_default()
}

/// Joins two identifier fragments with the canonical separator.
pub fn combine(parent: &str, child: &str) -> String {
    let parent = normalize(parent);
    let child = normalize(child);
    if parent.is_empty() {
        child
    } else if child.is_empty() {
        parent
    } else {
        format!("{parent}{SEPARATOR}{child}")
    }
}

/// The extension of the final segment, including the leading dot.
pub fn extension(id: &str) -> Option<String> {
    let name = file_name(id);
    name.rfind('.').map(|dot| name[dot..].to_string())
}

pub fn has_extension(id: &str) -> bool {
    extension(id).is_some()
}

/// Strips characters that are not valid in a storage path segment.
pub fn valid_segment(segment: &str) -> String {
    segment
        .chars()
        .filter(|c| !INVALID_SEGMENT_CHARS.contains(c) && !c.is_control())
        .collect()
}

/// Applies [`valid_segment`] to every segment of an identifier.
pub fn valid_path(id: &str) -> String {
    let id = normalize(id);
    if id.is_empty() {
        return id;
    }
    id.split(SEPARATOR)
        .map(valid_segment)
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}
