// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversions between legacy flat agent ids and path-style rollup ids.
//!
//! A legacy id joins its segments with `::`, e.g. `"web::east::host-1"` for agent
//! `host-1` inside rollup `web/east`. A trailing `::` marks the id of a rollup
//! itself (`"web::east::"`). The current scheme names an agent by its last segment
//! and a rollup by its segments joined with `/`.
//!
//! Every function here is total: input that does not look like an identifier is
//! returned unchanged (or yields no parent) instead of failing, since these ids often
//! come from old persisted data.

pub const LEGACY_DELIMITER: &str = "::";
pub const PATH_SEPARATOR: char = '/';
const ESCAPE: char = '\\';

/// Splits a legacy id into its segments. `None` when any inner segment is empty.
fn segments(id: &str) -> Option<(Vec<&str>, bool)> {
    let (body, rollup) = match id.strip_suffix(LEGACY_DELIMITER) {
        Some(body) => (body, true),
        None => (id, false),
    };
    if body.is_empty() {
        return None;
    }
    let parts: Vec<&str> = body.split(LEGACY_DELIMITER).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some((parts, rollup))
}

fn join_path(parts: &[&str]) -> String {
    let mut path = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            path.push(PATH_SEPARATOR);
        }
        path.push_str(part);
    }
    path
}

/// Whether `id` names a rollup (ends with the legacy delimiter).
#[must_use]
pub fn is_rollup_id(id: &str) -> bool {
    segments(id).is_some_and(|(_, rollup)| rollup)
}

/// Path-style id of the rollup directly containing `id`, if any.
#[must_use]
pub fn parent_of(id: &str) -> Option<String> {
    let (parts, _) = segments(id)?;
    if parts.len() < 2 {
        return None;
    }
    Some(join_path(&parts[..parts.len() - 1]))
}

/// Current-scheme ids from `id` itself up to its root rollup.
#[must_use]
pub fn ancestor_chain(id: &str) -> Vec<String> {
    let Some((parts, rollup)) = segments(id) else {
        return vec![id.to_string()];
    };
    let mut chain = Vec::with_capacity(parts.len());
    let mut depth = parts.len();
    if !rollup && depth > 1 {
        chain.push(parts[depth - 1].to_string());
        depth -= 1;
    }
    while depth > 0 {
        chain.push(join_path(&parts[..depth]));
        depth -= 1;
    }
    chain
}

/// Current-scheme form of `id`; the head of [`ancestor_chain`].
#[must_use]
pub fn convert_to_current(id: &str) -> String {
    let Some((parts, rollup)) = segments(id) else {
        return id.to_string();
    };
    match parts.last() {
        Some(last) if !rollup && parts.len() > 1 => (*last).to_string(),
        _ => join_path(&parts),
    }
}

/// Escapes backslashes, then path separators, in a raw value embedded in a
/// storage key next to identifier segments.
#[must_use]
pub fn escape_delimiter_conflicts(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c == ESCAPE || c == PATH_SEPARATOR {
            escaped.push(ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

/// Inverse of [`escape_delimiter_conflicts`]. A dangling escape is kept as is.
#[must_use]
pub fn unescape_delimiter_conflicts(text: &str) -> String {
    let mut unescaped = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            match chars.next() {
                Some(next) => unescaped.push(next),
                None => unescaped.push(ESCAPE),
            }
        } else {
            unescaped.push(c);
        }
    }
    unescaped
}
