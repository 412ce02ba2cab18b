// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Small helpers shared across the crate.

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Placeholder directory name for titles that sanitize to nothing usable.
const EMPTY_NAME_PLACEHOLDER: &str = "_unnamed";

/// Mask a secret for logging.
///
/// Shows only the first `visible_prefix` characters followed by "...".
///
/// # Examples
///
/// ```
/// use sailor::utils::mask_secret;
///
/// assert_eq!(mask_secret("9f86d081884c7d65", 4), "9f86...");
/// ```
pub fn mask_secret(input: &str, visible_prefix: usize) -> String {
    let prefix: String = input.chars().take(visible_prefix).collect();
    format!("{}...", prefix)
}

/// Turn a torrent title into a single, safe directory name.
///
/// Spaces become underscores, path separators and characters reserved on
/// common filesystems become underscores too, and names that would resolve
/// to the parent or current directory are replaced. The result is always a
/// single path component.
///
/// # Examples
///
/// ```
/// use sailor::utils::sanitize_dir_name;
///
/// assert_eq!(sanitize_dir_name("Big Buck Bunny"), "Big_Buck_Bunny");
/// assert_eq!(sanitize_dir_name("../etc"), ".._etc");
/// ```
pub fn sanitize_dir_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' | '?' | '*' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return EMPTY_NAME_PLACEHOLDER.to_string();
    }
    cleaned
}

/// Truncate `text` to at most `max_width` terminal columns, appending "..."
/// when anything was cut.
pub fn truncate_to_width(text: &str, max_width: usize) -> String {
    if text.width() <= max_width {
        return text.to_string();
    }
    let budget = max_width.saturating_sub(3);
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(c);
    }
    out.push_str("...");
    out
}

/// Truncate or right-pad `text` to exactly `width` terminal columns.
pub fn fit_to_width(text: &str, width: usize) -> String {
    let mut out = truncate_to_width(text, width);
    let used = out.width();
    out.extend(std::iter::repeat(' ').take(width.saturating_sub(used)));
    out
}
