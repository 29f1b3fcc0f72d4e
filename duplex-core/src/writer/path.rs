//! Segment naming.
//!
//! Segments live under `{root}/Calls/YYYY/MM/DD/` and are named
//! `{yyyymmdd_HHMMSS}_{label}.wav` in UTC. Recovery segments insert
//! `-recovery{N}` before the extension.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};

const MAX_LABEL_LEN: usize = 40;
const FALLBACK_LABEL: &str = "unknown";

/// Characters rejected by at least one supported filesystem.
const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Lowercased slug with filesystem-hostile characters removed, capped at 40
/// characters. Empty input falls back to `unknown`.
pub fn sanitize_label(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len().min(MAX_LABEL_LEN));
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            slug.push('-');
        } else if !ch.is_control() && !INVALID.contains(&ch) {
            for lower in ch.to_lowercase() {
                slug.push(lower);
            }
        }
    }
    if slug.len() > MAX_LABEL_LEN {
        let mut cut = MAX_LABEL_LEN;
        while !slug.is_char_boundary(cut) {
            cut -= 1;
        }
        slug.truncate(cut);
    }
    if slug.is_empty() {
        FALLBACK_LABEL.to_owned()
    } else {
        slug
    }
}

/// Initial segment path for a session started at `now`.
pub fn segment_path(root: &Path, label: &str, now: DateTime<Utc>) -> PathBuf {
    let slug = sanitize_label(label);
    root.join("Calls")
        .join(format!("{:04}", now.year()))
        .join(format!("{:02}", now.month()))
        .join(format!("{:02}", now.day()))
        .join(format!("{}_{slug}.wav", now.format("%Y%m%d_%H%M%S")))
}

/// Recovery segment path derived from the initial segment.
pub fn recovery_path(base: &Path, index: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_owned());
    let ext = base
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wav".to_owned());
    base.with_file_name(format!("{stem}-recovery{index}.{ext}"))
}
