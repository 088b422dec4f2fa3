//! Naming rules for index files.
//!
//! Commit files are `segments_N` with `N` the base-36 generation. Segment
//! files start with the segment name (`_` plus a base-36 counter), optionally
//! followed by `_<gen>` for generation-stamped files, then an extension.

use crate::error::{QuireError, Result};

/// Prefix of every commit file.
pub const SEGMENTS: &str = "segments";

/// Name of the fallback generation pointer file.
pub const SEGMENTS_GEN: &str = "segments.gen";

/// Default name of the advisory write lock.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Extension of per-segment metadata files.
pub const SEGMENT_INFO_EXTENSION: &str = "si";

/// Extension of compound container files.
pub const COMPOUND_FILE_EXTENSION: &str = "cfs";

/// Extension of live-docs files.
pub const LIVE_DOCS_EXTENSION: &str = "liv";

const RADIX_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Format a non-negative number in base 36.
pub fn to_radix36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(RADIX_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Parse a base-36 number.
pub fn from_radix36(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 36).ok()
}

/// Name of a generation-stamped file.
///
/// Returns `None` for generation -1 (no such file), `base.ext` for
/// generation 0 and `base_<gen>.ext` otherwise.
pub fn file_name_from_generation(base: &str, ext: &str, generation: i64) -> Option<String> {
    let dot_ext = if ext.is_empty() {
        String::new()
    } else {
        format!(".{ext}")
    };
    match generation {
        -1 => None,
        0 => Some(format!("{base}{dot_ext}")),
        generation => Some(format!("{base}_{}{dot_ext}", to_radix36(generation as u64))),
    }
}

/// Name of the commit file for `generation`.
pub fn segments_file_name(generation: i64) -> Option<String> {
    file_name_from_generation(SEGMENTS, "", generation)
}

/// Name of a per-segment file: `segment[_suffix].ext`.
pub fn segment_file_name(segment: &str, suffix: &str, ext: &str) -> String {
    let mut name = segment.to_string();
    if !suffix.is_empty() {
        name.push('_');
        name.push_str(suffix);
    }
    if !ext.is_empty() {
        name.push('.');
        name.push_str(ext);
    }
    name
}

/// Name of the segment allocated from counter value `counter`.
pub fn segment_name(counter: u64) -> String {
    format!("_{}", to_radix36(counter))
}

/// Generation of a commit file name.
pub fn generation_from_segments_file_name(name: &str) -> Result<i64> {
    if name == SEGMENTS {
        return Ok(0);
    }
    name.strip_prefix("segments_")
        .and_then(from_radix36)
        .and_then(|g| i64::try_from(g).ok())
        .ok_or_else(|| QuireError::invalid_argument(format!("'{name}' is not a segments file")))
}

/// Whether `name` is a commit file (`segments` or `segments_N`).
pub fn is_segments_file(name: &str) -> bool {
    name.starts_with(SEGMENTS) && name != SEGMENTS_GEN
}

/// The segment a file belongs to: everything before the second `_` or the
/// first `.`.
pub fn parse_segment_name(file_name: &str) -> &str {
    let end = file_name
        .get(1..)
        .and_then(|rest| rest.find('_').map(|i| i + 1))
        .or_else(|| file_name.find('.'))
        .unwrap_or(file_name.len());
    &file_name[..end]
}

/// Whether `name` is managed by the index: a commit file, the generation
/// pointer or a file of some segment.
pub fn is_index_file(name: &str) -> bool {
    if name.starts_with(SEGMENTS) {
        return true;
    }
    let Some(rest) = name.strip_prefix('_') else {
        return false;
    };
    match rest.find('.') {
        Some(dot) => {
            let stem = &rest[..dot];
            let segment = stem.split('_').next().unwrap_or("");
            !segment.is_empty()
                && segment.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                && dot + 1 < rest.len()
        }
        None => false,
    }
}

/// Strip the extension from a file name.
pub fn strip_extension(name: &str) -> &str {
    match name.find('.') {
        Some(dot) => &name[..dot],
        None => name,
    }
}
