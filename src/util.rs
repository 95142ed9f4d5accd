//! Shared utility functions.

use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Convert a title to a branch-safe slug, limited to `max_len` bytes.
///
/// Non-alphanumeric runs collapse into a single `-`; the result never starts
/// or ends with `-`.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() <= max_len {
        return slug;
    }
    let cut = slug
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|end| *end <= max_len)
        .last()
        .unwrap_or(0);
    slug[..cut].trim_end_matches('-').to_string()
}

/// Format a duration in seconds as `1m 05s` / `12.3s`.
pub fn format_duration(secs: f64) -> String {
    if secs >= 60.0 {
        let whole = secs.round() as u64;
        format!("{}m {:02}s", whole / 60, whole % 60)
    } else {
        format!("{:.1}s", secs)
    }
}

/// Write `value` as pretty JSON to `path` via a temp file in the same
/// directory followed by a rename, so readers never observe a partial file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let payload = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(&payload)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
