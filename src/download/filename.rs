use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use url::Url;

/// Maximum length for the title portion of a filename
const MAX_TITLE_LENGTH: usize = 100;

/// Extension used when neither the URL nor the content type tells us
const FALLBACK_EXTENSION: &str = "mp3";

/// Check if a character is allowed in filenames (whitelist approach)
fn is_valid_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')
}

/// Filename stem (without extension) for a downloaded item
///
/// Format: "YYYY-MM-DD-sanitized-title" or "undated-sanitized-title"
pub fn filename_stem(title: &str, published_at: Option<DateTime<Utc>>) -> String {
    let date_prefix = published_at
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string());

    let sanitized = sanitize_title(title);
    if sanitized.is_empty() {
        format!("{date_prefix}-untitled")
    } else {
        format!("{date_prefix}-{sanitized}")
    }
}

/// File extension for a media URL, falling back to the response content type
pub fn media_extension(link: &str, content_type: Option<&str>) -> String {
    if let Some(ext) = Url::parse(link)
        .ok()
        .as_ref()
        .and_then(|url| url.path_segments()?.next_back().map(str::to_string))
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()))
        .filter(|ext| is_media_extension(ext))
    {
        return ext;
    }

    content_type
        .and_then(mime_to_extension)
        .unwrap_or(FALLBACK_EXTENSION)
        .to_string()
}

/// Output paths to try for `stem.ext`, in order: `stem.ext`, `stem-2.ext`, ...
///
/// Existence is not checked here. The downloader claims a name by creating
/// its `.partial` file exclusively.
pub fn candidate_paths<'a>(
    dir: &'a Path,
    stem: &'a str,
    ext: &'a str,
) -> impl Iterator<Item = PathBuf> + 'a {
    std::iter::once(dir.join(format!("{stem}.{ext}")))
        .chain((2u32..).map(move |n| dir.join(format!("{stem}-{n}.{ext}"))))
}

/// Sibling path a download is streamed to before it is complete
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Sanitize a title for use in a filename using whitelist approach
fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| if is_valid_filename_char(c) { c } else { '-' })
        .collect();

    let collapsed = collapse_separators(&sanitized);
    let trimmed = collapsed.trim_matches(|c: char| c == '-' || c == '.' || c.is_whitespace());

    if trimmed.len() > MAX_TITLE_LENGTH {
        truncate_at_boundary(trimmed, MAX_TITLE_LENGTH)
    } else {
        trimmed.to_string()
    }
}

/// Collapse runs of spaces and dashes into a single dash
fn collapse_separators(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_separator = false;

    for c in s.chars() {
        if c == '-' || c.is_whitespace() {
            if !last_was_separator {
                result.push('-');
                last_was_separator = true;
            }
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }

    result
}

/// Truncate at the last dash past half of `max_len`, else hard cut
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    // Input is ASCII after sanitizing, so byte slicing is safe
    let truncated = &s[..max_len.min(s.len())];
    match truncated.rfind('-') {
        Some(pos) if pos > max_len / 2 => truncated[..pos].to_string(),
        _ => truncated.trim_end_matches('-').to_string(),
    }
}

fn is_media_extension(ext: &str) -> bool {
    matches!(
        ext,
        "mp3" | "m4a" | "aac" | "ogg" | "opus" | "wav" | "flac" | "mp4" | "m4v" | "webm" | "mkv" | "mov"
    )
}

/// Map MIME types to file extensions
fn mime_to_extension(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    match mime.to_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "video/mp4" => Some("mp4"),
        "video/x-m4v" => Some("m4v"),
        "video/webm" => Some("webm"),
        "video/x-matroska" => Some("mkv"),
        "video/quicktime" => Some("mov"),
        _ => None,
    }
}
