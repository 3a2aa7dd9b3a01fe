//! File-name helpers: URL extraction, Content-Disposition parsing and
//! collision resolution.
use std::path::Path;
use url::Url;

/// Derive a file name from the last path segment of a URL.
///
/// The segment is percent-decoded; query strings are ignored. Falls back to
/// `"download"` when the URL has no usable path component.
pub fn file_name_from_url(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url)
        && let Some(segments) = parsed.path_segments()
        && let Some(last) = segments.filter(|s| !s.is_empty()).next_back()
    {
        let decoded = urlencoding::decode(last)
            .map(|cow| cow.into_owned())
            .unwrap_or_else(|_| last.to_string());
        if !decoded.is_empty() {
            return decoded;
        }
    }
    "download".to_string()
}

/// Extract a file name from a `Content-Disposition` header value.
///
/// Understands the RFC 5987 `filename*=UTF-8''…` percent-encoded form (which
/// wins when both are present) as well as quoted and unquoted `filename=`.
pub fn parse_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;

    for part in header.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename*=") {
            // Format: charset'language'percent-encoded-name
            if let Some(idx) = rest.find("''") {
                let encoded = rest[idx + 2..].trim().trim_matches('"');
                if let Ok(decoded) = urlencoding::decode(encoded)
                    && !decoded.is_empty()
                {
                    return Some(decoded.into_owned());
                }
            }
        } else if let Some(rest) = part.strip_prefix("filename=") {
            let name = rest.trim().trim_matches('"');
            if !name.is_empty() {
                plain = Some(name.to_string());
            }
        }
    }

    plain
}

/// Find a name that does not collide with an existing file in `dir` by
/// appending `" (k)"` before the extension for the smallest free `k >= 1`.
pub fn resolve_collision(dir: &Path, name: &str) -> String {
    if !dir.join(name).exists() {
        return name.to_string();
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for k in 1..1000 {
        let candidate = format!("{stem} ({k}){ext}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
    }
    name.to_string()
}
