//! Filename sanitization for saved artifacts.

/// Longest file name (stem + extension) written to disk, in bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

/// Makes a document name safe to use as a file stem.
///
/// Characters that are illegal on common file systems (`<>:"/\|?*` and
/// control characters) become spaces, leading and trailing dots are
/// dropped, and whitespace runs (including non-breaking spaces) collapse
/// to a single space.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_space = false;
    for ch in name.chars() {
        let mapped = match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => ' ',
            c if c.is_control() || c.is_whitespace() => ' ',
            c => c,
        };
        if mapped == ' ' {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(mapped);
            prev_space = false;
        }
    }
    out.trim()
        .trim_matches('.')
        .trim()
        .to_string()
}

/// Builds `<stem>.<ext>`, truncating the stem so the whole name fits in
/// [`MAX_FILENAME_BYTES`]. Truncation never splits a UTF-8 character.
#[must_use]
pub fn build_filename(stem: &str, extension: &str) -> String {
    let stem = sanitize_filename(stem);
    let stem = if stem.is_empty() { "untitled" } else { stem.as_str() };
    let extension = extension.trim_start_matches('.');
    let suffix_len = if extension.is_empty() { 0 } else { extension.len() + 1 };
    let budget = MAX_FILENAME_BYTES.saturating_sub(suffix_len);

    let mut cut = stem.len().min(budget);
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    let stem = stem[..cut].trim_end();

    if extension.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{extension}")
    }
}

/// Lowercase extension of a file name, without the dot.
#[must_use]
pub fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.contains(['/', '\\', ' ']) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
