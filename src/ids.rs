//! Identifier and filename hygiene.
//!
//! Anything that ends up as a path segment (upload ids, temp identifiers,
//! stored filenames) goes through these checks first.

use crate::config::MAX_ID_LEN;
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

static SAFE_ID: OnceLock<Regex> = OnceLock::new();
static SAFE_FILENAME: OnceLock<Regex> = OnceLock::new();

const MAX_STEM_LEN: usize = 80;
const MAX_EXT_LEN: usize = 10;

/// True when `id` matches `[A-Za-z0-9_-]+` and is not absurdly long.
pub fn is_safe_id(id: &str) -> bool {
    let re = SAFE_ID.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
    id.len() <= MAX_ID_LEN && re.is_match(id)
}

/// True for a single path segment we generated ourselves (`stem-suffix.ext`).
pub fn is_safe_filename(name: &str) -> bool {
    let re = SAFE_FILENAME.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9_.-]*$").unwrap());
    name.len() <= 255 && !name.contains("..") && re.is_match(name)
}

/// Fresh upload id.
pub fn new_upload_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Splits an original filename into a sanitized stem and lower-cased extension.
///
/// Only the final path component is considered, so `../../etc/passwd` becomes
/// `passwd` with no extension.
pub fn split_filename(original: &str) -> (String, Option<String>) {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original)
        .trim();

    let (stem, ext) = match base.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < base.len() => (&base[..pos], Some(&base[pos + 1..])),
        _ => (base, None),
    };

    let mut clean: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(MAX_STEM_LEN)
        .collect();
    let trimmed = clean.trim_matches('_');
    clean = if trimmed.is_empty() { "file".to_string() } else { trimmed.to_string() };

    let ext = ext
        .map(|e| {
            e.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(MAX_EXT_LEN)
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|e| !e.is_empty());

    (clean, ext)
}

/// `stem-xxxxxxxx.ext`, unique enough that two uploads of the same name in
/// one temp scope don't collide (collisions are still re-rolled on create).
pub fn unique_filename(original: &str) -> String {
    let (stem, ext) = split_filename(original);
    let suffix: u32 = rand::thread_rng().gen();
    match ext {
        Some(ext) => format!("{stem}-{suffix:08x}.{ext}"),
        None => format!("{stem}-{suffix:08x}"),
    }
}
