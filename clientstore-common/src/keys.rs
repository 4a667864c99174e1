//! Storage key derivation.
//!
//! Every key sent to the object store passes through [`normalize_key`].
//! Client folders live under a deterministic prefix built by
//! [`build_client_prefix`]:
//!
//! ```text
//! {org_id}/{cnpj_digits}-{slug(razao_social)}[-{client_id:06}]
//! ```
//!
//! None of these functions fail or touch I/O.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Slug used when a company name has no ASCII alphanumerics left.
pub const FALLBACK_SLUG: &str = "cliente";

/// MIME type for `.docx`, which some platform MIME tables omit.
pub const DOCX_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Fallback MIME type for unknown extensions.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Normalize a key for the remote store.
///
/// Backslashes become forward slashes and leading/trailing slashes are
/// trimmed. Accents are stripped from the final segment only; directory
/// segments are left unchanged.
pub fn normalize_key(key: &str) -> String {
    let key = normalize_path(key);
    match key.rsplit_once('/') {
        Some((dirs, name)) => format!("{}/{}", dirs, strip_accents(name)),
        None => strip_accents(&key),
    }
}

/// Slash-only normalization for keys and prefixes that already exist in the
/// store: listing prefixes, folder names, keys taken from a listing. Text is
/// left untouched so an accented folder or file is addressed as stored.
pub fn normalize_path(key: &str) -> String {
    key.replace('\\', "/").trim_matches('/').to_string()
}

/// NFKD-decompose and drop combining marks. Non-ASCII base characters are kept.
pub fn strip_accents(text: &str) -> String {
    text.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Reduce free text to `[a-z0-9-]`, collapsing any other run into one hyphen.
///
/// Returns an empty string when nothing survives; callers pick a fallback.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;

    for c in text.nfkd().filter(char::is_ascii) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}

/// Keep only ASCII digits (CNPJ/CPF punctuation removal).
pub fn digits_only(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}

/// Build the storage prefix that owns every object of one client.
pub fn build_client_prefix(
    org_id: &str,
    tax_id: &str,
    company_name: &str,
    client_id: Option<u64>,
) -> String {
    let org = org_id.trim().replace(['/', '\\'], "-");
    let digits = digits_only(tax_id);

    let mut slug = slugify(company_name);
    if slug.is_empty() {
        slug = FALLBACK_SLUG.to_string();
    }

    let mut folder = if digits.is_empty() {
        slug
    } else {
        format!("{}-{}", digits, slug)
    };
    if let Some(id) = client_id {
        folder.push_str(&format!("-{:06}", id));
    }

    if org.is_empty() {
        folder
    } else {
        format!("{}/{}", org, folder)
    }
}

/// Pick a content type: the explicit one if given, else a guess from the
/// key's extension.
pub fn guess_content_type(key: &str, explicit: Option<&str>) -> String {
    if let Some(ct) = explicit.map(str::trim).filter(|ct| !ct.is_empty()) {
        return ct.to_string();
    }

    let ext = last_segment(key)
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    if ext.as_deref() == Some("docx") {
        return DOCX_MIME.to_string();
    }

    mime_guess::from_path(last_segment(key))
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Turn a local relative path into forward-slash form, dropping empty,
/// `.` and `..` segments so the result cannot climb out of its root.
pub fn sanitize_relative_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join key parts with `/`, skipping empty parts and trimming stray slashes.
pub fn join_key<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| p.as_ref().trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Final segment of a key (the "file name").
pub fn last_segment(key: &str) -> &str {
    let key = key.trim_end_matches('/');
    key.rsplit_once('/').map_or(key, |(_, name)| name)
}

/// Split a key into `(parent_prefix, name)`. The parent is empty for
/// top-level keys.
pub fn split_parent(key: &str) -> (&str, &str) {
    let key = key.trim_matches('/');
    key.rsplit_once('/').unwrap_or(("", key))
}
