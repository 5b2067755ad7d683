//! Filename sanitization
//!
//! Every name a client supplies is reduced to a safe form before it is used
//! as a lock key, a storage key, or a metadata key. The same reduction is
//! applied everywhere so the three key spaces can never disagree.

/// Replacement for names that reduce to nothing.
pub const UNNAMED: &str = "unnamed";

/// Reduce a client-supplied filename to a safe storage name.
///
/// Takes the last path-separator-delimited segment (both `/` and `\` count
/// as separators), strips every `..` sequence, and falls back to
/// [`UNNAMED`] if nothing remains.
pub fn sanitize(name: &str) -> String {
    let last = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(name);

    let mut cleaned = last.to_string();
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", "");
    }

    if cleaned.is_empty() {
        UNNAMED.to_string()
    } else {
        cleaned
    }
}

/// True if `name` is already in sanitized form.
///
/// Used at signup time: usernames name directories, so they must survive
/// sanitization unchanged.
pub fn is_clean(name: &str) -> bool {
    sanitize(name) == name && name != UNNAMED
}
