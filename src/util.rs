//! Shared utility functions for the condense crate.

/// Truncate a string to at most `max_bytes`, backing up to a UTF-8 char
/// boundary. Returns the clamped slice and whether anything was cut.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> (&str, bool) {
    if s.len() <= max_bytes {
        return (s, false);
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (&s[..end], true)
}
