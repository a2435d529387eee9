//! Bounded excerpts of tool output and model replies.

/// Truncate `s` to at most `max_chars` characters on a character boundary,
/// appending an ellipsis when anything was cut.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((byte_index, _)) => {
            let mut out = String::with_capacity(byte_index + 1);
            out.push_str(&s[..byte_index]);
            out.push('…');
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::truncate_chars;

    #[test]
    fn short_strings_are_untouched() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 5), "hello");
    }

    #[test]
    fn long_strings_get_an_ellipsis() {
        assert_eq!(truncate_chars("hello world", 5), "hello…");
    }

    #[test]
    fn multibyte_content_is_cut_on_char_boundaries() {
        let s = "😀😀😀😀";
        let out = truncate_chars(s, 2);
        assert_eq!(out, "😀😀…");
        assert!(!out.contains('\u{fffd}'));
    }
}
