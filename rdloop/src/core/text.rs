//! Char-boundary-safe truncation for log excerpts.

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

/// First `max_chars` characters of `text`.
pub fn head_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_short_text() {
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("abcdef", 2), "ef");
        assert_eq!(tail_chars("abc", 0), "");
    }

    #[test]
    fn head_respects_multibyte_boundaries() {
        assert_eq!(head_chars("héllo", 2), "hé");
        assert_eq!(head_chars("hi", 5), "hi");
        assert_eq!(tail_chars("héllo→x", 2), "→x");
    }
}
