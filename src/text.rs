/// Longest prefix of `s` holding at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncates to `max_chars` characters and appends `marker` when anything
/// was cut off.
pub fn truncate_with_marker(s: &str, max_chars: usize, marker: &str) -> String {
    let head = truncate_chars(s, max_chars);
    if head.len() < s.len() {
        format!("{}{}", head, marker)
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_characters_not_bytes() {
        assert_eq!(truncate_chars("héllo wörld", 7), "héllo w");
        assert_eq!(truncate_chars("short", 30), "short");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn marker_only_when_cut() {
        assert_eq!(truncate_with_marker("abcdef", 3, "..."), "abc...");
        assert_eq!(truncate_with_marker("abc", 3, "..."), "abc");
    }
}
