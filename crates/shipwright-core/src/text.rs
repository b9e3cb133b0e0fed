//! Small helpers for building chat replies.

/// Trim, lowercase the first character and drop a trailing period, so a
/// sentence can be embedded mid-reply.
pub fn desentence(s: &str) -> String {
    let s = s.trim();
    let s = s.strip_suffix('.').unwrap_or(s);
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Trim and capitalise the first character.
pub fn sentence(s: &str) -> String {
    let s = s.trim();
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `"  • a\n  • b"`
pub fn bullets<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(|i| format!("  • {}", i.as_ref()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

/// Cut `text` to at most `max` bytes on a char boundary, marking the cut.
pub fn clamp(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    const MARK: &str = "…";
    let mut end = max.saturating_sub(MARK.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{MARK}", &text[..end])
}

/// Keep the last `max` bytes of `text`, marking the cut at the front.
pub fn clamp_tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    const MARK: &str = "…";
    let mut start = text.len() - max.saturating_sub(MARK.len());
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    format!("{MARK}{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desentence_strips_period_and_lowercases() {
        assert_eq!(desentence("  Deploy the web tier. "), "deploy the web tier");
        assert_eq!(desentence(""), "");
    }

    #[test]
    fn sentence_capitalises() {
        assert_eq!(sentence("install packages"), "Install packages");
    }

    #[test]
    fn clamp_respects_char_boundaries() {
        let s = "ééééé";
        let out = clamp(s, 6);
        assert!(out.len() <= 6);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn clamp_tail_keeps_the_end() {
        let out = clamp_tail("abcdefghij", 6);
        assert_eq!(out, "…hij");
        assert!(clamp_tail("ééééé", 6).len() <= 6);
        assert_eq!(clamp_tail("ok", 10), "ok");
    }

    #[test]
    fn clamp_noop_when_short() {
        assert_eq!(clamp("ok", 10), "ok");
    }

    #[test]
    fn plural_forms() {
        assert_eq!(plural(1, "task"), "1 task");
        assert_eq!(plural(3, "task"), "3 tasks");
    }
}
