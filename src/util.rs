//! Shared utility functions for the epicflow crate.

/// Find every top-level JSON object embedded in `text`.
///
/// Uses brace-counting that skips braces inside string literals. Returns the
/// byte offset of each object together with its text, in order of appearance.
/// Unbalanced trailing objects are ignored.
pub fn find_json_objects(text: &str) -> Vec<(usize, &str)> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    objects.push((start, &text[start..=i]));
                }
            }
            _ => {}
        }
    }

    objects
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_json_objects_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(find_json_objects(text), vec![(0, r#"{"key": "value"}"#)]);
    }

    #[test]
    fn test_find_json_objects_with_prose() {
        let text = r#"First {"a": 1} then {"b": {"c": 2}} done"#;
        let found = find_json_objects(text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, r#"{"a": 1}"#);
        assert_eq!(found[1].1, r#"{"b": {"c": 2}}"#);
        assert!(found[1].0 > found[0].0);
    }

    #[test]
    fn test_find_json_objects_braces_in_strings() {
        let text = r#"{"msg": "use {braces} and \"quotes\""}"#;
        assert_eq!(find_json_objects(text), vec![(0, text)]);
    }

    #[test]
    fn test_find_json_objects_unclosed() {
        assert!(find_json_objects(r#"{"key": "value""#).is_empty());
        assert!(find_json_objects("No JSON here").is_empty());
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
