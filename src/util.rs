//! Shared helpers: JSON extraction from free-form text, slugs, workflow ids.

/// Extract the first balanced JSON object from text that may contain other
/// content. Braces inside string literals are ignored.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
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
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the body of the first fenced ```json block.
pub fn extract_fenced_json(text: &str) -> Option<String> {
    let open = text.find("```json")?;
    let rest = &text[open + "```json".len()..];
    let close = rest.find("```")?;
    let body = rest[..close].trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

/// Lowercase, dash-separated slug, cut at a char boundary.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

/// A fresh workflow id: `wf-<slug of issue ref>-<8 hex chars>`.
pub fn new_workflow_id(issue_ref: &str) -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    let slug = slugify(issue_ref, 32);
    if slug.is_empty() {
        format!("wf-{}", &short[..8])
    } else {
        format!("wf-{}-{}", slug, &short[..8])
    }
}

/// Truncate to at most `max` bytes on a char boundary, marking the cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        format!("{}...", &text[..text.floor_char_boundary(max)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_with_prefix_and_suffix() {
        let text = r#"Here is the JSON: {"key": "value"} and more"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"{"msg": "use {} here", "n": 1} tail"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"msg": "use {} here", "n": 1}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_none() {
        assert_eq!(extract_json_object("No JSON here"), None);
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }

    #[test]
    fn test_extract_fenced_json() {
        let text = "Sure:\n```json\n{\"a\": 1}\n```\nDone";
        assert_eq!(extract_fenced_json(text), Some("{\"a\": 1}".to_string()));
        assert_eq!(extract_fenced_json("no fence"), None);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Fix the Login Bug!", 40), "fix-the-login-bug");
        assert_eq!(slugify("owner/repo#42", 40), "owner-repo-42");
        assert_eq!(slugify("a very long title indeed", 10), "a-very-lon");
    }

    #[test]
    fn test_new_workflow_id_is_valid_and_unique() {
        let a = new_workflow_id("local#3");
        let b = new_workflow_id("local#3");
        assert!(a.starts_with("wf-local-3-"));
        assert_ne!(a, b);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }
}
