use serde::de::DeserializeOwned;

/// Strip markdown code fences from a model response.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Parse model text that is supposed to be a JSON object, repairing the
/// damage models actually produce: code fences, prose around the object,
/// and trailing commas. Returns the last parse error when nothing works.
pub fn parse_lenient<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    let stripped = strip_code_blocks(raw);

    let mut last_error = match serde_json::from_str(stripped) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    // Trim to the outermost braces: models like to narrate before and after.
    if let Some(body) = outer_object(stripped) {
        match serde_json::from_str(body) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = e,
        }

        let cleaned = remove_trailing_commas(body);
        match serde_json::from_str(&cleaned) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = e,
        }
    }

    Err(last_error)
}

fn outer_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Remove commas that directly precede a closing brace/bracket, outside of
/// string literals.
fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut output = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            output.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                output.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    output.push(c);
                }
            }
            _ => output.push(c),
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use caption_common::Caption;

    fn full_caption_json(trailing_comma: bool) -> String {
        format!(
            r#"{{
                "regular_summary": "a",
                "midjourney_style_summary": "b",
                "short_summary": "c",
                "creation_instructional_summary": "d",
                "deviantart_commission_request": "e"{}
            }}"#,
            if trailing_comma { "," } else { "" }
        )
    }

    #[test]
    fn clean_json_parses() {
        let caption: Caption = parse_lenient(&full_caption_json(false)).unwrap();
        assert_eq!(caption.regular_summary, "a");
    }

    #[test]
    fn fenced_json_parses() {
        let fenced = format!("```json\n{}\n```", full_caption_json(false));
        assert!(parse_lenient::<Caption>(&fenced).is_ok());
    }

    #[test]
    fn surrounding_prose_is_trimmed() {
        let noisy = format!("Here is the description:\n{}\nHope that helps!", full_caption_json(false));
        assert!(parse_lenient::<Caption>(&noisy).is_ok());
    }

    #[test]
    fn trailing_comma_is_repaired() {
        assert!(parse_lenient::<Caption>(&full_caption_json(true)).is_ok());
    }

    #[test]
    fn commas_inside_strings_survive() {
        let text = r#"{"regular_summary": "a, b,", "midjourney_style_summary": "b", "short_summary": "c", "creation_instructional_summary": "d", "deviantart_commission_request": "e",}"#;
        let caption: Caption = parse_lenient(text).unwrap();
        assert_eq!(caption.regular_summary, "a, b,");
    }

    #[test]
    fn garbage_reports_an_error() {
        assert!(parse_lenient::<Caption>("not json at all").is_err());
    }

    #[test]
    fn missing_schema_key_fails() {
        let text = r#"{"regular_summary": "a"}"#;
        assert!(parse_lenient::<Caption>(text).is_err());
    }
}
