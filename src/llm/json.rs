//! Lenient JSON handling for model-produced text.
//!
//! Models frequently emit almost-JSON: single quotes, trailing commas,
//! Python literals, code fences. Everything that has to tolerate that goes
//! through [`parse_tolerant_json`]; nothing else in the crate is lenient.

use serde_json::{Map, Value};

/// Failure to interpret a string as JSON even after repair attempts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not parse JSON ({reason}): {input}")]
pub struct JsonRepairError {
    pub input: String,
    pub reason: String,
}

/// Parse a JSON value, falling back to JSON5 and a few textual repairs.
pub fn parse_tolerant_json(input: &str) -> Result<Value, JsonRepairError> {
    let trimmed = strip_code_fence(input.trim());

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let json5_err = match json5::from_str::<Value>(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e.to_string(),
    };

    let repaired = repair_python_literals(trimmed);
    if repaired != trimmed {
        if let Ok(value) = json5::from_str::<Value>(&repaired) {
            return Ok(value);
        }
    }

    Err(JsonRepairError {
        input: input.to_string(),
        reason: json5_err,
    })
}

/// Remove a surrounding markdown code fence, if any.
fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest
        .strip_prefix("json5")
        .or_else(|| rest.strip_prefix("json"))
        .unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Replace bare `True`/`False`/`None` tokens outside of strings.
fn repair_python_literals(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    let mut word = String::new();

    let flush = |word: &mut String, out: &mut String| {
        match word.as_str() {
            "True" => out.push_str("true"),
            "False" => out.push_str("false"),
            "None" => out.push_str("null"),
            w => out.push_str(w),
        }
        word.clear();
    };

    for c in s.chars() {
        if let Some(quote) = in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            continue;
        }
        flush(&mut word, &mut out);
        if c == '"' || c == '\'' {
            in_string = Some(c);
        }
        out.push(c);
    }
    flush(&mut word, &mut out);
    out
}

/// Find every top-level `{...}` block in free text that parses as a JSON
/// object. The text as a whole does not need to be JSON.
pub fn top_level_json_objects(text: &str) -> Vec<Map<String, Value>> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
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
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Ok(Value::Object(map)) = parse_tolerant_json(&text[s..=i]) {
                            objects.push(map);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    objects
}

/// Value of `field` in the first top-level JSON object that has it, or an
/// empty string.
pub fn top_level_json_field(text: &str, field: &str) -> String {
    top_level_json_objects(text)
        .into_iter()
        .find_map(|obj| obj.get(field).cloned())
        .map(|v| match v {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_json_passes_through() {
        assert_eq!(parse_tolerant_json(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_repairs_common_model_mistakes() {
        assert_eq!(
            parse_tolerant_json("{'a': 1, 'b': [1, 2,],}").unwrap(),
            json!({"a": 1, "b": [1, 2]})
        );
        assert_eq!(
            parse_tolerant_json(r#"{"ok": True, "missing": None}"#).unwrap(),
            json!({"ok": true, "missing": null})
        );
        assert_eq!(
            parse_tolerant_json("```json\n{\"x\": \"y\"}\n```").unwrap(),
            json!({"x": "y"})
        );
    }

    #[test]
    fn test_python_literal_inside_string_untouched() {
        assert_eq!(
            parse_tolerant_json(r#"{"s": 'None of True', 'n': None}"#).unwrap(),
            json!({"s": "None of True", "n": null})
        );
    }

    #[test]
    fn test_garbage_is_an_error() {
        let err = parse_tolerant_json("{not json at all").unwrap_err();
        assert_eq!(err.input, "{not json at all");
    }

    #[test]
    fn test_top_level_objects_in_prose() {
        let text = r#"Sure! {"recipient": "Alice", "note": "has } brace"} and {"b": 2} done"#;
        let objs = top_level_json_objects(text);
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0]["recipient"], json!("Alice"));
        assert_eq!(objs[1]["b"], json!(2));
    }

    #[test]
    fn test_top_level_field() {
        assert_eq!(
            top_level_json_field(r#"x {"a": {"recipient": "inner"}} y"#, "recipient"),
            ""
        );
        assert_eq!(top_level_json_field(r#"{"recipient": "Bob"}"#, "recipient"), "Bob");
        assert_eq!(top_level_json_field("no json here", "recipient"), "");
    }
}
