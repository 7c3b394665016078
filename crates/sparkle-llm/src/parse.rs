use sparkle_core::Action;

/// Structured payload extracted from the assistant's reply.
#[derive(Debug, Clone)]
pub struct StructuredReply {
    pub message: String,
    pub action: Action,
    pub extracted: serde_json::Value,
}

/// Parse the assistant's strict-JSON reply.
///
/// The system prompt instructs the model to answer with
/// `{"message": ..., "action": ..., "extracted_data": {...}}`. Models
/// occasionally wrap the object in markdown fences or prepend prose, so the
/// parser scans for the first balanced JSON object before giving up. When no
/// object parses, the raw text becomes the message with action `continue`.
pub fn parse_structured(raw: &str) -> StructuredReply {
    if let Some(obj) = extract_json_object(raw) {
        let message = obj
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or(raw)
            .to_string();
        let action = obj
            .get("action")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Action>().ok())
            .unwrap_or(Action::Continue);
        let extracted = obj
            .get("extracted_data")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        return StructuredReply {
            message,
            action,
            extracted,
        };
    }

    StructuredReply {
        message: raw.trim().to_string(),
        action: Action::Continue,
        extracted: serde_json::json!({}),
    }
}

/// Find and parse the first balanced `{...}` object in `raw`.
fn extract_json_object(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    // Fast path: the whole reply is the object.
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    let start = trimmed.find('{')?;
    let bytes = trimmed.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..=i];
                    if let Ok(v) = serde_json::from_str::<serde_json::Value>(candidate) {
                        if v.is_object() {
                            return Some(v);
                        }
                    }
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let reply = parse_structured(
            r#"{"message": "What day works for you?", "action": "collect_info", "extracted_data": {"serviceType": "deep_cleaning"}}"#,
        );
        assert_eq!(reply.action, Action::CollectInfo);
        assert_eq!(reply.message, "What day works for you?");
        assert_eq!(reply.extracted["serviceType"], "deep_cleaning");
    }

    #[test]
    fn parses_fenced_json() {
        let reply = parse_structured(
            "```json\n{\"message\": \"Booked!\", \"action\": \"book_appointment\"}\n```",
        );
        assert_eq!(reply.action, Action::BookAppointment);
        assert_eq!(reply.message, "Booked!");
    }

    #[test]
    fn falls_back_to_raw_text() {
        let reply = parse_structured("Sure, I can help with that.");
        assert_eq!(reply.action, Action::Continue);
        assert_eq!(reply.message, "Sure, I can help with that.");
    }

    #[test]
    fn unknown_action_maps_to_continue() {
        let reply =
            parse_structured(r#"{"message": "hm", "action": "launch_rockets"}"#);
        assert_eq!(reply.action, Action::Continue);
    }

    #[test]
    fn nested_braces_inside_strings_do_not_confuse_the_scanner() {
        let reply = parse_structured(
            "Note: {\"message\": \"use {curly} braces\", \"action\": \"continue\"} done",
        );
        assert_eq!(reply.message, "use {curly} braces");
    }
}
