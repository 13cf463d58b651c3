use gauntlet_types::{Action, HarnessError, Result};

pub const ACTION_OPEN_TAG: &str = "<json>";
pub const ACTION_CLOSE_TAG: &str = "</json>";

/// Extract the single delimiter-wrapped action payload from a peer reply.
///
/// This is the parse-or-fail boundary: no payload, more than one payload,
/// or a payload that fails schema validation is a `ParseFailure`, never a
/// best-effort Action. One malformed turn fails the attempt.
pub fn extract_action(reply: &str) -> Result<Action> {
    let Some(open_idx) = reply.find(ACTION_OPEN_TAG) else {
        return Err(HarnessError::ParseFailure(
            "reply contains no action payload".to_string(),
        ));
    };
    let start = open_idx + ACTION_OPEN_TAG.len();
    if reply[start..].contains(ACTION_OPEN_TAG) {
        let open_count = reply.matches(ACTION_OPEN_TAG).count();
        return Err(HarnessError::ParseFailure(format!(
            "reply contains {open_count} action payloads, expected exactly one"
        )));
    }
    let Some(end_rel) = reply[start..].find(ACTION_CLOSE_TAG) else {
        return Err(HarnessError::ParseFailure(
            "action payload is not closed".to_string(),
        ));
    };
    let payload = reply[start..start + end_rel].trim();

    let action: Action = serde_json::from_str(payload)
        .map_err(|e| HarnessError::ParseFailure(format!("action payload is not valid: {e}")))?;

    if action.name.trim().is_empty() {
        return Err(HarnessError::ParseFailure(
            "action name is empty".to_string(),
        ));
    }

    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_wrapped_action() {
        let reply = r#"Let me look that up.
<json>{"name": "get_order", "arguments": {"order_id": "W123"}}</json>"#;
        let action = extract_action(reply).unwrap();
        assert_eq!(action.name, "get_order");
        assert_eq!(action.arguments["order_id"], "W123");
    }

    #[test]
    fn accepts_kwargs_field_name() {
        let reply = r#"<json>{"name": "respond", "kwargs": {"content": "done"}}</json>"#;
        let action = extract_action(reply).unwrap();
        assert_eq!(action.arguments["content"], "done");
    }

    #[test]
    fn plain_prose_is_parse_failure() {
        let err = extract_action("I think the order is ready.").unwrap_err();
        assert!(matches!(err, HarnessError::ParseFailure(_)));
    }

    #[test]
    fn multiple_payloads_are_rejected() {
        let reply = r#"<json>{"name": "a"}</json> and <json>{"name": "b"}</json>"#;
        let err = extract_action(reply).unwrap_err();
        assert!(err.to_string().contains("expected exactly one"));
    }

    #[test]
    fn unclosed_payload_is_rejected() {
        let err = extract_action(r#"<json>{"name": "a"}"#).unwrap_err();
        assert!(matches!(err, HarnessError::ParseFailure(_)));
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = extract_action("<json>{not json}</json>").unwrap_err();
        assert!(matches!(err, HarnessError::ParseFailure(_)));
    }

    #[test]
    fn wrong_shape_is_rejected() {
        // arguments must be a mapping, not a list
        let err = extract_action(r#"<json>{"name": "x", "arguments": [1]}</json>"#).unwrap_err();
        assert!(matches!(err, HarnessError::ParseFailure(_)));
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = extract_action(r#"<json>{"name": "  "}</json>"#).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn missing_arguments_defaults_to_empty() {
        let action = extract_action(r#"<json>{"name": "list_orders"}</json>"#).unwrap();
        assert!(action.arguments.is_empty());
    }
}
