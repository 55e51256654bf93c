use serde::Deserialize;
use serde_json::Value;

/// Events from the agent CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Short description of a tool call for debug logs.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" | "Write" | "Edit" => match field("file_path") {
            Some(path) => format!("{} {}", name, path),
            None => name.to_string(),
        },
        "Bash" => match field("command") {
            Some(cmd) => format!("Bash: {}", crate::util::truncate(cmd, 60)),
            None => name.to_string(),
        },
        "Glob" | "Grep" => match field("pattern") {
            Some(pattern) => format!("{}: {}", name, pattern),
            None => name.to_string(),
        },
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_events() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"src/lib.rs"},"id":"1"},{"type":"text","text":"Looking"},{"type":"thinking","thinking":"hmm"}]},"session_id":"abc"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        let StreamEvent::Assistant { message, .. } = event else {
            panic!("Expected Assistant event");
        };
        assert_eq!(message.content.len(), 3);
        match &message.content[0] {
            ContentBlock::ToolUse { name, input } => {
                assert_eq!(describe_tool_use(name, input), "Read src/lib.rs");
            }
            other => panic!("Expected ToolUse, got {:?}", other),
        }
        assert!(matches!(message.content[2], ContentBlock::Other));
    }

    #[test]
    fn test_parse_result_event() {
        let json = r#"{"type":"result","subtype":"success","result":"done","is_error":false,"total_cost_usd":0.1}"#;
        match serde_json::from_str::<StreamEvent>(json).unwrap() {
            StreamEvent::Result {
                result, is_error, ..
            } => {
                assert_eq!(result.as_deref(), Some("done"));
                assert!(!is_error);
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_user_and_system_events() {
        assert!(matches!(
            serde_json::from_str::<StreamEvent>(r#"{"type":"user","message":{}}"#).unwrap(),
            StreamEvent::User {}
        ));
        assert!(matches!(
            serde_json::from_str::<StreamEvent>(r#"{"type":"system","subtype":"init"}"#).unwrap(),
            StreamEvent::System { .. }
        ));
    }

    #[test]
    fn test_describe_bash() {
        let input = serde_json::json!({"command": "cargo test"});
        assert_eq!(describe_tool_use("Bash", &input), "Bash: cargo test");
        assert_eq!(describe_tool_use("Task", &input), "Task");
    }
}
