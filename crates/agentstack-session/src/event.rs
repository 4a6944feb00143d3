//! Agent stream events
//!
//! Two shapes arrive on the stream: a complete message with content blocks,
//! or a text delta under `data`. Anything else is kept as raw JSON and
//! ignored by the assembler.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentEvent {
    Message { message: Message },
    Data { data: String },
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(rename = "toolUse")]
        tool_use: ToolUse,
    },
    ToolResult {
        #[serde(rename = "toolResult")]
        tool_result: ToolResult,
    },
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(rename = "toolUseId", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub content: Vec<ToolResultContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl AgentEvent {
    pub fn text_delta(data: impl Into<String>) -> Self {
        AgentEvent::Data { data: data.into() }
    }

    pub fn message(content: Vec<ContentBlock>) -> Self {
        AgentEvent::Message {
            message: Message {
                role: Some("assistant".to_string()),
                content,
            },
        }
    }
}

/// Parse a JSON-lines event log; blank lines are skipped
pub fn parse_events(input: &str) -> Result<Vec<AgentEvent>> {
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|source| SessionError::InvalidEvent {
                line: i + 1,
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_shapes() {
        let events = parse_events(
            r#"{"data": "Hel"}
{"message": {"role": "assistant", "content": [{"text": "Hello"}, {"toolUse": {"name": "retrieve", "input": {"text": "q"}, "toolUseId": "t1"}}]}}

{"message": {"role": "user", "content": [{"toolResult": {"content": [{"text": "[]"}], "status": "success"}}]}}
{"init_event_loop": true}"#,
        )
        .unwrap();

        assert_eq!(events.len(), 4);
        assert_eq!(events[0], AgentEvent::text_delta("Hel"));

        let AgentEvent::Message { message } = &events[1] else {
            panic!("expected a message");
        };
        assert_eq!(
            message.content[0],
            ContentBlock::Text {
                text: "Hello".into()
            }
        );
        let ContentBlock::ToolUse { tool_use } = &message.content[1] else {
            panic!("expected a tool use");
        };
        assert_eq!(tool_use.name, "retrieve");
        assert_eq!(tool_use.input, json!({"text": "q"}));

        assert!(matches!(
            &events[2],
            AgentEvent::Message { message }
                if matches!(message.content[0], ContentBlock::ToolResult { .. })
        ));
        assert!(matches!(events[3], AgentEvent::Other(_)));
    }

    #[test]
    fn test_bad_line_reports_position() {
        let err = parse_events("{\"data\": \"ok\"}\n{not json").unwrap_err();
        assert!(err.to_string().starts_with("Invalid agent event on line 2"));
    }
}
