//! Tools available to the agent

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Inputs some MCP servers inject that the tools themselves reject
const SESSION_PARAMETERS: [&str; 3] = ["mcp-session-id", "session-id", "session_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ToolCategory {
    Retrieval,
    Memory,
    Gmail,
    Drive,
    Calendar,
    Docs,
    Sheets,
    Chat,
    Forms,
    Slides,
    Tasks,
    Other,
}

impl ToolCategory {
    /// Workspace category from an MCP tool name
    pub fn classify(tool_name: &str) -> Self {
        let name = tool_name.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| name.contains(n));

        if has(&["gmail"]) {
            ToolCategory::Gmail
        } else if has(&["drive"]) {
            ToolCategory::Drive
        } else if has(&["event", "calendar"]) {
            ToolCategory::Calendar
        } else if has(&["sheet", "spreadsheet"]) {
            ToolCategory::Sheets
        } else if has(&["doc"]) {
            ToolCategory::Docs
        } else if has(&["chat", "message"]) {
            ToolCategory::Chat
        } else if has(&["form"]) {
            ToolCategory::Forms
        } else if has(&["presentation", "slide"]) {
            ToolCategory::Slides
        } else if has(&["task"]) {
            ToolCategory::Tasks
        } else {
            ToolCategory::Other
        }
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub category: ToolCategory,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tool {
    /// Knowledge base search
    Retrieve,
    /// Long-term conversation memory
    Memory,
    /// A tool listed by an MCP server
    Mcp { name: String, description: String },
}

impl Tool {
    pub fn mcp(name: impl Into<String>, description: impl Into<String>) -> Self {
        Tool::Mcp {
            name: name.into(),
            description: description.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Tool::Retrieve => "retrieve",
            Tool::Memory => "memory",
            Tool::Mcp { name, .. } => name,
        }
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        let (category, description) = match self {
            Tool::Retrieve => (
                ToolCategory::Retrieval,
                "Search the knowledge base for relevant documents",
            ),
            Tool::Memory => (ToolCategory::Memory, "Store and recall conversation memory"),
            Tool::Mcp { name, description } => (ToolCategory::classify(name), description.as_str()),
        };
        ToolDescriptor {
            name: self.name().to_string(),
            category,
            description: description.to_string(),
        }
    }
}

/// The tool set handed to the agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCatalog {
    tools: Vec<Tool>,
}

impl ToolCatalog {
    /// Built-in retrieval followed by the MCP tools
    pub fn with_mcp(mcp_tools: impl IntoIterator<Item = Tool>) -> Self {
        let mut tools = vec![Tool::Retrieve];
        tools.extend(mcp_tools);
        Self { tools }
    }

    pub fn push(&mut self, tool: Tool) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(Tool::name).collect()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(Tool::descriptor).collect()
    }

    /// MCP tools per workspace category
    pub fn category_counts(&self) -> BTreeMap<ToolCategory, usize> {
        let mut counts = BTreeMap::new();
        for tool in &self.tools {
            if let Tool::Mcp { name, .. } = tool {
                *counts.entry(ToolCategory::classify(name)).or_insert(0) += 1;
            }
        }
        counts
    }

    /// `Gmail(3), Drive(2), ...` for the tool loading log line
    pub fn category_summary(&self) -> String {
        self.category_counts()
            .iter()
            .map(|(category, count)| format!("{}({})", category, count))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Drop session identifiers from a tool's input object
pub fn filter_parameters(tool_name: &str, input: &Value) -> Value {
    let Value::Object(params) = input else {
        return input.clone();
    };
    let kept = params
        .iter()
        .filter(|(key, _)| {
            let drop = SESSION_PARAMETERS.contains(&key.as_str());
            if drop {
                debug!(tool = tool_name, parameter = %key, "Filtered out session parameter");
            }
            !drop
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify() {
        assert_eq!(ToolCategory::classify("search_gmail_messages"), ToolCategory::Gmail);
        assert_eq!(ToolCategory::classify("list_drive_items"), ToolCategory::Drive);
        assert_eq!(ToolCategory::classify("create_event"), ToolCategory::Calendar);
        assert_eq!(ToolCategory::classify("read_spreadsheet_values"), ToolCategory::Sheets);
        assert_eq!(ToolCategory::classify("get_doc_content"), ToolCategory::Docs);
        assert_eq!(ToolCategory::classify("send_message"), ToolCategory::Chat);
        assert_eq!(ToolCategory::classify("create_form"), ToolCategory::Forms);
        assert_eq!(ToolCategory::classify("get_presentation"), ToolCategory::Slides);
        assert_eq!(ToolCategory::classify("list_tasks"), ToolCategory::Tasks);
        assert_eq!(ToolCategory::classify("start_google_auth"), ToolCategory::Other);
    }

    #[test]
    fn test_catalog_counts_only_mcp_tools() {
        let catalog = ToolCatalog::with_mcp([
            Tool::mcp("search_gmail_messages", "Search mail"),
            Tool::mcp("send_gmail_message", "Send mail"),
            Tool::mcp("list_calendars", "Calendars"),
        ]);

        assert_eq!(
            catalog.names(),
            ["retrieve", "search_gmail_messages", "send_gmail_message", "list_calendars"]
        );
        assert_eq!(catalog.category_summary(), "Gmail(2), Calendar(1)");
        assert_eq!(catalog.descriptors()[0].category, ToolCategory::Retrieval);
    }

    #[test]
    fn test_filter_parameters() {
        let input = json!({
            "query": "inbox",
            "mcp-session-id": "abc",
            "session_id": "def",
            "session-id": "ghi"
        });
        assert_eq!(filter_parameters("search_gmail_messages", &input), json!({"query": "inbox"}));

        // Non-object inputs pass through
        assert_eq!(filter_parameters("retrieve", &json!("text")), json!("text"));
    }
}
