//! Reassembly of the agent's event stream into a display string

use crate::error::Result;
use crate::event::{AgentEvent, ContentBlock, parse_events};
use crate::session::{Reference, Session};
use crate::tool::filter_parameters;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, trace};

const EXCERPT_CHARS: usize = 200;

/// Where progress goes while a turn streams
///
/// Slots are positions in the UI's notification list; the session hands them
/// out in order.
pub trait ProgressSink {
    fn notify(&mut self, slot: usize, message: &str);
    fn respond(&mut self, slot: usize, message: &str);
    /// Text streamed so far for the slot in progress
    fn partial(&mut self, slot: usize, text: &str);
    fn status(&mut self, status: &str);
}

/// Discards everything
pub struct NullSink;

impl ProgressSink for NullSink {
    fn notify(&mut self, _slot: usize, _message: &str) {}
    fn respond(&mut self, _slot: usize, _message: &str) {}
    fn partial(&mut self, _slot: usize, _text: &str) {}
    fn status(&mut self, _status: &str) {}
}

/// References and paths found in one tool result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub urls: Vec<String>,
    pub references: Vec<Reference>,
}

fn excerpt(contents: &str) -> String {
    let shortened = if contents.chars().count() > EXCERPT_CHARS {
        let head: String = contents.chars().take(EXCERPT_CHARS).collect();
        format!("{}...", head)
    } else {
        contents.to_string()
    };
    shortened.replace('\n', "")
}

/// Pull `path` URLs and `{reference, contents}` entries out of a tool result
///
/// Text that is not JSON yields nothing.
pub fn parse_tool_output(text: &str) -> ToolOutput {
    let mut output = ToolOutput::default();
    let Ok(json) = serde_json::from_str::<Value>(text) else {
        return output;
    };

    match json.get("path") {
        Some(Value::Array(paths)) => output
            .urls
            .extend(paths.iter().filter_map(Value::as_str).map(str::to_string)),
        Some(Value::String(path)) => output.urls.push(path.clone()),
        _ => {}
    }

    if let Value::Array(items) = &json {
        for item in items {
            let (Some(reference), Some(contents)) = (item.get("reference"), item.get("contents"))
            else {
                continue;
            };
            let field = |key: &str| {
                reference
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            output.references.push(Reference {
                url: field("url"),
                title: field("title"),
                content: excerpt(contents.as_str().unwrap_or_default()),
            });
        }
    }
    output
}

/// Markdown list appended to the final answer
pub fn reference_section(references: &[Reference]) -> String {
    if references.is_empty() {
        return String::new();
    }
    let mut section = String::from("\n\n### Reference\n");
    for (i, reference) in references.iter().enumerate() {
        section.push_str(&format!(
            "{}. [{}]({}), {}...\n",
            i + 1,
            reference.title,
            reference.url,
            reference.content
        ));
    }
    section
}

/// Folds events of one turn into the final answer
pub struct StreamAssembler<'a> {
    session: &'a mut Session,
    tool_name: String,
    result: String,
    partial: String,
}

impl<'a> StreamAssembler<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        Self {
            session,
            tool_name: String::new(),
            result: String::new(),
            partial: String::new(),
        }
    }

    pub fn feed(&mut self, event: &AgentEvent, sink: &mut dyn ProgressSink) {
        match event {
            AgentEvent::Message { message } => {
                for block in &message.content {
                    self.block(block, sink);
                }
            }
            AgentEvent::Data { data } => {
                self.partial.push_str(data);
                sink.partial(self.session.current_slot(), &self.partial);
            }
            AgentEvent::Other(value) => trace!(event = %value, "Ignored event"),
        }
    }

    fn block(&mut self, block: &ContentBlock, sink: &mut dyn ProgressSink) {
        match block {
            ContentBlock::Text { text } => {
                let slot = self.session.next_slot();
                sink.respond(slot, text);
                self.result = text.clone();
                self.partial.clear();
            }
            ContentBlock::ToolUse { tool_use } => {
                self.tool_name = tool_use.name.clone();
                let arguments = filter_parameters(&tool_use.name, &tool_use.input);
                debug!(tool = %tool_use.name, %arguments, "Tool use");

                let slot = self.session.next_slot();
                sink.notify(slot, &format!("tool name: {}, arg: {}", tool_use.name, arguments));
                let status = self.session.push_status(&tool_use.name);
                sink.status(&status);
            }
            ContentBlock::ToolResult { tool_result } => {
                for text in tool_result.content.iter().filter_map(|c| c.text.as_deref()) {
                    let slot = self.session.next_slot();
                    sink.notify(slot, &format!("tool result: {}", text));

                    let output = parse_tool_output(text);
                    debug!(
                        tool = %self.tool_name,
                        urls = output.urls.len(),
                        references = output.references.len(),
                        "Tool result"
                    );
                    for url in output.urls {
                        self.session.add_url(url);
                    }
                    for reference in output.references {
                        self.session.add_reference(reference);
                    }
                }
            }
            ContentBlock::Other(value) => trace!(block = %value, "Ignored content block"),
        }
    }

    /// The last complete text with the collected references appended
    pub fn finish(self) -> String {
        let mut result = self.result;
        result.push_str(&reference_section(self.session.references()));
        result
    }
}

/// Run a whole turn: status start, every event, status end
pub async fn assemble<S>(session: &mut Session, events: S, sink: &mut dyn ProgressSink) -> String
where
    S: Stream<Item = AgentEvent>,
{
    let opening = session.begin_turn();
    sink.status(&opening);

    let mut events = std::pin::pin!(events);
    let mut assembler = StreamAssembler::new(session);
    while let Some(event) = events.next().await {
        assembler.feed(&event, sink);
    }
    let result = assembler.finish();

    let closing = session.end_turn();
    sink.status(&closing);
    result
}

/// Assemble a turn recorded as JSON lines
pub async fn replay_file(
    path: impl AsRef<Path>,
    session: &mut Session,
    sink: &mut dyn ProgressSink,
) -> Result<String> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path).await?;
    let events = parse_events(&content)?;
    debug!(path = %path.display(), events = events.len(), "Replaying agent events");
    Ok(assemble(session, futures_util::stream::iter(events), sink).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_references() {
        let long = "x".repeat(250);
        let text = json!([
            {"reference": {"url": "https://a.example/1", "title": "One"}, "contents": "line\nbreak"},
            {"reference": {"url": "https://a.example/2", "title": "Two"}, "contents": long},
            {"unrelated": true}
        ])
        .to_string();

        let output = parse_tool_output(&text);
        assert_eq!(output.references.len(), 2);
        assert_eq!(output.references[0].content, "linebreak");
        assert_eq!(output.references[1].content, format!("{}...", "x".repeat(200)));
    }

    #[test]
    fn test_parse_paths() {
        let output =
            parse_tool_output(r#"{"path": ["https://a.example/x.png", "https://a.example/y.png"]}"#);
        assert_eq!(output.urls.len(), 2);

        let output = parse_tool_output(r#"{"path": "https://a.example/z.png"}"#);
        assert_eq!(output.urls, ["https://a.example/z.png"]);

        assert_eq!(parse_tool_output("plain text"), ToolOutput::default());
    }

    #[test]
    fn test_reference_section() {
        assert_eq!(reference_section(&[]), "");
        let section = reference_section(&[Reference {
            url: "https://a.example".into(),
            title: "A".into(),
            content: "body".into(),
        }]);
        assert_eq!(section, "\n\n### Reference\n1. [A](https://a.example), body...\n");
    }
}
