mod common;

use agentstack_session::{
    AgentEvent, ContentBlock, Session, SessionRegistry, ToolResult, ToolResultContent, ToolUse,
    assemble, replay_file,
};
use common::{Recorded, RecordingSink};
use futures_util::stream;
use serde_json::json;
use std::io::Write;

fn tool_use(name: &str, input: serde_json::Value) -> AgentEvent {
    AgentEvent::message(vec![ContentBlock::ToolUse {
        tool_use: ToolUse {
            name: name.to_string(),
            input,
            id: Some("t1".to_string()),
        },
    }])
}

fn tool_result(text: &str) -> AgentEvent {
    AgentEvent::message(vec![ContentBlock::ToolResult {
        tool_result: ToolResult {
            content: vec![ToolResultContent {
                text: Some(text.to_string()),
            }],
        },
    }])
}

fn text(text: &str) -> AgentEvent {
    AgentEvent::message(vec![ContentBlock::Text { text: text.to_string() }])
}

#[tokio::test]
async fn test_turn_with_retrieval() {
    let mut session = Session::new("s1");
    let mut sink = RecordingSink::default();
    let references = json!([
        {"reference": {"url": "https://docs.example/a", "title": "Guide"}, "contents": "First\nsection"}
    ])
    .to_string();

    let events = vec![
        tool_use("retrieve", json!({"text": "setup", "session_id": "x"})),
        tool_result(&references),
        AgentEvent::text_delta("The "),
        AgentEvent::text_delta("answer"),
        text("The answer"),
    ];

    let result = assemble(&mut session, stream::iter(events), &mut sink).await;

    assert_eq!(
        result,
        "The answer\n\n### Reference\n1. [Guide](https://docs.example/a), Firstsection...\n"
    );
    assert_eq!(
        sink.notifications(),
        [
            (0, r#"tool name: retrieve, arg: {"text":"setup"}"#),
            (1, format!("tool result: {}", references).as_str()),
        ]
    );
    assert!(sink.calls.contains(&Recorded::Partial(2, "The answer".to_string())));
    assert!(sink.calls.contains(&Recorded::Respond(2, "The answer".to_string())));
    assert_eq!(
        sink.statuses(),
        [
            "[status]\n(start...",
            "[status]\n(start -> retrieve...",
            "[status]\n(start -> retrieve -> end)",
        ]
    );
    assert_eq!(session.references().len(), 1);
}

#[tokio::test]
async fn test_plain_answer_has_no_reference_section() {
    let mut session = Session::new("s1");
    let mut sink = RecordingSink::default();

    let result = assemble(&mut session, stream::iter(vec![text("Hi")]), &mut sink).await;

    assert_eq!(result, "Hi");
    assert!(sink.notifications().is_empty());
}

#[tokio::test]
async fn test_image_paths_are_collected() {
    let mut session = Session::new("s1");
    let mut sink = RecordingSink::default();
    let events = vec![
        tool_use("generate_image", json!({"prompt": "cat"})),
        tool_result(r#"{"path": ["https://img.example/1.png"]}"#),
        text("Done"),
    ];

    assemble(&mut session, stream::iter(events), &mut sink).await;

    assert_eq!(session.urls(), ["https://img.example/1.png"]);
}

#[tokio::test]
async fn test_sessions_do_not_share_progress() {
    let registry = SessionRegistry::new();
    let a = registry.get_or_create("a").await;
    let b = registry.get_or_create("b").await;

    let mut sink = RecordingSink::default();
    let events = vec![tool_use("retrieve", json!({})), text("A")];
    assemble(&mut *a.lock().await, stream::iter(events), &mut sink).await;

    let mut other = RecordingSink::default();
    assemble(&mut *b.lock().await, stream::iter(vec![text("B")]), &mut other).await;

    assert_eq!(a.lock().await.trail(), ["(start", "retrieve", "end)"]);
    assert_eq!(b.lock().await.trail(), ["(start", "end)"]);
    assert_eq!(other.calls[1], Recorded::Respond(0, "B".to_string()));
}

#[tokio::test]
async fn test_replay_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"data": "Hel"}}"#).unwrap();
    writeln!(
        file,
        r#"{{"message": {{"role": "assistant", "content": [{{"text": "Hello"}}]}}}}"#
    )
    .unwrap();

    let mut session = Session::new("replay");
    let mut sink = RecordingSink::default();
    let result = replay_file(file.path(), &mut session, &mut sink).await.unwrap();

    assert_eq!(result, "Hello");
    assert!(sink.calls.contains(&Recorded::Partial(0, "Hel".to_string())));
}

#[tokio::test]
async fn test_replay_rejects_bad_lines() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "not json").unwrap();

    let mut session = Session::new("replay");
    let err = replay_file(file.path(), &mut session, &mut RecordingSink::default())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("line 1"));
}
