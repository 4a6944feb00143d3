//! Per-conversation context
//!
//! Each chat session owns its status trail, UI slot counter, collected
//! references and agent profile. Nothing is shared between sessions.

use crate::tool::{Tool, ToolCatalog};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

pub const DEFAULT_MODEL_ID: &str = "us.anthropic.claude-3-7-sonnet-20250219-v1:0";
pub const STOP_SEQUENCE: &str = "\n\nHuman:";
/// Status that closes a turn
pub const END_STATUS: &str = "end)";
pub const START_STATUS: &str = "(start";

/// Model parameters and tools of the agent behind a session
#[derive(Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop_sequences: Vec<String>,
    /// Messages kept in the sliding conversation window
    pub history_window: usize,
    pub tools: ToolCatalog,
}

impl AgentProfile {
    pub fn new(model_id: impl Into<String>, tools: ToolCatalog) -> Self {
        Self {
            model_id: model_id.into(),
            max_tokens: 4096,
            temperature: 0.1,
            top_p: 0.9,
            stop_sequences: vec![STOP_SEQUENCE.to_string()],
            history_window: 10,
            tools,
        }
    }
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_ID, ToolCatalog::with_mcp(Vec::<Tool>::new()))
    }
}

/// A source cited by a tool result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub url: String,
    pub title: String,
    /// Shortened excerpt
    pub content: String,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    trail: Vec<String>,
    slot: usize,
    references: Vec<Reference>,
    urls: Vec<String>,
    profile: Option<AgentProfile>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trail: Vec::new(),
            slot: 0,
            references: Vec::new(),
            urls: Vec::new(),
            profile: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The agent profile, built by `init` on first use and reused afterwards
    pub fn agent(&mut self, init: impl FnOnce() -> AgentProfile) -> &AgentProfile {
        self.profile.get_or_insert_with(|| {
            let profile = init();
            info!(
                session = %self.id,
                model = %profile.model_id,
                tools = profile.tools.tools().len(),
                "Agent initialised"
            );
            info!("Tool categories: {}", profile.tools.category_summary());
            profile
        })
    }

    pub fn has_agent(&self) -> bool {
        self.profile.is_some()
    }

    /// Reset per-turn state and return the opening status line
    pub fn begin_turn(&mut self) -> String {
        self.slot = 0;
        self.trail.clear();
        self.references.clear();
        self.urls.clear();
        self.push_status(START_STATUS)
    }

    pub fn end_turn(&mut self) -> String {
        self.push_status(END_STATUS)
    }

    /// Append to the status trail and render it
    pub fn push_status(&mut self, status: &str) -> String {
        self.trail.push(status.to_string());
        let joined = self.trail.join(" -> ");
        if status == END_STATUS {
            format!("[status]\n{}", joined)
        } else {
            format!("[status]\n{}...", joined)
        }
    }

    pub fn trail(&self) -> &[String] {
        &self.trail
    }

    /// Claim the current UI slot and move past it
    pub fn next_slot(&mut self) -> usize {
        let slot = self.slot;
        self.slot += 1;
        slot
    }

    pub fn current_slot(&self) -> usize {
        self.slot
    }

    pub fn add_reference(&mut self, reference: Reference) {
        debug!(session = %self.id, url = %reference.url, "Collected reference");
        self.references.push(reference);
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub fn add_url(&mut self, url: impl Into<String>) {
        self.urls.push(url.into());
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

/// Live sessions by id
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn get_or_create(&self, id: &str) -> Arc<Mutex<Session>> {
        if let Some(session) = self.get(id).await {
            return session;
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(session = id, "Created session");
                Arc::new(Mutex::new(Session::new(id)))
            })
            .clone()
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_trail() {
        let mut session = Session::new("s1");
        assert_eq!(session.begin_turn(), "[status]\n(start...");
        assert_eq!(session.push_status("retrieve"), "[status]\n(start -> retrieve...");
        assert_eq!(session.end_turn(), "[status]\n(start -> retrieve -> end)");

        // A new turn starts over
        session.next_slot();
        session.begin_turn();
        assert_eq!(session.trail(), ["(start"]);
        assert_eq!(session.current_slot(), 0);
    }

    #[test]
    fn test_slots_increase() {
        let mut session = Session::new("s1");
        assert_eq!(session.next_slot(), 0);
        assert_eq!(session.next_slot(), 1);
        assert_eq!(session.current_slot(), 2);
    }

    #[test]
    fn test_agent_is_initialised_once() {
        let mut session = Session::new("s1");
        assert!(!session.has_agent());

        let mut calls = 0;
        session.agent(|| {
            calls += 1;
            AgentProfile::default()
        });
        let profile = session.agent(|| {
            calls += 1;
            AgentProfile::new("other-model", ToolCatalog::default())
        });

        assert_eq!(profile.model_id, DEFAULT_MODEL_ID);
        assert_eq!(profile.max_tokens, 4096);
        assert_eq!(profile.stop_sequences, [STOP_SEQUENCE]);
        assert_eq!(profile.history_window, 10);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_registry_isolates_sessions() {
        let registry = SessionRegistry::new();
        let a = registry.get_or_create("a").await;
        let b = registry.get_or_create("b").await;

        a.lock().await.begin_turn();
        a.lock().await.next_slot();
        a.lock().await.push_status("retrieve");

        let b = b.lock().await;
        assert!(b.trail().is_empty());
        assert_eq!(b.current_slot(), 0);
        drop(b);

        let again = registry.get_or_create("a").await;
        assert_eq!(again.lock().await.current_slot(), 1);
        assert_eq!(registry.len().await, 2);

        assert!(registry.remove("a").await);
        assert!(registry.get("a").await.is_none());
    }
}
