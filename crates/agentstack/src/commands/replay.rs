use agentstack_session::{ProgressSink, Session, replay_file};
use anyhow::Context as _;
use colored::Colorize;
use std::path::Path;

/// Prints tool progress on stderr so stdout carries only the answer
struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn notify(&mut self, slot: usize, message: &str) {
        eprintln!("{} {}", format!("[{}]", slot).dimmed(), message);
    }

    fn respond(&mut self, slot: usize, _message: &str) {
        tracing::debug!(slot, "Response complete");
    }

    fn partial(&mut self, slot: usize, text: &str) {
        tracing::trace!(slot, chars = text.len(), "Partial response");
    }

    fn status(&mut self, status: &str) {
        tracing::debug!("{}", status.replace('\n', " "));
    }
}

pub async fn handle(events_file: &Path) -> anyhow::Result<()> {
    let mut session = Session::new("replay");
    let answer = replay_file(events_file, &mut session, &mut ConsoleSink)
        .await
        .with_context(|| format!("Failed to replay {}", events_file.display()))?;

    println!("{}", answer);
    if !session.urls().is_empty() {
        eprintln!("{}", "Files:".bold());
        for url in session.urls() {
            eprintln!("  • {}", url.cyan());
        }
    }
    Ok(())
}
