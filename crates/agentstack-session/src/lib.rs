//! agentstack chat sessions
//!
//! Session-scoped state for the chat application and the reassembly of the
//! agent's streamed events into the text shown to the user.
//!
//! Every [`Session`] owns its own status trail, slot counter and references,
//! so concurrent conversations never see each other's progress.

pub mod error;
pub mod event;
pub mod session;
pub mod stream;
pub mod tool;

pub use error::{Result, SessionError};
pub use event::{
    AgentEvent, ContentBlock, Message, ToolResult, ToolResultContent, ToolUse, parse_events,
};
pub use session::{
    AgentProfile, DEFAULT_MODEL_ID, END_STATUS, Reference, START_STATUS, STOP_SEQUENCE, Session,
    SessionRegistry,
};
pub use stream::{
    NullSink, ProgressSink, StreamAssembler, ToolOutput, assemble, parse_tool_output,
    reference_section, replay_file,
};
pub use tool::{Tool, ToolCatalog, ToolCategory, ToolDescriptor, filter_parameters};
