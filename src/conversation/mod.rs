//! # Conversation Module
//!
//! The per-connection conversation logic, independent of the WebSocket transport:
//!
//! - **protocol**: decodes inbound JSON frames into [`Signal`]s
//! - **pipeline**: the single-flight state machine with its pending queue
//!
//! The WebSocket actor (`src/websocket.rs`) only parses frames and forwards the
//! resulting signals to a [`ConversationPipeline`] running in its own task.

pub mod pipeline;
pub mod protocol;

pub use pipeline::ConversationPipeline;
pub use protocol::{parse_frame, Signal};
