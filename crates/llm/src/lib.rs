//! The LLM/embedding gateway (`C5`): the only place in the workspace that
//! speaks HTTP to a model provider.
//!
//! Everything upstream (extraction, retrieval) calls [`Gateway::complete`],
//! [`Gateway::complete_json`], or [`Gateway::embed`] and never touches
//! `reqwest` directly.

mod chat;
mod error;
mod gateway;

pub use chat::{ChatMessage, ChatRole};
pub use error::GatewayError;
pub use gateway::{CompleteRequest, EmbedPhase, Gateway};
