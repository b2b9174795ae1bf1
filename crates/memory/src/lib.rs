//! `memobase-memory`: the conversational memory core (spec §1, components
//! C1–C4 and C6–C8). `crates/config` supplies the taxonomy and tuning knobs;
//! `crates/llm` supplies the only network boundary (C5). Everything in this
//! crate is storage- and provider-agnostic behind the [`profile_store`],
//! [`event_store`], [`buffer`]'s [`buffer::BlobStore`], and [`llm_port`]
//! traits, so a deployment swaps in real stores without touching the
//! pipeline logic.

pub mod blob;
pub mod buffer;
pub mod error;
pub mod event_store;
pub mod extraction;
pub mod facade;
pub mod llm_port;
pub mod profile_store;
pub mod retrieval;
pub mod schema;

pub use blob::{Blob, BlobPayload, BlobType, ChatMessage, MessageRole, TextPayload, Tokenizer};
pub use error::CoreError;
pub use extraction::ExtractionResult;
pub use facade::{Memobase, Profile, ProfileEntryView};
pub use schema::{BufferEntry, BufferStatus, Event, EventGist, ProfileAttributes, ProfileEntry};
