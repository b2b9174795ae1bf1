//! The blob model and deterministic tokenizer (C1, spec §3, §4.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobType {
    Chat,
    Doc,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: None,
        }
    }
}

/// `doc`/`code` payload: a single text plus optional metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlobPayload {
    Chat { messages: Vec<ChatMessage> },
    Doc(TextPayload),
    Code(TextPayload),
}

impl BlobPayload {
    pub fn blob_type(&self) -> BlobType {
        match self {
            BlobPayload::Chat { .. } => BlobType::Chat,
            BlobPayload::Doc(_) => BlobType::Doc,
            BlobPayload::Code(_) => BlobType::Code,
        }
    }
}

/// An immutable ingest unit. Once persisted, a `Blob` is never mutated or
/// deleted by the core — it survives buffer flush for audit purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    pub id: Uuid,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: BlobPayload,
}

impl Blob {
    pub fn new(user_id: impl Into<String>, payload: BlobPayload, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            created_at,
            payload,
        }
    }

    pub fn blob_type(&self) -> BlobType {
        self.payload.blob_type()
    }

    /// The text this blob contributes to an extraction prompt or a token
    /// count. Chat messages render as `"<role>: <content>\n"`, concatenated
    /// in order (spec §4.1) — the same rendering buffer sizing, summary
    /// truncation, and context packing all read token counts from.
    pub fn render_text(&self) -> String {
        match &self.payload {
            BlobPayload::Chat { messages } => {
                let mut rendered = String::new();
                for message in messages {
                    let role = match message.role {
                        MessageRole::User => "user",
                        MessageRole::Assistant => "assistant",
                        MessageRole::System => "system",
                    };
                    rendered.push_str(role);
                    rendered.push_str(": ");
                    rendered.push_str(&message.content);
                    rendered.push('\n');
                }
                rendered
            }
            BlobPayload::Doc(payload) | BlobPayload::Code(payload) => payload.text.clone(),
        }
    }
}

/// Deterministic token counter shared by the buffer (C4), the extraction
/// pipeline (C6), and the retrieval assembler (C7) so that "fits in N
/// tokens" means the same thing everywhere.
///
/// Wraps a single `cl100k_base` encoder; constructing it loads a static
/// vocabulary table, so callers should build one `Tokenizer` and share it
/// rather than constructing one per call.
pub struct Tokenizer {
    bpe: CoreBPE,
}

impl Tokenizer {
    pub fn new() -> Result<Self, CoreError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|err| CoreError::Internal(format!("failed to load tokenizer: {err}")))?;
        Ok(Self { bpe })
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    pub fn count_blob(&self, blob: &Blob) -> usize {
        self.count(&blob.render_text())
    }

    /// Truncates `text` to at most `max_tokens` tokens, decoding back to a
    /// string. Used as the retrieval assembler's final safety clamp so a
    /// rendered context can never be fed back through this same tokenizer
    /// and come out over budget.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        self.bpe
            .decode(tokens[..max_tokens].to_vec())
            .unwrap_or_default()
    }
}
