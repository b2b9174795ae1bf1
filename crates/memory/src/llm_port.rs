//! A narrow, dyn-compatible seam onto the LLM gateway (C5).
//!
//! `memobase_llm::Gateway::complete_json` is generic over the deserialized
//! type, which can't live behind `dyn Trait`. The extraction and retrieval
//! stages only ever need a `serde_json::Value` back (they deserialize into
//! their own shapes afterward), so [`LlmPort`] trims the gateway down to
//! that and nothing else — the same role the teacher's `EmbedFn` plays for
//! embeddings: an injectable seam a test double can stand in for.

use async_trait::async_trait;
use memobase_llm::{CompleteRequest, EmbedPhase, Gateway};

use crate::error::CoreError;

#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn complete_json(&self, request: &CompleteRequest) -> Result<serde_json::Value, CoreError>;
    async fn complete_text(&self, request: &CompleteRequest) -> Result<String, CoreError>;
    async fn embed(&self, texts: &[String], phase: EmbedPhase, model: &str) -> Result<Vec<Vec<f32>>, CoreError>;
}

#[async_trait]
impl LlmPort for Gateway {
    async fn complete_json(&self, request: &CompleteRequest) -> Result<serde_json::Value, CoreError> {
        Ok(Gateway::complete_json::<serde_json::Value>(self, request).await?)
    }

    async fn complete_text(&self, request: &CompleteRequest) -> Result<String, CoreError> {
        Ok(Gateway::complete(self, request).await?)
    }

    async fn embed(&self, texts: &[String], phase: EmbedPhase, model: &str) -> Result<Vec<Vec<f32>>, CoreError> {
        Ok(Gateway::embed(self, texts, phase, model).await?)
    }
}
