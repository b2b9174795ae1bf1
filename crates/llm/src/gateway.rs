use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use memobase_config::{Config, LlmStyle};

use crate::chat::{ChatMessage, ChatRole};
use crate::error::GatewayError;

/// Which embedding index a vector is destined for (spec §3, §4.3).
///
/// Some providers (e.g. the `text-embedding-3-*` family via their
/// `dimensions` parameter, or models with asymmetric query/document
/// instructions) embed a query differently from how they embed the text
/// being indexed. The gateway always asks, even when the underlying
/// provider ignores the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedPhase {
    Index,
    Query,
}

/// A single completion request.
///
/// `json_mode` is the only thing that changes retry behavior: a plain-text
/// completion is returned as-is on any 2xx response, while a JSON-mode
/// completion that doesn't parse gets exactly one reformat retry before
/// `GatewayError::Unprocessable` (spec §9, reacting to the fence/bare-JSON
/// scraping the original gateway relied on).
#[derive(Debug, Clone)]
pub struct CompleteRequest {
    pub system: Option<String>,
    pub history: Vec<ChatMessage>,
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub json_mode: bool,
}

impl CompleteRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            history: Vec::new(),
            prompt: prompt.into(),
            model: model.into(),
            max_tokens: 1024,
            json_mode: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn to_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if let Some(system) = &self.system {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.extend(self.history.clone());
        messages.push(ChatMessage::user(self.prompt.clone()));
        messages
    }
}

/// Talks to a single OpenAI-compatible (or prompt-caching variant) chat
/// completions + embeddings endpoint, per the `llm`/`embedding` sections of
/// [`Config`].
///
/// Unlike the router this is grounded on, there is no multi-provider
/// fallback chain here — the source system picks one configured provider
/// per call site and fails loudly rather than silently degrading to a
/// second backend.
pub struct Gateway {
    client: reqwest::Client,
    llm_style: LlmStyle,
    llm_base_url: String,
    llm_api_key: String,
    embedding_base_url: String,
    embedding_api_key: String,
    embedding_dim: usize,
}

impl Gateway {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            llm_style: config.llm.llm_style,
            llm_base_url: config.llm.llm_base_url.clone(),
            llm_api_key: config.llm.llm_api_key.clone(),
            embedding_base_url: config.embedding.embedding_base_url.clone(),
            embedding_api_key: config.embedding.embedding_api_key.clone(),
            embedding_dim: config.embedding.embedding_dim,
        }
    }

    /// Plain-text completion. Returns the first choice's message content
    /// verbatim; never retries.
    pub async fn complete(&self, request: &CompleteRequest) -> Result<String, GatewayError> {
        let body = self.chat_completions_request(request, None).await?;
        extract_content(&body)
    }

    /// JSON-mode completion deserialized into `T`.
    ///
    /// On the first malformed response, reissues the request once with an
    /// added instruction to return only valid JSON matching the same shape.
    /// A second failure is `GatewayError::Unprocessable` — there is no
    /// fence-scraping fallback beyond that.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        request: &CompleteRequest,
    ) -> Result<T, GatewayError> {
        let request = request.clone().json();
        let first_body = self.chat_completions_request(&request, None).await?;
        let first_text = extract_content(&first_body)?;

        match serde_json::from_str::<T>(first_text.trim()) {
            Ok(value) => Ok(value),
            Err(first_err) => {
                warn!(error = %first_err, "json-mode completion did not parse, retrying with reformat instruction");
                let reformat_hint = format!(
                    "Your previous response could not be parsed as JSON: {first_err}. \
                     Respond again with ONLY a single valid JSON value, no prose, no code fences."
                );
                let second_body = self
                    .chat_completions_request(&request, Some(&reformat_hint))
                    .await?;
                let second_text = extract_content(&second_body)?;
                serde_json::from_str::<T>(second_text.trim()).map_err(|second_err| {
                    GatewayError::Unprocessable(format!(
                        "response did not parse as JSON after one reformat retry: {second_err}"
                    ))
                })
            }
        }
    }

    async fn chat_completions_request(
        &self,
        request: &CompleteRequest,
        reformat_hint: Option<&str>,
    ) -> Result<serde_json::Value, GatewayError> {
        if self.llm_api_key.trim().is_empty() {
            return Err(GatewayError::Rejected("llm_api_key is not configured".to_string()));
        }

        let mut messages = request.to_messages();
        if let Some(hint) = reformat_hint {
            messages.push(ChatMessage::assistant(""));
            messages.push(ChatMessage::user(hint.to_string()));
        }

        let mut payload = json!({
            "model": request.model,
            "messages": messages_to_openai(&messages),
            "max_tokens": request.max_tokens,
        });
        if request.json_mode {
            payload["response_format"] = json!({ "type": "json_object" });
        }
        if self.llm_style == LlmStyle::PromptCaching {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("cache_control".to_string(), json!({ "type": "ephemeral" }));
            }
        }

        let url = format!("{}/chat/completions", self.llm_base_url.trim_end_matches('/'));
        debug!(url = %url, model = %request.model, json_mode = request.json_mode, "sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.llm_api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| GatewayError::ServiceUnavailable(err.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| GatewayError::ServiceUnavailable(err.to_string()))?;

        if status.is_server_error() {
            return Err(GatewayError::ServiceUnavailable(format!(
                "provider returned {status}: {body}"
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::Rejected(format!(
                "provider returned {status}: {body}"
            )));
        }
        Ok(body)
    }

    /// Embed a batch of texts for `phase`. Returns one vector per input
    /// text, in input order.
    pub async fn embed(
        &self,
        texts: &[String],
        phase: EmbedPhase,
        model: &str,
    ) -> Result<Vec<Vec<f32>>, GatewayError> {
        if self.embedding_api_key.trim().is_empty() {
            return Err(GatewayError::Rejected(
                "embedding_api_key is not configured".to_string(),
            ));
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let payload = json!({
            "model": model,
            "input": texts,
        });
        let url = format!(
            "{}/embeddings",
            self.embedding_base_url.trim_end_matches('/')
        );
        debug!(url = %url, model = %model, count = texts.len(), phase = ?phase, "sending embedding request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.embedding_api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| GatewayError::ServiceUnavailable(err.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| GatewayError::ServiceUnavailable(err.to_string()))?;

        if status.is_server_error() {
            return Err(GatewayError::ServiceUnavailable(format!(
                "provider returned {status}: {body}"
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::Rejected(format!(
                "provider returned {status}: {body}"
            )));
        }

        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| {
                GatewayError::Unprocessable("embedding response missing 'data' array".to_string())
            })?;

        let mut vectors = Vec::with_capacity(data.len());
        for entry in data {
            let embedding = entry
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    GatewayError::Unprocessable(
                        "embedding entry missing 'embedding' array".to_string(),
                    )
                })?;
            let vector: Vec<f32> = embedding
                .iter()
                .filter_map(|v| v.as_f64())
                .map(|v| v as f32)
                .collect();
            if self.embedding_dim != 0 && vector.len() != self.embedding_dim {
                return Err(GatewayError::Unprocessable(format!(
                    "embedding dimension {} did not match configured {}",
                    vector.len(),
                    self.embedding_dim
                )));
            }
            vectors.push(vector);
        }
        Ok(vectors)
    }
}

fn extract_content(body: &serde_json::Value) -> Result<String, GatewayError> {
    body.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            GatewayError::Unprocessable(format!("no message content in response: {body}"))
        })
}

fn messages_to_openai(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            json!({ "role": role, "content": m.content })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_content_reads_first_choice() {
        let body = json!({
            "choices": [{"message": {"content": "hello"}}]
        });
        assert_eq!(extract_content(&body).unwrap(), "hello");
    }

    #[test]
    fn extract_content_errors_on_missing_choices() {
        let body = json!({"choices": []});
        assert!(extract_content(&body).is_err());
    }

    #[test]
    fn messages_to_openai_preserves_order_and_roles() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("yo"),
        ];
        let rendered = messages_to_openai(&messages);
        assert_eq!(rendered[0]["role"], "system");
        assert_eq!(rendered[1]["role"], "user");
        assert_eq!(rendered[2]["role"], "assistant");
    }

    #[test]
    fn request_builder_appends_prompt_after_history() {
        let request = CompleteRequest::new("gpt-4o-mini", "final question")
            .with_system("be terse")
            .with_history(vec![ChatMessage::user("first"), ChatMessage::assistant("second")]);
        let messages = request.to_messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages.last().unwrap().content, "final question");
    }
}
