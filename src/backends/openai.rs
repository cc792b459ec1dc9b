//! Official completion API client (`/v1/chat/completions`).
//!
//! The API itself is stateless, so this client keeps the conversation: every
//! user message and reply is stored under its id, and a new turn walks its
//! `msgId` parent chain back through the store to rebuild the prompt. History
//! is trimmed oldest-first so the prompt plus the reserved reply budget fits
//! the model's context window.

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{header, Client};
use serde_json::{json, Value};
use tiktoken_rs::CoreBPE;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{abortable, BackendReply, ChatBackend};
use crate::{
    config::OpenAiConfig,
    model::{Turn, Usage},
};

/// Framing tokens the chat format adds around every message.
const TOKENS_PER_MESSAGE: usize = 4;

/// Tokens the API adds to prime the assistant reply.
const REPLY_PRIMING_TOKENS: usize = 3;

/// Reply in the completion API client's shape.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReply {
    /// Completion id; the next turn passes it back as `msgId`.
    pub id: String,
    /// The completion API has no server-side conversation.
    pub conversation_id: Option<String>,
    /// Id assigned to the user message this reply answers.
    pub parent_message_id: String,
    pub text: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    role: Role,
    text: String,
    parent_id: Option<String>,
}

/// Client for one completion model (`gpt-3.5-turbo`, `gpt-4`, ...).
pub struct OpenAiChat {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    top_p: f32,
    presence_penalty: f32,
    max_model_tokens: usize,
    max_response_tokens: usize,
    system_message: Option<String>,
    messages: DashMap<String, StoredMessage>,
    /// Store ids oldest first; the front is evicted past `max_stored_messages`.
    insertion_order: Mutex<VecDeque<String>>,
    max_stored_messages: usize,
    bpe: CoreBPE,
}

impl OpenAiChat {
    /// Build a client for `model` from the `[openai]` section.
    ///
    /// Resolves the API key from `cfg.api_key_env` (if any) and injects it as a
    /// static `Authorization: Bearer ...` header.
    pub fn new(cfg: &OpenAiConfig, model: &str) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = cfg.api_key() {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {key}"))
                    .context("invalid API key value for Authorization header")?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            presence_penalty: cfg.presence_penalty,
            max_model_tokens: cfg.max_model_tokens,
            max_response_tokens: cfg.max_response_tokens,
            system_message: cfg.system_message.clone(),
            messages: DashMap::new(),
            insertion_order: Mutex::new(VecDeque::new()),
            max_stored_messages: cfg.max_stored_messages,
            bpe: tiktoken_rs::cl100k_base().context("loading cl100k tokenizer")?,
        })
    }

    fn system_message(&self) -> String {
        self.system_message.clone().unwrap_or_else(|| {
            format!(
                "You are ChatGPT, a large language model trained by OpenAI. \
                 Answer as concisely as possible.\nKnowledge cutoff: 2021-09-01\nCurrent date: {}",
                chrono::Local::now().format("%Y-%m-%d")
            )
        })
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len() + TOKENS_PER_MESSAGE
    }

    /// Assemble `[system, ...history, user]` and return it with its token count.
    fn build_messages(&self, prompt: &str, parent_id: Option<&str>) -> (Vec<Value>, usize) {
        let budget = self.max_model_tokens - self.max_response_tokens;
        let system = self.system_message();
        let mut used = REPLY_PRIMING_TOKENS + self.count_tokens(&system) + self.count_tokens(prompt);

        // Newest first while walking; reversed below.
        let mut history = Vec::new();
        let mut next = parent_id.map(str::to_owned);
        while let Some(id) = next {
            let Some(message) = self.messages.get(&id).map(|m| m.value().clone()) else {
                break;
            };
            let cost = self.count_tokens(&message.text);
            if used + cost > budget {
                debug!(dropped_from = %id, "history trimmed to fit context window");
                break;
            }
            used += cost;
            next = message.parent_id.clone();
            history.push(message);
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(json!({ "role": "system", "content": system }));
        messages.extend(
            history
                .iter()
                .rev()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.text })),
        );
        messages.push(json!({ "role": "user", "content": prompt }));

        (messages, used)
    }

    /// Store a message, evicting the oldest ones once the store is full.
    fn remember(&self, id: String, message: StoredMessage) {
        let mut order = self
            .insertion_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.messages.insert(id.clone(), message).is_none() {
            order.push_back(id);
        }
        while order.len() > self.max_stored_messages {
            let Some(oldest) = order.pop_front() else { break };
            self.messages.remove(&oldest);
        }
    }

    /// Forward a chat completions request body to `POST /v1/chat/completions`.
    async fn chat_completions(&self, body: Value) -> anyhow::Result<Value> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let text = response.text().await.context("reading response body")?;

        if !status.is_success() {
            anyhow::bail!("OpenAI returned HTTP {status}: {text}");
        }

        serde_json::from_str(&text)
            .with_context(|| format!("parsing OpenAI response as JSON: {text}"))
    }

    /// Number of stored messages (user and assistant).
    #[cfg(test)]
    pub fn stored_messages(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl ChatBackend for OpenAiChat {
    async fn send(&self, turn: &Turn, cancel: &CancellationToken) -> anyhow::Result<BackendReply> {
        let parent_id = turn.continuation.msg_id.as_deref();
        let (messages, prompt_tokens) = self.build_messages(&turn.prompt, parent_id);
        // A prompt that fills the whole window still asks for one token.
        let max_tokens = self
            .max_response_tokens
            .min(self.max_model_tokens.saturating_sub(prompt_tokens))
            .max(1);

        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "presence_penalty": self.presence_penalty,
            "max_tokens": max_tokens,
            "messages": messages,
        });

        debug!(model = %self.model, prompt_tokens, max_tokens, "sending completion request");
        let response = abortable(cancel, self.chat_completions(body)).await?;

        let text = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .context("completion response has no message content")?
            .trim()
            .to_string();
        let id = response
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let usage = response
            .get("usage")
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());

        let user_id = Uuid::new_v4().to_string();
        self.remember(
            user_id.clone(),
            StoredMessage {
                role: Role::User,
                text: turn.prompt.clone(),
                parent_id: parent_id.map(str::to_owned),
            },
        );
        self.remember(
            id.clone(),
            StoredMessage {
                role: Role::Assistant,
                text: text.clone(),
                parent_id: Some(user_id.clone()),
            },
        );

        Ok(BackendReply::Completion(CompletionReply {
            id,
            conversation_id: None,
            parent_message_id: user_id,
            text,
            usage,
        }))
    }
}
