//! The `/conversation` core: dispatch a turn to the caller's backend and
//! reshape whatever comes back into one envelope.
//!
//! Failures never become HTTP errors here. A backend error, an empty
//! question or a cancelled call all produce `{ts, error}` so the front-end
//! can show the message inline; only the allow-list gate answers 401.

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Instant,
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    backends::{Aborted, BackendRegistry, BackendReply},
    config::Config,
    model::{opaque_id, Continuation, ModelId, Turn, Usage},
    usage::{UsageEntry, UsageLog},
};

/// Placeholder text for models switched off in `server.unavailable_models`.
pub const UNAVAILABLE_TEXT: &str = "Temporarily unavailable!!!";

/// Shared application state injected into every request handler via [`axum::extract::State`].
pub struct RelayState {
    /// Atomically-swappable live config; the lock is held only for the duration
    /// of `Arc::clone`.
    config_lock: RwLock<Arc<Config>>,
    /// Path to the config file on disk, watched by the hot-reload task.
    pub config_path: PathBuf,
    /// One long-lived client per backend slot.
    ///
    /// Clients are built from the config current at their first use and are
    /// not rebuilt on hot-reload.
    pub registry: BackendRegistry,
    pub usage: UsageLog,
}

impl RelayState {
    pub fn new(config: Arc<Config>, config_path: PathBuf) -> Self {
        Self::with_registry(config, config_path, BackendRegistry::new())
    }

    pub fn with_registry(config: Arc<Config>, config_path: PathBuf, registry: BackendRegistry) -> Self {
        let usage = UsageLog::new(config.server.log_dir.clone());
        Self {
            config_lock: RwLock::new(config),
            config_path,
            registry,
            usage,
        }
    }

    /// Returns a snapshot of the current live config.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replaces the live config. Called only from the hot-reload task.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }
}

/// An authorised caller, attached to the request by the allow-list gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    pub model: ModelId,
    pub ip: String,
}

/// `POST /conversation` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationRequest {
    /// Client timestamp, echoed back untouched.
    #[serde(default)]
    pub ts: Value,
    /// `null` reads as an empty question.
    #[serde(default, deserialize_with = "question")]
    pub q: String,
    /// Optional repeat of the `model` header.
    #[serde(default, deserialize_with = "opaque_id")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub continuation: Continuation,
}

fn question<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(opaque_id(de)?.unwrap_or_default())
}

/// `/conversation` response body: an answer or an error envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Answer(Answer),
    Failure(Failure),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    #[serde(skip_serializing_if = "Value::is_null")]
    pub ts: Value,
    pub q: String,
    pub bot: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jailbreak_conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_responses: Option<Vec<String>>,
}

impl Answer {
    fn bare(model: ModelId, ts: Value, q: String, text: String) -> Self {
        Self {
            ts,
            q,
            bot: model.bot_label(),
            msg_id: None,
            conversation_id: None,
            text,
            usage: None,
            jailbreak_conversation_id: None,
            conversation_signature: None,
            client_id: None,
            invocation_id: None,
            suggested_responses: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    #[serde(skip_serializing_if = "Value::is_null")]
    pub ts: Value,
    pub error: String,
}

/// Answer one `/conversation` request and record it in the usage log.
///
/// `cancel` is handed to the backend call; when it fires the call fails with
/// [`Aborted`] and the request is logged as failed.
#[tracing::instrument(
    skip_all,
    fields(user = %caller.user, model = %caller.model, ip = %caller.ip)
)]
pub async fn converse(
    state: &RelayState,
    caller: &Caller,
    request: ConversationRequest,
    request_id: Option<&str>,
    cancel: &CancellationToken,
) -> Reply {
    let ts = request.ts.clone();
    let started = Instant::now();

    let (reply, entry) = match answer(state, caller, request, cancel).await {
        Ok(answer) => {
            info!(
                bot = answer.bot,
                latency_ms = started.elapsed().as_millis() as u64,
                "conversation answered"
            );
            let tokens = answer.usage.map(|u| u.total_tokens).filter(|&t| t > 0);
            let entry = UsageEntry::answered(ts, &caller.ip, answer.bot, tokens);
            (Reply::Answer(answer), entry)
        }
        Err(e) => {
            let message = format!("{e:#}");
            if e.is::<Aborted>() {
                info!("client went away; backend call aborted");
            } else {
                warn!(error = %message, "conversation failed");
            }
            let entry = UsageEntry::failed(ts.clone(), &caller.ip, message.clone());
            (Reply::Failure(Failure { ts, error: message }), entry)
        }
    };

    state
        .usage
        .record(&caller.user, &entry.with_request_id(request_id))
        .await;
    reply
}

/// Answer a request whose body could not be read, with the same envelope and
/// usage line as any other failure.
pub async fn reject(
    state: &RelayState,
    caller: &Caller,
    ts: Value,
    error: String,
    request_id: Option<&str>,
) -> Reply {
    warn!(user = %caller.user, model = %caller.model, %error, "unreadable conversation body");
    let entry = UsageEntry::failed(ts.clone(), &caller.ip, error.clone());
    state
        .usage
        .record(&caller.user, &entry.with_request_id(request_id))
        .await;
    Reply::Failure(Failure { ts, error })
}

async fn answer(
    state: &RelayState,
    caller: &Caller,
    request: ConversationRequest,
    cancel: &CancellationToken,
) -> anyhow::Result<Answer> {
    let model = caller.model;
    anyhow::ensure!(!request.q.trim().is_empty(), "question must not be empty");

    let config = state.config();
    if config.is_unavailable(model) {
        return Ok(Answer::bare(model, request.ts, request.q, UNAVAILABLE_TEXT.into()));
    }

    let backend = state.registry.get(model.slot(), &config).await?;
    let turn = Turn {
        model,
        prompt: request.q,
        continuation: request.continuation,
    };
    let reply = backend.send(&turn, cancel).await?;

    Ok(normalize(model, reply, request.ts, turn.prompt))
}

/// Reshape a backend reply into the front-end envelope.
pub fn normalize(model: ModelId, reply: BackendReply, ts: Value, q: String) -> Answer {
    match reply {
        BackendReply::Completion(c) => Answer {
            msg_id: Some(c.id),
            conversation_id: c.conversation_id,
            usage: c.usage,
            ..Answer::bare(model, ts, q, c.text)
        },
        BackendReply::Browser(b) => Answer {
            msg_id: Some(b.message_id),
            conversation_id: b.conversation_id,
            ..Answer::bare(model, ts, q, b.response)
        },
        BackendReply::Bing(b) => Answer {
            msg_id: Some(b.message_id),
            conversation_id: Some(b.conversation_id),
            jailbreak_conversation_id: b.jailbreak_conversation_id,
            conversation_signature: Some(b.conversation_signature),
            client_id: Some(b.client_id),
            invocation_id: Some(b.invocation_id),
            suggested_responses: Some(b.suggested_responses),
            ..Answer::bare(model, ts, q, b.response)
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        backends::{BackendFactory, BingReply, BrowserReply, ChatBackend, CompletionReply},
        model::BackendSlot,
    };

    // -----------------------------------------------------------------------
    // Test helpers
    // -----------------------------------------------------------------------

    /// Records every turn it sees and answers with a fixed reply.
    struct Scripted {
        reply: Result<BackendReply, String>,
        seen: Arc<Mutex<Vec<Turn>>>,
    }

    #[async_trait]
    impl ChatBackend for Scripted {
        async fn send(&self, turn: &Turn, _: &CancellationToken) -> anyhow::Result<BackendReply> {
            self.seen.lock().unwrap().push(turn.clone());
            self.reply.clone().map_err(anyhow::Error::msg)
        }
    }

    struct Harness {
        state: RelayState,
        seen: Arc<Mutex<Vec<Turn>>>,
        builds: Arc<AtomicUsize>,
        _logs: tempfile::TempDir,
    }

    fn harness(reply: Result<BackendReply, String>, extra_toml: &str) -> Harness {
        let logs = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&format!(
            "[server]\nlog_dir = {:?}\n{extra_toml}",
            logs.path().display().to_string()
        ))
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let builds = Arc::new(AtomicUsize::new(0));
        let factory: BackendFactory = {
            let seen = Arc::clone(&seen);
            let builds = Arc::clone(&builds);
            Arc::new(move |_: BackendSlot, _: &Config| {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Scripted { reply: reply.clone(), seen: Arc::clone(&seen) })
                    as Arc<dyn ChatBackend>)
            })
        };

        Harness {
            state: RelayState::with_registry(
                Arc::new(config),
                PathBuf::from("settings.toml"),
                BackendRegistry::with_factory(factory),
            ),
            seen,
            builds,
            _logs: logs,
        }
    }

    fn caller(model: ModelId) -> Caller {
        Caller { user: "alice".into(), model, ip: "10.0.0.1".into() }
    }

    fn request(q: &str) -> ConversationRequest {
        ConversationRequest { ts: json!(1_700_000_000), q: q.into(), ..Default::default() }
    }

    async fn usage_lines(h: &Harness) -> Vec<Value> {
        let path = h.state.usage.path_for("alice").unwrap();
        tokio::fs::read_to_string(path)
            .await
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn completion() -> BackendReply {
        BackendReply::Completion(CompletionReply {
            id: "chatcmpl-1".into(),
            conversation_id: None,
            parent_message_id: "user-1".into(),
            text: "Hello!".into(),
            usage: Some(Usage { prompt_tokens: 61, completion_tokens: 15, total_tokens: 76 }),
        })
    }

    // -----------------------------------------------------------------------
    // converse
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn completion_reply_is_normalized_and_logged_with_tokens() {
        let h = harness(Ok(completion()), "");
        let reply = converse(&h.state, &caller(ModelId::Gpt35), request("hi"), Some("req-1"), &CancellationToken::new()).await;

        let body = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            body,
            json!({
                "ts": 1_700_000_000,
                "q": "hi",
                "bot": "GPT3.5",
                "msgId": "chatcmpl-1",
                "text": "Hello!",
                "usage": { "prompt_tokens": 61, "completion_tokens": 15, "total_tokens": 76 }
            })
        );

        let lines = usage_lines(&h).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["bot"], "GPT3.5");
        assert_eq!(lines[0]["tokens"], 76);
        assert_eq!(lines[0]["ip"], "10.0.0.1");
        assert_eq!(lines[0]["request_id"], "req-1");
    }

    #[tokio::test]
    async fn continuation_fields_reach_the_backend_verbatim() {
        let h = harness(Ok(completion()), "");
        let continuation = Continuation {
            msg_id: Some("m-41".into()),
            conversation_id: Some("c-7".into()),
            conversation_signature: Some("sig==".into()),
            client_id: Some("client".into()),
            invocation_id: Some(5),
            jailbreak_conversation_id: Some("jb-2".into()),
        };
        let req = ConversationRequest { continuation: continuation.clone(), ..request("next") };

        converse(&h.state, &caller(ModelId::BingChat), req, None, &CancellationToken::new()).await;

        let seen = h.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].continuation, continuation);
        assert_eq!(seen[0].prompt, "next");
        assert_eq!(seen[0].model, ModelId::BingChat);
    }

    #[tokio::test]
    async fn request_body_continuation_parses_from_camel_case() {
        let req: ConversationRequest = serde_json::from_value(json!({
            "ts": "12:00",
            "q": "hello",
            "model": "bing-chat",
            "msgId": "m",
            "conversationId": "c",
            "conversationSignature": "s",
            "clientId": "k",
            "invocationId": 2,
            "jailbreakConversationId": "j"
        }))
        .unwrap();

        assert_eq!(req.ts, json!("12:00"));
        assert_eq!(req.model.as_deref(), Some("bing-chat"));
        assert_eq!(req.continuation.invocation_id, Some(2));
        assert_eq!(req.continuation.jailbreak_conversation_id.as_deref(), Some("j"));
    }

    #[test]
    fn null_question_reads_as_empty() {
        let req: ConversationRequest =
            serde_json::from_value(json!({ "ts": 1, "q": null, "msgId": 12 })).unwrap();
        assert_eq!(req.q, "");
        assert_eq!(req.continuation.msg_id.as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn rejected_body_is_an_error_envelope_and_logged() {
        let h = harness(Ok(completion()), "");
        let reply = reject(&h.state, &caller(ModelId::Gpt35), json!(5), "bad body".into(), Some("r-9")).await;

        assert_eq!(serde_json::to_value(&reply).unwrap(), json!({ "ts": 5, "error": "bad body" }));
        let lines = usage_lines(&h).await;
        assert_eq!(lines[0]["error"], "bad body");
        assert_eq!(lines[0]["request_id"], "r-9");
        assert_eq!(h.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unavailable_model_answers_placeholder_without_backend() {
        let h = harness(Ok(completion()), "unavailable_models = [\"chatgpt-4\"]");
        let reply = converse(&h.state, &caller(ModelId::Gpt4), request("hi"), None, &CancellationToken::new()).await;

        let body = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            body,
            json!({ "ts": 1_700_000_000, "q": "hi", "bot": "GPT4", "text": UNAVAILABLE_TEXT })
        );
        assert_eq!(h.builds.load(Ordering::SeqCst), 0);
        assert!(!h.state.registry.is_initialized(BackendSlot::Gpt4));
        assert_eq!(usage_lines(&h).await[0]["bot"], "GPT4");
    }

    #[tokio::test]
    async fn empty_question_is_an_error_envelope_without_backend() {
        let h = harness(Ok(completion()), "");
        let reply = converse(&h.state, &caller(ModelId::Gpt35), request("   "), None, &CancellationToken::new()).await;

        let Reply::Failure(failure) = reply else { panic!("expected failure, got {reply:?}") };
        assert_eq!(failure.error, "question must not be empty");
        assert_eq!(h.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn backend_error_becomes_error_envelope_and_is_logged() {
        let h = harness(Err("upstream returned HTTP 429".into()), "");
        let reply = converse(&h.state, &caller(ModelId::BrowserA), request("hi"), None, &CancellationToken::new()).await;

        let body = serde_json::to_value(&reply).unwrap();
        assert_eq!(body, json!({ "ts": 1_700_000_000, "error": "upstream returned HTTP 429" }));

        let lines = usage_lines(&h).await;
        assert_eq!(lines[0]["error"], "upstream returned HTTP 429");
        assert!(lines[0].get("bot").is_none());
    }

    #[tokio::test]
    async fn registry_failure_becomes_error_envelope() {
        let logs = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&format!(
            "[server]\nlog_dir = {:?}",
            logs.path().display().to_string()
        ))
        .unwrap();
        let state = RelayState::new(Arc::new(config), PathBuf::from("settings.toml"));

        let reply = converse(&state, &caller(ModelId::BingSydney), request("hi"), None, &CancellationToken::new()).await;

        let Reply::Failure(failure) = reply else { panic!("expected failure, got {reply:?}") };
        assert!(failure.error.contains("[bing] is not configured"), "got: {}", failure.error);
    }

    // -----------------------------------------------------------------------
    // normalize
    // -----------------------------------------------------------------------

    #[test]
    fn browser_reply_keeps_conversation_id() {
        let reply = BackendReply::Browser(BrowserReply {
            message_id: "m-2".into(),
            conversation_id: Some("c-2".into()),
            response: "hey".into(),
        });
        let body = serde_json::to_value(normalize(ModelId::BrowserB, reply, Value::Null, "q".into())).unwrap();
        assert_eq!(
            body,
            json!({ "q": "q", "bot": "ChatGPT3.5", "msgId": "m-2", "conversationId": "c-2", "text": "hey" })
        );
    }

    #[test]
    fn search_engine_reply_carries_all_continuation_fields() {
        let reply = BackendReply::Bing(BingReply {
            conversation_id: "c".into(),
            conversation_signature: "s".into(),
            client_id: "k".into(),
            invocation_id: 3,
            message_id: "m".into(),
            jailbreak_conversation_id: Some("j".into()),
            response: "yo".into(),
            suggested_responses: vec!["more".into()],
        });
        let body = serde_json::to_value(normalize(ModelId::BingSydney, reply, json!(9), "q".into())).unwrap();
        assert_eq!(
            body,
            json!({
                "ts": 9,
                "q": "q",
                "bot": "Sydney",
                "msgId": "m",
                "conversationId": "c",
                "text": "yo",
                "jailbreakConversationId": "j",
                "conversationSignature": "s",
                "clientId": "k",
                "invocationId": 3,
                "suggestedResponses": ["more"]
            })
        );
    }
}
