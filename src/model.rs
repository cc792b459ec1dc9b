//! Model selectors, the backend slot each one lives in, and the shared turn types.
//!
//! A [`ModelId`] is what the front-end puts in the `model` header. It decides
//! three things: which allow-list group authorises the caller, which
//! registry slot serves the request, and how the reply is labelled.

use std::str::FromStr;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Allow-list group shared by the browser-proxy and search-engine models.
pub const SHARED_GROUP: &str = "bing_chatgpt-browser";

/// Caller-selected model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelId {
    #[serde(rename = "chatgpt-3.5")]
    Gpt35,
    #[serde(rename = "chatgpt-4")]
    Gpt4,
    #[serde(rename = "chatgpt-browser-3.5-1")]
    BrowserA,
    #[serde(rename = "chatgpt-browser-3.5-2")]
    BrowserB,
    #[serde(rename = "bing-chat")]
    BingChat,
    #[serde(rename = "bing-sydney")]
    BingSydney,
}

impl ModelId {
    pub const ALL: [ModelId; 6] = [
        Self::Gpt35,
        Self::Gpt4,
        Self::BrowserA,
        Self::BrowserB,
        Self::BingChat,
        Self::BingSydney,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gpt35 => "chatgpt-3.5",
            Self::Gpt4 => "chatgpt-4",
            Self::BrowserA => "chatgpt-browser-3.5-1",
            Self::BrowserB => "chatgpt-browser-3.5-2",
            Self::BingChat => "bing-chat",
            Self::BingSydney => "bing-sydney",
        }
    }

    /// Name of the `[allow_list]` entry that authorises this model.
    pub fn allow_group(self) -> &'static str {
        match self {
            Self::Gpt35 | Self::Gpt4 => self.as_str(),
            Self::BrowserA | Self::BrowserB | Self::BingChat | Self::BingSydney => SHARED_GROUP,
        }
    }

    pub fn slot(self) -> BackendSlot {
        match self {
            Self::Gpt35 => BackendSlot::Gpt35,
            Self::Gpt4 => BackendSlot::Gpt4,
            Self::BrowserA => BackendSlot::ProxyA,
            Self::BrowserB => BackendSlot::ProxyB,
            Self::BingChat | Self::BingSydney => BackendSlot::Bing,
        }
    }

    /// Label shown next to the reply in the front-end.
    pub fn bot_label(self) -> &'static str {
        match self {
            Self::Gpt35 => "GPT3.5",
            Self::Gpt4 => "GPT4",
            Self::BrowserA | Self::BrowserB => "ChatGPT3.5",
            Self::BingChat => "Bing",
            Self::BingSydney => "Sydney",
        }
    }

    /// `bing-sydney` runs the search-engine client in jailbreak mode.
    pub fn is_jailbreak(self) -> bool {
        matches!(self, Self::BingSydney)
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown model `{0}`")]
pub struct UnknownModel(pub String);

impl FromStr for ModelId {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownModel(s.to_owned()))
    }
}

/// One long-lived client instance in the backend registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendSlot {
    Gpt35,
    Gpt4,
    ProxyA,
    ProxyB,
    Bing,
}

impl BackendSlot {
    pub const ALL: [BackendSlot; 5] = [
        Self::Gpt35,
        Self::Gpt4,
        Self::ProxyA,
        Self::ProxyB,
        Self::Bing,
    ];
}

impl std::fmt::Display for BackendSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Gpt35 => "openai:gpt-3.5-turbo",
            Self::Gpt4 => "openai:gpt-4",
            Self::ProxyA => "browser:a",
            Self::ProxyB => "browser:b",
            Self::Bing => "bing",
        })
    }
}

/// Continuation ids threaded from one reply into the next request.
///
/// The relay never interprets these; each backend picks the ones it
/// understands and returns fresh values in its reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Continuation {
    #[serde(default, deserialize_with = "opaque_id", skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, deserialize_with = "opaque_id", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, deserialize_with = "opaque_id", skip_serializing_if = "Option::is_none")]
    pub conversation_signature: Option<String>,
    #[serde(default, deserialize_with = "opaque_id", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, deserialize_with = "counter", skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<u64>,
    #[serde(default, deserialize_with = "opaque_id", skip_serializing_if = "Option::is_none")]
    pub jailbreak_conversation_id: Option<String>,
}

/// Any scalar, kept in its text form. `null` counts as absent.
pub fn opaque_id<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(de)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(D::Error::custom(format!("expected a string or number, got {other}"))),
    }
}

/// Invocation counters arrive as numbers or as numeric strings.
fn counter<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
    match Value::deserialize(de)? {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invocationId `{s}` is not a counter"))),
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invocationId {n} is not a counter"))),
        other => Err(D::Error::custom(format!("invocationId {other} is not a counter"))),
    }
}

/// What a backend is asked to answer.
#[derive(Debug, Clone)]
pub struct Turn {
    pub model: ModelId,
    pub prompt: String,
    pub continuation: Continuation,
}

/// Token accounting reported by the completion API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_selector_parses_back_to_itself() {
        for model in ModelId::ALL {
            assert_eq!(model.as_str().parse::<ModelId>().unwrap(), model);
        }
    }

    #[test]
    fn unknown_selector_is_rejected() {
        let err = "gpt-5".parse::<ModelId>().unwrap_err();
        assert_eq!(err.to_string(), "unknown model `gpt-5`");
        assert!("".parse::<ModelId>().is_err());
        // Selectors are case-sensitive
        assert!("Bing-Chat".parse::<ModelId>().is_err());
    }

    #[test]
    fn browser_and_bing_models_share_one_group() {
        for model in [ModelId::BrowserA, ModelId::BrowserB, ModelId::BingChat, ModelId::BingSydney] {
            assert_eq!(model.allow_group(), SHARED_GROUP);
        }
        assert_eq!(ModelId::Gpt35.allow_group(), "chatgpt-3.5");
        assert_eq!(ModelId::Gpt4.allow_group(), "chatgpt-4");
    }

    #[test]
    fn both_bing_modes_use_the_same_slot() {
        assert_eq!(ModelId::BingChat.slot(), ModelId::BingSydney.slot());
        assert_ne!(ModelId::BrowserA.slot(), ModelId::BrowserB.slot());
    }

    #[test]
    fn serde_names_match_selectors() {
        for model in ModelId::ALL {
            let json = serde_json::to_value(model).unwrap();
            assert_eq!(json, model.as_str());
        }
    }

    #[test]
    fn continuation_uses_camel_case_and_skips_absent_fields() {
        let c = Continuation {
            msg_id: Some("m1".into()),
            invocation_id: Some(2),
            ..Default::default()
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json, serde_json::json!({ "msgId": "m1", "invocationId": 2 }));
    }

    #[test]
    fn continuation_accepts_ids_of_any_scalar_type() {
        let c: Continuation = serde_json::from_value(serde_json::json!({
            "msgId": 7,
            "conversationId": "c-1",
            "clientId": null,
            "invocationId": "2"
        }))
        .unwrap();
        assert_eq!(c.msg_id.as_deref(), Some("7"));
        assert_eq!(c.conversation_id.as_deref(), Some("c-1"));
        assert_eq!(c.client_id, None);
        assert_eq!(c.invocation_id, Some(2));
    }

    #[test]
    fn continuation_rejects_non_counter_invocation_id() {
        for bad in [serde_json::json!("two"), serde_json::json!(-1), serde_json::json!([1])] {
            let result = serde_json::from_value::<Continuation>(serde_json::json!({ "invocationId": bad }));
            assert!(result.is_err(), "accepted {bad}");
        }
    }
}
