//! Chat backends and the process-wide client registry.
//!
//! Each backend family speaks its own protocol and returns its own reply
//! shape ([`BackendReply`]); normalization into the front-end envelope
//! happens in [`crate::relay`].
//!
//! Unlike a stateless proxy, these clients carry session state (message
//! history, conversation caches, the tokenizer), so the [`BackendRegistry`]
//! builds one per [`BackendSlot`] on first use and hands out the same
//! `Arc` for the rest of the process lifetime.

use std::{collections::HashMap, future::Future, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::Config,
    model::{BackendSlot, Turn},
};

pub mod bing;
pub mod browser;
pub mod openai;

pub use bing::{BingChat, BingReply};
pub use browser::{BrowserProxy, BrowserReply};
pub use openai::{CompletionReply, OpenAiChat};

/// Reply from one backend, in that backend's own shape.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendReply {
    Completion(CompletionReply),
    Browser(BrowserReply),
    Bing(BingReply),
}

/// A long-lived client for one backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Answer `turn`. Implementations must stop work and return [`Aborted`]
    /// once `cancel` fires.
    async fn send(&self, turn: &Turn, cancel: &CancellationToken) -> anyhow::Result<BackendReply>;
}

/// Returned by a backend call that was torn down because the caller went away.
#[derive(Debug, thiserror::Error)]
#[error("request aborted by client")]
pub struct Aborted;

/// Run `fut` until it completes or `cancel` fires, whichever comes first.
///
/// Dropping `fut` drops any in-flight reqwest future with it, which closes the
/// underlying connection.
pub(crate) async fn abortable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Aborted.into()),
        result = fut => result,
    }
}

/// Builds the client for a slot from the config snapshot current at first use.
pub type BackendFactory =
    Arc<dyn Fn(BackendSlot, &Config) -> anyhow::Result<Arc<dyn ChatBackend>> + Send + Sync>;

/// One lazily-created client per [`BackendSlot`].
///
/// Concurrent first requests for the same slot build the client once. A
/// failed build is not cached; the next request tries again.
pub struct BackendRegistry {
    slots: HashMap<BackendSlot, OnceCell<Arc<dyn ChatBackend>>>,
    factory: BackendFactory,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(build_backend))
    }

    pub fn with_factory(factory: BackendFactory) -> Self {
        Self {
            slots: BackendSlot::ALL
                .into_iter()
                .map(|slot| (slot, OnceCell::new()))
                .collect(),
            factory,
        }
    }

    /// Return the client for `slot`, creating it on first use.
    pub async fn get(
        &self,
        slot: BackendSlot,
        config: &Config,
    ) -> anyhow::Result<Arc<dyn ChatBackend>> {
        let cell = self
            .slots
            .get(&slot)
            .with_context(|| format!("no registry slot for {slot}"))?;

        let backend = cell
            .get_or_try_init(|| async {
                info!(%slot, "creating backend client");
                (self.factory)(slot, config)
            })
            .await?;

        Ok(Arc::clone(backend))
    }

    /// Whether the client for `slot` has been created yet.
    #[cfg(test)]
    pub fn is_initialized(&self, slot: BackendSlot) -> bool {
        self.slots.get(&slot).is_some_and(OnceCell::initialized)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Default [`BackendFactory`]: builds the real HTTP/websocket clients.
fn build_backend(slot: BackendSlot, config: &Config) -> anyhow::Result<Arc<dyn ChatBackend>> {
    match slot {
        BackendSlot::Gpt35 | BackendSlot::Gpt4 => {
            let cfg = config.openai.as_ref().context("[openai] is not configured")?;
            let model = if slot == BackendSlot::Gpt35 { "gpt-3.5-turbo" } else { "gpt-4" };
            Ok(Arc::new(OpenAiChat::new(cfg, model)?))
        }
        BackendSlot::ProxyA | BackendSlot::ProxyB => {
            let cfg = config.browser.as_ref().context("[browser] is not configured")?;
            let index = if slot == BackendSlot::ProxyA { 0 } else { 1 };
            let url = cfg
                .reverse_proxy_urls
                .get(index)
                .with_context(|| format!("[browser] reverse_proxy_urls has no entry {index}"))?;
            Ok(Arc::new(BrowserProxy::new(cfg, url.clone())?))
        }
        BackendSlot::Bing => {
            let cfg = config.bing.as_ref().context("[bing] is not configured")?;
            Ok(Arc::new(BingChat::new(cfg)?))
        }
    }
}
