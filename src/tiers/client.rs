//! Uniform interface over the three serving backends.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::cache::entry::{decode_tokens, encode_tokens};
use crate::cache::manager::KvCacheManager;
use crate::error::ServingError;
use crate::inference::model::{tokenize, TokenId};
use crate::registry::descriptor::TierId;
use crate::router::envelope::{GenerationContext, RequestEnvelope, ResponseSource};

/// Raw tier output, before the guardrail sees it.
#[derive(Debug, Clone)]
pub struct TierOutput {
    pub content: String,
    pub source: ResponseSource,
    pub job_id: Option<String>,
    pub adapter_version: Option<u64>,
}

impl TierOutput {
    pub fn model(content: String, adapter_version: u64) -> Self {
        Self {
            content,
            source: ResponseSource::Model,
            job_id: None,
            adapter_version: Some(adapter_version),
        }
    }
}

#[async_trait]
pub trait TierClient: Send + Sync {
    fn tier(&self) -> TierId;

    /// Serve `request`, giving up at `deadline` (which may be tighter than the request's own).
    async fn infer(
        &self,
        request: &RequestEnvelope,
        deadline: Instant,
    ) -> Result<TierOutput, ServingError>;

    /// Whether this tier holds warm decode state for the entity.
    fn is_warm(&self, _entity_id: &str) -> bool {
        false
    }
}

/// One client per tier.
#[derive(Clone)]
pub struct TierClients {
    pub gold: Arc<dyn TierClient>,
    pub silver: Arc<dyn TierClient>,
    pub bronze: Arc<dyn TierClient>,
}

impl TierClients {
    pub fn get(&self, tier: TierId) -> &Arc<dyn TierClient> {
        match tier {
            TierId::Gold => &self.gold,
            TierId::Silver => &self.silver,
            TierId::Bronze => &self.bronze,
        }
    }
}

/// Token context for a request: the shared system prefix, then the entity's
/// cached window (or its supplied history on a miss), then the prompt.
///
/// Returns the full context and the conversation part without the prefix.
pub(crate) fn assemble_context(
    cache: &KvCacheManager,
    request: &RequestEnvelope,
    vocab_size: usize,
) -> (Vec<TokenId>, Vec<TokenId>) {
    let mut conversation = match cache.get(&request.entity_id) {
        Some(entry) => decode_tokens(&entry.kv_blocks),
        None => tokenize(&request.context.history.join(" "), vocab_size),
    };
    conversation.extend(tokenize(&request.context.prompt, vocab_size));

    let mut context = Vec::new();
    if let Some(system) = &request.context.system {
        let (prefix, _) = cache
            .prefix_cache()
            .get_or_insert_with(system, || tokenize(system, vocab_size));
        context.extend_from_slice(&prefix.tokens);
    }
    context.extend_from_slice(&conversation);
    (context, conversation)
}

/// Store the conversation plus the new output as the entity's decode state,
/// keeping the last `window` tokens.
pub(crate) fn store_window(
    cache: &KvCacheManager,
    entity_id: &str,
    mut conversation: Vec<TokenId>,
    output: &[TokenId],
    window: usize,
) {
    conversation.extend_from_slice(output);
    let skip = conversation.len().saturating_sub(window);
    cache.put(entity_id, encode_tokens(&conversation[skip..]));
}

/// Flatten a context into a single prompt for backends without a prefix cache.
pub fn render_prompt(context: &GenerationContext) -> String {
    let mut parts = Vec::with_capacity(context.history.len() + 2);
    if let Some(system) = &context.system {
        parts.push(system.as_str());
    }
    parts.extend(context.history.iter().map(String::as_str));
    parts.push(&context.prompt);
    parts.join("\n")
}
