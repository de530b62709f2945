//! The model boundary: one rendered prompt in, raw text out.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::cache::{CallCache, CallCacheKey};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::prompts::PromptInstance;

/// Sampling temperature for every stage.
pub const DEFAULT_TEMPERATURE: f32 = 0.3;

pub const DEFAULT_MODEL: &str = "mistralai/mistral-large";

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call_model(
        &self,
        prompt: &PromptInstance,
        max_tokens: u32,
    ) -> Result<String, ProviderError>;

    /// Called once `content` returned for `prompt` has parsed; clients that
    /// persist output do so here so unreadable answers are never replayed.
    async fn commit(&self, _prompt: &PromptInstance, _max_tokens: u32, _content: &str) {}

    /// Identifier used in cache keys and traces.
    fn model_id(&self) -> &str;
}

/// Usage-attribution caller for a stage template.
fn caller_for(slug: &str) -> &'static str {
    if slug.starts_with("extract") {
        "pipeline::extract"
    } else if slug.starts_with("normalize") {
        "pipeline::normalize"
    } else if slug.starts_with("reassign") {
        "pipeline::reassign"
    } else if slug.starts_with("summarize") {
        "pipeline::summarize"
    } else {
        "pipeline"
    }
}

/// Templates answered with a top-level JSON object. Array-returning stages
/// cannot use `json_object` mode.
fn returns_object(slug: &str) -> bool {
    slug.starts_with("normalize") || slug.starts_with("summarize")
}

// =============================================================================
// Gateway-backed client
// =============================================================================

/// [`ModelClient`] over a [`ChatGateway`].
pub struct GatewayModelClient {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    temperature: f32,
    json_objects: bool,
    run_id: Option<Uuid>,
}

impl GatewayModelClient {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            json_objects: true,
            run_id: None,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    /// Request `json_object` response format for object-returning stages
    /// (on by default). Turn off for providers that reject the parameter.
    pub fn json_objects(mut self, enabled: bool) -> Self {
        self.json_objects = enabled;
        self
    }

    /// Attribute every call to an analysis run.
    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[async_trait]
impl ModelClient for GatewayModelClient {
    async fn call_model(
        &self,
        prompt: &PromptInstance,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let mut attribution = Attribution::new(caller_for(&prompt.template_slug));
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }

        let mut req = ChatRequest::new(
            ChatModel::openrouter(&self.model),
            prompt.to_messages(),
            attribution,
        )
        .temperature(self.temperature)
        .max_tokens(max_tokens);
        if self.json_objects && returns_object(&prompt.template_slug) {
            req = req.json();
        }

        let resp = self.gateway.chat(req).await?;
        Ok(resp.content)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// =============================================================================
// Caching wrapper
// =============================================================================

/// Serves repeated prompts from a [`CallCache`].
///
/// Output is stored on [`ModelClient::commit`], i.e. only after the stage
/// parsed it. Cache failures never fail a call; they are logged and the inner
/// client is used directly.
pub struct CachedModelClient<M: ModelClient> {
    inner: M,
    cache: Arc<dyn CallCache>,
}

impl<M: ModelClient> CachedModelClient<M> {
    pub fn new(inner: M, cache: Arc<dyn CallCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl<M: ModelClient> ModelClient for CachedModelClient<M> {
    async fn call_model(
        &self,
        prompt: &PromptInstance,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let key = CallCacheKey::new(self.inner.model_id(), prompt, max_tokens);

        match self.cache.get(&key).await {
            Ok(Some(content)) => {
                tracing::debug!(slug = %prompt.template_slug, key = %key.key_hash, "model cache hit");
                return Ok(content);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "model cache read failed"),
        }

        self.inner.call_model(prompt, max_tokens).await
    }

    async fn commit(&self, prompt: &PromptInstance, max_tokens: u32, content: &str) {
        self.inner.commit(prompt, max_tokens, content).await;
        let key = CallCacheKey::new(self.inner.model_id(), prompt, max_tokens);
        if let Err(e) = self.cache.put(&key, content).await {
            tracing::warn!(error = %e, "model cache write failed");
        }
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}
