//! Survey response analysis pipeline.
//!
//! Stages run strictly in order, each over the full response set:
//! 1. **Extraction**: 2-5 raw tags per response, batched
//! 2. **Normalization**: cluster raw tags into canonical tags
//! 3. **Reassignment**: canonical tags per response (closed vocabulary)
//! 4. **Grouping**: one group of responses per canonical tag
//! 5. **Summarization**: synthesis and verbatims per group
//!
//! Malformed model output degrades per item (empty batch contribution, empty
//! taxonomy, fuzzy fallback, placeholder summary). Provider failures end the
//! run; retrying is the gateway's job.

pub mod batch;
pub mod config;
pub mod extract;
pub mod group;
pub mod model;
pub mod normalize;
pub mod reassign;
pub mod session;
pub mod summarize;
pub mod trace;
pub mod types;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::hash_text;
use crate::gateway::ProviderError;
use crate::prompts::PromptInstance;
use crate::structured::{preview, ParseError};

pub use batch::{make_batches, Batch};
pub use config::{PipelineConfig, ReassignMode};
pub use model::{CachedModelClient, GatewayModelClient, ModelClient, DEFAULT_MODEL};
pub use reassign::TagMatcher;
pub use session::{
    AnalysisSession, LogEntry, LogLevel, ProgressObserver, RunStatus, SessionSnapshot,
};
pub use trace::{CallTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};
pub use types::{
    AnalysisResult, ExtractionStrategy, GroupMember, ResponseTagAssignment, RunMeta, TagGroups,
    TagSummary, TagTaxonomy,
};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Extraction,
    Normalization,
    Reassignment,
    Grouping,
    Summarization,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Input => "input",
            Stage::Extraction => "extraction",
            Stage::Normalization => "normalization",
            Stage::Reassignment => "reassignment",
            Stage::Grouping => "grouping",
            Stage::Summarization => "summarization",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage}: provider error: {source}")]
    Provider {
        stage: Stage,
        #[source]
        source: ProviderError,
    },

    #[error("{stage}: invalid data: {message}")]
    Data { stage: Stage, message: String },

    #[error("{stage}: empty result: {message}")]
    EmptyResult { stage: Stage, message: String },

    #[error("cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Stage the run was in when it failed.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Provider { stage, .. }
            | Self::Data { stage, .. }
            | Self::EmptyResult { stage, .. }
            | Self::Cancelled { stage } => Some(*stage),
            Self::Config(_) => None,
        }
    }
}

// =============================================================================
// Run options
// =============================================================================

/// Optional collaborators for one run.
#[derive(Clone, Copy, Default)]
pub struct AnalysisOptions<'a> {
    pub observer: Option<&'a dyn ProgressObserver>,
    pub trace: Option<&'a dyn TraceSink>,
    /// Checked before every model call; a set flag ends the run.
    pub cancel: Option<&'a AtomicBool>,
    /// Defaults to a fresh v4 id.
    pub run_id: Option<Uuid>,
}

/// Shared state threaded through the stages of one run.
pub(crate) struct StageContext<'a> {
    model: &'a dyn ModelClient,
    config: &'a PipelineConfig,
    options: AnalysisOptions<'a>,
    run_id: Uuid,
    calls: AtomicUsize,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        model: &'a dyn ModelClient,
        config: &'a PipelineConfig,
        options: AnalysisOptions<'a>,
    ) -> Self {
        Self {
            model,
            config,
            options,
            run_id: options.run_id.unwrap_or_else(Uuid::new_v4),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn config(&self) -> &PipelineConfig {
        self.config
    }

    pub(crate) fn model_calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub(crate) fn check_cancel(&self, stage: Stage) -> Result<(), PipelineError> {
        match self.options.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(PipelineError::Cancelled { stage }),
            _ => Ok(()),
        }
    }

    /// Report a progress line to the observer and to `tracing`.
    pub(crate) fn log(&self, stage: Stage, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => tracing::info!(run = %self.run_id, stage = stage.as_str(), "{message}"),
            LogLevel::Warning => {
                tracing::warn!(run = %self.run_id, stage = stage.as_str(), "{message}")
            }
            LogLevel::Error => {
                tracing::error!(run = %self.run_id, stage = stage.as_str(), "{message}")
            }
        }
        if let Some(observer) = self.options.observer {
            observer.add_log(message, level);
        }
    }

    fn enter(&self, stage: Stage, message: &str) -> Result<(), PipelineError> {
        self.check_cancel(stage)?;
        if let Some(observer) = self.options.observer {
            observer.update_step(stage.as_str());
        }
        self.log(stage, LogLevel::Info, message);
        Ok(())
    }

    /// Call the model and parse its output.
    ///
    /// The outer error is fatal to the run (cancellation, provider failure);
    /// the inner one is a parse failure the stage recovers from.
    pub(crate) async fn call<T, F>(
        &self,
        stage: Stage,
        batch_index: Option<usize>,
        prompt: &PromptInstance,
        max_tokens: u32,
        parse: F,
    ) -> Result<Result<T, ParseError>, PipelineError>
    where
        F: FnOnce(&str) -> Result<T, ParseError> + Send,
    {
        self.check_cancel(stage)?;
        self.calls.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let result = self.model.call_model(prompt, max_tokens).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(text) => {
                let parsed = parse(&text);
                if parsed.is_ok() {
                    self.model.commit(prompt, max_tokens, &text).await;
                }
                self.record_trace(
                    stage,
                    batch_index,
                    prompt,
                    max_tokens,
                    latency_ms,
                    Some(&text),
                    parsed.as_ref().err().map(|e| e.to_string()),
                    None,
                );
                Ok(parsed)
            }
            Err(source) => {
                self.record_trace(
                    stage,
                    batch_index,
                    prompt,
                    max_tokens,
                    latency_ms,
                    None,
                    None,
                    Some(source.to_string()),
                );
                Err(PipelineError::Provider { stage, source })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_trace(
        &self,
        stage: Stage,
        batch_index: Option<usize>,
        prompt: &PromptInstance,
        max_tokens: u32,
        latency_ms: u64,
        output: Option<&str>,
        parse_error: Option<String>,
        error: Option<String>,
    ) {
        let Some(sink) = self.options.trace else {
            return;
        };
        let event = CallTrace {
            timestamp_ms: trace::now_epoch_ms(),
            run_id: self.run_id,
            stage: stage.as_str().to_string(),
            batch_index,
            template_slug: prompt.template_slug.clone(),
            prompt_hash: hash_text(&format!("{}\n{}", prompt.system, prompt.user)),
            model: self.model.model_id().to_string(),
            max_tokens,
            latency_ms,
            output_chars: output.map(|o| o.chars().count()).unwrap_or(0),
            output_preview: output.map(preview),
            parsed: output.is_some() && parse_error.is_none(),
            parse_error,
            error,
        };
        if let Err(e) = sink.record(event) {
            tracing::warn!(run = %self.run_id, error = %e, "failed to record call trace");
        }
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Run every stage over `responses` and return the final snapshot.
///
/// Progress and the final status go to `options.observer`; no partial result
/// is returned on failure.
pub async fn run_analysis(
    model: &dyn ModelClient,
    config: &PipelineConfig,
    responses: &[String],
    options: AnalysisOptions<'_>,
) -> Result<AnalysisResult, PipelineError> {
    let ctx = StageContext::new(model, config, options);
    if let Some(observer) = options.observer {
        observer.update_status(RunStatus::Running, None);
    }

    let result = run_stages(&ctx, responses).await;

    match &result {
        Ok(analysis) => {
            ctx.log(
                Stage::Summarization,
                LogLevel::Info,
                &format!(
                    "Analysis complete: {} normalized tags, {} model calls",
                    analysis.normalized_tags.len(),
                    analysis.meta.model_calls
                ),
            );
            if let Some(observer) = options.observer {
                observer.update_status(RunStatus::Completed, None);
            }
        }
        Err(e) => {
            let message = e.to_string();
            ctx.log(e.stage().unwrap_or(Stage::Input), LogLevel::Error, &message);
            if let Some(observer) = options.observer {
                observer.update_status(RunStatus::Error, Some(&message));
            }
        }
    }

    result
}

async fn run_stages(
    ctx: &StageContext<'_>,
    responses: &[String],
) -> Result<AnalysisResult, PipelineError> {
    ctx.config().validate()?;
    let started_at = Utc::now();

    if responses.is_empty() {
        return Err(PipelineError::Data {
            stage: Stage::Input,
            message: "no responses to analyze".to_string(),
        });
    }

    ctx.enter(
        Stage::Extraction,
        &format!("Extracting tags from {} responses", responses.len()),
    )?;
    let extraction = extract::extract_tags(ctx, responses).await?;

    ctx.enter(
        Stage::Normalization,
        &format!("Normalizing {} raw tags", extraction.tags_raw.len()),
    )?;
    let taxonomy = normalize::normalize_tags(ctx, &extraction.tags_raw).await?;

    ctx.enter(
        Stage::Reassignment,
        &format!(
            "Assigning {} normalized tags ({} mode)",
            taxonomy.len(),
            ctx.config().reassign_mode.as_str()
        ),
    )?;
    let response_tags =
        reassign::reassign_tags(ctx, responses, &extraction.per_response, &taxonomy).await?;

    ctx.enter(Stage::Grouping, "Grouping responses by tag")?;
    let tag_groups = group::group_by_tag(responses, &response_tags);

    ctx.enter(
        Stage::Summarization,
        &format!("Summarizing {} tag groups", tag_groups.len()),
    )?;
    let summaries = summarize::summarize_groups(ctx, &tag_groups).await?;

    let meta = RunMeta {
        run_id: ctx.run_id,
        started_at,
        finished_at: Utc::now(),
        response_count: responses.len(),
        model_calls: ctx.model_calls(),
        extraction_strategy: extraction.strategy,
        degraded: extraction.strategy == ExtractionStrategy::Generic,
        reassign_mode: ctx.config().reassign_mode,
        degraded_summaries: summaries.values().filter(|s| s.degraded).count(),
    };

    Ok(AnalysisResult {
        tags_raw: extraction.tags_raw,
        normalized_tags: taxonomy,
        response_tags,
        tag_groups,
        summaries,
        meta,
    })
}

/// Run the analysis on a tokio task, reporting through `session`.
///
/// Setting `cancel` stops the run before its next model call.
pub fn spawn_analysis(
    model: Arc<dyn ModelClient>,
    config: PipelineConfig,
    responses: Vec<String>,
    session: Arc<AnalysisSession>,
    trace: Option<Arc<dyn TraceSink>>,
    cancel: Arc<AtomicBool>,
) -> JoinHandle<Result<AnalysisResult, PipelineError>> {
    tokio::spawn(async move {
        let options = AnalysisOptions {
            observer: Some(session.as_ref()),
            trace: trace.as_deref(),
            cancel: Some(cancel.as_ref()),
            run_id: Some(session.id()),
        };
        run_analysis(model.as_ref(), &config, &responses, options).await
    })
}
