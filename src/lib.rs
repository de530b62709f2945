#![forbid(unsafe_code)]

//! # survey-tagger
//!
//! Turns open-text survey responses into a tagged, summarized report with a
//! sequence of LLM calls.
//!
//! Models are asked to tag small batches of responses, and each batch invents
//! its own vocabulary ("slow app", "performance issues", "lag"). The pipeline
//! consolidates those tags into one taxonomy, assigns the canonical tags back
//! to every response, groups responses per tag and summarizes each group,
//! while keeping every derived record tied to the index of the response it
//! came from. Malformed model output degrades the affected item instead of
//! the run.

pub mod cache;
pub mod gateway;
pub mod input;
pub mod pipeline;
pub mod prompts;
pub mod structured;

pub use cache::{CallCache, CallCacheKey, SqliteCallCache};
pub use gateway::{Attribution, ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use pipeline::{
    run_analysis, spawn_analysis, AnalysisOptions, AnalysisResult, AnalysisSession,
    CachedModelClient, GatewayModelClient, JsonlTraceSink, ModelClient, PipelineConfig,
    PipelineError, ProgressObserver, ReassignMode, RunStatus, Stage, TraceSink, TraceWorker,
};
pub use structured::{parse_structured, JsonShape, ParseError};
