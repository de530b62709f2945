//! Records produced by an analysis run.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::ReassignMode;

/// Normalized tag -> raw tags it subsumes, in model order.
pub type TagTaxonomy = IndexMap<String, Vec<String>>;

/// Normalized tag -> member responses, in order of first appearance.
pub type TagGroups = IndexMap<String, Vec<GroupMember>>;

/// Tags attached to one response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResponseTagAssignment {
    /// 0-based position in the input.
    pub response_index: usize,
    pub raw_tags: Vec<String>,
    pub normalized_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GroupMember {
    pub index: usize,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TagSummary {
    pub synthesis: String,
    /// Total group size, not the number of members shown to the model.
    pub member_count: usize,
    pub verbatims: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl TagSummary {
    pub fn unavailable(reason: &str, member_count: usize) -> Self {
        Self {
            synthesis: format!("[summary unavailable: {reason}]"),
            member_count,
            verbatims: Vec::new(),
            degraded: true,
        }
    }
}

/// Which extraction attempt produced the raw tag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// Per-response tags from batched `{response_id, tags}` output.
    Correlated,
    /// Flat tag lists per batch; no per-response tags.
    Flat,
    /// Flat tag list from a leading sample of responses.
    Sample,
    /// Configured generic tags; nothing usable came back from the model.
    Generic,
}

impl ExtractionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStrategy::Correlated => "correlated",
            ExtractionStrategy::Flat => "flat",
            ExtractionStrategy::Sample => "sample",
            ExtractionStrategy::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunMeta {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub response_count: usize,
    pub model_calls: usize,
    pub extraction_strategy: ExtractionStrategy,
    /// True when extraction fell back to the generic tag set.
    pub degraded: bool,
    pub reassign_mode: ReassignMode,
    pub degraded_summaries: usize,
}

/// Final snapshot of a completed run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalysisResult {
    pub tags_raw: Vec<String>,
    pub normalized_tags: TagTaxonomy,
    pub response_tags: Vec<ResponseTagAssignment>,
    pub tag_groups: TagGroups,
    pub summaries: IndexMap<String, TagSummary>,
    pub meta: RunMeta,
}
