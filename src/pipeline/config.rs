//! Run configuration.

use serde::{Deserialize, Serialize};

use super::PipelineError;

/// How normalized tags are assigned back to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassignMode {
    /// Ask the model, with the normalized tags as a closed vocabulary.
    #[default]
    Model,
    /// Match each response's raw tags against the taxonomy, no model calls.
    Fuzzy,
}

impl ReassignMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReassignMode::Model => "model",
            ReassignMode::Fuzzy => "fuzzy",
        }
    }
}

/// Tunables for one analysis run. Every field has a default, so a partial
/// JSON file (or `{}`) is a valid configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Responses per extraction call.
    #[serde(default = "default_extract_batch_size")]
    pub extract_batch_size: usize,
    /// Responses per reassignment call.
    #[serde(default = "default_reassign_batch_size")]
    pub reassign_batch_size: usize,
    /// Members of a group shown to the summarizer.
    #[serde(default = "default_summary_sample_cap")]
    pub summary_sample_cap: usize,
    /// Responses used by the last-resort extraction attempt.
    #[serde(default = "default_fallback_sample_size")]
    pub fallback_sample_size: usize,
    #[serde(default = "default_max_tags_per_response")]
    pub max_tags_per_response: usize,
    #[serde(default = "default_max_tokens")]
    pub extract_max_tokens: u32,
    #[serde(default = "default_max_tokens")]
    pub normalize_max_tokens: u32,
    #[serde(default = "default_max_tokens")]
    pub reassign_max_tokens: u32,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
    #[serde(default)]
    pub reassign_mode: ReassignMode,
    /// Tags used when every extraction attempt comes back empty.
    #[serde(default = "default_generic_tags")]
    pub generic_tags: Vec<String>,
    /// Extraction / reassignment / summary calls in flight at once.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

fn default_extract_batch_size() -> usize {
    25
}

fn default_reassign_batch_size() -> usize {
    15
}

fn default_summary_sample_cap() -> usize {
    50
}

fn default_fallback_sample_size() -> usize {
    10
}

fn default_max_tags_per_response() -> usize {
    5
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_summary_max_tokens() -> u32 {
    2000
}

fn default_generic_tags() -> Vec<String> {
    vec!["general feedback".to_string(), "other".to_string()]
}

fn default_batch_concurrency() -> usize {
    1
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extract_batch_size: default_extract_batch_size(),
            reassign_batch_size: default_reassign_batch_size(),
            summary_sample_cap: default_summary_sample_cap(),
            fallback_sample_size: default_fallback_sample_size(),
            max_tags_per_response: default_max_tags_per_response(),
            extract_max_tokens: default_max_tokens(),
            normalize_max_tokens: default_max_tokens(),
            reassign_max_tokens: default_max_tokens(),
            summary_max_tokens: default_summary_max_tokens(),
            reassign_mode: ReassignMode::default(),
            generic_tags: default_generic_tags(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let positive = [
            ("extract_batch_size", self.extract_batch_size),
            ("reassign_batch_size", self.reassign_batch_size),
            ("summary_sample_cap", self.summary_sample_cap),
            ("fallback_sample_size", self.fallback_sample_size),
            ("max_tags_per_response", self.max_tags_per_response),
            ("batch_concurrency", self.batch_concurrency),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PipelineError::Config(format!("{name} must be > 0")));
            }
        }

        let budgets = [
            ("extract_max_tokens", self.extract_max_tokens),
            ("normalize_max_tokens", self.normalize_max_tokens),
            ("reassign_max_tokens", self.reassign_max_tokens),
            ("summary_max_tokens", self.summary_max_tokens),
        ];
        for (name, value) in budgets {
            if value == 0 {
                return Err(PipelineError::Config(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}
