//! Raw tag extraction.
//!
//! Tries progressively less demanding prompts until one yields tags:
//! correlated (`{response_id, tags}` per response), flat (one tag list per
//! batch), a flat call on a leading sample, then the configured generic set.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde_json::Value;

use super::batch::{make_batches, parse_response_id, Batch};
use super::session::LogLevel;
use super::types::ExtractionStrategy;
use super::{PipelineError, Stage, StageContext};
use crate::prompts::{numbered_block, unescape_xml_chars, EXTRACT_CORRELATED, EXTRACT_FLAT};
use crate::structured::parse_array;

/// Case-insensitive, insertion-ordered tag set; keeps the first spelling seen.
#[derive(Debug, Default, Clone)]
pub struct RawTagSet {
    tags: IndexMap<String, String>,
}

impl RawTagSet {
    /// Returns false when the tag (in any casing) is already present.
    pub fn insert(&mut self, tag: &str) -> bool {
        let key = tag.to_lowercase();
        if self.tags.contains_key(&key) {
            return false;
        }
        self.tags.insert(key, tag.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.tags.into_values().collect()
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    /// Unique raw tags across the run, first-seen spelling and order.
    pub tags_raw: Vec<String>,
    /// Raw tags per response, by global index. Empty unless correlated.
    pub per_response: Vec<Vec<String>>,
    pub strategy: ExtractionStrategy,
}

/// Trim, drop blanks and non-strings, dedupe case-insensitively, cap.
pub(crate) fn clean_tags(values: &[Value], max: usize) -> Vec<String> {
    let mut seen = RawTagSet::default();
    let mut out = Vec::new();
    for value in values {
        let Some(tag) = value.as_str() else {
            continue;
        };
        let tag = unescape_xml_chars(tag.trim());
        if tag.is_empty() || !seen.insert(&tag) {
            continue;
        }
        out.push(tag);
        if out.len() == max {
            break;
        }
    }
    out
}

pub(crate) async fn extract_tags(
    ctx: &StageContext<'_>,
    responses: &[String],
) -> Result<ExtractionOutput, PipelineError> {
    let config = ctx.config();
    let batches = make_batches(responses, config.extract_batch_size)?;
    let mut per_response: Vec<Vec<String>> = vec![Vec::new(); responses.len()];

    // 1. correlated
    let mut tags = RawTagSet::default();
    let calls: Vec<BoxFuture<'_, Result<Vec<(Option<usize>, Vec<String>)>, PipelineError>>> =
        batches
            .iter()
            .map(|batch| extract_correlated(ctx, batch).boxed())
            .collect();
    let results: Vec<_> = stream::iter(calls)
        .buffered(config.batch_concurrency)
        .collect()
        .await;
    for result in results {
        for (global, batch_tags) in result? {
            for tag in &batch_tags {
                tags.insert(tag);
            }
            if let Some(global) = global {
                per_response[global] = batch_tags;
            }
        }
    }
    if !tags.is_empty() {
        return Ok(finish(ctx, tags, per_response, ExtractionStrategy::Correlated));
    }

    // 2. flat
    ctx.log(
        Stage::Extraction,
        LogLevel::Warning,
        "No tags from per-response extraction; retrying with flat tag lists",
    );
    let calls: Vec<BoxFuture<'_, Result<Vec<String>, PipelineError>>> = batches
        .iter()
        .map(|batch| extract_flat(ctx, batch).boxed())
        .collect();
    let results: Vec<_> = stream::iter(calls)
        .buffered(config.batch_concurrency)
        .collect()
        .await;
    for result in results {
        for tag in result? {
            tags.insert(&tag);
        }
    }
    if !tags.is_empty() {
        return Ok(finish(ctx, tags, per_response, ExtractionStrategy::Flat));
    }

    // 3. sample
    let sample_len = config.fallback_sample_size.min(responses.len());
    ctx.log(
        Stage::Extraction,
        LogLevel::Warning,
        &format!("No tags from flat extraction; retrying on the first {sample_len} responses"),
    );
    let sample = make_batches(&responses[..sample_len], sample_len.max(1))?;
    if let Some(batch) = sample.first() {
        for tag in extract_flat(ctx, batch).await? {
            tags.insert(&tag);
        }
    }
    if !tags.is_empty() {
        return Ok(finish(ctx, tags, per_response, ExtractionStrategy::Sample));
    }

    // 4. generic
    for tag in &config.generic_tags {
        let tag = tag.trim();
        if !tag.is_empty() {
            tags.insert(tag);
        }
    }
    if tags.is_empty() {
        return Err(PipelineError::EmptyResult {
            stage: Stage::Extraction,
            message: "no tags extracted and no generic fallback tags configured".to_string(),
        });
    }
    ctx.log(
        Stage::Extraction,
        LogLevel::Warning,
        "Extraction produced no tags; using the generic fallback tag set",
    );
    Ok(finish(ctx, tags, per_response, ExtractionStrategy::Generic))
}

fn finish(
    ctx: &StageContext<'_>,
    tags: RawTagSet,
    per_response: Vec<Vec<String>>,
    strategy: ExtractionStrategy,
) -> ExtractionOutput {
    ctx.log(
        Stage::Extraction,
        LogLevel::Info,
        &format!(
            "Extracted {} unique tags ({} strategy)",
            tags.len(),
            strategy.as_str()
        ),
    );
    ExtractionOutput {
        tags_raw: tags.into_vec(),
        per_response,
        strategy,
    }
}

/// Tags per batch item; `None` marks tags the model did not attribute.
async fn extract_correlated(
    ctx: &StageContext<'_>,
    batch: &Batch<'_>,
) -> Result<Vec<(Option<usize>, Vec<String>)>, PipelineError> {
    let config = ctx.config();
    let responses = numbered_block(batch.texts());
    let prompt = EXTRACT_CORRELATED.render(&[("responses", &responses)]);

    let parsed = ctx
        .call(
            Stage::Extraction,
            Some(batch.index),
            &prompt,
            config.extract_max_tokens,
            parse_array,
        )
        .await?;
    let items = match parsed {
        Ok(items) => items,
        Err(e) => {
            ctx.log(
                Stage::Extraction,
                LogLevel::Warning,
                &format!("Batch {}: unreadable tag output ({})", batch.index + 1, e.reason()),
            );
            return Ok(Vec::new());
        }
    };

    let mut out: Vec<(Option<usize>, Vec<String>)> = Vec::new();
    let mut seen_globals: Vec<usize> = Vec::new();
    let mut unattributed: Vec<Value> = Vec::new();
    for item in &items {
        match item {
            Value::Object(obj) => {
                let tags = obj
                    .get("tags")
                    .and_then(Value::as_array)
                    .map(|t| clean_tags(t, config.max_tags_per_response))
                    .unwrap_or_default();
                if tags.is_empty() {
                    continue;
                }
                let global = obj
                    .get("response_id")
                    .and_then(parse_response_id)
                    .and_then(|id| batch.resolve(id));
                match global {
                    Some(g) if !seen_globals.contains(&g) => {
                        seen_globals.push(g);
                        out.push((Some(g), tags));
                    }
                    _ => {
                        tracing::debug!(
                            batch = batch.index,
                            response_id = ?obj.get("response_id"),
                            "tags without a usable response id"
                        );
                        out.push((None, tags));
                    }
                }
            }
            // Some models answer with a bare tag list despite the prompt.
            Value::String(_) => unattributed.push(item.clone()),
            _ => {}
        }
    }
    if !unattributed.is_empty() {
        out.push((None, clean_tags(&unattributed, usize::MAX)));
    }
    Ok(out)
}

async fn extract_flat(
    ctx: &StageContext<'_>,
    batch: &Batch<'_>,
) -> Result<Vec<String>, PipelineError> {
    let responses = numbered_block(batch.texts());
    let prompt = EXTRACT_FLAT.render(&[("responses", &responses)]);

    let parsed = ctx
        .call(
            Stage::Extraction,
            Some(batch.index),
            &prompt,
            ctx.config().extract_max_tokens,
            parse_array,
        )
        .await?;
    match parsed {
        Ok(items) => Ok(clean_tags(&items, usize::MAX)),
        Err(e) => {
            ctx.log(
                Stage::Extraction,
                LogLevel::Warning,
                &format!(
                    "Batch {}: unreadable flat tag output ({})",
                    batch.index + 1,
                    e.reason()
                ),
            );
            Ok(Vec::new())
        }
    }
}
