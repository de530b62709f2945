//! Assign normalized tags back to individual responses.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde_json::Value;

use super::batch::{make_batches, parse_response_id, Batch};
use super::config::ReassignMode;
use super::session::LogLevel;
use super::types::{ResponseTagAssignment, TagTaxonomy};
use super::{PipelineError, Stage, StageContext};
use crate::prompts::{bulleted_block, numbered_block, unescape_xml_chars, REASSIGN};
use crate::structured::parse_array;

/// Inverse index from case-folded raw or normalized names to normalized tags.
///
/// Lookup is exact first; on a miss, the first key (in taxonomy order) that
/// contains or is contained in the query wins.
#[derive(Debug, Clone, Default)]
pub struct TagMatcher {
    index: IndexMap<String, String>,
}

impl TagMatcher {
    pub fn new(taxonomy: &TagTaxonomy) -> Self {
        let mut index = IndexMap::new();
        for (normalized, raws) in taxonomy {
            for raw in raws {
                index.insert(raw.trim().to_lowercase(), normalized.clone());
            }
        }
        // A normalized name beats a raw tag of another cluster spelled the same.
        for normalized in taxonomy.keys() {
            index.insert(normalized.trim().to_lowercase(), normalized.clone());
        }
        index.retain(|key, _| !key.is_empty());
        Self { index }
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn resolve(&self, tag: &str) -> Option<&str> {
        let key = tag.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }
        if let Some(normalized) = self.index.get(&key) {
            return Some(normalized);
        }
        self.index
            .iter()
            .find(|(candidate, _)| key.contains(candidate.as_str()) || candidate.contains(&key))
            .map(|(_, normalized)| normalized.as_str())
    }

    /// Resolve each tag, keeping first-match order without duplicates.
    pub fn resolve_all<'t>(&self, tags: impl IntoIterator<Item = &'t str>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for tag in tags {
            if let Some(normalized) = self.resolve(tag) {
                if !out.iter().any(|t| t == normalized) {
                    out.push(normalized.to_string());
                }
            }
        }
        out
    }
}

pub(crate) async fn reassign_tags(
    ctx: &StageContext<'_>,
    responses: &[String],
    raw_tags: &[Vec<String>],
    taxonomy: &TagTaxonomy,
) -> Result<Vec<ResponseTagAssignment>, PipelineError> {
    let matcher = TagMatcher::new(taxonomy);
    let raw_for = |i: usize| raw_tags.get(i).cloned().unwrap_or_default();

    if taxonomy.is_empty() {
        return Ok((0..responses.len())
            .map(|i| ResponseTagAssignment {
                response_index: i,
                raw_tags: raw_for(i),
                normalized_tags: Vec::new(),
            })
            .collect());
    }

    let mut confirmed: Vec<Vec<String>> = vec![Vec::new(); responses.len()];
    if ctx.config().reassign_mode == ReassignMode::Model {
        let batches = make_batches(responses, ctx.config().reassign_batch_size)?;
        let vocabulary = bulleted_block(taxonomy.keys().map(String::as_str));
        let calls: Vec<BoxFuture<'_, Result<Vec<(usize, Vec<String>)>, PipelineError>>> = batches
            .iter()
            .map(|batch| reassign_batch(ctx, batch, &vocabulary, &matcher).boxed())
            .collect();
        let results: Vec<_> = stream::iter(calls)
            .buffered(ctx.config().batch_concurrency)
            .collect()
            .await;
        for result in results {
            for (global, tags) in result? {
                confirmed[global] = tags;
            }
        }
    }

    let mut fallbacks = 0usize;
    let assignments: Vec<ResponseTagAssignment> = confirmed
        .into_iter()
        .enumerate()
        .map(|(i, tags)| {
            let raw = raw_for(i);
            let normalized_tags = if tags.is_empty() {
                if ctx.config().reassign_mode == ReassignMode::Model {
                    fallbacks += 1;
                }
                matcher.resolve_all(raw.iter().map(String::as_str))
            } else {
                tags
            };
            ResponseTagAssignment {
                response_index: i,
                raw_tags: raw,
                normalized_tags,
            }
        })
        .collect();

    if fallbacks > 0 {
        ctx.log(
            Stage::Reassignment,
            LogLevel::Warning,
            &format!("{fallbacks} responses had no model-confirmed tags; used fuzzy matching"),
        );
    }
    Ok(assignments)
}

async fn reassign_batch(
    ctx: &StageContext<'_>,
    batch: &Batch<'_>,
    vocabulary: &str,
    matcher: &TagMatcher,
) -> Result<Vec<(usize, Vec<String>)>, PipelineError> {
    let responses = numbered_block(batch.texts());
    let prompt = REASSIGN.render(&[("tags", vocabulary), ("responses", &responses)]);

    let parsed = ctx
        .call(
            Stage::Reassignment,
            Some(batch.index),
            &prompt,
            ctx.config().reassign_max_tokens,
            parse_array,
        )
        .await?;
    let items = match parsed {
        Ok(items) => items,
        Err(e) => {
            ctx.log(
                Stage::Reassignment,
                LogLevel::Warning,
                &format!(
                    "Batch {}: unreadable assignment output ({})",
                    batch.index + 1,
                    e.reason()
                ),
            );
            return Ok(Vec::new());
        }
    };

    let mut out: Vec<(usize, Vec<String>)> = Vec::new();
    for item in &items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let Some(global) = obj
            .get("response_id")
            .and_then(parse_response_id)
            .and_then(|id| batch.resolve(id))
        else {
            continue;
        };
        let labels: Vec<String> = obj
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(unescape_xml_chars)
                    .collect()
            })
            .unwrap_or_default();
        let tags = matcher.resolve_all(labels.iter().map(String::as_str));
        if !tags.is_empty() {
            out.push((global, tags));
        }
    }
    Ok(out)
}
