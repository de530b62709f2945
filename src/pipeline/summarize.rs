//! Per-group synthesis with verbatim quotes.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use super::session::LogLevel;
use super::types::{GroupMember, TagGroups, TagSummary};
use super::{PipelineError, Stage, StageContext};
use crate::prompts::{numbered_block, unescape_xml_chars, SUMMARIZE};
use crate::structured::parse_object;

pub const MAX_VERBATIMS: usize = 3;

pub(crate) async fn summarize_groups(
    ctx: &StageContext<'_>,
    groups: &TagGroups,
) -> Result<IndexMap<String, TagSummary>, PipelineError> {
    // Boxed before `buffered`: the spawned run future must be `Send`.
    let calls: Vec<BoxFuture<'_, Result<(String, TagSummary), PipelineError>>> = groups
        .iter()
        .filter(|(_, members)| !members.is_empty())
        .enumerate()
        .map(|(i, (tag, members))| summarize_group(ctx, i, tag, members).boxed())
        .collect();
    let results: Vec<_> = stream::iter(calls)
        .buffered(ctx.config().batch_concurrency)
        .collect()
        .await;

    let mut summaries = IndexMap::new();
    for result in results {
        let (tag, summary) = result?;
        summaries.insert(tag, summary);
    }
    Ok(summaries)
}

async fn summarize_group(
    ctx: &StageContext<'_>,
    group_index: usize,
    tag: &str,
    members: &[GroupMember],
) -> Result<(String, TagSummary), PipelineError> {
    let cap = ctx.config().summary_sample_cap;
    let sample = &members[..members.len().min(cap)];
    let responses = numbered_block(sample.iter().map(|m| m.response.as_str()));
    let prompt = SUMMARIZE.render(&[("tag", tag), ("responses", &responses)]);

    let parsed = ctx
        .call(
            Stage::Summarization,
            Some(group_index),
            &prompt,
            ctx.config().summary_max_tokens,
            parse_object,
        )
        .await?;

    let summary = match parsed.map_err(|e| e.reason()).and_then(|obj| read_summary(&obj)) {
        Ok((synthesis, quotes)) => TagSummary {
            synthesis,
            member_count: members.len(),
            verbatims: grounded_verbatims(&quotes, sample),
            degraded: false,
        },
        Err(reason) => {
            ctx.log(
                Stage::Summarization,
                LogLevel::Warning,
                &format!("Summary for \"{tag}\" unavailable ({reason})"),
            );
            TagSummary::unavailable(&reason, members.len())
        }
    };
    Ok((tag.to_string(), summary))
}

fn read_summary(obj: &Map<String, Value>) -> Result<(String, Vec<String>), String> {
    let synthesis = ["synthesis", "summary"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing synthesis".to_string())?;

    let quotes = ["verbatims", "quotes"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array))
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok((synthesis.to_string(), quotes))
}

fn fold(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Keep quotes that actually occur in a sampled response, up to
/// [`MAX_VERBATIMS`], ignoring case and whitespace differences.
pub fn grounded_verbatims(quotes: &[String], sample: &[GroupMember]) -> Vec<String> {
    let haystacks: Vec<String> = sample.iter().map(|m| fold(&m.response)).collect();
    let mut out: Vec<String> = Vec::new();
    for quote in quotes {
        let quote = unescape_xml_chars(quote.trim());
        let quote = quote
            .trim_matches(|c: char| matches!(c, '"' | '\'' | '\u{201C}' | '\u{201D}'))
            .trim();
        let needle = fold(quote);
        if needle.is_empty() || out.iter().any(|q| fold(q) == needle) {
            continue;
        }
        if haystacks.iter().any(|h| h.contains(&needle)) {
            out.push(quote.to_string());
            if out.len() == MAX_VERBATIMS {
                break;
            }
        }
    }
    out
}
