//! Tag normalization: cluster raw tags under canonical names.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use super::session::LogLevel;
use super::types::TagTaxonomy;
use super::{PipelineError, Stage, StageContext};
use crate::prompts::{bulleted_block, unescape_xml_chars, NORMALIZE};
use crate::structured::parse_object;

pub(crate) async fn normalize_tags(
    ctx: &StageContext<'_>,
    tags_raw: &[String],
) -> Result<TagTaxonomy, PipelineError> {
    if tags_raw.is_empty() {
        return Ok(TagTaxonomy::new());
    }

    let tags = bulleted_block(tags_raw.iter().map(String::as_str));
    let prompt = NORMALIZE.render(&[("tags", &tags)]);

    let parsed = ctx
        .call(
            Stage::Normalization,
            None,
            &prompt,
            ctx.config().normalize_max_tokens,
            parse_object,
        )
        .await?;

    let taxonomy = match parsed {
        Ok(map) => sanitize_taxonomy(&map, tags_raw),
        Err(e) => {
            ctx.log(
                Stage::Normalization,
                LogLevel::Warning,
                &format!("Unreadable normalization output ({}); no normalized tags", e.reason()),
            );
            return Ok(TagTaxonomy::new());
        }
    };

    let covered: usize = taxonomy.values().map(Vec::len).sum();
    ctx.log(
        Stage::Normalization,
        LogLevel::Info,
        &format!(
            "Normalized {} raw tags into {} tags ({} raw tags unclustered)",
            tags_raw.len(),
            taxonomy.len(),
            tags_raw.len().saturating_sub(covered)
        ),
    );
    Ok(taxonomy)
}

/// Enforce taxonomy invariants on model output.
///
/// - raw tags must come from `tags_raw` (case-insensitive), spelled as input
/// - a raw tag belongs to the first cluster that claims it
/// - canonical names are trimmed; blank names and clusters left without raw
///   tags are dropped; names differing only in case are merged
pub fn sanitize_taxonomy(parsed: &Map<String, Value>, tags_raw: &[String]) -> TagTaxonomy {
    let input: HashMap<String, &str> = tags_raw
        .iter()
        .map(|t| (t.to_lowercase(), t.as_str()))
        .collect();
    let mut claimed: HashSet<String> = HashSet::new();
    let mut canonical_names: HashMap<String, String> = HashMap::new();
    let mut taxonomy = TagTaxonomy::new();

    for (name, members) in parsed {
        let name = unescape_xml_chars(name.trim());
        if name.is_empty() {
            continue;
        }

        let candidates: Vec<&str> = match members {
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            Value::String(s) => vec![s.as_str()],
            _ => Vec::new(),
        };

        let mut raws: Vec<String> = Vec::new();
        for candidate in candidates {
            let key = unescape_xml_chars(candidate.trim()).to_lowercase();
            let Some(spelling) = input.get(&key) else {
                tracing::debug!(tag = candidate, "dropping raw tag not in input");
                continue;
            };
            if claimed.insert(key) {
                raws.push((*spelling).to_string());
            }
        }
        if raws.is_empty() {
            continue;
        }

        let canonical = canonical_names
            .entry(name.to_lowercase())
            .or_insert_with(|| name.clone())
            .clone();
        taxonomy.entry(canonical).or_default().extend(raws);
    }

    taxonomy
}
