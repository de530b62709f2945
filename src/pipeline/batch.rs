//! Fixed-size batching with explicit batch -> global index translation.
//!
//! Responses carry a 0-based global index everywhere in the crate. Prompts
//! number a batch's responses from 1, and the model answers with those
//! batch-local ids; [`Batch::resolve`] is the only place that maps them back.

use serde_json::Value;

use super::PipelineError;

#[derive(Debug, Clone)]
pub struct Batch<'a> {
    /// Position of this batch in the run.
    pub index: usize,
    /// `(global_index, text)` pairs in input order.
    pub items: Vec<(usize, &'a str)>,
}

impl<'a> Batch<'a> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn texts(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.items.iter().map(|(_, text)| *text)
    }

    /// Global index for a 1-based batch-local response id.
    pub fn resolve(&self, response_id: i64) -> Option<usize> {
        if response_id < 1 {
            return None;
        }
        self.items
            .get((response_id - 1) as usize)
            .map(|(global, _)| *global)
    }
}

/// Split `responses` into contiguous batches of at most `size`.
pub fn make_batches(responses: &[String], size: usize) -> Result<Vec<Batch<'_>>, PipelineError> {
    if size == 0 {
        return Err(PipelineError::Config("batch size must be > 0".to_string()));
    }
    Ok(responses
        .chunks(size)
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            items: chunk
                .iter()
                .enumerate()
                .map(|(offset, text)| (index * size + offset, text.as_str()))
                .collect(),
        })
        .collect())
}

/// Read a response id the way models write it: `3`, `3.0` or `"3"`.
pub fn parse_response_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().trim_start_matches('#').parse().ok(),
        _ => None,
    }
}
