use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use survey_tagger::gateway::ProviderError;
use survey_tagger::pipeline::{
    run_analysis, spawn_analysis, AnalysisOptions, AnalysisSession, ExtractionStrategy,
    ModelClient, PipelineConfig, PipelineError, ReassignMode, RunStatus, Stage,
};
use survey_tagger::prompts::PromptInstance;

type Script = dyn Fn(&PromptInstance) -> Result<String, ProviderError> + Send + Sync;

/// Answers every call from a script keyed on the prompt, recording prompts.
struct ScriptedModel {
    script: Box<Script>,
    prompts: Mutex<Vec<PromptInstance>>,
}

impl ScriptedModel {
    fn new(
        script: impl Fn(&PromptInstance) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn calls_for(&self, slug_prefix: &str) -> Vec<PromptInstance> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.template_slug.starts_with(slug_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn call_model(
        &self,
        prompt: &PromptInstance,
        _max_tokens: u32,
    ) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        (self.script)(prompt)
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// `(number, text)` for each numbered line inside the `<responses>` block.
fn numbered(user: &str) -> Vec<(usize, String)> {
    let Some(start) = user.find("<responses>") else {
        return Vec::new();
    };
    let end = user.find("</responses>").unwrap_or(user.len());
    user[start + "<responses>".len()..end]
        .lines()
        .filter_map(|line| {
            let (n, text) = line.trim().split_once(". ")?;
            Some((n.parse().ok()?, text.to_string()))
        })
        .collect()
}

fn summary_tag(user: &str) -> String {
    let start = user.find("the tag \"").unwrap() + "the tag \"".len();
    let len = user[start..].find('"').unwrap();
    user[start..start + len].to_string()
}

fn responses(texts: &[&str]) -> Vec<String> {
    texts.iter().map(|t| t.to_string()).collect()
}

/// Raw and canonical tag for the three-topic fixture.
fn topic_of(text: &str) -> (&'static str, &'static str) {
    if text.contains("slow") {
        ("slow app", "Performance")
    } else if text.contains("Prices") {
        ("expensive", "Pricing")
    } else {
        ("helpful support", "Support")
    }
}

fn three_topic_model() -> ScriptedModel {
    ScriptedModel::new(|prompt| {
        let out = match prompt.template_slug.as_str() {
            "extract_correlated_v1" => Value::Array(
                numbered(&prompt.user)
                    .into_iter()
                    .map(|(n, text)| json!({"response_id": n, "tags": [topic_of(&text).0]}))
                    .collect(),
            ),
            "normalize_v1" => json!({
                "Performance": ["slow app"],
                "Pricing": ["expensive"],
                "Support": ["helpful support"]
            }),
            "reassign_v1" => Value::Array(
                numbered(&prompt.user)
                    .into_iter()
                    .map(|(n, text)| json!({"response_id": n, "tags": [topic_of(&text).1]}))
                    .collect(),
            ),
            "summarize_v1" => {
                let tag = summary_tag(&prompt.user);
                let first = numbered(&prompt.user)
                    .into_iter()
                    .next()
                    .map(|(_, t)| t)
                    .unwrap_or_default();
                json!({"synthesis": format!("Respondents mention {tag}."), "verbatims": [first]})
            }
            other => panic!("unexpected template {other}"),
        };
        Ok(out.to_string())
    })
}

const THREE: &[&str] = &[
    "The app is too slow",
    "Prices are too high",
    "Support was very helpful",
];

#[tokio::test]
async fn three_distinct_responses_yield_three_single_member_groups() {
    let model = three_topic_model();
    let result = run_analysis(
        &model,
        &PipelineConfig::default(),
        &responses(THREE),
        AnalysisOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(result.tags_raw, vec!["slow app", "expensive", "helpful support"]);
    assert_eq!(result.normalized_tags.len(), 3);
    assert_eq!(result.tag_groups.len(), 3);
    for (tag, members) in &result.tag_groups {
        assert_eq!(members.len(), 1, "group {tag}");
    }
    assert_eq!(result.tag_groups["Pricing"][0].index, 1);
    assert_eq!(result.tag_groups["Pricing"][0].response, THREE[1]);

    assert_eq!(result.summaries.len(), 3);
    for (tag, summary) in &result.summaries {
        assert_eq!(summary.member_count, 1);
        assert!(!summary.degraded);
        assert_eq!(summary.synthesis, format!("Respondents mention {tag}."));
        assert_eq!(summary.verbatims.len(), 1);
    }

    assert_eq!(result.meta.extraction_strategy, ExtractionStrategy::Correlated);
    assert!(!result.meta.degraded);
    assert_eq!(result.meta.response_count, 3);
    // extract + normalize + reassign + 3 summaries
    assert_eq!(result.meta.model_calls, 6);
    assert_eq!(model.prompts.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn response_tags_cover_every_input_in_order() {
    let model = three_topic_model();
    let result = run_analysis(
        &model,
        &PipelineConfig::default(),
        &responses(THREE),
        AnalysisOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(result.response_tags.len(), THREE.len());
    for (i, assignment) in result.response_tags.iter().enumerate() {
        assert_eq!(assignment.response_index, i);
        assert_eq!(assignment.raw_tags, vec![topic_of(THREE[i]).0]);
        assert_eq!(assignment.normalized_tags, vec![topic_of(THREE[i]).1]);
    }
}

#[tokio::test]
async fn malformed_output_everywhere_degrades_to_generic_tags() {
    let model = ScriptedModel::new(|_| Ok("Sorry, here is my answer in prose.".to_string()));
    let result = run_analysis(
        &model,
        &PipelineConfig::default(),
        &responses(THREE),
        AnalysisOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(result.tags_raw, vec!["general feedback", "other"]);
    assert_eq!(result.meta.extraction_strategy, ExtractionStrategy::Generic);
    assert!(result.meta.degraded);
    assert!(result.normalized_tags.is_empty());
    assert!(result.tag_groups.is_empty());
    assert!(result.summaries.is_empty());
    assert!(result
        .response_tags
        .iter()
        .all(|a| a.normalized_tags.is_empty()));

    // correlated, flat, sample, then normalize over the generic set
    assert_eq!(model.calls_for("extract_correlated").len(), 1);
    assert_eq!(model.calls_for("extract_flat").len(), 2);
    assert_eq!(model.calls_for("normalize").len(), 1);
    assert!(model.calls_for("reassign").is_empty());
    assert!(model.calls_for("summarize").is_empty());
}

#[tokio::test]
async fn empty_generic_fallback_fails_the_run() {
    let model = ScriptedModel::new(|_| Ok("[]".to_string()));
    let config = PipelineConfig {
        generic_tags: Vec::new(),
        ..PipelineConfig::default()
    };
    let err = run_analysis(&model, &config, &responses(THREE), AnalysisOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::EmptyResult {
            stage: Stage::Extraction,
            ..
        }
    ));
}

#[tokio::test]
async fn flat_fallback_keeps_tags_without_per_response_attribution() {
    let model = ScriptedModel::new(|prompt| {
        let out = match prompt.template_slug.as_str() {
            "extract_correlated_v1" => "not json".to_string(),
            "extract_flat_v1" => r#"["slow app", "expensive"]"#.to_string(),
            "normalize_v1" => r#"{"Performance": ["slow app"], "Pricing": ["expensive"]}"#.to_string(),
            "reassign_v1" => "garbage".to_string(),
            _ => r#"{"synthesis": "ok", "verbatims": []}"#.to_string(),
        };
        Ok(out)
    });
    let result = run_analysis(
        &model,
        &PipelineConfig::default(),
        &responses(THREE),
        AnalysisOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(result.meta.extraction_strategy, ExtractionStrategy::Flat);
    assert!(!result.meta.degraded);
    assert_eq!(result.tags_raw, vec!["slow app", "expensive"]);
    // no per-response raw tags and no usable reassignment: nothing to group
    assert!(result.response_tags.iter().all(|a| a.raw_tags.is_empty()));
    assert!(result.tag_groups.is_empty());
}

#[tokio::test]
async fn batched_extraction_maps_local_ids_back_to_global_indices() {
    let texts: Vec<String> = (0..30)
        .map(|i| format!("feedback number {i} about topic-{}", i % 3))
        .collect();

    let model = ScriptedModel::new(|prompt| {
        let out = match prompt.template_slug.as_str() {
            "extract_correlated_v1" => {
                let mut items: Vec<Value> = numbered(&prompt.user)
                    .into_iter()
                    .map(|(n, text)| {
                        let tag = text.rsplit(' ').next().unwrap().to_string();
                        json!({"response_id": n, "tags": [tag]})
                    })
                    .collect();
                items.reverse();
                items.push(json!({"response_id": 99, "tags": ["hallucinated"]}));
                Value::Array(items)
            }
            "normalize_v1" => json!({
                "Topic A": ["topic-0"],
                "Topic B": ["topic-1"],
                "Topic C": ["topic-2"]
            }),
            "summarize_v1" => json!({"synthesis": "ok", "verbatims": []}),
            other => panic!("unexpected template {other}"),
        };
        Ok(out.to_string())
    });

    let config = PipelineConfig {
        extract_batch_size: 25,
        reassign_mode: ReassignMode::Fuzzy,
        ..PipelineConfig::default()
    };
    let result = run_analysis(&model, &config, &texts, AnalysisOptions::default())
        .await
        .unwrap();

    assert_eq!(model.calls_for("extract_correlated").len(), 2);
    assert!(model.calls_for("reassign").is_empty());
    assert!(result.tags_raw.contains(&"hallucinated".to_string()));

    let canonical = ["Topic A", "Topic B", "Topic C"];
    for (i, assignment) in result.response_tags.iter().enumerate() {
        assert_eq!(assignment.response_index, i);
        assert_eq!(assignment.raw_tags, vec![format!("topic-{}", i % 3)]);
        assert_eq!(assignment.normalized_tags, vec![canonical[i % 3]]);
    }

    // groups and assignments describe the same relation
    for (tag, members) in &result.tag_groups {
        for member in members {
            assert_eq!(member.response, texts[member.index]);
            assert!(result.response_tags[member.index]
                .normalized_tags
                .contains(tag));
        }
    }
    for assignment in &result.response_tags {
        for tag in &assignment.normalized_tags {
            assert!(result.tag_groups[tag]
                .iter()
                .any(|m| m.index == assignment.response_index));
        }
    }
    assert_eq!(result.tag_groups["Topic A"].len(), 10);
    assert_eq!(result.meta.reassign_mode, ReassignMode::Fuzzy);
}

#[tokio::test]
async fn unreadable_reassignment_falls_back_to_fuzzy_matching() {
    let model = ScriptedModel::new(|prompt| {
        let out = match prompt.template_slug.as_str() {
            "extract_correlated_v1" => Value::Array(
                numbered(&prompt.user)
                    .into_iter()
                    .map(|(n, text)| json!({"response_id": n, "tags": [topic_of(&text).0]}))
                    .collect(),
            ),
            "normalize_v1" => json!({
                "Performance": ["slow app"],
                "Pricing": ["expensive"],
                "Support": ["helpful support"]
            }),
            "reassign_v1" => Value::String("no idea".to_string()),
            _ => json!({"synthesis": "ok", "verbatims": []}),
        };
        Ok(match out {
            Value::String(s) => s,
            other => other.to_string(),
        })
    });

    let session = AnalysisSession::new();
    let result = run_analysis(
        &model,
        &PipelineConfig::default(),
        &responses(THREE),
        AnalysisOptions {
            observer: Some(&session),
            ..AnalysisOptions::default()
        },
    )
    .await
    .unwrap();

    for (i, assignment) in result.response_tags.iter().enumerate() {
        assert_eq!(assignment.normalized_tags, vec![topic_of(THREE[i]).1]);
    }
    let (logs, _) = session.logs_since(0);
    assert!(logs.iter().any(|l| l.message.contains("fuzzy matching")));
    assert_eq!(session.status(), RunStatus::Completed);
}

#[tokio::test]
async fn fabricated_raw_tags_are_dropped_from_the_taxonomy() {
    let model = ScriptedModel::new(|prompt| {
        let out = match prompt.template_slug.as_str() {
            "extract_correlated_v1" => Value::Array(
                numbered(&prompt.user)
                    .into_iter()
                    .map(|(n, text)| json!({"response_id": n, "tags": [topic_of(&text).0]}))
                    .collect(),
            ),
            "normalize_v1" => json!({
                "Performance": ["Slow App", "made up"],
                "Ghost": ["nonexistent"],
                "Pricing": ["expensive", "slow app"],
                "Support": ["helpful support"]
            }),
            "reassign_v1" => json!([]),
            _ => json!({"synthesis": "ok", "verbatims": []}),
        };
        Ok(out.to_string())
    });

    let result = run_analysis(
        &model,
        &PipelineConfig::default(),
        &responses(THREE),
        AnalysisOptions::default(),
    )
    .await
    .unwrap();

    let names: Vec<&String> = result.normalized_tags.keys().collect();
    assert_eq!(names, vec!["Performance", "Pricing", "Support"]);
    assert_eq!(result.normalized_tags["Performance"], vec!["slow app"]);
    assert_eq!(result.normalized_tags["Pricing"], vec!["expensive"]);

    let raw_total: usize = result.normalized_tags.values().map(Vec::len).sum();
    assert_eq!(raw_total, result.tags_raw.len());
}

#[tokio::test]
async fn malformed_summary_degrades_only_that_group() {
    let model = ScriptedModel::new(|prompt| {
        let out = match prompt.template_slug.as_str() {
            "extract_correlated_v1" => Value::Array(
                numbered(&prompt.user)
                    .into_iter()
                    .map(|(n, text)| json!({"response_id": n, "tags": [topic_of(&text).0]}))
                    .collect(),
            ),
            "normalize_v1" => json!({
                "Performance": ["slow app"],
                "Pricing": ["expensive"],
                "Support": ["helpful support"]
            }),
            "reassign_v1" => Value::Array(
                numbered(&prompt.user)
                    .into_iter()
                    .map(|(n, text)| json!({"response_id": n, "tags": [topic_of(&text).1]}))
                    .collect(),
            ),
            "summarize_v1" if summary_tag(&prompt.user) == "Pricing" => {
                return Ok("the model rambled instead".to_string());
            }
            "summarize_v1" => json!({
                "synthesis": "Clear theme.",
                "verbatims": ["too slow", "not in any response", "very helpful"]
            }),
            other => panic!("unexpected template {other}"),
        };
        Ok(out.to_string())
    });

    let result = run_analysis(
        &model,
        &PipelineConfig::default(),
        &responses(THREE),
        AnalysisOptions::default(),
    )
    .await
    .unwrap();

    let pricing = &result.summaries["Pricing"];
    assert!(pricing.degraded);
    assert!(pricing.synthesis.starts_with("[summary unavailable: "));
    assert_eq!(pricing.member_count, 1);
    assert!(pricing.verbatims.is_empty());

    assert_eq!(result.summaries["Performance"].verbatims, vec!["too slow"]);
    assert_eq!(result.summaries["Support"].verbatims, vec!["very helpful"]);
    assert_eq!(result.meta.degraded_summaries, 1);
}

#[tokio::test]
async fn summaries_sample_at_most_the_configured_cap() {
    let texts: Vec<String> = (0..5).map(|i| format!("The app is slow, case {i}")).collect();
    let model = three_topic_model();
    let config = PipelineConfig {
        summary_sample_cap: 2,
        ..PipelineConfig::default()
    };
    let result = run_analysis(&model, &config, &texts, AnalysisOptions::default())
        .await
        .unwrap();

    assert_eq!(result.tag_groups["Performance"].len(), 5);
    assert_eq!(result.summaries["Performance"].member_count, 5);

    let prompts = model.calls_for("summarize");
    assert_eq!(prompts.len(), 1);
    assert_eq!(numbered(&prompts[0].user).len(), 2);
}

#[tokio::test]
async fn provider_failure_marks_session_as_errored() {
    let model: Arc<dyn ModelClient> = Arc::new(ScriptedModel::new(|prompt| {
        match prompt.template_slug.as_str() {
            "normalize_v1" => Err(ProviderError::provider("openrouter", "HTTP 503", true)),
            _ => Ok(r#"[{"response_id": 1, "tags": ["slow app"]}]"#.to_string()),
        }
    }));
    let session = Arc::new(AnalysisSession::new());

    let handle = spawn_analysis(
        model,
        PipelineConfig::default(),
        responses(THREE),
        session.clone(),
        None,
        Arc::new(AtomicBool::new(false)),
    );
    let err = handle.await.unwrap().unwrap_err();

    match &err {
        PipelineError::Provider { stage, source } => {
            assert_eq!(*stage, Stage::Normalization);
            assert!(source.is_retryable());
        }
        other => panic!("expected provider error, got {other:?}"),
    }

    let snap = session.snapshot();
    assert_eq!(snap.status, RunStatus::Error);
    assert_eq!(snap.current_step.as_deref(), Some("normalization"));
    assert!(snap.error.unwrap().contains("HTTP 503"));
}

#[tokio::test]
async fn cancel_flag_stops_the_run_before_the_next_stage() {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    let model: Arc<dyn ModelClient> = Arc::new(ScriptedModel::new(move |prompt| {
        if prompt.template_slug == "extract_correlated_v1" {
            flag.store(true, Ordering::Relaxed);
        }
        Ok(r#"[{"response_id": 1, "tags": ["slow app"]}]"#.to_string())
    }));
    let session = Arc::new(AnalysisSession::new());

    let handle = spawn_analysis(
        model,
        PipelineConfig::default(),
        responses(THREE),
        session.clone(),
        None,
        cancel,
    );
    let err = handle.await.unwrap().unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: Stage::Normalization
        }
    ));
    assert_eq!(session.status(), RunStatus::Error);
}

#[tokio::test]
async fn empty_input_and_bad_config_fail_before_any_call() {
    let model = three_topic_model();

    let err = run_analysis(&model, &PipelineConfig::default(), &[], AnalysisOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Data {
            stage: Stage::Input,
            ..
        }
    ));

    let config = PipelineConfig {
        extract_batch_size: 0,
        ..PipelineConfig::default()
    };
    let err = run_analysis(&model, &config, &responses(THREE), AnalysisOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));

    assert!(model.prompts.lock().unwrap().is_empty());
}

/// Answers like a slow provider: later batches return first.
struct ReorderingModel {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Global index encoded in a `resp-<i>` response text.
fn index_of(text: &str) -> usize {
    text.trim_start_matches("resp-").parse().unwrap()
}

fn parity(i: usize) -> &'static str {
    if i % 2 == 0 {
        "Even"
    } else {
        "Odd"
    }
}

#[async_trait]
impl ModelClient for ReorderingModel {
    async fn call_model(
        &self,
        prompt: &PromptInstance,
        _max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let items = numbered(&prompt.user);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let first = items.first().map(|(_, t)| index_of(t)).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(2 * (40 - first.min(40)) as u64)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let out = match prompt.template_slug.as_str() {
            "extract_correlated_v1" => Value::Array(
                items
                    .iter()
                    .map(|(n, t)| json!({"response_id": n, "tags": [format!("tag-{}", index_of(t))]}))
                    .collect(),
            ),
            "normalize_v1" => {
                let (even, odd): (Vec<usize>, Vec<usize>) = (0..40).partition(|i| i % 2 == 0);
                let names = |ids: Vec<usize>| -> Vec<String> {
                    ids.into_iter().map(|i| format!("tag-{i}")).collect()
                };
                json!({"Even": names(even), "Odd": names(odd)})
            }
            "reassign_v1" => Value::Array(
                items
                    .iter()
                    .map(|(n, t)| json!({"response_id": n, "tags": [parity(index_of(t))]}))
                    .collect(),
            ),
            "summarize_v1" => {
                json!({"synthesis": "Numbered responses.", "verbatims": [items[0].1.clone()]})
            }
            other => panic!("unexpected template {other}"),
        };
        Ok(out.to_string())
    }

    fn model_id(&self) -> &str {
        "reordering"
    }
}

#[tokio::test]
async fn concurrent_batches_keep_global_indices_on_a_spawned_run() {
    let model = Arc::new(ReorderingModel {
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    });
    let texts: Vec<String> = (0..40).map(|i| format!("resp-{i}")).collect();
    let config = PipelineConfig {
        extract_batch_size: 7,
        reassign_batch_size: 5,
        batch_concurrency: 4,
        ..PipelineConfig::default()
    };
    let session = Arc::new(AnalysisSession::new());

    let handle = spawn_analysis(
        model.clone(),
        config,
        texts,
        session.clone(),
        None,
        Arc::new(AtomicBool::new(false)),
    );
    let result = handle.await.unwrap().unwrap();

    assert_eq!(result.meta.extraction_strategy, ExtractionStrategy::Correlated);
    assert_eq!(result.response_tags.len(), 40);
    for (i, assignment) in result.response_tags.iter().enumerate() {
        assert_eq!(assignment.response_index, i);
        assert_eq!(assignment.raw_tags, vec![format!("tag-{i}")]);
        assert_eq!(assignment.normalized_tags, vec![parity(i)]);
    }
    let first_seen: Vec<String> = (0..40).map(|i| format!("tag-{i}")).collect();
    assert_eq!(result.tags_raw, first_seen);

    let even: Vec<usize> = result.tag_groups["Even"].iter().map(|m| m.index).collect();
    assert_eq!(even, (0..40).step_by(2).collect::<Vec<_>>());
    assert_eq!(result.summaries["Even"].verbatims, vec!["resp-0"]);
    assert_eq!(result.summaries["Odd"].verbatims, vec!["resp-1"]);

    // 6 extract + 1 normalize + 8 reassign + 2 summarize
    assert_eq!(result.meta.model_calls, 17);
    let peak = model.max_in_flight.load(Ordering::SeqCst);
    assert!((2..=4).contains(&peak), "peak in-flight calls: {peak}");
    assert_eq!(session.status(), RunStatus::Completed);
}
