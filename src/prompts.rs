//! Prompt templates for each analysis stage.
//!
//! Domain logic for rendering stage prompts. Provider-agnostic.

use crate::gateway::Message;

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Undo [`escape_xml_chars`] on text a model echoes back.
pub fn unescape_xml_chars(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// A prompt template with `{name}` placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Substitute placeholders. Values are inserted as given; use
    /// [`numbered_block`] / [`bulleted_block`] for untrusted text.
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        let mut system = self.system.to_string();
        let mut user = self.user.to_string();
        for (name, value) in vars {
            let placeholder = format!("{{{name}}}");
            system = system.replace(&placeholder, value);
            user = user.replace(&placeholder, value);
        }

        PromptInstance {
            template_slug: self.slug.to_string(),
            system: system.trim().to_string(),
            user: user.trim().to_string(),
        }
    }
}

/// `1. text` lines, one per item, numbered from 1.
///
/// Line breaks inside an item are folded so numbering stays unambiguous.
pub fn numbered_block<'a>(items: impl IntoIterator<Item = &'a str>) -> String {
    items
        .into_iter()
        .enumerate()
        .map(|(i, text)| format!("{}. {}", i + 1, escape_xml_chars(&fold_lines(text))))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `- tag` lines, one per item.
pub fn bulleted_block<'a>(items: impl IntoIterator<Item = &'a str>) -> String {
    items
        .into_iter()
        .map(|tag| format!("- {}", escape_xml_chars(&fold_lines(tag))))
        .collect::<Vec<_>>()
        .join("\n")
}

fn fold_lines(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// =============================================================================
// Stage prompts
// =============================================================================

pub const EXTRACT_CORRELATED: PromptTemplate = PromptTemplate {
    slug: "extract_correlated_v1",
    system: r#"You are an expert analyst who extracts relevant tags from survey responses."#,
    user: r#"Analyze the following survey responses and extract the key concepts (tags) present in each one.
For each response, identify 2 to 5 short tags that capture its main ideas.

<responses>
{responses}
</responses>

Return only a JSON array with one object per response, using the response number as response_id:
[
  {"response_id": 1, "tags": ["tag1", "tag2"]},
  {"response_id": 2, "tags": ["tag3", "tag4", "tag5"]}
]
json:"#,
};

pub const EXTRACT_FLAT: PromptTemplate = PromptTemplate {
    slug: "extract_flat_v1",
    system: r#"You are an expert analyst who extracts relevant tags from survey responses."#,
    user: r#"Analyze the following survey responses and extract the key concepts (tags) present in each one.
For each response, identify 2 to 5 short tags that capture its main ideas.

<responses>
{responses}
</responses>

Return only a JSON array of all the unique tags you identified, with no explanation:
["tag1", "tag2", "tag3"]
json:"#,
};

pub const NORMALIZE: PromptTemplate = PromptTemplate {
    slug: "normalize_v1",
    system: r#"You are an expert analyst who builds consistent tag taxonomies."#,
    user: r#"Here is a list of tags extracted from answers to an open survey question.
Normalize them: group synonyms, remove duplicates and harmonize the wording.

<tags>
{tags}
</tags>

Return only a JSON object mapping each normalized tag to the original tags it covers:
{
  "normalized tag 1": ["original tag 1", "original tag 2"],
  "normalized tag 2": ["original tag 3"]
}
Every original tag must belong to exactly one normalized tag. Copy original tags exactly as written.
json:"#,
};

pub const REASSIGN: PromptTemplate = PromptTemplate {
    slug: "reassign_v1",
    system: r#"You are an expert analyst who labels survey responses with a fixed set of tags."#,
    user: r#"For each response below, identify which of the available tags apply to it.
Only use tags from this list, spelled exactly as written:

<tags>
{tags}
</tags>

<responses>
{responses}
</responses>

Return only a JSON array with one object per response, using the response number as response_id:
[
  {"response_id": 1, "tags": ["tag1", "tag2"]},
  {"response_id": 2, "tags": ["tag3"]}
]
json:"#,
};

pub const SUMMARIZE: PromptTemplate = PromptTemplate {
    slug: "summarize_v1",
    system: r#"You are an expert analyst who writes concise syntheses of survey feedback."#,
    user: r#"Synthesize the following survey responses, all associated with the tag "{tag}".

<responses>
{responses}
</responses>

Write a structured synthesis (at most 300 words) that:
1. summarizes the main ideas expressed
2. identifies common points and divergences
3. notes any particular trend or point of attention

Also pick 1 to 3 short verbatim quotes, copied exactly from the responses, that illustrate the synthesis.

Return only a JSON object:
{"synthesis": "...", "verbatims": ["quote 1", "quote 2"]}
json:"#,
};

// =============================================================================
// TESTS
// =============================================================================
