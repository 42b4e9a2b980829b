//! Step prompt builder.
//!
//! Prompts are rebuilt purely from persisted task state (workflow snapshot,
//! request, documents on disk) so that a resumed or rotated session sees
//! exactly what the original would have.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::types::Task;
use crate::io::config::QuillConfig;
use crate::io::layout::TaskPaths;
use crate::io::task_store::read_document;

const STEP_TEMPLATE: &str = include_str!("prompts/step.md");

/// Name of the document holding the initial request.
pub const REQUEST_DOCUMENT: &str = "request";

/// A prior document as the template sees it.
#[derive(Debug, Clone, Serialize)]
pub struct PromptDocument {
    pub name: String,
    /// Where it came from, e.g. `step 2 (architect)`.
    pub origin: String,
    pub content: String,
    /// Whether the contents are inlined (the request has its own section).
    pub inline: bool,
}

/// Everything the step template needs.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub role: String,
    pub instructions: String,
    pub handoff: Option<String>,
    pub request: String,
    pub documents: Vec<PromptDocument>,
    /// Logical name of the document this step produces.
    pub document: String,
    pub step_index: usize,
    pub total_steps: usize,
}

impl PromptInputs {
    /// Gather inputs for `step_index` from the task checkpoint and its documents.
    pub fn for_step(
        task: &Task,
        paths: &TaskPaths,
        step_index: usize,
        config: &QuillConfig,
    ) -> Result<Self> {
        let step = task
            .workflow
            .steps
            .get(step_index)
            .ok_or_else(|| anyhow!("task {} has no step {step_index}", task.id))?;

        let mut request = String::new();
        let mut documents = Vec::new();
        for (name, doc) in task.documents_in_step_order() {
            let content = read_document(paths, doc)?;
            if name == REQUEST_DOCUMENT {
                request.clone_from(&content);
            }
            let origin = match doc.produced_by {
                None => "initial request".to_string(),
                Some(i) => {
                    let role = task.workflow.steps.get(i).map_or("?", |s| s.role.as_str());
                    format!("step {} ({role})", i + 1)
                }
            };
            documents.push(PromptDocument {
                name: name.to_string(),
                origin,
                content,
                inline: name != REQUEST_DOCUMENT,
            });
        }

        let instructions = config
            .role_instructions(&step.role)
            .map_or_else(|| default_instructions(&step.role), str::to_string);

        Ok(Self {
            role: step.role.clone(),
            instructions,
            handoff: step
                .handoff
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            request,
            documents,
            document: step.document_name().to_string(),
            step_index,
            total_steps: task.total_steps(),
        })
    }
}

fn default_instructions(role: &str) -> String {
    format!(
        "You are the {role} in a multi-step writing pipeline. Use the request and the \
         documents below, and produce this step's contribution as file changes."
    )
}

/// Renders step prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("step", STEP_TEMPLATE)
            .context("load step template")?;
        let rendered = env
            .get_template("step")?
            .render(context! {
                role => &input.role,
                instructions => input.instructions.trim(),
                handoff => input.handoff.as_deref(),
                request => input.request.trim(),
                documents => &input.documents,
                document => &input.document,
                step_number => input.step_index + 1,
                total_steps => input.total_steps,
            })
            .context("render step template")?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(join_sections(&sections))
    }
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    droppable: bool,
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

/// Split on `<!-- section:KEY required|droppable -->` markers. Empty sections vanish.
fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim();
        if content.is_empty() {
            continue;
        }
        sections.push(Section {
            key: key.as_str().to_string(),
            droppable: kind.as_str() == "droppable",
            content: content.to_string(),
        });
    }
    sections
}

const SEPARATOR: &str = "\n\n";
const TRUNCATION_NOTICE: &str = "\n[truncated]";

fn total_len(sections: &[Section]) -> usize {
    let separators = sections.len().saturating_sub(1) * SEPARATOR.len();
    sections.iter().map(|s| s.content.len()).sum::<usize>() + separators
}

/// Drop droppable sections oldest first; the newest one is truncated before it is dropped.
fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    while total_len(sections) > budget {
        let droppable: Vec<usize> = sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.droppable)
            .map(|(i, _)| i)
            .collect();
        match droppable.as_slice() {
            [] => break,
            [only] => {
                let idx = *only;
                let others = total_len(sections) - sections[idx].content.len();
                let allowed = budget.saturating_sub(others);
                if allowed > TRUNCATION_NOTICE.len() + 64 {
                    let section = &mut sections[idx];
                    let before = section.content.len();
                    truncate_at_char_boundary(&mut section.content, allowed - TRUNCATION_NOTICE.len());
                    section.content.push_str(TRUNCATION_NOTICE);
                    debug!(section = %section.key, before, after = section.content.len(), "truncated section for budget");
                } else {
                    let dropped = sections.remove(idx);
                    debug!(section = %dropped.key, bytes = dropped.content.len(), "dropped section for budget");
                }
                break;
            }
            [first, ..] => {
                let dropped = sections.remove(*first);
                debug!(section = %dropped.key, bytes = dropped.content.len(), "dropped section for budget");
            }
        }
    }
    let len = total_len(sections);
    if len > budget {
        warn!(len, budget, "required prompt sections exceed the budget");
    }
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    let mut cut = max.min(s.len());
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

fn join_sections(sections: &[Section]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SEPARATOR);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str, origin: &str, content: &str) -> PromptDocument {
        PromptDocument {
            name: name.to_string(),
            origin: origin.to_string(),
            content: content.to_string(),
            inline: name != REQUEST_DOCUMENT,
        }
    }

    fn inputs(documents: Vec<PromptDocument>) -> PromptInputs {
        PromptInputs {
            role: "writer".to_string(),
            instructions: "Write the draft.".to_string(),
            handoff: Some("Keep it short.".to_string()),
            request: "An essay about tides".to_string(),
            documents,
            document: "draft".to_string(),
            step_index: 2,
            total_steps: 3,
        }
    }

    /// Verifies sections appear in a fixed order with the handoff before the instructions.
    #[test]
    fn prompt_ordering_is_stable() {
        let prompt = PromptBuilder::new(100_000)
            .build(&inputs(vec![
                doc("request", "initial request", "An essay about tides"),
                doc("brief", "step 1 (analyst)", "BRIEF BODY"),
                doc("outline", "step 2 (architect)", "OUTLINE BODY"),
            ]))
            .expect("build");

        let pos = |needle: &str| prompt.find(needle).unwrap_or_else(|| panic!("missing {needle}"));
        assert!(pos("### Role: writer (step 3 of 3)") < pos("Keep it short."));
        assert!(pos("Keep it short.") < pos("Write the draft."));
        assert!(pos("Write the draft.") < pos("### Request"));
        assert!(pos("### Request") < pos("### Documents"));
        assert!(pos("- `brief`: step 1 (analyst)") < pos("- `outline`: step 2 (architect)"));
        assert!(pos("BRIEF BODY") < pos("OUTLINE BODY"));
        assert!(pos("OUTLINE BODY") < pos("### Output Contract"));
        assert!(prompt.contains("saved as the `draft` document"));
        assert!(!prompt.contains("#### Document `request`"));
        assert!(!prompt.contains("<!--"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let input = inputs(vec![doc("brief", "step 1 (analyst)", "x")]);
        let builder = PromptBuilder::new(100_000);
        assert_eq!(builder.build(&input).expect("a"), builder.build(&input).expect("b"));
    }

    /// Verifies the oldest document contents go first while references stay.
    #[test]
    fn budget_drops_oldest_contents_first() {
        let input = inputs(vec![
            doc("brief", "step 1 (analyst)", &"b".repeat(2_000)),
            doc("outline", "step 2 (architect)", &"o".repeat(300)),
        ]);
        let full = PromptBuilder::new(100_000).build(&input).expect("full");
        let prompt = PromptBuilder::new(full.len() - 1_000).build(&input).expect("build");

        assert!(!prompt.contains("#### Document `brief`"));
        assert!(prompt.contains("#### Document `outline`"));
        assert!(prompt.contains("- `brief`: step 1 (analyst)"), "reference remains");
        assert!(prompt.contains("### Output Contract"));
    }

    #[test]
    fn last_document_is_truncated_before_it_is_dropped() {
        let input = inputs(vec![doc("brief", "step 1 (analyst)", &"b".repeat(5_000))]);
        let full = PromptBuilder::new(100_000).build(&input).expect("full");
        let prompt = PromptBuilder::new(full.len() - 2_000).build(&input).expect("build");
        assert!(prompt.contains("#### Document `brief`"));
        assert!(prompt.contains("[truncated]"));
        assert!(prompt.len() <= full.len() - 2_000 + 1);
    }

    #[test]
    fn truncation_respects_utf8() {
        let mut s = "ééé".to_string();
        truncate_at_char_boundary(&mut s, 3);
        assert_eq!(s, "é");
    }
}
