//! Prompt rendering for the generation-backed phases.
//!
//! Templates are split into sections with `<!-- section:KEY required|droppable -->`
//! markers. When a rendered prompt exceeds the byte budget, droppable sections
//! are removed in a fixed order and the last section is truncated as a last
//! resort.

use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

const STUDY_TEMPLATE: &str = include_str!("prompts/study.md");
const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");

pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 48_000;

const STUDY_SYSTEM: &str = "You are an autonomous software development agent. \
You work through a prioritized task list one task at a time. \
In this step you analyse; you do not write code.";

const IMPLEMENT_SYSTEM: &str = "You are an autonomous software development agent. \
Write complete, working code for the task. \
Every file goes in its own fenced code block labelled with its relative path.";

const REVIEW_SYSTEM: &str = "You are a strict code reviewer. \
Judge whether the implementation completes the task and finish with a VERDICT line.";

/// Sections removed first when over budget.
const DROP_ORDER: &[&str] = &[
    "layout",
    "files",
    "goal",
    "notes",
    "implementation",
    "failure",
    "feedback",
];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should be valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Study,
    Implement,
    Review,
}

impl PromptKind {
    fn template_name(self) -> &'static str {
        match self {
            PromptKind::Study => "study",
            PromptKind::Implement => "implement",
            PromptKind::Review => "review",
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            PromptKind::Study => STUDY_SYSTEM,
            PromptKind::Implement => IMPLEMENT_SYSTEM,
            PromptKind::Review => REVIEW_SYSTEM,
        }
    }
}

/// Everything a template may reference. Empty fields drop their section.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs<'a> {
    pub task: &'a str,
    pub task_attempt: u32,
    pub goal: Option<&'a str>,
    pub feedback: Option<&'a str>,
    pub previous_failure: Option<&'a str>,
    pub layout: Option<&'a str>,
    pub study_notes: Option<&'a str>,
    pub implementation: Option<&'a str>,
    pub files_written: &'a [PathBuf],
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("study", STUDY_TEMPLATE)
            .expect("study template should be valid");
        env.add_template("implement", IMPLEMENT_TEMPLATE)
            .expect("implement template should be valid");
        env.add_template("review", REVIEW_TEMPLATE)
            .expect("review template should be valid");
        Self { env, budget_bytes }
    }

    pub fn render(&self, kind: PromptKind, input: &PromptInputs<'_>) -> Result<String> {
        let files: Vec<String> = input
            .files_written
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let template = self.env.get_template(kind.template_name())?;
        let rendered = template.render(context! {
            task => input.task.trim(),
            attempt => input.task_attempt,
            goal => non_empty(input.goal),
            feedback => non_empty(input.feedback),
            failure => non_empty(input.previous_failure),
            layout => non_empty(input.layout),
            notes => non_empty(input.study_notes),
            implementation => non_empty(input.implementation),
            files => files,
        })?;

        let mut sections = parse_sections(&rendered);
        fit_to_budget(&mut sections, self.budget_bytes);
        Ok(join_sections(&sections))
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET_BYTES)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(flag)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(rendered.len());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = flag.as_str() == "required";
        if content.is_empty() && !required {
            continue;
        }
        sections.push(Section {
            key: key.as_str().to_string(),
            required,
            content,
        });
    }
    sections
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn fit_to_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes = sections[idx].content.len(),
                "dropped prompt section"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    // Truncate the largest section rather than the instructions at the end.
    let Some(idx) = sections
        .iter()
        .enumerate()
        .max_by_key(|(_, s)| s.content.len())
        .map(|(i, _)| i)
    else {
        return;
    };
    let over = total - budget;
    let section = &mut sections[idx];
    let target = section.content.len().saturating_sub(over + 12);
    let keep = floor_char_boundary(&section.content, target);
    section.content.truncate(keep);
    section.content.push_str("\n[truncated]");
    debug!(section = %section.key, kept = keep, "truncated prompt section");
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn join_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>() -> PromptInputs<'a> {
        PromptInputs {
            task: "add a --verbose flag",
            task_attempt: 1,
            goal: Some("a small cli"),
            layout: Some("src/main.rs\nCargo.toml"),
            ..PromptInputs::default()
        }
    }

    #[test]
    fn study_prompt_orders_sections() {
        let prompt = PromptBuilder::default()
            .render(PromptKind::Study, &inputs())
            .expect("render");
        let task = prompt.find("add a --verbose flag").expect("task");
        let goal = prompt.find("a small cli").expect("goal");
        let layout = prompt.find("src/main.rs").expect("layout");
        let instructions = prompt.find("## Instructions").expect("instructions");
        assert!(task < goal && goal < layout && layout < instructions);
        assert!(!prompt.contains("Operator feedback"));
        assert!(!prompt.contains("<!--"));
    }

    #[test]
    fn feedback_and_failure_are_included_when_present() {
        let input = PromptInputs {
            feedback: Some("use clap"),
            previous_failure: Some("test x failed"),
            study_notes: Some("touch main.rs"),
            ..inputs()
        };
        let prompt = PromptBuilder::default()
            .render(PromptKind::Implement, &input)
            .expect("render");
        assert!(prompt.contains("use clap"));
        assert!(prompt.contains("test x failed"));
        assert!(prompt.contains("touch main.rs"));
    }

    #[test]
    fn review_lists_files_and_asks_for_verdict() {
        let files = vec![PathBuf::from("src/cli.rs")];
        let input = PromptInputs {
            implementation: Some("```src/cli.rs\n...\n```"),
            files_written: &files,
            ..inputs()
        };
        let prompt = PromptBuilder::default()
            .render(PromptKind::Review, &input)
            .expect("render");
        assert!(prompt.contains("- src/cli.rs"));
        assert!(prompt.trim_end().ends_with("VERDICT: FAIL"));
    }

    #[test]
    fn budget_drops_layout_before_goal() {
        let layout = "file.rs\n".repeat(200);
        let input = PromptInputs {
            layout: Some(&layout),
            ..inputs()
        };
        let full = PromptBuilder::default()
            .render(PromptKind::Study, &input)
            .expect("render");
        let budget = full.len() - layout.len() / 2;
        let prompt = PromptBuilder::new(budget)
            .render(PromptKind::Study, &input)
            .expect("render");
        assert!(!prompt.contains("## Project files"));
        assert!(prompt.contains("a small cli"));
        assert!(prompt.contains("add a --verbose flag"));
    }
}
