//! Issue context gathering and prompt construction for agent runs.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::Result;
use crate::issue::{Comment, Issue};
use crate::store::Store;

const MAX_RECENT_COMMENTS: usize = 5;

#[derive(Debug, Clone)]
pub struct PromptContext {
    pub issue: Issue,
    pub labels: Vec<String>,
    pub dependencies: Vec<Issue>,
    pub dependents: Vec<Issue>,
    pub recent_comments: Vec<Comment>,
}

pub struct ContextGatherer {
    store: Arc<Store>,
}

impl ContextGatherer {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn gather(&self, issue: &Issue) -> Result<PromptContext> {
        Ok(PromptContext {
            issue: issue.clone(),
            labels: self.store.get_labels(&issue.id)?,
            dependencies: self.store.get_dependencies(&issue.id)?,
            dependents: self.store.get_dependents(&issue.id)?,
            recent_comments: self.store.get_comments(&issue.id, MAX_RECENT_COMMENTS)?,
        })
    }
}

/// Render the single large prompt handed to the agent on stdin.
pub fn build_prompt(ctx: &PromptContext) -> String {
    let issue = &ctx.issue;
    let mut prompt = String::new();

    let _ = writeln!(prompt, "# Task: {} ({})", issue.title, issue.id);
    let _ = writeln!(prompt, "Priority: P{}, type: {}", issue.priority, issue.issue_type);
    if !ctx.labels.is_empty() {
        let _ = writeln!(prompt, "Labels: {}", ctx.labels.join(", "));
    }

    if !issue.description.is_empty() {
        let _ = writeln!(prompt, "\n## Description\n{}", issue.description);
    }
    if !issue.design.is_empty() {
        let _ = writeln!(prompt, "\n## Design notes\n{}", issue.design);
    }
    if !issue.acceptance_criteria.is_empty() {
        let _ = writeln!(prompt, "\n## Acceptance criteria\n{}", issue.acceptance_criteria);
    }

    if !ctx.dependencies.is_empty() {
        let _ = writeln!(prompt, "\n## Depends on");
        for dep in &ctx.dependencies {
            let _ = writeln!(prompt, "- {} ({}): {}", dep.id, dep.status, dep.title);
        }
    }
    if !ctx.dependents.is_empty() {
        let _ = writeln!(prompt, "\n## Blocks");
        for dep in &ctx.dependents {
            let _ = writeln!(prompt, "- {} ({}): {}", dep.id, dep.status, dep.title);
        }
    }

    if !ctx.recent_comments.is_empty() {
        let _ = writeln!(prompt, "\n## Recent activity");
        for comment in &ctx.recent_comments {
            let _ = writeln!(prompt, "- [{}] {}", comment.actor, comment.body);
        }
    }

    prompt.push_str(
        "\n## Instructions\n\
         Work in the current directory. Resolve the task described above, keeping\n\
         changes minimal and focused. Report progress as JSON lines on stdout:\n\
         - progress: {\"type\": \"agent_progress\", \"message\": \"...\"}\n\
         - follow-up work you discover but should not do now:\n\
           {\"type\": \"discovery\", \"title\": \"...\", \"description\": \"...\"}\n\
         - when finished, exactly one terminal line:\n\
           {\"type\": \"result\", \"success\": true|false, \"summary\": \"...\"}\n",
    );

    prompt
}
