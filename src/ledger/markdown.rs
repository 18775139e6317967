//! Markdown rendering/parsing for the projected ledger view.
//!
//! The rendered file is human-readable prose followed by a single fenced
//! JSON block carrying the canonical state, so a restart can deserialize
//! exactly what was rendered without re-deriving a markdown grammar.

use crate::types::{
    AssumptionStatus, Ledger, TaskStatus,
};
use crate::types::LedgerError;

const STATE_MARKER_START: &str = "<!-- ledger-state";
const STATE_MARKER_END: &str = "-->";

fn task_marker(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "[ ]",
        TaskStatus::Running => "[~]",
        TaskStatus::Completed => "[x]",
        TaskStatus::Failed => "[!]",
        TaskStatus::Timeout => "[t]",
        // stale must render distinctly from suspended.
        TaskStatus::Stale => "[s]",
        TaskStatus::Suspended => "[z]",
    }
}

fn assumption_marker(status: AssumptionStatus) -> &'static str {
    match status {
        AssumptionStatus::PendingReview => "pending_review",
        AssumptionStatus::Approved => "approved",
        AssumptionStatus::Rejected => "rejected",
    }
}

pub fn render(ledger: &Ledger) -> String {
    let mut out = String::new();
    out.push_str("# Orchestration Ledger\n\n");

    out.push_str("## Meta\n");
    out.push_str(&format!("- session: {}\n", ledger.meta.session_id));
    out.push_str(&format!("- status: {:?}\n", ledger.meta.status));
    out.push_str(&format!("- phase: {}\n", ledger.meta.phase));
    out.push_str(&format!(
        "- tasks: {}/{}\n",
        ledger.meta.tasks_completed, ledger.meta.tasks_total
    ));
    if let Some(current) = &ledger.meta.current_task {
        out.push_str(&format!("- current_task: {current}\n"));
    }
    out.push('\n');

    out.push_str("## Governance\n");
    if !ledger.governance.directives.is_empty() {
        out.push_str("### Directives\n");
        for d in &ledger.governance.directives {
            out.push_str(&format!("- ({}) {}\n", d.source, d.content));
        }
    }
    if !ledger.governance.assumptions.is_empty() {
        out.push_str("### Assumptions\n");
        for a in &ledger.governance.assumptions {
            out.push_str(&format!(
                "- [{}] {} -- {} ({})\n",
                assumption_marker(a.status),
                a.content,
                a.rationale,
                a.source
            ));
        }
    }
    out.push('\n');

    if let Some(epic) = &ledger.epic {
        out.push_str(&format!("## Epic: {}\n", epic.title));
        out.push_str(&format!("- status: {:?}\n", epic.status));
        out.push_str("### Tasks\n");
        for task in &epic.tasks {
            out.push_str(&format!("- {} {}\n", task_marker(task.status), task.title));
        }
        if !epic.progress_log.is_empty() {
            out.push_str("### Progress Log\n");
            for line in &epic.progress_log {
                out.push_str(&format!("- {line}\n"));
            }
        }
        out.push('\n');
    }

    if !ledger.activity.is_empty() {
        out.push_str("## Recent Activity\n");
        for line in &ledger.activity {
            out.push_str(&format!("- {line}\n"));
        }
        out.push('\n');
    }

    out.push_str("## Learnings\n");
    for (label, list) in [
        ("Patterns", &ledger.learnings.patterns),
        ("Anti-patterns", &ledger.learnings.anti_patterns),
        ("Decisions", &ledger.learnings.decisions),
        ("Preferences", &ledger.learnings.preferences),
    ] {
        if !list.is_empty() {
            out.push_str(&format!("### {label}\n"));
            for entry in list {
                out.push_str(&format!("- {entry}\n"));
            }
        }
    }
    out.push('\n');

    if !ledger.archive.is_empty() {
        out.push_str("## Archive\n");
        for archived in &ledger.archive {
            out.push_str(&format!("- {} ({:?})\n", archived.epic.title, archived.epic.status));
        }
        out.push('\n');
    }

    let json = serde_json::to_string_pretty(ledger).unwrap_or_default();
    out.push_str(STATE_MARKER_START);
    out.push('\n');
    out.push_str(&json);
    out.push('\n');
    out.push_str(STATE_MARKER_END);
    out.push('\n');

    out
}

pub fn parse(text: &str) -> Result<Ledger, LedgerError> {
    let start = text.find(STATE_MARKER_START).ok_or_else(|| LedgerError::ParseFailed {
        reason: "missing ledger-state marker".to_string(),
    })?;
    let after_marker = &text[start + STATE_MARKER_START.len()..];
    let end = after_marker.find(STATE_MARKER_END).ok_or_else(|| LedgerError::ParseFailed {
        reason: "unterminated ledger-state marker".to_string(),
    })?;
    let json = after_marker[..end].trim();
    serde_json::from_str(json).map_err(|e| LedgerError::ParseFailed {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Epic;

    #[test]
    fn render_then_parse_round_trips() {
        let mut ledger = Ledger::new("session-1", 1000);
        let mut epic = Epic::new("epic-1", "Ship feature", "do the thing", 1000);
        epic.push_task(crate::types::LedgerTask {
            id: "t1".into(),
            title: "Write code".into(),
            status: TaskStatus::Completed,
        });
        ledger.epic = Some(epic);
        ledger.push_activity("did something".to_string());
        ledger.learnings.push("decision", "use postgres".to_string());

        let rendered = render(&ledger);
        let parsed = parse(&rendered).unwrap();
        assert_eq!(parsed.meta.session_id, "session-1");
        assert_eq!(parsed.epic.unwrap().tasks.len(), 1);
        assert_eq!(parsed.learnings.decisions, vec!["use postgres".to_string()]);
    }
}
