//! Property tests for the invariants that must hold regardless of the
//! specific sequence of operations applied: bounded ledger collections,
//! retry-count monotonicity, and lossless markdown round-tripping.

use orchestrator_core::registry::TaskRegistry;
use orchestrator_core::config::RegistryConfig;
use orchestrator_core::types::{Epic, Ledger, LedgerTask, TaskDescriptor, TaskStatus};
use orchestrator_core::ledger::markdown;
use proptest::prelude::*;

proptest! {
    /// Pushing any number of tasks onto an epic never grows it past the cap.
    #[test]
    fn epic_tasks_never_exceed_max(titles in prop::collection::vec("[a-z]{1,12}", 0..20)) {
        let mut epic = Epic::new("epic-1", "title", "request", 0);
        for (i, title) in titles.iter().enumerate() {
            epic.push_task(LedgerTask { id: format!("t{i}"), title: title.clone(), status: TaskStatus::Pending });
        }
        prop_assert!(epic.tasks.len() <= orchestrator_core::types::MAX_EPIC_TASKS);
    }

    /// Pushing any number of activity lines never grows the ring past its cap,
    /// and it always retains the most recently pushed line.
    #[test]
    fn activity_ring_is_bounded_and_keeps_the_latest(lines in prop::collection::vec("[a-z ]{1,24}", 1..30)) {
        let mut ledger = Ledger::new("session-1", 0);
        for line in &lines {
            ledger.push_activity(line.clone());
        }
        prop_assert!(ledger.activity.len() <= orchestrator_core::types::MAX_ACTIVITY);
        prop_assert_eq!(ledger.activity.back().cloned(), lines.last().cloned());
    }

    /// Archiving epics repeatedly never grows the archive past its cap.
    #[test]
    fn archive_is_bounded(count in 0usize..15) {
        let mut ledger = Ledger::new("session-1", 0);
        for i in 0..count {
            ledger.epic = Some(Epic::new(format!("epic-{i}"), "t", "r", 0));
            ledger.archive_current_epic(i as u64);
        }
        prop_assert!(ledger.archive.len() <= orchestrator_core::types::MAX_ARCHIVE);
    }

    /// retry_count only ever moves up, by exactly one per call, and a task
    /// with retry_count == max_retries is never reported retriable.
    #[test]
    fn retry_count_is_monotonic_and_respects_the_cap(bumps in 0usize..10) {
        let registry = TaskRegistry::new(RegistryConfig { default_max_retries: 3, ..RegistryConfig::default() });
        let id = registry.register(TaskDescriptor::new("reviewer", "do thing"));
        registry.update_status(id, TaskStatus::Running, None, None).unwrap();
        registry.update_status(id, TaskStatus::Failed, None, Some("boom".into())).unwrap();

        let mut last = 0u32;
        for _ in 0..bumps {
            if registry.get(id).unwrap().retry_count >= 3 {
                break;
            }
            let next = registry.increment_retry(id).unwrap();
            prop_assert_eq!(next, last + 1);
            last = next;
        }
        prop_assert!(registry.get(id).unwrap().retry_count <= 3);
        if registry.get(id).unwrap().retry_count >= 3 {
            prop_assert!(registry.retriable().is_empty());
        }
    }

    /// Rendering a ledger to markdown and parsing it back always reproduces
    /// the same session id and activity log, regardless of content.
    #[test]
    fn markdown_round_trip_is_lossless(session_id in "[a-z0-9-]{1,16}", lines in prop::collection::vec("[a-z ]{0,24}", 0..8)) {
        let mut ledger = Ledger::new(session_id.clone(), 0);
        for line in &lines {
            ledger.push_activity(line.clone());
        }
        let rendered = markdown::render(&ledger);
        let parsed = markdown::parse(&rendered).unwrap();
        prop_assert_eq!(parsed.meta.session_id, session_id);
        prop_assert_eq!(Vec::from(parsed.activity), Vec::from(ledger.activity));
    }
}
