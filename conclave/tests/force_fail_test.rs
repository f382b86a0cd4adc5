//! Force-fail tears down a running task: terminal `failed_system`, exactly
//! one `force_failed` event, and the in-flight adapter call unblocked.

mod support;

use std::time::Duration;

use conclave::gateway::Phase;
use conclave::{EventKind, GateReason, TaskStatus};
use support::*;

#[tokio::test]
async fn force_fail_mid_run_terminates_and_cancels_adapter() {
    let rig = rig();

    let mut spec = base_spec(&rig);
    spec.options.self_loop_mode = true;

    // The author's discussion call never returns on its own.
    rig.gateway.hang("claude#a", Phase::Discussion);

    let task = rig.orchestrator.create_task(spec).unwrap();
    rig.orchestrator.start_task(&task.id, true).await.unwrap();

    // Let the run reach the hanging adapter call.
    for _ in 0..100 {
        let current = rig.orchestrator.get_task(&task.id).unwrap();
        if current.status == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let failed = rig.orchestrator.force_fail(&task.id, "operator stop").unwrap();
    assert_eq!(failed.status, TaskStatus::FailedSystem);
    assert_eq!(failed.last_gate_reason, Some(GateReason::ForceFailed));

    // Idempotent on the now-terminal task.
    let again = rig.orchestrator.force_fail(&task.id, "again").unwrap();
    assert_eq!(again.status, TaskStatus::FailedSystem);

    // Give the background coordinator a moment to observe the cancel and
    // stand down, then check the event log.
    let status = wait_for_rest(&rig, &task.id).await;
    assert_eq!(status, TaskStatus::FailedSystem);

    let events = rig.orchestrator.get_events(&task.id).unwrap();
    let force_events = events
        .iter()
        .filter(|e| e.kind == EventKind::ForceFailed)
        .count();
    assert_eq!(force_events, 1);

    // Operator-driven terminations produce the same terminal reports as
    // coordinator-driven ones.
    assert!(rig.artifacts.artifact_exists(&task.id, "summary.md"));
    assert!(rig.artifacts.artifact_exists(&task.id, "final_report.md"));

    // Seq numbers stay strictly monotonic and contiguous under the race.
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected);
}
