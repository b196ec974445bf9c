//! Cross-module scheduling scenarios spanning more than one module,
//! placed under `tests/` the way `trailbaseio-trailbase` does for its
//! own end-to-end coverage.

use cadence_core::Moment;
use cadence_registry::RoutineDefinition;
use cadence_scheduler::config::SchedulerConfig;
use cadence_scheduler::event::Event;
use cadence_scheduler::ledger::StateLedger;
use cadence_scheduler::manager::TaskManager;
use cadence_scheduler::routine::Registry;
use cadence_scheduler::task::TaskState;

fn def(name: &str, schedule: Option<&str>, deps: &[&str]) -> RoutineDefinition {
    RoutineDefinition {
        name: name.to_string(),
        script: None,
        schedule: schedule.map(str::to_string),
        dependencies: deps.iter().map(|s| s.to_string()).collect(),
    }
}

fn moment(s: &str) -> Moment {
    s.parse().unwrap()
}

fn bare_config(dir: &std::path::Path) -> SchedulerConfig {
    let path = dir.join("cadence.toml");
    std::fs::write(
        &path,
        r#"
        registry = "registry.xml"
        database = "state.db"
        log_directory = "logs"
        "#,
    )
    .unwrap();
    SchedulerConfig::load(&path).unwrap()
}

/// Resuming with an open ledger occurrence re-materialises the exact
/// same qualified name, not a later one.
#[tokio::test]
async fn resume_rematerializes_the_open_occurrence() {
    let registry = Registry::from_definitions(vec![def("R", Some("0 8 * * *"), &[])]).unwrap();
    let ledger = StateLedger::open_in_memory().await.unwrap();

    let open_instance = moment("2021-09-22T08:00:00");
    ledger.record("R", open_instance, TaskState::Waiting, moment("2021-09-22T08:00:00")).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let manager = TaskManager::launch(
        registry,
        ledger,
        dir.path().to_path_buf(),
        true,
        Some(moment("2021-09-22T09:00:00")),
    )
    .await
    .unwrap();

    assert_eq!(manager.pending_count(), 1);
    assert!(manager.is_pending("R.2021-09-22T08:00:00"));
}

/// Force-running a task that already reached a terminal state
/// dispatches a fresh occurrence under the same qualified name, and
/// the transition lands in the ledger.
#[tokio::test]
async fn force_run_resets_and_redispatches_a_terminal_task() {
    let registry = Registry::from_definitions(vec![def("R", None, &[])]).unwrap();
    let ledger = StateLedger::open_in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut config = bare_config(dir.path());

    let mut manager =
        TaskManager::launch(registry, ledger, dir.path().to_path_buf(), false, None).await.unwrap();

    let events = manager.events_sender();
    events.send(Event::Control("R.2021-09-22T08:00:00".to_string())).unwrap();
    events.send(Event::Control("stop".to_string())).unwrap();

    // `run` drains the force-run dispatch (whose no-script task
    // reports Success almost immediately) and the `stop` instruction,
    // then returns once no task is left running.
    manager.run(&mut config).await.unwrap();
}
