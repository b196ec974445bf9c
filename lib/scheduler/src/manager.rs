//! The Task Manager: the daemon's single-threaded main loop.
//!
//! Owns every mutable piece of scheduling state — the pending task
//! map and time-ordered list, the running-task name set, and the
//! dependants index — and is the only place any of it is mutated.
//! Everything else (the control channel, dispatched task scripts)
//! only ever *sends* onto the shared event queue.

use crate::config::SchedulerConfig;
use crate::event::Event;
use crate::ledger::{LedgerError, StateLedger};
use crate::routine::Registry;
use crate::task::{DependencyState, Task, TaskState};
use cadence_core::Moment;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// The maximum idle-phase sleep: bounds control-channel
/// latency even when nothing is due for a long time.
const IDLE_SLEEP_CAP: Duration = Duration::from_secs(5);

/// Owns and drives all scheduling state for one running daemon.
pub struct TaskManager {
    registry: Registry,
    ledger: StateLedger,
    log_root: std::path::PathBuf,
    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,

    pending_map: HashMap<String, Task>,
    pending_list: Vec<String>,
    running_names: HashSet<String>,
    dependants_of: HashMap<String, Vec<String>>,
    keep_running: bool,
}

impl TaskManager {
    /// Builds the manager, schedules each routine's first occurrence,
    /// and returns it ready to run.
    ///
    /// `resume` and `last_shutdown` together decide the scheduling
    /// reference: `last_shutdown` if resuming, else `Moment::now()`.
    /// When resuming, a routine with an open ledger occurrence is
    /// rescheduled from that occurrence's own instant so the exact
    /// same `(routine, time)` re-materialises.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the resume snapshot cannot be read.
    pub async fn launch(
        registry: Registry,
        ledger: StateLedger,
        log_root: std::path::PathBuf,
        resume: bool,
        last_shutdown: Option<Moment>,
    ) -> Result<Self, LedgerError> {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let reference = if resume { last_shutdown.unwrap_or_else(Moment::now) } else { Moment::now() };

        let mut last_instance: HashMap<String, Moment> = HashMap::new();
        if resume {
            for row in ledger.current_status(None).await? {
                last_instance
                    .entry(row.routine)
                    .and_modify(|existing| *existing = (*existing).min(row.instance))
                    .or_insert(row.instance);
            }
        }

        let mut manager = Self {
            registry,
            ledger,
            log_root,
            events_tx,
            events_rx,
            pending_map: HashMap::new(),
            pending_list: Vec::new(),
            running_names: HashSet::new(),
            dependants_of: HashMap::new(),
            keep_running: true,
        };

        let names: Vec<String> = manager.registry.names().map(str::to_string).collect();
        for name in names {
            let routine_reference = last_instance.get(&name).copied().unwrap_or(reference);
            let inclusive = last_instance.contains_key(&name);
            manager.schedule_next_task(&name, routine_reference, inclusive).await?;
        }

        Ok(manager)
    }

    /// Runs the main loop until a `stop` instruction sets
    /// `keep_running` false and every running task has reported
    /// terminal.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if a ledger write fails.
    pub async fn run(&mut self, config: &mut SchedulerConfig) -> Result<(), LedgerError> {
        let mut overdue = true;

        while self.keep_running {
            let now = Moment::now();
            if overdue {
                self.run_pending_jobs(now).await?;
                self.wait_for_updates(config).await?;
                let now = Moment::now();
                if self.earliest_due_time() > Some(now) || self.earliest_due_time().is_none() {
                    overdue = false;
                }
            } else {
                let sleep_for = self
                    .earliest_due_time()
                    .map(|t| {
                        let millis = (t.naive() - Moment::now().naive()).num_milliseconds().max(0) as u64;
                        Duration::from_millis(millis).min(IDLE_SLEEP_CAP)
                    })
                    .unwrap_or(IDLE_SLEEP_CAP);
                tokio::time::sleep(sleep_for).await;
                self.wait_for_updates(config).await?;
                let now = Moment::now();
                if self.earliest_due_time().is_some_and(|t| t <= now) {
                    overdue = true;
                }
            }
        }

        self.drain_until_quiescent(config).await?;
        Ok(())
    }

    /// Inserts a routine's next occurrence into `pending_map`,
    /// registers its dependencies against already-pending and
    /// already-archived occurrences, and records its initial state.
    async fn schedule_next_task(
        &mut self,
        routine_name: &str,
        reference: Moment,
        inclusive: bool,
    ) -> Result<(), LedgerError> {
        let mut task = self.registry.next_task(routine_name, reference, inclusive);
        let qualified_name = task.qualified_name();

        if self.pending_map.contains_key(&qualified_name) {
            return Ok(());
        }

        task.assign_log_root(&self.log_root);
        self.ledger.record(&task.routine_name, task.time, task.state, Moment::now()).await?;

        let dependency_names: Vec<String> = task.dependencies.keys().cloned().collect();
        for dep_qualified_name in dependency_names {
            if let Some(pending_dep) = self.pending_map.get(&dep_qualified_name) {
                let dep_state = pending_dep.state;
                self.dependants_of
                    .entry(dep_qualified_name.clone())
                    .or_default()
                    .push(qualified_name.clone());
                task.update_dependency_state(&dep_qualified_name, dep_state);
                continue;
            }

            let (dep_routine, dep_time) = split_qualified_name(&dep_qualified_name);
            let dep_time: Moment = dep_time.parse().expect("qualified name carries a canonical moment");

            let history = self.ledger.task_result(dep_routine, dep_time).await?;
            if let Some((latest_state, _)) = history.first() {
                task.update_dependency_state(&dep_qualified_name, *latest_state);
                continue;
            }

            if dep_time > reference {
                self.dependants_of.entry(dep_qualified_name).or_default().push(qualified_name.clone());
                continue;
            }

            task.update_state(TaskState::Cancelled, Some(&self.events_tx));
            break;
        }

        self.insert_pending(task);
        Ok(())
    }

    /// Iterative restart-the-walk: re-scans `pending_list` from the
    /// front after each dispatch instead of recursing, since a
    /// dispatch can insert new pending entries ahead of the current
    /// position.
    async fn run_pending_jobs(&mut self, now: Moment) -> Result<(), LedgerError> {
        'walk: loop {
            for qualified_name in &self.pending_list {
                let task = &self.pending_map[qualified_name];
                if task.time > now {
                    break;
                }
                if task.state == TaskState::Ready {
                    let qualified_name = qualified_name.clone();
                    self.run_task(&qualified_name).await?;
                    continue 'walk;
                }
            }
            return Ok(());
        }
    }

    /// Transitions a pending task to `Running`, spawns it, and
    /// schedules its routine's next occurrence.
    async fn run_task(&mut self, qualified_name: &str) -> Result<(), LedgerError> {
        let task = self.pending_map.get_mut(qualified_name).expect("dispatched task is pending");
        task.update_state(TaskState::Running, Some(&self.events_tx));
        self.ledger.record(&task.routine_name, task.time, task.state, Moment::now()).await?;
        self.running_names.insert(qualified_name.to_string());
        tracing::info!(task = qualified_name, "dispatching task");

        let task_clone = task.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move { task_clone.run(events_tx).await });

        let routine_name = task_clone.routine_name.clone();
        let task_time = task_clone.time;
        self.schedule_next_task(&routine_name, task_time, false).await?;
        Ok(())
    }

    /// Drains the event queue non-blockingly and applies every item.
    async fn wait_for_updates(&mut self, config: &mut SchedulerConfig) -> Result<(), LedgerError> {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                Event::State(message) => {
                    tracing::debug!(task = %message.qualified_name, state = ?message.state, "task state transition");
                    self.ledger.record(&message.routine_name, message.time, message.state, message.stamp).await?;

                    if let Some(dependants) = self.dependants_of.get(&message.qualified_name).cloned() {
                        for dependant in dependants {
                            if let Some(dependant_task) = self.pending_map.get_mut(&dependant) {
                                dependant_task.update_dependency_state(&message.qualified_name, message.state);
                            }
                        }
                    }

                    if matches!(message.state, TaskState::Success | TaskState::Failure) {
                        self.running_names.remove(&message.qualified_name);
                    }

                    if message.state == TaskState::Cancelled {
                        self.schedule_next_task(&message.routine_name, message.time, false).await?;
                    }
                    if matches!(message.state, TaskState::Success | TaskState::Cancelled) {
                        self.remove_task(&message.qualified_name).await?;
                    }
                }
                Event::Control(instruction) => {
                    tracing::info!(instruction = %instruction, "control channel instruction");
                    self.handle_control(&instruction, config).await?;
                }
            }
        }
        Ok(())
    }

    /// Control-channel string handling.
    ///
    /// A task already pending and not `Ready`/`Waiting` is reset in
    /// place first. Either way — reset or already runnable — it is
    /// then dispatched unconditionally, since force-run exists
    /// precisely to bypass a `Waiting` task's unmet dependencies. A
    /// task not currently pending at all — most often one already
    /// archived as `Success` — is reconstructed from its qualified
    /// name and the registry so it can be dispatched the same way.
    async fn handle_control(&mut self, instruction: &str, config: &mut SchedulerConfig) -> Result<(), LedgerError> {
        if instruction == "stop" {
            self.begin_shutdown(config).await?;
            return Ok(());
        }

        if let Some(task) = self.pending_map.get(instruction) {
            if !matches!(task.state, TaskState::Ready | TaskState::Waiting) {
                let routine =
                    self.registry.get(&task.routine_name).expect("routine exists for pending task").clone();
                let time = task.time;
                let dependencies = task.dependencies.clone();
                let mut fresh = Task::new(routine, time, dependencies);
                fresh.assign_log_root(&self.log_root);
                fresh.update_state(TaskState::Ready, None);
                self.pending_map.insert(instruction.to_string(), fresh);
            }

            self.run_task(instruction).await?;
            return Ok(());
        }

        let (routine_name, time) = split_qualified_name(instruction);
        let Some(routine) = self.registry.get(routine_name) else {
            tracing::info!(task = instruction, "control channel named an unknown task, ignoring");
            return Ok(());
        };
        let Ok(time) = time.parse() else {
            tracing::info!(task = instruction, "control channel named a task with an unparseable time, ignoring");
            return Ok(());
        };

        let mut fresh = Task::new(routine.clone(), time, std::collections::BTreeMap::new());
        fresh.assign_log_root(&self.log_root);
        fresh.update_state(TaskState::Ready, None);
        self.insert_pending(fresh);
        self.run_task(instruction).await?;
        Ok(())
    }

    /// Archives a task to the ledger and removes it from all
    /// in-memory indices.
    async fn remove_task(&mut self, qualified_name: &str) -> Result<(), LedgerError> {
        if let Some(task) = self.pending_map.get(qualified_name) {
            self.ledger.record(&task.routine_name, task.time, TaskState::Archived, Moment::now()).await?;
        }

        self.dependants_of.remove(qualified_name);
        for dependants in self.dependants_of.values_mut() {
            dependants.retain(|d| d != qualified_name);
        }

        self.pending_map.remove(qualified_name);
        self.pending_list.retain(|q| q != qualified_name);
        Ok(())
    }

    /// Begins shutdown: persists `last_shutdown`, then
    /// drains until no task is running, then flips `keep_running`.
    async fn begin_shutdown(&mut self, config: &mut SchedulerConfig) -> Result<(), LedgerError> {
        tracing::info!(running = self.running_names.len(), "shutdown requested, draining running tasks");
        config.last_shutdown = Some(Moment::now());
        if let Err(error) = config.save() {
            tracing::warn!(%error, "failed to persist last_shutdown on shutdown");
        }
        self.drain_until_quiescent(config).await?;
        self.keep_running = false;
        Ok(())
    }

    async fn drain_until_quiescent(&mut self, config: &mut SchedulerConfig) -> Result<(), LedgerError> {
        while !self.running_names.is_empty() {
            if let Some(event) = self.events_rx.recv().await {
                self.apply_single_event(event, config).await?;
            }
        }
        Ok(())
    }

    async fn apply_single_event(&mut self, event: Event, config: &mut SchedulerConfig) -> Result<(), LedgerError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let _ = tx.send(event);
        let previous_rx = std::mem::replace(&mut self.events_rx, rx);
        self.wait_for_updates(config).await?;
        self.events_rx = previous_rx;
        Ok(())
    }

    fn insert_pending(&mut self, task: Task) {
        let qualified_name = task.qualified_name();
        let insertion_point = self
            .pending_list
            .binary_search_by(|existing| {
                self.pending_map[existing].time.cmp(&task.time)
            })
            .unwrap_or_else(|idx| idx);
        self.pending_list.insert(insertion_point, qualified_name.clone());
        self.pending_map.insert(qualified_name, task);
    }

    /// The earliest time among pending tasks still awaiting dispatch
    /// (`Ready` or `Waiting`). `Running` tasks stay in `pending_list`
    /// until their terminal event arrives and `Failure` tasks stay
    /// forever, so both must be skipped or they'd pin this to a past
    /// instant and keep `run` from ever idling.
    fn earliest_due_time(&self) -> Option<Moment> {
        self.pending_list
            .iter()
            .map(|q| &self.pending_map[q])
            .find(|task| matches!(task.state, TaskState::Ready | TaskState::Waiting))
            .map(|task| task.time)
    }

    /// A clone of this manager's event queue sender, so the control
    /// channel (and, in tests, hand-crafted events) can feed the same
    /// queue the main loop drains.
    #[must_use]
    pub fn events_sender(&self) -> UnboundedSender<Event> {
        self.events_tx.clone()
    }

    /// Number of tasks currently pending, for tests and diagnostics.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending_map.len()
    }

    /// Whether a qualified name is currently pending, for tests.
    #[must_use]
    pub fn is_pending(&self, qualified_name: &str) -> bool {
        self.pending_map.contains_key(qualified_name)
    }
}

fn split_qualified_name(qualified_name: &str) -> (&str, &str) {
    qualified_name.split_once('.').expect("qualified name carries a '.' separator")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_registry::RoutineDefinition;

    fn def(name: &str, schedule: Option<&str>, deps: &[&str]) -> RoutineDefinition {
        RoutineDefinition {
            name: name.to_string(),
            script: None,
            schedule: schedule.map(str::to_string),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn launch_schedules_one_pending_task_per_routine() {
        let registry = Registry::from_definitions(vec![def("a", Some("* * * * *"), &[])]).unwrap();
        let ledger = StateLedger::open_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let manager = TaskManager::launch(registry, ledger, dir.path().to_path_buf(), false, None).await.unwrap();
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn scheduling_twice_for_the_same_occurrence_is_a_no_op() {
        let registry = Registry::from_definitions(vec![def("a", Some("* * * * *"), &[])]).unwrap();
        let ledger = StateLedger::open_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let mut manager =
            TaskManager::launch(registry, ledger, dir.path().to_path_buf(), false, None).await.unwrap();
        let before = manager.pending_count();
        let reference = Moment::now();
        manager.schedule_next_task("a", reference, true).await.unwrap();
        assert_eq!(manager.pending_count(), before);
    }
}
