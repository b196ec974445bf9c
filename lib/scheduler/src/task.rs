//! A single occurrence of a routine at a specific moment.

use crate::event::{Event, StateMessage};
use crate::routine::Routine;
use cadence_core::Moment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::sync::mpsc::UnboundedSender;

/// A task's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Waiting,
    Ready,
    Running,
    Success,
    Failure,
    Cancelled,
    Archived,
}

impl TaskState {
    /// Open states surfaced by the ledger's current-status query.
    pub const OPEN: [Self; 5] =
        [Self::Waiting, Self::Ready, Self::Running, Self::Failure, Self::Cancelled];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Cancelled => "Cancelled",
            Self::Archived => "Archived",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`TaskState`] back out of its ledger string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTaskStateError(String);

impl fmt::Display for ParseTaskStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized task state: {}", self.0)
    }
}

impl std::error::Error for ParseTaskStateError {}

impl std::str::FromStr for TaskState {
    type Err = ParseTaskStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waiting" => Ok(Self::Waiting),
            "Ready" => Ok(Self::Ready),
            "Running" => Ok(Self::Running),
            "Success" => Ok(Self::Success),
            "Failure" => Ok(Self::Failure),
            "Cancelled" => Ok(Self::Cancelled),
            "Archived" => Ok(Self::Archived),
            other => Err(ParseTaskStateError(other.to_string())),
        }
    }
}

/// The last-known state of an upstream dependency, or `Unknown` if no
/// state has propagated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyState {
    Unknown,
    Known(TaskState),
}

/// Errors running a task's script as a subordinate process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The log file or script could not be spawned.
    SpawnFailed { reason: String },
    /// The script exited with a non-zero status.
    ScriptFailed { exit_code: Option<i32> },
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed { reason } => write!(f, "failed to spawn script: {reason}"),
            Self::ScriptFailed { exit_code } => match exit_code {
                Some(code) => write!(f, "script exited with status {code}"),
                None => write!(f, "script terminated by signal"),
            },
        }
    }
}

impl std::error::Error for TaskError {}

/// A routine occurrence.
#[derive(Debug, Clone)]
pub struct Task {
    /// The routine this is an occurrence of.
    pub routine_name: String,
    /// Path to the script to run, if any.
    pub script: Option<PathBuf>,
    /// The occurrence's moment.
    pub time: Moment,
    /// Mapping from upstream qualified name to its last-known state.
    pub dependencies: BTreeMap<String, DependencyState>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Where this task's script output is logged, once a log root has
    /// been assigned.
    pub log_path: Option<PathBuf>,
}

impl Task {
    /// Creates a new task for `routine`'s occurrence at `time`.
    ///
    /// Initial state is `Ready` if there are no dependencies, else
    /// `Waiting`.
    #[must_use]
    pub fn new(routine: Routine, time: Moment, dependencies: BTreeMap<String, DependencyState>) -> Self {
        let state = if dependencies.is_empty() { TaskState::Ready } else { TaskState::Waiting };
        Self {
            routine_name: routine.name,
            script: routine.script,
            time,
            dependencies,
            state,
            log_path: None,
        }
    }

    /// The canonical identifier used throughout the ledger, control
    /// channel, and in-memory maps.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.routine_name, self.time)
    }

    /// Computes and stores this task's log path under `log_root`, as
    /// `{log_root}/{routine_name}/{qualified_name with ':'->'-'}.log`.
    pub fn assign_log_root(&mut self, log_root: &Path) {
        self.log_path = Some(
            log_root
                .join(&self.routine_name)
                .join(format!("{}.log", self.qualified_name().replace(':', "-"))),
        );
    }

    /// Mutates local state and, if an event sender is attached, emits
    /// a state message.
    pub fn update_state(&mut self, new: TaskState, events: Option<&UnboundedSender<Event>>) {
        self.state = new;
        if let Some(events) = events {
            let _ = events.send(Event::State(StateMessage {
                routine_name: self.routine_name.clone(),
                time: self.time,
                qualified_name: self.qualified_name(),
                state: new,
                stamp: Moment::now(),
            }));
        }
    }

    /// Overwrites a dependency's last-known state and propagates the
    /// effect onto this task's own state.
    pub fn update_dependency_state(&mut self, qualified_name: &str, new: TaskState) {
        if let Some(entry) = self.dependencies.get_mut(qualified_name) {
            *entry = DependencyState::Known(new);
        } else {
            self.dependencies.insert(qualified_name.to_string(), DependencyState::Known(new));
        }

        if new == TaskState::Cancelled {
            self.state = TaskState::Cancelled;
        } else if self
            .dependencies
            .values()
            .all(|s| matches!(s, DependencyState::Known(TaskState::Success)))
        {
            self.state = TaskState::Ready;
        }
    }

    /// Spawns the configured script as a subordinate process and
    /// reports the result on `events` as a `Success` or `Failure`
    /// state message. A routine with no script succeeds trivially.
    pub async fn run(&self, events: UnboundedSender<Event>) {
        let outcome = self.execute_script().await;
        let state = match outcome {
            Ok(()) => {
                tracing::debug!(task = %self.qualified_name(), "task script succeeded");
                TaskState::Success
            }
            Err(reason) => {
                tracing::warn!(task = %self.qualified_name(), error = %reason, "task script failed");
                TaskState::Failure
            }
        };

        let _ = events.send(Event::State(StateMessage {
            routine_name: self.routine_name.clone(),
            time: self.time,
            qualified_name: self.qualified_name(),
            state,
            stamp: Moment::now(),
        }));
    }

    async fn execute_script(&self) -> Result<(), TaskError> {
        let Some(script) = &self.script else {
            return Ok(());
        };

        let log_path = self.log_path.clone().unwrap_or_else(|| PathBuf::from(format!(
            "{}.log",
            self.qualified_name().replace(':', "-")
        )));
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TaskError::SpawnFailed { reason: e.to_string() })?;
        }
        let stdout_file = std::fs::File::create(&log_path)
            .map_err(|e| TaskError::SpawnFailed { reason: e.to_string() })?;
        let stderr_file = stdout_file
            .try_clone()
            .map_err(|e| TaskError::SpawnFailed { reason: e.to_string() })?;

        let status = tokio::process::Command::new(script)
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .status()
            .await
            .map_err(|e| TaskError::SpawnFailed { reason: e.to_string() })?;

        if status.success() {
            Ok(())
        } else {
            Err(TaskError::ScriptFailed { exit_code: status.code() })
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.qualified_name() == other.qualified_name()
    }
}

impl Eq for Task {}

/// Tasks are ordered by occurrence time only, so a time-ordered
/// pending list can use binary-search insertion.
impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time.cmp(&other.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routine(name: &str, deps: &[&str]) -> Routine {
        Routine {
            name: name.to_string(),
            script: None,
            schedule: None,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            dependants: Vec::new(),
        }
    }

    fn moment(s: &str) -> Moment {
        s.parse().unwrap()
    }

    #[test]
    fn no_dependencies_starts_ready() {
        let task = Task::new(routine("a", &[]), moment("2021-09-21T10:00:00"), BTreeMap::new());
        assert_eq!(task.state, TaskState::Ready);
    }

    #[test]
    fn with_dependencies_starts_waiting() {
        let mut deps = BTreeMap::new();
        deps.insert("b.2021-09-21T09:00:00".to_string(), DependencyState::Unknown);
        let task = Task::new(routine("a", &["b"]), moment("2021-09-21T10:00:00"), deps);
        assert_eq!(task.state, TaskState::Waiting);
    }

    #[test]
    fn all_dependencies_success_transitions_to_ready() {
        let mut deps = BTreeMap::new();
        deps.insert("b.t".to_string(), DependencyState::Unknown);
        deps.insert("c.t".to_string(), DependencyState::Unknown);
        let mut task = Task::new(routine("a", &["b", "c"]), moment("2021-09-21T10:00:00"), deps);

        task.update_dependency_state("b.t", TaskState::Success);
        assert_eq!(task.state, TaskState::Waiting);
        task.update_dependency_state("c.t", TaskState::Success);
        assert_eq!(task.state, TaskState::Ready);
    }

    #[test]
    fn cancelled_dependency_cancels_self() {
        let mut deps = BTreeMap::new();
        deps.insert("b.t".to_string(), DependencyState::Unknown);
        let mut task = Task::new(routine("a", &["b"]), moment("2021-09-21T10:00:00"), deps);
        task.update_dependency_state("b.t", TaskState::Cancelled);
        assert_eq!(task.state, TaskState::Cancelled);
    }

    #[test]
    fn qualified_name_matches_canonical_format() {
        let task = Task::new(routine("a", &[]), moment("2021-09-21T10:00:00"), BTreeMap::new());
        assert_eq!(task.qualified_name(), "a.2021-09-21T10:00:00");
    }

    #[test]
    fn log_path_uses_filesystem_safe_qualified_name() {
        let mut task = Task::new(routine("a", &[]), moment("2021-09-21T10:00:00"), BTreeMap::new());
        task.assign_log_root(Path::new("/var/log/cadence"));
        assert_eq!(
            task.log_path.unwrap(),
            PathBuf::from("/var/log/cadence/a/a.2021-09-21T10-00-00.log")
        );
    }

    #[test]
    fn ordering_is_by_time() {
        let early = Task::new(routine("a", &[]), moment("2021-09-21T10:00:00"), BTreeMap::new());
        let late = Task::new(routine("a", &[]), moment("2021-09-21T11:00:00"), BTreeMap::new());
        assert!(early < late);
    }

    #[tokio::test]
    async fn running_task_with_no_script_reports_success() {
        let task = Task::new(routine("a", &[]), moment("2021-09-21T10:00:00"), BTreeMap::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        task.run(tx).await;
        match rx.recv().await.unwrap() {
            Event::State(msg) => assert_eq!(msg.state, TaskState::Success),
            Event::Control(_) => panic!("expected state message"),
        }
    }
}
