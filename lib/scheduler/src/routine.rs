//! Routines and the dependency registry.
//!
//! A [`Routine`] is a named, reusable job definition with an optional
//! firing schedule and an optional set of upstream routines it waits
//! on. The full set of routines forms a DAG of dependencies (and the
//! inverse, dependants). Routines are stored in a `petgraph` arena;
//! each holds its own and its neighbours' stable `RoutineId`s rather
//! than a name-keyed back-reference, so the arena is the single owner
//! of routine storage and the relations are plain node-index sets.

use crate::schedule::Schedule;
use crate::task::{DependencyState, Task};
use cadence_core::Moment;
use cadence_registry::RoutineDefinition;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;

/// Stable identifier for a routine: its index in the registry arena.
pub type RoutineId = NodeIndex;

/// A named, reusable job definition.
///
/// Immutable after the registry is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Routine {
    /// Unique name within the registry.
    pub name: String,
    /// Path to the script this routine runs, if any.
    pub script: Option<PathBuf>,
    /// Firing schedule, if any.
    pub schedule: Option<Schedule>,
    /// Upstream routines this routine waits on.
    pub dependencies: BTreeSet<RoutineId>,
    /// Routines that wait on this one.
    pub dependants: BTreeSet<RoutineId>,
}

/// Errors building a [`Registry`] from parsed definitions.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// Two routines share a name.
    DuplicateRoutine { name: String },
    /// A routine's schedule string did not parse.
    BadSchedule { name: String, reason: String },
    /// A `<dependency>` named a routine absent from the registry.
    UnknownDependency { routine: String, dependency: String },
    /// The dependency graph contains a cycle.
    ///
    /// Defensive check since a cycle would otherwise loop
    /// `next_trigger`'s recursion forever.
    CycleDetected,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateRoutine { name } => write!(f, "duplicate routine: {name}"),
            Self::BadSchedule { name, reason } => {
                write!(f, "routine '{name}' has an invalid schedule: {reason}")
            }
            Self::UnknownDependency { routine, dependency } => {
                write!(f, "routine '{routine}' depends on unknown routine '{dependency}'")
            }
            Self::CycleDetected => write!(f, "routine dependency graph contains a cycle"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// The routine arena, built once from the registry definition file.
///
/// Routines live in a `petgraph::DiGraph` keyed by [`RoutineId`]; the
/// `by_name` map is purely a lookup side index onto the same storage.
#[derive(Debug, Clone)]
pub struct Registry {
    graph: DiGraph<Routine, ()>,
    by_name: HashMap<String, RoutineId>,
}

impl Registry {
    /// Builds a registry from parsed routine definitions, validating
    /// dependency names and acyclicity.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if a name is duplicated, a schedule
    /// fails to parse, a dependency name is unresolvable, or the
    /// dependency graph contains a cycle.
    pub fn from_definitions(defs: Vec<RoutineDefinition>) -> Result<Self, RegistryError> {
        let mut graph: DiGraph<Routine, ()> = DiGraph::new();
        let mut by_name: HashMap<String, RoutineId> = HashMap::new();

        for def in &defs {
            if by_name.contains_key(&def.name) {
                return Err(RegistryError::DuplicateRoutine { name: def.name.clone() });
            }
            let schedule = def
                .schedule
                .as_deref()
                .map(Schedule::parse)
                .transpose()
                .map_err(|e| RegistryError::BadSchedule {
                    name: def.name.clone(),
                    reason: e.to_string(),
                })?;

            let id = graph.add_node(Routine {
                name: def.name.clone(),
                script: def.script.as_deref().map(PathBuf::from),
                schedule,
                dependencies: BTreeSet::new(),
                dependants: BTreeSet::new(),
            });
            by_name.insert(def.name.clone(), id);
        }

        for def in &defs {
            let routine_id = by_name[&def.name];
            for dep in &def.dependencies {
                let Some(&dep_id) = by_name.get(dep) else {
                    return Err(RegistryError::UnknownDependency {
                        routine: def.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                graph.add_edge(dep_id, routine_id, ());
                graph[routine_id].dependencies.insert(dep_id);
                graph[dep_id].dependants.insert(routine_id);
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(RegistryError::CycleDetected);
        }

        Ok(Self { graph, by_name })
    }

    /// Looks up a routine's stable id by name.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<RoutineId> {
        self.by_name.get(name).copied()
    }

    /// Looks up a routine by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Routine> {
        self.id_of(name).map(|id| &self.graph[id])
    }

    /// Looks up a routine by its stable id.
    #[must_use]
    pub fn get_by_id(&self, id: RoutineId) -> &Routine {
        &self.graph[id]
    }

    /// Iterates over all routine names in the registry.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    /// Number of routines in the registry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// A routine's next firing moment relative to `reference`:
    ///
    /// - has a schedule: delegate to [`Schedule::next`].
    /// - no schedule but has dependencies: the latest of its
    ///   dependencies' next firings.
    /// - otherwise: the far-future sentinel (manual-only).
    #[must_use]
    pub fn next_trigger(&self, name: &str, reference: Moment, inclusive: bool) -> Moment {
        let id = self.id_of(name).expect("routine must exist in registry");
        self.next_trigger_id(id, reference, inclusive)
    }

    fn next_trigger_id(&self, id: RoutineId, reference: Moment, inclusive: bool) -> Moment {
        let routine = &self.graph[id];
        if let Some(schedule) = &routine.schedule {
            schedule.next(reference, inclusive)
        } else if !routine.dependencies.is_empty() {
            routine
                .dependencies
                .iter()
                .map(|&dep_id| self.next_trigger_id(dep_id, reference, inclusive))
                .max()
                .expect("non-empty dependencies")
        } else {
            Moment::far_future()
        }
    }

    /// Symmetric counterpart to [`Registry::next_trigger`], searching
    /// backwards from `reference` instead of forwards.
    #[must_use]
    pub fn previous_trigger(&self, name: &str, reference: Moment, inclusive: bool) -> Moment {
        let id = self.id_of(name).expect("routine must exist in registry");
        self.previous_trigger_id(id, reference, inclusive)
    }

    fn previous_trigger_id(&self, id: RoutineId, reference: Moment, inclusive: bool) -> Moment {
        let routine = &self.graph[id];
        if let Some(schedule) = &routine.schedule {
            schedule.previous(reference, inclusive)
        } else if !routine.dependencies.is_empty() {
            routine
                .dependencies
                .iter()
                .map(|&dep_id| self.previous_trigger_id(dep_id, reference, inclusive))
                .min()
                .expect("non-empty dependencies")
        } else {
            Moment::far_future()
        }
    }

    /// Materialises a [`Task`] for a routine's next occurrence after
    /// `reference`.
    ///
    /// The task's `dependencies` map has exactly one entry per
    /// upstream routine, keyed by that routine's qualified name at its
    /// own last occurrence at or before this task's time.
    #[must_use]
    pub fn next_task(&self, name: &str, reference: Moment, inclusive: bool) -> Task {
        let id = self.id_of(name).expect("routine must exist in registry");
        let routine = &self.graph[id];
        let time = self.next_trigger_id(id, reference, inclusive);

        let mut dependencies = BTreeMap::new();
        for &dep_id in &routine.dependencies {
            let dep_routine = &self.graph[dep_id];
            let dep_time = self.previous_trigger_id(dep_id, time, true);
            dependencies.insert(format!("{}.{}", dep_routine.name, dep_time), DependencyState::Unknown);
        }

        Task::new(routine.clone(), time, dependencies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn scheduled_routine_delegates_to_schedule() {
        let registry = Registry::from_definitions(vec![def("a", Some("30 * * * *"), &[])]).unwrap();
        let reference = moment("2021-09-21T10:15:00");
        assert_eq!(
            registry.next_trigger("a", reference, true),
            Schedule::parse("30 * * * *").unwrap().next(reference, true)
        );
    }

    #[test]
    fn dependency_only_routine_uses_max_of_deps() {
        let registry = Registry::from_definitions(vec![
            def("b", Some("10 * * * *"), &[]),
            def("a", None, &["b"]),
        ])
        .unwrap();
        let reference = moment("2021-09-21T10:15:00");
        assert_eq!(registry.next_trigger("a", reference, true), moment("2021-09-21T11:10:00"));
    }

    #[test]
    fn scheduled_routine_with_dependency_lists_dep_task() {
        let registry = Registry::from_definitions(vec![
            def("b", Some("10 * * * *"), &[]),
            def("a", Some("30 * * * *"), &["b"]),
        ])
        .unwrap();
        let reference = moment("2021-09-21T10:15:00");
        let task = registry.next_task("a", reference, true);
        assert_eq!(task.time, moment("2021-09-21T10:30:00"));
        assert_eq!(task.dependencies.len(), 1);
        assert!(task.dependencies.contains_key("b.2021-09-21T10:10:00"));
    }

    #[test]
    fn manual_only_routine_returns_sentinel() {
        let registry = Registry::from_definitions(vec![def("a", None, &[])]).unwrap();
        assert_eq!(
            registry.next_trigger("a", Moment::now(), true),
            Moment::far_future()
        );
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = Registry::from_definitions(vec![def("a", None, &["missing"])]).unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnknownDependency { routine: "a".into(), dependency: "missing".into() }
        );
    }

    #[test]
    fn duplicate_routine_is_rejected() {
        let err =
            Registry::from_definitions(vec![def("a", None, &[]), def("a", None, &[])]).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateRoutine { name: "a".into() });
    }

    #[test]
    fn cycle_is_rejected() {
        let err = Registry::from_definitions(vec![def("a", None, &["b"]), def("b", None, &["a"])])
            .unwrap_err();
        assert_eq!(err, RegistryError::CycleDetected);
    }

    #[test]
    fn bad_schedule_is_rejected() {
        let err = Registry::from_definitions(vec![def("a", Some("bad"), &[])]).unwrap_err();
        assert!(matches!(err, RegistryError::BadSchedule { .. }));
    }

    #[test]
    fn dependants_are_tracked_by_id() {
        let registry = Registry::from_definitions(vec![
            def("b", Some("10 * * * *"), &[]),
            def("a", None, &["b"]),
        ])
        .unwrap();
        let a_id = registry.id_of("a").unwrap();
        let b = registry.get("b").unwrap();
        assert!(b.dependants.contains(&a_id));
    }
}
