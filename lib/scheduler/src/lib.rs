//! The cadence scheduling engine.
//!
//! This crate implements every stateful piece of the scheduler
//! described in the daemon's design: five-field cron evaluation
//! ([`schedule`]), the routine dependency graph ([`routine`]), task
//! lifecycle ([`task`]), the durable state ledger ([`ledger`]), the
//! loopback control channel ([`control`]), the main-loop task manager
//! ([`manager`]), on-disk configuration ([`config`]), and the
//! single-instance-per-name registration ([`instance`]).

pub mod config;
pub mod control;
pub mod event;
pub mod instance;
pub mod ledger;
pub mod manager;
pub mod routine;
pub mod schedule;
pub mod task;

pub use config::SchedulerConfig;
pub use control::ControlChannel;
pub use event::{Event, StateMessage};
pub use instance::InstanceGuard;
pub use ledger::StateLedger;
pub use manager::TaskManager;
pub use routine::{Registry, Routine};
pub use schedule::Schedule;
pub use task::{DependencyState, Task, TaskState};
