//! The event queue's payload types.
//!
//! The main loop's single multi-producer, single-consumer channel
//! carries two kinds of message: a typed state transition reported by
//! a dispatched task, or an opaque instruction string from the
//! control channel.

use crate::task::TaskState;
use cadence_core::Moment;

/// A state transition reported by a running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMessage {
    /// The routine this task is an occurrence of.
    pub routine_name: String,
    /// The task's occurrence time.
    pub time: Moment,
    /// The task's qualified name (`"{routine_name}.{time}"`).
    pub qualified_name: String,
    /// The new state.
    pub state: TaskState,
    /// Wall-clock moment the transition was observed.
    pub stamp: Moment,
}

/// One item drained from the event queue by the main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A task reported a state transition.
    State(StateMessage),
    /// An instruction arrived over the control channel.
    Control(String),
}
