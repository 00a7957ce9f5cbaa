//! The four internal event kinds of spec §4.1, carried on an instance's own
//! queue.

use serde_json::Value;

#[derive(Debug)]
pub enum InternalEvent {
    /// A token has just been placed on `name`; its arrival handler should run.
    TokenArrived { name: String, data: Value },
    /// An external `taskDone` (or an activity-end handler result) for `name`.
    ActivityEnd { name: String, data: Value },
    /// An external `triggerEvent` matched an intermediate-catch flow object.
    IntermediateCatch { name: String, data: Value },
    /// An external trigger matched a boundary event.
    BoundaryCatch { name: String, data: Value },
}
