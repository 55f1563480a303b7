//! Structured trace events emitted during a search, independent of any
//! particular rendering. Callers install a [`TraceSink`]; the planner also
//! logs each event through `tracing` regardless of whether a sink is
//! installed.

use serde_json::Value;

use crate::diff::Op;

/// One step of the planner's search, suitable for diagnostics or rendering
/// into an external format (e.g. a sequence diagram). Rendering is an
/// adapter's concern, not this crate's.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    Start,
    FindNext {
        depth: usize,
        state: Value,
        operations: Vec<Op>,
    },
    TryInstruction {
        instruction_id: String,
        description: String,
        operation: Op,
    },
    BacktrackMethod {
        task_id: String,
    },
    Found,
    Success {
        iterations: usize,
    },
    Failed {
        reason: String,
    },
    Error {
        cause: String,
    },
}

/// A sink for [`TraceEvent`]s, installed by the caller.
pub type TraceSink = Box<dyn Fn(&TraceEvent) + Send + Sync>;

pub(crate) fn log_event(event: &TraceEvent) {
    match event {
        TraceEvent::Start => tracing::debug!("planner: search started"),
        TraceEvent::FindNext { depth, operations, .. } => {
            tracing::debug!(depth, pending = operations.len(), "planner: find-next");
        }
        TraceEvent::TryInstruction {
            instruction_id,
            description,
            ..
        } => {
            tracing::debug!(instruction_id, description, "planner: try-instruction");
        }
        TraceEvent::BacktrackMethod { task_id } => {
            tracing::debug!(task_id, "planner: backtrack-method, falling back to sequential");
        }
        TraceEvent::Found => tracing::debug!("planner: found candidate extension"),
        TraceEvent::Success { iterations } => {
            tracing::info!(iterations, "planner: search succeeded");
        }
        TraceEvent::Failed { reason } => tracing::info!(reason, "planner: search failed"),
        TraceEvent::Error { cause } => tracing::error!(cause, "planner: search error"),
    }
}
