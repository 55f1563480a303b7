//! The recursive HTN search (§4.5): the load-bearing subsystem of this
//! crate. [`Planner::find_plan`] diffs the current state against a target,
//! selects applicable tasks per pending operation (methods before actions),
//! and recursively extends a plan DAG until the diff is empty or the search
//! is exhausted.

pub mod trace;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::dag::{Node, NodeId, Plan, PlanArena};
use crate::diff::{deleted, Diff, Op};
use crate::error::PlanError;
use crate::path::Pointer;
use crate::task::{ExpansionMode, Instruction, Registry};

use trace::{log_event, TraceEvent, TraceSink};

/// Running counters accumulated over a single `find_plan` call.
#[derive(Debug, Clone, Default)]
pub struct PlanStats {
    pub iterations: usize,
    pub max_depth: usize,
    pub elapsed: Duration,
}

/// Successful search result.
pub struct PlanResult {
    pub arena: PlanArena,
    pub start: Option<NodeId>,
    pub state: Value,
    pub stats: PlanStats,
}

/// Failed search result.
pub struct PlanFailure {
    pub kind: PlanError,
    pub stats: PlanStats,
}

pub type PlanOutcome = Result<PlanResult, PlanFailure>;

/// Depth-first HTN search bounded by `max_search_depth`.
pub struct Planner {
    registry: Registry,
    max_search_depth: usize,
    trace: Option<TraceSink>,
}

/// Raw, in-progress chain head plus the locally simulated state it implies.
/// `state` is never what the runtime actually observes — it is the
/// planner's pure simulation via `effect`, used only to decide the next
/// diff.
struct Frame {
    start: Option<NodeId>,
    state: Value,
}

impl Planner {
    pub fn new(registry: Registry, max_search_depth: usize) -> Self {
        Planner {
            registry,
            max_search_depth,
            trace: None,
        }
    }

    pub fn with_trace_sink(mut self, sink: TraceSink) -> Self {
        self.trace = Some(sink);
        self
    }

    fn emit(&self, event: TraceEvent) {
        log_event(&event);
        if let Some(sink) = &self.trace {
            sink(&event);
        }
    }

    /// Top-level entry point: find a plan from `current` toward `target`.
    pub fn find_plan(&self, current: &Value, target: &Value) -> PlanOutcome {
        let started = Instant::now();
        self.emit(TraceEvent::Start);

        let mut arena = PlanArena::new();
        let mut stats = PlanStats::default();
        let mut used_ids: Vec<String> = Vec::new();
        let mut call_stack: Vec<String> = Vec::new();

        let frame = Frame {
            start: None,
            state: current.clone(),
        };

        let result = self.search(
            frame,
            target,
            0,
            &mut arena,
            &mut used_ids,
            &mut call_stack,
            &mut stats,
        );

        stats.elapsed = started.elapsed();

        match result {
            Ok(frame) => {
                let forward_start = arena.reverse_from(frame.start);
                self.emit(TraceEvent::Success {
                    iterations: stats.iterations,
                });
                Ok(PlanResult {
                    arena,
                    start: forward_start,
                    state: frame.state,
                    stats,
                })
            }
            Err(kind) => {
                self.emit(TraceEvent::Failed {
                    reason: kind.to_string(),
                });
                Err(PlanFailure { kind, stats })
            }
        }
    }

    /// The recursive search. `frame.state` is this level's simulated state;
    /// `depth` is the recursion depth so far.
    #[allow(clippy::too_many_arguments)]
    fn search(
        &self,
        frame: Frame,
        target: &Value,
        depth: usize,
        arena: &mut PlanArena,
        used_ids: &mut Vec<String>,
        call_stack: &mut Vec<String>,
        stats: &mut PlanStats,
    ) -> Result<Frame, PlanError> {
        stats.max_depth = stats.max_depth.max(depth);
        if depth > self.max_search_depth {
            return Err(PlanError::SearchFailed(depth));
        }

        let ops = Diff::of(&frame.state, target);
        self.emit(TraceEvent::FindNext {
            depth,
            state: frame.state.clone(),
            operations: ops.clone(),
        });

        if ops.is_empty() {
            return Ok(frame);
        }

        for op in &ops {
            let tasks = self.registry.applicable(op);
            for task in tasks {
                stats.iterations += 1;
                let checkpoint = used_ids.len();

                let attempt = self.try_instruction(
                    &task,
                    op,
                    &frame.state,
                    target,
                    frame.start,
                    arena,
                    depth,
                    used_ids,
                    call_stack,
                    stats,
                );

                let extended = match attempt {
                    Ok(extended) => extended,
                    Err(_) => {
                        used_ids.truncate(checkpoint);
                        continue;
                    }
                };

                self.emit(TraceEvent::Found);

                match self.search(
                    Frame {
                        start: extended.start,
                        state: extended.state,
                    },
                    target,
                    depth + 1,
                    arena,
                    used_ids,
                    call_stack,
                    stats,
                ) {
                    Ok(result) => return Ok(result),
                    Err(_) => {
                        used_ids.truncate(checkpoint);
                        continue;
                    }
                }
            }
        }

        Err(PlanError::SearchFailed(depth))
    }

    #[allow(clippy::too_many_arguments)]
    fn try_instruction(
        &self,
        task: &Arc<crate::task::Task>,
        op: &Op,
        state: &Value,
        target: &Value,
        start: Option<NodeId>,
        arena: &mut PlanArena,
        depth: usize,
        used_ids: &mut Vec<String>,
        call_stack: &mut Vec<String>,
        stats: &mut PlanStats,
    ) -> Result<Frame, PlanError> {
        let instruction = if task.lens.is_empty() {
            task.ground_against_target(target)?
        } else {
            task.ground(op)?
        };

        self.emit(TraceEvent::TryInstruction {
            instruction_id: instruction.id.clone(),
            description: instruction.description(),
            operation: op.clone(),
        });

        if !instruction.condition_holds(state) {
            return Err(PlanError::ConditionNotMet(instruction.id));
        }

        if task.is_method() {
            self.try_method(instruction, state, target, start, arena, depth, used_ids, call_stack, stats)
        } else {
            self.try_action(instruction, state, start, arena, used_ids)
        }
    }

    fn try_action(
        &self,
        instruction: Instruction,
        state: &Value,
        start: Option<NodeId>,
        arena: &mut PlanArena,
        used_ids: &mut Vec<String>,
    ) -> Result<Frame, PlanError> {
        let new_state = instruction.apply_effect(state);

        // Loop detection keys off the value this application actually wrote,
        // not the task's grounded target: a task reaching a fixed target by
        // repeated incremental steps (e.g. `+1` applied twice) legitimately
        // reuses the same grounded instruction id but writes a different
        // value each time, while a stuck task (no progress) writes the same
        // value again and is correctly rejected here.
        let value_after = instruction
            .context
            .get(&new_state)
            .ok()
            .flatten()
            .cloned()
            .unwrap_or_else(|| new_state.clone());
        let progress_id =
            crate::task::instruction_id(&instruction.task.id, &instruction.context.path, value_after);

        if used_ids.contains(&progress_id) {
            return Err(PlanError::LoopDetected(instruction.id));
        }
        used_ids.push(progress_id);
        let node_id = arena.push(Node::Action {
            instruction: Arc::new(instruction),
            next: start,
        });
        Ok(Frame {
            start: Some(node_id),
            state: new_state,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn try_method(
        &self,
        instruction: Instruction,
        state: &Value,
        target: &Value,
        start: Option<NodeId>,
        arena: &mut PlanArena,
        depth: usize,
        used_ids: &mut Vec<String>,
        call_stack: &mut Vec<String>,
        stats: &mut PlanStats,
    ) -> Result<Frame, PlanError> {
        if call_stack.contains(&instruction.task.id) {
            return Err(PlanError::RecursionDetected(instruction.task.id.clone()));
        }
        call_stack.push(instruction.task.id.clone());
        let (sub_ops, mode) = instruction.expand_method(state);
        let task_id = instruction.task.id.clone();

        let result = if sub_ops.is_empty() {
            Err(PlanError::MethodExpansionEmpty(task_id.clone()))
        } else {
            match mode {
                ExpansionMode::Parallel => self.try_parallel(
                    &sub_ops, &task_id, state, target, start, arena, depth, used_ids, call_stack, stats,
                ),
                ExpansionMode::Sequential => {
                    self.try_sequential(&sub_ops, state, target, start, arena, depth, used_ids, call_stack, stats)
                }
            }
        };

        call_stack.pop();
        result
    }

    /// Plans a single sub-operation to completion, as if it were the whole
    /// target — reusing the same recursive search the top level uses.
    #[allow(clippy::too_many_arguments)]
    fn plan_sub_op(
        &self,
        sub_op: &Op,
        state: &Value,
        tail: Option<NodeId>,
        arena: &mut PlanArena,
        depth: usize,
        used_ids: &mut Vec<String>,
        call_stack: &mut Vec<String>,
        stats: &mut PlanStats,
    ) -> Result<Frame, PlanError> {
        let sub_target = op_as_target(state, sub_op);
        self.search(
            Frame {
                start: tail,
                state: state.clone(),
            },
            &sub_target,
            depth + 1,
            arena,
            used_ids,
            call_stack,
            stats,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn try_sequential(
        &self,
        sub_ops: &[Op],
        state: &Value,
        _target: &Value,
        start: Option<NodeId>,
        arena: &mut PlanArena,
        depth: usize,
        used_ids: &mut Vec<String>,
        call_stack: &mut Vec<String>,
        stats: &mut PlanStats,
    ) -> Result<Frame, PlanError> {
        let mut cur_start = start;
        let mut cur_state = state.clone();
        for sub_op in sub_ops {
            let frame = self.plan_sub_op(
                sub_op, &cur_state, cur_start, arena, depth, used_ids, call_stack, stats,
            )?;
            cur_start = frame.start;
            cur_state = frame.state;
        }
        Ok(Frame {
            start: cur_start,
            state: cur_state,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn try_parallel(
        &self,
        sub_ops: &[Op],
        task_id: &str,
        state: &Value,
        target: &Value,
        start: Option<NodeId>,
        arena: &mut PlanArena,
        depth: usize,
        used_ids: &mut Vec<String>,
        call_stack: &mut Vec<String>,
        stats: &mut PlanStats,
    ) -> Result<Frame, PlanError> {
        let checkpoint = used_ids.len();
        let mut branches: Vec<(NodeId, Value)> = Vec::new();

        for sub_op in sub_ops {
            let frame = self.plan_sub_op(sub_op, state, None, arena, depth, used_ids, call_stack, stats)?;
            if let Some(branch_start) = frame.start {
                branches.push((branch_start, frame.state));
            }
        }

        if branches.is_empty() {
            return Err(PlanError::MethodExpansionEmpty(task_id.to_string()));
        }

        if has_conflict(state, &branches) {
            used_ids.truncate(checkpoint);
            self.emit(TraceEvent::BacktrackMethod {
                task_id: task_id.to_string(),
            });
            return self.try_sequential(sub_ops, state, target, start, arena, depth, used_ids, call_stack, stats);
        }

        if branches.len() == 1 {
            let (branch_start, branch_state) = branches.into_iter().next().unwrap();
            if let Some(outer_start) = start {
                arena.attach_tail(branch_start, outer_start);
            }
            return Ok(Frame {
                start: Some(branch_start),
                state: branch_state,
            });
        }

        // Fold all branch effects into one resulting state — branches are
        // conflict-free by construction, so field-wise merge is safe.
        let mut merged_state = state.clone();
        let join = arena.push(Node::Join { next: None });
        let mut branch_heads = Vec::new();
        for (branch_start, branch_state) in &branches {
            merged_state = merge_disjoint(&merged_state, state, branch_state);
            let forward_start = arena
                .reverse_from(Some(*branch_start))
                .expect("a planned branch always has at least one node");
            arena.attach_tail(forward_start, join);
            branch_heads.push(forward_start);
        }

        let fork = arena.push(Node::Fork {
            branches: branch_heads,
            join,
            prepend_next: start,
        });

        Ok(Frame {
            start: Some(fork),
            state: merged_state,
        })
    }
}

/// Builds a target patch equal to `state` with `op`'s path set to `op`'s
/// value (or the delete sentinel), so a single sub-operation can be planned
/// via the ordinary `search` entry point.
fn op_as_target(state: &Value, op: &Op) -> Value {
    let mut t = state.clone();
    match op {
        Op::Create { path, value } | Op::Update { path, value } => {
            let _ = Pointer::set(&mut t, path, value.clone());
        }
        Op::Delete { path } => {
            let _ = Pointer::set(&mut t, path, deleted());
        }
    }
    t
}

/// True if any two branches' effective changes touch overlapping paths
/// (one path is a prefix of, or equal to, the other).
fn has_conflict(original: &Value, branches: &[(NodeId, Value)]) -> bool {
    let changes: Vec<Vec<Op>> = branches
        .iter()
        .map(|(_, branch_state)| Diff::of(original, branch_state))
        .collect();

    for i in 0..changes.len() {
        for j in (i + 1)..changes.len() {
            for a in &changes[i] {
                for b in &changes[j] {
                    if is_prefix(a.path(), b.path()) || is_prefix(b.path(), a.path()) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn is_prefix(a: &crate::path::Path, b: &crate::path::Path) -> bool {
    a.len() <= b.len() && a.0.iter().zip(b.0.iter()).all(|(x, y)| x == y)
}

/// Merges `branch` on top of `base`, applying only the fields that changed
/// relative to `original` — used once conflict-freedom has been verified.
fn merge_disjoint(base: &Value, original: &Value, branch: &Value) -> Value {
    let mut result = base.clone();
    for op in Diff::of(original, branch) {
        match op {
            Op::Create { path, value } | Op::Update { path, value } => {
                let _ = Pointer::set(&mut result, &path, value);
            }
            Op::Delete { path } => {
                let _ = Pointer::delete(&mut result, &path);
            }
        }
    }
    result
}
