//! Task definitions, grounding into instructions, and the task registry.
//!
//! A [`Task`] is either an *action* (pure `effect` for planning plus an
//! async `action` for execution) or a *method* (expands into further
//! operations, sequentially or in parallel). [`Task::ground`] binds a task to
//! a concrete [`Context`], producing an [`Instruction`] with a
//! content-addressed id used for loop/recursion detection.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::diff::{Op, OpKind};
use crate::error::LensError;
use crate::lens::{Context, Lens};
use crate::path::Path;

/// Operation kinds a task declares itself applicable to. `Any` matches every
/// [`OpKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOp {
    Create,
    Update,
    Delete,
    Any,
}

impl TaskOp {
    fn matches(self, kind: OpKind) -> bool {
        match (self, kind) {
            (TaskOp::Any, _) => true,
            (TaskOp::Create, OpKind::Create) => true,
            (TaskOp::Update, OpKind::Update) => true,
            (TaskOp::Delete, OpKind::Delete) => true,
            _ => false,
        }
    }
}

/// How a method's sub-operations should be expanded by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionMode {
    Parallel,
    Sequential,
}

type ConditionFn = dyn Fn(&Value, &Context) -> bool + Send + Sync;
type EffectFn = dyn Fn(&Value, &Context) -> Value + Send + Sync;
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
/// An action's execution result: the new state, or a recoverable failure
/// cause surfaced as `RuntimeError::ActionRunFailed` (the runtime logs it
/// and retries under backoff rather than aborting the loop).
type ActionFn = dyn Fn(Value, Context) -> BoxFuture<'static, Result<Value, String>> + Send + Sync;
type MethodFn = dyn Fn(&Value, &Context) -> Vec<Op> + Send + Sync;

/// The behavior half of a task: either an executable action or an expanding
/// method.
pub enum Behavior {
    Action {
        effect: Box<EffectFn>,
        action: Box<ActionFn>,
    },
    Method {
        expand: Box<MethodFn>,
        mode: ExpansionMode,
    },
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Behavior::Action { .. } => write!(f, "Behavior::Action"),
            Behavior::Method { mode, .. } => write!(f, "Behavior::Method({mode:?})"),
        }
    }
}

/// An immutable task definition.
pub struct Task {
    pub id: String,
    pub description: String,
    pub lens: Path,
    pub op: TaskOp,
    pub condition: Box<ConditionFn>,
    pub behavior: Behavior,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("op", &self.op)
            .field("behavior", &self.behavior)
            .finish()
    }
}

impl Task {
    /// Starts building a task with the given stable id. Defaults: lens `/`,
    /// op `Update`, condition always true, description falls back to `id`.
    pub fn new(id: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(id.into())
    }

    pub fn is_method(&self) -> bool {
        matches!(self.behavior, Behavior::Method { .. })
    }

    /// True if this task declares itself applicable to `op`'s path shape and
    /// kind (§4.4): matching segment count, literal segments, and op kind.
    ///
    /// A task whose lens is the root (`/`, zero segments) is a whole-target
    /// orchestrator: it is tried once per search call regardless of which
    /// leaf operation is under consideration, and is grounded against the
    /// overall target via [`Task::ground_against_target`] rather than a
    /// single op's value.
    pub fn is_applicable(&self, op: &Op) -> bool {
        if self.lens.is_empty() {
            return true;
        }
        if !self.op.matches(op.kind()) {
            return false;
        }
        if self.lens.len() != op.path().len() {
            return false;
        }
        for (tpl, concrete) in self.lens.0.iter().zip(op.path().0.iter()) {
            use crate::path::Segment::*;
            match (tpl, concrete) {
                (Param(_), _) => {}
                (Key(a), Key(b)) if a == b => {}
                (Index(a), Index(b)) if a == b => {}
                _ => return false,
            }
        }
        true
    }

    /// Binds this task to a concrete operation, producing a content-addressed
    /// [`Instruction`].
    pub fn ground(self: &Arc<Self>, op: &Op) -> Result<Instruction, LensError> {
        let target = op.value().cloned().unwrap_or(Value::Null);
        let ctx = Lens::context(&self.lens, op.path(), target)?;
        let id = instruction_id(&self.id, op.path(), ctx.target.clone());
        Ok(Instruction {
            id,
            task: self.clone(),
            context: ctx,
        })
    }

    /// Grounds a root-lens (whole-target) task against the overall search
    /// target rather than a single operation's leaf value.
    pub fn ground_against_target(self: &Arc<Self>, target: &Value) -> Result<Instruction, LensError> {
        let ctx = Lens::context(&self.lens, &Path::root(), target.clone())?;
        let id = instruction_id(&self.id, &Path::root(), ctx.target.clone());
        Ok(Instruction {
            id,
            task: self.clone(),
            context: ctx,
        })
    }
}

pub(crate) fn instruction_id(task_id: &str, path: &Path, target: Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(path.to_string_repr().as_bytes());
    hasher.update(target.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// A task grounded in a concrete context. Carries a content-addressed id
/// used by the planner for loop and recursion detection.
pub struct Instruction {
    pub id: String,
    pub task: Arc<Task>,
    pub context: Context,
}

impl Instruction {
    pub fn description(&self) -> String {
        format!("{} @ {}", self.task.description, self.context.path.to_string_repr())
    }

    pub fn condition_holds(&self, state: &Value) -> bool {
        (self.task.condition)(state, &self.context)
    }

    pub fn apply_effect(&self, state: &Value) -> Value {
        match &self.task.behavior {
            Behavior::Action { effect, .. } => effect(state, &self.context),
            Behavior::Method { .. } => {
                unreachable!("apply_effect called on a method instruction")
            }
        }
    }

    pub async fn run_action(&self, state: Value) -> Result<Value, String> {
        match &self.task.behavior {
            Behavior::Action { action, .. } => action(state, self.context.clone()).await,
            Behavior::Method { .. } => unreachable!("run_action called on a method instruction"),
        }
    }

    pub fn expand_method(&self, state: &Value) -> (Vec<Op>, ExpansionMode) {
        match &self.task.behavior {
            Behavior::Method { expand, mode } => (expand(state, &self.context), *mode),
            Behavior::Action { .. } => unreachable!("expand_method called on an action instruction"),
        }
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruction")
            .field("id", &self.id)
            .field("task", &self.task.id)
            .field("path", &self.context.path.to_string_repr())
            .finish()
    }
}

/// Builder for [`Task`], mirroring the fluent `with_x(mut self, ...) -> Self`
/// style used throughout the corpus.
pub struct TaskBuilder {
    id: String,
    description: Option<String>,
    lens: Path,
    op: TaskOp,
    condition: Box<ConditionFn>,
}

impl TaskBuilder {
    fn new(id: String) -> Self {
        Self {
            id,
            description: None,
            lens: Path::root(),
            op: TaskOp::Update,
            condition: Box::new(|_, _| true),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn lens(mut self, template: &str) -> Self {
        self.lens = Path::parse_template(template).expect("invalid lens template");
        self
    }

    pub fn op(mut self, op: TaskOp) -> Self {
        self.op = op;
        self
    }

    pub fn condition<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Context) -> bool + Send + Sync + 'static,
    {
        self.condition = Box::new(f);
        self
    }

    /// Finalizes an action task with a pure `effect` (used during planning)
    /// and an async `action` (used by the runtime at execution time). The
    /// action's `Err(cause)` surfaces as a recoverable `ActionRunFailed`
    /// rather than aborting the runtime loop.
    pub fn action<E, A, Fut>(self, effect: E, action: A) -> Arc<Task>
    where
        E: Fn(&Value, &Context) -> Value + Send + Sync + 'static,
        A: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let description = self.description.unwrap_or_else(|| self.id.clone());
        Arc::new(Task {
            id: self.id,
            description,
            lens: self.lens,
            op: self.op,
            condition: self.condition,
            behavior: Behavior::Action {
                effect: Box::new(effect),
                action: Box::new(move |state, ctx| Box::pin(action(state, ctx))),
            },
        })
    }

    /// Finalizes a method task expanding into further operations.
    pub fn method<M>(self, mode: ExpansionMode, expand: M) -> Arc<Task>
    where
        M: Fn(&Value, &Context) -> Vec<Op> + Send + Sync + 'static,
    {
        let description = self.description.unwrap_or_else(|| self.id.clone());
        Arc::new(Task {
            id: self.id,
            description,
            lens: self.lens,
            op: self.op,
            condition: self.condition,
            behavior: Behavior::Method {
                expand: Box::new(expand),
                mode,
            },
        })
    }
}

/// Holds task definitions and resolves applicability for a pending
/// operation. Sorted so methods are tried before actions.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    tasks: Vec<Arc<Task>>,
}

impl Registry {
    pub fn new(mut tasks: Vec<Arc<Task>>) -> Self {
        tasks.sort_by_key(|t| !t.is_method());
        Registry { tasks }
    }

    pub fn applicable(&self, op: &Op) -> Vec<Arc<Task>> {
        self.tasks
            .iter()
            .filter(|t| t.is_applicable(op))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Op as DiffOp;
    use serde_json::json;

    fn counter_task() -> Arc<Task> {
        Task::new("by-one")
            .lens("/counters/:name")
            .op(TaskOp::Update)
            .condition(|state, ctx| {
                let cur = ctx.get(state).unwrap().cloned().unwrap_or(json!(0));
                cur.as_i64().unwrap_or(0) < ctx.target.as_i64().unwrap_or(0)
            })
            .action(
                |state, ctx| {
                    let mut s = state.clone();
                    let cur = ctx
                        .get(&s)
                        .unwrap()
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    ctx.set(&mut s, json!(cur + 1)).unwrap();
                    s
                },
                |state, ctx| async move {
                    let mut s = state;
                    let cur = ctx
                        .get(&s)
                        .unwrap()
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    ctx.set(&mut s, json!(cur + 1)).unwrap();
                    Ok(s)
                },
            )
    }

    #[test]
    fn test_applicability_matches_op_kind_and_shape() {
        let task = counter_task();
        let op = DiffOp::Update {
            path: Path::parse("/counters/a").unwrap(),
            value: json!(3),
        };
        assert!(task.is_applicable(&op));

        let wrong_shape = DiffOp::Update {
            path: Path::parse("/counters/a/extra").unwrap(),
            value: json!(3),
        };
        assert!(!task.is_applicable(&wrong_shape));

        let wrong_kind = DiffOp::Delete {
            path: Path::parse("/counters/a").unwrap(),
        };
        assert!(!task.is_applicable(&wrong_kind));
    }

    #[test]
    fn test_ground_produces_stable_id() {
        let task = counter_task();
        let op = DiffOp::Update {
            path: Path::parse("/counters/a").unwrap(),
            value: json!(3),
        };
        let i1 = task.ground(&op).unwrap();
        let i2 = task.ground(&op).unwrap();
        assert_eq!(i1.id, i2.id);
    }

    #[test]
    fn test_ground_differs_by_path_and_target() {
        let task = counter_task();
        let op_a = DiffOp::Update {
            path: Path::parse("/counters/a").unwrap(),
            value: json!(3),
        };
        let op_b = DiffOp::Update {
            path: Path::parse("/counters/b").unwrap(),
            value: json!(3),
        };
        assert_ne!(task.ground(&op_a).unwrap().id, task.ground(&op_b).unwrap().id);
    }

    #[test]
    fn test_registry_sorts_methods_before_actions() {
        let action = counter_task();
        let method = Task::new("multi").method(ExpansionMode::Parallel, |_, _| Vec::new());
        let registry = Registry::new(vec![action.clone(), method.clone()]);
        let op = DiffOp::Update {
            path: Path::parse("/counters/a").unwrap(),
            value: json!(3),
        };
        // the method has a root lens, which is unconditionally applicable, so
        // both tasks match here; sorting must still put the method first.
        let applicable = registry.applicable(&op);
        assert_eq!(applicable.len(), 2);
        assert!(applicable[0].is_method());
        assert_eq!(applicable[0].id, method.id);
        assert_eq!(applicable[1].id, action.id);
    }

    #[tokio::test]
    async fn test_action_effect_and_run_agree() {
        let task = counter_task();
        let op = DiffOp::Update {
            path: Path::parse("/counters/a").unwrap(),
            value: json!(3),
        };
        let instr = task.ground(&op).unwrap();
        let state = json!({"counters": {"a": 0}});
        let effected = instr.apply_effect(&state);
        assert_eq!(effected, json!({"counters": {"a": 1}}));
        let run = instr.run_action(state).await.unwrap();
        assert_eq!(run, json!({"counters": {"a": 1}}));
    }
}
