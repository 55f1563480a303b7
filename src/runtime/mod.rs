//! The control loop (C7): repeatedly plans and executes until the target is
//! reached, stopped, or retries are exhausted.
//!
//! The plan DAG is walked with an explicit stack rather than recursion
//! (`walk_node` only recurses across a `Fork`'s branches, each of which is
//! spawned as its own task and walks its own stack); concurrent branches use
//! `tokio::task::JoinSet`, mirroring the teacher's message-graph executor
//! frontier loop.

pub mod interrupt;
pub mod policy;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::task::JoinSet;

use crate::dag::{Node, NodeId, PlanArena};
use crate::error::RuntimeError;
use crate::planner::Planner;
use crate::sensor::{Sensor, SharedState};

use interrupt::Interrupt;
use policy::{BackoffPolicy, CircuitBreaker};

/// Options configuring a [`Runtime`]'s loop, serializable so a caller can
/// externalize tuning via `driftctl::config::load_opts` behind the `config`
/// feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOpts {
    pub follow: bool,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub max_wait: Duration,
    #[serde(with = "duration_millis")]
    pub min_wait: Duration,
    pub max_search_depth: usize,
    /// Consecutive loop-iteration failures before the internal circuit
    /// breaker opens and forces max backoff. `0` disables the breaker.
    pub circuit_open_after: u32,
    #[serde(with = "duration_millis")]
    pub circuit_reset_after: Duration,
}

impl Default for AgentOpts {
    fn default() -> Self {
        AgentOpts {
            follow: false,
            max_retries: 0,
            max_wait: Duration::from_secs(30),
            min_wait: Duration::from_millis(100),
            max_search_depth: 100,
            circuit_open_after: 5,
            circuit_reset_after: Duration::from_secs(30),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Terminal result of a runtime loop.
#[derive(Debug, Clone)]
pub enum RuntimeOutcome {
    Success { state: Value },
    Stopped,
    Failure { tries: u32 },
    UnknownError(String),
}

/// The planning/execution control loop. Constructed via [`Runtime::new`] and
/// driven by [`Runtime::start`]; always held behind an `Arc` since the
/// spawned loop task and sensor watchers need to share it.
pub struct Runtime {
    state: SharedState,
    target: Mutex<Value>,
    planner: Arc<Planner>,
    sensors: Vec<Arc<dyn Sensor>>,
    opts: AgentOpts,
    backoff: BackoffPolicy,
    breaker: CircuitBreaker,
    interrupt: Interrupt,
    wake: Notify,
    running: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    follow_handles: Mutex<Vec<JoinHandle<()>>>,
    observer: Mutex<Option<Arc<dyn Fn(Value) + Send + Sync>>>,
    outcome_tx: watch::Sender<Option<RuntimeOutcome>>,
    outcome_rx: watch::Receiver<Option<RuntimeOutcome>>,
}

impl Runtime {
    pub fn new(
        initial_state: Value,
        target: Value,
        planner: Arc<Planner>,
        sensors: Vec<Arc<dyn Sensor>>,
        opts: AgentOpts,
    ) -> Arc<Self> {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let backoff = BackoffPolicy::new(opts.min_wait, opts.max_wait);
        let breaker = CircuitBreaker::new(opts.circuit_open_after, opts.circuit_reset_after);
        Arc::new(Runtime {
            state: Arc::new(Mutex::new(initial_state)),
            target: Mutex::new(target),
            planner,
            sensors,
            opts,
            backoff,
            breaker,
            interrupt: Interrupt::new(),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
            follow_handles: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
            outcome_tx,
            outcome_rx,
        })
    }

    /// Installs a callback invoked with the current state after each sensor
    /// update absorbed outside follow mode. Has no effect in follow mode,
    /// where updates drive replanning instead. Must be called before
    /// `start()` to observe updates from the first run.
    pub async fn set_observer(&self, f: Arc<dyn Fn(Value) + Send + Sync>) {
        *self.observer.lock().await = Some(f);
    }

    /// Spawns the planning/execution loop. Idempotent while already running.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.interrupt.reset();
        let _ = self.outcome_tx.send(None);

        let mut handles = Vec::with_capacity(self.sensors.len());
        for sensor in &self.sensors {
            handles.push(sensor.subscribe(self.state.clone()).await);
        }

        let mut followers = Vec::with_capacity(handles.len());
        let follow = self.opts.follow;
        for mut handle in std::mem::take(&mut handles) {
            let this = self.clone();
            followers.push(tokio::spawn(async move {
                while handle.next_update().await.is_some() {
                    if follow {
                        this.wake.notify_one();
                    } else if let Some(observer) = this.observer.lock().await.clone() {
                        observer(this.state().await);
                    }
                }
            }));
        }
        *self.follow_handles.lock().await = followers;

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop().await });
        *self.loop_handle.lock().await = Some(handle);
    }

    /// Requests cancellation, awaits loop completion, and detaches sensors.
    pub async fn stop(self: &Arc<Self>) -> RuntimeOutcome {
        self.interrupt.trigger();
        self.wake.notify_one();
        let outcome = self.wait(None).await.unwrap_or(RuntimeOutcome::Stopped);

        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        for handle in std::mem::take(&mut *self.follow_handles.lock().await) {
            handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    /// Awaits the loop's terminal outcome, optionally bounded by `timeout`.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<RuntimeOutcome, RuntimeError> {
        if !self.running.load(Ordering::SeqCst) && self.outcome_rx.borrow().is_none() {
            return Err(RuntimeError::NotStarted);
        }
        let mut rx = self.outcome_rx.clone();
        let await_outcome = async {
            loop {
                if let Some(outcome) = rx.borrow().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return RuntimeOutcome::Stopped;
                }
            }
        };
        match timeout {
            Some(d) => tokio::time::timeout(d, await_outcome)
                .await
                .map_err(|_| RuntimeError::Timeout(d)),
            None => Ok(await_outcome.await),
        }
    }

    pub async fn state(&self) -> Value {
        self.state.lock().await.clone()
    }

    fn finish(&self, outcome: RuntimeOutcome) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.outcome_tx.send(Some(outcome));
    }

    async fn run_loop(self: Arc<Self>) {
        let mut tries: u32 = 0;
        loop {
            if self.interrupt.check() {
                self.finish(RuntimeOutcome::Stopped);
                return;
            }

            let current = self.state.lock().await.clone();
            let target = self.target.lock().await.clone();

            match self.planner.find_plan(&current, &target) {
                Ok(result) => {
                    if result.start.is_none() {
                        let mut state = self.state.lock().await;
                        *state = result.state.clone();
                        drop(state);
                        self.breaker.record_success().await;
                        tracing::info!("runtime: target already satisfied");
                        self.finish(RuntimeOutcome::Success { state: result.state });
                        return;
                    }

                    let arena = Arc::new(result.arena);
                    let outcome = walk_node(
                        self.state.clone(),
                        arena,
                        result.start.expect("checked non-empty above"),
                        self.interrupt.clone(),
                    )
                    .await;

                    match outcome {
                        Ok(()) => {
                            self.breaker.record_success().await;
                            tracing::debug!("runtime: plan executed, checking for remaining drift");
                        }
                        Err(RuntimeError::Cancelled) => {
                            self.finish(RuntimeOutcome::Stopped);
                            return;
                        }
                        Err(
                            e @ (RuntimeError::ActionConditionFailed(_)
                            | RuntimeError::ActionRunFailed { .. }),
                        ) => {
                            tracing::warn!(error = %e, "runtime: recoverable execution error, replanning");
                            self.breaker.record_failure().await;
                        }
                        Err(RuntimeError::UnknownError(cause)) => {
                            tracing::error!(error = %cause, "runtime: unexpected execution error");
                            self.finish(RuntimeOutcome::UnknownError(cause));
                            return;
                        }
                        Err(other) => {
                            tracing::error!(error = %other, "runtime: unexpected execution error");
                            self.finish(RuntimeOutcome::UnknownError(other.to_string()));
                            return;
                        }
                    }
                }
                Err(failure) => {
                    tracing::warn!(error = %failure.kind, "runtime: planning failed");
                    self.breaker.record_failure().await;
                    tries += 1;
                    if self.opts.max_retries > 0 && tries >= self.opts.max_retries {
                        self.finish(RuntimeOutcome::Failure { tries });
                        return;
                    }
                }
            }

            let wait_for = self.backoff.backoff_for_attempt(tries);
            tokio::select! {
                _ = tokio::time::sleep(wait_for) => {}
                _ = self.wake.notified() => {
                    tracing::debug!("runtime: woken early by sensor update");
                }
                _ = self.interrupt.cancelled() => {
                    self.finish(RuntimeOutcome::Stopped);
                    return;
                }
            }
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Walks a raw plan chain starting at `start`, using an explicit stack for
/// the linear portion; a `Fork`'s branches are each walked by a freshly
/// spawned task (recursing into `walk_node` for any nested fork), joined via
/// `JoinSet` before continuing past the paired `Join`.
fn walk_node(
    state: SharedState,
    arena: Arc<PlanArena>,
    start: NodeId,
    interrupt: Interrupt,
) -> BoxFuture<'static, Result<(), RuntimeError>> {
    Box::pin(async move {
        let mut stack = vec![start];
        while let Some(node_id) = stack.pop() {
            if interrupt.check() {
                return Err(RuntimeError::Cancelled);
            }
            match arena.get(node_id) {
                Node::Action { instruction, next } => {
                    let instruction = instruction.clone();
                    {
                        let guard = state.lock().await;
                        if !instruction.condition_holds(&guard) {
                            return Err(RuntimeError::ActionConditionFailed(
                                instruction.description(),
                            ));
                        }
                    }
                    let description = instruction.description();
                    let current = state.lock().await.clone();
                    let run = tokio::spawn(async move { instruction.run_action(current).await });
                    // a panic crossing the task boundary is a bug, not a
                    // recoverable condition (§7): surface it as `UnknownError`.
                    // the action's own `Err(cause)` is recoverable and
                    // surfaces as `ActionRunFailed` so the loop retries it.
                    let outcome = run
                        .await
                        .map_err(|e| RuntimeError::UnknownError(e.to_string()))?;
                    let new_state = outcome.map_err(|cause| RuntimeError::ActionRunFailed {
                        action: description,
                        cause,
                    })?;
                    let mut guard = state.lock().await;
                    *guard = new_state;
                    drop(guard);
                    if let Some(n) = next {
                        stack.push(*n);
                    }
                }
                Node::Fork { branches, join, .. } => {
                    let join_id = *join;
                    let mut set = JoinSet::new();
                    for branch in branches.clone() {
                        let state = state.clone();
                        let arena = arena.clone();
                        let interrupt = interrupt.clone();
                        set.spawn(walk_node(state, arena, branch, interrupt));
                    }
                    while let Some(joined) = set.join_next().await {
                        joined.map_err(|e| RuntimeError::UnknownError(e.to_string()))??;
                    }
                    if let Node::Join { next } = arena.get(join_id) {
                        if let Some(n) = next {
                            stack.push(*n);
                        }
                    }
                }
                Node::Join { next } => {
                    if let Some(n) = next {
                        stack.push(*n);
                    }
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Registry, Task, TaskOp};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter_task() -> Arc<Task> {
        Task::new("by-one")
            .lens("/count")
            .op(TaskOp::Update)
            .condition(|state, ctx| {
                let cur = state.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                cur < ctx.target.as_i64().unwrap_or(0)
            })
            .action(
                |state, _ctx| {
                    let mut s = state.clone();
                    let cur = s.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                    s["count"] = json!(cur + 1);
                    s
                },
                |state, _ctx| async move {
                    let mut s = state;
                    let cur = s.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                    s["count"] = json!(cur + 1);
                    Ok(s)
                },
            )
    }

    #[tokio::test]
    async fn test_empty_target_reaches_success_immediately() {
        let planner = Planner::new(Registry::new(vec![]), 10);
        let runtime = Runtime::new(json!({"count": 0}), json!({"count": 0}), Arc::new(planner), vec![], AgentOpts::default());
        runtime.start().await;
        let outcome = runtime.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert!(matches!(outcome, RuntimeOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_runtime_drives_state_to_target() {
        let planner = Planner::new(Registry::new(vec![counter_task()]), 20);
        let runtime = Runtime::new(json!({"count": 0}), json!({"count": 3}), Arc::new(planner), vec![], AgentOpts::default());
        runtime.start().await;
        let outcome = runtime.wait(Some(Duration::from_secs(2))).await.unwrap();
        match outcome {
            RuntimeOutcome::Success { state } => assert_eq!(state, json!({"count": 3})),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_before_start_is_not_started() {
        let planner = Planner::new(Registry::new(vec![]), 10);
        let runtime = Runtime::new(json!(0), json!(0), Arc::new(planner), vec![], AgentOpts::default());
        let err = runtime.wait(None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotStarted));
    }

    #[tokio::test]
    async fn test_stop_before_completion_reports_stopped() {
        // no applicable task, so the loop backs off repeatedly; stop() should
        // interrupt that wait promptly rather than waiting out max_retries.
        let opts = AgentOpts {
            min_wait: Duration::from_secs(5),
            max_wait: Duration::from_secs(5),
            ..AgentOpts::default()
        };
        let planner = Planner::new(Registry::new(vec![]), 10);
        let runtime = Runtime::new(json!({"count": 0}), json!({"count": 1}), Arc::new(planner), vec![], opts);
        runtime.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let outcome = tokio::time::timeout(Duration::from_secs(1), runtime.stop())
            .await
            .expect("stop should not block on the backoff sleep");
        assert!(matches!(outcome, RuntimeOutcome::Stopped));
    }

    #[tokio::test]
    async fn test_max_retries_yields_failure() {
        let opts = AgentOpts {
            max_retries: 2,
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(1),
            ..AgentOpts::default()
        };
        let planner = Planner::new(Registry::new(vec![]), 10);
        let runtime = Runtime::new(json!({"count": 0}), json!({"count": 1}), Arc::new(planner), vec![], opts);
        runtime.start().await;
        let outcome = runtime.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert!(matches!(outcome, RuntimeOutcome::Failure { tries: 2 }));
    }

    #[tokio::test]
    async fn test_action_run_failure_is_recoverable_and_retried() {
        // the action fails once, then succeeds; the loop must log and
        // replan rather than treating the failure as fatal.
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_for_action = attempts.clone();
        let task = Task::new("flaky")
            .lens("/count")
            .op(TaskOp::Update)
            .condition(|state, ctx| {
                let cur = state.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                cur < ctx.target.as_i64().unwrap_or(0)
            })
            .action(
                |state, _ctx| {
                    let mut s = state.clone();
                    let cur = s.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                    s["count"] = json!(cur + 1);
                    s
                },
                move |state, _ctx| {
                    let attempts = attempts_for_action.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            return Err("transient failure".to_string());
                        }
                        let mut s = state;
                        let cur = s.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                        s["count"] = json!(cur + 1);
                        Ok(s)
                    }
                },
            );
        let opts = AgentOpts {
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(5),
            ..AgentOpts::default()
        };
        let planner = Planner::new(Registry::new(vec![task]), 20);
        let runtime = Runtime::new(json!({"count": 0}), json!({"count": 1}), Arc::new(planner), vec![], opts);
        runtime.start().await;
        let outcome = runtime.wait(Some(Duration::from_secs(2))).await.unwrap();
        match outcome {
            RuntimeOutcome::Success { state } => assert_eq!(state, json!({"count": 1})),
            other => panic!("expected success after the transient failure, got {other:?}"),
        }
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_fork_branches_both_execute() {
        let a = Task::new("inc-a")
            .lens("/a")
            .op(TaskOp::Update)
            .condition(|s, ctx| s.as_i64().unwrap_or(0) < ctx.target.as_i64().unwrap_or(0))
            .action(
                |s, _c| json!(s.as_i64().unwrap_or(0) + 1),
                |s, _c| async move { Ok(json!(s.as_i64().unwrap_or(0) + 1)) },
            );
        let b = Task::new("inc-b")
            .lens("/b")
            .op(TaskOp::Update)
            .condition(|s, ctx| s.as_i64().unwrap_or(0) < ctx.target.as_i64().unwrap_or(0))
            .action(
                |s, _c| json!(s.as_i64().unwrap_or(0) + 1),
                |s, _c| async move { Ok(json!(s.as_i64().unwrap_or(0) + 1)) },
            );
        let planner = Planner::new(Registry::new(vec![a, b]), 20);
        let runtime = Runtime::new(
            json!({"a": 0, "b": 0}),
            json!({"a": 1, "b": 1}),
            Arc::new(planner),
            vec![],
            AgentOpts::default(),
        );
        runtime.start().await;
        let outcome = runtime.wait(Some(Duration::from_secs(2))).await.unwrap();
        match outcome {
            RuntimeOutcome::Success { state } => assert_eq!(state, json!({"a": 1, "b": 1})),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_agent_opts_round_trips_json() {
        let opts = AgentOpts {
            follow: true,
            max_retries: 3,
            ..AgentOpts::default()
        };
        let encoded = serde_json::to_string(&opts).unwrap();
        let decoded: AgentOpts = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.follow);
        assert_eq!(decoded.max_retries, 3);
        assert_eq!(decoded.max_wait, opts.max_wait);
    }

    #[tokio::test]
    async fn test_follow_mode_wakes_loop_on_sensor_update() {
        use crate::sensor::{Mutation, PollSensor};
        use std::sync::atomic::Ordering as AtomOrdering;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_for_sensor = fired.clone();
        let sensor: Arc<dyn Sensor> = Arc::new(PollSensor::new(move || {
            let fired = fired_for_sensor.clone();
            Box::pin(async move {
                if fired.fetch_add(1, AtomOrdering::SeqCst) == 0 {
                    Some(Box::new(|state: &mut Value| {
                        state["count"] = json!(1);
                    }) as Mutation)
                } else {
                    None
                }
            })
        }));

        let opts = AgentOpts {
            follow: true,
            min_wait: Duration::from_secs(10),
            max_wait: Duration::from_secs(10),
            ..AgentOpts::default()
        };
        let planner = Planner::new(Registry::new(vec![counter_task()]), 20);
        let runtime = Runtime::new(json!({"count": 0}), json!({"count": 1}), Arc::new(planner), vec![sensor], opts);
        runtime.start().await;
        let outcome = runtime.wait(Some(Duration::from_secs(2))).await.unwrap();
        match outcome {
            RuntimeOutcome::Success { state } => assert_eq!(state, json!({"count": 1})),
            other => panic!("expected success (sensor should have woken the loop), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_follow_mode_drains_updates_via_observer() {
        use crate::sensor::{Mutation, PollSensor};
        use std::sync::atomic::Ordering as AtomOrdering;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_for_sensor = fired.clone();
        let sensor: Arc<dyn Sensor> = Arc::new(PollSensor::new(move || {
            let fired = fired_for_sensor.clone();
            Box::pin(async move {
                let n = fired.fetch_add(1, AtomOrdering::SeqCst);
                if n < 3 {
                    Some(Box::new(|state: &mut Value| {
                        state["pings"] = json!(state.get("pings").and_then(|v| v.as_i64()).unwrap_or(0) + 1);
                    }) as Mutation)
                } else {
                    None
                }
            })
        }));

        let observed = Arc::new(AtomicUsize::new(0));
        let observed_for_cb = observed.clone();
        let planner = Planner::new(Registry::new(vec![]), 20);
        let runtime = Runtime::new(
            json!({"pings": 0}),
            json!({"pings": 0}),
            Arc::new(planner),
            vec![sensor],
            AgentOpts::default(),
        );
        runtime
            .set_observer(Arc::new(move |_state: Value| {
                observed_for_cb.fetch_add(1, AtomOrdering::SeqCst);
            }))
            .await;
        runtime.start().await;
        runtime.wait(Some(Duration::from_secs(2))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(observed.load(AtomOrdering::SeqCst), 3);
        runtime.stop().await;
    }
}
