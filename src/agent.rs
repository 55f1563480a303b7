//! The facade (C9): the crate's public entry point, wiring a [`Registry`] /
//! [`Planner`] and a set of sensors behind a builder, then re-running them
//! toward a new target each time `seek` is called.
//!
//! Grounded on the teacher's `workflow/mod.rs` re-export/facade style: the
//! module that end users actually import, thin over the lower layers.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{DriftError, RuntimeError};
use crate::planner::Planner;
use crate::runtime::{AgentOpts, Runtime, RuntimeOutcome};
use crate::sensor::Sensor;
use crate::task::{Registry, Task};

/// Builds an [`Agent`] from an initial state, a task registry (or a
/// pre-built [`Planner`]), sensors, and [`AgentOpts`].
#[derive(Default)]
pub struct AgentBuilder {
    initial: Option<Value>,
    tasks: Vec<Arc<Task>>,
    planner: Option<Arc<Planner>>,
    sensors: Vec<Arc<dyn Sensor>>,
    opts: AgentOpts,
    observer: Option<Arc<dyn Fn(Value) + Send + Sync>>,
}

impl AgentBuilder {
    pub fn initial(mut self, state: Value) -> Self {
        self.initial = Some(state);
        self
    }

    pub fn tasks(mut self, tasks: Vec<Arc<Task>>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Supplies a pre-built [`Planner`] (e.g. one already wired with a
    /// trace sink) instead of letting `build()` construct one from
    /// `.tasks(...)` and `opts.max_search_depth`.
    pub fn planner(mut self, planner: Planner) -> Self {
        self.planner = Some(Arc::new(planner));
        self
    }

    pub fn sensors(mut self, sensors: Vec<Arc<dyn Sensor>>) -> Self {
        self.sensors = sensors;
        self
    }

    pub fn opts(mut self, opts: AgentOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Callback invoked with the current state after each sensor update
    /// absorbed outside follow mode (§4.7). No effect when `opts.follow`.
    pub fn observer(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Agent, DriftError> {
        let initial = self.initial.unwrap_or(Value::Null);
        let planner = self
            .planner
            .unwrap_or_else(|| Arc::new(Planner::new(Registry::new(self.tasks), self.opts.max_search_depth)));
        Ok(Agent {
            last_state: Mutex::new(initial),
            planner,
            sensors: self.sensors,
            opts: self.opts,
            observer: self.observer,
            current: Mutex::new(None),
        })
    }
}

/// The autonomous reconfiguration agent. Constructed via [`Agent::builder`];
/// `seek` retargets a fresh [`Runtime`], replacing whichever one is already
/// driving state toward a previous target. The same [`Planner`] (stateless
/// across `find_plan` calls) is shared by every runtime a given `Agent`
/// spawns.
pub struct Agent {
    last_state: Mutex<Value>,
    planner: Arc<Planner>,
    sensors: Vec<Arc<dyn Sensor>>,
    opts: AgentOpts,
    observer: Option<Arc<dyn Fn(Value) + Send + Sync>>,
    current: Mutex<Option<Arc<Runtime>>>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// Stops whichever runtime is currently active (if any), then starts a
    /// fresh one continuing from the last observed state toward `target`.
    pub async fn seek(&self, target: Value) -> Result<(), DriftError> {
        let mut current = self.current.lock().await;

        let initial_state = if let Some(runtime) = current.take() {
            let outcome = runtime.stop().await;
            match outcome {
                RuntimeOutcome::Success { state } => state,
                _ => runtime.state().await,
            }
        } else {
            self.last_state.lock().await.clone()
        };

        let runtime = Runtime::new(
            initial_state,
            target,
            self.planner.clone(),
            self.sensors.clone(),
            self.opts.clone(),
        );
        if let Some(observer) = &self.observer {
            runtime.set_observer(observer.clone()).await;
        }
        runtime.start().await;

        *self.last_state.lock().await = runtime.state().await;
        *current = Some(runtime);
        Ok(())
    }

    /// Awaits the active runtime's terminal outcome.
    pub async fn wait(&self, timeout: Option<std::time::Duration>) -> Result<RuntimeOutcome, RuntimeError> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(runtime) => runtime.wait(timeout).await,
            None => Err(RuntimeError::NotStarted),
        }
    }

    /// The current state: the active runtime's live state, or the last
    /// observed state if nothing has been started yet.
    pub async fn state(&self) -> Value {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(runtime) => runtime.state().await,
            None => self.last_state.lock().await.clone(),
        }
    }

    /// Stops the active runtime, if any, and returns its terminal outcome.
    pub async fn stop(&self) -> RuntimeOutcome {
        let mut current = self.current.lock().await;
        match current.take() {
            Some(runtime) => {
                let outcome = runtime.stop().await;
                *self.last_state.lock().await = runtime.state().await;
                *current = Some(runtime);
                outcome
            }
            None => RuntimeOutcome::Stopped,
        }
    }
}
