//! driftctl: an autonomous reconfiguration agent core.
//!
//! An HTN planner ([`planner`]) diffs a current state against a declared
//! target and searches for a sequence of tasks that closes the gap; a
//! control loop ([`runtime`]) executes the resulting plan, replans on
//! drift or sensor input, and retries under backoff until the target holds
//! or the agent gives up. [`agent`] is the façade most callers should
//! start from:
//!
//! ```rust,ignore
//! use driftctl::{Agent, Task, TaskOp};
//! use serde_json::json;
//!
//! let scale_up = Task::new("scale-up")
//!     .lens("/replicas")
//!     .op(TaskOp::Update)
//!     .action(
//!         |state, ctx| { /* pure effect, used while planning */ state },
//!         |state, ctx| async move {
//!             /* impure action, used at execution time */
//!             Ok(state) // Err(cause) surfaces as a recoverable ActionRunFailed
//!         },
//!     );
//!
//! let agent = Agent::builder()
//!     .initial(json!({"replicas": 1}))
//!     .tasks(vec![scale_up])
//!     .build()?;
//!
//! agent.seek(json!({"replicas": 3})).await?;
//! agent.wait(None).await?;
//! # Ok::<(), driftctl::DriftError>(())
//! ```
//!
//! Module map: [`path`] (RFC-6901-ish pointers), [`lens`] (templated
//! path matching), [`diff`] (current/target → pending ops), [`task`]
//! (task/instruction definitions and the registry), [`dag`] (the plan
//! graph), [`planner`] (the search), [`runtime`] (the control loop),
//! [`sensor`] (subscribable external state mutation), [`agent`] (the
//! façade), [`error`] (the crate-wide error taxonomy), and, behind the
//! `config` feature, [`config`] (loading [`runtime::AgentOpts`] from a
//! file).

pub mod agent;
pub mod dag;
pub mod diff;
pub mod error;
pub mod lens;
pub mod path;
pub mod planner;
pub mod runtime;
pub mod sensor;
pub mod task;

#[cfg(feature = "config")]
pub mod config;

pub use agent::{Agent, AgentBuilder};
pub use diff::Op;
pub use error::{DriftError, DriftResult, RuntimeError};
pub use lens::Context;
pub use path::Path;
pub use planner::{PlanFailure, PlanOutcome, PlanResult, PlanStats, Planner};
pub use runtime::{AgentOpts, Runtime, RuntimeOutcome};
pub use sensor::{Sensor, SensorHandle, SharedState};
pub use task::{ExpansionMode, Instruction, Registry, Task, TaskBuilder, TaskOp};

#[cfg(feature = "config")]
pub use config::{load_opts, ConfigError};
