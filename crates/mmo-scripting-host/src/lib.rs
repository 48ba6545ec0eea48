//! Embedded sandbox for user-authored client scripts
//!
//! Each [`ScriptContext`] owns an isolated JavaScript runtime with a small
//! `Script` builtin namespace, a timer table driven by its own tick thread, a
//! hidden dialect compiler and a wall-clock bound on every unit of script work.

pub mod bridge;
pub mod config;
pub mod context;
pub mod dialect;
pub mod error;
pub mod handle;
pub mod json;
pub mod namespace;
pub mod timer;
pub mod value;
pub mod watchdog;

pub use bridge::PrintSink;
pub use config::{ConfigLoadError, DialectConfig, SandboxConfig};
pub use context::{ErrorHook, ScriptContext, ScriptContextBuilder};
pub use error::{ErrorKind, ExecutionOutcome, ScriptError, EXECUTION_LIMIT_MESSAGE};
pub use timer::{TimerId, TimerPhase};
pub use value::ScriptValue;
pub use watchdog::{max_execution_time_ms, DEFAULT_MAX_EXECUTION_TIME_MS};
