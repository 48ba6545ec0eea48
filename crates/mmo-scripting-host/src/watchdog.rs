//! Wall-clock bound for script work
//!
//! Every unit of script work (a direct execution or a timer callback) runs on
//! a worker thread while the caller waits with a deadline. The deadline starts
//! when the worker has entered the engine, so time spent waiting for the
//! context lock is not counted. When the deadline passes first, the run's
//! [`CancelToken`] is tripped; the engine observes it from its interrupt hook
//! at the next safepoint and unwinds. The caller then joins the worker, so no
//! execution outlives the call.
//!
//! Aborting is best-effort: a long-running native call without safepoints is
//! only interrupted once it returns to the interpreter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::ScriptError;

/// Default execution bound (5 seconds)
pub const DEFAULT_MAX_EXECUTION_TIME_MS: u64 = 5000;

static MAX_EXECUTION_TIME_MS: AtomicU64 = AtomicU64::new(DEFAULT_MAX_EXECUTION_TIME_MS);

/// Set the process-wide execution bound. `0` disables it.
pub fn set_max_execution_time(millis: u64) {
    MAX_EXECUTION_TIME_MS.store(millis, Ordering::SeqCst);
}

/// Current process-wide execution bound in milliseconds
pub fn max_execution_time_ms() -> u64 {
    MAX_EXECUTION_TIME_MS.load(Ordering::SeqCst)
}

/// Resolve a bound from a per-context override and the process-wide default
pub fn effective_bound(override_bound: Option<Duration>) -> Option<Duration> {
    let bound = override_bound.unwrap_or_else(|| Duration::from_millis(max_execution_time_ms()));
    if bound.is_zero() {
        None
    } else {
        Some(bound)
    }
}

/// Cancellation flag carried by a single run
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The token of the run currently inside the engine
///
/// Written only while the context lock is held; read from the engine's
/// interrupt hook and by `terminate()`.
#[derive(Debug, Default)]
pub struct ActiveRun {
    current: Mutex<Option<CancelToken>>,
}

impl ActiveRun {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `token` as the running unit until the guard is dropped
    pub fn install(&self, token: CancelToken) -> ActiveRunGuard<'_> {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(token);
        }
        ActiveRunGuard { active: self }
    }

    /// Polled by the engine at safepoints
    pub fn should_interrupt(&self) -> bool {
        self.current
            .lock()
            .map(|current| current.as_ref().is_some_and(CancelToken::is_cancelled))
            .unwrap_or(false)
    }

    /// Trip the running unit's token, if any. Returns whether something was running.
    pub fn terminate(&self) -> bool {
        match self.current.lock() {
            Ok(current) => match current.as_ref() {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

enum Progress {
    Entered,
    Finished,
}

/// Handed to the work run by [`run_bounded`]
pub struct BoundedRun {
    token: CancelToken,
    progress: mpsc::Sender<Progress>,
}

impl BoundedRun {
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Start the clock. Called once, when the work holds the engine.
    pub fn enter(&self) {
        let _ = self.progress.send(Progress::Entered);
    }
}

pub struct ActiveRunGuard<'a> {
    active: &'a ActiveRun,
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut current) = self.active.current.lock() {
            *current = None;
        }
    }
}

/// Run `work` on a worker thread, aborting it if `bound` elapses first
///
/// The bound counts from [`BoundedRun::enter`]; work that never enters is
/// never cancelled. `None` waits without limit. The worker is always joined
/// before this returns. If the worker panics the panic is reported as a
/// runtime error.
pub fn run_bounded<T, F>(bound: Option<Duration>, work: F) -> Result<T, ScriptError>
where
    T: Send,
    F: FnOnce(&BoundedRun) -> Result<T, ScriptError> + Send,
{
    let token = CancelToken::new();

    thread::scope(|scope| {
        let (progress_tx, progress_rx) = mpsc::channel::<Progress>();
        let run = BoundedRun {
            token: token.clone(),
            progress: progress_tx,
        };

        let worker = thread::Builder::new()
            .name("script-worker".to_string())
            .spawn_scoped(scope, move || {
                let result = work(&run);
                let _ = run.progress.send(Progress::Finished);
                result
            });

        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                return Err(ScriptError::runtime(format!(
                    "Failed to spawn script worker: {e}"
                )))
            }
        };

        if let Some(bound) = bound {
            // Work that finishes without entering is never timed
            if let Ok(Progress::Entered) = progress_rx.recv() {
                if let Err(mpsc::RecvTimeoutError::Timeout) = progress_rx.recv_timeout(bound) {
                    warn!(
                        target: "scripting",
                        "Script exceeded {}ms, requesting termination",
                        bound.as_millis()
                    );
                    token.cancel();
                }
            }
        }

        match worker.join() {
            Ok(result) => result,
            Err(_) => Err(ScriptError::runtime("Script worker panicked")),
        }
    })
}
