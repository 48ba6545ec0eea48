use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

/// Unique identifier for a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u32);

impl TimerId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Lifecycle of a timer event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// Waiting for its delay to elapse
    Scheduled,
    /// Picked up by a tick, waiting to be fired
    Due,
    /// Callback currently running
    Firing,
    /// One-shot that has fired; released by the next sweep
    Disposed,
}

/// A timer with its payload (the callback and its arguments)
#[derive(Debug)]
struct TimerEvent<P> {
    payload: P,
    delay: Duration,
    recurring: bool,
    started: Instant,
    phase: TimerPhase,
}

impl<P> TimerEvent<P> {
    fn is_due(&self, now: Instant) -> bool {
        self.phase == TimerPhase::Scheduled && now.duration_since(self.started) >= self.delay
    }
}

/// Table of pending timer events
///
/// The payload type is opaque here; the script context stores engine handles
/// in it and is responsible for releasing what [`TimerTable::cancel`],
/// [`TimerTable::sweep`] and [`TimerTable::clear`] hand back.
#[derive(Debug)]
pub struct TimerTable<P> {
    inner: Mutex<TableState<P>>,
}

#[derive(Debug)]
struct TableState<P> {
    events: BTreeMap<TimerId, TimerEvent<P>>,
    next_id: u32,
}

impl<P> TimerTable<P> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableState {
                events: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TableState<P>> {
        // A panic while holding the lock leaves the table itself consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a new event. Negative delays are treated as zero.
    pub fn schedule(&self, delay_ms: i64, recurring: bool, payload: P) -> TimerId {
        let mut state = self.state();

        let mut raw = state.next_id;
        while raw == 0 || state.events.contains_key(&TimerId(raw)) {
            raw = raw.wrapping_add(1);
        }
        state.next_id = raw.wrapping_add(1);

        let id = TimerId(raw);
        state.events.insert(
            id,
            TimerEvent {
                payload,
                delay: Duration::from_millis(delay_ms.max(0) as u64),
                recurring,
                started: Instant::now(),
                phase: TimerPhase::Scheduled,
            },
        );
        id
    }

    /// Remove an event, handing its payload back to the caller
    pub fn cancel(&self, id: TimerId) -> Option<P> {
        self.state().events.remove(&id).map(|event| event.payload)
    }

    /// Snapshot the ids of every event whose delay has elapsed and mark them due
    pub fn take_due(&self, now: Instant) -> Vec<TimerId> {
        let mut state = self.state();
        let mut due = Vec::new();
        for (id, event) in state.events.iter_mut() {
            if event.is_due(now) {
                event.phase = TimerPhase::Due;
                due.push(*id);
            }
        }
        due
    }

    /// Mark a due event as firing and clone what is needed to run it
    ///
    /// Returns `None` if the event was cancelled since it was found due.
    pub fn begin_fire<R>(&self, id: TimerId, f: impl FnOnce(&P) -> R) -> Option<R> {
        let mut state = self.state();
        let event = state.events.get_mut(&id)?;
        if event.phase != TimerPhase::Due {
            return None;
        }
        event.phase = TimerPhase::Firing;
        Some(f(&event.payload))
    }

    /// Apply the result of a fire: recurring events restart, one-shots are disposed
    ///
    /// `now` is the instant the event was found due. A recurring event's next
    /// period starts where the previous one ended, unless it has fallen a
    /// whole period behind, in which case it restarts from `now`. An event
    /// that was never started (still `Due`) goes back to `Scheduled` and fires
    /// on the next tick.
    pub fn finish_fire(&self, id: TimerId, now: Instant) {
        let mut state = self.state();
        let Some(event) = state.events.get_mut(&id) else {
            return;
        };
        match event.phase {
            TimerPhase::Due => event.phase = TimerPhase::Scheduled,
            TimerPhase::Firing if event.recurring => {
                let next = event.started + event.delay;
                event.started = if now.saturating_duration_since(next) >= event.delay {
                    now
                } else {
                    next
                };
                event.phase = TimerPhase::Scheduled;
            }
            TimerPhase::Firing => event.phase = TimerPhase::Disposed,
            TimerPhase::Scheduled | TimerPhase::Disposed => {}
        }
    }

    pub fn has_disposed(&self) -> bool {
        self.state()
            .events
            .values()
            .any(|event| event.phase == TimerPhase::Disposed)
    }

    /// Remove every disposed event, handing the payloads back
    pub fn sweep(&self) -> Vec<P> {
        let mut state = self.state();
        let disposed: Vec<TimerId> = state
            .events
            .iter()
            .filter(|(_, event)| event.phase == TimerPhase::Disposed)
            .map(|(id, _)| *id)
            .collect();

        disposed
            .into_iter()
            .filter_map(|id| state.events.remove(&id))
            .map(|event| event.payload)
            .collect()
    }

    /// Remove every event
    pub fn clear(&self) -> Vec<P> {
        let events = std::mem::take(&mut self.state().events);
        events.into_values().map(|event| event.payload).collect()
    }

    pub fn phase(&self, id: TimerId) -> Option<TimerPhase> {
        self.state().events.get(&id).map(|event| event.phase)
    }

    /// Get the number of events in the table
    pub fn active_count(&self) -> usize {
        self.state().events.len()
    }
}

impl<P> Default for TimerTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// What the tick loop drives
pub trait TimerHost: Send + Sync + 'static {
    /// Fire every due event and sweep disposed ones
    fn tick(&self, now: Instant);
}

/// Background thread that ticks a [`TimerHost`] at a fixed period
pub struct TimerScheduler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TimerScheduler {
    pub fn start<H: TimerHost>(host: Arc<H>, period: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("script-timers".to_string())
            .spawn(move || {
                debug!(target: "scripting", "Timer thread started ({}ms period)", period.as_millis());
                while !thread_stop.load(Ordering::SeqCst) {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        host.tick(Instant::now());
                    }));
                    if let Err(e) = result {
                        error!(target: "scripting", "Timer tick panicked: {:?}", e);
                    }
                    thread::park_timeout(period);
                }
                debug!(target: "scripting", "Timer thread stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Signal the tick thread and wait for it to exit
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.store(true, Ordering::SeqCst);
            handle.thread().unpark();
            if handle.join().is_err() {
                error!(target: "scripting", "Timer thread panicked during shutdown");
            }
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
