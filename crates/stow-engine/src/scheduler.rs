//! Debounced write scheduling
//!
//! Touches are coalesced into at most one write per minimum interval:
//!
//! - idle: schedule one write after `max(0, last_write + interval - now)`
//! - scheduled: absorbed by the pending write
//! - writing: the running write may already hold its snapshot, so one
//!   follow-up write is scheduled when it finishes
//!
//! Touches before [`PersistScheduler::mark_initialized`] are deferred. The
//! write itself runs under `spawn_blocking` on the engine's runtime; all
//! timing uses the tokio clock.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use stow_core::{CellId, TouchListener};
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::error::EngineError;

/// Target of scheduled writes
pub trait PersistSink: Send + Sync {
    /// Write the current state synchronously
    ///
    /// # Errors
    /// Any [`EngineError`]; the scheduler retries after the interval.
    fn persist(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scheduled,
    Writing,
}

#[derive(Debug)]
struct ScheduleState {
    initialized: bool,
    deferred: bool,
    phase: Phase,
    rerun: bool,
    closed: bool,
    last_write: Option<Instant>,
    scheduled_writes: u64,
    failed_writes: u64,
}

struct Inner {
    me: Weak<Inner>,
    state: Mutex<ScheduleState>,
    min_interval: Duration,
    runtime: Handle,
    sink: Weak<dyn PersistSink>,
}

/// Debounced, single-flight write scheduler
#[derive(Clone)]
pub struct PersistScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PersistScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistScheduler")
            .field("min_interval", &self.inner.min_interval)
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}

impl PersistScheduler {
    /// Create scheduler writing through `sink` on `runtime`
    #[must_use]
    pub fn new(min_interval: Duration, runtime: Handle, sink: Weak<dyn PersistSink>) -> Self {
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            state: Mutex::new(ScheduleState {
                initialized: false,
                deferred: false,
                phase: Phase::Idle,
                rerun: false,
                closed: false,
                last_write: None,
                scheduled_writes: 0,
                failed_writes: 0,
            }),
            min_interval,
            runtime,
            sink,
        });
        Self { inner }
    }

    /// Listener handle to attach to cells
    #[must_use]
    pub fn listener(&self) -> Weak<dyn TouchListener> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        weak
    }

    /// Signal that some persisted value changed
    pub fn touch(&self) {
        self.inner.touch();
    }

    /// Initial load finished; a deferred touch is flushed immediately
    pub fn mark_initialized(&self) {
        let mut state = self.inner.state.lock();
        state.initialized = true;
        if !std::mem::take(&mut state.deferred) || state.closed {
            return;
        }
        tracing::debug!("flushing touch deferred during initial load");
        match state.phase {
            Phase::Idle => {
                state.phase = Phase::Scheduled;
                drop(state);
                self.inner.spawn(Duration::ZERO);
            }
            Phase::Scheduled => {}
            Phase::Writing => state.rerun = true,
        }
    }

    /// Whether initial load has completed
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().initialized
    }

    /// Record a write performed outside the scheduler
    ///
    /// Satisfies a deferred touch and restarts the interval.
    pub fn note_forced_write(&self) {
        let mut state = self.inner.state.lock();
        state.last_write = Some(Instant::now());
        state.deferred = false;
    }

    /// Refuse further scheduled writes; pending ones become no-ops
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.deferred = false;
        state.rerun = false;
    }

    /// Whether [`close`](Self::close) was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Whether a write is scheduled, running, or deferred
    #[must_use]
    pub fn is_pending(&self) -> bool {
        let state = self.inner.state.lock();
        state.phase != Phase::Idle || state.deferred
    }

    /// Number of successful scheduled writes
    #[must_use]
    pub fn scheduled_writes(&self) -> u64 {
        self.inner.state.lock().scheduled_writes
    }

    /// Number of failed scheduled writes
    #[must_use]
    pub fn failed_writes(&self) -> u64 {
        self.inner.state.lock().failed_writes
    }

    /// Completion time of the last write, scheduled or forced
    #[must_use]
    pub fn last_write(&self) -> Option<Instant> {
        self.inner.state.lock().last_write
    }

    /// Configured minimum interval
    #[inline]
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.inner.min_interval
    }
}

impl Inner {
    fn delay(&self, state: &ScheduleState) -> Duration {
        state.last_write.map_or(Duration::ZERO, |last| {
            (last + self.min_interval).saturating_duration_since(Instant::now())
        })
    }

    fn touch(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if !state.initialized {
            state.deferred = true;
            return;
        }
        match state.phase {
            Phase::Idle => {
                let delay = self.delay(&state);
                state.phase = Phase::Scheduled;
                drop(state);
                tracing::debug!(delay_ms = delay.as_millis(), "write scheduled");
                self.spawn(delay);
            }
            Phase::Scheduled => {}
            Phase::Writing => state.rerun = true,
        }
    }

    fn spawn(&self, delay: Duration) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            this.fire().await;
        });
    }

    async fn fire(self: Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                state.phase = Phase::Idle;
                return;
            }
            state.phase = Phase::Writing;
            state.rerun = false;
        }

        let outcome = match self.sink.upgrade() {
            Some(sink) => match tokio::task::spawn_blocking(move || sink.persist()).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(join) => Err(join.to_string()),
            },
            None => Ok(()),
        };

        let mut state = self.state.lock();
        state.last_write = Some(Instant::now());
        state.phase = Phase::Idle;
        match outcome {
            Ok(()) => state.scheduled_writes += 1,
            Err(error) => {
                state.failed_writes += 1;
                state.rerun = true;
                tracing::warn!(%error, "scheduled write failed, retrying after interval");
            }
        }

        if std::mem::take(&mut state.rerun) && !state.closed {
            let delay = self.delay(&state);
            state.phase = Phase::Scheduled;
            drop(state);
            tracing::debug!(delay_ms = delay.as_millis(), "follow-up write scheduled");
            self.spawn(delay);
        }
    }
}

impl TouchListener for Inner {
    fn touched(&self, _cell: CellId) {
        self.touch();
    }
}
