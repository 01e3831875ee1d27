//! Restartable single-shot timer used to abort stalled upstream calls
//!
//! A [`Watchdog`] fires its `on_timeout` callback once if it is not reset or
//! cancelled within its window. Every (re)arm bumps a generation counter; a
//! timer task only fires when its generation is still current, so a reset can
//! never let both the old and the new deadline fire.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Callback invoked when the watchdog expires
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// Cloneable handle to a single watchdog timer
///
/// Clones share the same timer. The handle must be used from within a Tokio
/// runtime since arming the timer spawns a task.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
}

struct State {
    window: Duration,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    on_timeout: Option<TimeoutCallback>,
    fired: bool,
}

impl Watchdog {
    /// Create an inactive watchdog with the given window
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    window,
                    generation: 0,
                    timer: None,
                    on_timeout: None,
                    fired: false,
                }),
            }),
        }
    }

    /// Create a watchdog and arm it immediately
    pub fn started<F>(window: Duration, on_timeout: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let watchdog = Self::new(window);
        watchdog.set_on_timeout(on_timeout);
        watchdog.reset();
        watchdog
    }

    /// Assign the expiry callback
    ///
    /// The callback runs while the watchdog's internal lock is held, so it
    /// must not call back into this watchdog.
    pub fn set_on_timeout<F>(&self, on_timeout: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().on_timeout = Some(Arc::new(on_timeout));
    }

    /// Arm the timer with a new window, replacing any pending deadline
    pub fn start(&self, window: Duration) {
        let mut state = self.inner.lock();
        state.window = window;
        self.arm(&mut state);
    }

    /// Cancel the pending deadline and start a fresh one with the current window
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        self.arm(&mut state);
    }

    /// Cancel the pending deadline. Safe to call when inactive.
    ///
    /// Once this returns the callback will not fire for the cancelled activation.
    pub fn cancel(&self) {
        let mut state = self.inner.lock();
        Self::disarm(&mut state);
    }

    /// Expire immediately: cancel the pending deadline and invoke the callback
    pub fn time_out(&self) {
        let mut state = self.inner.lock();
        Self::disarm(&mut state);
        Self::fire(&mut state);
    }

    /// Whether a deadline is currently pending
    pub fn is_active(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    /// Whether the callback has fired at least once
    pub fn has_fired(&self) -> bool {
        self.inner.lock().fired
    }

    /// The configured window
    pub fn window(&self) -> Duration {
        self.inner.lock().window
    }

    fn arm(&self, state: &mut State) {
        Self::disarm(state);

        let generation = state.generation;
        let window = state.window;
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(generation);
            }
        }));
    }

    fn disarm(state: &mut State) {
        state.generation = state.generation.wrapping_add(1);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    fn fire(state: &mut State) {
        state.fired = true;
        if let Some(callback) = state.on_timeout.clone() {
            callback();
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation || state.timer.is_none() {
            return;
        }

        // The timer task is the one running this code; drop its handle without aborting.
        state.timer = None;
        state.generation = state.generation.wrapping_add(1);
        Watchdog::fire(&mut state);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Watchdog")
            .field("window", &state.window)
            .field("active", &state.timer.is_some())
            .field("fired", &state.fired)
            .finish()
    }
}
