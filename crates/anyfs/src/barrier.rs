//! Completion barrier for deferrable events.
//!
//! A [`Deferrals`] barrier lets event listeners delay the completion of the
//! operation that raised the event: each listener takes a [`Deferral`] token
//! while the barrier is still open, the producer then calls [`Deferrals::wait`],
//! and the wait resolves once every outstanding token has been completed.
//! Registration after the wait has begun is rejected rather than raced.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Dynamic fan-in synchronization for one raised event.
///
/// State machine: Open -> Waiting -> Resolved, with no transition back.
#[derive(Clone)]
pub struct Deferrals {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    resolved_tx: watch::Sender<bool>,
    resolved_rx: watch::Receiver<bool>,
}

struct State {
    waiting: bool,
    outstanding: HashSet<u64>,
    next_token: u64,
}

impl Default for Deferrals {
    fn default() -> Self {
        Self::new()
    }
}

impl Deferrals {
    pub fn new() -> Self {
        let (resolved_tx, resolved_rx) = watch::channel(false);
        Deferrals {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    waiting: false,
                    outstanding: HashSet::new(),
                    next_token: 0,
                }),
                resolved_tx,
                resolved_rx,
            }),
        }
    }

    /// Registers a new deferral token.
    ///
    /// Fails with a usage error once [`wait`](Self::wait) has been invoked,
    /// whether or not the barrier has already resolved.
    pub fn deferral(&self) -> Result<Deferral> {
        let mut state = self.inner.state.lock().expect("deferrals lock poisoned");
        if state.waiting {
            return Err(Error::usage("deferral requested after wait began"));
        }
        let token = state.next_token;
        state.next_token += 1;
        state.outstanding.insert(token);
        Ok(Deferral {
            inner: self.inner.clone(),
            token,
        })
    }

    /// Number of tokens not yet completed.
    pub fn outstanding(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("deferrals lock poisoned")
            .outstanding
            .len()
    }

    /// Transitions the barrier to Waiting and resolves once every
    /// outstanding token is completed. Resolves immediately when none are.
    pub async fn wait(&self) {
        {
            let mut state = self.inner.state.lock().expect("deferrals lock poisoned");
            state.waiting = true;
            if state.outstanding.is_empty() {
                let _ = self.inner.resolved_tx.send(true);
            }
        }
        let mut resolved = self.inner.resolved_rx.clone();
        loop {
            if *resolved.borrow_and_update() {
                return;
            }
            if resolved.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A token a listener holds to delay completion of an event.
///
/// Dropping an incomplete token counts as completion, so an abandoned or
/// panicked listener task cannot stall the operation forever.
pub struct Deferral {
    inner: Arc<Inner>,
    token: u64,
}

impl Deferral {
    /// Marks this token done. Idempotent: a second call is a no-op.
    pub fn complete(&self) {
        let mut state = self.inner.state.lock().expect("deferrals lock poisoned");
        if state.outstanding.remove(&self.token) && state.waiting && state.outstanding.is_empty() {
            let _ = self.inner.resolved_tx.send(true);
        }
    }
}

impl Drop for Deferral {
    fn drop(&mut self) {
        self.complete();
    }
}
