//! One-shot latch guarding the patch pass
//!
//! The latch moves `Uninitialized -> InProgress -> Done` exactly once. The
//! caller winning the transition runs the pass, concurrent callers block
//! until it reaches `Done` and later callers return straight away.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};

const UNINITIALIZED: u8 = 0;
const IN_PROGRESS: u8 = 1;
const DONE: u8 = 2;

/// Observable state of an [`InitLatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    InProgress,
    Done,
}

pub struct InitLatch {
    state: AtomicU8,
    lock: Mutex<()>,
    done: Condvar,
}

impl InitLatch {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            lock: Mutex::new(()),
            done: Condvar::new(),
        }
    }

    pub fn state(&self) -> InitState {
        match self.state.load(Ordering::Acquire) {
            UNINITIALIZED => InitState::Uninitialized,
            IN_PROGRESS => InitState::InProgress,
            _ => InitState::Done,
        }
    }

    /// Runs `action` if no other caller has, returning whether this call ran
    /// it. Returns only once the action has completed, whichever caller ran
    /// it. The latch still completes if `action` panics
    pub fn run<F: FnOnce()>(&self, action: F) -> bool {
        if self
            .state
            .compare_exchange(UNINITIALIZED, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.wait();
            return false;
        }

        let _complete = Complete(self);
        action();
        true
    }

    /// Blocks until the latch reaches `Done`
    pub fn wait(&self) {
        let mut guard = self.lock.lock();
        while self.state.load(Ordering::Acquire) != DONE {
            self.done.wait(&mut guard);
        }
    }

    fn complete(&self) {
        {
            let _guard = self.lock.lock();
            self.state.store(DONE, Ordering::Release);
        }
        self.done.notify_all();
    }
}

impl Default for InitLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the latch done when the running action ends
struct Complete<'a>(&'a InitLatch);

impl Drop for Complete<'_> {
    fn drop(&mut self) {
        self.0.complete();
    }
}
