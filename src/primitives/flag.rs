//! A manual-reset flag threads can block on. Setting the flag wakes all the parked threads
//! up and it remains set until cleared. The current state lives in an atomic bool so that
//! is_set() never blocks, while transitions are serialized by a mutex/condvar pair.
//!
//! Each set() also bumps an epoch counter. A thread waiting while the flag is set then
//! cleared right away will still return true: it did observe the flag set.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub struct Flag {
    state: AtomicBool,
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

impl Flag {
    #[inline]
    pub fn new() -> Self {
        Flag {
            state: AtomicBool::new(false),
            epoch: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self) -> () {
        let mut epoch = self.epoch();
        self.state.store(true, Ordering::Release);
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    #[inline]
    pub fn clear(&self) -> () {
        let _epoch = self.epoch();
        self.state.store(false, Ordering::Release);
    }

    /// Blocks until the flag is set or the timeout elapses (forever if `None`). Returns true
    /// if the flag was observed set.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.is_set() {
            return true;
        }

        //
        // - an overflowing deadline is the same as no deadline at all
        //
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut epoch = self.epoch();
        let start = *epoch;
        loop {

            //
            // - we hold the mutex, set() can't slip in between the check
            //   and the condvar wait
            // - a bumped epoch means we were set then cleared while parked
            //
            if self.is_set() || *epoch != start {
                return true;
            }

            epoch = match deadline {
                None => self
                    .cond
                    .wait(epoch)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (epoch, _) = self
                        .cond
                        .wait_timeout(epoch, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    epoch
                }
            };
        }
    }

    #[inline]
    fn epoch(&self) -> MutexGuard<'_, u64> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
