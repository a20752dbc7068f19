//! A simple re-entrant lock built on a standard mutex/condvar pair. The owning thread may
//! invoke lock() again any number of times, each invokation returning a guard that must
//! drop before the lock is released. Contending threads park on the condition variable and
//! are awaken one at a time when the outermost guard drops.
//!
//! The lock does not own any data: it serializes a sequence of operations spanning several
//! fields (for instance a flag plus a table of callbacks) which may recurse into the same
//! object from the thread already holding it.
//!
//! Please note the lock tracks both its recursion depth and the count of pending threads,
//! which is handy for debugging or tests.
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
    pending: usize,
}

/// Re-entrant lock keyed on the owning thread id.
pub struct Lock {
    owner: Mutex<Owner>,
    cond: Condvar,
}

/// RAII guard releasing one level of the lock upon dropping. It is pinned to the thread
/// that acquired it (e.g it is neither Send nor Sync).
pub struct Guard<'a> {
    lock: &'a Lock,
    _pinned: PhantomData<*const ()>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    #[inline]
    pub fn new() -> Self {
        Lock {
            owner: Mutex::new(Owner {
                thread: None,
                depth: 0,
                pending: 0,
            }),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.state().depth
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.state().pending
    }

    #[inline]
    pub fn is_owned(&self) -> bool {
        self.state().thread == Some(thread::current().id())
    }

    pub fn lock(&self) -> Guard<'_> {
        let me = thread::current().id();
        let mut owner = self.state();
        loop {
            match owner.thread {
                None => {
                    owner.thread = Some(me);
                    owner.depth = 1;
                    break;
                }
                Some(id) if id == me => {
                    owner.depth += 1;
                    break;
                }
                Some(_) => {

                    //
                    // - another thread holds the lock
                    // - park on the condvar and loop back upon wakeup (which
                    //   may be spurious)
                    //
                    owner.pending += 1;
                    owner = self
                        .cond
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                    owner.pending -= 1;
                }
            }
        }

        Guard {
            lock: self,
            _pinned: PhantomData,
        }
    }

    fn unlock(&self) -> () {
        let mut owner = self.state();
        debug_assert!(owner.thread == Some(thread::current().id()));
        debug_assert!(owner.depth > 0);

        //
        // - release one level
        // - upon reaching zero reset the owner and wake one pending thread up
        //
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            if owner.pending > 0 {
                self.cond.notify_one();
            }
        }
    }

    #[inline]
    fn state(&self) -> MutexGuard<'_, Owner> {

        //
        // - the inner mutex is never held while running user code, a poisoned
        //   state is still consistent
        //
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<'a> Drop for Guard<'a> {
    fn drop(&mut self) -> () {
        self.lock.unlock();
    }
}
