//! Waitable boolean gates that can be combined into derived gates (NOT, OR, AND) whose state
//! is kept in sync with their ancestors. Any thread may set/clear a base gate at any time:
//! the update cascades synchronously down to every derived gate before set()/clear() returns.
//!
//! Each gate owns a re-entrant lock held while it mutates its flag and notifies its
//! dependents. A derived gate can only register on gates that already exist, so the
//! ancestor -> dependent edges form a DAG. Locks are therefore always acquired from older to
//! younger gates and a cascade can neither cycle nor deadlock.
//!
//! Ancestors only keep weak references to their dependents (via the registered callbacks).
//! Dropping a derived gate unregisters it from all its ancestors.
pub mod combinator;

use crate::primitives::flag::Flag;
use crate::primitives::lock::Lock;
use self::combinator::*;
use slog::{Discard, Logger};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;

/// Usage errors. Those denote a programming mistake and are never transient.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Errors {
    #[error("gate {0} is already registered")]
    AlreadyRegistered(GateId),
    #[error("gate {0} is not registered")]
    NotRegistered(GateId),
    #[error("{0} gates can't be set or cleared directly")]
    Immutable(Combinator),
    #[error("derived gates need at least one ancestor")]
    NoAncestor,
}

use self::Errors::*;

/// Stable gate identity. Ids are allocated in construction order which means a dependent
/// always has a larger id than any of its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GateId(usize);

static SEQ: AtomicUsize = AtomicUsize::new(0);

impl GateId {
    #[inline]
    fn next() -> Self {
        GateId(SEQ.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    id: GateId,
    combinator: Combinator,
    lock: Lock,
    flag: Flag,
    dependents: Mutex<HashMap<GateId, (Callback, Callback)>>,
    ancestors: Vec<Arc<Inner>>,
    root: Logger,
    logger: Logger,
}

impl Inner {
    fn new(combinator: Combinator, ancestors: Vec<Arc<Inner>>, root: Logger) -> Self {
        let id = GateId::next();
        let logger = root.new(o!("gate" => id.0, "kind" => combinator.name()));
        Inner {
            id,
            combinator,
            lock: Lock::new(),
            flag: Flag::new(),
            dependents: Mutex::new(HashMap::new()),
            ancestors,
            root,
            logger,
        }
    }

    fn raise(&self) -> () {
        let _guard = self.lock.lock();
        self.flag.set();

        //
        // - notify our dependents while still holding our lock
        // - each callback locks a younger gate, we can't deadlock
        //
        let callbacks = self.snapshot();
        trace!(&self.logger, "set"; "dependents" => callbacks.len());
        for (on_set, _) in callbacks {
            on_set();
        }
    }

    fn lower(&self) -> () {
        let _guard = self.lock.lock();
        self.flag.clear();

        let callbacks = self.snapshot();
        trace!(&self.logger, "clear"; "dependents" => callbacks.len());
        for (_, on_clear) in callbacks {
            on_clear();
        }
    }

    fn register(&self, registrant: GateId, on_set: Callback, on_clear: Callback) -> Result<(), Errors> {
        let _guard = self.lock.lock();
        debug_assert!(registrant > self.id);
        let mut dependents = self.table();
        if dependents.contains_key(&registrant) {
            return Err(AlreadyRegistered(registrant));
        }

        dependents.insert(registrant, (on_set, on_clear));
        trace!(&self.logger, "registered"; "dependent" => registrant.0);
        Ok(())
    }

    fn unregister(&self, registrant: GateId) -> Result<(), Errors> {
        let _guard = self.lock.lock();
        match self.table().remove(&registrant) {
            Some(_) => {
                trace!(&self.logger, "unregistered"; "dependent" => registrant.0);
                Ok(())
            }
            None => Err(NotRegistered(registrant)),
        }
    }

    fn on_ancestor_set(&self) -> () {

        //
        // - hold our lock while re-checking our ancestors so that the
        //   check and the resulting transition are atomic
        // - raise()/lower() will re-enter the lock
        //
        let _guard = self.lock.lock();
        let transition = self.combinator.on_ancestor_set(self.states());
        self.apply(transition);
    }

    fn on_ancestor_clear(&self) -> () {
        let _guard = self.lock.lock();
        let transition = self.combinator.on_ancestor_clear(self.states());
        self.apply(transition);
    }

    #[inline]
    fn apply(&self, transition: Transition) -> () {
        match transition {
            Transition::Set => self.raise(),
            Transition::Clear => self.lower(),
            Transition::Keep => {}
        }
    }

    #[inline]
    fn states(&self) -> impl Iterator<Item = bool> + '_ {
        self.ancestors.iter().map(|ancestor| ancestor.flag.is_set())
    }

    #[inline]
    fn snapshot(&self) -> Vec<(Callback, Callback)> {
        self.table().values().cloned().collect()
    }

    #[inline]
    fn table(&self) -> MutexGuard<'_, HashMap<GateId, (Callback, Callback)>> {
        self.dependents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owning handle on a gate. Base gates are set/cleared by the application while derived gates
/// track their ancestors. Share it across threads with an `Arc`.
pub struct Gate {
    inner: Arc<Inner>,
    destructed: AtomicBool,
}

/// Guard setting its (base) gate upon dropping. This is handy to signal a gate when a worker
/// thread is done, whether it returns or unwinds.
pub struct Guard(Arc<Gate>);

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// New base gate, initially clear.
    #[inline]
    pub fn new() -> Self {
        Gate::with_logger(&Logger::root(Discard, o!()))
    }

    #[inline]
    pub fn with_logger(logger: &Logger) -> Self {
        let inner = Inner::new(Combinator::Base, Vec::new(), logger.clone());
        debug!(&inner.logger, "created");
        Gate {
            inner: Arc::new(inner),
            destructed: AtomicBool::new(false),
        }
    }

    /// Gate set whenever `ancestor` is clear and vice versa.
    #[inline]
    pub fn not(ancestor: &Gate) -> Result<Self, Errors> {
        Gate::combine(Combinator::Not, &[ancestor])
    }

    /// Gate set whenever at least one of `ancestors` is set.
    #[inline]
    pub fn any(ancestors: &[&Gate]) -> Result<Self, Errors> {
        Gate::combine(Combinator::Any, ancestors)
    }

    /// Gate set whenever all the `ancestors` are set.
    #[inline]
    pub fn all(ancestors: &[&Gate]) -> Result<Self, Errors> {
        Gate::combine(Combinator::All, ancestors)
    }

    fn combine(combinator: Combinator, ancestors: &[&Gate]) -> Result<Self, Errors> {
        let first = match ancestors.first() {
            Some(gate) => gate,
            None => return Err(NoAncestor),
        };

        let inner = Arc::new(Inner::new(
            combinator,
            ancestors.iter().map(|gate| gate.inner.clone()).collect(),
            first.inner.root.clone(),
        ));

        //
        // - register on each ancestor with callbacks only holding a weak
        //   reference on us
        // - we do *not* hold our own lock at this point: it would be acquired
        //   before the ancestor locks which is the wrong order
        // - if anything fails undo the registrations done so far
        //
        let id = inner.id;
        for (n, ancestor) in inner.ancestors.iter().enumerate() {
            let on_set: Callback = {
                let this = Arc::downgrade(&inner);
                Arc::new(move || {
                    if let Some(gate) = Weak::upgrade(&this) {
                        gate.on_ancestor_set();
                    }
                })
            };
            let on_clear: Callback = {
                let this = Arc::downgrade(&inner);
                Arc::new(move || {
                    if let Some(gate) = Weak::upgrade(&this) {
                        gate.on_ancestor_clear();
                    }
                })
            };

            if let Err(err) = ancestor.register(id, on_set, on_clear) {
                for done in &inner.ancestors[..n] {
                    let _ = done.unregister(id);
                }
                return Err(err);
            }
        }

        //
        // - evaluate our initial state under our lock
        // - any callback racing with us will wait and then re-apply its rule
        //   on top of this evaluation
        //
        {
            let _guard = inner.lock.lock();
            if combinator.evaluate(inner.states()) {
                inner.raise();
            }
        }

        debug!(&inner.logger, "created";
            "ancestors" => inner.ancestors.len(),
            "set" => inner.flag.is_set());

        Ok(Gate {
            inner,
            destructed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn id(&self) -> GateId {
        self.inner.id
    }

    #[inline]
    pub fn combinator(&self) -> Combinator {
        self.inner.combinator
    }

    /// Number of gates currently registered on this one.
    #[inline]
    pub fn dependents(&self) -> usize {
        self.inner.table().len()
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.inner.flag.is_set()
    }

    /// Sets the gate and synchronously updates all its dependents. This always notifies the
    /// dependents, even if the gate was set already.
    pub fn set(&self) -> Result<(), Errors> {
        self.check_mutable()?;
        self.inner.raise();
        Ok(())
    }

    /// Clears the gate and synchronously updates all its dependents.
    pub fn clear(&self) -> Result<(), Errors> {
        self.check_mutable()?;
        self.inner.lower();
        Ok(())
    }

    /// Blocks until the gate is set or the timeout elapses (forever if `None`). Returns true
    /// if the gate was observed set.
    #[inline]
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.inner.flag.wait(timeout)
    }

    /// Detaches a derived gate from its ancestors. It stops tracking them and keeps its last
    /// state. Invoking it twice fails with `NotRegistered`. This is a no-op for base gates.
    pub fn destruct(&self) -> Result<(), Errors> {
        self.destructed.store(true, Ordering::Release);
        for ancestor in &self.inner.ancestors {
            ancestor.unregister(self.inner.id)?;
        }

        if self.inner.combinator.is_derived() {
            debug!(&self.inner.logger, "destructed");
        }
        Ok(())
    }

    /// Returns a guard setting `gate` upon dropping. Only base gates can be guarded.
    pub fn guard(gate: &Arc<Gate>) -> Result<Guard, Errors> {
        gate.check_mutable()?;
        Ok(Guard(gate.clone()))
    }

    #[inline]
    fn check_mutable(&self) -> Result<(), Errors> {
        match self.inner.combinator {
            Combinator::Base => Ok(()),
            combinator => Err(Immutable(combinator)),
        }
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("id", &self.inner.id)
            .field("combinator", &self.inner.combinator)
            .field("set", &self.is_set())
            .finish()
    }
}

impl Drop for Gate {
    fn drop(&mut self) -> () {

        //
        // - unregister from our ancestors unless destruct() was invoked already
        // - nothing can be reported from here
        //
        if !self.destructed.swap(true, Ordering::AcqRel) {
            for ancestor in &self.inner.ancestors {
                let _ = ancestor.unregister(self.inner.id);
            }
        }
    }
}

impl Guard {
    #[inline]
    pub fn gate(&self) -> &Gate {
        &self.0
    }
}

impl Drop for Guard {
    fn drop(&mut self) -> () {
        let _ = self.0.set();
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use rand::{thread_rng, Rng};
    use std::thread;
    use std::time::Instant;

    fn noop() -> Callback {
        Arc::new(|| {})
    }

    #[test]
    fn base_gate_tracks_last_call() {

        let gate = Gate::new();
        assert!(!gate.is_set());
        for _ in 0..16 {
            let up = thread_rng().gen::<bool>();
            if up {
                gate.set().unwrap();
            } else {
                gate.clear().unwrap();
            }
            assert_eq!(gate.is_set(), up);
        }
    }

    #[test]
    fn not_gate() {

        let a = Gate::new();
        let not_a = Gate::not(&a).unwrap();
        assert!(not_a.is_set());
        a.set().unwrap();
        assert!(!not_a.is_set());
        a.set().unwrap();
        assert!(!not_a.is_set());
        a.clear().unwrap();
        assert!(not_a.is_set());

        a.set().unwrap();
        let not_set = Gate::not(&a).unwrap();
        assert!(!not_set.is_set());
    }

    #[test]
    fn any_gate() {

        let a = Gate::new();
        let b = Gate::new();
        let any_ab = Gate::any(&[&a, &b]).unwrap();
        assert!(!any_ab.is_set());
        a.set().unwrap();
        assert!(any_ab.is_set());
        b.set().unwrap();
        assert!(any_ab.is_set());
        a.clear().unwrap();
        assert!(any_ab.is_set());
        b.clear().unwrap();
        assert!(!any_ab.is_set());
    }

    #[test]
    fn all_gate() {

        let a = Gate::new();
        let b = Gate::new();
        let all_ab = Gate::all(&[&a, &b]).unwrap();
        assert!(!all_ab.is_set());
        a.set().unwrap();
        assert!(!all_ab.is_set());
        b.set().unwrap();
        assert!(all_ab.is_set());
        a.clear().unwrap();
        assert!(!all_ab.is_set());
        a.set().unwrap();
        assert!(all_ab.is_set());
        b.clear().unwrap();
        assert!(!all_ab.is_set());
    }

    #[test]
    fn initial_state_follows_ancestors() {

        let a = Gate::new();
        let b = Gate::new();
        a.set().unwrap();
        assert!(Gate::any(&[&a, &b]).unwrap().is_set());
        assert!(!Gate::all(&[&a, &b]).unwrap().is_set());
        b.set().unwrap();
        assert!(Gate::all(&[&a, &b]).unwrap().is_set());
    }

    #[test]
    fn chained_composition() {

        //
        // - (a || b) && c over the whole truth table
        //
        let a = Gate::new();
        let b = Gate::new();
        let c = Gate::new();
        let any_ab = Gate::any(&[&a, &b]).unwrap();
        let gate = Gate::all(&[&any_ab, &c]).unwrap();
        for n in 0..8 {
            for (k, g) in [&a, &b, &c].iter().enumerate() {
                if n & (1 << k) > 0 {
                    g.set().unwrap();
                } else {
                    g.clear().unwrap();
                }
            }
            assert_eq!(
                gate.is_set(),
                (a.is_set() || b.is_set()) && c.is_set(),
                "n = {}",
                n
            );
        }
    }

    #[test]
    fn double_negation() {

        let a = Gate::new();
        let not_a = Gate::not(&a).unwrap();
        let not_not_a = Gate::not(&not_a).unwrap();
        assert!(!not_not_a.is_set());
        a.set().unwrap();
        assert!(not_not_a.is_set());
        a.clear().unwrap();
        assert!(!not_not_a.is_set());
    }

    #[test]
    fn derived_gates_are_immutable() {

        let a = Gate::new();
        let not_a = Gate::not(&a).unwrap();
        let any_a = Gate::any(&[&a]).unwrap();
        let all_a = Gate::all(&[&a]).unwrap();
        assert_eq!(not_a.set(), Err(Immutable(Combinator::Not)));
        assert_eq!(not_a.clear(), Err(Immutable(Combinator::Not)));
        assert_eq!(any_a.set(), Err(Immutable(Combinator::Any)));
        assert_eq!(all_a.clear(), Err(Immutable(Combinator::All)));
        assert!(not_a.is_set());
        assert!(!any_a.is_set());

        let any_a = Arc::new(any_a);
        assert!(Gate::guard(&any_a).is_err());
    }

    #[test]
    fn no_ancestor() {

        assert_eq!(Gate::any(&[]).unwrap_err(), NoAncestor);
        assert_eq!(Gate::all(&[]).unwrap_err(), NoAncestor);
    }

    #[test]
    fn duplicate_ancestor_is_rolled_back() {

        let a = Gate::new();
        let b = Gate::new();
        match Gate::any(&[&b, &a, &a]) {
            Err(AlreadyRegistered(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.dependents(), 0);
        assert_eq!(b.dependents(), 0);
    }

    #[test]
    fn double_registration() {

        let a = Gate::new();
        let b = Gate::new();
        a.inner.register(b.id(), noop(), noop()).unwrap();
        assert_eq!(a.inner.register(b.id(), noop(), noop()), Err(AlreadyRegistered(b.id())));
        assert_eq!(a.dependents(), 1);
        a.inner.unregister(b.id()).unwrap();
        assert_eq!(a.inner.unregister(b.id()), Err(NotRegistered(b.id())));
        assert_eq!(a.dependents(), 0);
    }

    #[test]
    fn callbacks_fire_on_every_call() {

        let a = Gate::new();
        let b = Gate::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            let on_set: Callback = Arc::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            });
            a.inner.register(b.id(), on_set, noop()).unwrap();
        }

        a.set().unwrap();
        a.set().unwrap();
        a.set().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        a.inner.unregister(b.id()).unwrap();
        a.set().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn double_destruct() {

        let a = Gate::new();
        let b = Gate::new();
        let any_ab = Gate::any(&[&a, &b]).unwrap();
        let other = Gate::not(&a).unwrap();
        assert_eq!(a.dependents(), 2);
        any_ab.destruct().unwrap();
        assert_eq!(any_ab.destruct(), Err(NotRegistered(any_ab.id())));
        assert_eq!(a.dependents(), 1);
        assert_eq!(b.dependents(), 0);

        //
        // - the destructed gate is frozen
        // - the remaining dependent is unaffected
        //
        a.set().unwrap();
        assert!(!any_ab.is_set());
        assert!(!other.is_set());

        assert!(a.destruct().is_ok());
        assert!(a.destruct().is_ok());
    }

    #[test]
    fn drop_unregisters() {

        let a = Gate::new();
        {
            let _not_a = Gate::not(&a).unwrap();
            let _any_a = Gate::any(&[&a]).unwrap();
            assert_eq!(a.dependents(), 2);
        }

        assert_eq!(a.dependents(), 0);

        let all_a = Gate::all(&[&a]).unwrap();
        all_a.destruct().unwrap();
        drop(all_a);
        assert_eq!(a.dependents(), 0);
    }

    #[test]
    fn ancestors_outlive_their_handle() {

        //
        // - drop the handle of the base gate
        // - the derived gate still holds on its internals
        //
        let a = Gate::new();
        let not_a = Gate::not(&a).unwrap();
        drop(a);
        assert!(not_a.is_set());
        assert!(not_a.destruct().is_ok());
    }

    #[test]
    fn wait_on_set_gate() {

        let a = Gate::new();
        a.set().unwrap();
        let now = Instant::now();
        assert!(a.wait(Some(Duration::from_secs(10))));
        assert!(a.wait(None));
        assert!(now.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out() {

        let a = Gate::new();
        let now = Instant::now();
        assert!(!a.wait(Some(Duration::from_millis(100))));
        let elapsed = now.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn wait_through_cascade() {

        let a = Arc::new(Gate::new());
        let b = Arc::new(Gate::new());
        let c = Arc::new(Gate::new());
        let any_ab = Gate::any(&[&*a, &*b]).unwrap();
        let gate = Arc::new(Gate::all(&[&any_ab, &*c]).unwrap());

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait(Some(Duration::from_secs(10))))
        };

        thread::sleep(Duration::from_millis(20));
        b.set().unwrap();
        c.set().unwrap();
        assert!(waiter.join().unwrap());
        assert!(gate.is_set());
    }

    #[test]
    fn guards_set_on_drop() {

        let workers: Vec<_> = (0..8).map(|_| Arc::new(Gate::new())).collect();
        let all = {
            let refs: Vec<&Gate> = workers.iter().map(|gate| gate.as_ref()).collect();
            Gate::all(&refs).unwrap()
        };

        let mut threads = Vec::new();
        for gate in &workers {
            let guard = Gate::guard(gate).unwrap();
            threads.push(thread::spawn(move || {
                thread::sleep(Duration::from_millis(thread_rng().gen_range(0..20)));
                assert!(!guard.gate().is_set());
                drop(guard);
            }));
        }

        assert!(all.wait(Some(Duration::from_secs(10))));
        for tid in threads {
            tid.join().unwrap();
        }
    }

    #[test]
    fn concurrent_toggles_converge() {

        let a = Arc::new(Gate::new());
        let b = Arc::new(Gate::new());
        let c = Arc::new(Gate::new());
        let any_ab = Gate::any(&[&*a, &*b]).unwrap();
        let all_abc = Gate::all(&[&*a, &*b, &*c]).unwrap();
        let not_c = Gate::not(&c).unwrap();
        let gate = Gate::any(&[&all_abc, &not_c]).unwrap();

        let mut threads = Vec::new();
        for base in &[&a, &b, &c] {
            let base = Arc::clone(base);
            threads.push(thread::spawn(move || {
                let mut rng = thread_rng();
                for _ in 0..512 {
                    if rng.gen::<bool>() {
                        base.set().unwrap();
                    } else {
                        base.clear().unwrap();
                    }
                }
            }));
        }

        for tid in threads {
            tid.join().unwrap();
        }

        let (a, b, c) = (a.is_set(), b.is_set(), c.is_set());
        assert_eq!(any_ab.is_set(), a || b);
        assert_eq!(all_abc.is_set(), a && b && c);
        assert_eq!(not_c.is_set(), !c);
        assert_eq!(gate.is_set(), (a && b && c) || !c);
    }

    #[test]
    fn concurrent_construction_does_not_deadlock() {

        //
        // - build/drop any(not(b), b) while b keeps toggling
        // - registering on not(b) then b while a cascade runs from b through
        //   not(b) must not deadlock
        //
        let b = Arc::new(Gate::new());
        let not_b = Arc::new(Gate::not(&b).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let toggler = {
            let b = b.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut rng = thread_rng();
                while !done.load(Ordering::Relaxed) {
                    if rng.gen::<bool>() {
                        b.set().unwrap();
                    } else {
                        b.clear().unwrap();
                    }
                }
            })
        };

        let mut gates = Vec::new();
        for _ in 0..256 {
            gates.push(Gate::any(&[&*not_b, &*b]).unwrap());
            if gates.len() > 8 {
                gates.remove(0);
            }
        }

        done.store(true, Ordering::Relaxed);
        toggler.join().unwrap();
        for gate in &gates {
            assert!(gate.is_set());
        }
        assert_eq!(not_b.is_set(), !b.is_set());
        assert_eq!(b.dependents(), gates.len() + 1);
    }

    #[test]
    fn gates_log_through_their_logger() {

        let log = Logger::root(Discard, o!("sys" => "test"));
        let a = Gate::with_logger(&log);
        let b = Gate::not(&a).unwrap();
        a.set().unwrap();
        assert!(!b.is_set());
        assert_eq!(format!("{}", Immutable(Combinator::Not)), "not gates can't be set or cleared directly");
        assert!(format!("{:?}", b).contains("Not"));
    }
}
