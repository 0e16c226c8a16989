//! Completion barrier
//!
//! A per-scope countdown bundled with a one-shot latch. The counter is set
//! to the number of immediate children when the scope is dispatched and is
//! only ever decremented. The decrement that takes it from one to zero, and
//! only that one, observes [`Decrement::Fired`].

use crate::types::ScopeRef;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Result of a single decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decrement {
    /// Children still outstanding
    Pending(usize),
    /// This caller completed the scope
    Fired,
    /// Counter was already at zero; logged and ignored
    Overrun,
}

impl Decrement {
    /// Whether this decrement completed the scope
    #[inline]
    #[must_use]
    pub fn fired(self) -> bool {
        matches!(self, Decrement::Fired)
    }

    /// Children still outstanding after this decrement
    #[inline]
    #[must_use]
    pub fn remaining(self) -> usize {
        match self {
            Decrement::Pending(n) => n,
            Decrement::Fired | Decrement::Overrun => 0,
        }
    }
}

/// Countdown with an exactly-once completion latch
#[derive(Debug)]
pub struct CompletionBarrier {
    scope: ScopeRef,
    expected: usize,
    remaining: AtomicUsize,
    fired: AtomicBool,
}

impl CompletionBarrier {
    /// Create barrier for `children` outstanding units
    #[inline]
    #[must_use]
    pub fn new(scope: ScopeRef, children: usize) -> Self {
        Self {
            scope,
            expected: children,
            remaining: AtomicUsize::new(children),
            fired: AtomicBool::new(false),
        }
    }

    /// Record completion of one child
    pub fn decrement(&self) -> Decrement {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => {
                if self.latch() {
                    Decrement::Fired
                } else {
                    tracing::error!(scope = %self.scope, "barrier latch already set at zero");
                    Decrement::Overrun
                }
            }
            Ok(n) => Decrement::Pending(n - 1),
            Err(_) => {
                tracing::error!(
                    scope = %self.scope,
                    expected = self.expected,
                    "barrier decremented past zero"
                );
                Decrement::Overrun
            }
        }
    }

    /// Fire a barrier that was created with no children
    ///
    /// Returns `true` for the single caller that sets the latch.
    pub fn fire_if_empty(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0 && self.latch()
    }

    /// Children still outstanding
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Children declared at dispatch time
    #[inline]
    #[must_use]
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Whether the completion latch is set
    #[inline]
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Scope this barrier guards
    #[inline]
    #[must_use]
    pub fn scope(&self) -> ScopeRef {
        self.scope
    }

    fn latch(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One-shot flag, set by exactly one caller
#[derive(Debug, Default)]
pub struct Latch(AtomicBool);

impl Latch {
    /// Create unset latch
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Set the latch; `true` only for the caller that set it
    #[inline]
    pub fn set(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the latch is set
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fires_on_last_decrement() {
        let barrier = CompletionBarrier::new(ScopeRef::Session, 3);

        assert_eq!(barrier.decrement(), Decrement::Pending(2));
        assert_eq!(barrier.decrement(), Decrement::Pending(1));
        assert_eq!(barrier.decrement(), Decrement::Fired);
        assert!(barrier.is_fired());
    }

    #[test]
    fn overrun_never_fires_twice() {
        let barrier = CompletionBarrier::new(ScopeRef::Common, 1);

        assert!(barrier.decrement().fired());
        assert_eq!(barrier.decrement(), Decrement::Overrun);
        assert_eq!(barrier.decrement(), Decrement::Overrun);
        assert_eq!(barrier.remaining(), 0);
    }

    #[test]
    fn empty_barrier_fires_once() {
        let barrier = CompletionBarrier::new(ScopeRef::Session, 0);

        assert!(barrier.fire_if_empty());
        assert!(!barrier.fire_if_empty());
        assert_eq!(barrier.decrement(), Decrement::Overrun);
    }

    #[test]
    fn non_empty_barrier_does_not_fire_early() {
        let barrier = CompletionBarrier::new(ScopeRef::Session, 2);
        assert!(!barrier.fire_if_empty());
        assert!(!barrier.is_fired());
    }

    #[test]
    fn concurrent_decrements_fire_exactly_once() {
        const THREADS: usize = 16;
        const PER_THREAD: usize = 500;

        let barrier = Arc::new(CompletionBarrier::new(ScopeRef::Session, THREADS * PER_THREAD));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .filter(|_| barrier.decrement().fired())
                        .count()
                })
            })
            .collect();

        let fired: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(fired, 1);
        assert_eq!(barrier.remaining(), 0);
    }

    #[test]
    fn latch_sets_once() {
        let latch = Latch::new();
        assert!(!latch.is_set());
        assert!(latch.set());
        assert!(!latch.set());
        assert!(latch.is_set());
    }

    proptest! {
        #[test]
        fn prop_exactly_one_fire_with_overruns(children in 0usize..64, extra in 0usize..8) {
            let barrier = CompletionBarrier::new(ScopeRef::Session, children);
            let mut fired = usize::from(barrier.fire_if_empty());
            for _ in 0..children + extra {
                if barrier.decrement().fired() {
                    fired += 1;
                }
            }
            prop_assert_eq!(fired, 1);
        }
    }
}
