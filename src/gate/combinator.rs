//! Boolean combinators applied by derived gates to the states of their ancestors. Each
//! combinator knows how to evaluate its initial state and how to react to one of its
//! ancestors being set or cleared. The reaction is a transition the gate then applies to
//! itself (which may cascade further down).
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Combinator {
    /// Plain gate driven by the application, no ancestors.
    Base,
    /// Inverse of its single ancestor.
    Not,
    /// Logical OR over 1+ ancestors.
    Any,
    /// Logical AND over 1+ ancestors.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Set,
    Clear,
    Keep,
}

use self::Combinator::*;
use self::Transition::*;

impl Combinator {
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Base => "base",
            Not => "not",
            Any => "any",
            All => "all",
        }
    }

    #[inline]
    pub fn is_derived(self) -> bool {
        self != Base
    }

    /// Initial state given the current ancestor states.
    pub fn evaluate<I>(self, mut states: I) -> bool
    where
        I: Iterator<Item = bool>,
    {
        match self {
            Base => false,
            Not => !states.any(|set| set),
            Any => states.any(|set| set),
            All => states.all(|set| set),
        }
    }

    /// Reaction to one ancestor being set. The states are only consumed when the
    /// combinator needs to re-check its other ancestors.
    pub fn on_ancestor_set<I>(self, mut states: I) -> Transition
    where
        I: Iterator<Item = bool>,
    {
        match self {
            Base => Keep,
            Not => Clear,
            Any => Set,
            All if states.all(|set| set) => Set,
            All => Keep,
        }
    }

    /// Reaction to one ancestor being cleared.
    pub fn on_ancestor_clear<I>(self, mut states: I) -> Transition
    where
        I: Iterator<Item = bool>,
    {
        match self {
            Base => Keep,
            Not => Set,
            Any if states.any(|set| set) => Keep,
            Any => Clear,
            All => Clear,
        }
    }
}

impl fmt::Display for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
