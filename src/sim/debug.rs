//! Utilities to debug simulation.
//!
//! The key type here is [`Breakpoint`], which can be added to the [`Machine`]'s
//! breakpoint field to cause a run to pause.
use std::fmt::Write;

use super::trace::SignalId;
use super::Machine;

/// Common breakpoints.
#[derive(PartialEq, Eq, Hash)]
pub enum Breakpoint {
    /// Break once the simulated time reaches the given value (in nanoseconds).
    Time(u64),

    /// Break when the last recorded value of a trace signal matches.
    Signal {
        /// Signal to check.
        signal: SignalId,
        /// Predicate to break against.
        value: Comparator
    },
}

impl Breakpoint where Breakpoint: Send + Sync { /* assert Breakpoint is send/sync */ }

impl Breakpoint {
    /// Checks if a break should occur.
    pub fn check(&self, machine: &Machine) -> bool {
        match self {
            Breakpoint::Time(t) => machine.nanotime() >= *t,
            Breakpoint::Signal { signal, value: cmp } => {
                machine.tracer().last_value(*signal).is_some_and(|v| cmp.check(v))
            },
        }
    }

    fn fmt_bp(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Time(t) => {
                write!(f, "time >= {t} ns")?;
            },
            Self::Signal { signal, value } => {
                write!(f, "signal {} ", signal.index())?;
                value.fmt_cmp(f)?;
            },
        }
        Ok(())
    }
}
impl std::fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Breakpoint(")?;
        self.fmt_bp(f)?;
        f.write_char(')')
    }
}
/// Predicate checking whether the current value is equal to the value.
#[derive(PartialEq, Eq, Hash, Debug)]
pub enum Comparator {
    /// Never breaks.
    Never,
    /// Break if the desired value is less than the provided value.
    Lt(u64),
    /// Break if the desired value is equal to the provided value.
    Eq(u64),
    /// Break if the desired value is less than or equal to the provided value.
    Le(u64),
    /// Break if the desired value is greater than the provided value.
    Gt(u64),
    /// Break if the desired value is not equal to the provided value.
    Ne(u64),
    /// Break if the desired value is greater than or equal to the provided value.
    Ge(u64),
    /// Always breaks.
    Always
}
impl Comparator {
    /// Checks if the operand passes the comparator.
    pub fn check(&self, operand: u64) -> bool {
        match *self {
            Comparator::Never  => false,
            Comparator::Lt(r)  => operand < r,
            Comparator::Eq(r)  => operand == r,
            Comparator::Le(r)  => operand <= r,
            Comparator::Gt(r)  => operand > r,
            Comparator::Ne(r)  => operand != r,
            Comparator::Ge(r)  => operand >= r,
            Comparator::Always => true,
        }
    }

    fn fmt_cmp(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparator::Never  => f.write_str("never"),
            Comparator::Lt(r)  => write!(f, "< {r}"),
            Comparator::Eq(r)  => write!(f, "== {r}"),
            Comparator::Le(r)  => write!(f, "<= {r}"),
            Comparator::Gt(r)  => write!(f, "> {r}"),
            Comparator::Ne(r)  => write!(f, "!= {r}"),
            Comparator::Ge(r)  => write!(f, ">= {r}"),
            Comparator::Always => f.write_str("always"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Comparator;

    #[test]
    fn test_comparators() {
        assert!(Comparator::Always.check(0));
        assert!(!Comparator::Never.check(0));
        assert!(Comparator::Ge(5).check(5));
        assert!(!Comparator::Gt(5).check(5));
        assert!(Comparator::Ne(5).check(u64::MAX));
    }
}
