//! Bus access observers, which store which accesses occur at a given IO address.
//!
//! You would typically access an observer via [`Machine::observer`], which records
//! the register accesses made through [`Machine::read`] and [`Machine::write`]
//! while [`MachineFlags::observe_accesses`] is enabled.
//!
//! [`Machine::observer`]: crate::sim::Machine::observer
//! [`Machine::read`]: crate::sim::Machine::read
//! [`Machine::write`]: crate::sim::Machine::write
//! [`MachineFlags::observe_accesses`]: crate::sim::MachineFlags::observe_accesses

use std::collections::BTreeMap;

/// The set of accesses which have occurred at this location.
///
/// ## Example
///
/// ```
/// # use mcu_sim::sim::observer::AccessSet;
///
/// let accesses = AccessSet::READ;
/// assert!(accesses.accessed());
/// assert!(accesses.read());
/// assert!(!accesses.written());
/// assert!(!accesses.modified());
/// ```
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessSet(u8);
impl AccessSet {
    /// Set with only the read flag enabled.
    pub const READ: Self = Self(1 << 0);
    /// Set with only the write flag enabled.
    pub const WRITTEN: Self = Self(1 << 1);
    /// Set with only the modify flag enabled.
    pub const MODIFIED: Self = Self(1 << 2);
    /// Set with only the unmapped flag enabled.
    pub const UNMAPPED: Self = Self(1 << 3);

    /// True if any access has occurred.
    pub fn accessed(&self) -> bool {
        self.0 != 0
    }

    /// True if a read has occurred.
    pub fn read(&self) -> bool {
        self.0 & Self::READ.0 != 0
    }
    /// True if a write has occurred (does not necessarily have to change the register).
    pub fn written(&self) -> bool {
        self.0 & Self::WRITTEN.0 != 0
    }
    /// True if a write has changed the value read back from the register.
    pub fn modified(&self) -> bool {
        self.0 & Self::MODIFIED.0 != 0
    }
    /// True if the address belonged to no device.
    pub fn unmapped(&self) -> bool {
        self.0 & Self::UNMAPPED.0 != 0
    }
}
impl std::ops::BitOr for AccessSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
impl std::ops::BitOrAssign for AccessSet {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}
impl std::fmt::Debug for AccessSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessSet")
            .field("read", &self.read())
            .field("written", &self.written())
            .field("modified", &self.modified())
            .field("unmapped", &self.unmapped())
            .finish()
    }
}

/// A struct that tracks accesses on the IO bus.
#[derive(Debug, Default)]
pub struct AccessObserver {
    io: BTreeMap<u16, AccessSet>
}
impl AccessObserver {
    /// Creates a new access observer.
    pub fn new() -> Self {
        Default::default()
    }

    /// Clears all accesses.
    pub fn clear(&mut self) {
        self.io.clear();
    }

    /// Gets the access set for the given address.
    pub fn get_accesses(&self, addr: u16) -> AccessSet {
        self.io.get(&addr).copied().unwrap_or_default()
    }

    /// Adds new flags to the access set for the given address.
    pub fn update_accesses(&mut self, addr: u16, set: AccessSet) {
        *self.io.entry(addr).or_default() |= set;
    }

    /// Takes all accesses which have occurred since last clear,
    /// as well as clearing them.
    ///
    /// This iterator is sorted in address order.
    pub fn take_accesses(&mut self) -> impl Iterator<Item=(u16, AccessSet)> {
        std::mem::take(&mut self.io).into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessObserver, AccessSet};

    #[test]
    fn test_accumulates_flags() {
        let mut obs = AccessObserver::new();
        obs.update_accesses(0x10, AccessSet::READ);
        obs.update_accesses(0x10, AccessSet::WRITTEN | AccessSet::MODIFIED);
        obs.update_accesses(0x02, AccessSet::READ | AccessSet::UNMAPPED);

        let acc = obs.get_accesses(0x10);
        assert!(acc.read() && acc.written() && acc.modified() && !acc.unmapped());
        assert!(!obs.get_accesses(0x11).accessed());

        let taken: Vec<_> = obs.take_accesses().map(|(a, _)| a).collect();
        assert_eq!(taken, [0x02, 0x10]);
        assert!(!obs.get_accesses(0x10).accessed());
    }
}
