//! Error types raised while building a machine.
//!
//! Everything in [`ConfigErr`] is detected at setup time, when devices, trace signals,
//! and clock domains are registered. These errors mean the machine cannot be built.
//!
//! Errors that stop a running simulation are found in [`crate::sim::SimErr`].

use thiserror::Error;

/// An error in the configuration of the simulated machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigErr {
    /// The requested address range overlaps a device which is already registered.
    #[error("address range [{base:#06X}, {end:#07X}) overlaps device `{owner}`")]
    RangeConflict {
        /// Start of the requested range.
        base: u16,
        /// End (exclusive) of the requested range.
        end: u32,
        /// Name of the device which already owns part of the range.
        owner: String
    },
    /// The device registry already holds its maximum number of devices.
    #[error("device registry is full ({0} slots)")]
    RegistryFull(usize),
    /// The requested address range is empty or extends past the address space.
    #[error("invalid address range: base {base:#06X}, size {size:#X}")]
    InvalidRange {
        /// Start of the requested range.
        base: u16,
        /// Size of the requested range.
        size: u32
    },
    /// A trace signal with the same name, module, and width is already registered.
    #[error("signal `{module}.{name}` ({width} bits) is already registered")]
    DuplicateSignal {
        /// Signal name.
        name: String,
        /// Owning module.
        module: String,
        /// Width in bits.
        width: u8
    },
    /// The signal table is full.
    #[error("signal table is full ({0} signals)")]
    TooManySignals(usize),
    /// A signal was declared with a width outside of `1..=64`.
    #[error("invalid signal width {0} (must be 1 to 64 bits)")]
    InvalidWidth(u8),
    /// A clock divider of zero was requested.
    #[error("invalid clock divider {0}")]
    InvalidDivider(u32),
    /// An oscillator frequency of zero was requested.
    #[error("invalid oscillator frequency {0} Hz")]
    InvalidFrequency(u64),
    /// The oscillator handle does not belong to this clock tree.
    #[error("unknown oscillator")]
    UnknownOscillator,
    /// The clock domain handle does not belong to this clock tree.
    #[error("unknown clock domain")]
    UnknownDomain,
}
