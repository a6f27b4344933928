//! The clock tree.
//!
//! Simulated time is produced by independent [`Oscillator`]s. Each oscillator converts
//! elapsed nanoseconds into whole ticks, and [`ClockDomain`]s divide the ticks of their
//! source oscillator into the cycles seen by the CPU and peripherals.
//!
//! Both conversions keep a remainder between steps, so no rounding error
//! accumulates regardless of how time is sliced into steps:
//! - After `T` nanoseconds, an oscillator at `F` Hz has ticked exactly `floor(T * F / 10^9)` times.
//! - After `N` ticks of its source, an enabled domain with divider `D` has counted `floor(N / D)` cycles.
//!
//! The clock tree also owns the absolute simulated time ([`ClockTree::nanotime`]).
//! This is the only time source in the simulator; the tracer and checkpoints read it from here.
//!
//! ```
//! use mcu_sim::sim::clock::ClockTree;
//!
//! let mut clock = ClockTree::new();
//! let xt = clock.add_oscillator("lfxt1", 32_768).unwrap();
//! let aclk = clock.add_domain("aclk", xt, 1).unwrap();
//!
//! clock.advance(1_000_000_000).unwrap(); // 1 s
//! assert_eq!(clock.cycles(aclk), 32_768);
//! assert_eq!(clock.nanotime(), 1_000_000_000);
//! ```

use log::debug;

use crate::err::ConfigErr;

use super::SimErr;

const NS_PER_SEC: u128 = 1_000_000_000;

/// Handle to an oscillator of a [`ClockTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OscId(u8);

/// Handle to a clock domain of a [`ClockTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(u8);

/// An independent frequency source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Oscillator {
    freq_hz: u64,
    /// Total ticks since creation.
    ticks: u64,
    /// Leftover fraction of a tick, in units of 10^-9 ticks.
    ///
    /// Equivalently, `frac / freq_hz` is the leftover fraction of a nanosecond period.
    frac: u64,
    /// Ticks produced by the latest [`ClockTree::tick_oscillator`] call.
    pending: u64,
}
impl Oscillator {
    fn new(freq_hz: u64) -> Self {
        Self { freq_hz, ticks: 0, frac: 0, pending: 0 }
    }

    /// The frequency of this oscillator in Hz.
    pub fn freq_hz(&self) -> u64 {
        self.freq_hz
    }
    /// The duration of one tick, rounded to the nearest nanosecond.
    pub fn period_ns(&self) -> u64 {
        ((NS_PER_SEC + u128::from(self.freq_hz) / 2) / u128::from(self.freq_hz)) as u64
    }
    /// Total number of ticks since this oscillator was created.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

/// A derived clock, fed by one oscillator through an integer divider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockDomain {
    source: OscId,
    divider: u32,
    enabled: bool,
    /// Total cycles since creation.
    cycles: u64,
    /// Source ticks which have not yet added up to a whole cycle.
    acc: u64,
    /// Cycles added by the latest step.
    last: u64,
}
impl ClockDomain {
    /// The oscillator feeding this domain.
    pub fn source(&self) -> OscId {
        self.source
    }
    /// The divider applied to the source ticks.
    pub fn divider(&self) -> u32 {
        self.divider
    }
    /// Whether the domain is currently counting.
    pub fn enabled(&self) -> bool {
        self.enabled
    }
    /// Total cycles since creation.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
    /// Cycles added by the most recent step.
    pub fn last_increment(&self) -> u64 {
        self.last
    }
}

/// The dynamic state of a clock tree, as held by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockState {
    oscillators: Vec<Oscillator>,
    domains: Vec<ClockDomain>,
    time_ns: u64,
    cycle_frac: u64,
}
impl ClockState {
    /// The absolute simulated time when the state was captured.
    pub fn time_ns(&self) -> u64 {
        self.time_ns
    }
    /// Cycles a domain had counted when the state was captured.
    pub fn cycles(&self, id: DomainId) -> Option<u64> {
        self.domains.get(usize::from(id.0)).map(ClockDomain::cycles)
    }
}

/// The set of oscillators and clock domains of a machine.
#[derive(Debug, Clone, Default)]
pub struct ClockTree {
    oscillators: Vec<Oscillator>,
    osc_names: Vec<String>,
    domains: Vec<ClockDomain>,
    domain_names: Vec<String>,

    /// Configuration at build time, restored by [`ClockTree::reset`].
    initial_freqs: Vec<u64>,
    initial_domains: Vec<ClockDomain>,

    /// The instruction clock, used to convert CPU cycles to time.
    primary: Option<DomainId>,
    /// Absolute simulated time.
    time_ns: u64,
    /// Leftover of [`ClockTree::cycles_to_ns`], in units of 1 / source frequency.
    cycle_frac: u64,
}

/// Handles to the clocks built by [`ClockTree::standard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardClocks {
    /// Low-frequency watch crystal (32768 Hz).
    pub lfxt1: OscId,
    /// High-frequency crystal (8 MHz).
    pub xt2: OscId,
    /// Internal very-low-power oscillator (12 kHz).
    pub vlo: OscId,
    /// Internal trimmed reference oscillator (32768 Hz).
    pub refo: OscId,
    /// Digitally-controlled oscillator (1 MiHz at reset).
    pub dco: OscId,

    /// Master (instruction) clock, sourced from the DCO.
    pub mclk: DomainId,
    /// Sub-main peripheral clock, sourced from the DCO.
    pub smclk: DomainId,
    /// Auxiliary clock, sourced from LFXT1.
    pub aclk: DomainId,
}

impl ClockTree {
    /// Creates an empty clock tree.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates the typical clock system of a low-power MCU.
    ///
    /// See [`StandardClocks`] for the oscillators and domains created.
    /// MCLK is the primary domain.
    pub fn standard() -> (Self, StandardClocks) {
        let mut tree = Self::new();

        // These frequencies and dividers are all valid, so construction cannot fail.
        let mut osc = |name: &str, hz: u64| tree.add_oscillator(name, hz).unwrap_or_else(|_| unreachable!());
        let lfxt1 = osc("lfxt1", 32_768);
        let xt2   = osc("xt2",   8_000_000);
        let vlo   = osc("vlo",   12_000);
        let refo  = osc("refo",  32_768);
        let dco   = osc("dco",   1_048_576);

        let mut domain = |name: &str, src: OscId| tree.add_domain(name, src, 1).unwrap_or_else(|_| unreachable!());
        let mclk  = domain("mclk", dco);
        let smclk = domain("smclk", dco);
        let aclk  = domain("aclk", lfxt1);

        (tree, StandardClocks { lfxt1, xt2, vlo, refo, dco, mclk, smclk, aclk })
    }

    /// Adds an oscillator running at the given frequency.
    pub fn add_oscillator(&mut self, name: &str, freq_hz: u64) -> Result<OscId, ConfigErr> {
        if freq_hz == 0 { return Err(ConfigErr::InvalidFrequency(freq_hz)) };
        let id = u8::try_from(self.oscillators.len())
            .map(OscId)
            .map_err(|_| ConfigErr::UnknownOscillator)?;

        self.oscillators.push(Oscillator::new(freq_hz));
        self.osc_names.push(name.to_string());
        self.initial_freqs.push(freq_hz);
        Ok(id)
    }

    /// Adds an enabled clock domain fed by `source` through `divider`.
    ///
    /// The first domain added becomes the primary domain (see [`ClockTree::set_primary`]).
    pub fn add_domain(&mut self, name: &str, source: OscId, divider: u32) -> Result<DomainId, ConfigErr> {
        self.osc(source)?;
        if divider == 0 { return Err(ConfigErr::InvalidDivider(divider)) };
        let id = u8::try_from(self.domains.len())
            .map(DomainId)
            .map_err(|_| ConfigErr::UnknownDomain)?;

        let domain = ClockDomain { source, divider, enabled: true, cycles: 0, acc: 0, last: 0 };
        self.domains.push(domain);
        self.domain_names.push(name.to_string());
        self.initial_domains.push(domain);
        self.primary.get_or_insert(id);
        Ok(id)
    }

    fn osc(&self, id: OscId) -> Result<&Oscillator, ConfigErr> {
        self.oscillators.get(usize::from(id.0)).ok_or(ConfigErr::UnknownOscillator)
    }
    fn osc_mut(&mut self, id: OscId) -> Result<&mut Oscillator, ConfigErr> {
        self.oscillators.get_mut(usize::from(id.0)).ok_or(ConfigErr::UnknownOscillator)
    }
    fn domain_mut(&mut self, id: DomainId) -> Result<&mut ClockDomain, ConfigErr> {
        self.domains.get_mut(usize::from(id.0)).ok_or(ConfigErr::UnknownDomain)
    }

    /// Gets an oscillator.
    pub fn oscillator(&self, id: OscId) -> Option<&Oscillator> {
        self.oscillators.get(usize::from(id.0))
    }
    /// Gets a clock domain.
    pub fn domain(&self, id: DomainId) -> Option<&ClockDomain> {
        self.domains.get(usize::from(id.0))
    }
    /// Gets the name of an oscillator.
    pub fn oscillator_name(&self, id: OscId) -> Option<&str> {
        self.osc_names.get(usize::from(id.0)).map(String::as_str)
    }
    /// Gets the name of a clock domain.
    pub fn domain_name(&self, id: DomainId) -> Option<&str> {
        self.domain_names.get(usize::from(id.0)).map(String::as_str)
    }
    /// Iterates over all clock domains.
    pub fn domains(&self) -> impl Iterator<Item=(DomainId, &ClockDomain)> + '_ {
        self.domains.iter()
            .enumerate()
            .map(|(i, d)| (DomainId(i as u8), d))
    }

    /// Total cycles counted by a domain (0 for an unknown domain).
    pub fn cycles(&self, id: DomainId) -> u64 {
        self.domain(id).map_or(0, ClockDomain::cycles)
    }
    /// Cycles added to a domain by the most recent step (0 for an unknown domain).
    pub fn last_increment(&self, id: DomainId) -> u64 {
        self.domain(id).map_or(0, ClockDomain::last_increment)
    }

    /// The primary (instruction) clock domain.
    pub fn primary(&self) -> Option<DomainId> {
        self.primary
    }
    /// Sets the primary (instruction) clock domain.
    pub fn set_primary(&mut self, id: DomainId) -> Result<(), ConfigErr> {
        self.domain_mut(id)?;
        self.primary = Some(id);
        Ok(())
    }

    /// The absolute simulated time in nanoseconds.
    pub fn nanotime(&self) -> u64 {
        self.time_ns
    }

    /// Advances one oscillator by `elapsed_ns`, returning the number of whole ticks produced.
    ///
    /// The leftover fraction of a tick is carried to the next call.
    pub fn tick_oscillator(&mut self, id: OscId, elapsed_ns: u64) -> Result<u64, SimErr> {
        let osc = self.osc_mut(id)?;

        let total = u128::from(osc.frac) + u128::from(elapsed_ns) * u128::from(osc.freq_hz);
        let whole = (total / NS_PER_SEC) as u64;
        osc.frac = (total % NS_PER_SEC) as u64;
        osc.pending = whole;

        match osc.ticks.checked_add(whole) {
            Some(t) => osc.ticks = t,
            None => return Err(SimErr::CounterOverflow(self.osc_names[usize::from(id.0)].clone())),
        }
        Ok(whole)
    }

    /// Computes the cycles a domain gains from the ticks its source produced in its latest
    /// [`ClockTree::tick_oscillator`] call, returning that increment.
    ///
    /// A disabled domain gains nothing and keeps its partial-cycle accumulator frozen.
    pub fn derive(&mut self, id: DomainId) -> Result<u64, SimErr> {
        let domain = *self.domains.get(usize::from(id.0)).ok_or(ConfigErr::UnknownDomain)?;
        let ticks = self.osc(domain.source)?.pending;

        let domain = self.domain_mut(id)?;
        if !domain.enabled {
            domain.last = 0;
            return Ok(0);
        }
        let acc = domain.acc + ticks;
        let inc = acc / u64::from(domain.divider);
        domain.acc = acc % u64::from(domain.divider);
        domain.last = inc;

        match domain.cycles.checked_add(inc) {
            Some(c) => domain.cycles = c,
            None => return Err(SimErr::CounterOverflow(self.domain_names[usize::from(id.0)].clone())),
        }
        Ok(inc)
    }

    /// Advances all oscillators by `elapsed_ns`, then derives every clock domain.
    pub fn advance(&mut self, elapsed_ns: u64) -> Result<(), SimErr> {
        for i in 0..self.oscillators.len() {
            self.tick_oscillator(OscId(i as u8), elapsed_ns)?;
        }
        for i in 0..self.domains.len() {
            self.derive(DomainId(i as u8))?;
        }
        self.time_ns = self.time_ns.checked_add(elapsed_ns)
            .ok_or_else(|| SimErr::CounterOverflow("nanotime".to_string()))?;

        Ok(())
    }

    /// Converts a number of primary-domain cycles into elapsed nanoseconds
    /// at the primary domain's current configuration.
    ///
    /// The leftover fraction of a nanosecond is carried to the next call,
    /// so converting `a` and then `b` cycles gives the same total as converting `a + b`.
    pub fn cycles_to_ns(&mut self, cycles: u64) -> Result<u64, ConfigErr> {
        let primary = self.primary.ok_or(ConfigErr::UnknownDomain)?;
        let domain = *self.domain(primary).ok_or(ConfigErr::UnknownDomain)?;
        let freq = u128::from(self.osc(domain.source)?.freq_hz);

        let total = u128::from(self.cycle_frac) + u128::from(cycles) * u128::from(domain.divider) * NS_PER_SEC;
        self.cycle_frac = (total % freq) as u64;
        Ok((total / freq) as u64)
    }

    /// Enables or disables a clock domain.
    ///
    /// A disabled domain keeps its partial-cycle accumulator, so re-enabling resumes without loss.
    pub fn enable(&mut self, id: DomainId, enabled: bool) -> Result<(), ConfigErr> {
        let domain = self.domain_mut(id)?;
        if domain.enabled != enabled {
            domain.enabled = enabled;
            debug!("clock domain `{}` {}", self.domain_names[usize::from(id.0)], if enabled { "enabled" } else { "disabled" });
        }
        Ok(())
    }

    /// Changes the divider of a clock domain.
    ///
    /// Past increments are unaffected. Accumulated source ticks carry over to the new divider.
    pub fn set_divider(&mut self, id: DomainId, divider: u32) -> Result<(), ConfigErr> {
        if divider == 0 { return Err(ConfigErr::InvalidDivider(divider)) };
        let domain = self.domain_mut(id)?;
        if domain.divider != divider {
            domain.divider = divider;
            debug!("clock domain `{}` divider set to {divider}", self.domain_names[usize::from(id.0)]);
        }
        Ok(())
    }

    /// Switches the source oscillator of a clock domain.
    ///
    /// This discards the domain's partial-cycle accumulator, as the modeled hardware does.
    pub fn set_source(&mut self, id: DomainId, source: OscId) -> Result<(), ConfigErr> {
        self.osc(source)?;
        let domain = self.domain_mut(id)?;
        if domain.source != source {
            domain.source = source;
            domain.acc = 0;
            debug!("clock domain `{}` switched to oscillator `{}`", self.domain_names[usize::from(id.0)], self.osc_names[usize::from(source.0)]);
        }
        Ok(())
    }

    /// Changes the frequency of an oscillator (e.g., retuning a DCO).
    ///
    /// The oscillator's fraction of a tick in progress is kept.
    pub fn set_frequency(&mut self, id: OscId, freq_hz: u64) -> Result<(), ConfigErr> {
        if freq_hz == 0 { return Err(ConfigErr::InvalidFrequency(freq_hz)) };
        self.osc_mut(id)?.freq_hz = freq_hz;
        debug!("oscillator `{}` set to {freq_hz} Hz", self.osc_names[usize::from(id.0)]);
        Ok(())
    }

    /// Restores the build-time configuration of every oscillator and domain.
    ///
    /// Counters, accumulators, and the absolute time are kept, as none of them may run backwards.
    pub fn reset(&mut self) {
        for (osc, &freq_hz) in self.oscillators.iter_mut().zip(&self.initial_freqs) {
            osc.freq_hz = freq_hz;
        }
        for (domain, init) in self.domains.iter_mut().zip(&self.initial_domains) {
            if domain.source != init.source {
                domain.acc = 0;
            }
            domain.source = init.source;
            domain.divider = init.divider;
            domain.enabled = init.enabled;
        }
    }

    /// Captures the dynamic state of the clock tree.
    pub fn save(&self) -> ClockState {
        ClockState {
            oscillators: self.oscillators.clone(),
            domains: self.domains.clone(),
            time_ns: self.time_ns,
            cycle_frac: self.cycle_frac,
        }
    }

    /// Restores state captured by [`ClockTree::save`].
    pub fn restore(&mut self, state: &ClockState) -> Result<(), SimErr> {
        if state.oscillators.len() != self.oscillators.len() || state.domains.len() != self.domains.len() {
            return Err(SimErr::CheckpointLayout {
                what: "clock tree",
                saved: state.oscillators.len() + state.domains.len(),
                live: self.oscillators.len() + self.domains.len()
            });
        }
        self.oscillators.copy_from_slice(&state.oscillators);
        self.domains.copy_from_slice(&state.domains);
        self.time_ns = state.time_ns;
        self.cycle_frac = state.cycle_frac;
        Ok(())
    }
}
