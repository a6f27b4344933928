//! Register front-end to the clock tree.

use log::error;

use crate::err::ConfigErr;
use crate::sim::clock::{ClockTree, DomainId, OscId};
use crate::sim::regs::Field;

use super::{DevCtx, Device, Width};

/// Number of clock domains a [`ClockControl`] can manage.
pub const MAX_DOMAINS: usize = 4;

/// Divider select (divide by `1 << DIVS`).
pub const DIVS: Field = Field::new(0, 4);
/// Source select (index into the controller's oscillator list).
pub const SELS: Field = Field::new(4, 3);
/// Domain off.
pub const OFF: Field = Field::bit(8);

/// Register front-end to the clock tree.
///
/// Each managed domain has one control word at offset `2 * n`, holding its divider
/// ([`DIVS`]), its source ([`SELS`]), and a gate ([`OFF`]). Writes are applied
/// to the clock tree immediately.
#[derive(Debug, Clone)]
pub struct ClockControl {
    name: String,
    domains: Vec<DomainId>,
    sources: Vec<OscId>,
    regs: [u16; MAX_DOMAINS],
    initial: [u16; MAX_DOMAINS],
}
impl ClockControl {
    /// Creates a controller for up to [`MAX_DOMAINS`] domains, selecting among `sources`.
    ///
    /// The control words start out describing the current configuration of the clock tree.
    pub fn new(name: &str, clock: &ClockTree, domains: &[DomainId], sources: &[OscId]) -> Self {
        let domains: Vec<_> = domains.iter().copied().take(MAX_DOMAINS).collect();
        let sources: Vec<_> = sources.iter().copied().take(1 << SELS.mask().count_ones()).collect();

        let mut regs = [0; MAX_DOMAINS];
        for (reg, &id) in regs.iter_mut().zip(&domains) {
            let Some(domain) = clock.domain(id) else { continue };
            let sel = sources.iter().position(|&s| s == domain.source()).unwrap_or(0);
            let divs = domain.divider().max(1).ilog2().min(15);
            *reg = OFF.with(SELS.set(DIVS.set(0, divs as u16), sel as u16), !domain.enabled());
        }

        Self { name: name.to_string(), domains, sources, regs, initial: regs }
    }

    fn apply(&mut self, index: usize, value: u16, ctx: &mut DevCtx<'_>) {
        let Some(&domain) = self.domains.get(index) else { return };
        let old = self.regs[index];
        self.regs[index] = value & (DIVS.mask() | SELS.mask() | OFF.mask());

        if let Err(e) = self.reconfigure(ctx.clock_mut(), domain, old, value) {
            error!("`{}` could not reconfigure clock domain: {e}", self.name);
        }
    }

    fn reconfigure(&self, clock: &mut ClockTree, domain: DomainId, old: u16, new: u16) -> Result<(), ConfigErr> {
        if DIVS.get(old) != DIVS.get(new) {
            clock.set_divider(domain, 1 << DIVS.get(new))?;
        }
        if SELS.get(old) != SELS.get(new) {
            match self.sources.get(usize::from(SELS.get(new))) {
                Some(&osc) => clock.set_source(domain, osc)?,
                None => error!("`{}` selected unknown source {}", self.name, SELS.get(new)),
            }
        }
        clock.enable(domain, !OFF.is_set(new))
    }
}
impl Device for ClockControl {
    type State = [u16; MAX_DOMAINS];

    fn name(&self) -> &str {
        &self.name
    }
    fn state(&self) -> &Self::State {
        &self.regs
    }
    fn state_mut(&mut self) -> &mut Self::State {
        &mut self.regs
    }

    /// Restores the control words. The clock tree restores its own configuration on reset.
    fn reset(&mut self, _ctx: &mut DevCtx<'_>) {
        self.regs = self.initial;
    }

    fn read(&mut self, offset: u16, width: Width, ctx: &mut DevCtx<'_>) -> u16 {
        let reg = self.regs.get(usize::from(offset / 2)).copied().unwrap_or(0);
        match width {
            Width::Byte => u16::from(ctx.byte_order().read_byte(reg, offset)),
            Width::Word => reg,
        }
    }

    fn write(&mut self, offset: u16, width: Width, value: u16, ctx: &mut DevCtx<'_>) {
        let index = usize::from(offset / 2);
        let Some(&reg) = self.regs.get(index) else { return };
        let value = match width {
            Width::Byte => ctx.byte_order().write_byte(reg, offset, value as u8),
            Width::Word => value,
        };
        self.apply(index, value, ctx);
    }
}
