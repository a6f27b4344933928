//! 16-bit timer counting on a clock domain.

use bytemuck::{Pod, Zeroable};

use crate::err::ConfigErr;
use crate::sim::clock::DomainId;
use crate::sim::regs::Field;
use crate::sim::trace::{SignalId, Tracer};

use super::{DevCtx, Device, Width};

/// Control register.
pub const TACTL: u16 = 0;
/// Counter register.
pub const TAR: u16 = 2;
/// Capture/compare control register 0.
pub const TACCTL0: u16 = 4;
/// Capture/compare register 0.
pub const TACCR0: u16 = 6;

/// TACTL: overflow interrupt flag.
pub const TAIFG: Field = Field::bit(0);
/// TACTL: overflow interrupt enable.
pub const TAIE: Field = Field::bit(1);
/// TACTL: clear counter and input divider (reads as 0).
pub const TACLR: Field = Field::bit(2);
/// TACTL: mode control (0 = stop, 1 = up to TACCR0, 2 = continuous, 3 = up).
pub const MC: Field = Field::new(4, 2);
/// TACTL: input divider (divide by `1 << ID`).
pub const ID: Field = Field::new(6, 2);

/// TACCTL0: compare interrupt flag.
pub const CCIFG: Field = Field::bit(0);
/// TACCTL0: compare interrupt enable.
pub const CCIE: Field = Field::bit(4);

const MC_STOP: u16 = 0;
const MC_CONTINUOUS: u16 = 2;

/// Register state of a [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct TimerState {
    ctl: u16,
    count: u16,
    cctl0: u16,
    ccr0: u16,
    /// Source cycles not yet consumed by the input divider.
    prescale: u32,
}

/// A 16-bit timer counting the cycles of one clock domain.
///
/// Registers (words, see the `TA*` offsets): TACTL, TAR, TACCTL0, TACCR0.
///
/// In up mode the counter runs from 0 to TACCR0 and raises CCIFG and TAIFG when it wraps.
/// In continuous mode it runs over the full 16-bit range, raising CCIFG when it passes TACCR0
/// and TAIFG when it overflows. CCIFG is traced.
#[derive(Debug, Clone)]
pub struct Timer {
    name: String,
    domain: DomainId,
    state: TimerState,
    ccifg_signal: Option<SignalId>,
}
impl Timer {
    /// Creates a stopped timer fed by `domain`.
    pub fn new(name: &str, domain: DomainId) -> Self {
        Self { name: name.to_string(), domain, state: TimerState::default(), ccifg_signal: None }
    }

    /// The counter value.
    pub fn count(&self) -> u16 {
        self.state.count
    }
    /// Whether an enabled interrupt flag is raised.
    pub fn interrupt_pending(&self) -> bool {
        let s = &self.state;
        (CCIFG.is_set(s.cctl0) && CCIE.is_set(s.cctl0)) || (TAIFG.is_set(s.ctl) && TAIE.is_set(s.ctl))
    }

    fn reg(&self, offset: u16) -> u16 {
        match offset {
            TACTL   => self.state.ctl,
            TAR     => self.state.count,
            TACCTL0 => self.state.cctl0,
            TACCR0  => self.state.ccr0,
            _ => 0
        }
    }

    fn set_cctl0(&mut self, cctl0: u16, ctx: &mut DevCtx<'_>) {
        let was = CCIFG.is_set(self.state.cctl0);
        self.state.cctl0 = cctl0;
        let now = CCIFG.is_set(cctl0);
        if was != now {
            if let Some(s) = self.ccifg_signal {
                ctx.record(s, u64::from(now));
            }
        }
    }

    fn set_reg(&mut self, offset: u16, value: u16, ctx: &mut DevCtx<'_>) {
        match offset {
            TACTL => {
                if TACLR.is_set(value) {
                    self.state.count = 0;
                    self.state.prescale = 0;
                }
                self.state.ctl = TACLR.with(value, false);
            },
            TAR     => self.state.count = value,
            TACCTL0 => self.set_cctl0(value, ctx),
            TACCR0  => self.state.ccr0 = value,
            _ => {}
        }
    }

    /// Advances the counter by `ticks` divided clock ticks.
    fn count_up(&mut self, ticks: u64, ctx: &mut DevCtx<'_>) {
        let s = self.state;
        let old = u64::from(s.count);
        let new = old + ticks;

        let (wrapped, passed_ccr0, count) = match MC.get(s.ctl) {
            MC_STOP => return,
            MC_CONTINUOUS => {
                let mut target = u64::from(s.ccr0);
                if target <= old { target += 1 << 16 };
                (new >> 16 != 0, ticks >= 1 << 16 || new >= target, new as u16)
            },
            _ => {
                let period = u64::from(s.ccr0) + 1;
                let wrapped = new >= period;
                (wrapped, wrapped, (new % period) as u16)
            }
        };

        self.state.count = count;
        if wrapped {
            self.state.ctl = TAIFG.with(self.state.ctl, true);
        }
        if passed_ccr0 {
            self.set_cctl0(CCIFG.with(self.state.cctl0, true), ctx);
        }
    }
}
impl Device for Timer {
    type State = TimerState;

    fn name(&self) -> &str {
        &self.name
    }
    fn state(&self) -> &Self::State {
        &self.state
    }
    fn state_mut(&mut self) -> &mut Self::State {
        &mut self.state
    }

    fn attach(&mut self, tracer: &mut Tracer) -> Result<(), ConfigErr> {
        self.ccifg_signal = Some(tracer.register_signal(1, "ccifg", &self.name)?);
        Ok(())
    }

    fn reset(&mut self, ctx: &mut DevCtx<'_>) {
        self.set_cctl0(0, ctx);
        self.state = TimerState::default();
    }

    fn read(&mut self, offset: u16, width: Width, ctx: &mut DevCtx<'_>) -> u16 {
        let reg = self.reg(offset & !1);
        match width {
            Width::Byte => u16::from(ctx.byte_order().read_byte(reg, offset)),
            Width::Word => reg,
        }
    }

    fn write(&mut self, offset: u16, width: Width, value: u16, ctx: &mut DevCtx<'_>) {
        let aligned = offset & !1;
        let value = match width {
            Width::Byte => ctx.byte_order().write_byte(self.reg(aligned), offset, value as u8),
            Width::Word => value,
        };
        self.set_reg(aligned, value, ctx);
    }

    fn update(&mut self, ctx: &mut DevCtx<'_>) {
        if MC.get(self.state.ctl) == MC_STOP { return };

        let divider = 1u64 << ID.get(self.state.ctl);
        let total = u64::from(self.state.prescale) + ctx.cycles(self.domain);
        let ticks = total / divider;
        self.state.prescale = (total % divider) as u32;

        if ticks > 0 {
            self.count_up(ticks, ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::clock::DomainId;
    use crate::sim::device::tests::TestEnv;
    use crate::sim::device::{Device, IoBus, Width};
    use crate::sim::regs::ByteOrder;

    use super::{Timer, CCIE, CCIFG, ID, MC, TACCR0, TACCTL0, TACTL, TAIFG, TAR};

    fn timer_env() -> (TestEnv, IoBus, DomainId) {
        let mut t = TestEnv::new();
        let osc = t.clock.add_oscillator("osc", 1_000_000).unwrap();
        let smclk = t.clock.add_domain("smclk", osc, 1).unwrap();

        let mut timer = Timer::new("timer_a", smclk);
        timer.attach(&mut t.tracer).unwrap();
        let mut bus = IoBus::new(1);
        bus.register(timer, 0x0160, 8).unwrap();
        (t, bus, smclk)
    }

    /// Advances the clock by `us` microseconds and updates the bus.
    fn run(t: &mut TestEnv, bus: &mut IoBus, us: u64) {
        t.clock.advance(us * 1_000).unwrap();
        bus.update_all(&mut t.env());
    }

    #[test]
    fn test_up_mode() {
        let (mut t, mut bus, _) = timer_env();
        bus.write(0x0160 + TACCR0, Width::Word, 99, &mut t.env());
        bus.write(0x0160 + TACCTL0, Width::Word, CCIE.with(0, true), &mut t.env());
        bus.write(0x0160 + TACTL, Width::Word, MC.set(0, 1), &mut t.env());

        run(&mut t, &mut bus, 50);
        assert_eq!(bus.read(0x0160 + TAR, Width::Word, &mut t.env()), 50);
        assert!(!CCIFG.is_set(bus.read(0x0160 + TACCTL0, Width::Word, &mut t.env())));

        run(&mut t, &mut bus, 60);
        assert_eq!(bus.read(0x0160 + TAR, Width::Word, &mut t.env()), 10);
        assert!(CCIFG.is_set(bus.read(0x0160 + TACCTL0, Width::Word, &mut t.env())));
        assert!(TAIFG.is_set(bus.read(0x0160 + TACTL, Width::Word, &mut t.env())));

        let ccifg = t.tracer.lookup("ccifg", "timer_a").unwrap();
        assert_eq!(t.tracer.last_value(ccifg), Some(1));

        // clearing the flag is traced as well
        bus.write(0x0160 + TACCTL0, Width::Word, CCIE.with(0, true), &mut t.env());
        assert_eq!(t.tracer.last_value(ccifg), Some(0));
    }

    #[test]
    fn test_input_divider() {
        let (mut t, mut bus, _) = timer_env();
        bus.write(0x0160 + TACTL, Width::Word, ID.set(MC.set(0, 2), 3), &mut t.env());

        // 8 cycles per count, remainder carries over
        for _ in 0..10 {
            run(&mut t, &mut bus, 3);
        }
        assert_eq!(bus.read(0x0160 + TAR, Width::Word, &mut t.env()), 30 / 8);
    }

    #[test]
    fn test_continuous_overflow() {
        let (mut t, mut bus, _) = timer_env();
        bus.write(0x0160 + TAR, Width::Word, 0xFFF0, &mut t.env());
        bus.write(0x0160 + TACCR0, Width::Word, 0x0004, &mut t.env());
        bus.write(0x0160 + TACTL, Width::Word, MC.set(0, 2), &mut t.env());

        run(&mut t, &mut bus, 0x12);
        assert_eq!(bus.read(0x0160 + TAR, Width::Word, &mut t.env()), 0x0002);
        assert!(TAIFG.is_set(bus.read(0x0160 + TACTL, Width::Word, &mut t.env())));
        assert!(!CCIFG.is_set(bus.read(0x0160 + TACCTL0, Width::Word, &mut t.env())));

        run(&mut t, &mut bus, 2);
        assert!(CCIFG.is_set(bus.read(0x0160 + TACCTL0, Width::Word, &mut t.env())));
    }

    #[test]
    fn test_byte_access() {
        let (mut t, mut bus, _) = timer_env();
        bus.write(0x0160 + TACCR0 + 1, Width::Byte, 0x12, &mut t.env());
        bus.write(0x0160 + TACCR0, Width::Byte, 0x34, &mut t.env());
        assert_eq!(bus.read(0x0160 + TACCR0, Width::Word, &mut t.env()), 0x1234);

        let mut env = t.env();
        env.byte_order = ByteOrder::Big;
        assert_eq!(bus.read(0x0160 + TACCR0, Width::Byte, &mut env), 0x12);
    }

    #[test]
    fn test_stopped_timer_ignores_clock() {
        let (mut t, mut bus, smclk) = timer_env();
        run(&mut t, &mut bus, 1_000);
        assert_eq!(t.clock.cycles(smclk), 1_000);
        assert_eq!(bus.read(0x0160 + TAR, Width::Word, &mut t.env()), 0);
    }
}
