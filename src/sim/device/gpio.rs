//! 8-pin digital IO port.

use bytemuck::{Pod, Zeroable};

use crate::err::ConfigErr;
use crate::sim::trace::{SignalId, Tracer};

use super::{DevCtx, Device, DeviceId, Width};

/// Input register (read-only).
pub const P_IN:  u16 = 0;
/// Output register.
pub const P_OUT: u16 = 1;
/// Direction register (1 = output).
pub const P_DIR: u16 = 2;
/// Interrupt flag register.
pub const P_IFG: u16 = 3;
/// Interrupt edge select register (0 = rising, 1 = falling).
pub const P_IES: u16 = 4;
/// Interrupt enable register.
pub const P_IE:  u16 = 5;
/// Function select register.
pub const P_SEL: u16 = 6;

/// Register state of a [`GpioPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GpioState {
    input: u8,
    out: u8,
    dir: u8,
    ifg: u8,
    ies: u8,
    ie: u8,
    sel: u8,
    _reserved: u8,
}

/// An 8-pin digital IO port.
///
/// Registers (one byte each, see `P_*` offsets): IN, OUT, DIR, IFG, IES, IE, SEL.
///
/// Pins configured as outputs can be wired to the input lines of other devices with
/// [`GpioPort::connect`]. Inputs latch edges into IFG according to IES.
/// The driven output levels (`OUT & DIR`) and IFG are traced.
#[derive(Debug, Clone)]
pub struct GpioPort {
    name: String,
    state: GpioState,
    wires: Vec<(u8, DeviceId, u8)>,
    out_signal: Option<SignalId>,
    ifg_signal: Option<SignalId>,
}
impl GpioPort {
    /// Creates a new port with every pin an input.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: GpioState::default(),
            wires: vec![],
            out_signal: None,
            ifg_signal: None,
        }
    }

    /// Wires an output pin of this port to an input line of another device.
    pub fn connect(mut self, pin: u8, peer: DeviceId, line: u8) -> Self {
        self.wires.push((pin & 7, peer, line));
        self
    }

    /// The levels currently driven on the output pins.
    pub fn driven(&self) -> u8 {
        self.state.out & self.state.dir
    }
    /// The pending interrupt flags which are enabled.
    pub fn pending(&self) -> u8 {
        self.state.ifg & self.state.ie
    }

    fn set_ifg(&mut self, ifg: u8, ctx: &mut DevCtx<'_>) {
        self.state.ifg = ifg;
        if let Some(s) = self.ifg_signal {
            ctx.record(s, u64::from(ifg));
        }
    }

    /// Propagates a change of driven levels to the trace and the wired devices.
    fn drive_outputs(&mut self, before: u8, ctx: &mut DevCtx<'_>) {
        let after = self.driven();
        if before == after { return };

        if let Some(s) = self.out_signal {
            ctx.record(s, u64::from(after));
        }
        for &(pin, peer, line) in &self.wires {
            let mask = 1 << pin;
            if (before ^ after) & mask != 0 {
                ctx.drive(peer, line, after & mask != 0);
            }
        }
    }
}
impl Device for GpioPort {
    type State = GpioState;

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
        self.out_signal = Some(tracer.register_signal(8, "out", &self.name)?);
        self.ifg_signal = Some(tracer.register_signal(8, "ifg", &self.name)?);
        Ok(())
    }

    fn reset(&mut self, ctx: &mut DevCtx<'_>) {
        let before = self.driven();
        self.state = GpioState::default();
        self.drive_outputs(before, ctx);
        self.set_ifg(0, ctx);
    }

    fn read(&mut self, offset: u16, width: Width, ctx: &mut DevCtx<'_>) -> u16 {
        let s = &self.state;
        let byte = |off: u16| match off {
            P_IN  => s.input,
            P_OUT => s.out,
            P_DIR => s.dir,
            P_IFG => s.ifg,
            P_IES => s.ies,
            P_IE  => s.ie,
            P_SEL => s.sel,
            _ => 0,
        };
        match width {
            Width::Byte => u16::from(byte(offset)),
            Width::Word => ctx.byte_order().join([byte(offset), byte(offset + 1)]),
        }
    }

    fn write(&mut self, offset: u16, width: Width, value: u16, ctx: &mut DevCtx<'_>) {
        let bytes = match width {
            Width::Byte => vec![(offset, value as u8)],
            Width::Word => {
                let [even, odd] = ctx.byte_order().split(value);
                vec![(offset, even), (offset + 1, odd)]
            }
        };

        for (off, v) in bytes {
            let before = self.driven();
            match off {
                P_OUT => self.state.out = v,
                P_DIR => self.state.dir = v,
                P_IFG => self.set_ifg(v, ctx),
                P_IES => self.state.ies = v,
                P_IE  => self.state.ie = v,
                P_SEL => self.state.sel = v,
                _ => {}
            }
            self.drive_outputs(before, ctx);
        }
    }

    fn input(&mut self, line: u8, level: bool, ctx: &mut DevCtx<'_>) {
        let mask = 1 << (line & 7);
        let old = self.state.input & mask != 0;
        if old == level { return };

        match level {
            true  => self.state.input |= mask,
            false => self.state.input &= !mask,
        }

        let falling_edge = self.state.ies & mask != 0;
        if level != falling_edge {
            self.set_ifg(self.state.ifg | mask, ctx);
        }
    }
}
