//! Byte-oriented serial interface.

use bytemuck::{Pod, Zeroable};
use log::warn;

use crate::sim::regs::Field;

use super::{DevCtx, Device, Width};

/// Control register.
pub const UCTL: u16 = 0;
/// Status register (read-only).
pub const USTAT: u16 = 1;
/// Receive buffer (reading pops the receive FIFO).
pub const URXBUF: u16 = 2;
/// Transmit buffer (writing sends a byte).
pub const UTXBUF: u16 = 3;

/// UCTL: interface enabled.
pub const UEN: Field = Field::bit(0);
/// UCTL: receive interrupt enable.
pub const URXIE: Field = Field::bit(1);
/// UCTL: ends the current packet (write-only).
pub const UEOP: Field = Field::bit(6);
/// UCTL: aborts the current packet (write-only).
pub const UABORT: Field = Field::bit(7);

/// USTAT: receive FIFO not empty.
pub const URXAV: Field = Field::bit(0);
/// USTAT: a received byte was lost to a full FIFO.
pub const UOVR: Field = Field::bit(1);

/// Depth of the receive FIFO.
pub const RX_FIFO_LEN: usize = 16;

/// Register state of a [`Uart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct UartState {
    ctl: u8,
    stat: u8,
    rx_head: u8,
    rx_len: u8,
    rx_fifo: [u8; RX_FIFO_LEN],
}

/// A byte-oriented serial interface.
///
/// Registers (one byte each, see the `U*` offsets): UCTL, USTAT, URXBUF, UTXBUF.
///
/// Bytes from outside of the machine arrive through [`Device::receive`] into a receive FIFO.
/// Transmitted bytes leave the machine through [`DevCtx::transmit`].
/// Both directions are logged in the packet log (if one is attached) under this UART's interface number.
#[derive(Debug, Clone)]
pub struct Uart {
    name: String,
    iface: u8,
    state: UartState,
}
impl Uart {
    /// Creates a disabled UART logging as interface `iface`.
    pub fn new(name: &str, iface: u8) -> Self {
        Self { name: name.to_string(), iface, state: UartState::default() }
    }

    /// Number of bytes waiting in the receive FIFO.
    pub fn rx_pending(&self) -> usize {
        usize::from(self.state.rx_len)
    }
    /// Whether the receive interrupt is pending.
    pub fn interrupt_pending(&self) -> bool {
        URXIE.is_set(self.state.ctl.into()) && self.state.rx_len > 0
    }

    fn stat(&self) -> u8 {
        let s = URXAV.with(self.state.stat.into(), self.state.rx_len > 0);
        s as u8
    }

    fn pop(&mut self) -> u8 {
        let s = &mut self.state;
        if s.rx_len == 0 { return 0 };

        let byte = s.rx_fifo[usize::from(s.rx_head)];
        s.rx_head = ((usize::from(s.rx_head) + 1) % RX_FIFO_LEN) as u8;
        s.rx_len -= 1;
        byte
    }

    fn write_byte(&mut self, offset: u16, value: u8, ctx: &mut DevCtx<'_>) {
        match offset {
            UCTL => {
                let value = u16::from(value);
                let now = ctx.now();
                let iface = self.iface;
                if UEOP.is_set(value) {
                    if let Some(p) = ctx.packets() { p.end_packet(iface, now) };
                }
                if UABORT.is_set(value) {
                    if let Some(p) = ctx.packets() { p.abort_packet(iface, "aborted by firmware", now) };
                }
                self.state.ctl = (value & (UEN.mask() | URXIE.mask())) as u8;
            },
            UTXBUF => {
                if !UEN.is_set(self.state.ctl.into()) {
                    warn!("`{}` is disabled, transmit of {value:#04X} dropped", self.name);
                    return;
                }
                let now = ctx.now();
                if let Some(p) = ctx.packets() { p.tx_byte(self.iface, value, now) };
                ctx.transmit(value);
            },
            _ => {}
        }
    }
}
impl Device for Uart {
    type State = UartState;

    fn name(&self) -> &str {
        &self.name
    }
    fn state(&self) -> &Self::State {
        &self.state
    }
    fn state_mut(&mut self) -> &mut Self::State {
        &mut self.state
    }

    fn reset(&mut self, _ctx: &mut DevCtx<'_>) {
        self.state = UartState::default();
    }

    fn read(&mut self, offset: u16, width: Width, ctx: &mut DevCtx<'_>) -> u16 {
        let mut byte = |off: u16| match off {
            UCTL   => self.state.ctl,
            USTAT  => self.stat(),
            URXBUF => self.pop(),
            _ => 0,
        };
        match width {
            Width::Byte => u16::from(byte(offset)),
            Width::Word => {
                let even = byte(offset);
                let odd = byte(offset + 1);
                ctx.byte_order().join([even, odd])
            }
        }
    }

    fn write(&mut self, offset: u16, width: Width, value: u16, ctx: &mut DevCtx<'_>) {
        match width {
            Width::Byte => self.write_byte(offset, value as u8, ctx),
            Width::Word => {
                let [even, odd] = ctx.byte_order().split(value);
                self.write_byte(offset, even, ctx);
                self.write_byte(offset + 1, odd, ctx);
            }
        }
    }

    fn receive(&mut self, byte: u8, ctx: &mut DevCtx<'_>) -> bool {
        if !UEN.is_set(self.state.ctl.into()) { return false };

        let now = ctx.now();
        if let Some(p) = ctx.packets() { p.rx_byte(self.iface, byte, now) };

        let s = &mut self.state;
        if usize::from(s.rx_len) == RX_FIFO_LEN {
            s.stat = UOVR.with(s.stat.into(), true) as u8;
            return false;
        }
        let tail = (usize::from(s.rx_head) + usize::from(s.rx_len)) % RX_FIFO_LEN;
        s.rx_fifo[tail] = byte;
        s.rx_len += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::device::tests::TestEnv;
    use crate::sim::device::{IoBus, Width};

    use super::{Uart, RX_FIFO_LEN, UCTL, UEN, UOVR, URXAV, URXBUF, USTAT, UTXBUF};

    fn uart() -> (TestEnv, IoBus) {
        let mut t = TestEnv::new();
        let mut bus = IoBus::new(1);
        bus.register(Uart::new("uart0", 0), 0x0070, 4).unwrap();
        bus.write(0x0070 + UCTL, Width::Byte, UEN.mask(), &mut t.env());
        (t, bus)
    }

    #[test]
    fn test_receive_fifo() {
        let (mut t, mut bus) = uart();
        let id = bus.owner(0x0070).unwrap();

        for b in *b"abc" {
            assert!(bus.receive(id, b, &mut t.env()));
        }
        assert!(URXAV.is_set(bus.read(0x0070 + USTAT, Width::Byte, &mut t.env())));

        let rx: Vec<_> = (0..3).map(|_| bus.read(0x0070 + URXBUF, Width::Byte, &mut t.env()) as u8).collect();
        assert_eq!(rx, b"abc");
        assert!(!URXAV.is_set(bus.read(0x0070 + USTAT, Width::Byte, &mut t.env())));
    }

    #[test]
    fn test_overrun() {
        let (mut t, mut bus) = uart();
        let id = bus.owner(0x0070).unwrap();
        for i in 0..RX_FIFO_LEN {
            assert!(bus.receive(id, i as u8, &mut t.env()));
        }
        assert!(!bus.receive(id, 0xFF, &mut t.env()));
        assert!(UOVR.is_set(bus.read(0x0070 + USTAT, Width::Byte, &mut t.env())));
        // oldest byte first
        assert_eq!(bus.read(0x0070 + URXBUF, Width::Byte, &mut t.env()), 0);
    }

    #[test]
    fn test_transmit() {
        let (mut t, mut bus) = uart();
        bus.write(0x0070 + UTXBUF, Width::Byte, u16::from(b'!'), &mut t.env());
        assert_eq!(t.outbox, b"!");

        // disabled UARTs do not send or receive
        bus.write(0x0070 + UCTL, Width::Byte, 0, &mut t.env());
        bus.write(0x0070 + UTXBUF, Width::Byte, u16::from(b'?'), &mut t.env());
        assert_eq!(t.outbox, b"!");
        let id = bus.owner(0x0070).unwrap();
        assert!(!bus.receive(id, 1, &mut t.env()));
    }
}
