//! Plain byte registers.

use super::{DevCtx, Device, Width};

/// A bank of `N` plain byte registers.
///
/// Reads return the last value written. Word accesses join two adjacent registers
/// in the machine's byte order. Offsets past the end of the bank read 0 and discard writes.
#[derive(Debug, Clone)]
pub struct RegisterBank<const N: usize> {
    name: String,
    regs: [u8; N],
}
impl<const N: usize> RegisterBank<N> {
    /// Creates a new bank with all registers zeroed.
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), regs: [0; N] }
    }

    /// The register at `offset`.
    pub fn get(&self, offset: u16) -> Option<u8> {
        self.regs.get(usize::from(offset)).copied()
    }
}
impl<const N: usize> Device for RegisterBank<N> {
    type State = [u8; N];

    fn name(&self) -> &str {
        &self.name
    }
    fn state(&self) -> &Self::State {
        &self.regs
    }
    fn state_mut(&mut self) -> &mut Self::State {
        &mut self.regs
    }

    fn reset(&mut self, _ctx: &mut DevCtx<'_>) {
        self.regs = [0; N];
    }

    fn read(&mut self, offset: u16, width: Width, ctx: &mut DevCtx<'_>) -> u16 {
        let byte = |off: u16| self.get(off).unwrap_or(0);
        match width {
            Width::Byte => u16::from(byte(offset)),
            Width::Word => ctx.byte_order().join([byte(offset), byte(offset + 1)]),
        }
    }

    fn write(&mut self, offset: u16, width: Width, value: u16, ctx: &mut DevCtx<'_>) {
        let mut set = |off: u16, v: u8| {
            if let Some(r) = self.regs.get_mut(usize::from(off)) {
                *r = v;
            }
        };
        match width {
            Width::Byte => set(offset, value as u8),
            Width::Word => {
                let [even, odd] = ctx.byte_order().split(value);
                set(offset, even);
                set(offset + 1, odd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::device::tests::TestEnv;
    use crate::sim::device::{IoBus, Width};
    use crate::sim::regs::ByteOrder;

    use super::RegisterBank;

    #[test]
    fn test_big_endian_words() {
        let mut t = TestEnv::new();
        let mut bus = IoBus::new(1);
        let id = bus.register(RegisterBank::<2>::new("bank"), 0x40, 2).unwrap();

        let mut env = t.env();
        env.byte_order = ByteOrder::Big;
        bus.write(0x40, Width::Word, 0x1234, &mut env);
        assert_eq!(bus.read(0x40, Width::Byte, &mut env), 0x12);
        assert_eq!(bus.read(0x41, Width::Byte, &mut env), 0x34);
        assert_eq!(bus.device::<RegisterBank<2>>(id).and_then(|b| b.get(1)), Some(0x34));
    }

    #[test]
    fn test_reset_clears() {
        let mut t = TestEnv::new();
        let mut bus = IoBus::new(1);
        bus.register(RegisterBank::<8>::new("bank"), 0, 8).unwrap();
        bus.write(3, Width::Byte, 0x99, &mut t.env());
        bus.reset_all(&mut t.env());
        assert_eq!(bus.read(3, Width::Byte, &mut t.env()), 0);
    }
}
