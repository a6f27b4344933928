//! Register field accessors.
//!
//! Hardware registers are kept as plain integers. Each field of a register is described
//! by a [`Field`] (a shift and a width), which provides a mask/shift accessor pair.
//!
//! Byte access into 16-bit registers depends on the byte order of the modeled
//! machine. This is described by [`ByteOrder`], which selects one of two layout tables
//! ([`LITTLE_ENDIAN`] and [`BIG_ENDIAN`]).
//!
//! ```
//! use mcu_sim::sim::regs::Field;
//!
//! const MODE: Field = Field::new(4, 2);
//!
//! let reg = MODE.set(0x0000, 0b10);
//! assert_eq!(reg, 0x0020);
//! assert_eq!(MODE.get(reg), 0b10);
//! ```

/// A bit field within a 16-bit register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Field {
    shift: u8,
    width: u8
}
impl Field {
    /// Creates a field covering `width` bits starting at bit `shift`.
    pub const fn new(shift: u8, width: u8) -> Self {
        assert!(width >= 1 && shift as u32 + width as u32 <= 16, "field does not fit in a 16-bit register");
        Self { shift, width }
    }
    /// Creates a single-bit field.
    pub const fn bit(shift: u8) -> Self {
        Self::new(shift, 1)
    }

    /// The mask of this field, in register position.
    pub const fn mask(self) -> u16 {
        (u16::MAX >> (16 - self.width as u32)) << self.shift
    }
    /// Reads this field from the register.
    pub const fn get(self, reg: u16) -> u16 {
        (reg & self.mask()) >> self.shift
    }
    /// Returns the register with this field replaced by `value`.
    ///
    /// Bits of `value` that do not fit in the field are discarded.
    pub const fn set(self, reg: u16, value: u16) -> u16 {
        (reg & !self.mask()) | ((value << self.shift) & self.mask())
    }
    /// Reads a single-bit field as a boolean.
    pub const fn is_set(self, reg: u16) -> bool {
        reg & self.mask() != 0
    }
    /// Returns the register with this field set to all ones or all zeros.
    pub const fn with(self, reg: u16, on: bool) -> u16 {
        match on {
            true  => reg | self.mask(),
            false => reg & !self.mask(),
        }
    }
}

/// Byte offsets of the two halves of a 16-bit register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteLayout {
    /// Offset of the least-significant byte.
    pub lo: u16,
    /// Offset of the most-significant byte.
    pub hi: u16
}

/// Layout table for little-endian machines.
pub const LITTLE_ENDIAN: ByteLayout = ByteLayout { lo: 0, hi: 1 };
/// Layout table for big-endian machines.
pub const BIG_ENDIAN: ByteLayout = ByteLayout { lo: 1, hi: 0 };

/// The byte order of the simulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// Least-significant byte at the lower address.
    #[default]
    Little,
    /// Most-significant byte at the lower address.
    Big,
}
impl ByteOrder {
    /// The layout table for this byte order.
    pub const fn layout(self) -> ByteLayout {
        match self {
            ByteOrder::Little => LITTLE_ENDIAN,
            ByteOrder::Big    => BIG_ENDIAN,
        }
    }

    /// Reads the byte of a 16-bit register found at `offset` (only the lowest bit of the offset matters).
    pub fn read_byte(self, reg: u16, offset: u16) -> u8 {
        match (offset & 1) == self.layout().lo {
            true  => reg as u8,
            false => (reg >> 8) as u8,
        }
    }
    /// Returns the 16-bit register with the byte at `offset` replaced.
    pub fn write_byte(self, reg: u16, offset: u16, byte: u8) -> u16 {
        match (offset & 1) == self.layout().lo {
            true  => (reg & 0xFF00) | u16::from(byte),
            false => (reg & 0x00FF) | u16::from(byte) << 8,
        }
    }
    /// Joins two adjacent byte registers (at even offset `pair[0]`, odd offset `pair[1]`) into a word.
    pub fn join(self, pair: [u8; 2]) -> u16 {
        let ByteLayout { lo, hi } = self.layout();
        u16::from(pair[lo as usize]) | u16::from(pair[hi as usize]) << 8
    }
    /// Splits a word into two adjacent byte registers (even offset first).
    pub fn split(self, word: u16) -> [u8; 2] {
        let ByteLayout { lo, hi } = self.layout();
        let mut pair = [0; 2];
        pair[lo as usize] = word as u8;
        pair[hi as usize] = (word >> 8) as u8;
        pair
    }

    /// The tag byte used for this byte order in trace files.
    pub(crate) fn tag(self) -> u8 {
        match self {
            ByteOrder::Little => 0,
            ByteOrder::Big    => 1,
        }
    }
    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ByteOrder::Little),
            1 => Some(ByteOrder::Big),
            _ => None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteOrder, Field};

    #[test]
    fn test_field_masks() {
        assert_eq!(Field::bit(0).mask(), 0x0001);
        assert_eq!(Field::new(4, 2).mask(), 0x0030);
        assert_eq!(Field::new(0, 16).mask(), 0xFFFF);
        assert_eq!(Field::new(8, 8).mask(), 0xFF00);
    }

    #[test]
    fn test_field_set_preserves_other_bits() {
        let f = Field::new(6, 2);
        let reg = f.set(0xFFFF, 0b01);
        assert_eq!(reg, 0xFF7F);
        assert_eq!(f.get(reg), 0b01);

        // Oversized values are truncated to the field
        assert_eq!(f.set(0, 0b111), 0x00C0);
    }

    #[test]
    fn test_bit_flags() {
        let ie = Field::bit(1);
        let reg = ie.with(0, true);
        assert!(ie.is_set(reg));
        assert!(!ie.is_set(ie.with(reg, false)));
    }

    #[test]
    fn test_byte_order_tables() {
        let reg = 0x1234;
        assert_eq!(ByteOrder::Little.read_byte(reg, 0), 0x34);
        assert_eq!(ByteOrder::Little.read_byte(reg, 1), 0x12);
        assert_eq!(ByteOrder::Big.read_byte(reg, 0), 0x12);
        assert_eq!(ByteOrder::Big.read_byte(reg, 1), 0x34);

        assert_eq!(ByteOrder::Little.write_byte(reg, 1, 0xAB), 0xAB34);
        assert_eq!(ByteOrder::Big.write_byte(reg, 1, 0xAB), 0x12AB);

        assert_eq!(ByteOrder::Little.join([0x34, 0x12]), 0x1234);
        assert_eq!(ByteOrder::Big.join([0x12, 0x34]), 0x1234);
        assert_eq!(ByteOrder::Big.split(0x1234), [0x12, 0x34]);
        assert_eq!(ByteOrder::Little.split(0x1234), [0x34, 0x12]);
    }
}
