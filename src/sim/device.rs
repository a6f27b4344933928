//! Memory-mapped peripheral devices and the IO bus which dispatches to them.
//!
//! The core types here are:
//! - [`Device`]: A peripheral which can be connected to the machine.
//! - [`IoBus`]: The registry of devices, which routes each register access to the device owning its address.
//! - [`DevCtx`]: The view of the rest of the machine a device gets during each of its operations.
//!
//! All mutable state of a device lives in its [`Device::State`], a plain-data type which is
//! copied byte-for-byte into checkpoints. Anything outside of the state (names, clock domain
//! handles, signal handles) is fixed once the machine is built.
//!
//! This module also provides some reference devices:
//! - [`RegisterBank`]: Plain byte registers.
//! - [`GpioPort`]: A digital IO port with edge-detecting inputs.
//! - [`Timer`]: A 16-bit timer counting cycles of a clock domain.
//! - [`ClockControl`]: Register front-end to the clock tree.
//! - [`Uart`]: A byte-oriented serial interface.

pub mod bank;
pub mod gpio;
pub mod timer;
pub mod clock_ctl;
pub mod uart;

use std::any::Any;

use bytemuck::Pod;
use log::{error, trace, warn};

pub use bank::RegisterBank;
pub use gpio::{GpioPort, GpioState};
pub use timer::{Timer, TimerState};
pub use clock_ctl::ClockControl;
pub use uart::{Uart, UartState};

use crate::err::ConfigErr;

use super::clock::{ClockTree, DomainId};
use super::packet::PacketLog;
use super::regs::ByteOrder;
use super::trace::{SignalId, Tracer};
use super::SimErr;

/// Number of addresses in the IO address space.
pub const ADDR_SPACE: usize = 1 << 16;

/// The width of a register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    /// 8-bit access.
    Byte,
    /// 16-bit access. Word accesses are aligned down to an even address.
    Word,
}
impl Width {
    /// Aligns an address for an access of this width.
    pub fn align(self, addr: u16) -> u16 {
        match self {
            Width::Byte => addr,
            Width::Word => addr & !1,
        }
    }
    /// Truncates a value to this width.
    pub fn truncate(self, value: u16) -> u16 {
        match self {
            Width::Byte => value & 0xFF,
            Width::Word => value,
        }
    }
}

/// Handle to a device registered on an [`IoBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) u16);
impl DeviceId {
    /// The registration index of this device.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// A peripheral which is accessed through memory-mapped registers.
///
/// Register offsets passed to [`Device::read`] and [`Device::write`] are relative to the
/// base of the device's address range.
pub trait Device: Send + 'static {
    /// All mutable state of the device.
    ///
    /// This is saved and restored byte-for-byte by checkpoints,
    /// so it must be plain data (no pointers, no padding).
    type State: Pod;

    /// The name of the device (also used as the module name of its trace signals).
    fn name(&self) -> &str;

    /// The device's state.
    fn state(&self) -> &Self::State;

    /// Mutable access to the device's state.
    fn state_mut(&mut self) -> &mut Self::State;

    /// Resets the device.
    ///
    /// The state must end up identical to the state at construction.
    fn reset(&mut self, ctx: &mut DevCtx<'_>);

    /// Reads the register at the given offset.
    fn read(&mut self, offset: u16, width: Width, ctx: &mut DevCtx<'_>) -> u16;

    /// Writes the register at the given offset.
    fn write(&mut self, offset: u16, width: Width, value: u16, ctx: &mut DevCtx<'_>);

    /// Called once every simulation step, after the clock tree has advanced.
    ///
    /// [`DevCtx::cycles`] holds the cycles each clock domain gained during the step.
    fn update(&mut self, _ctx: &mut DevCtx<'_>) {}

    /// Called once when the device is added to a machine, to register its trace signals.
    fn attach(&mut self, _tracer: &mut Tracer) -> Result<(), ConfigErr> {
        Ok(())
    }

    /// An input line of this device was driven by another device or by the board.
    fn input(&mut self, _line: u8, _level: bool, _ctx: &mut DevCtx<'_>) {}

    /// A byte was delivered to this device from outside of the machine.
    ///
    /// This returns whether the device accepted the byte.
    fn receive(&mut self, _byte: u8, _ctx: &mut DevCtx<'_>) -> bool {
        false
    }
}

/// Object-safe dispatch to a [`Device`].
trait Slot: Send {
    fn name(&self) -> &str;
    fn state_bytes(&self) -> &[u8];
    fn load_state(&mut self, bytes: &[u8]);
    fn bus_reset(&mut self, ctx: &mut DevCtx<'_>);
    fn bus_read(&mut self, offset: u16, width: Width, ctx: &mut DevCtx<'_>) -> u16;
    fn bus_write(&mut self, offset: u16, width: Width, value: u16, ctx: &mut DevCtx<'_>);
    fn bus_update(&mut self, ctx: &mut DevCtx<'_>);
    fn bus_input(&mut self, line: u8, level: bool, ctx: &mut DevCtx<'_>);
    fn bus_receive(&mut self, byte: u8, ctx: &mut DevCtx<'_>) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
impl<D: Device> Slot for D {
    fn name(&self) -> &str {
        Device::name(self)
    }
    fn state_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self.state())
    }
    fn load_state(&mut self, bytes: &[u8]) {
        // Sizes are checked before any state is loaded.
        bytemuck::bytes_of_mut(self.state_mut()).copy_from_slice(bytes);
    }
    fn bus_reset(&mut self, ctx: &mut DevCtx<'_>) {
        self.reset(ctx)
    }
    fn bus_read(&mut self, offset: u16, width: Width, ctx: &mut DevCtx<'_>) -> u16 {
        self.read(offset, width, ctx)
    }
    fn bus_write(&mut self, offset: u16, width: Width, value: u16, ctx: &mut DevCtx<'_>) {
        self.write(offset, width, value, ctx)
    }
    fn bus_update(&mut self, ctx: &mut DevCtx<'_>) {
        self.update(ctx)
    }
    fn bus_input(&mut self, line: u8, level: bool, ctx: &mut DevCtx<'_>) {
        self.input(line, level, ctx)
    }
    fn bus_receive(&mut self, byte: u8, ctx: &mut DevCtx<'_>) -> bool {
        self.receive(byte, ctx)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct DeviceSlot {
    dev: Box<dyn Slot>,
    base: u16,
    size: u32,
    state_size: usize,
    /// State at construction.
    initial: Box<[u8]>,
}
impl std::fmt::Debug for DeviceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSlot")
            .field("name", &self.dev.name())
            .field("base", &self.base)
            .field("size", &self.size)
            .field("state_size", &self.state_size)
            .finish_non_exhaustive()
    }
}

/// The parts of the machine devices can reach during an operation.
pub(crate) struct Env<'a> {
    pub(crate) clock: &'a mut ClockTree,
    pub(crate) tracer: &'a mut Tracer,
    pub(crate) packets: Option<&'a mut (dyn PacketLog + 'static)>,
    pub(crate) outbox: &'a mut Vec<u8>,
    pub(crate) byte_order: ByteOrder,
}
impl Env<'_> {
    fn ctx<'b>(&'b mut self, id: DeviceId, peers: Option<Peers<'b>>) -> DevCtx<'b> {
        DevCtx {
            clock: &mut *self.clock,
            tracer: &mut *self.tracer,
            packets: self.packets.as_deref_mut(),
            outbox: &mut *self.outbox,
            byte_order: self.byte_order,
            peers,
            id,
        }
    }
}

/// The other devices on the bus, as seen by the device currently in an operation.
struct Peers<'a> {
    ports: &'a [u16],
    before: &'a mut [DeviceSlot],
    after: &'a mut [DeviceSlot],
}
impl Peers<'_> {
    fn slot_mut(&mut self, index: usize) -> Option<&mut DeviceSlot> {
        use std::cmp::Ordering;

        let split = self.before.len();
        match index.cmp(&split) {
            Ordering::Less    => self.before.get_mut(index),
            Ordering::Equal   => None,
            Ordering::Greater => self.after.get_mut(index - split - 1),
        }
    }
}

enum PeerTarget {
    Addr(u16),
    Id(DeviceId),
}

/// Context given to a device during each of its operations.
///
/// Through this, a device can read the simulated time, record trace signals,
/// reconfigure the clock tree, log packets, send bytes out of the machine,
/// and access the registers and input lines of other devices.
pub struct DevCtx<'a> {
    clock: &'a mut ClockTree,
    tracer: &'a mut Tracer,
    packets: Option<&'a mut (dyn PacketLog + 'static)>,
    outbox: &'a mut Vec<u8>,
    byte_order: ByteOrder,
    peers: Option<Peers<'a>>,
    id: DeviceId,
}
impl DevCtx<'_> {
    /// The ID of the device in this operation.
    pub fn id(&self) -> DeviceId {
        self.id
    }
    /// The current simulated time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.clock.nanotime()
    }
    /// The cycles a clock domain gained during the current step.
    pub fn cycles(&self, domain: DomainId) -> u64 {
        self.clock.last_increment(domain)
    }
    /// The byte order of the machine.
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }
    /// The clock tree.
    pub fn clock(&self) -> &ClockTree {
        self.clock
    }
    /// Mutable access to the clock tree, for clock control peripherals.
    pub fn clock_mut(&mut self) -> &mut ClockTree {
        self.clock
    }
    /// Records a value of a trace signal at the current simulated time.
    pub fn record(&mut self, signal: SignalId, value: u64) {
        let now = self.clock.nanotime();
        self.tracer.record(signal, value, now);
    }
    /// The packet log, if one is attached.
    pub fn packets(&mut self) -> Option<&mut (dyn PacketLog + 'static)> {
        self.packets.as_deref_mut()
    }
    /// Queues a byte to be sent out of the machine at the end of the step.
    pub fn transmit(&mut self, byte: u8) {
        self.outbox.push(byte);
    }

    fn with_peer<R>(&mut self, target: PeerTarget, f: impl FnOnce(&mut DeviceSlot, &mut DevCtx<'_>) -> R) -> Option<R> {
        let DevCtx { clock, tracer, packets, outbox, byte_order, peers, id } = self;

        // Peers are only visible one level deep.
        let Some(peers) = peers else {
            warn!("device {} accessed a peer from within a peer access", id.0);
            return None;
        };
        let index = match target {
            PeerTarget::Addr(addr) => usize::from(peers.ports[usize::from(addr)].checked_sub(1)?),
            PeerTarget::Id(peer) => peer.index(),
        };
        let slot = peers.slot_mut(index)?;

        let mut ctx = DevCtx {
            clock: &mut **clock,
            tracer: &mut **tracer,
            packets: packets.as_deref_mut(),
            outbox: &mut **outbox,
            byte_order: *byte_order,
            peers: None,
            id: DeviceId(index as u16),
        };
        Some(f(slot, &mut ctx))
    }

    /// Reads a register of another device.
    ///
    /// Reading an unmapped address (or one of this device's own registers) is logged and returns 0.
    pub fn peer_read(&mut self, addr: u16, width: Width) -> u16 {
        let addr = width.align(addr);
        let value = self.with_peer(PeerTarget::Addr(addr), |slot, ctx| {
            width.truncate(slot.dev.bus_read(addr - slot.base, width, ctx))
        });
        value.unwrap_or_else(|| {
            warn!("device {} read unreachable peer address {addr:#06X}", self.id.0);
            0
        })
    }
    /// Writes a register of another device.
    ///
    /// Writing an unmapped address (or one of this device's own registers) is logged and discarded.
    pub fn peer_write(&mut self, addr: u16, width: Width, value: u16) {
        let addr = width.align(addr);
        let done = self.with_peer(PeerTarget::Addr(addr), |slot, ctx| {
            slot.dev.bus_write(addr - slot.base, width, width.truncate(value), ctx)
        });
        if done.is_none() {
            warn!("device {} wrote unreachable peer address {addr:#06X}", self.id.0);
        }
    }
    /// Drives an input line of another device.
    pub fn drive(&mut self, peer: DeviceId, line: u8, level: bool) {
        let done = self.with_peer(PeerTarget::Id(peer), |slot, ctx| {
            slot.dev.bus_input(line, level, ctx)
        });
        if done.is_none() {
            warn!("device {} drove line {line} of unreachable device {}", self.id.0, peer.0);
        }
    }
}

/// The central hub for all devices of the machine.
///
/// The bus owns every device and keeps a direct-mapped table from each address
/// of the 16-bit IO space to the device owning it.
pub struct IoBus {
    slots: Vec<DeviceSlot>,
    /// For each address, the owning device's index plus one (0 if unmapped).
    ports: Box<[u16]>,
    max_devices: usize,
}

impl IoBus {
    /// Creates a new bus holding at most `max_devices` devices.
    pub fn new(max_devices: usize) -> Self {
        Self {
            slots: vec![],
            ports: vec![0; ADDR_SPACE].into_boxed_slice(),
            max_devices: max_devices.min(usize::from(u16::MAX)),
        }
    }

    /// Checks whether a device could be registered at `[base, base + size)`.
    pub fn check_range(&self, base: u16, size: u32) -> Result<(), ConfigErr> {
        let end = u32::from(base) + size;
        if size == 0 || end as usize > ADDR_SPACE {
            return Err(ConfigErr::InvalidRange { base, size });
        }
        if self.slots.len() >= self.max_devices {
            return Err(ConfigErr::RegistryFull(self.max_devices));
        }
        let conflict = self.ports[usize::from(base)..end as usize]
            .iter()
            .find_map(|&p| p.checked_sub(1));
        if let Some(owner) = conflict {
            let owner = self.slots[usize::from(owner)].dev.name().to_string();
            return Err(ConfigErr::RangeConflict { base, end, owner });
        }
        Ok(())
    }

    /// Registers a device at the address range `[base, base + size)`.
    ///
    /// # Errors
    /// The cases where the device cannot be added include:
    /// - The range is empty or extends past the address space ([`ConfigErr::InvalidRange`]).
    /// - The bus already holds its maximum number of devices ([`ConfigErr::RegistryFull`]).
    /// - The range overlaps the range of another device ([`ConfigErr::RangeConflict`]).
    pub fn register<D: Device>(&mut self, dev: D, base: u16, size: u32) -> Result<DeviceId, ConfigErr> {
        self.check_range(base, size)?;

        let index = self.slots.len();
        let initial: Box<[u8]> = bytemuck::bytes_of(dev.state()).into();
        self.slots.push(DeviceSlot {
            dev: Box::new(dev),
            base,
            size,
            state_size: initial.len(),
            initial,
        });

        let end = usize::from(base) + size as usize;
        self.ports[usize::from(base)..end].fill(index as u16 + 1);

        Ok(DeviceId(index as u16))
    }

    /// The number of registered devices.
    pub fn len(&self) -> usize {
        self.slots.len()
    }
    /// Whether no devices are registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
    /// IDs of all devices, in registration order.
    pub fn ids(&self) -> impl Iterator<Item=DeviceId> {
        (0..self.slots.len() as u16).map(DeviceId)
    }

    /// The device owning an address.
    pub fn owner(&self, addr: u16) -> Option<DeviceId> {
        self.ports[usize::from(addr)].checked_sub(1).map(DeviceId)
    }
    /// The address range of a device, as `(base, size)`.
    pub fn range(&self, id: DeviceId) -> Option<(u16, u32)> {
        self.slots.get(id.index()).map(|s| (s.base, s.size))
    }
    /// The name of a device.
    pub fn name(&self, id: DeviceId) -> Option<&str> {
        self.slots.get(id.index()).map(|s| s.dev.name())
    }
    /// The size of a device's state, as recorded at registration.
    pub fn state_size(&self, id: DeviceId) -> Option<usize> {
        self.slots.get(id.index()).map(|s| s.state_size)
    }
    /// The current state of a device, as bytes.
    pub fn state_bytes(&self, id: DeviceId) -> Option<&[u8]> {
        self.slots.get(id.index()).map(|s| s.dev.state_bytes())
    }

    /// Gets a device by its ID.
    ///
    /// This returns `None` if there is no such device or if it is not a `D`.
    pub fn device<D: Device>(&self, id: DeviceId) -> Option<&D> {
        self.slots.get(id.index())?.dev.as_any().downcast_ref()
    }
    /// Gets a device mutably by its ID.
    ///
    /// This returns `None` if there is no such device or if it is not a `D`.
    pub fn device_mut<D: Device>(&mut self, id: DeviceId) -> Option<&mut D> {
        self.slots.get_mut(id.index())?.dev.as_any_mut().downcast_mut()
    }

    /// Runs an operation on one device, with every other device visible as a peer.
    fn with_device<R>(&mut self, index: usize, env: &mut Env<'_>, f: impl FnOnce(&mut DeviceSlot, &mut DevCtx<'_>) -> R) -> Option<R> {
        if index >= self.slots.len() { return None };
        let (before, rest) = self.slots.split_at_mut(index);
        let (slot, after) = rest.split_first_mut()?;
        let peers = Peers { ports: &self.ports, before, after };

        let mut ctx = env.ctx(DeviceId(index as u16), Some(peers));
        Some(f(slot, &mut ctx))
    }

    /// Reads the register at the given address.
    ///
    /// An access to an address owned by no device is logged and reads 0.
    pub(crate) fn read(&mut self, addr: u16, width: Width, env: &mut Env<'_>) -> u16 {
        let addr = width.align(addr);
        let Some(id) = self.owner(addr) else {
            warn!("read from unmapped address {addr:#06X}");
            return 0;
        };

        let value = self.with_device(id.index(), env, |slot, ctx| {
            slot.dev.bus_read(addr - slot.base, width, ctx)
        });
        let value = width.truncate(value.unwrap_or(0));
        trace!("read {addr:#06X} -> {value:#06X}");
        value
    }

    /// Writes the register at the given address.
    ///
    /// An access to an address owned by no device is logged and discarded.
    pub(crate) fn write(&mut self, addr: u16, width: Width, value: u16, env: &mut Env<'_>) {
        let addr = width.align(addr);
        let Some(id) = self.owner(addr) else {
            warn!("write of {value:#06X} to unmapped address {addr:#06X} discarded");
            return;
        };

        trace!("write {addr:#06X} <- {value:#06X}");
        self.with_device(id.index(), env, |slot, ctx| {
            slot.dev.bus_write(addr - slot.base, width, width.truncate(value), ctx)
        });
    }

    /// Resets every device in registration order.
    ///
    /// A device whose state differs from its construction state after reset is logged.
    pub(crate) fn reset_all(&mut self, env: &mut Env<'_>) {
        for i in 0..self.slots.len() {
            self.with_device(i, env, |slot, ctx| {
                slot.dev.bus_reset(ctx);
                if slot.dev.state_bytes() != &*slot.initial {
                    error!("device `{}` did not return to its initial state on reset", slot.dev.name());
                }
            });
        }
    }

    /// Updates every device in registration order.
    pub(crate) fn update_all(&mut self, env: &mut Env<'_>) {
        for i in 0..self.slots.len() {
            self.with_device(i, env, |slot, ctx| slot.dev.bus_update(ctx));
        }
    }

    /// Drives an input line of a device.
    pub(crate) fn input(&mut self, id: DeviceId, line: u8, level: bool, env: &mut Env<'_>) {
        let done = self.with_device(id.index(), env, |slot, ctx| slot.dev.bus_input(line, level, ctx));
        if done.is_none() {
            warn!("drove line {line} of unknown device {}", id.0);
        }
    }

    /// Delivers a byte to a device, returning whether it was accepted.
    pub(crate) fn receive(&mut self, id: DeviceId, byte: u8, env: &mut Env<'_>) -> bool {
        self.with_device(id.index(), env, |slot, ctx| slot.dev.bus_receive(byte, ctx))
            .unwrap_or(false)
    }

    /// Copies the state of every device.
    pub(crate) fn save_states(&self) -> Result<Vec<Box<[u8]>>, SimErr> {
        self.slots.iter()
            .map(|slot| {
                let bytes = slot.dev.state_bytes();
                match bytes.len() == slot.state_size {
                    true  => Ok(bytes.into()),
                    false => Err(SimErr::StateSizeMismatch {
                        device: slot.dev.name().to_string(),
                        expected: slot.state_size,
                        actual: bytes.len(),
                    }),
                }
            })
            .collect()
    }

    /// Checks that saved states fit the registered devices.
    pub(crate) fn check_states(&self, states: &[Box<[u8]>]) -> Result<(), SimErr> {
        if states.len() != self.slots.len() {
            return Err(SimErr::CheckpointLayout { what: "device registry", saved: states.len(), live: self.slots.len() });
        }
        for (slot, state) in self.slots.iter().zip(states) {
            if state.len() != slot.state_size {
                return Err(SimErr::StateSizeMismatch {
                    device: slot.dev.name().to_string(),
                    expected: slot.state_size,
                    actual: state.len(),
                });
            }
        }
        Ok(())
    }

    /// Overwrites the state of every device.
    ///
    /// The states must have been checked with [`IoBus::check_states`].
    pub(crate) fn load_states(&mut self, states: &[Box<[u8]>]) {
        for (slot, state) in self.slots.iter_mut().zip(states) {
            slot.dev.load_state(state);
        }
    }
}
impl std::fmt::Debug for IoBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBus")
            .field("slots", &self.slots)
            .field("max_devices", &self.max_devices)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::err::ConfigErr;
    use crate::sim::clock::ClockTree;
    use crate::sim::regs::ByteOrder;
    use crate::sim::trace::{NullSink, Tracer};

    use super::{DevCtx, Device, DeviceId, Env, IoBus, RegisterBank, Width};

    /// Owned parts for an [`Env`] in bus-level tests.
    pub(crate) struct TestEnv {
        pub clock: ClockTree,
        pub tracer: Tracer,
        pub outbox: Vec<u8>,
    }
    impl TestEnv {
        pub fn new() -> Self {
            Self {
                clock: ClockTree::new(),
                tracer: Tracer::new(Box::new(NullSink), 16, 64),
                outbox: vec![],
            }
        }
        pub fn env(&mut self) -> Env<'_> {
            Env {
                clock: &mut self.clock,
                tracer: &mut self.tracer,
                packets: None,
                outbox: &mut self.outbox,
                byte_order: ByteOrder::Little,
            }
        }
    }

    /// Mirrors every write to the device at `target`.
    struct Mirror {
        target: u16,
        writes: [u16; 1],
    }
    impl Device for Mirror {
        type State = [u16; 1];

        fn name(&self) -> &str { "mirror" }
        fn state(&self) -> &Self::State { &self.writes }
        fn state_mut(&mut self) -> &mut Self::State { &mut self.writes }
        fn reset(&mut self, _ctx: &mut DevCtx<'_>) { self.writes = [0]; }
        fn read(&mut self, _offset: u16, width: Width, ctx: &mut DevCtx<'_>) -> u16 {
            ctx.peer_read(self.target, width)
        }
        fn write(&mut self, _offset: u16, width: Width, value: u16, ctx: &mut DevCtx<'_>) {
            self.writes[0] += 1;
            ctx.peer_write(self.target, width, value);
        }
    }

    #[test]
    fn test_register_and_dispatch() {
        let mut t = TestEnv::new();
        let mut bus = IoBus::new(4);
        let id = bus.register(RegisterBank::<16>::new("bank"), 0x0100, 0x10).unwrap();

        bus.write(0x0105, Width::Byte, 0x42, &mut t.env());
        assert_eq!(bus.read(0x0105, Width::Byte, &mut t.env()), 0x42);
        assert_eq!(bus.owner(0x010F), Some(id));
        assert_eq!(bus.owner(0x0110), None);

        // unmapped
        assert_eq!(bus.read(0x0200, Width::Byte, &mut t.env()), 0);
        bus.write(0x0200, Width::Word, 0xFFFF, &mut t.env());
        assert_eq!(bus.read(0x0200, Width::Word, &mut t.env()), 0);
    }

    #[test]
    fn test_word_access_aligns_down() {
        let mut t = TestEnv::new();
        let mut bus = IoBus::new(4);
        bus.register(RegisterBank::<4>::new("bank"), 0x0020, 4).unwrap();

        bus.write(0x0023, Width::Word, 0xBEEF, &mut t.env());
        assert_eq!(bus.read(0x0022, Width::Byte, &mut t.env()), 0xEF);
        assert_eq!(bus.read(0x0023, Width::Byte, &mut t.env()), 0xBE);
        assert_eq!(bus.read(0x0022, Width::Word, &mut t.env()), 0xBEEF);
    }

    #[test]
    fn test_range_conflicts() {
        let mut bus = IoBus::new(3);
        bus.register(RegisterBank::<16>::new("a"), 0x0100, 0x10).unwrap();

        for (base, size) in [(0x0100, 0x10), (0x00F8, 0x09), (0x010F, 1), (0x0000, 0x1000)] {
            let err = bus.register(RegisterBank::<16>::new("b"), base, size).unwrap_err();
            assert!(matches!(err, ConfigErr::RangeConflict { ref owner, .. } if owner == "a"), "{base:#X}+{size:#X}: {err:?}");
        }
        // The failed registrations left the table untouched
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.owner(0x00F8), None);

        // Adjacent ranges are fine
        bus.register(RegisterBank::<16>::new("b"), 0x00F0, 0x10).unwrap();
        bus.register(RegisterBank::<16>::new("c"), 0x0110, 0x10).unwrap();
        assert_eq!(bus.register(RegisterBank::<16>::new("d"), 0x0200, 0x10), Err(ConfigErr::RegistryFull(3)));
    }

    #[test]
    fn test_random_ranges_never_overlap() {
        use rand::{Rng, SeedableRng};
        use rand::rngs::StdRng;

        let mut rng = StdRng::seed_from_u64(1129);
        let mut bus = IoBus::new(64);
        let mut taken = vec![false; super::ADDR_SPACE];

        for _ in 0..500 {
            let base: u16 = rng.gen_range(0..0xFF00);
            let size: u32 = rng.gen_range(1..0x100);
            let range = usize::from(base)..usize::from(base) + size as usize;
            let overlaps = taken[range.clone()].iter().any(|&t| t);

            match bus.register(RegisterBank::<1>::new("r"), base, size) {
                Ok(_) => {
                    assert!(!overlaps);
                    taken[range].fill(true);
                },
                Err(ConfigErr::RangeConflict { .. }) => assert!(overlaps),
                Err(ConfigErr::RegistryFull(_)) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
    }

    #[test]
    fn test_invalid_ranges() {
        let mut bus = IoBus::new(3);
        assert!(matches!(bus.register(RegisterBank::<1>::new("a"), 0x10, 0), Err(ConfigErr::InvalidRange { .. })));
        assert!(matches!(bus.register(RegisterBank::<1>::new("a"), 0xFFFF, 2), Err(ConfigErr::InvalidRange { .. })));
        bus.register(RegisterBank::<1>::new("a"), 0xFFFF, 1).unwrap();
    }

    #[test]
    fn test_peer_access() {
        let mut t = TestEnv::new();
        let mut bus = IoBus::new(4);
        let bank = bus.register(RegisterBank::<4>::new("bank"), 0x0000, 4).unwrap();
        let mirror = bus.register(Mirror { target: 0x0002, writes: [0] }, 0x0010, 2).unwrap();

        bus.write(0x0010, Width::Word, 0x1234, &mut t.env());
        assert_eq!(bus.read(0x0002, Width::Word, &mut t.env()), 0x1234);
        assert_eq!(bus.read(0x0010, Width::Word, &mut t.env()), 0x1234);

        // A device cannot reach itself through the peer interface.
        bus.device_mut::<Mirror>(mirror).unwrap().target = 0x0010;
        assert_eq!(bus.read(0x0010, Width::Word, &mut t.env()), 0);

        assert!(bus.device::<RegisterBank<4>>(bank).is_some());
        assert!(bus.device::<Mirror>(bank).is_none());
        assert!(bus.device::<Mirror>(DeviceId(7)).is_none());
    }

    #[test]
    fn test_state_layout_checks() {
        let mut bus = IoBus::new(4);
        bus.register(RegisterBank::<4>::new("bank"), 0x0000, 4).unwrap();
        let states = bus.save_states().unwrap();
        assert_eq!(&*states[0], &[0; 4]);
        bus.check_states(&states).unwrap();

        assert!(bus.check_states(&[]).is_err());
        assert!(bus.check_states(&[vec![0; 3].into_boxed_slice()]).is_err());
    }
}
