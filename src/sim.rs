//! Simulation of a microcontroller's peripheral subsystem.
//!
//! This module is focused on the parts of a machine which every peripheral shares:
//! the IO bus, the clock tree, the event tracer, and checkpoints.
//!
//! This module consists of:
//! - [`Machine`]: The struct that owns and steps the simulated machine.
//! - [`device`]: The module handling the IO bus and the devices connected to it.
//! - [`clock`]: The module handling oscillators and the clock domains derived from them.
//! - [`trace`]: The module handling the event tracer and trace files.
//! - [`checkpoint`]: The module handling machine checkpoints (backtracking).
//! - [`packet`], [`link`]: The modules handling traffic in and out of the machine.
//! - [`debug`]: The module handling types of breakpoints for the machine.
//!
//! # Usage
//!
//! A machine is assembled once by a board integrator, who creates the clock tree,
//! then adds each device at its address range:
//!
//! ```
//! use mcu_sim::sim::{Machine, MachineFlags};
//! use mcu_sim::sim::clock::ClockTree;
//! use mcu_sim::sim::device::{RegisterBank, Width};
//!
//! let (clock, _) = ClockTree::standard();
//! let mut machine = Machine::new(MachineFlags::default(), clock);
//! machine.add_device(RegisterBank::<16>::new("bank"), 0x0100, 0x10).unwrap();
//!
//! machine.write(0x0105, Width::Byte, 0x42);
//! assert_eq!(machine.read(0x0105, Width::Byte), 0x42);
//!
//! // one millisecond of simulated time
//! machine.run_for(1_000_000).unwrap();
//! assert_eq!(machine.nanotime(), 1_000_000);
//! ```
//!
//! ## Flags
//!
//! All of the available flags can be found in [`MachineFlags`].
//!
//! ## Checkpoints
//!
//! [`Machine::save`] captures the entire machine into a single checkpoint slot,
//! and [`Machine::restore`] returns the machine to it:
//!
//! ```
//! # use mcu_sim::sim::{Machine, MachineFlags};
//! # use mcu_sim::sim::clock::ClockTree;
//! # use mcu_sim::sim::device::{RegisterBank, Width};
//! # let (clock, _) = ClockTree::standard();
//! # let mut machine = Machine::new(MachineFlags::default(), clock);
//! # machine.add_device(RegisterBank::<16>::new("bank"), 0x0100, 0x10).unwrap();
//! machine.write(0x0100, Width::Byte, 1);
//! machine.save().unwrap();
//!
//! machine.write(0x0100, Width::Byte, 2);
//! machine.run_for(5_000).unwrap();
//!
//! machine.restore().unwrap();
//! assert_eq!(machine.read(0x0100, Width::Byte), 1);
//! assert_eq!(machine.nanotime(), 0);
//! ```
pub mod regs;
pub mod clock;
pub mod trace;
pub mod device;
pub mod packet;
pub mod link;
pub mod checkpoint;
pub mod debug;
pub mod observer;

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use crate::err::ConfigErr;

use self::checkpoint::Checkpoint;
use self::clock::ClockTree;
use self::debug::Breakpoint;
use self::device::{Device, DeviceId, Env, IoBus, Width};
use self::link::ChannelLink;
use self::observer::{AccessObserver, AccessSet};
use self::packet::PacketLog;
use self::regs::ByteOrder;
use self::trace::{NullSink, SignalId, TraceSink, Tracer};

/// Errors that stop the simulation.
///
/// These indicate that the machine can no longer be simulated reproducibly.
/// Errors that only occur while building a machine are found in [`ConfigErr`].
#[derive(Debug, Error)]
pub enum SimErr {
    /// The machine was misconfigured.
    #[error(transparent)]
    Config(#[from] ConfigErr),
    /// A restore was requested before any state was saved.
    #[error("restore called without a saved checkpoint")]
    RestoreWithoutSave,
    /// A device's state does not have the size recorded when it was registered.
    #[error("state of device `{device}` is {actual} bytes, expected {expected}")]
    StateSizeMismatch {
        /// Name of the device.
        device: String,
        /// Size recorded at registration.
        expected: usize,
        /// Size found.
        actual: usize
    },
    /// A checkpoint does not fit the machine it is applied to.
    #[error("checkpoint does not match the machine: {what} has {saved} entries saved, {live} live")]
    CheckpointLayout {
        /// The part of the machine which differs.
        what: &'static str,
        /// Number of entries in the checkpoint.
        saved: usize,
        /// Number of entries in the machine.
        live: usize
    },
    /// A cycle or time counter overflowed.
    #[error("counter of `{0}` overflowed")]
    CounterOverflow(String),
    /// The trace could not be written.
    #[error("trace output failed: {0}")]
    TraceIo(#[from] std::io::Error),
}

/// Reason for why a run paused if it wasn't due to an error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
enum PauseCondition {
    /// The run was stopped through the stop handle.
    Stopped,
    /// The run hit a breakpoint.
    Breakpoint,
    /// The run hit a tripwire condition.
    Tripwire,
    /// The run hit an error and did not pause successfully.
    #[default]
    Unsuccessful
}

/// Configuration flags for [`Machine`].
///
/// These can be modified after the `Machine` is created with [`Machine::new`]
/// and their effects should still apply, unless noted otherwise.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct MachineFlags {
    /// The byte order used to serve byte accesses to word registers.
    ///
    /// By default, this flag is [`ByteOrder::Little`].
    pub byte_order: ByteOrder,

    /// The maximum number of devices on the bus.
    ///
    /// This flag only goes into effect in `Machine::new`.
    ///
    /// By default, this flag is `32`.
    pub max_devices: usize,

    /// The maximum number of trace signals.
    ///
    /// This flag only goes into effect in `Machine::new`.
    ///
    /// By default, this flag is `256`.
    pub max_signals: usize,

    /// The number of buffered samples at which the tracer flushes to its sink.
    ///
    /// This flag only goes into effect in `Machine::new`.
    ///
    /// By default, this flag is `4096`.
    pub trace_block_size: usize,

    /// Whether the tracer records from the start.
    ///
    /// This flag only goes into effect in `Machine::new`.
    /// Afterwards, use [`Tracer::start`] and [`Tracer::stop`].
    ///
    /// By default, this flag is `true`.
    pub trace_on_start: bool,

    /// The elapsed time of each step taken by [`Machine::run_while`] and [`Machine::run_for`], in nanoseconds.
    ///
    /// By default, this flag is `1000`.
    pub step_ns: u64,

    /// Whether register accesses through [`Machine::read`] and [`Machine::write`] are
    /// recorded in [`Machine::observer`].
    ///
    /// By default, this flag is `false`.
    pub observe_accesses: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for MachineFlags {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::Little,
            max_devices: 32,
            max_signals: 256,
            trace_block_size: 4096,
            trace_on_start: true,
            step_ns: 1000,
            observe_accesses: false,
        }
    }
}

/// A simulated machine.
pub struct Machine {
    bus: IoBus,
    clock: ClockTree,
    tracer: Tracer,
    packets: Option<Box<dyn PacketLog>>,
    link: Option<ChannelLink>,

    /// The last saved state.
    checkpoint: Option<Checkpoint>,

    /// Bytes transmitted by devices which have not left the machine yet.
    outbox: Vec<u8>,
    /// Number of transmitted bytes which have left the machine.
    sent: u64,

    /// Indicates whether a run is in progress.
    ///
    /// Clearing this (through [`Machine::stop_handle`]) ends the run at the next step boundary.
    running: Arc<AtomicBool>,

    /// Indicates the reason why the last run (via [`Machine::run_while`] and adjacent) had paused.
    pause_condition: PauseCondition,

    /// The number of steps taken since this `Machine` was created.
    ///
    /// This can be set to 0 to reset the counter.
    pub steps: u64,

    /// Configuration settings for the machine.
    ///
    /// See [`MachineFlags`] for more details on what configuration settings are available.
    pub flags: MachineFlags,

    /// Breakpoints for the machine.
    pub breakpoints: HashSet<Breakpoint>,

    /// Tracks register accesses made from outside the bus.
    pub observer: AccessObserver,
}
impl Machine where Machine: Send {}

impl Machine {
    /// Creates a machine with no devices, driven by the given clock tree.
    ///
    /// The tracer starts with no sink. See [`Machine::set_trace_sink`].
    pub fn new(flags: MachineFlags, clock: ClockTree) -> Self {
        let mut tracer = Tracer::new(Box::new(NullSink), flags.max_signals, flags.trace_block_size);
        if !flags.trace_on_start {
            tracer.stop();
        }

        Self {
            bus: IoBus::new(flags.max_devices),
            clock,
            tracer,
            packets: None,
            link: None,
            checkpoint: None,
            outbox: vec![],
            sent: 0,
            running: Default::default(),
            pause_condition: Default::default(),
            steps: 0,
            flags,
            breakpoints: Default::default(),
            observer: Default::default(),
        }
    }

    /// Splits the machine into its bus and the environment its devices operate in.
    fn split(&mut self) -> (&mut IoBus, Env<'_>) {
        let env = Env {
            clock: &mut self.clock,
            tracer: &mut self.tracer,
            packets: self.packets.as_deref_mut(),
            outbox: &mut self.outbox,
            byte_order: self.flags.byte_order,
        };
        (&mut self.bus, env)
    }

    /// Adds a device to the machine at the address range `[base, base + size)`.
    ///
    /// The device registers its trace signals before it is placed on the bus.
    ///
    /// # Errors
    /// This fails if the range cannot be registered on the bus (see [`IoBus::register`])
    /// or if the device's trace signals cannot be registered.
    pub fn add_device<D: Device>(&mut self, mut dev: D, base: u16, size: u32) -> Result<DeviceId, ConfigErr> {
        self.bus.check_range(base, size)?;
        dev.attach(&mut self.tracer)?;
        let id = self.bus.register(dev, base, size)?;

        info!("added device `{}` at [{base:#06X}, {:#07X})", self.bus.name(id).unwrap_or_default(), u32::from(base) + size);
        Ok(id)
    }

    /// Attaches a packet log, which every communication peripheral reports its traffic to.
    pub fn attach_packet_log(&mut self, log: Box<dyn PacketLog>) {
        self.packets = Some(log);
    }
    /// Attaches a co-simulation link.
    ///
    /// Inbound bytes are delivered to the link's target at the start of every step,
    /// and the bytes devices transmit are sent through the link at the end of every step.
    pub fn attach_link(&mut self, link: ChannelLink) {
        if self.bus.name(link.target()).is_none() {
            warn!("co-simulation link targets unknown device {}", link.target().index());
        }
        self.link = Some(link);
    }
    /// Replaces the tracer's sink.
    ///
    /// The sink only receives samples flushed after this call.
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        let now = self.clock.nanotime();
        self.tracer.set_sink(sink, now);
    }

    /// Reads the register at the given address, with all of its side effects.
    ///
    /// An access to an address owned by no device is logged and reads 0.
    pub fn read(&mut self, addr: u16, width: Width) -> u16 {
        let (bus, mut env) = self.split();
        let value = bus.read(addr, width, &mut env);

        if self.flags.observe_accesses {
            let addr = width.align(addr);
            let mut set = AccessSet::READ;
            if self.bus.owner(addr).is_none() {
                set |= AccessSet::UNMAPPED;
            }
            self.observer.update_accesses(addr, set);
        }
        value
    }

    /// Writes the register at the given address.
    ///
    /// An access to an address owned by no device is logged and discarded.
    pub fn write(&mut self, addr: u16, width: Width, value: u16) {
        if !self.flags.observe_accesses {
            let (bus, mut env) = self.split();
            bus.write(addr, width, value, &mut env);
            return;
        }

        let addr = width.align(addr);
        let owner = self.bus.owner(addr);
        let before = owner.and_then(|id| self.bus.state_bytes(id)).map(<[u8]>::to_vec);

        let (bus, mut env) = self.split();
        bus.write(addr, width, value, &mut env);

        let mut set = AccessSet::WRITTEN;
        match owner {
            Some(id) if self.bus.state_bytes(id) != before.as_deref() => set |= AccessSet::MODIFIED,
            Some(_) => {},
            None => set |= AccessSet::UNMAPPED,
        }
        self.observer.update_accesses(addr, set);
    }

    /// Drives an input line of a device from the board.
    pub fn drive(&mut self, id: DeviceId, line: u8, level: bool) {
        let (bus, mut env) = self.split();
        bus.input(id, line, level, &mut env);
    }

    /// Delivers bytes from outside the machine to a device.
    ///
    /// This returns the number of bytes the device accepted.
    pub fn deliver(&mut self, id: DeviceId, bytes: &[u8]) -> usize {
        let (bus, mut env) = self.split();
        let accepted = bytes.iter()
            .filter(|&&b| bus.receive(id, b, &mut env))
            .count();

        if accepted < bytes.len() {
            warn!("device {} dropped {} of {} delivered bytes", id.index(), bytes.len() - accepted, bytes.len());
        }
        accepted
    }

    /// Records a value of a board-level trace signal at the current simulated time.
    pub fn record(&mut self, signal: SignalId, value: u64) {
        let now = self.clock.nanotime();
        self.tracer.record(signal, value, now);
    }

    /// Simulates `elapsed_ns` nanoseconds.
    ///
    /// A step consists of:
    /// 1. delivering the bytes which arrived over the link,
    /// 2. advancing the clock tree (oscillators, then clock domains),
    /// 3. updating every device in registration order,
    /// 4. sending the bytes devices transmitted over the link.
    pub fn step(&mut self, elapsed_ns: u64) -> Result<(), SimErr> {
        if let Some(link) = &mut self.link {
            let target = link.target();
            let inbound = link.poll();
            if !inbound.is_empty() {
                self.deliver(target, &inbound);
            }
        }

        self.clock.advance(elapsed_ns)?;

        let (bus, mut env) = self.split();
        bus.update_all(&mut env);

        if let Some(link) = &mut self.link {
            let out = std::mem::take(&mut self.outbox);
            self.sent += out.len() as u64;
            link.send(out);
        }
        self.steps += 1;
        Ok(())
    }

    /// Simulates the time the primary clock domain takes to run `cycles` cycles.
    ///
    /// # Errors
    /// This fails if the clock tree has no primary domain.
    pub fn step_cycles(&mut self, cycles: u64) -> Result<(), SimErr> {
        let ns = self.clock.cycles_to_ns(cycles)?;
        self.step(ns)
    }

    /// Gets a handle which can end a run in progress from another thread.
    ///
    /// Storing `false` into the handle stops the run at the next step boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Runs until the tripwire condition returns false (or any of the typical breaks occur).
    ///
    /// Each step takes [`MachineFlags::step_ns`] nanoseconds.
    ///
    /// The typical break conditions are:
    /// - the stop handle is cleared
    /// - A breakpoint matches
    pub fn run_while(&mut self, mut tripwire: impl FnMut(&mut Machine) -> bool) -> Result<(), SimErr> {
        use std::sync::atomic::Ordering;

        std::mem::take(&mut self.pause_condition);
        self.running.store(true, Ordering::Relaxed);

        let result = loop {
            if !self.running.load(Ordering::Relaxed) {
                break Ok(PauseCondition::Stopped);
            }
            if !tripwire(self) {
                break Ok(PauseCondition::Tripwire);
            }

            if let Err(e) = self.step(self.flags.step_ns.max(1)) {
                break Err(e);
            }

            // After stepping, check that any breakpoints were hit.
            if self.breakpoints.iter().any(|bp| bp.check(self)) {
                break Ok(PauseCondition::Breakpoint);
            }
        };

        self.running.store(false, Ordering::Relaxed);
        self.pause_condition = result?;
        Ok(())
    }

    /// Runs for `duration_ns` nanoseconds of simulated time (or until a typical break occurs).
    ///
    /// The last step is shortened so that the run ends exactly at the requested time.
    pub fn run_for(&mut self, duration_ns: u64) -> Result<(), SimErr> {
        let end = self.clock.nanotime().saturating_add(duration_ns);
        let step_ns = self.flags.step_ns.max(1);

        let result = self.run_while(|m| {
            let left = end.saturating_sub(m.clock.nanotime());
            m.flags.step_ns = left.min(step_ns);
            left > 0
        });
        self.flags.step_ns = step_ns;
        result
    }

    /// Whether the last run paused on a breakpoint.
    pub fn hit_breakpoint(&self) -> bool {
        matches!(self.pause_condition, PauseCondition::Breakpoint)
    }
    /// Whether the last run was ended through the stop handle.
    pub fn was_stopped(&self) -> bool {
        matches!(self.pause_condition, PauseCondition::Stopped)
    }

    /// Saves the machine into its checkpoint slot, replacing any previous checkpoint.
    pub fn save(&mut self) -> Result<(), SimErr> {
        let output = self.sent + self.outbox.len() as u64;
        let cp = Checkpoint::capture(&self.bus, &self.clock, &mut self.tracer, self.packets.as_deref_mut(), output)?;
        info!("saved {} devices at {} ns", self.bus.len(), cp.nanotime());
        self.checkpoint = Some(cp);
        Ok(())
    }

    /// Restores the machine to its checkpoint slot.
    ///
    /// The checkpoint is kept, so the machine can be restored to it again.
    /// Bytes transmitted since the save are withdrawn unless they already left the machine
    /// (over the link or through [`Machine::take_output`]).
    ///
    /// # Errors
    /// This fails with [`SimErr::RestoreWithoutSave`] if no checkpoint was ever saved.
    pub fn restore(&mut self) -> Result<(), SimErr> {
        let cp = self.checkpoint.as_ref().ok_or(SimErr::RestoreWithoutSave)?;
        cp.apply(&mut self.bus, &mut self.clock, &mut self.tracer, self.packets.as_deref_mut())?;

        match cp.output().checked_sub(self.sent) {
            Some(kept) => self.outbox.truncate(usize::try_from(kept).unwrap_or(usize::MAX)),
            None => {
                warn!("{} bytes transmitted after the checkpoint already left the machine", self.sent - cp.output());
                self.outbox.clear();
            }
        }
        info!("restored {} devices to {} ns", self.bus.len(), cp.nanotime());
        Ok(())
    }

    /// Resets the machine.
    ///
    /// This restores the build-time clock configuration and resets every device, while preserving:
    /// - Flags and breakpoints
    /// - The checkpoint slot
    /// - Cycle counters and the simulated time, which never run backwards
    /// - Trace signals
    pub fn reset(&mut self) {
        self.clock.reset();
        let (bus, mut env) = self.split();
        bus.reset_all(&mut env);
        info!("reset {} devices at {} ns", self.bus.len(), self.clock.nanotime());
    }

    /// Flushes the tracer and completes its trace.
    pub fn finish_trace(&mut self) -> Result<(), SimErr> {
        let now = self.clock.nanotime();
        self.tracer.finish(now)?;
        Ok(())
    }

    /// Takes the bytes transmitted by devices while no link is attached.
    pub fn take_output(&mut self) -> Vec<u8> {
        let out = std::mem::take(&mut self.outbox);
        self.sent += out.len() as u64;
        out
    }

    /// The absolute simulated time in nanoseconds.
    pub fn nanotime(&self) -> u64 {
        self.clock.nanotime()
    }
    /// The IO bus.
    pub fn bus(&self) -> &IoBus {
        &self.bus
    }
    /// Gets a device by its ID.
    pub fn device<D: Device>(&self, id: DeviceId) -> Option<&D> {
        self.bus.device(id)
    }
    /// Gets a device mutably by its ID.
    ///
    /// Changes made here bypass the bus, so they are neither observed nor traced.
    pub fn device_mut<D: Device>(&mut self, id: DeviceId) -> Option<&mut D> {
        self.bus.device_mut(id)
    }
    /// The clock tree.
    pub fn clock(&self) -> &ClockTree {
        &self.clock
    }
    /// Mutable access to the clock tree.
    pub fn clock_mut(&mut self) -> &mut ClockTree {
        &mut self.clock
    }
    /// The event tracer.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }
    /// Mutable access to the event tracer (e.g., to register board-level signals).
    pub fn tracer_mut(&mut self) -> &mut Tracer {
        &mut self.tracer
    }
    /// The last saved checkpoint.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }
    /// The co-simulation link, if one is attached.
    pub fn link(&self) -> Option<&ChannelLink> {
        self.link.as_ref()
    }
}
impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("bus", &self.bus)
            .field("clock", &self.clock)
            .field("tracer", &self.tracer)
            .field("link", &self.link)
            .field("saved", &self.checkpoint.as_ref().map(Checkpoint::nanotime))
            .field("steps", &self.steps)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::clock::ClockTree;
    use super::debug::{Breakpoint, Comparator};
    use super::device::{timer, uart, ClockControl, GpioPort, RegisterBank, Timer, Uart, Width};
    use super::link::ChannelLink;
    use super::packet::BufferedPacketLog;
    use super::trace::MemorySink;
    use super::{Machine, MachineFlags, SimErr};

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn bank_machine() -> Machine {
        let (clock, _) = ClockTree::standard();
        let mut m = Machine::new(MachineFlags::default(), clock);
        m.add_device(RegisterBank::<16>::new("bank"), 0x0100, 0x10).unwrap();
        m
    }

    #[test]
    fn test_unmapped_access() {
        init_logs();
        let mut m = bank_machine();

        m.write(0x0105, Width::Byte, 0x42);
        assert_eq!(m.read(0x0105, Width::Byte), 0x42);
        assert_eq!(m.read(0x0200, Width::Byte), 0);
        m.write(0x0200, Width::Byte, 0x42);
        assert_eq!(m.read(0x0200, Width::Byte), 0);
    }

    #[test]
    fn test_exact_clock_ratio() {
        let mut clock = ClockTree::new();
        let osc = clock.add_oscillator("lfxt1", 32_768).unwrap();
        let aclk = clock.add_domain("aclk", osc, 1).unwrap();
        clock.set_primary(aclk).unwrap();

        // One second in one step...
        let mut m = Machine::new(MachineFlags::default(), clock.clone());
        m.step(1_000_000_000).unwrap();
        assert_eq!(m.clock().cycles(aclk), 32_768);

        // ...and in a million steps.
        let mut m = Machine::new(MachineFlags::default(), clock);
        m.run_for(1_000_000_000).unwrap();
        assert_eq!(m.nanotime(), 1_000_000_000);
        assert_eq!(m.clock().cycles(aclk), 32_768);
        assert_eq!(m.steps, 1_000_000);

        m.step_cycles(32_768).unwrap();
        assert_eq!(m.nanotime(), 2_000_000_000);
        assert_eq!(m.clock().cycles(aclk), 65_536);
    }

    #[test]
    fn test_step_cycles_needs_primary() {
        let mut m = Machine::new(MachineFlags::default(), ClockTree::new());
        assert!(matches!(m.step_cycles(1), Err(SimErr::Config(_))));
    }

    #[test]
    fn test_repeated_record() {
        let mut m = Machine::new(MachineFlags::default(), ClockTree::new());
        let sink = MemorySink::new();
        let buffer = sink.get_buffer().clone();
        m.set_trace_sink(Box::new(sink));

        let led = m.tracer_mut().register_signal(1, "led", "board").unwrap();
        m.step(10).unwrap();
        m.record(led, 1);
        m.record(led, 1);
        m.finish_trace().unwrap();

        let samples = buffer.read().unwrap();
        let pairs: Vec<_> = samples.iter().map(|s| (s.signal, s.time, s.value)).collect();
        assert_eq!(pairs, [(led, 0, 0), (led, 10, 1)]);
    }

    #[test]
    fn test_restore_register() {
        let mut m = bank_machine();
        m.write(0x0103, Width::Byte, 0x11);
        m.save().unwrap();

        m.write(0x0103, Width::Byte, 0xEE);
        m.restore().unwrap();
        assert_eq!(m.read(0x0103, Width::Byte), 0x11);

        // The checkpoint can be restored again.
        m.write(0x0103, Width::Byte, 0xEE);
        m.restore().unwrap();
        assert_eq!(m.read(0x0103, Width::Byte), 0x11);
    }

    #[test]
    fn test_restore_without_save() {
        let mut m = bank_machine();
        assert!(matches!(m.restore(), Err(SimErr::RestoreWithoutSave)));
    }

    #[test]
    fn test_save_restore_idempotence() {
        init_logs();

        let (clock, c) = ClockTree::standard();
        let mut m = Machine::new(MachineFlags { trace_block_size: 64, ..Default::default() }, clock);
        let sink = MemorySink::new();
        let buffer = sink.get_buffer().clone();
        m.set_trace_sink(Box::new(sink));
        m.attach_packet_log(Box::new(BufferedPacketLog::new(4)));

        let ctl = ClockControl::new("clkctl", m.clock(), &[c.mclk, c.smclk, c.aclk], &[c.lfxt1, c.xt2, c.vlo, c.refo, c.dco]);
        m.add_device(RegisterBank::<16>::new("bank"), 0x0000, 0x10).unwrap();
        let p2 = m.add_device(GpioPort::new("p2"), 0x0028, 8).unwrap();
        m.add_device(GpioPort::new("p1").connect(0, p2, 3), 0x0020, 8).unwrap();
        m.add_device(Timer::new("ta0", c.smclk), 0x0040, 8).unwrap();
        m.add_device(ctl, 0x0050, 8).unwrap();
        let u0 = m.add_device(Uart::new("uart0", 0), 0x0070, 4).unwrap();

        let mut rng = StdRng::seed_from_u64(0x5EED);
        let scramble = |m: &mut Machine, rng: &mut StdRng| {
            for _ in 0..300 {
                match rng.gen_range(0..4) {
                    0 => m.write(rng.gen_range(0..0x80), Width::Word, rng.gen()),
                    1 => m.write(rng.gen_range(0..0x80), Width::Byte, rng.gen()),
                    2 => { m.deliver(u0, &[rng.gen()]); },
                    _ => m.step(rng.gen_range(1..50_000)).unwrap(),
                }
            }
        };

        // get to an arbitrary state first
        scramble(&mut m, &mut rng);
        m.save().unwrap();

        let states: Vec<Vec<u8>> = m.bus().ids().map(|id| m.bus().state_bytes(id).unwrap().to_vec()).collect();
        let clock = m.clock().save();
        let values: Vec<_> = m.tracer().signals().iter().map(|s| m.tracer().last_value(s.id)).collect();
        let block = m.tracer().block().to_vec();
        let persisted = buffer.read().unwrap().clone();

        for _ in 0..3 {
            scramble(&mut m, &mut rng);
            m.restore().unwrap();

            let now: Vec<Vec<u8>> = m.bus().ids().map(|id| m.bus().state_bytes(id).unwrap().to_vec()).collect();
            assert_eq!(now, states);
            assert_eq!(m.clock().save(), clock);
            let now_values: Vec<_> = m.tracer().signals().iter().map(|s| m.tracer().last_value(s.id)).collect();
            assert_eq!(now_values, values);
            assert_eq!(m.tracer().block(), &block[..]);
            assert_eq!(*buffer.read().unwrap(), persisted);
        }
    }

    #[test]
    fn test_link_round_trip() {
        let mut m = Machine::new(MachineFlags::default(), ClockTree::new());
        let u0 = m.add_device(Uart::new("uart0", 0), 0x0070, 4).unwrap();
        m.write(0x0070 + uart::UCTL, Width::Byte, uart::UEN.mask());

        let (link, peer) = ChannelLink::pair(u0);
        m.attach_link(link);

        assert!(peer.deliver(b"hi"));
        m.step(1000).unwrap();
        assert_eq!(m.read(0x0070 + uart::URXBUF, Width::Byte), u16::from(b'h'));
        assert_eq!(m.read(0x0070 + uart::URXBUF, Width::Byte), u16::from(b'i'));

        m.write(0x0070 + uart::UTXBUF, Width::Byte, u16::from(b'x'));
        assert!(peer.take().is_empty());
        m.step(1000).unwrap();
        assert_eq!(peer.take(), b"x");
        assert!(m.take_output().is_empty());
    }

    #[test]
    fn test_output_without_link() {
        let mut m = Machine::new(MachineFlags::default(), ClockTree::new());
        m.add_device(Uart::new("uart0", 0), 0x0070, 4).unwrap();
        m.write(0x0070 + uart::UCTL, Width::Byte, uart::UEN.mask());
        m.write(0x0070 + uart::UTXBUF, Width::Byte, u16::from(b'o'));
        m.step(1000).unwrap();
        m.write(0x0070 + uart::UTXBUF, Width::Byte, u16::from(b'k'));

        assert_eq!(m.take_output(), b"ok");
    }

    #[test]
    fn test_restore_withdraws_output() {
        let mut m = Machine::new(MachineFlags::default(), ClockTree::new());
        m.add_device(Uart::new("uart0", 0), 0x0070, 4).unwrap();
        m.write(0x0070 + uart::UCTL, Width::Byte, uart::UEN.mask());
        m.write(0x0070 + uart::UTXBUF, Width::Byte, u16::from(b'x'));

        m.save().unwrap();
        m.write(0x0070 + uart::UTXBUF, Width::Byte, u16::from(b'a'));
        m.restore().unwrap();
        m.write(0x0070 + uart::UTXBUF, Width::Byte, u16::from(b'a'));
        assert_eq!(m.take_output(), b"xa");

        // bytes which were taken cannot be withdrawn
        m.save().unwrap();
        m.write(0x0070 + uart::UTXBUF, Width::Byte, u16::from(b'b'));
        assert_eq!(m.take_output(), b"b");
        m.restore().unwrap();
        m.write(0x0070 + uart::UTXBUF, Width::Byte, u16::from(b'c'));
        assert_eq!(m.take_output(), b"c");
    }

    #[test]
    fn test_time_breakpoint() {
        let mut m = bank_machine();
        m.breakpoints.insert(Breakpoint::Time(10_500));
        m.run_while(|_| true).unwrap();

        assert!(m.hit_breakpoint());
        assert_eq!(m.nanotime(), 11_000);
    }

    #[test]
    fn test_signal_breakpoint() {
        let (clock, c) = ClockTree::standard();
        let mut m = Machine::new(MachineFlags::default(), clock);
        let ta0 = m.add_device(Timer::new("ta0", c.smclk), 0x0040, 8).unwrap();
        let ccifg = m.tracer().lookup("ccifg", "ta0").unwrap();

        m.write(0x0040 + timer::TACCR0, Width::Word, 9);
        m.write(0x0040 + timer::TACTL, Width::Word, timer::MC.set(0, 1));
        m.breakpoints.insert(Breakpoint::Signal { signal: ccifg, value: Comparator::Eq(1) });

        let limit = 1_000_000;
        m.run_while(|m| m.nanotime() < limit).unwrap();
        assert!(m.hit_breakpoint());
        assert!(m.nanotime() < limit);

        let cctl0 = m.read(0x0040 + timer::TACCTL0, Width::Word);
        assert!(timer::CCIFG.is_set(cctl0));
        assert!(m.device::<Timer>(ta0).is_some());
    }

    #[test]
    fn test_stop_handle() {
        let mut m = bank_machine();
        m.run_while(|m| {
            if m.steps == 3 {
                m.stop_handle().store(false, Ordering::Relaxed);
            }
            true
        }).unwrap();

        assert!(m.was_stopped());
        assert!(!m.hit_breakpoint());
        assert_eq!(m.steps, 4);
    }

    #[test]
    fn test_observer() {
        let mut m = bank_machine();
        m.flags.observe_accesses = true;

        m.write(0x0100, Width::Byte, 0);
        m.write(0x0101, Width::Byte, 5);
        m.read(0x0102, Width::Byte);
        m.read(0x0300, Width::Word);

        let same = m.observer.get_accesses(0x0100);
        assert!(same.written() && !same.modified());
        assert!(m.observer.get_accesses(0x0101).modified());
        assert!(m.observer.get_accesses(0x0102).read());
        assert!(m.observer.get_accesses(0x0300).unmapped());
    }

    #[test]
    fn test_reset_keeps_time() {
        let (clock, c) = ClockTree::standard();
        let mut m = Machine::new(MachineFlags::default(), clock);
        m.add_device(RegisterBank::<4>::new("bank"), 0x0000, 4).unwrap();

        m.write(0x0001, Width::Byte, 0x77);
        m.run_for(50_000).unwrap();
        let cycles = m.clock().cycles(c.mclk);
        m.clock_mut().set_divider(c.mclk, 8).unwrap();

        m.reset();
        assert_eq!(m.read(0x0001, Width::Byte), 0);
        assert_eq!(m.nanotime(), 50_000);
        assert_eq!(m.clock().cycles(c.mclk), cycles);
        assert_eq!(m.clock().domain(c.mclk).map(|d| d.divider()), Some(1));
    }
}
