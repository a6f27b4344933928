//! Machine checkpoints (backtracking).
//!
//! A [`Checkpoint`] holds the joint state of the machine:
//! - the state of every device, byte-for-byte,
//! - the oscillators and clock domains of the clock tree (with their accumulators) and the absolute time,
//! - the tracer's unflushed samples and per-signal history,
//! - how many bytes devices had transmitted, so later transmissions still held by the machine are withdrawn.
//!
//! The machine holds a single checkpoint slot ([`Machine::save`] overwrites it),
//! which is enough to roll back to the last synchronization point with an outside simulator.
//! Restoring does not consume the checkpoint, so the same point can be restored repeatedly.
//!
//! [`Machine::save`]: super::Machine::save

use super::clock::{ClockState, ClockTree};
use super::device::{DeviceId, IoBus};
use super::packet::PacketLog;
use super::trace::{TraceSnapshot, Tracer};
use super::SimErr;

/// A saved state of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    devices: Vec<Box<[u8]>>,
    clock: ClockState,
    trace: TraceSnapshot,
    output: u64,
}
impl Checkpoint {
    /// Captures the state of the machine.
    ///
    /// The tracer flushes a full block first, and the packet log (if any) saves into its own slot.
    /// `output` is the number of bytes devices have transmitted so far.
    pub(crate) fn capture(
        bus: &IoBus,
        clock: &ClockTree,
        tracer: &mut Tracer,
        packets: Option<&mut (dyn PacketLog + 'static)>,
        output: u64,
    ) -> Result<Self, SimErr> {
        let devices = bus.save_states()?;
        let trace = tracer.save();
        if let Some(p) = packets {
            p.save();
        }

        Ok(Self { devices, clock: clock.save(), trace, output })
    }

    /// Reverts the machine to this checkpoint.
    ///
    /// The layout of the checkpoint is verified against the machine before anything is changed,
    /// so on error the machine is left untouched.
    pub(crate) fn apply(
        &self,
        bus: &mut IoBus,
        clock: &mut ClockTree,
        tracer: &mut Tracer,
        packets: Option<&mut (dyn PacketLog + 'static)>
    ) -> Result<(), SimErr> {
        bus.check_states(&self.devices)?;
        clock.restore(&self.clock)?;
        bus.load_states(&self.devices);
        tracer.restore(&self.trace);
        if let Some(p) = packets {
            p.restore();
        }
        Ok(())
    }

    /// The simulated time at which this checkpoint was taken.
    pub fn nanotime(&self) -> u64 {
        self.clock.time_ns()
    }

    /// The saved state of a device.
    pub fn device_state(&self, id: DeviceId) -> Option<&[u8]> {
        self.devices.get(id.index()).map(|s| &**s)
    }

    /// The saved state of the clock tree.
    pub fn clock(&self) -> &ClockState {
        &self.clock
    }

    /// The number of bytes devices had transmitted when this checkpoint was taken.
    pub fn output(&self) -> u64 {
        self.output
    }
}
