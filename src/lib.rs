//! A simulation kernel for embedded microcontrollers.
//!
//! This crate holds the parts of a microcontroller simulator which every peripheral shares:
//! the memory-mapped IO bus, the clock tree, checkpoints for backtracking, and the event tracer.
//! Instruction execution and individual peripheral models plug into it through the
//! [`sim::device::Device`] trait and the bus accessors of [`sim::Machine`].
//!
//! # Usage
//!
//! A board is built once, by creating a clock tree and adding each device at its address range:
//! ```
//! use mcu_sim::sim::{Machine, MachineFlags};
//! use mcu_sim::sim::clock::ClockTree;
//! use mcu_sim::sim::device::{Timer, Width};
//! use mcu_sim::sim::device::timer::{MC, TACTL, TAR};
//!
//! let (clock, clocks) = ClockTree::standard();
//! let mut machine = Machine::new(MachineFlags::default(), clock);
//! machine.add_device(Timer::new("ta0", clocks.aclk), 0x0160, 8).unwrap();
//!
//! // start the timer in continuous mode, then run for a second
//! machine.write(0x0160 + TACTL, Width::Word, MC.set(0, 2));
//! machine.run_for(1_000_000_000).unwrap();
//! assert_eq!(machine.read(0x0160 + TAR, Width::Word), 32_768);
//! ```
//!
//! The simulation can then be saved and restored around a synchronization point
//! (see [`sim::Machine::save`]), and its trace written with [`sim::trace::file::TraceFile`].
//! See the [`sim`] module for more details.
#![warn(missing_docs)]

pub mod sim;
pub mod err;
