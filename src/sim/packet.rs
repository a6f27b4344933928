//! The packet log.
//!
//! Serial and radio peripherals report the bytes they transmit and receive through a
//! [`PacketLog`]. The log groups bytes into packets per interface; a packet is completed
//! with [`PacketLog::end_packet`] or discarded with [`PacketLog::abort_packet`].
//!
//! Like the event tracer, the log takes part in machine checkpoints: [`PacketLog::save`]
//! and [`PacketLog::restore`] are called together with the rest of the machine.
//!
//! [`BufferedPacketLog`] is the provided implementation. It keeps open and recently completed
//! packets in memory, and moves completed packets into a shared output buffer once a threshold is reached.

use std::sync::{Arc, RwLock, RwLockWriteGuard, TryLockError};

use log::{debug, error, warn};

/// The direction of a logged byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Received by the machine.
    Rx,
    /// Transmitted by the machine.
    Tx,
}

/// Receives the traffic of communication peripherals.
pub trait PacketLog: Send {
    /// A byte was received on interface `iface` at simulated time `time`.
    fn rx_byte(&mut self, iface: u8, byte: u8, time: u64);

    /// A byte was transmitted on interface `iface` at simulated time `time`.
    fn tx_byte(&mut self, iface: u8, byte: u8, time: u64);

    /// The current packet on interface `iface` is complete.
    fn end_packet(&mut self, iface: u8, time: u64);

    /// The current packet on interface `iface` is discarded.
    fn abort_packet(&mut self, iface: u8, reason: &str, time: u64);

    /// Captures the log's state into its checkpoint slot.
    fn save(&mut self);

    /// Reverts the log to its checkpoint slot.
    fn restore(&mut self);
}

/// A logged packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Interface the packet was seen on.
    pub iface: u8,
    /// Direction of each byte, with the byte.
    pub bytes: Vec<(Direction, u8)>,
    /// Simulated time of the first byte.
    pub start: u64,
    /// Simulated time the packet ended.
    pub end: u64,
    /// The reason the packet was aborted, if it was.
    pub aborted: Option<String>,
}
impl Packet {
    /// The bytes of the packet which went in one direction.
    pub fn payload(&self, dir: Direction) -> Vec<u8> {
        self.bytes.iter()
            .filter(|(d, _)| *d == dir)
            .map(|&(_, b)| b)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct LogState {
    /// Open packets, by interface.
    open: Vec<Packet>,
    /// Completed packets not yet flushed.
    done: Vec<Packet>,
    /// Number of packets flushed to the output.
    flushed: usize,
}

/// A [`PacketLog`] which collects packets into a shared buffer.
///
/// Completed packets are held back until `threshold` of them accumulate, then flushed to the
/// output buffer ([`BufferedPacketLog::get_output`]). Flushed packets are withdrawn again
/// if the machine rolls back past them.
#[derive(Debug)]
pub struct BufferedPacketLog {
    state: LogState,
    saved: Option<LogState>,
    threshold: usize,
    keep_aborted: bool,
    output: Arc<RwLock<Vec<Packet>>>,
}
impl BufferedPacketLog {
    /// Creates a new log which flushes every `threshold` completed packets.
    pub fn new(threshold: usize) -> Self {
        Self {
            state: LogState::default(),
            saved: None,
            threshold: threshold.max(1),
            keep_aborted: false,
            output: Default::default(),
        }
    }

    /// Keeps aborted packets in the output (with their abort reason) instead of discarding them.
    pub fn keep_aborted(mut self, keep: bool) -> Self {
        self.keep_aborted = keep;
        self
    }

    /// Gets a reference to the output buffer of this log.
    pub fn get_output(&self) -> &Arc<RwLock<Vec<Packet>>> {
        &self.output
    }

    /// Packets which are still open.
    pub fn open_packets(&self) -> &[Packet] {
        &self.state.open
    }

    /// Moves all completed packets to the output.
    pub fn flush(&mut self) {
        if self.state.done.is_empty() { return };

        match try_output(&self.output) {
            Some(mut out) => {
                self.state.flushed += self.state.done.len();
                out.append(&mut self.state.done);
            },
            None => warn!("packet log output is locked, {} packets held back", self.state.done.len()),
        }
    }

    fn push_byte(&mut self, iface: u8, dir: Direction, byte: u8, time: u64) {
        match self.state.open.iter_mut().find(|p| p.iface == iface) {
            Some(p) => {
                p.bytes.push((dir, byte));
                p.end = time;
            },
            None => self.state.open.push(Packet { iface, bytes: vec![(dir, byte)], start: time, end: time, aborted: None }),
        }
    }

    fn close(&mut self, iface: u8, time: u64, aborted: Option<&str>) {
        let Some(i) = self.state.open.iter().position(|p| p.iface == iface) else {
            debug!("no open packet on interface {iface}");
            return;
        };
        let mut packet = self.state.open.remove(i);
        packet.end = time;
        packet.aborted = aborted.map(str::to_string);

        if packet.aborted.is_none() || self.keep_aborted {
            self.state.done.push(packet);
        }
        if self.state.done.len() >= self.threshold {
            self.flush();
        }
    }
}
impl Default for BufferedPacketLog {
    fn default() -> Self {
        Self::new(64)
    }
}

fn try_output(output: &RwLock<Vec<Packet>>) -> Option<RwLockWriteGuard<'_, Vec<Packet>>> {
    match output.try_write() {
        Ok(g) => Some(g),
        Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

impl PacketLog for BufferedPacketLog {
    fn rx_byte(&mut self, iface: u8, byte: u8, time: u64) {
        self.push_byte(iface, Direction::Rx, byte, time);
    }

    fn tx_byte(&mut self, iface: u8, byte: u8, time: u64) {
        self.push_byte(iface, Direction::Tx, byte, time);
    }

    fn end_packet(&mut self, iface: u8, time: u64) {
        self.close(iface, time, None);
    }

    fn abort_packet(&mut self, iface: u8, reason: &str, time: u64) {
        debug!("packet on interface {iface} aborted: {reason}");
        self.close(iface, time, Some(reason));
    }

    fn save(&mut self) {
        if self.state.done.len() >= self.threshold {
            self.flush();
        }
        self.saved = Some(self.state.clone());
    }

    fn restore(&mut self) {
        let Some(saved) = &self.saved else {
            error!("packet log restored without a saved state");
            return;
        };

        if saved.flushed != self.state.flushed {
            match try_output(&self.output) {
                Some(mut out) => {
                    let len = out.len();
                    out.truncate(len.saturating_sub(self.state.flushed.saturating_sub(saved.flushed)));
                },
                None => error!("packet log output is locked, flushed packets cannot be rolled back"),
            }
        }
        self.state.clone_from(saved);
    }
}
