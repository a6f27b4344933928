//! The event tracer.
//!
//! The tracer records value changes of named signals for offline analysis.
//!
//! Signals are registered once with [`Tracer::register_signal`] and are recorded with
//! [`Tracer::record`]. A value is only recorded if it differs from the signal's last recorded value,
//! so the trace holds one sample per change.
//!
//! Samples are buffered in an in-memory block. Once the block fills up, it is flushed to
//! a [`TraceSink`] (e.g., a [`file::TraceFile`] or a [`MemorySink`]).
//!
//! The in-memory block and the per-signal history are part of a machine checkpoint
//! ([`Tracer::save`], [`Tracer::restore`]). Samples which were flushed after a save are
//! withdrawn from the sink on restore with [`TraceSink::rewind`].
//!
//! ```
//! use mcu_sim::sim::trace::{MemorySink, Tracer};
//!
//! let sink = MemorySink::new();
//! let mut tracer = Tracer::new(Box::new(sink.clone()), 256, 4096);
//!
//! let led = tracer.register_signal(1, "led", "port1").unwrap();
//! tracer.record(led, 1, 1_000);
//! tracer.record(led, 1, 2_000); // unchanged, not recorded
//! tracer.record(led, 0, 3_000);
//! tracer.flush();
//!
//! // The initial value (0 at time 0) plus two changes.
//! assert_eq!(sink.get_buffer().read().unwrap().len(), 3);
//! ```

pub mod file;

use std::io;
use std::sync::{Arc, RwLock, RwLockWriteGuard, TryLockError};

use log::{error, warn};

use crate::err::ConfigErr;

/// Handle to a registered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(u32);
impl SignalId {
    /// The dense index of this signal (in registration order).
    pub fn index(self) -> u32 {
        self.0
    }
}

/// A registered signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Identifier, equal to its registration index.
    pub id: SignalId,
    /// Width in bits (1 to 64).
    pub width: u8,
    /// Human-readable name.
    pub name: String,
    /// Name of the module which owns the signal.
    pub module: String,
}
impl Signal {
    fn mask(&self) -> u64 {
        match self.width {
            64 => u64::MAX,
            w  => (1 << w) - 1
        }
    }
}

/// A recorded value change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sample {
    /// The signal which changed.
    pub signal: SignalId,
    /// The simulated time of the change (in nanoseconds).
    pub time: u64,
    /// The new value.
    pub value: u64,
}

/// Per-signal recording history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SignalState {
    last_value: u64,
    last_time: Option<u64>,
    /// Value before the latest sample.
    prev_value: u64,
    /// Position of the latest sample in the current block, if it can still be amended.
    pending: Option<usize>,
}

/// Final counters of a trace, handed to [`TraceSink::finish`].
#[derive(Debug, Clone, Copy)]
pub struct TraceSummary<'a> {
    /// All registered signals.
    pub signals: &'a [Signal],
    /// Number of samples written to the sink.
    pub samples: u64,
    /// Simulated time at which the trace was opened.
    pub start_ns: u64,
    /// Simulated time at which the trace was closed.
    pub end_ns: u64,
}

/// Persistent storage for flushed trace blocks.
pub trait TraceSink: Send {
    /// Appends a block of samples.
    fn write_samples(&mut self, samples: &[Sample]) -> io::Result<()>;

    /// Discards everything after the first `persisted` samples.
    ///
    /// This is called when the machine rolls back to a checkpoint taken
    /// before some samples were flushed.
    fn rewind(&mut self, persisted: u64) -> io::Result<()>;

    /// Completes the trace.
    fn finish(&mut self, summary: &TraceSummary<'_>) -> io::Result<()>;
}

/// Discards all samples.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NullSink;
impl TraceSink for NullSink {
    fn write_samples(&mut self, _samples: &[Sample]) -> io::Result<()> {
        Ok(())
    }

    fn rewind(&mut self, _persisted: u64) -> io::Result<()> {
        Ok(())
    }

    fn finish(&mut self, _summary: &TraceSummary<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Stores flushed samples in a shared memory buffer.
///
/// The buffer can be accessed with [`MemorySink::get_buffer`].
/// Note that while a lock guard of the buffer is held, flushes to this sink fail.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    buffer: Arc<RwLock<Vec<Sample>>>
}
impl MemorySink {
    /// Creates a new sink with an empty buffer.
    pub fn new() -> Self {
        Default::default()
    }

    /// Gets a reference to the internal buffer of this sink.
    pub fn get_buffer(&self) -> &Arc<RwLock<Vec<Sample>>> {
        &self.buffer
    }

    fn try_buffer(&self) -> io::Result<RwLockWriteGuard<'_, Vec<Sample>>> {
        match self.buffer.try_write() {
            Ok(g) => Ok(g),
            Err(TryLockError::Poisoned(e)) => Ok(e.into_inner()),
            Err(TryLockError::WouldBlock) => Err(io::Error::new(io::ErrorKind::WouldBlock, "trace buffer is locked")),
        }
    }
}
impl TraceSink for MemorySink {
    fn write_samples(&mut self, samples: &[Sample]) -> io::Result<()> {
        self.try_buffer()?.extend_from_slice(samples);
        Ok(())
    }

    fn rewind(&mut self, persisted: u64) -> io::Result<()> {
        let len = usize::try_from(persisted).unwrap_or(usize::MAX);
        self.try_buffer()?.truncate(len);
        Ok(())
    }

    fn finish(&mut self, _summary: &TraceSummary<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// The tracer's part of a machine checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSnapshot {
    block: Vec<Sample>,
    states: Vec<SignalState>,
    persisted: u64,
}

/// Records signal value changes.
pub struct Tracer {
    signals: Vec<Signal>,
    states: Vec<SignalState>,

    /// Samples not yet flushed to the sink.
    block: Vec<Sample>,
    block_size: usize,
    max_signals: usize,

    /// Whether [`Tracer::record`] is active.
    active: bool,
    sink: Box<dyn TraceSink>,
    start_ns: u64,

    /// Number of samples handed to the sink.
    persisted: u64,
    /// Number of samples lost to invalid records or sink failures.
    dropped: u64,
}
impl Tracer {
    /// Creates a new active tracer writing to `sink`.
    ///
    /// - `max_signals`: capacity of the signal table.
    /// - `block_size`: number of samples buffered in memory before they are flushed to the sink.
    pub fn new(sink: Box<dyn TraceSink>, max_signals: usize, block_size: usize) -> Self {
        Self {
            signals: vec![],
            states: vec![],
            block: Vec::with_capacity(block_size.max(1)),
            block_size: block_size.max(1),
            max_signals,
            active: true,
            sink,
            start_ns: 0,
            persisted: 0,
            dropped: 0,
        }
    }

    /// Replaces the sink.
    ///
    /// Samples which have not been flushed yet go to the new sink.
    /// The new trace is considered opened at `now`.
    pub fn set_sink(&mut self, sink: Box<dyn TraceSink>, now: u64) {
        self.sink = sink;
        self.start_ns = now;
        self.persisted = 0;
    }

    /// Registers a new signal.
    ///
    /// The signal is immediately recorded with a value of 0 at time 0,
    /// so every signal has a defined initial state in the trace.
    pub fn register_signal(&mut self, width: u8, name: &str, module: &str) -> Result<SignalId, ConfigErr> {
        if !(1..=64).contains(&width) { return Err(ConfigErr::InvalidWidth(width)) };

        let duplicate = self.signals.iter()
            .any(|s| s.width == width && s.name == name && s.module == module);
        if duplicate {
            return Err(ConfigErr::DuplicateSignal { name: name.to_string(), module: module.to_string(), width });
        }
        if self.signals.len() >= self.max_signals {
            return Err(ConfigErr::TooManySignals(self.max_signals));
        }
        let id = u32::try_from(self.signals.len())
            .map(SignalId)
            .map_err(|_| ConfigErr::TooManySignals(self.max_signals))?;

        self.signals.push(Signal { id, width, name: name.to_string(), module: module.to_string() });
        self.push_initial(id);

        Ok(id)
    }

    /// Records a value for a signal at the given simulated time.
    ///
    /// Nothing is recorded if the tracer is stopped or if the value equals the
    /// last recorded value of the signal. The value is truncated to the signal's width.
    ///
    /// A second change at the same timestamp amends the first (the zero-width pulse is dropped
    /// if the signal returns to its previous value), so each signal's timestamps strictly increase.
    /// Samples which were already flushed cannot be amended.
    ///
    /// Recording an unknown signal is logged and dropped.
    pub fn record(&mut self, id: SignalId, value: u64, time: u64) {
        if !self.active { return };

        let index = id.0 as usize;
        let Some(signal) = self.signals.get(index) else {
            error!("dropped trace sample for unregistered signal {}", id.0);
            self.dropped += 1;
            return;
        };
        let value = value & signal.mask();
        let state = self.states[index];

        if value == state.last_value { return };
        if state.last_time.is_some_and(|t| time < t) {
            warn!("signal `{}.{}` recorded at {time} ns, before its last change at {} ns", signal.module, signal.name, state.last_time.unwrap_or(0));
        }

        match state.pending {
            // The initial sample has no previous value to fall back to, so it is amended instead.
            Some(i) if state.last_time == Some(time) && time > 0 && value == state.prev_value => {
                // Zero-width pulse back to the previous value: remove it.
                self.block.remove(i);
                for st in &mut self.states {
                    match st.pending {
                        Some(p) if p > i => st.pending = Some(p - 1),
                        Some(p) if p == i => st.pending = None,
                        _ => {}
                    }
                }
                let state = &mut self.states[index];
                state.last_value = value;
                state.last_time = None;
            },
            Some(i) if state.last_time == Some(time) => {
                self.block[i].value = value;
                self.states[index].last_value = value;
            },
            _ => {
                self.states[index] = SignalState {
                    last_value: value,
                    last_time: Some(time),
                    prev_value: state.last_value,
                    pending: Some(self.block.len()),
                };
                self.push_sample(Sample { signal: id, time, value });
            }
        }
    }

    /// Records the 0 at time 0 every signal starts with.
    /// It stays pending, so a change at time 0 amends it.
    fn push_initial(&mut self, id: SignalId) {
        let state = SignalState { last_value: 0, last_time: Some(0), prev_value: 0, pending: Some(self.block.len()) };
        match self.states.get_mut(id.0 as usize) {
            Some(st) => *st = state,
            None => self.states.push(state),
        }
        self.push_sample(Sample { signal: id, time: 0, value: 0 });
    }

    fn push_sample(&mut self, sample: Sample) {
        self.block.push(sample);
        if self.block.len() >= self.block_size {
            self.flush();
        }
    }

    /// Writes the in-memory block to the sink and clears it.
    ///
    /// If the sink fails, the error is logged and the block's samples are dropped.
    pub fn flush(&mut self) {
        if self.block.is_empty() { return };

        match self.sink.write_samples(&self.block) {
            Ok(()) => self.persisted += self.block.len() as u64,
            Err(e) => {
                error!("failed to flush {} trace samples: {e}", self.block.len());
                self.dropped += self.block.len() as u64;
            }
        }
        self.block.clear();
        self.states.iter_mut().for_each(|s| s.pending = None);
    }

    /// Resumes recording.
    pub fn start(&mut self) {
        self.active = true;
    }
    /// Pauses recording. Samples already buffered are kept.
    pub fn stop(&mut self) {
        self.active = false;
    }
    /// Whether recording is active.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// All registered signals, in registration order.
    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }
    /// Gets a registered signal.
    pub fn signal(&self, id: SignalId) -> Option<&Signal> {
        self.signals.get(id.0 as usize)
    }
    /// Finds a signal by its name and owning module.
    pub fn lookup(&self, name: &str, module: &str) -> Option<SignalId> {
        self.signals.iter()
            .find(|s| s.name == name && s.module == module)
            .map(|s| s.id)
    }
    /// The last recorded value of a signal.
    pub fn last_value(&self, id: SignalId) -> Option<u64> {
        self.states.get(id.0 as usize).map(|s| s.last_value)
    }
    /// Samples recorded but not yet flushed.
    pub fn block(&self) -> &[Sample] {
        &self.block
    }
    /// Number of samples written to the sink.
    pub fn persisted(&self) -> u64 {
        self.persisted
    }
    /// Number of samples dropped.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Captures the in-memory block and the per-signal history.
    ///
    /// A block which has reached its size threshold is flushed first.
    pub fn save(&mut self) -> TraceSnapshot {
        if self.block.len() >= self.block_size {
            self.flush();
        }
        TraceSnapshot {
            block: self.block.clone(),
            states: self.states.clone(),
            persisted: self.persisted,
        }
    }

    /// Restores the state captured by [`Tracer::save`].
    ///
    /// If samples were flushed since the save, the sink is rewound.
    /// A sink which cannot rewind keeps those samples; this is logged.
    ///
    /// Signals registered after the save stay registered and restart from
    /// their initial 0 at time 0.
    pub fn restore(&mut self, snapshot: &TraceSnapshot) {
        if self.persisted != snapshot.persisted {
            if let Err(e) = self.sink.rewind(snapshot.persisted) {
                error!("trace sink could not roll back to {} samples, trace is inconsistent: {e}", snapshot.persisted);
            }
            self.persisted = snapshot.persisted;
        }
        self.block.clone_from(&snapshot.block);
        for (state, saved) in self.states.iter_mut().zip(&snapshot.states) {
            *state = *saved;
        }

        let late: Vec<_> = self.signals.iter().skip(snapshot.states.len()).map(|s| s.id).collect();
        if !late.is_empty() {
            warn!("{} signals were registered after the checkpoint, resetting them", late.len());
        }
        for id in late {
            self.push_initial(id);
        }
    }

    /// Flushes the remaining samples and completes the trace in the sink.
    pub fn finish(&mut self, end_ns: u64) -> io::Result<()> {
        self.flush();
        self.sink.finish(&TraceSummary {
            signals: &self.signals,
            samples: self.persisted,
            start_ns: self.start_ns,
            end_ns,
        })
    }
}
impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("signals", &self.signals.len())
            .field("buffered", &self.block.len())
            .field("persisted", &self.persisted)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::err::ConfigErr;

    use super::{MemorySink, Sample, SignalId, Tracer};

    fn tracer(block_size: usize) -> (Tracer, MemorySink) {
        let sink = MemorySink::new();
        (Tracer::new(Box::new(sink.clone()), 8, block_size), sink)
    }

    fn all_samples(tracer: &mut Tracer, sink: &MemorySink) -> Vec<Sample> {
        tracer.flush();
        sink.get_buffer().read().unwrap().clone()
    }

    #[test]
    fn test_repeated_value_is_recorded_once() {
        let (mut tracer, sink) = tracer(64);
        let led = tracer.register_signal(1, "led", "board").unwrap();

        tracer.record(led, 1, 500);
        tracer.record(led, 1, 900);

        let samples = all_samples(&mut tracer, &sink);
        assert_eq!(samples, [
            Sample { signal: led, time: 0, value: 0 },
            Sample { signal: led, time: 500, value: 1 },
        ]);
    }

    #[test]
    fn test_registration_errors() {
        let (mut tracer, _) = tracer(64);
        tracer.register_signal(1, "led", "board").unwrap();

        assert!(matches!(tracer.register_signal(1, "led", "board"), Err(ConfigErr::DuplicateSignal { .. })));
        // Different width or module is a different signal.
        tracer.register_signal(8, "led", "board").unwrap();
        tracer.register_signal(1, "led", "port2").unwrap();

        assert_eq!(tracer.register_signal(0, "bad", "board"), Err(ConfigErr::InvalidWidth(0)));
        assert_eq!(tracer.register_signal(65, "bad", "board"), Err(ConfigErr::InvalidWidth(65)));

        for i in 3..8 {
            tracer.register_signal(1, &format!("s{i}"), "board").unwrap();
        }
        assert_eq!(tracer.register_signal(1, "full", "board"), Err(ConfigErr::TooManySignals(8)));
    }

    #[test]
    fn test_unknown_signal_is_dropped() {
        let (mut tracer, _) = tracer(64);
        tracer.record(SignalId(3), 1, 10);
        assert_eq!(tracer.dropped(), 1);
        assert!(tracer.block().is_empty());
    }

    #[test]
    fn test_values_are_masked() {
        let (mut tracer, _) = tracer(64);
        let nibble = tracer.register_signal(4, "n", "m").unwrap();
        tracer.record(nibble, 0x1F, 10);
        assert_eq!(tracer.last_value(nibble), Some(0xF));
        tracer.record(nibble, 0xF, 20);
        assert_eq!(tracer.block().len(), 2);
    }

    #[test]
    fn test_block_flushes_at_threshold() {
        let (mut tracer, sink) = tracer(4);
        let s = tracer.register_signal(8, "s", "m").unwrap();
        for t in 1..=3 {
            tracer.record(s, t, t * 10);
        }
        // initial + 3 changes = 4 = block size
        assert!(tracer.block().is_empty());
        assert_eq!(tracer.persisted(), 4);
        assert_eq!(sink.get_buffer().read().unwrap().len(), 4);
    }

    #[test]
    fn test_start_stop() {
        let (mut tracer, _) = tracer(64);
        let s = tracer.register_signal(1, "s", "m").unwrap();
        tracer.record(s, 1, 10);
        tracer.stop();
        tracer.record(s, 0, 20);
        assert_eq!(tracer.block().len(), 2);
        assert_eq!(tracer.last_value(s), Some(1));
        tracer.start();
        tracer.record(s, 0, 30);
        assert_eq!(tracer.block().len(), 3);
    }

    #[test]
    fn test_same_timestamp_amends() {
        let (mut tracer, sink) = tracer(64);
        let a = tracer.register_signal(8, "a", "m").unwrap();
        let b = tracer.register_signal(8, "b", "m").unwrap();

        tracer.record(a, 1, 100);
        tracer.record(b, 5, 100);
        tracer.record(a, 2, 100); // amends a's sample
        tracer.record(b, 0, 100); // pulse back to 0 disappears
        tracer.record(a, 3, 200);

        let samples = all_samples(&mut tracer, &sink);
        assert_eq!(samples, [
            Sample { signal: a, time: 0, value: 0 },
            Sample { signal: b, time: 0, value: 0 },
            Sample { signal: a, time: 100, value: 2 },
            Sample { signal: a, time: 200, value: 3 },
        ]);
    }

    #[test]
    fn test_delta_trace_monotonic() {
        use rand::{Rng, SeedableRng};
        use rand::rngs::StdRng;

        // Flushed samples cannot be amended, so keep everything in one block.
        let (mut tracer, sink) = tracer(1 << 16);
        let ids: Vec<_> = (0..4)
            .map(|i| tracer.register_signal(2, &format!("s{i}"), "m").unwrap())
            .collect();

        let mut rng = StdRng::seed_from_u64(2110);
        let mut time = 0;
        for _ in 0..5000 {
            time += rng.gen_range(0..3);
            let id = ids[rng.gen_range(0..ids.len())];
            tracer.record(id, rng.gen_range(0..4), time);
        }

        let samples = all_samples(&mut tracer, &sink);
        for &id in &ids {
            let history: Vec<_> = samples.iter().filter(|s| s.signal == id).collect();
            for pair in history.windows(2) {
                assert!(pair[0].time < pair[1].time, "{pair:?}");
                assert_ne!(pair[0].value, pair[1].value, "{pair:?}");
            }
            assert_eq!(history.last().map(|s| s.value), tracer.last_value(id));
        }
    }

    #[test]
    fn test_restore_discards_later_samples() {
        let (mut tracer, sink) = tracer(4);
        let s = tracer.register_signal(8, "s", "m").unwrap();
        tracer.record(s, 1, 10);

        let snapshot = tracer.save();
        for t in 2..10 {
            tracer.record(s, t, t * 10);
        }
        assert!(tracer.persisted() > 0);

        tracer.restore(&snapshot);
        assert_eq!(tracer.persisted(), 0);
        assert_eq!(tracer.last_value(s), Some(1));
        assert!(sink.get_buffer().read().unwrap().is_empty());

        tracer.record(s, 7, 20);
        let samples = all_samples(&mut tracer, &sink);
        assert_eq!(samples.iter().map(|s| s.value).collect::<Vec<_>>(), [0, 1, 7]);
    }

    #[test]
    fn test_change_at_time_zero_amends_initial() {
        let (mut tracer, sink) = tracer(64);
        let s = tracer.register_signal(8, "s", "m").unwrap();
        tracer.record(s, 1, 0);
        assert_eq!(tracer.block(), [Sample { signal: s, time: 0, value: 1 }]);

        // returning to 0 keeps the initial sample instead of removing it
        tracer.record(s, 0, 0);
        assert_eq!(tracer.block(), [Sample { signal: s, time: 0, value: 0 }]);

        tracer.record(s, 3, 5);
        let samples = all_samples(&mut tracer, &sink);
        let values: Vec<_> = samples.iter().map(|s| (s.time, s.value)).collect();
        assert_eq!(values, [(0, 0), (5, 3)]);
    }

    #[test]
    fn test_restore_resets_late_signals() {
        let (mut tracer, sink) = tracer(64);
        let a = tracer.register_signal(8, "a", "m").unwrap();
        let snapshot = tracer.save();

        let b = tracer.register_signal(8, "b", "m").unwrap();
        tracer.record(b, 1, 100);
        tracer.restore(&snapshot);
        assert_eq!(tracer.last_value(b), Some(0));

        tracer.record(a, 5, 50);
        tracer.record(b, 2, 100);
        assert_eq!(tracer.last_value(b), Some(2));

        let samples = all_samples(&mut tracer, &sink);
        let history = |id: SignalId| samples.iter()
            .filter(|s| s.signal == id)
            .map(|s| (s.time, s.value))
            .collect::<Vec<_>>();
        assert_eq!(history(a), [(0, 0), (50, 5)]);
        assert_eq!(history(b), [(0, 0), (100, 2)]);
    }
}
