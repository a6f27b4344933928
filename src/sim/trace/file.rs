//! The binary trace file.
//!
//! A trace file consists of a fixed-size header followed by the flushed sample blocks.
//! All multi-byte integers are stored in the byte order of the simulated machine,
//! which is recorded in the header.
//!
//! Header layout:
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 8    | magic (`MCUTRACE`)                     |
//! | 8      | 1    | format version                         |
//! | 9      | 1    | byte order (0: little, 1: big)         |
//! | 10     | 2    | reserved                               |
//! | 12     | 4    | signal table capacity                  |
//! | 16     | 4    | number of registered signals           |
//! | 20     | 8    | number of samples                      |
//! | 28     | 8    | start time (ns)                        |
//! | 36     | 8    | end time (ns)                          |
//! | 44     | 72 × capacity | signal table                  |
//!
//! Each signal table entry holds the signal's id (4 bytes), its width (1 byte),
//! 3 reserved bytes, then its name and module, each NUL-padded to 32 bytes.
//!
//! Each sample is 20 bytes: signal id (4), time (8), value (8).
//!
//! The header is written with zeroed counters when the file is created and rewritten
//! when the trace is finished, so an unfinished file still holds every flushed sample.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, warn};

use crate::sim::regs::ByteOrder;

use super::{Sample, Signal, SignalId, TraceSink, TraceSummary};

/// The magic bytes at the start of every trace file.
pub const MAGIC: [u8; 8] = *b"MCUTRACE";
/// The current format version.
pub const VERSION: u8 = 1;

const FIXED_HEADER_LEN: usize = 44;
const TEXT_LEN: usize = 32;
const ENTRY_LEN: usize = 4 + 1 + 3 + TEXT_LEN + TEXT_LEN;
const SAMPLE_LEN: usize = 20;

fn header_len(capacity: u32) -> u64 {
    FIXED_HEADER_LEN as u64 + ENTRY_LEN as u64 * u64::from(capacity)
}

/// Integer encoding in a given byte order.
struct Encoder<'a> {
    order: ByteOrder,
    buf: &'a mut Vec<u8>
}
impl Encoder<'_> {
    fn u32(&mut self, n: u32) {
        match self.order {
            ByteOrder::Little => self.buf.extend_from_slice(&n.to_le_bytes()),
            ByteOrder::Big    => self.buf.extend_from_slice(&n.to_be_bytes()),
        }
    }
    fn u64(&mut self, n: u64) {
        match self.order {
            ByteOrder::Little => self.buf.extend_from_slice(&n.to_le_bytes()),
            ByteOrder::Big    => self.buf.extend_from_slice(&n.to_be_bytes()),
        }
    }
    fn text(&mut self, s: &str) {
        let mut end = s.len().min(TEXT_LEN);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        if end < s.len() {
            warn!("`{s}` truncated to {TEXT_LEN} bytes in trace signal table");
        }
        self.buf.extend_from_slice(&s.as_bytes()[..end]);
        self.buf.resize(self.buf.len() + TEXT_LEN - end, 0);
    }
}

/// Integer decoding in a given byte order.
struct Decoder<'a> {
    order: ByteOrder,
    buf: &'a [u8]
}
impl Decoder<'_> {
    fn take<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        if self.buf.len() < N {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "trace file header is truncated"));
        }
        let (head, rest) = self.buf.split_at(N);
        self.buf = rest;
        let mut out = [0; N];
        out.copy_from_slice(head);
        Ok(out)
    }
    fn u8(&mut self) -> io::Result<u8> {
        self.take::<1>().map(|[b]| b)
    }
    fn u32(&mut self) -> io::Result<u32> {
        let bytes = self.take()?;
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big    => u32::from_be_bytes(bytes),
        })
    }
    fn u64(&mut self) -> io::Result<u64> {
        let bytes = self.take()?;
        Ok(match self.order {
            ByteOrder::Little => u64::from_le_bytes(bytes),
            ByteOrder::Big    => u64::from_be_bytes(bytes),
        })
    }
    fn text(&mut self) -> io::Result<String> {
        let bytes = self.take::<TEXT_LEN>()?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(TEXT_LEN);
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

fn encode_header(order: ByteOrder, capacity: u32, summary: &TraceSummary<'_>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header_len(capacity) as usize);
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.push(order.tag());
    buf.extend_from_slice(&[0; 2]);

    let kept = summary.signals.len().min(capacity as usize);
    if kept < summary.signals.len() {
        warn!("trace file holds {capacity} signals, {} signals were not written", summary.signals.len() - kept);
    }
    let signals = &summary.signals[..kept];

    let mut enc = Encoder { order, buf: &mut buf };
    enc.u32(capacity);
    enc.u32(signals.len() as u32);
    enc.u64(summary.samples);
    enc.u64(summary.start_ns);
    enc.u64(summary.end_ns);
    for signal in signals {
        enc.u32(signal.id.index());
        enc.buf.push(signal.width);
        enc.buf.extend_from_slice(&[0; 3]);
        enc.text(&signal.name);
        enc.text(&signal.module);
    }

    buf.resize(header_len(capacity) as usize, 0);
    buf
}

fn encode_samples(order: ByteOrder, samples: &[Sample]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * SAMPLE_LEN);
    let mut enc = Encoder { order, buf: &mut buf };
    for s in samples {
        enc.u32(s.signal.index());
        enc.u64(s.time);
        enc.u64(s.value);
    }
    buf
}

/// A [`TraceSink`] which writes a trace file.
#[derive(Debug)]
pub struct TraceFile {
    out: BufWriter<File>,
    order: ByteOrder,
    capacity: u32,
}
impl TraceFile {
    /// Creates (or truncates) the trace file at `path`.
    ///
    /// - `capacity`: the number of signal table entries reserved in the header.
    ///   This should be the tracer's signal capacity.
    /// - `order`: the byte order the file is written in.
    pub fn create(path: impl AsRef<Path>, capacity: u32, order: ByteOrder) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;
        debug!("opened trace file {}", path.display());
        Self::from_file(file, capacity, order)
    }

    /// Writes a trace into an already opened file, replacing its contents.
    pub fn from_file(file: File, capacity: u32, order: ByteOrder) -> io::Result<Self> {
        file.set_len(0)?;

        let mut out = BufWriter::new(file);
        let empty = TraceSummary { signals: &[], samples: 0, start_ns: 0, end_ns: 0 };
        out.write_all(&encode_header(order, capacity, &empty))?;
        Ok(Self { out, order, capacity })
    }

    /// The byte order of this file.
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }
}
impl TraceSink for TraceFile {
    fn write_samples(&mut self, samples: &[Sample]) -> io::Result<()> {
        self.out.write_all(&encode_samples(self.order, samples))
    }

    fn rewind(&mut self, persisted: u64) -> io::Result<()> {
        let pos = header_len(self.capacity) + persisted * SAMPLE_LEN as u64;
        self.out.flush()?;
        let end = self.out.get_ref().metadata()?.len();
        if pos > end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot rewind to {persisted} samples, the file only holds {}", end.saturating_sub(header_len(self.capacity)) / SAMPLE_LEN as u64),
            ));
        }
        self.out.get_mut().set_len(pos)?;
        self.out.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn finish(&mut self, summary: &TraceSummary<'_>) -> io::Result<()> {
        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(0))?;
        self.out.write_all(&encode_header(self.order, self.capacity, summary))?;
        self.out.seek(SeekFrom::Start(end))?;
        self.out.flush()
    }
}

/// The decoded contents of a trace file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceData {
    /// Byte order the file was written in.
    pub byte_order: ByteOrder,
    /// The signal table.
    pub signals: Vec<Signal>,
    /// The sample count stored in the header (0 if the trace was never finished).
    pub sample_count: u64,
    /// Simulated time at which the trace was opened.
    pub start_ns: u64,
    /// Simulated time at which the trace was closed.
    pub end_ns: u64,
    /// All samples in the file.
    pub samples: Vec<Sample>,
}

/// Reads a trace file.
pub fn read_trace(path: impl AsRef<Path>) -> io::Result<TraceData> {
    let mut bytes = vec![];
    File::open(path)?.read_to_end(&mut bytes)?;
    decode(&bytes)
}

fn decode(bytes: &[u8]) -> io::Result<TraceData> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

    if bytes.get(..8) != Some(&MAGIC[..]) { return Err(invalid("not a trace file")) };
    match bytes.get(8) {
        Some(&VERSION) => {},
        Some(v) => return Err(invalid(&format!("unsupported trace file version {v}"))),
        None => return Err(invalid("trace file header is truncated")),
    }
    let byte_order = bytes.get(9).copied()
        .and_then(ByteOrder::from_tag)
        .ok_or_else(|| invalid("invalid byte order tag"))?;

    let mut dec = Decoder { order: byte_order, buf: bytes.get(12..).unwrap_or_default() };
    let capacity = dec.u32()?;
    let signal_count = dec.u32()?;
    let sample_count = dec.u64()?;
    let start_ns = dec.u64()?;
    let end_ns = dec.u64()?;
    if signal_count > capacity { return Err(invalid("signal count exceeds table capacity")) };
    if header_len(capacity) > bytes.len() as u64 { return Err(invalid("trace file header is truncated")) };

    let mut signals = vec![];
    for _ in 0..signal_count {
        let id = SignalId(dec.u32()?);
        let width = dec.u8()?;
        dec.take::<3>()?;
        let name = dec.text()?;
        let module = dec.text()?;
        signals.push(Signal { id, width, name, module });
    }

    let body = bytes.get(header_len(capacity) as usize..).ok_or_else(|| invalid("trace file header is truncated"))?;
    if body.len() % SAMPLE_LEN != 0 {
        warn!("trace file ends with a partial sample");
    }
    let samples = body.chunks_exact(SAMPLE_LEN)
        .map(|chunk| {
            let mut dec = Decoder { order: byte_order, buf: chunk };
            Ok(Sample { signal: SignalId(dec.u32()?), time: dec.u64()?, value: dec.u64()? })
        })
        .collect::<io::Result<_>>()?;

    Ok(TraceData { byte_order, signals, sample_count, start_ns, end_ns, samples })
}
