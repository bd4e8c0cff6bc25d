//! Latency events straight from the `sched:sched_latencytop` tracepoint.
//!
//! The tracepoint is opened on every online cpu and all of them are pointed
//! at the ring buffer of the first one, so a single mapping and a single
//! descriptor carry every record.

use std::mem;
use std::os::fd::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use plain::Plain;

use crate::back_trace::{BackTrace, MAX_BT_LEN};
use crate::events::{LatencyEvent, SourceFilter, TASK_COMM_LEN};
use crate::perf::{tracepoint_id, PerfMmap, PerfOpenEvents, PERF_RECORD_SAMPLE};
use crate::reader::{PolledReader, ReaderStatus, Session};
use crate::utils::{comm_from_bytes, online_cpus, page_size};

/// Data pages behind the control page, must be a power of two.
pub const MMAP_DATA_PAGES: usize = 128;

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
#[allow(non_camel_case_types)]
pub struct perf_event_header {
    pub _type: u32,
    pub misc: u16,
    pub size: u16,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
#[allow(non_camel_case_types)]
pub struct trace_entry {
    pub _type: u16,
    pub flags: u8,
    pub preempt_count: u8,
    pub pid: i32,
    pub lock_depth: i32,
}

/// A PERF_SAMPLE_RAW record of the sched_latencytop tracepoint.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
#[allow(non_camel_case_types)]
pub struct latencytop_sample {
    pub header: perf_event_header,
    pub raw_size: u32,
    pub entry: trace_entry,
    pub comm: [u8; TASK_COMM_LEN],
    pub pid: i32,
    pub tgid: i32,
    pub inter: i32,
    pub backtrace: [u64; MAX_BT_LEN],
    pub delay: u64,
}

unsafe impl Plain for perf_event_header {}
unsafe impl Plain for latencytop_sample {}

const HEADER_SIZE: usize = mem::size_of::<perf_event_header>();

/// Turn one sample record into an event. The kernel reports the thread id as
/// `pid` and the process id as `tgid`.
pub fn decode_sample(record: &[u8]) -> Option<LatencyEvent> {
    let sample = match plain::from_bytes::<latencytop_sample>(record) {
        Ok(sample) => sample,
        Err(_) => {
            tracing::warn!("Short latencytop sample of {} bytes", record.len());
            return None;
        }
    };
    let raw = sample.backtrace;
    let depth = raw.iter().position(|&a| a == 0).unwrap_or(MAX_BT_LEN);
    let comm = sample.comm;
    Some(LatencyEvent {
        pid: sample.tgid as u32,
        tid: sample.pid as u32,
        comm: comm_from_bytes(&comm),
        delay: sample.delay,
        interruptible: sample.inter == 1,
        backtrace: BackTrace::from_raw(&raw[..depth]),
    })
}

/// Walks the records between a tail and a head position of a perf data area.
pub struct RecordWalker<'a> {
    data: &'a [u8],
    mask: u64,
}

impl<'a> RecordWalker<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        debug_assert!(data.len().is_power_of_two());
        RecordWalker {
            data,
            mask: data.len() as u64 - 1,
        }
    }

    fn copy_wrapped(&self, pos: u64, len: usize, out: &mut Vec<u8>) {
        let start = (pos & self.mask) as usize;
        let first = len.min(self.data.len() - start);
        out.clear();
        out.extend_from_slice(&self.data[start..start + first]);
        out.extend_from_slice(&self.data[..len - first]);
    }

    /// Hand every complete record in `[tail, head)` to `f` as
    /// `(type, bytes)`. Records that wrap around the end of the area are
    /// reassembled in `scratch`. Returns the new tail.
    pub fn walk<F>(&self, mut tail: u64, head: u64, scratch: &mut Vec<u8>, mut f: F) -> u64
    where
        F: FnMut(u32, &[u8]),
    {
        while tail != head {
            let remaining = head.wrapping_sub(tail);
            if remaining < HEADER_SIZE as u64 {
                tracing::warn!("Partial perf record header, resyncing");
                return head;
            }
            let start = (tail & self.mask) as usize;
            let header = if start + HEADER_SIZE <= self.data.len() {
                plain::from_bytes::<perf_event_header>(&self.data[start..start + HEADER_SIZE])
                    .ok()
                    .copied()
            } else {
                self.copy_wrapped(tail, HEADER_SIZE, scratch);
                plain::from_bytes::<perf_event_header>(scratch).ok().copied()
            };
            let Some(header) = header else {
                return head;
            };
            let size = header.size as usize;
            if size < HEADER_SIZE {
                tracing::warn!("Corrupt perf record of size {}, resyncing", size);
                return head;
            }
            if size as u64 > remaining {
                tracing::warn!("Perf record runs past the head, resyncing");
                return head;
            }

            if start + size <= self.data.len() {
                f(header._type, &self.data[start..start + size]);
            } else {
                self.copy_wrapped(tail, size, scratch);
                f(header._type, scratch);
            }
            tail = tail.wrapping_add(size as u64);
        }
        tail
    }
}

/// Tail bookkeeping for a perf data area.
#[derive(Debug)]
pub struct RingConsumer {
    prev: u64,
    scratch: Vec<u8>,
    filter: SourceFilter,
    capacity: u64,
    page_size: u64,
}

impl RingConsumer {
    pub fn new(filter: SourceFilter, capacity: usize, page_size: usize) -> Self {
        RingConsumer {
            prev: 0,
            scratch: Vec::new(),
            filter,
            capacity: capacity as u64,
            page_size: page_size as u64,
        }
    }

    pub fn tail(&self) -> u64 {
        self.prev
    }

    /// Decode everything up to `head` and return the tail to publish.
    pub fn consume<F>(&mut self, data: &[u8], head: u64, mut sink: F) -> u64
    where
        F: FnMut(LatencyEvent),
    {
        let diff = head.wrapping_sub(self.prev) as i64;
        if diff < 0 {
            tracing::warn!("Tail got ahead of head, resyncing");
            self.prev = head;
            return head;
        }
        if diff as u64 > self.capacity - self.page_size {
            tracing::warn!("Failed to keep up with kernel, events were probably lost");
        }

        let filter = self.filter;
        let walker = RecordWalker::new(data);
        self.prev = walker.walk(self.prev, head, &mut self.scratch, |kind, record| {
            if kind != PERF_RECORD_SAMPLE {
                return;
            }
            if let Some(event) = decode_sample(record) {
                if filter.accepts(&event) {
                    sink(event);
                }
            }
        });
        self.prev
    }
}

struct PerfRing {
    // Unmapped before the events are closed.
    mmap: PerfMmap,
    events: PerfOpenEvents,
    consumer: RingConsumer,
}

pub struct PerfReader {
    filter: SourceFilter,
    ring: Option<PerfRing>,
}

impl PerfReader {
    pub fn new(filter: SourceFilter) -> Self {
        PerfReader { filter, ring: None }
    }

    fn kernel_filter(&self) -> String {
        format!("inter==0 || delay<={}", self.filter.max_interruptible_delay)
    }

    fn open(&self) -> Result<PerfRing> {
        let page_size = page_size();
        let id = tracepoint_id("sched", "sched_latencytop")?;
        let cpus = online_cpus()?;

        let mut events = PerfOpenEvents::new();
        events
            .open_tracepoint(id, &cpus, ((MMAP_DATA_PAGES / 2) * page_size) as u32)
            .context("Failed to open sched_latencytop tracepoint")?;
        if let Err(e) = events.set_filter(&self.kernel_filter()) {
            tracing::warn!("Failed to set tracepoint filter, filtering in userspace: {}", e);
        }
        let leader = events.leader().context("No perf events opened")?;
        let mmap = PerfMmap::new(leader, MMAP_DATA_PAGES, page_size)?;
        events.redirect_to_leader()?;
        events.enable().context("Failed to enable perf events")?;
        tracing::info!("Tracing sched_latencytop on {} cpus", events.len());

        let consumer = RingConsumer::new(self.filter, mmap.data_size(), page_size);
        Ok(PerfRing {
            mmap,
            events,
            consumer,
        })
    }
}

impl PolledReader for PerfReader {
    fn name(&self) -> &str {
        "perf"
    }

    fn fd(&self) -> RawFd {
        self.ring
            .as_ref()
            .and_then(|ring| ring.events.leader())
            .map_or(-1, |leader| leader.as_raw_fd())
    }

    fn start(&mut self) -> Result<()> {
        if self.ring.is_none() {
            self.ring = Some(self.open()?);
        }
        Ok(())
    }

    fn handle_ready(&mut self, session: &mut Session) -> Result<ReaderStatus> {
        let Some(ring) = self.ring.as_mut() else {
            return Ok(ReaderStatus::Continue);
        };
        let head = ring.mmap.read_head();
        let tail = ring
            .consumer
            .consume(ring.mmap.data(), head, |event| session.record(&event));
        ring.mmap.write_tail(tail);
        Ok(ReaderStatus::Continue)
    }

    fn stop(&mut self) {
        self.ring = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AREA: usize = 1024;

    fn sample_bytes(pid: i32, tgid: i32, inter: i32, delay: u64, bt: &[u64]) -> Vec<u8> {
        let mut backtrace = [0u64; MAX_BT_LEN];
        backtrace[..bt.len()].copy_from_slice(bt);
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..6].copy_from_slice(b"worker");
        let sample = latencytop_sample {
            header: perf_event_header {
                _type: PERF_RECORD_SAMPLE,
                misc: 0,
                size: mem::size_of::<latencytop_sample>() as u16,
            },
            raw_size: (mem::size_of::<latencytop_sample>() - HEADER_SIZE - 4) as u32,
            entry: trace_entry::default(),
            comm,
            pid,
            tgid,
            inter,
            backtrace,
            delay,
        };
        unsafe { plain::as_bytes(&sample) }.to_vec()
    }

    fn other_record(size: u16) -> Vec<u8> {
        let header = perf_event_header {
            _type: 2,
            misc: 0,
            size,
        };
        let mut bytes = unsafe { plain::as_bytes(&header) }.to_vec();
        bytes.resize(size as usize, 0xaa);
        bytes
    }

    fn place(area: &mut [u8], pos: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            let idx = (pos as usize + i) % area.len();
            area[idx] = *b;
        }
    }

    #[test]
    fn test_sample_layout() {
        assert_eq!(mem::size_of::<latencytop_sample>(), 156);
    }

    #[test]
    fn test_decode_sample() {
        let bytes = sample_bytes(101, 100, 1, 7_000, &[0xffff_1000, 0xffff_2000]);
        let event = decode_sample(&bytes).unwrap();
        assert_eq!(event.pid, 100);
        assert_eq!(event.tid, 101);
        assert_eq!(event.comm, "worker");
        assert_eq!(event.delay, 7_000);
        assert!(event.interruptible);
        assert_eq!(event.backtrace.depth(), 2);
        assert!(decode_sample(&bytes[..100]).is_none());
    }

    #[test]
    fn test_walk_contiguous_records() {
        let mut area = vec![0u8; AREA];
        let sample = sample_bytes(5, 5, 0, 1000, &[0xffff_1000]);
        let other = other_record(24);
        place(&mut area, 0, &other);
        place(&mut area, 24, &sample);
        let head = 24 + sample.len() as u64;

        let mut seen = Vec::new();
        let mut scratch = Vec::new();
        let tail = RecordWalker::new(&area).walk(0, head, &mut scratch, |kind, rec| {
            seen.push((kind, rec.len()))
        });
        assert_eq!(tail, head);
        assert_eq!(seen, vec![(2, 24), (PERF_RECORD_SAMPLE, sample.len())]);
    }

    #[test]
    fn test_wrapped_record_matches_unwrapped() {
        let sample = sample_bytes(42, 40, 0, 123_456, &[0xffff_1000, 0xffff_2000, 0xffff_3000]);

        let mut flat = vec![0u8; AREA];
        place(&mut flat, 0, &sample);
        let mut consumer = RingConsumer::new(SourceFilter::default(), AREA, 256);
        let mut flat_events = Vec::new();
        consumer.consume(&flat, sample.len() as u64, |e| flat_events.push(e));

        // Start the record 40 bytes before the end so it straddles the wrap.
        let start = (AREA - 40) as u64;
        let mut wrapped = vec![0u8; AREA];
        place(&mut wrapped, start, &sample);
        let mut consumer = RingConsumer::new(SourceFilter::default(), AREA, 256);
        consumer.prev = start;
        let mut wrapped_events = Vec::new();
        let tail = consumer.consume(&wrapped, start + sample.len() as u64, |e| {
            wrapped_events.push(e)
        });

        assert_eq!(tail, start + sample.len() as u64);
        assert_eq!(flat_events.len(), 1);
        assert_eq!(flat_events, wrapped_events);
    }

    #[test]
    fn test_header_split_by_wrap() {
        let sample = sample_bytes(42, 40, 0, 99, &[0xffff_1000]);
        let start = (AREA - 4) as u64;
        let mut area = vec![0u8; AREA];
        place(&mut area, start, &sample);
        let mut consumer = RingConsumer::new(SourceFilter::default(), AREA, 256);
        consumer.prev = start;
        let mut events = Vec::new();
        consumer.consume(&area, start + sample.len() as u64, |e| events.push(e));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].delay, 99);
    }

    #[test]
    fn test_filter_applies_while_decoding() {
        let mut area = vec![0u8; AREA];
        let mine = sample_bytes(7, 7, 0, 1000, &[0xffff_1000]);
        let voluntary = sample_bytes(8, 8, 1, 10_000_000, &[0xffff_1000]);
        let kept = sample_bytes(9, 9, 1, 1_000, &[0xffff_1000]);
        let mut pos = 0u64;
        for rec in [&mine, &voluntary, &kept] {
            place(&mut area, pos, rec);
            pos += rec.len() as u64;
        }

        let filter = SourceFilter {
            exclude_tid: Some(7),
            max_interruptible_delay: 5_000_000,
            ..Default::default()
        };
        let mut consumer = RingConsumer::new(filter, AREA, 256);
        let mut tids = Vec::new();
        consumer.consume(&area, pos, |e| tids.push(e.tid));
        assert_eq!(tids, vec![9]);
    }

    #[test]
    fn test_nearly_full_ring_still_decodes_everything() {
        let mut area = vec![0u8; AREA];
        let start = 100u64;
        let mut pos = start;
        for delay in 1..=6u64 {
            let rec = sample_bytes(delay as i32, 1, 0, delay, &[0xffff_1000]);
            place(&mut area, pos, &rec);
            pos += rec.len() as u64;
        }
        // More than capacity - page_size is pending.
        assert!(pos - start > (AREA - 256) as u64);
        assert!(pos - start <= AREA as u64);

        let mut consumer = RingConsumer::new(SourceFilter::default(), AREA, 256);
        consumer.prev = start;
        let mut delays = Vec::new();
        let tail = consumer.consume(&area, pos, |e| delays.push(e.delay));
        assert_eq!(tail, pos);
        assert_eq!(delays, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_tail_ahead_of_head_resyncs() {
        let area = vec![0u8; AREA];
        let mut consumer = RingConsumer::new(SourceFilter::default(), AREA, 256);
        consumer.prev = 500;
        let mut count = 0;
        let tail = consumer.consume(&area, 100, |_| count += 1);
        assert_eq!(tail, 100);
        assert_eq!(consumer.tail(), 100);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_zero_size_record_aborts_walk() {
        let area = vec![0u8; AREA];
        let mut scratch = Vec::new();
        let mut count = 0;
        let tail = RecordWalker::new(&area).walk(0, 64, &mut scratch, |_, _| count += 1);
        assert_eq!(tail, 64);
        assert_eq!(count, 0);
    }
}
