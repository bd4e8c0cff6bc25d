//! Latency events from a tracing script's stdout.
//!
//! The script speaks a small line protocol. After a `lat begin` handshake
//! every event is two lines:
//!
//! ```text
//! s 1234 10 11 myapp
//! ffffffff810a1b2c ffffffff810a3d4e
//! ```
//!
//! The first carries the sleep (`s`) or block (`b`) flag, the delay in
//! nanoseconds, pid, tid and task name. The second is the kernel backtrace
//! as hex addresses, innermost frame first.

use std::fmt;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use anyhow::Result;

use crate::back_trace::{BackTrace, MAX_BT_LEN};
use crate::events::{truncate_comm, LatencyEvent, SourceFilter};
use crate::reader::{LoopRequest, PolledReader, ReaderStatus, Session};
use crate::ringbuf::ByteRing;
use crate::tracer_child::{spawn_tracer, TracerArgs, TracerChild};

pub const HANDSHAKE: &str = "lat begin";
/// Bytes buffered from the tracer pipe.
pub const PIPE_RING_SIZE: usize = 64 * 1024;
/// Lines handled per wakeup before yielding to the other readers.
pub const MAX_LINES_PER_WAKEUP: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The first line was not the handshake.
    BadHandshake { line: String },
    /// A process info line could not be parsed.
    BadProcInfo { line: String },
    /// The tracer closed its output.
    ProducerExited,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadHandshake { line } => {
                write!(f, "expected '{HANDSHAKE}' from tracer, got '{line}'")
            }
            ProtocolError::BadProcInfo { line } => {
                write!(f, "malformed process info line from tracer: '{line}'")
            }
            ProtocolError::ProducerExited => write!(f, "tracer exited"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParserState {
    Starting,
    WantProcInfo,
    WantLatency(ProcInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcInfo {
    interruptible: bool,
    delay: u64,
    pid: u32,
    tid: u32,
    comm: String,
}

/// What one line turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Handshake seen, the tracer is running.
    Started,
    /// Line consumed, nothing to report yet (or the event was filtered).
    Nothing,
    Event(LatencyEvent),
}

/// Split off the next whitespace separated field.
fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() {
        return None;
    }
    let end = s.find(|c: char| c.is_ascii_whitespace()).unwrap_or(s.len());
    Some(s.split_at(end))
}

fn parse_proc_info(line: &str) -> Option<ProcInfo> {
    let mut chars = line.chars();
    let flag = chars.next()?;
    let (delay, rest) = next_field(chars.as_str())?;
    let (pid, rest) = next_field(rest)?;
    let (tid, rest) = next_field(rest)?;
    let delay = delay.parse().ok()?;
    let pid = pid.parse().ok()?;
    let tid = tid.parse().ok()?;
    // The task name runs to the end of the line and may contain spaces.
    let comm = rest.trim_start_matches(|c: char| c.is_ascii_whitespace());
    if comm.is_empty() {
        return None;
    }
    Some(ProcInfo {
        interruptible: flag == 's',
        delay,
        pid,
        tid,
        comm: truncate_comm(comm),
    })
}

fn parse_backtrace(line: &str) -> BackTrace {
    let mut addresses = Vec::with_capacity(MAX_BT_LEN);
    for token in line.split_whitespace().take(MAX_BT_LEN) {
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        match u64::from_str_radix(digits, 16) {
            Ok(addr) => addresses.push(addr),
            Err(_) => break,
        }
    }
    BackTrace::from_raw(&addresses)
}

/// The protocol state machine, independent of where the lines come from.
#[derive(Debug)]
pub struct LineDecoder {
    state: ParserState,
    filter: SourceFilter,
    resyncing: bool,
}

impl LineDecoder {
    pub fn new(filter: SourceFilter) -> Self {
        LineDecoder {
            state: ParserState::Starting,
            filter,
            resyncing: false,
        }
    }

    pub fn started(&self) -> bool {
        self.state != ParserState::Starting
    }

    /// A line was lost. Drop any half decoded event and expect a process
    /// info line again, tolerating one line that is not.
    pub fn resync(&mut self) {
        if self.started() {
            self.state = ParserState::WantProcInfo;
            self.resyncing = true;
        }
    }

    pub fn feed_line(&mut self, line: &str) -> Result<Decoded, ProtocolError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        match std::mem::replace(&mut self.state, ParserState::WantProcInfo) {
            ParserState::Starting => {
                if line != HANDSHAKE {
                    self.state = ParserState::Starting;
                    return Err(ProtocolError::BadHandshake {
                        line: line.to_string(),
                    });
                }
                Ok(Decoded::Started)
            }
            ParserState::WantProcInfo => match parse_proc_info(line) {
                Some(info) => {
                    self.resyncing = false;
                    self.state = ParserState::WantLatency(info);
                    Ok(Decoded::Nothing)
                }
                None if self.resyncing => {
                    tracing::debug!("Skipping '{}' while resyncing with tracer", line);
                    self.resyncing = false;
                    Ok(Decoded::Nothing)
                }
                None => Err(ProtocolError::BadProcInfo {
                    line: line.to_string(),
                }),
            },
            ParserState::WantLatency(info) => {
                let event = LatencyEvent {
                    pid: info.pid,
                    tid: info.tid,
                    comm: info.comm,
                    delay: info.delay,
                    interruptible: info.interruptible,
                    backtrace: parse_backtrace(line),
                };
                if self.filter.accepts(&event) {
                    Ok(Decoded::Event(event))
                } else {
                    Ok(Decoded::Nothing)
                }
            }
        }
    }
}

/// Splits a byte stream into lines and runs them through a [`LineDecoder`].
#[derive(Debug)]
pub struct LineFramer {
    ring: ByteRing,
    line: Vec<u8>,
    decoder: LineDecoder,
    /// The ring was dropped mid line, skip up to the next newline.
    discarding: bool,
}

impl LineFramer {
    pub fn new(filter: SourceFilter, capacity: usize) -> Self {
        LineFramer {
            ring: ByteRing::new(capacity),
            line: Vec::new(),
            decoder: LineDecoder::new(filter),
            discarding: false,
        }
    }

    pub fn ring_mut(&mut self) -> &mut ByteRing {
        &mut self.ring
    }

    /// Decode up to `max_lines` complete lines. Returns the number handled.
    pub fn drain<F>(&mut self, max_lines: usize, mut on_line: F) -> Result<usize, ProtocolError>
    where
        F: FnMut(Decoded),
    {
        let mut handled = 0;
        while handled < max_lines {
            if !self.ring.next_line(&mut self.line) {
                if self.discarding {
                    self.ring.clear();
                } else if self.ring.is_full() {
                    tracing::warn!(
                        "Tracer line longer than {} bytes, discarding it",
                        self.ring.capacity()
                    );
                    self.ring.clear();
                    self.discarding = true;
                    self.decoder.resync();
                }
                break;
            }
            if self.discarding {
                self.discarding = false;
                continue;
            }
            handled += 1;
            let line = String::from_utf8_lossy(&self.line);
            on_line(self.decoder.feed_line(&line)?);
        }
        Ok(handled)
    }
}

pub struct ScriptReader {
    tracer: Vec<String>,
    script: PathBuf,
    args: TracerArgs,
    framer: LineFramer,
    child: Option<TracerChild>,
    eof: bool,
    pending: bool,
}

impl ScriptReader {
    pub fn new(tracer: Vec<String>, script: PathBuf, args: TracerArgs, filter: SourceFilter) -> Self {
        ScriptReader {
            tracer,
            script,
            args,
            framer: LineFramer::new(filter, PIPE_RING_SIZE),
            child: None,
            eof: false,
            pending: false,
        }
    }

    /// Pull whatever the pipe has without blocking.
    fn fill(&mut self) -> io::Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        while !self.eof && !self.framer.ring.is_full() {
            match self.framer.ring.fill_from(child.stdout()) {
                Ok(0) => self.eof = true,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl PolledReader for ScriptReader {
    fn name(&self) -> &str {
        "script"
    }

    fn fd(&self) -> RawFd {
        self.child
            .as_ref()
            .map_or(-1, |child| child.as_raw_fd())
    }

    fn start(&mut self) -> Result<()> {
        if self.child.is_none() {
            self.child = Some(spawn_tracer(&self.tracer, &self.script, self.args)?);
        }
        Ok(())
    }

    fn handle_ready(&mut self, session: &mut Session) -> Result<ReaderStatus> {
        self.fill()?;
        let handled = self.framer.drain(MAX_LINES_PER_WAKEUP, |decoded| match decoded {
            Decoded::Started => {
                tracing::info!("Tracer is running");
                session.request(LoopRequest::ProducerReady);
            }
            Decoded::Event(event) => session.record(&event),
            Decoded::Nothing => {}
        })?;
        self.pending = handled == MAX_LINES_PER_WAKEUP;
        if self.eof && !self.pending {
            return Err(ProtocolError::ProducerExited.into());
        }
        Ok(ReaderStatus::Continue)
    }

    fn stop(&mut self) {
        self.child = None;
        self.pending = false;
    }

    fn pending(&self) -> bool {
        self.pending
    }
}
