//! lattop - show which kernel call stacks make threads wait to run.
//!
//! Latency samples come either from the `sched:sched_latencytop` tracepoint
//! through a perf ring buffer, or from a tracing script speaking a line
//! protocol on a pipe. Samples are accounted per thread and per kernel
//! backtrace and printed as a ranked report every interval.
//!
//! # Modules
//!
//! - [`accountant`] - per thread aggregation and the periodic report
//! - [`event_loop`] - the poll loop driving every [`reader::PolledReader`]
//! - [`perf_reader`] - tracepoint ring buffer event source
//! - [`script_reader`] - line protocol event source
//! - [`symbolize`] - kernel symbol table

pub mod accountant;
pub mod back_trace;
pub mod command_reader;
pub mod config;
pub mod event_loop;
pub mod events;
pub mod lat_translator;
pub mod latency;
pub mod lattop_core;
pub mod perf;
pub mod perf_reader;
pub mod reader;
pub mod ringbuf;
pub mod script_reader;
pub mod signal_reader;
pub mod symbolize;
pub mod timer_reader;
pub mod timespan;
pub mod tracer_child;
pub mod utils;

pub use accountant::{Process, ProcessAccountant};
pub use back_trace::{BackTrace, MAX_BT_LEN};
pub use config::{Backend, Config, ReportOptions, SortKey};
pub use event_loop::EventLoop;
pub use events::{LatencyEvent, SourceFilter};
pub use lattop_core::lattop;
pub use reader::{LoopRequest, PolledReader, ReaderStatus, Session};
pub use script_reader::{LineDecoder, ProtocolError};
pub use symbolize::SymbolTable;
