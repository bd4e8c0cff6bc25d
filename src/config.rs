use std::path::PathBuf;

use clap::ValueEnum;

use crate::lat_translator::LATENCYTOP_TRANS_PATH;
use crate::symbolize::KALLSYMS_PATH;

pub const NSEC_PER_USEC: u64 = 1_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;

/// Order of threads (and of stacks within a thread) in the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SortKey {
    /// Largest single delay first
    #[default]
    Max,
    /// Largest accumulated delay first
    Total,
    /// Ascending pid, then tid
    Pid,
}

/// Where latency events come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Read the sched_latencytop tracepoint through perf
    Perf,
    /// Run a tracing script and read its line protocol
    #[default]
    Script,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportOptions {
    pub sort: SortKey,
    pub reverse: bool,
}

/// Configuration for a lattop session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    pub verbosity: u8,
    /// Seconds between reports
    pub interval: u64,
    /// Stop after this many reports (0 = never)
    pub count: u32,
    pub sort: SortKey,
    pub reverse: bool,
    /// Ignore delays shorter than this, in nanoseconds
    pub min_delay: u64,
    /// Ignore interruptible sleeps longer than this, in nanoseconds
    pub max_interruptible_delay: u64,
    /// Only report this process
    pub pid_filter: Option<u32>,
    pub backend: Backend,
    /// Tracing script handed to the tracer
    pub script: PathBuf,
    /// Tracer program and its leading arguments
    pub tracer: Vec<String>,
    pub translations: PathBuf,
    pub kallsyms: PathBuf,
    /// Keep events caused by lattop itself
    pub include_self: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            interval: 5,
            count: 0,
            sort: SortKey::Max,
            reverse: false,
            min_delay: 0,
            max_interruptible_delay: 5 * NSEC_PER_MSEC,
            pid_filter: None,
            backend: Backend::Script,
            script: PathBuf::from("lat.stp"),
            tracer: vec!["stap".to_string(), "-g".to_string()],
            translations: PathBuf::from(LATENCYTOP_TRANS_PATH),
            kallsyms: PathBuf::from(KALLSYMS_PATH),
            include_self: false,
        }
    }
}

impl Config {
    pub fn report_options(&self) -> ReportOptions {
        ReportOptions {
            sort: self.sort,
            reverse: self.reverse,
        }
    }
}
