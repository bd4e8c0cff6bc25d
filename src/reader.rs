//! The seam between event sources and the poll loop.
//!
//! Every source of work (the perf ring buffer, the tracer pipe, the report
//! timer, signals and console commands) is a [`PolledReader`] that owns one
//! file descriptor. The loop polls all of them and hands ready readers the
//! shared [`Session`].

use std::io::{self, Write};
use std::os::fd::RawFd;

use anyhow::Result;

use crate::accountant::ProcessAccountant;
use crate::config::ReportOptions;
use crate::events::LatencyEvent;
use crate::lat_translator::LatTranslator;
use crate::symbolize::SymbolTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    Continue,
    /// Leave the loop cleanly.
    Quit,
}

/// Things a reader can ask of the loop while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopRequest {
    /// The event producer finished its handshake and is streaming.
    ProducerReady,
}

pub trait PolledReader {
    fn name(&self) -> &str;

    /// Descriptor to poll for readability. Only valid once started.
    fn fd(&self) -> RawFd;

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn handle_ready(&mut self, session: &mut Session) -> Result<ReaderStatus>;

    /// Release everything acquired by `start`. Must be safe to call twice.
    fn stop(&mut self) {}

    /// More input is already buffered, poll again without waiting.
    fn pending(&self) -> bool {
        false
    }
}

/// State shared by all readers of one run.
pub struct Session {
    pub accountant: ProcessAccountant,
    pub symbols: SymbolTable,
    pub translator: LatTranslator,
    pub report: ReportOptions,
    out: Box<dyn Write>,
    requests: Vec<LoopRequest>,
}

impl Session {
    pub fn new(symbols: SymbolTable, translator: LatTranslator, report: ReportOptions) -> Self {
        Self::with_output(symbols, translator, report, Box::new(io::stdout()))
    }

    pub fn with_output(
        symbols: SymbolTable,
        translator: LatTranslator,
        report: ReportOptions,
        out: Box<dyn Write>,
    ) -> Self {
        Session {
            accountant: ProcessAccountant::new(),
            symbols,
            translator,
            report,
            out,
            requests: Vec::new(),
        }
    }

    pub fn record(&mut self, event: &LatencyEvent) {
        self.accountant.record_event(event);
    }

    /// Print the report and reset all accounting.
    pub fn dump(&mut self) -> io::Result<()> {
        self.accountant.summarize_and_drain(
            &mut self.out,
            self.report,
            &self.symbols,
            &self.translator,
        )
    }

    pub fn output(&mut self) -> &mut dyn Write {
        self.out.as_mut()
    }

    pub fn request(&mut self, request: LoopRequest) {
        if !self.requests.contains(&request) {
            self.requests.push(request);
        }
    }

    pub fn take_requests(&mut self) -> Vec<LoopRequest> {
        std::mem::take(&mut self.requests)
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::back_trace::BackTrace;

    #[test]
    fn test_dump_drains() {
        let (mut session, buf) = session();
        session.record(&LatencyEvent {
            pid: 10,
            tid: 11,
            comm: "worker".to_string(),
            delay: 2_000_000,
            interruptible: false,
            backtrace: BackTrace::from_raw(&[0xffff_0010]),
        });
        assert_eq!(session.accountant.len(), 1);
        session.dump().unwrap();
        assert!(session.accountant.is_empty());
        let report = buf.contents();
        assert!(report.contains("worker"));
        assert!(report.contains("schedule"));
    }

    #[test]
    fn test_requests_deduplicate() {
        let (mut session, _) = session();
        session.request(LoopRequest::ProducerReady);
        session.request(LoopRequest::ProducerReady);
        assert_eq!(session.take_requests(), vec![LoopRequest::ProducerReady]);
        assert!(session.take_requests().is_empty());
    }
}
