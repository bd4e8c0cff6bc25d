//! Per-thread latency aggregation and the periodic report.
//!
//! Every event lands in the [`Process`] entry for its tid, keyed further by
//! the waking call stack. A dump summarizes each entry, ranks entries and
//! their stacks by the configured key, prints them and empties the table.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::{self, Write};

use chrono::Local;

use crate::back_trace::BackTrace;
use crate::config::{ReportOptions, SortKey};
use crate::events::{truncate_comm, LatencyEvent};
use crate::lat_translator::LatTranslator;
use crate::latency::{LatencyStats, StackLedger};
use crate::symbolize::SymbolTable;
use crate::timespan::{format_ms, format_timespan};

/// Longest rendered stack we try to build for one report line.
const SYMBOLIC_STACK_LEN: usize = 999;
/// Untranslated stacks are cut to this many characters in the report.
const STACK_DISPLAY_LEN: usize = 42;

/// Latency state for one thread.
#[derive(Debug)]
pub struct Process {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    ledger: StackLedger,
    summarized: LatencyStats,
}

fn compare_by_max(a: &LatencyStats, b: &LatencyStats) -> Ordering {
    b.max.cmp(&a.max)
}

fn compare_by_total(a: &LatencyStats, b: &LatencyStats) -> Ordering {
    b.total.cmp(&a.total)
}

impl Process {
    fn new(pid: u32, tid: u32, comm: &str) -> Self {
        Process {
            pid,
            tid,
            comm: truncate_comm(comm),
            ledger: StackLedger::new(),
            summarized: LatencyStats::default(),
        }
    }

    pub fn ledger(&self) -> &StackLedger {
        &self.ledger
    }

    /// Rollup computed by the last summarize pass.
    pub fn summarized(&self) -> &LatencyStats {
        &self.summarized
    }

    fn summarize(&mut self) {
        self.summarized = self.ledger.summarize();
    }

    /// Stacks ordered for display. Sorting by pid makes no sense inside one
    /// thread, so it falls back to max latency.
    pub fn ranked_stacks(&self, options: ReportOptions) -> Vec<(&BackTrace, &LatencyStats)> {
        let mut stacks: Vec<_> = self.ledger.iter().collect();
        match options.sort {
            SortKey::Total => stacks.sort_by(|a, b| compare_by_total(a.1, b.1)),
            SortKey::Max | SortKey::Pid => stacks.sort_by(|a, b| compare_by_max(a.1, b.1)),
        }
        if options.reverse {
            stacks.reverse();
        }
        stacks
    }

    fn label(&self) -> String {
        if self.pid != self.tid {
            format!("{} ({}, thread {})", self.comm, self.pid, self.tid)
        } else {
            format!("{} ({})", self.comm, self.pid)
        }
    }

    fn dump<W: Write>(
        &self,
        out: &mut W,
        options: ReportOptions,
        symbols: &SymbolTable,
        translator: &LatTranslator,
    ) -> io::Result<()> {
        writeln!(
            out,
            "{:<44} Max:{:>8} Total:{:>8}",
            self.label(),
            format_ms(self.summarized.max / 1000, 3),
            format_timespan(self.summarized.total / 1000, 0)
        )?;

        for (bt, stats) in self.ranked_stacks(options) {
            let rendered = bt.render_symbolic(symbols, SYMBOLIC_STACK_LEN);
            let label = match translator.translate_stack(&rendered) {
                Some(text) => text.to_string(),
                None => {
                    let short: String = rendered.chars().take(STACK_DISPLAY_LEN).collect();
                    format!("[{short}]")
                }
            };
            let percentage = if self.summarized.total == 0 {
                0.0
            } else {
                stats.total as f64 * 100.0 / self.summarized.total as f64
            };
            writeln!(
                out,
                " {:<44} Max:{:>8} {:>5.1}%",
                label,
                format_ms(stats.max / 1000, 3),
                percentage
            )?;
        }
        Ok(())
    }
}

/// Owner of all per-thread latency state between two reports.
#[derive(Debug, Default)]
pub struct ProcessAccountant {
    processes: BTreeMap<u32, Process>,
}

impl ProcessAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one delay. The pid and comm of a tid are taken from the first
    /// event seen for it.
    pub fn record(&mut self, pid: u32, tid: u32, comm: &str, delay: u64, backtrace: BackTrace) {
        self.processes
            .entry(tid)
            .or_insert_with(|| Process::new(pid, tid, comm))
            .ledger
            .record(backtrace, delay);
    }

    pub fn record_event(&mut self, event: &LatencyEvent) {
        self.record(
            event.pid,
            event.tid,
            &event.comm,
            event.delay,
            event.backtrace,
        );
    }

    pub fn get(&self, tid: u32) -> Option<&Process> {
        self.processes.get(&tid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn clear(&mut self) {
        self.processes.clear();
    }

    /// Refresh every thread's rollup and return the threads in report order.
    pub fn summarize(&mut self, options: ReportOptions) -> Vec<&Process> {
        for process in self.processes.values_mut() {
            process.summarize();
        }

        let mut ranked: Vec<&Process> = self.processes.values().collect();
        match options.sort {
            SortKey::Max => ranked.sort_by(|a, b| compare_by_max(&a.summarized, &b.summarized)),
            SortKey::Total => {
                ranked.sort_by(|a, b| compare_by_total(&a.summarized, &b.summarized))
            }
            SortKey::Pid => ranked.sort_by_key(|p| (p.pid, p.tid)),
        }
        if options.reverse {
            ranked.reverse();
        }
        ranked
    }

    /// Print the report and forget everything recorded so far. The table is
    /// empty afterwards even if writing the report failed.
    pub fn summarize_and_drain<W: Write>(
        &mut self,
        out: &mut W,
        options: ReportOptions,
        symbols: &SymbolTable,
        translator: &LatTranslator,
    ) -> io::Result<()> {
        let res = self.write_report(out, options, symbols, translator);
        self.clear();
        res
    }

    fn write_report<W: Write>(
        &mut self,
        out: &mut W,
        options: ReportOptions,
        symbols: &SymbolTable,
        translator: &LatTranslator,
    ) -> io::Result<()> {
        writeln!(out)?;
        for process in self.summarize(options) {
            process.dump(out, options, symbols, translator)?;
        }
        writeln!(out, "=== {}", Local::now().format("%a %b %e %H:%M:%S %Y"))?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bt(addrs: &[u64]) -> BackTrace {
        BackTrace::from_raw(addrs)
    }

    fn order(acct: &mut ProcessAccountant, sort: SortKey, reverse: bool) -> Vec<u32> {
        acct.summarize(ReportOptions { sort, reverse })
            .iter()
            .map(|p| p.tid)
            .collect()
    }

    #[test]
    fn test_same_stack_accumulates() {
        let mut acct = ProcessAccountant::new();
        acct.record(100, 100, "alpha", 5000, bt(&[0x1000]));
        acct.record(100, 100, "alpha", 9000, bt(&[0x1000]));
        let ranked = acct.summarize(ReportOptions::default());
        assert_eq!(ranked.len(), 1);
        let p = ranked[0];
        assert_eq!(
            *p.summarized(),
            LatencyStats {
                total: 14000,
                max: 9000,
                count: 2
            }
        );
        assert_eq!(p.ledger().len(), 1);
    }

    #[test]
    fn test_sort_by_max() {
        let mut acct = ProcessAccountant::new();
        acct.record(100, 100, "a", 5000, bt(&[1]));
        acct.record(200, 200, "b", 9000, bt(&[1]));
        assert_eq!(order(&mut acct, SortKey::Max, false), vec![200, 100]);
        assert_eq!(order(&mut acct, SortKey::Max, true), vec![100, 200]);
    }

    #[test]
    fn test_sort_by_total() {
        let mut acct = ProcessAccountant::new();
        acct.record(1, 1, "a", 9000, bt(&[1]));
        acct.record(2, 2, "b", 6000, bt(&[1]));
        acct.record(2, 2, "b", 6000, bt(&[2]));
        assert_eq!(order(&mut acct, SortKey::Total, false), vec![2, 1]);
        assert_eq!(order(&mut acct, SortKey::Max, false), vec![1, 2]);
    }

    #[test]
    fn test_sort_by_pid_then_tid() {
        let mut acct = ProcessAccountant::new();
        acct.record(20, 21, "t", 1, bt(&[1]));
        acct.record(10, 12, "t", 1, bt(&[1]));
        acct.record(20, 20, "t", 1, bt(&[1]));
        acct.record(10, 11, "t", 1, bt(&[1]));
        assert_eq!(order(&mut acct, SortKey::Pid, false), vec![11, 12, 20, 21]);
        assert_eq!(order(&mut acct, SortKey::Pid, true), vec![21, 20, 12, 11]);
    }

    #[test]
    fn test_first_comm_and_pid_stick() {
        let mut acct = ProcessAccountant::new();
        acct.record(10, 11, "before", 1, bt(&[1]));
        acct.record(99, 11, "after", 1, bt(&[1]));
        let p = acct.get(11).unwrap();
        assert_eq!(p.pid, 10);
        assert_eq!(p.comm, "before");
    }

    #[test]
    fn test_ranked_stacks() {
        let mut acct = ProcessAccountant::new();
        acct.record(1, 1, "a", 100, bt(&[1]));
        acct.record(1, 1, "a", 100, bt(&[1]));
        acct.record(1, 1, "a", 150, bt(&[2]));
        let p = acct.get(1).unwrap();

        let by_max: Vec<_> = p
            .ranked_stacks(ReportOptions {
                sort: SortKey::Max,
                reverse: false,
            })
            .iter()
            .map(|(bt, _)| bt.addresses()[0])
            .collect();
        assert_eq!(by_max, vec![2, 1]);

        let by_total: Vec<_> = p
            .ranked_stacks(ReportOptions {
                sort: SortKey::Total,
                reverse: false,
            })
            .iter()
            .map(|(bt, _)| bt.addresses()[0])
            .collect();
        assert_eq!(by_total, vec![1, 2]);
    }

    #[test]
    fn test_drain_empties_table() {
        let symbols = SymbolTable::from_records([(0x1000, 't', "schedule")]);
        let translator = LatTranslator::new();
        let mut acct = ProcessAccountant::new();
        acct.record(1, 1, "a", 100, bt(&[0x1000]));
        acct.record(2, 3, "b", 100, bt(&[0x1000]));
        let mut out = Vec::new();
        acct.summarize_and_drain(&mut out, ReportOptions::default(), &symbols, &translator)
            .unwrap();
        assert!(acct.is_empty());

        acct.record(5, 5, "c", 7, bt(&[0x1000]));
        assert_eq!(acct.len(), 1);
        let p = acct.get(5).unwrap();
        assert_eq!(p.ledger().summarize(), LatencyStats::new(7));
    }

    #[test]
    fn test_report_contents() {
        let symbols = SymbolTable::from_records([
            (0x1000, 't', "schedule"),
            (0x2000, 't', "vfs_read"),
            (0x3000, 't', "do_nanosleep"),
        ]);
        let mut translator = LatTranslator::new();
        translator.insert(1, "vfs_read", "Reading from file");

        let mut acct = ProcessAccountant::new();
        acct.record(100, 100, "alpha", 3_000_000, bt(&[0x1000, 0x2000]));
        acct.record(100, 100, "alpha", 1_000_000, bt(&[0x1000, 0x3000]));
        acct.record(100, 101, "alpha", 500_000, bt(&[0x3000]));

        let mut out = Vec::new();
        acct.summarize_and_drain(&mut out, ReportOptions::default(), &symbols, &translator)
            .unwrap();
        let report = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = report.lines().collect();

        assert_eq!(lines[0], "");
        assert!(lines[1].starts_with("alpha (100) "));
        assert!(lines[1].contains("Max:  3.00 ms"));
        assert!(lines[1].contains("Total:    4 ms"));
        assert!(lines[2].starts_with(" Reading from file "));
        assert!(lines[2].ends_with(" 75.0%"));
        assert!(lines[3].starts_with(" [schedule do_nanosleep] "));
        assert!(lines[3].ends_with(" 25.0%"));
        assert!(lines[4].starts_with("alpha (100, thread 101)"));
        assert!(lines[5].starts_with(" [do_nanosleep] "));
        assert!(lines[5].ends_with("100.0%"));
        assert!(lines[6].starts_with("=== "));
        assert_eq!(lines.len(), 7);
    }
}
