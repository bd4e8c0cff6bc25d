use std::collections::btree_map::{self, BTreeMap, Entry};

use crate::back_trace::BackTrace;

/// Running count/total/max over a set of delays, all in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    pub total: u64,
    pub max: u64,
    pub count: u64,
}

impl LatencyStats {
    pub fn new(delay: u64) -> Self {
        LatencyStats {
            total: delay,
            max: delay,
            count: 1,
        }
    }

    pub fn add_delay(&mut self, delay: u64) {
        self.total = self.total.saturating_add(delay);
        self.max = self.max.max(delay);
        self.count += 1;
    }

    pub fn merge(&mut self, other: &LatencyStats) {
        self.total = self.total.saturating_add(other.total);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }
}

/// Latency per distinct call stack for one thread.
#[derive(Debug, Default)]
pub struct StackLedger {
    stacks: BTreeMap<BackTrace, LatencyStats>,
}

impl StackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, backtrace: BackTrace, delay: u64) {
        match self.stacks.entry(backtrace) {
            Entry::Occupied(mut entry) => entry.get_mut().add_delay(delay),
            Entry::Vacant(entry) => {
                entry.insert(LatencyStats::new(delay));
            }
        }
    }

    /// Fold every stack into one rollup.
    pub fn summarize(&self) -> LatencyStats {
        self.stacks
            .values()
            .fold(LatencyStats::default(), |mut acc, stats| {
                acc.merge(stats);
                acc
            })
    }

    pub fn get(&self, backtrace: &BackTrace) -> Option<&LatencyStats> {
        self.stacks.get(backtrace)
    }

    /// Stacks in ascending [`BackTrace`] order.
    pub fn iter(&self) -> btree_map::Iter<'_, BackTrace, LatencyStats> {
        self.stacks.iter()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulate() {
        let mut stats = LatencyStats::new(5000);
        stats.add_delay(9000);
        stats.add_delay(1000);
        assert_eq!(
            stats,
            LatencyStats {
                total: 15000,
                max: 9000,
                count: 3
            }
        );
    }

    #[test]
    fn test_stats_merge() {
        let mut a = LatencyStats::new(10);
        let mut b = LatencyStats::new(30);
        b.add_delay(5);
        a.merge(&b);
        assert_eq!(a.total, 45);
        assert_eq!(a.max, 30);
        assert_eq!(a.count, 3);

        let mut empty = LatencyStats::default();
        empty.merge(&a);
        assert_eq!(empty, a);
    }

    #[test]
    fn test_ledger_same_stack() {
        let mut ledger = StackLedger::new();
        let bt = BackTrace::from_raw(&[0x1000]);
        ledger.record(bt, 5000);
        ledger.record(bt, 9000);
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.summarize(),
            LatencyStats {
                total: 14000,
                max: 9000,
                count: 2
            }
        );
    }

    #[test]
    fn test_ledger_summarize_matches_samples() {
        let mut ledger = StackLedger::new();
        let stacks = [
            BackTrace::from_raw(&[1, 2]),
            BackTrace::from_raw(&[1]),
            BackTrace::from_raw(&[3, 4, 5]),
        ];
        let mut expected: Vec<LatencyStats> = vec![LatencyStats::default(); stacks.len()];
        for i in 0..100u64 {
            let which = (i * 7 % 3) as usize;
            let delay = i * 13 + 1;
            ledger.record(stacks[which], delay);
            let e = &mut expected[which];
            e.total += delay;
            e.max = e.max.max(delay);
            e.count += 1;
        }
        for (bt, want) in stacks.iter().zip(expected.iter()) {
            assert_eq!(ledger.get(bt), Some(want));
        }
        let total = ledger.summarize();
        assert_eq!(total.count, 100);
        assert_eq!(total.total, (0..100u64).map(|i| i * 13 + 1).sum::<u64>());
        assert_eq!(total.max, 99 * 13 + 1);
    }

    #[test]
    fn test_ledger_iterates_in_key_order() {
        let mut ledger = StackLedger::new();
        ledger.record(BackTrace::from_raw(&[3]), 1);
        ledger.record(BackTrace::from_raw(&[1, 9]), 1);
        ledger.record(BackTrace::from_raw(&[1]), 1);
        let keys: Vec<_> = ledger.iter().map(|(bt, _)| bt.addresses()[0..2].to_vec()).collect();
        assert_eq!(keys, vec![vec![1, 0], vec![1, 9], vec![3, 0]]);
    }
}
