use crate::back_trace::BackTrace;
use crate::config::Config;

/// Kernel task names are at most 15 bytes plus the terminating nul.
pub const TASK_COMM_LEN: usize = 16;

/// One observed scheduling delay, as decoded by either event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyEvent {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    /// Nanoseconds spent waiting to run.
    pub delay: u64,
    /// The wait was an interruptible sleep.
    pub interruptible: bool,
    pub backtrace: BackTrace,
}

/// Per-source event filter, applied while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFilter {
    /// Drop events of this thread, normally our own pid.
    pub exclude_tid: Option<u32>,
    /// Interruptible sleeps longer than this are voluntary and dropped.
    pub max_interruptible_delay: u64,
    pub min_delay: u64,
    pub pid: Option<u32>,
}

impl Default for SourceFilter {
    fn default() -> Self {
        SourceFilter {
            exclude_tid: None,
            max_interruptible_delay: u64::MAX,
            min_delay: 0,
            pid: None,
        }
    }
}

impl SourceFilter {
    pub fn from_config(config: &Config, own_pid: u32) -> Self {
        SourceFilter {
            exclude_tid: (!config.include_self).then_some(own_pid),
            max_interruptible_delay: config.max_interruptible_delay,
            min_delay: config.min_delay,
            pid: config.pid_filter,
        }
    }

    pub fn accepts(&self, event: &LatencyEvent) -> bool {
        if self.exclude_tid == Some(event.tid) {
            return false;
        }
        if event.interruptible && event.delay > self.max_interruptible_delay {
            return false;
        }
        if event.delay < self.min_delay {
            return false;
        }
        self.pid.map_or(true, |pid| pid == event.pid)
    }
}

/// Clamp a task name to what the kernel could have reported.
pub fn truncate_comm(comm: &str) -> String {
    let mut end = comm.len().min(TASK_COMM_LEN - 1);
    while !comm.is_char_boundary(end) {
        end -= 1;
    }
    comm[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tid: u32, delay: u64, interruptible: bool) -> LatencyEvent {
        LatencyEvent {
            pid: 100,
            tid,
            comm: "test".to_string(),
            delay,
            interruptible,
            backtrace: BackTrace::default(),
        }
    }

    #[test]
    fn test_default_accepts_everything() {
        let filter = SourceFilter::default();
        assert!(filter.accepts(&event(1, 0, false)));
        assert!(filter.accepts(&event(1, u64::MAX, true)));
    }

    #[test]
    fn test_self_exclusion() {
        let filter = SourceFilter {
            exclude_tid: Some(42),
            ..Default::default()
        };
        assert!(!filter.accepts(&event(42, 10, false)));
        assert!(filter.accepts(&event(43, 10, false)));
    }

    #[test]
    fn test_interruptible_ceiling() {
        let filter = SourceFilter {
            max_interruptible_delay: 5_000_000,
            ..Default::default()
        };
        assert!(filter.accepts(&event(1, 5_000_000, true)));
        assert!(!filter.accepts(&event(1, 5_000_001, true)));
        assert!(filter.accepts(&event(1, 50_000_000, false)));
    }

    #[test]
    fn test_min_delay_and_pid() {
        let filter = SourceFilter {
            min_delay: 1000,
            pid: Some(100),
            ..Default::default()
        };
        assert!(!filter.accepts(&event(1, 999, false)));
        assert!(filter.accepts(&event(1, 1000, false)));
        let mut other = event(1, 5000, false);
        other.pid = 7;
        assert!(!filter.accepts(&other));
    }

    #[test]
    fn test_from_config() {
        let config = Config::default();
        let filter = SourceFilter::from_config(&config, 77);
        assert_eq!(filter.exclude_tid, Some(77));
        assert_eq!(filter.max_interruptible_delay, 5_000_000);

        let config = Config {
            include_self: true,
            ..Config::default()
        };
        assert_eq!(SourceFilter::from_config(&config, 77).exclude_tid, None);
    }

    #[test]
    fn test_truncate_comm() {
        assert_eq!(truncate_comm("short"), "short");
        assert_eq!(truncate_comm("a_really_long_task_name"), "a_really_long_t");
        assert_eq!(truncate_comm("ééééééééé").len(), 14);
    }
}
