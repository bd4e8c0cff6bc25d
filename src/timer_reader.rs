use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::reader::{PolledReader, ReaderStatus, Session};

/// Prints a report every `interval`, quitting after `count` reports when
/// `count` is non zero.
pub struct TimerReader {
    interval: Duration,
    remaining: Option<u32>,
    timer: Option<TimerFd>,
}

impl TimerReader {
    pub fn new(interval: Duration, count: u32) -> Self {
        TimerReader {
            interval,
            remaining: (count > 0).then_some(count),
            timer: None,
        }
    }

    /// Account for one report, returning whether we are done.
    fn tick(&mut self) -> ReaderStatus {
        match self.remaining.as_mut() {
            None => ReaderStatus::Continue,
            Some(left) => {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    ReaderStatus::Quit
                } else {
                    ReaderStatus::Continue
                }
            }
        }
    }
}

impl PolledReader for TimerReader {
    fn name(&self) -> &str {
        "timer"
    }

    fn fd(&self) -> RawFd {
        self.timer
            .as_ref()
            .map_or(-1, |timer| timer.as_fd().as_raw_fd())
    }

    fn start(&mut self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("Report interval must be at least one second");
        }
        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_CLOEXEC)
            .context("Failed to create timerfd")?;
        timer
            .set(
                Expiration::Interval(TimeSpec::from_duration(self.interval)),
                TimerSetTimeFlags::empty(),
            )
            .context("Failed to arm timerfd")?;
        self.timer = Some(timer);
        Ok(())
    }

    fn handle_ready(&mut self, session: &mut Session) -> Result<ReaderStatus> {
        if let Some(timer) = self.timer.as_ref() {
            timer.wait().context("Failed to read timerfd")?;
        }
        session.dump().context("Failed to write report")?;
        Ok(self.tick())
    }

    fn stop(&mut self) {
        self.timer = None;
    }
}
