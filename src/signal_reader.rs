use std::os::fd::{AsFd, AsRawFd, RawFd};

use anyhow::{bail, Context, Result};
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::reader::{PolledReader, ReaderStatus, Session};

const EXIT_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

/// Turns SIGINT, SIGTERM and SIGQUIT into a clean exit of the loop.
#[derive(Default)]
pub struct SignalReader {
    signalfd: Option<SignalFd>,
    saved_mask: Option<SigSet>,
}

impl SignalReader {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PolledReader for SignalReader {
    fn name(&self) -> &str {
        "signal"
    }

    fn fd(&self) -> RawFd {
        self.signalfd
            .as_ref()
            .map_or(-1, |sfd| sfd.as_fd().as_raw_fd())
    }

    fn start(&mut self) -> Result<()> {
        let mut mask = SigSet::empty();
        for sig in EXIT_SIGNALS {
            mask.add(sig);
        }
        let saved = mask
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .context("Failed to block exit signals")?;
        self.saved_mask = Some(saved);
        let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)
            .context("Failed to create signalfd")?;
        self.signalfd = Some(sfd);
        Ok(())
    }

    fn handle_ready(&mut self, _session: &mut Session) -> Result<ReaderStatus> {
        let Some(sfd) = self.signalfd.as_mut() else {
            return Ok(ReaderStatus::Continue);
        };
        let Some(info) = sfd.read_signal().context("Failed to read signalfd")? else {
            return Ok(ReaderStatus::Continue);
        };
        match Signal::try_from(info.ssi_signo as i32) {
            Ok(sig) if EXIT_SIGNALS.contains(&sig) => {
                tracing::info!("Received {}, exiting", sig);
                Ok(ReaderStatus::Quit)
            }
            _ => bail!("Unexpected signal {} received via signalfd", info.ssi_signo),
        }
    }

    fn stop(&mut self) {
        self.signalfd = None;
        if let Some(saved) = self.saved_mask.take() {
            if let Err(e) = saved.thread_set_mask() {
                tracing::warn!("Failed to restore signal mask: {}", e);
            }
        }
    }
}
