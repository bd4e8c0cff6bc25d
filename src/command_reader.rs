use std::io::Write;
use std::os::fd::RawFd;

use anyhow::{Context, Result};
use nix::errno::Errno;

use crate::reader::{PolledReader, ReaderStatus, Session};

const HELP: &str = "dump, version, help, quit";

/// Interactive commands typed on the controlling terminal.
pub struct CommandReader {
    fd: RawFd,
    partial: String,
}

impl CommandReader {
    pub fn stdin() -> Self {
        Self::with_fd(libc::STDIN_FILENO)
    }

    pub fn with_fd(fd: RawFd) -> Self {
        CommandReader {
            fd,
            partial: String::new(),
        }
    }
}

/// Run one command line.
pub fn run_command(line: &str, session: &mut Session) -> Result<ReaderStatus> {
    match line.trim() {
        "" | "dump" => session.dump().context("Failed to write report")?,
        "version" => writeln!(session.output(), "{}", env!("CARGO_PKG_VERSION"))?,
        "help" => writeln!(session.output(), "{}", HELP)?,
        "quit" => return Ok(ReaderStatus::Quit),
        other => writeln!(session.output(), "Unknown command '{}'. Try: {}", other, HELP)?,
    }
    session.output().flush()?;
    Ok(ReaderStatus::Continue)
}

impl PolledReader for CommandReader {
    fn name(&self) -> &str {
        "command"
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn handle_ready(&mut self, session: &mut Session) -> Result<ReaderStatus> {
        let mut buf = [0u8; 256];
        let n = match nix::unistd::read(self.fd, &mut buf) {
            Ok(n) => n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(ReaderStatus::Continue),
            Err(e) => return Err(e).context("Failed to read commands"),
        };
        if n == 0 {
            writeln!(session.output())?;
            return Ok(ReaderStatus::Quit);
        }
        self.partial.push_str(&String::from_utf8_lossy(&buf[..n]));
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            if run_command(&line, session)? == ReaderStatus::Quit {
                return Ok(ReaderStatus::Quit);
            }
        }
        Ok(ReaderStatus::Continue)
    }
}
