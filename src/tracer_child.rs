//! The tracing subprocess feeding the line protocol reader.
//!
//! [`spawn_tracer`] runs `<tracer...> <script> <min_delay> <max_interruptible> <pid>`
//! with stdout on a nonblocking pipe. On drop the child is asked to exit
//! with `SIGTERM`, woken with `SIGCONT` in case it was stopped, and reaped.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// Arguments the tracing script expects after its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerArgs {
    /// Nanoseconds
    pub min_delay: u64,
    /// Nanoseconds
    pub max_interruptible_delay: u64,
    /// 0 traces every process
    pub pid: u32,
}

impl TracerArgs {
    fn to_args(self) -> [String; 3] {
        [
            self.min_delay.to_string(),
            self.max_interruptible_delay.to_string(),
            self.pid.to_string(),
        ]
    }
}

pub struct TracerChild {
    child: Child,
    stdout: ChildStdout,
    reaped: bool,
}

impl TracerChild {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn stdout(&mut self) -> &mut ChildStdout {
        &mut self.stdout
    }

    /// Stop the child and wait for it. Safe to call more than once.
    pub fn terminate(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Ok(None);
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        for sig in [Signal::SIGTERM, Signal::SIGCONT] {
            match kill(pid, sig) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to send {} to tracer", sig))
                }
            }
        }
        loop {
            match waitpid(pid, None) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    self.reaped = true;
                    return Ok(Some(status));
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    self.reaped = true;
                    return Ok(None);
                }
                Err(e) => return Err(e).context("Failed to wait for tracer"),
            }
        }
    }
}

impl AsRawFd for TracerChild {
    fn as_raw_fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }
}

impl Drop for TracerChild {
    fn drop(&mut self) {
        match self.terminate() {
            Ok(Some(status)) => tracing::debug!("Tracer exited: {:?}", status),
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to stop tracer: {:#}", e),
        }
    }
}

/// Resolve a command name to its full path by searching PATH.
fn resolve_executable(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);

    if name.contains('/') {
        let metadata =
            std::fs::metadata(path).with_context(|| format!("Tracer not found: {}", name))?;
        if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
            bail!("'{}' is not an executable file", name);
        }
        return Ok(path.to_path_buf());
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if let Ok(metadata) = std::fs::metadata(&candidate) {
                if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                    return Ok(candidate);
                }
            }
        }
    }

    bail!(
        "Tracer '{}' not found in PATH. Install it or pass the full path with --tracer.",
        name
    );
}

fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Start the tracer. `tracer` is the program followed by its leading
/// arguments.
pub fn spawn_tracer(tracer: &[String], script: &Path, args: TracerArgs) -> Result<TracerChild> {
    let Some((program, leading)) = tracer.split_first() else {
        bail!("No tracer command specified");
    };
    let resolved = resolve_executable(program)?;
    if !script.exists() {
        bail!("Tracing script {} not found", script.display());
    }

    let mut command = Command::new(&resolved);
    command
        .args(leading)
        .arg(script)
        .args(args.to_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    // Termination signals may be blocked for the signalfd and lattop may
    // run SCHED_FIFO. The tracer starts with an empty mask and the normal
    // policy.
    unsafe {
        command.pre_exec(|| {
            let mut empty: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty);
            if libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
            let normal = libc::sched_param { sched_priority: 0 };
            if libc::sched_setscheduler(0, libc::SCHED_OTHER, &normal) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to start tracer {}", resolved.display()))?;
    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        bail!("Tracer stdout was not captured");
    };
    let tracer = TracerChild {
        child,
        stdout,
        reaped: false,
    };
    set_nonblocking(&tracer.stdout).context("Failed to make tracer pipe nonblocking")?;
    tracing::info!(
        "Started tracer {} {} (pid {})",
        resolved.display(),
        script.display(),
        tracer.pid()
    );
    Ok(tracer)
}
