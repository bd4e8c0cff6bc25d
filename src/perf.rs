use std::ffi::CString;
use std::fs;
use std::io::{Error, ErrorKind};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, Ordering};

use anyhow::{bail, Context, Result};
use bitfield::bitfield;
use nix::errno::Errno;
use nix::{ioctl_none, ioctl_write_int_bad, ioctl_write_ptr_bad, request_code_none, request_code_write};

#[repr(C)]
pub union sample_un {
    pub sample_period: u64,
    pub sample_freq: u64,
}

#[repr(C)]
pub union wakeup_un {
    pub wakeup_events: u32,
    pub wakeup_watermark: u32,
}

#[repr(C)]
pub union bp_1_un {
    pub bp_addr: u64,
    pub config1: u64,
}

#[repr(C)]
pub union bp_2_un {
    pub bp_len: u64,
    pub config2: u64,
}

bitfield! {
    #[allow(non_camel_case_types)]
    pub struct perf_event_attr_flags(u64);
    impl Debug;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub inherit_stat, set_inherit_stat: 11, 11;
    pub enable_on_exec, set_enable_on_exec: 12, 12;
    pub task, set_task: 13, 13;
    pub watermark, set_watermark: 14, 14;
    pub precise_ip, set_precise_ip: 15, 16;
    pub __reserved_1, _: 17, 63;
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct perf_event_attr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample: sample_un,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: perf_event_attr_flags,
    pub wakeup: wakeup_un,
    pub bp_type: u32,
    pub bp_1: bp_1_un,
    pub bp_2: bp_2_un,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

/// Control page at the start of a perf mmap region. Only the fields up to
/// the data head and tail are described, the rest of the page is unused here.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct perf_event_mmap_page {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 928],
    pub data_head: u64,
    pub data_tail: u64,
}

pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_RECORD_SAMPLE: u32 = 9;

extern "C" {
    fn syscall(number: libc::c_long, ...) -> libc::c_long;
}

pub fn perf_event_open(
    hw_event: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<PerfEventFile, Error> {
    let fd = unsafe {
        syscall(
            libc::SYS_perf_event_open,
            hw_event as *const perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    } as i32;

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    Ok(PerfEventFile {
        fd: unsafe { OwnedFd::from_raw_fd(fd) },
        need_disable: false,
    })
}

const PERF_EVENT_MAGIC: u8 = b'$';
const PERF_EVENT_IOC_ENABLE: u8 = 0;
const PERF_EVENT_IOC_DISABLE: u8 = 1;
const PERF_EVENT_IOC_SET_OUTPUT: u8 = 5;
const PERF_EVENT_IOC_SET_FILTER: u8 = 6;
ioctl_none!(
    perf_event_ioc_enable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_ENABLE
);
ioctl_none!(
    perf_event_ioc_disable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_DISABLE
);
ioctl_write_int_bad!(
    perf_event_ioc_set_output,
    request_code_none!(PERF_EVENT_MAGIC, PERF_EVENT_IOC_SET_OUTPUT)
);
ioctl_write_ptr_bad!(
    perf_event_ioc_set_filter,
    request_code_write!(
        PERF_EVENT_MAGIC,
        PERF_EVENT_IOC_SET_FILTER,
        mem::size_of::<*const libc::c_char>()
    ),
    libc::c_char
);

const TRACEFS_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Numeric id of a tracepoint, from whichever tracefs mount is available.
pub fn tracepoint_id(category: &str, name: &str) -> Result<u64> {
    for root in TRACEFS_ROOTS {
        let path = Path::new(root)
            .join("events")
            .join(category)
            .join(name)
            .join("id");
        let buf = match fs::read_to_string(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        return buf
            .trim()
            .parse()
            .with_context(|| format!("Invalid tracepoint id in {}", path.display()));
    }
    bail!(
        "Tracepoint {}:{} not found, is tracefs mounted and the kernel built with latencytop support?",
        category,
        name
    );
}

#[derive(Debug)]
pub struct PerfEventFile {
    fd: OwnedFd,
    need_disable: bool,
}

impl PerfEventFile {
    pub fn enable(&mut self) -> Result<(), Error> {
        unsafe { perf_event_ioc_enable(self.fd.as_raw_fd()) }?;
        self.need_disable = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), Error> {
        self.need_disable = false;
        match unsafe { perf_event_ioc_disable(self.fd.as_raw_fd()) } {
            Ok(_) | Err(Errno::ENOTTY) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Send this event's records to the ring buffer mapped on `target`.
    pub fn set_output(&self, target: &PerfEventFile) -> Result<(), Error> {
        unsafe { perf_event_ioc_set_output(self.fd.as_raw_fd(), target.as_raw_fd()) }?;
        Ok(())
    }

    /// Install a kernel side tracepoint filter expression.
    pub fn set_filter(&self, filter: &str) -> Result<(), Error> {
        let filter = CString::new(filter).map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;
        unsafe { perf_event_ioc_set_filter(self.fd.as_raw_fd(), filter.as_ptr()) }?;
        Ok(())
    }

    pub fn set_nonblocking(&self) -> Result<(), Error> {
        let fd = self.fd.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for PerfEventFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for PerfEventFile {
    fn drop(&mut self) {
        if !self.need_disable {
            return;
        }
        if let Err(e) = self.disable() {
            tracing::warn!("Failed to disable perf event: {}", e);
        }
    }
}

/// One tracepoint event opened on every online cpu.
#[derive(Debug, Default)]
pub struct PerfOpenEvents {
    events: Vec<(u32, PerfEventFile)>,
}

impl PerfOpenEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_tracepoint(
        &mut self,
        tracepoint: u64,
        cpus: &[u32],
        wakeup_watermark: u32,
    ) -> Result<(), Error> {
        if cpus.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "No CPUs specified for event",
            ));
        }
        let mut attr: perf_event_attr = unsafe { mem::zeroed() };
        attr._type = PERF_TYPE_TRACEPOINT;
        attr.size = mem::size_of::<perf_event_attr>() as u32;
        attr.config = tracepoint;
        attr.sample.sample_period = 1;
        attr.sample_type = PERF_SAMPLE_RAW;
        attr.flags.set_disabled(1);
        attr.flags.set_watermark(1);
        attr.wakeup.wakeup_watermark = wakeup_watermark;

        for cpu in cpus {
            match perf_event_open(&attr, -1, *cpu as i32, -1, 0) {
                Ok(file) => {
                    file.set_nonblocking()?;
                    self.events.push((*cpu, file));
                }
                Err(err) => {
                    return Err(Error::new(
                        err.kind(),
                        format!("Failed to open tracepoint on cpu {}: {}", cpu, err),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The event whose ring buffer collects everything.
    pub fn leader(&self) -> Option<&PerfEventFile> {
        self.events.first().map(|(_, file)| file)
    }

    /// Route every other cpu's records into the leader's buffer.
    pub fn redirect_to_leader(&self) -> Result<(), Error> {
        let Some((_, leader)) = self.events.first() else {
            return Ok(());
        };
        for (cpu, file) in self.events.iter().skip(1) {
            file.set_output(leader).map_err(|e| {
                Error::new(
                    e.kind(),
                    format!("Failed to redirect cpu {} output: {}", cpu, e),
                )
            })?;
        }
        Ok(())
    }

    pub fn set_filter(&self, filter: &str) -> Result<(), Error> {
        for (_, file) in self.events.iter() {
            file.set_filter(filter)?;
        }
        Ok(())
    }

    pub fn enable(&mut self) -> Result<(), Error> {
        for (_, file) in self.events.iter_mut() {
            file.enable()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// A perf ring buffer: one control page followed by a power of two number
/// of data pages.
#[derive(Debug)]
pub struct PerfMmap {
    base: NonNull<u8>,
    len: usize,
    page_size: usize,
}

impl PerfMmap {
    pub fn new(file: &PerfEventFile, data_pages: usize, page_size: usize) -> Result<Self> {
        if !data_pages.is_power_of_two() {
            bail!("Perf data pages must be a power of two, got {}", data_pages);
        }
        let len = (data_pages + 1) * page_size;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::last_os_error()).context("Failed to mmap perf ring buffer");
        }
        let base = NonNull::new(addr as *mut u8).context("mmap returned a null mapping")?;
        Ok(PerfMmap {
            base,
            len,
            page_size,
        })
    }

    fn control(&self) -> *mut perf_event_mmap_page {
        self.base.as_ptr() as *mut perf_event_mmap_page
    }

    pub fn data_size(&self) -> usize {
        self.len - self.page_size
    }

    pub fn read_head(&self) -> u64 {
        let head = unsafe { ptr::read_volatile(ptr::addr_of!((*self.control()).data_head)) };
        fence(Ordering::Acquire);
        head
    }

    pub fn write_tail(&self, tail: u64) {
        fence(Ordering::SeqCst);
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.control()).data_tail), tail) };
    }

    /// The data area. The kernel only writes past our published tail, so the
    /// bytes between tail and head are stable while we hold them.
    pub fn data(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(self.page_size), self.data_size())
        }
    }
}

impl Drop for PerfMmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}
