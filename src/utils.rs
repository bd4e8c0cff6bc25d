use std::ffi::CStr;
use std::fs;

use anyhow::{bail, Context, Result};
use regex::Regex;

pub const CPU_ONLINE_PATH: &str = "/sys/devices/system/cpu/online";

/// Parse a kernel cpu list such as `0-3,6,8-9`.
pub fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    let cpus_re = Regex::new(r"^(\d+)(?:-(\d+))?$").unwrap();
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        let Some(cap) = cpus_re.captures(part.trim()) else {
            bail!("Invalid cpu list entry '{}'", part);
        };
        let start: u32 = cap[1].parse()?;
        let end: u32 = match cap.get(2) {
            Some(end) => end.as_str().parse()?,
            None => start,
        };
        if end < start {
            bail!("Invalid cpu range '{}'", part);
        }
        cpus.extend(start..=end);
    }
    Ok(cpus)
}

pub fn online_cpus() -> Result<Vec<u32>> {
    let buf = fs::read_to_string(CPU_ONLINE_PATH)
        .with_context(|| format!("Failed to read {}", CPU_ONLINE_PATH))?;
    let cpus = parse_cpu_list(&buf)?;
    if cpus.is_empty() {
        bail!("No online cpus listed in {}", CPU_ONLINE_PATH);
    }
    Ok(cpus)
}

/// Task name out of a fixed size, nul padded kernel buffer.
pub fn comm_from_bytes(comm: &[u8]) -> String {
    match CStr::from_bytes_until_nul(comm) {
        Ok(cstr) => cstr.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(comm).into_owned(),
    }
}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}
