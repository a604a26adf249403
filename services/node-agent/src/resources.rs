//! Host resource sampling.
//!
//! CPU and network figures are rates, so they are computed from the delta
//! between two readings; the first sample after startup reports 0 for both.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use kiln_protocol::NodeStats;

/// Cumulative CPU jiffies from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

pub struct HostSampler {
    data_dir: PathBuf,
    prev_cpu: Option<CpuTimes>,
    prev_net: Option<(u64, Instant)>,
}

impl HostSampler {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            prev_cpu: None,
            prev_net: None,
        }
    }

    /// Take one reading.
    pub fn sample(&mut self) -> NodeStats {
        let cpu_pct = match read_cpu_times() {
            Some(now) => {
                let pct = self.prev_cpu.map(|prev| cpu_usage(prev, now)).unwrap_or(0.0);
                self.prev_cpu = Some(now);
                pct
            }
            None => 0.0,
        };

        let network_rate = match read_net_bytes() {
            Some(bytes) => {
                let at = Instant::now();
                let rate = self
                    .prev_net
                    .map(|(prev, prev_at)| {
                        let secs = at.duration_since(prev_at).as_secs_f64();
                        if secs > 0.0 {
                            bytes.saturating_sub(prev) as f64 / secs
                        } else {
                            0.0
                        }
                    })
                    .unwrap_or(0.0);
                self.prev_net = Some((bytes, at));
                rate
            }
            None => 0.0,
        };

        let (total_mem, available_mem) = get_memory_info();
        let ram_pct = used_pct(total_mem, available_mem);

        let disk_pct = disk_usage(&self.data_dir)
            .map(|(total, available)| used_pct(total, available))
            .unwrap_or(0.0);

        NodeStats {
            cpu_pct,
            ram_pct,
            disk_pct,
            network_rate,
            observed_at: Some(Utc::now()),
        }
    }
}

fn used_pct(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(available);
    (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

fn cpu_usage(prev: CpuTimes, now: CpuTimes) -> f64 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let busy = now.busy.saturating_sub(prev.busy);
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Parse the aggregate `cpu` line. Idle time counts idle and iowait.
pub fn parse_cpu_line(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse().unwrap_or(0))
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal; guest time is already
    // included in user/nice.
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Sum of received and transmitted bytes over all non-loopback interfaces.
pub fn parse_net_dev(content: &str) -> u64 {
    content
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (iface, rest) = line.split_once(':')?;
            if iface.trim() == "lo" {
                return None;
            }
            let fields: Vec<u64> = rest
                .split_whitespace()
                .map(|v| v.parse().unwrap_or(0))
                .collect();
            // rx_bytes is field 0, tx_bytes is field 8.
            Some(fields.first().copied().unwrap_or(0) + fields.get(8).copied().unwrap_or(0))
        })
        .sum()
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    parse_cpu_line(&std::fs::read_to_string("/proc/stat").ok()?)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<CpuTimes> {
    None
}

#[cfg(target_os = "linux")]
fn read_net_bytes() -> Option<u64> {
    Some(parse_net_dev(&std::fs::read_to_string("/proc/net/dev").ok()?))
}

#[cfg(not(target_os = "linux"))]
fn read_net_bytes() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        return parse_meminfo(&meminfo);
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let avail_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };

    if page_size > 0 && total_pages > 0 {
        let total = (page_size * total_pages) as u64;
        let avail = if avail_pages > 0 {
            (page_size * avail_pages) as u64
        } else {
            total
        };
        return (total, avail);
    }

    (0, 0)
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (u64, u64) {
    (0, 0)
}

/// Parse `/proc/meminfo` into (total, available) bytes.
pub fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut total: u64 = 0;
    let mut available: u64 = 0;
    let mut free: u64 = 0;
    let mut buffers: u64 = 0;
    let mut cached: u64 = 0;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            const KB_TO_BYTES: u64 = 1024;
            let value: u64 = parts[1].parse().unwrap_or(0) * KB_TO_BYTES;
            match parts[0] {
                "MemTotal:" => total = value,
                "MemAvailable:" => available = value,
                "MemFree:" => free = value,
                "Buffers:" => buffers = value,
                "Cached:" => cached = value,
                _ => {}
            }
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}

/// (total, available) bytes of the filesystem holding `path`.
#[cfg(unix)]
fn disk_usage(path: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let block = stat.f_frsize as u64;
    Some((stat.f_blocks as u64 * block, stat.f_bavail as u64 * block))
}

#[cfg(not(unix))]
fn disk_usage(_path: &Path) -> Option<(u64, u64)> {
    None
}
