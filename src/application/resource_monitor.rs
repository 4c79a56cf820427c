//! `ResourceMonitor`: periodic CPU/memory/disk sampling and the admission
//! predicate built on top of it.
//!
//! CPU busy-percent comes from the delta between two `/proc/stat` reads;
//! memory from `/proc/meminfo`'s `MemAvailable`; disk from
//! `nix::sys::statvfs` over the configured workspace directory, the same
//! call `rust-lang-crater`'s `DiskUsage::fetch` makes. None of this is
//! `async`: sampling is a handful of synchronous reads, and the port itself
//! is defined as sync so the admission check never awaits.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::models::{AdmissionThresholds, ResourceSample};
use crate::domain::ports::ResourceMonitor as ResourceMonitorPort;

const BROADCAST_CAPACITY: usize = 16;

struct CpuJiffies {
    idle: u64,
    total: u64,
}

/// Samples host resource usage on a timer and exposes the latest sample plus
/// a broadcast channel of every sample taken, consumed by the dispatcher's
/// heartbeat loop.
pub struct LinuxResourceMonitor {
    workspace_dir: PathBuf,
    thresholds: AdmissionThresholds,
    latest: RwLock<ResourceSample>,
    previous_cpu: Mutex<Option<CpuJiffies>>,
    sender: broadcast::Sender<ResourceSample>,
    fallback_warned: AtomicBool,
}

impl LinuxResourceMonitor {
    #[must_use]
    pub fn new(workspace_dir: PathBuf, thresholds: AdmissionThresholds) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let monitor = Self {
            workspace_dir,
            thresholds,
            latest: RwLock::new(ResourceSample::default()),
            previous_cpu: Mutex::new(None),
            sender,
            fallback_warned: AtomicBool::new(false),
        };
        monitor.sample_once();
        monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceSample> {
        self.sender.subscribe()
    }

    /// Runs `sample_once` every `interval` until `shutdown` is cancelled.
    /// Meant to be spawned once at startup.
    pub async fn run(&self, interval: Duration, shutdown: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sample_once(),
                () = shutdown.cancelled() => return,
            }
        }
    }

    pub fn sample_once(&self) {
        let sample = self.read_sample();
        *self.latest.write().unwrap_or_else(std::sync::PoisonError::into_inner) = sample;
        let _ = self.sender.send(sample);
    }

    fn read_sample(&self) -> ResourceSample {
        #[cfg(target_os = "linux")]
        {
            let cpu_percent = self.read_cpu_percent().unwrap_or_else(|err| {
                self.warn_fallback_once(&format!("failed to read /proc/stat: {err}"));
                0.0
            });
            let (memory_used_bytes, memory_total_bytes) = read_meminfo().unwrap_or_else(|err| {
                self.warn_fallback_once(&format!("failed to read /proc/meminfo: {err}"));
                (0, 0)
            });
            let (disk_used_bytes, disk_total_bytes) = read_disk_usage(&self.workspace_dir).unwrap_or_else(|err| {
                self.warn_fallback_once(&format!("failed to statvfs {}: {err}", self.workspace_dir.display()));
                (0, 0)
            });
            ResourceSample { cpu_percent, memory_used_bytes, memory_total_bytes, disk_used_bytes, disk_total_bytes }
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.warn_fallback_once("resource sampling is only implemented for linux; reporting zero usage");
            ResourceSample::default()
        }
    }

    fn warn_fallback_once(&self, message: &str) {
        if self.fallback_warned.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(message, "resource sampling falling back to best-effort zero usage");
    }

    #[cfg(target_os = "linux")]
    fn read_cpu_percent(&self) -> std::io::Result<f64> {
        let current = read_cpu_jiffies()?;
        let mut previous = self.previous_cpu.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let percent = match previous.as_ref() {
            Some(prev) => {
                let total_delta = current.total.saturating_sub(prev.total);
                let idle_delta = current.idle.saturating_sub(prev.idle);
                if total_delta == 0 {
                    0.0
                } else {
                    (1.0 - idle_delta as f64 / total_delta as f64) * 100.0
                }
            }
            None => 0.0,
        };
        *previous = Some(current);
        Ok(percent)
    }
}

impl ResourceMonitorPort for LinuxResourceMonitor {
    fn current(&self) -> ResourceSample {
        *self.latest.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn can_accept_work(&self) -> bool {
        let sample = self.current();
        sample.cpu_percent < self.thresholds.cpu_percent
            && sample.memory_percent() < self.thresholds.memory_percent
            && sample.disk_percent() < self.thresholds.disk_percent
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_jiffies() -> std::io::Result<CpuJiffies> {
    let contents = std::fs::read_to_string("/proc/stat")?;
    let line = contents
        .lines()
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "/proc/stat was empty"))?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();

    if fields.len() < 4 {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "unexpected /proc/stat format"));
    }

    // user nice system idle iowait irq softirq [steal [guest [guest_nice]]]
    // Only the first 8 fields count towards the busy/idle total; guest and
    // guest_nice are already accounted for inside user/nice on modern
    // kernels and would double-count if summed again.
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().take(8).sum();
    Ok(CpuJiffies { idle, total })
}

#[cfg(target_os = "linux")]
fn read_meminfo() -> std::io::Result<(u64, u64)> {
    let contents = std::fs::read_to_string("/proc/meminfo")?;
    let mut total_kb = None;
    let mut available_kb = None;

    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_kb(rest);
        }
    }

    let total_kb = total_kb
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "MemTotal missing from /proc/meminfo"))?;
    let available_kb = available_kb
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "MemAvailable missing from /proc/meminfo"))?;

    let total = total_kb * 1024;
    let used = total.saturating_sub(available_kb * 1024);
    Ok((used, total))
}

#[cfg(target_os = "linux")]
fn parse_kb(field: &str) -> Option<u64> {
    field.trim().trim_end_matches(" kB").trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn read_disk_usage(path: &Path) -> std::io::Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(std::io::Error::from)?;
    let block_size = stat.fragment_size().max(1);
    let total = stat.blocks() * block_size;
    let available = stat.blocks_available() * block_size;
    Ok((total.saturating_sub(available), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> AdmissionThresholds {
        AdmissionThresholds { cpu_percent: 90.0, memory_percent: 90.0, disk_percent: 90.0 }
    }

    #[test]
    fn can_accept_work_when_under_every_threshold() {
        let monitor = LinuxResourceMonitor::new(PathBuf::from("/tmp"), thresholds());
        *monitor.latest.write().unwrap() = ResourceSample {
            cpu_percent: 10.0,
            memory_used_bytes: 10,
            memory_total_bytes: 100,
            disk_used_bytes: 10,
            disk_total_bytes: 100,
        };
        assert!(monitor.can_accept_work());
    }

    #[test]
    fn rejects_work_when_any_threshold_is_exceeded() {
        let monitor = LinuxResourceMonitor::new(PathBuf::from("/tmp"), thresholds());
        *monitor.latest.write().unwrap() = ResourceSample {
            cpu_percent: 95.0,
            memory_used_bytes: 10,
            memory_total_bytes: 100,
            disk_used_bytes: 10,
            disk_total_bytes: 100,
        };
        assert!(!monitor.can_accept_work());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn reads_real_proc_stat() {
        let jiffies = read_cpu_jiffies().unwrap();
        assert!(jiffies.total > 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn reads_real_meminfo() {
        let (used, total) = read_meminfo().unwrap();
        assert!(total > 0);
        assert!(used <= total);
    }
}
