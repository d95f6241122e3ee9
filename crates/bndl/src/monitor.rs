//! 📈 Memory Monitor: every so often, look at how much RAM we're sitting on and
//! say something if it's too much.
//!
//! Resident memory comes from `sysinfo`, already in bytes, whatever the kernel's page
//! size is. If the platform won't say, the monitor only reports the in-flight count.

use std::time::Duration;

use serde::Deserialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::governor::Governor;

/// 🔧 The `[monitor]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MonitorConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    30
}

fn default_memory_threshold_mb() -> u64 {
    512
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            memory_threshold_mb: default_memory_threshold_mb(),
        }
    }
}

/// 🧮 Samples this process's resident set size. Keeps one [`System`] around so each
/// tick only refreshes our own process, not the whole process table.
#[derive(Debug)]
pub struct ResidentMemory {
    system: System,
    pid: Option<Pid>,
}

impl ResidentMemory {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// 🧮 Resident bytes, if the platform will tell us.
    pub fn sample_bytes(&mut self) -> Option<u64> {
        let the_pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[the_pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(the_pid).map(|process| process.memory())
    }

    pub fn sample_mb(&mut self) -> Option<u64> {
        self.sample_bytes().map(|bytes| bytes / (1024 * 1024))
    }
}

impl Default for ResidentMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// 📈 A running monitor. Drop it or call [`MemoryMonitor::stop`] to end it.
#[derive(Debug)]
pub struct MemoryMonitor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MemoryMonitor {
    pub fn start(config: &MonitorConfig, governor: Governor) -> Self {
        let (the_stop, mut the_stopped) = watch::channel(false);
        let the_interval = Duration::from_secs(config.interval_secs.max(1));
        let the_threshold_mb = config.memory_threshold_mb;

        let the_handle = tokio::spawn(async move {
            let mut the_ticker = tokio::time::interval(the_interval);
            let mut the_memory = ResidentMemory::new();
            // -- the first tick fires immediately; skip it so startup isn't reported as a sample
            the_ticker.tick().await;
            debug!(interval_secs = the_interval.as_secs(), "📈 memory monitoring started");
            loop {
                tokio::select! {
                    _ = the_ticker.tick() => check(&mut the_memory, the_threshold_mb, &governor),
                    _ = the_stopped.changed() => break,
                }
            }
            debug!("📈 memory monitoring stopped");
        });

        Self {
            stop: the_stop,
            handle: the_handle,
        }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

fn check(memory: &mut ResidentMemory, threshold_mb: u64, governor: &Governor) {
    let the_in_flight = governor.in_flight();
    match memory.sample_mb() {
        Some(resident_mb) if resident_mb > threshold_mb => warn!(
            resident_mb,
            threshold_mb,
            in_flight = the_in_flight,
            "📈 high memory usage"
        ),
        Some(resident_mb) => debug!(resident_mb, in_flight = the_in_flight, "📈 memory usage"),
        None => debug!(in_flight = the_in_flight, "📈 memory usage unavailable on this platform"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::AdmissionConfig;

    #[test]
    fn the_one_where_we_can_see_our_own_footprint() {
        let mut the_memory = ResidentMemory::new();
        // -- touch 32 MiB so it is resident, then make sure the reading noticed
        let the_ballast = vec![1u8; 32 * 1024 * 1024];
        let the_bytes = the_memory
            .sample_bytes()
            .expect("💀 the test host should report its own memory");
        assert!(
            the_bytes >= 32 * 1024 * 1024,
            "resident {the_bytes} bytes is less than the ballast alone"
        );
        assert_eq!(the_ballast.iter().map(|&b| b as usize).sum::<usize>(), the_ballast.len());
        assert!(the_memory.sample_mb().is_some_and(|mb| mb >= 32));
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_monitor_stops_when_asked() {
        let the_monitor = MemoryMonitor::start(
            &MonitorConfig {
                interval_secs: 1,
                ..MonitorConfig::default()
            },
            Governor::new(&AdmissionConfig::default()),
        );
        tokio::time::sleep(Duration::from_secs(3)).await;

        tokio::time::timeout(Duration::from_secs(5), the_monitor.stop())
            .await
            .expect("💀 the monitor ignored its stop signal");
    }
}
