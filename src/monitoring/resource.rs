//! Resource Usage Monitoring
//!
//! Samples CPU and memory of the engine process together with the unit
//! processes it spawned, for the end-of-run report.

use std::time::{Duration, Instant};

use log::{debug, warn};
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: Instant,
    /// CPU usage percentage summed over the process tree (0-100 per core)
    pub cpu_usage: f32,
    /// Resident memory of the process tree in megabytes
    pub memory_mb: u64,
    /// Number of live child processes
    pub children: usize,
}

/// Monitors the current process and its direct children.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use stepflow::monitoring::ResourceMonitor;
///
/// # async fn demo() {
/// let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
/// let handle = ResourceMonitor::new().spawn(Duration::from_millis(500), stop_rx);
/// // ... run a workflow ...
/// stop_tx.send(true).ok();
/// let monitor = handle.await.unwrap();
/// println!("{}", monitor.get_summary());
/// # }
/// ```
pub struct ResourceMonitor {
    system: System,
    process_id: Option<Pid>,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let process_id = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Resource monitoring disabled: {}", e);
                None
            }
        };

        Self {
            system: System::new(),
            process_id,
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a sample.
    ///
    /// The first call only primes CPU counters. Later calls are
    /// rate-limited by `min_interval`.
    pub fn sample(&mut self) {
        let Some(pid) = self.process_id else {
            return;
        };
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        let Some(own) = self.system.process(pid) else {
            return;
        };

        let mut cpu = own.cpu_usage();
        let mut memory = own.memory();
        let mut children = 0;
        for process in self.system.processes().values() {
            if process.parent() == Some(pid) {
                cpu += process.cpu_usage();
                memory += process.memory();
                children += 1;
            }
        }

        self.samples.push(ResourceSample {
            timestamp: now,
            cpu_usage: cpu,
            memory_mb: memory / (1024 * 1024),
            children,
        });
    }

    /// Samples every `interval` on a tokio task until `stop` turns true,
    /// then hands the monitor back.
    pub fn spawn(mut self, interval: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<Self> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sample(),
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Resource monitor stopped after {} samples", self.samples.len());
            self
        })
    }

    /// Human-readable summary of resource usage.
    pub fn get_summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }

        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {} MB\n  Peak Child Processes: {}\n  Samples: {}",
            self.average_cpu(),
            self.peak_memory_mb(),
            self.peak_children(),
            self.samples.len()
        )
    }

    pub fn get_samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    pub fn peak_children(&self) -> usize {
        self.samples.iter().map(|s| s.children).max().unwrap_or(0)
    }

    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
