//! CPU and CPU-core collector backed by `/proc/stat`.
//!
//! Utilization counters are percentages of the jiffies elapsed since the
//! previous sample (since boot for the first one). Cores are attributed to
//! their socket through `/sys/devices/system/cpu/cpuN/topology/physical_package_id`.
//!
//! Served counters:
//! - `DCGM_FI_DEV_CPU_UTIL_TOTAL`
//! - `DCGM_FI_DEV_CPU_UTIL_USER`
//! - `DCGM_FI_DEV_CPU_UTIL_NICE`
//! - `DCGM_FI_DEV_CPU_UTIL_SYS`
//! - `DCGM_FI_DEV_CPU_UTIL_IRQ`

pub mod parser;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::collector::traits::FileSystem;
use crate::collector::{Cleanup, Collector, CollectorFactory};
use crate::config::Config;
use crate::counters::Counter;
use crate::error::CollectError;
use crate::metric::{Batch, DeviceClass, DeviceInfo, Metric, SystemInfo};
use parser::{CpuTimes, parse_cpu_stat, parse_sysfs_u32};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpuField {
    Total,
    User,
    Nice,
    Sys,
    Irq,
}

impl CpuField {
    fn from_field_name(name: &str) -> Option<Self> {
        match name {
            "DCGM_FI_DEV_CPU_UTIL_TOTAL" => Some(CpuField::Total),
            "DCGM_FI_DEV_CPU_UTIL_USER" => Some(CpuField::User),
            "DCGM_FI_DEV_CPU_UTIL_NICE" => Some(CpuField::Nice),
            "DCGM_FI_DEV_CPU_UTIL_SYS" => Some(CpuField::Sys),
            "DCGM_FI_DEV_CPU_UTIL_IRQ" => Some(CpuField::Irq),
            _ => None,
        }
    }

    fn percent(&self, delta: &CpuTimes) -> f64 {
        let total = delta.total();
        if total == 0 {
            return 0.0;
        }
        let part = match self {
            CpuField::Total => delta.busy(),
            CpuField::User => delta.user,
            CpuField::Nice => delta.nice,
            CpuField::Sys => delta.system,
            CpuField::Irq => delta.irq + delta.softirq,
        };
        part as f64 * 100.0 / total as f64
    }
}

/// Reads the kernel hostname unless the config suppresses the label.
pub(crate) fn read_hostname<F: FileSystem>(fs: &F, config: &Config) -> Option<String> {
    if config.no_hostname {
        return None;
    }
    let path = config.proc_path.join("sys/kernel/hostname");
    match fs.read_to_string(&path) {
        Ok(content) => Some(content.trim().to_string()).filter(|h| !h.is_empty()),
        Err(e) => {
            debug!(error = %e, "hostname unavailable");
            None
        }
    }
}

/// Collector for [`DeviceClass::Cpu`] (one device per socket) or
/// [`DeviceClass::CpuCore`] (one device per logical core).
pub struct ProcStatCollector<F: FileSystem> {
    fs: F,
    stat_path: PathBuf,
    class: DeviceClass,
    fields: Vec<(Arc<Counter>, CpuField)>,
    hostname: Option<String>,
    /// Logical core -> socket.
    packages: BTreeMap<u32, u32>,
    previous: HashMap<u32, CpuTimes>,
    system_info: SystemInfo,
}

impl<F: FileSystem> ProcStatCollector<F> {
    pub fn new(
        fs: F,
        counters: &[Arc<Counter>],
        config: &Config,
        class: DeviceClass,
    ) -> Result<Self, CollectError> {
        if !matches!(class, DeviceClass::Cpu | DeviceClass::CpuCore) {
            return Err(CollectError::Unsupported(class));
        }

        let fields: Vec<(Arc<Counter>, CpuField)> = counters
            .iter()
            .filter_map(|c| CpuField::from_field_name(&c.field_name).map(|f| (c.clone(), f)))
            .collect();
        if fields.is_empty() {
            return Err(CollectError::NoCounters(class));
        }

        let stat_path = config.proc_path.join("stat");
        let cpus = parse_cpu_stat(&read(&fs, &stat_path)?)?;

        let packages: BTreeMap<u32, u32> = cpus
            .iter()
            .filter_map(|c| c.cpu_id)
            .map(|id| {
                let path = config
                    .sys_path
                    .join(format!("devices/system/cpu/cpu{id}/topology/physical_package_id"));
                if !fs.exists(&path) {
                    return (id, 0);
                }
                let package = fs
                    .read_to_string(&path)
                    .ok()
                    .and_then(|s| parse_sysfs_u32(&s))
                    .unwrap_or_else(|| {
                        debug!(cpu = id, "unreadable physical_package_id, assuming socket 0");
                        0
                    });
                (id, package)
            })
            .collect();

        let indices: Vec<u32> = match class {
            DeviceClass::Cpu => {
                let mut sockets: Vec<u32> = packages.values().copied().collect();
                sockets.sort_unstable();
                sockets.dedup();
                if sockets.is_empty() { vec![0] } else { sockets }
            }
            _ => packages.keys().copied().collect(),
        };
        let system_info = SystemInfo {
            class,
            devices: indices
                .into_iter()
                .map(|index| DeviceInfo {
                    index,
                    ..DeviceInfo::default()
                })
                .collect(),
        };

        let hostname = read_hostname(&fs, config);

        Ok(Self {
            fs,
            stat_path,
            class,
            fields,
            hostname,
            packages,
            previous: HashMap::new(),
            system_info,
        })
    }

    /// Current readings keyed by device index, with the owning socket.
    fn sample(&self) -> Result<Vec<(u32, Option<u32>, CpuTimes)>, CollectError> {
        let cpus = parse_cpu_stat(&read(&self.fs, &self.stat_path)?)?;

        let samples = match self.class {
            DeviceClass::Cpu => {
                let mut sockets: BTreeMap<u32, CpuTimes> = BTreeMap::new();
                for cpu in &cpus {
                    if let Some(id) = cpu.cpu_id {
                        let package = self.packages.get(&id).copied().unwrap_or(0);
                        sockets.entry(package).or_default().add(&cpu.times);
                    }
                }
                if sockets.is_empty() {
                    // Single-CPU kernels only report the aggregate line.
                    if let Some(total) = cpus.iter().find(|c| c.cpu_id.is_none()) {
                        sockets.insert(0, total.times);
                    }
                }
                sockets
                    .into_iter()
                    .map(|(socket, times)| (socket, None, times))
                    .collect()
            }
            _ => cpus
                .iter()
                .filter_map(|cpu| {
                    let id = cpu.cpu_id?;
                    let package = self.packages.get(&id).copied().unwrap_or(0);
                    Some((id, Some(package), cpu.times))
                })
                .collect(),
        };

        Ok(samples)
    }
}

fn read<F: FileSystem>(fs: &F, path: &Path) -> Result<String, CollectError> {
    fs.read_to_string(path).map_err(|source| CollectError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl<F: FileSystem> Collector for ProcStatCollector<F> {
    fn get_metrics(&mut self) -> Result<Batch, CollectError> {
        let samples = self.sample()?;
        let mut batch = Batch::with_capacity(samples.len());

        for (index, parent, times) in samples {
            let delta = match self.previous.insert(index, times) {
                Some(earlier) => times.since(&earlier),
                None => times,
            };

            let device_metrics = self
                .fields
                .iter()
                .map(|(counter, field)| {
                    let value = format!("{:.2}", field.percent(&delta));
                    let metric = Metric::new(counter.clone(), index.to_string(), value)
                        .with_hostname(self.hostname.clone());
                    match parent {
                        Some(socket) => metric.with_device(socket.to_string()),
                        None => metric,
                    }
                })
                .collect();
            batch.push(device_metrics);
        }

        Ok(batch)
    }

    fn system_info(&self) -> &SystemInfo {
        &self.system_info
    }
}

/// Factory serving the CPU classes from procfs; other classes are unsupported.
#[derive(Debug, Clone, Default)]
pub struct ProcfsCollectorFactory<F: FileSystem + Clone> {
    fs: F,
}

impl<F: FileSystem + Clone> ProcfsCollectorFactory<F> {
    pub fn new(fs: F) -> Self {
        Self { fs }
    }
}

impl<F: FileSystem + Clone + 'static> CollectorFactory for ProcfsCollectorFactory<F> {
    fn new_collector(
        &self,
        counters: &[Arc<Counter>],
        config: &Config,
        class: DeviceClass,
    ) -> Result<(Box<dyn Collector>, Cleanup), CollectError> {
        let collector = ProcStatCollector::new(self.fs.clone(), counters, config, class)?;
        info!(
            class = %class,
            devices = collector.system_info.device_count(),
            fields = collector.fields.len(),
            "procfs collector ready"
        );

        let cleanup = Cleanup::new(move || debug!(class = %class, "procfs collector released"));
        Ok((Box::new(collector), cleanup))
    }
}
