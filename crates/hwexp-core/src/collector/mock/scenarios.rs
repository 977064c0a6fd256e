//! Pre-built mock hardware for tests and demo runs.

use std::sync::Arc;

use super::collector::MockCollector;
use super::filesystem::MockFs;
use crate::config::Config;
use crate::counters::{Counter, PromType};
use crate::error::CollectError;
use crate::metric::{Batch, DeviceClass, DeviceInfo, Metric, SystemInfo};

const SYNTHETIC_GPU_MODEL: &str = "NVIDIA A100-SXM4-40GB";

/// Device count of the synthetic system per class.
fn synthetic_device_count(class: DeviceClass) -> u32 {
    match class {
        DeviceClass::Gpu => 2,
        DeviceClass::Switch => 1,
        DeviceClass::Link => 4,
        DeviceClass::Cpu => 1,
        DeviceClass::CpuCore => 4,
    }
}

fn synthetic_uuid(index: u32) -> String {
    format!("GPU-8f6c0a3e-5b1d-4c2e-9a7f-{index:012}")
}

fn synthetic_value(counter: &Counter, call: u64, device: u64, field: u64) -> String {
    match counter.prom_type {
        PromType::Counter => ((call + 1) * (field + 1) * (device + 1) * 1000).to_string(),
        _ => ((call * 7 + device * 13 + field * 3) % 100).to_string(),
    }
}

impl MockCollector {
    /// A collector for `class` on the synthetic system: 2 GPUs, 1 switch
    /// with 4 links, 1 CPU with 4 cores.
    ///
    /// Values move with every call. Counters of type `label` are skipped.
    pub fn synthetic(
        counters: &[Arc<Counter>],
        config: &Config,
        class: DeviceClass,
    ) -> Result<Self, CollectError> {
        let counters: Vec<Arc<Counter>> = counters
            .iter()
            .filter(|c| c.prom_type != PromType::Label)
            .cloned()
            .collect();
        if counters.is_empty() {
            return Err(CollectError::NoCounters(class));
        }

        let count = synthetic_device_count(class);
        let hostname = (!config.no_hostname).then(|| "mock-node".to_string());
        let uuid_key = config.uuid_label();

        let devices = (0..count)
            .map(|index| DeviceInfo {
                index,
                uuid: if class == DeviceClass::Gpu {
                    synthetic_uuid(index)
                } else {
                    String::new()
                },
                model_name: if class == DeviceClass::Gpu {
                    SYNTHETIC_GPU_MODEL.to_string()
                } else {
                    String::new()
                },
            })
            .collect();
        let system_info = SystemInfo { class, devices };

        let script = move |call: u64| -> Result<Batch, CollectError> {
            let batch = (0..count)
                .map(|index| {
                    counters
                        .iter()
                        .enumerate()
                        .map(|(field, counter)| {
                            let value = synthetic_value(counter, call, index as u64, field as u64);
                            let metric = Metric::new(counter.clone(), index.to_string(), value)
                                .with_hostname(hostname.clone());
                            match class {
                                DeviceClass::Gpu => metric
                                    .with_uuid(uuid_key, synthetic_uuid(index))
                                    .with_device(format!("nvidia{index}"))
                                    .with_model_name(SYNTHETIC_GPU_MODEL),
                                DeviceClass::Link | DeviceClass::CpuCore => metric.with_device("0"),
                                DeviceClass::Switch | DeviceClass::Cpu => metric,
                            }
                        })
                        .collect()
                })
                .collect();
            Ok(batch)
        };

        Ok(Self::from_fn(class, script).with_system_info(system_info))
    }
}

impl MockFs {
    /// A 4-core machine split over two sockets.
    pub fn typical_cpu_system() -> Self {
        let mut fs = Self::new();

        fs.add_file("/proc/sys/kernel/hostname", "gpu-node-01\n");
        fs.add_file(
            "/proc/stat",
            "\
cpu  4000 400 2000 12000 800 200 400 0 0 0
cpu0 1000 100 500 3000 200 50 100 0 0 0
cpu1 1000 100 500 3000 200 50 100 0 0 0
cpu2 1000 100 500 3000 200 50 100 0 0 0
cpu3 1000 100 500 3000 200 50 100 0 0 0
intr 1000000 50 0 0 0 0 0 0 0 1 0 0 0 100 0 0 1000
ctxt 500000
btime 1700000000
processes 12345
procs_running 2
procs_blocked 0
",
        );

        for (cpu, package) in [(0, 0), (1, 0), (2, 1), (3, 1)] {
            fs.add_file(
                format!("/sys/devices/system/cpu/cpu{cpu}/topology/physical_package_id"),
                format!("{package}\n"),
            );
        }

        fs
    }
}
