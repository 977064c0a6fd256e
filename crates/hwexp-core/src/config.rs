//! Runtime configuration shared by the pipeline and its collaborators.

use std::path::PathBuf;
use std::time::Duration;

/// Default counter list location.
pub const DEFAULT_COLLECTORS_FILE: &str = "/etc/hwexp/default-counters.csv";

/// Default kubelet pod-resources mapping location.
pub const DEFAULT_POD_RESOURCES_PATH: &str = "/var/lib/kubelet/pod-resources/devices.json";

/// Configuration for a pipeline run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the counter list (CSV: field, type, help).
    pub collectors_file: PathBuf,
    /// Period between two collection cycles.
    pub collect_interval: Duration,
    /// Enable Kubernetes pod enrichment of GPU metrics.
    pub kubernetes: bool,
    /// Device ownership mapping read by the pod mapper each cycle.
    pub pod_resources_path: PathBuf,
    /// Use the legacy label names (`UUID`, `pod_name`, ...).
    pub use_old_namespace: bool,
    /// Do not attach the `Hostname` label.
    pub no_hostname: bool,
    /// Root of the proc filesystem.
    pub proc_path: PathBuf,
    /// Root of the sys filesystem.
    pub sys_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collectors_file: PathBuf::from(DEFAULT_COLLECTORS_FILE),
            collect_interval: Duration::from_millis(30_000),
            kubernetes: false,
            pod_resources_path: PathBuf::from(DEFAULT_POD_RESOURCES_PATH),
            use_old_namespace: false,
            no_hostname: false,
            proc_path: PathBuf::from("/proc"),
            sys_path: PathBuf::from("/sys"),
        }
    }
}

impl Config {
    /// Label key used for the GPU UUID dimension.
    pub fn uuid_label(&self) -> &'static str {
        if self.use_old_namespace { "UUID" } else { "uuid" }
    }
}
