//! Metric records and the per-cycle batch shape.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::counters::Counter;

/// Category of monitored hardware.
///
/// Each class has its own collector slot and its own dimension-label layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceClass {
    #[default]
    Gpu,
    Switch,
    Link,
    Cpu,
    CpuCore,
}

impl DeviceClass {
    /// All classes, in pipeline order.
    pub const ALL: [DeviceClass; 5] = [
        DeviceClass::Gpu,
        DeviceClass::Switch,
        DeviceClass::Link,
        DeviceClass::Cpu,
        DeviceClass::CpuCore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Gpu => "gpu",
            DeviceClass::Switch => "switch",
            DeviceClass::Link => "link",
            DeviceClass::Cpu => "cpu",
            DeviceClass::CpuCore => "cpu core",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra label set. Iterates in key order.
pub type Labels = BTreeMap<String, String>;

/// MIG partition a GPU record belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigInstance {
    pub profile: String,
    pub instance_id: String,
}

/// A single observation of one counter on one device.
///
/// `index` is the primary dimension of every class (GPU index, switch id,
/// link id, CPU id, core id). `device` is the GPU device name for GPUs and
/// the owning device for links (switch) and CPU cores (CPU).
#[derive(Debug, Clone)]
pub struct Metric {
    pub counter: Arc<Counter>,
    /// Sample value, kept exactly as the collector produced it.
    pub value: String,
    pub index: String,
    pub uuid: String,
    /// Label key used for `uuid` (`uuid` or legacy `UUID`).
    pub uuid_key: &'static str,
    pub device: String,
    pub model_name: String,
    pub mig: Option<MigInstance>,
    pub hostname: Option<String>,
    /// Labels attached by the collector.
    pub labels: Labels,
    /// Labels attached by transforms.
    pub attributes: Labels,
}

impl Metric {
    pub fn new(counter: Arc<Counter>, index: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            counter,
            value: value.into(),
            index: index.into(),
            uuid: String::new(),
            uuid_key: "uuid",
            device: String::new(),
            model_name: String::new(),
            mig: None,
            hostname: None,
            labels: Labels::new(),
            attributes: Labels::new(),
        }
    }

    pub fn with_uuid(mut self, key: &'static str, uuid: impl Into<String>) -> Self {
        self.uuid_key = key;
        self.uuid = uuid.into();
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_mig(mut self, profile: impl Into<String>, instance_id: impl Into<String>) -> Self {
        self.mig = Some(MigInstance {
            profile: profile.into(),
            instance_id: instance_id.into(),
        });
        self
    }

    pub fn with_hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Records of one collector call, one inner vector per device.
pub type Batch = Vec<Vec<Metric>>;

/// Static description of one enumerated device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: u32,
    pub uuid: String,
    pub model_name: String,
}

/// What a collector knows about the hardware it samples.
///
/// Passed to transforms alongside the GPU batch.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub class: DeviceClass,
    pub devices: Vec<DeviceInfo>,
}

impl SystemInfo {
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}
