//! Kubernetes enrichment: tags GPU records with the pod that owns the device.
//!
//! The ownership mapping is a JSON array maintained next to the kubelet:
//!
//! ```json
//! [
//!   {"device": "GPU-8f6c0a3e-...", "pod": "trainer-0", "namespace": "ml", "container": "main"},
//!   {"device": "1", "pod": "notebook", "namespace": "dev"}
//! ]
//! ```
//!
//! `device` matches either the GPU UUID or the GPU index. The file is re-read
//! every cycle so pod churn shows up without a restart.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::TransformError;
use crate::metric::{Batch, SystemInfo};
use crate::transform::Transform;

#[derive(Debug, Clone, Deserialize)]
struct PodDevice {
    device: String,
    pod: String,
    namespace: String,
    #[serde(default)]
    container: String,
}

/// Attribute keys written by the mapper.
struct AttributeKeys {
    pod: &'static str,
    namespace: &'static str,
    container: &'static str,
}

const ATTRIBUTE_KEYS: AttributeKeys = AttributeKeys {
    pod: "pod",
    namespace: "namespace",
    container: "container",
};

const OLD_ATTRIBUTE_KEYS: AttributeKeys = AttributeKeys {
    pod: "pod_name",
    namespace: "pod_namespace",
    container: "container_name",
};

pub struct PodMapper {
    path: PathBuf,
    keys: &'static AttributeKeys,
}

impl PodMapper {
    /// Fails when the mapping file is absent, i.e. not running under a kubelet.
    pub fn new(config: &Config) -> Result<Self, TransformError> {
        let path = config.pod_resources_path.clone();
        if !path.exists() {
            return Err(TransformError::Missing(path));
        }

        Ok(Self {
            path,
            keys: if config.use_old_namespace {
                &OLD_ATTRIBUTE_KEYS
            } else {
                &ATTRIBUTE_KEYS
            },
        })
    }

    fn load(&self) -> Result<Vec<PodDevice>, TransformError> {
        let content = fs::read_to_string(&self.path).map_err(|source| TransformError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| TransformError::Json {
            path: self.path.clone(),
            source,
        })
    }
}

impl Transform for PodMapper {
    fn process(&mut self, batch: &mut Batch, system_info: &SystemInfo) -> Result<(), TransformError> {
        let owners = self.load()?;
        let by_device: HashMap<&str, &PodDevice> =
            owners.iter().map(|o| (o.device.as_str(), o)).collect();
        trace!(
            owners = owners.len(),
            devices = system_info.device_count(),
            "mapping devices to pods"
        );

        let mut tagged = 0usize;
        for metric in batch.iter_mut().flatten() {
            let owner = by_device
                .get(metric.uuid.as_str())
                .or_else(|| by_device.get(metric.index.as_str()));
            let Some(owner) = owner else {
                continue;
            };

            metric
                .attributes
                .insert(self.keys.pod.to_string(), owner.pod.clone());
            metric
                .attributes
                .insert(self.keys.namespace.to_string(), owner.namespace.clone());
            if !owner.container.is_empty() {
                metric
                    .attributes
                    .insert(self.keys.container.to_string(), owner.container.clone());
            }
            tagged += 1;
        }

        debug!(tagged, "pod attributes applied");
        Ok(())
    }

    fn name(&self) -> &str {
        "podMapper"
    }
}
