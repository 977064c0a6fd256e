//! Exposition text rendering.
//!
//! Collectors return records grouped by device; the exposition format wants
//! them grouped by counter:
//!
//! ```text
//! # HELP FIELD_ID HELP_MSG
//! # TYPE FIELD_ID PROM_TYPE
//! FIELD_ID{gpu="GPU_INDEX_0",uuid="GPU_UUID",...,attr...} VALUE
//! FIELD_ID{gpu="GPU_INDEX_N",uuid="GPU_UUID",...,attr...} VALUE
//!
//! ```
//!
//! [`format_metrics`] regroups a batch by counter identity and writes one
//! block per counter using the per-class [`MetricsFormat`].

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use crate::counters::Counter;
use crate::error::RenderError;
use crate::metric::{Batch, DeviceClass, Labels, Metric};

/// One dimension label in a class layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    /// `key="<index>"`
    Index(&'static str),
    /// `<uuid_key>="<uuid>"`
    Uuid,
    /// `key="<device>"`
    Device(&'static str),
    /// `key="<model_name>"`
    ModelName(&'static str),
    /// `GPU_I_PROFILE="..",GPU_I_ID=".."` when the record has a MIG instance.
    Mig,
}

/// Line layout for one device class.
///
/// Built once per pipeline and reused every cycle.
#[derive(Debug, Clone)]
pub struct MetricsFormat {
    dimensions: Vec<Dimension>,
    with_attributes: bool,
}

impl MetricsFormat {
    pub fn for_class(class: DeviceClass) -> Self {
        let dimensions = match class {
            DeviceClass::Gpu => vec![
                Dimension::Index("gpu"),
                Dimension::Uuid,
                Dimension::Device("device"),
                Dimension::ModelName("modelName"),
                Dimension::Mig,
            ],
            DeviceClass::Switch => vec![Dimension::Index("nvswitch")],
            DeviceClass::Link => vec![Dimension::Index("nvlink"), Dimension::Device("nvswitch")],
            DeviceClass::Cpu => vec![Dimension::Index("cpu")],
            DeviceClass::CpuCore => vec![Dimension::Index("cpucore"), Dimension::Device("cpu")],
        };

        Self {
            dimensions,
            // Only the GPU batch goes through transforms.
            with_attributes: class == DeviceClass::Gpu,
        }
    }

    fn write_line(&self, out: &mut String, metric: &Metric) -> Result<(), RenderError> {
        let counter = &metric.counter;
        validate_value(counter, &metric.value)?;

        write!(out, "{}{{", counter.field_name)?;
        let mut first = true;
        for dimension in &self.dimensions {
            match *dimension {
                Dimension::Index(key) => write_pair(out, &mut first, key, &metric.index)?,
                Dimension::Uuid => write_pair(out, &mut first, metric.uuid_key, &metric.uuid)?,
                Dimension::Device(key) => write_pair(out, &mut first, key, &metric.device)?,
                Dimension::ModelName(key) => {
                    write_pair(out, &mut first, key, &metric.model_name)?
                }
                Dimension::Mig => {
                    if let Some(mig) = metric.mig.as_ref().filter(|m| !m.profile.is_empty()) {
                        write_pair(out, &mut first, "GPU_I_PROFILE", &mig.profile)?;
                        write_pair(out, &mut first, "GPU_I_ID", &mig.instance_id)?;
                    }
                }
            }
        }

        if let Some(hostname) = metric.hostname.as_deref().filter(|h| !h.is_empty()) {
            write_pair(out, &mut first, "Hostname", hostname)?;
        }

        write_labels(out, &mut first, counter, &metric.labels)?;
        if self.with_attributes {
            write_labels(out, &mut first, counter, &metric.attributes)?;
        }

        writeln!(out, "}} {}", metric.value)?;
        Ok(())
    }
}

fn write_pair(out: &mut String, first: &mut bool, key: &str, value: &str) -> std::fmt::Result {
    if !*first {
        out.push(',');
    }
    *first = false;
    write!(out, "{}=\"", key)?;
    push_escaped(out, value);
    out.push('"');
    Ok(())
}

/// Label values escape backslash, double quote and line feed.
fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str(r"\\"),
            '"' => out.push_str(r#"\""#),
            '\n' => out.push_str(r"\n"),
            _ => out.push(c),
        }
    }
}

fn write_labels(
    out: &mut String,
    first: &mut bool,
    counter: &Counter,
    labels: &Labels,
) -> Result<(), RenderError> {
    for (key, value) in labels {
        if key.is_empty() || key.chars().any(|c| c.is_whitespace() || c == '"') {
            return Err(RenderError::InvalidLabel {
                field: counter.field_name.clone(),
                key: key.clone(),
            });
        }
        write_pair(out, first, key, value)?;
    }
    Ok(())
}

fn validate_value(counter: &Counter, value: &str) -> Result<(), RenderError> {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err(RenderError::UnsupportedValue {
            field: counter.field_name.clone(),
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Groups records by counter identity.
///
/// Groups appear in first-encounter order; records inside a group keep
/// device order, then per-device order. Two counters with equal field names
/// but distinct allocations stay in separate groups.
pub fn group_by_counter(batch: &Batch) -> Vec<(&Arc<Counter>, Vec<&Metric>)> {
    let mut positions: HashMap<*const Counter, usize> = HashMap::new();
    let mut groups: Vec<(&Arc<Counter>, Vec<&Metric>)> = Vec::new();

    for metric in batch.iter().flatten() {
        let key = Arc::as_ptr(&metric.counter);
        let idx = *positions.entry(key).or_insert_with(|| {
            groups.push((&metric.counter, Vec::new()));
            groups.len() - 1
        });
        groups[idx].1.push(metric);
    }

    groups
}

/// Renders a batch as exposition text.
///
/// Returns no text on failure; whether the failure is fatal is up to the
/// caller.
pub fn format_metrics(format: &MetricsFormat, batch: &Batch) -> Result<String, RenderError> {
    let mut out = String::new();

    for (counter, metrics) in group_by_counter(batch) {
        writeln!(out, "# HELP {} {}", counter.field_name, counter.help)?;
        writeln!(out, "# TYPE {} {}", counter.field_name, counter.prom_type)?;
        for metric in metrics {
            format.write_line(&mut out, metric)?;
        }
        out.push('\n');
    }

    Ok(out)
}
