//! hwexp-core — hardware telemetry exposition pipeline.
//!
//! Provides:
//! - `counters` — counter definitions and counter-list parsing
//! - `metric` — metric records, batches, device classes
//! - `collector` — collector abstraction, procfs backend, mocks
//! - `transform` — batch enrichment stages (Kubernetes pod mapping)
//! - `render` — grouping and exposition text rendering
//! - `pipeline` — per-cycle orchestration and the scheduling loop
//! - `config` — runtime configuration shared by all stages

pub mod collector;
pub mod config;
pub mod counters;
pub mod error;
pub mod metric;
pub mod pipeline;
pub mod render;
pub mod transform;

pub use collector::{Cleanup, Collector, CollectorFactory};
pub use config::Config;
pub use counters::{Counter, PromType, extract_counters};
pub use error::{CollectError, CounterError, PipelineError, RenderError, TransformError};
pub use metric::{Batch, DeviceClass, DeviceInfo, Metric, MigInstance, SystemInfo};
pub use pipeline::MetricsPipeline;
pub use render::{MetricsFormat, format_metrics};
pub use transform::Transform;
