//! Device-class collectors.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       MetricsPipeline                        │
//! │   gpu  │  switch  │  link  │  cpu  │  cpu core   (slots)     │
//! └────────┴────┬─────┴────────┴───┬───┴─────────────────────────┘
//!               │ Box<dyn Collector>│
//!        ┌──────▼──────┐     ┌──────▼──────────┐
//!        │MockCollector│     │ ProcStatCollector│
//!        │ (scripted / │     │  /proc/stat      │
//!        │  synthetic) │     └──────┬───────────┘
//!        └─────────────┘            │
//!                            ┌──────▼──────┐
//!                            │  FileSystem │ (trait)
//!                            └──────┬──────┘
//!                          ┌────────┴────────┐
//!                    ┌─────▼─────┐     ┌─────▼─────┐
//!                    │  RealFs   │     │  MockFs   │
//!                    └───────────┘     └───────────┘
//! ```
//!
//! Collectors are produced by a [`CollectorFactory`], once per device class,
//! at pipeline construction. A factory error disables that class for the
//! lifetime of the process.

pub mod mock;
pub mod procfs;
pub mod traits;

use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::counters::Counter;
use crate::error::CollectError;
use crate::metric::{Batch, DeviceClass, SystemInfo};

pub use mock::{MockCollector, MockCollectorFactory, MockFs};
pub use procfs::{ProcStatCollector, ProcfsCollectorFactory};
pub use traits::{FileSystem, RealFs};

/// Produces one batch of records per call.
///
/// Each call is an independent snapshot. An error means the batch is
/// unusable for this cycle.
pub trait Collector: Send {
    fn get_metrics(&mut self) -> Result<Batch, CollectError>;

    /// Hardware description handed to transforms.
    fn system_info(&self) -> &SystemInfo;
}

/// Builds the collector for one device class.
pub trait CollectorFactory {
    fn new_collector(
        &self,
        counters: &[Arc<Counter>],
        config: &Config,
        class: DeviceClass,
    ) -> Result<(Box<dyn Collector>, Cleanup), CollectError>;
}

impl<F> CollectorFactory for F
where
    F: Fn(&[Arc<Counter>], &Config, DeviceClass) -> Result<(Box<dyn Collector>, Cleanup), CollectError>,
{
    fn new_collector(
        &self,
        counters: &[Arc<Counter>],
        config: &Config,
        class: DeviceClass,
    ) -> Result<(Box<dyn Collector>, Cleanup), CollectError> {
        self(counters, config, class)
    }
}

type Callback = Box<dyn FnOnce() + Send>;

/// Releases collector resources.
///
/// Every registered callback runs exactly once: on [`Cleanup::run`], or on
/// drop if `run` was never called.
#[derive(Default)]
pub struct Cleanup {
    callbacks: Vec<Callback>,
}

impl Cleanup {
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callbacks: vec![Box::new(callback)],
        }
    }

    /// Takes over the callbacks of `other`.
    pub fn extend(&mut self, mut other: Cleanup) {
        self.callbacks.append(&mut other.callbacks);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn run(mut self) {
        self.run_callbacks();
    }

    fn run_callbacks(&mut self) {
        for callback in self.callbacks.drain(..) {
            callback();
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.run_callbacks();
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanup")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}
