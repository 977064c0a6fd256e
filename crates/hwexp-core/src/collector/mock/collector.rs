//! Scripted collectors and a factory that hands them out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::collector::{Cleanup, Collector, CollectorFactory};
use crate::config::Config;
use crate::counters::Counter;
use crate::error::CollectError;
use crate::metric::{Batch, DeviceClass, SystemInfo};

type Script = Box<dyn FnMut(u64) -> Result<Batch, CollectError> + Send>;

/// Collector driven by a closure of the call number.
pub struct MockCollector {
    script: Script,
    calls: Arc<AtomicUsize>,
    system_info: SystemInfo,
}

impl MockCollector {
    pub fn from_fn(
        class: DeviceClass,
        script: impl FnMut(u64) -> Result<Batch, CollectError> + Send + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
            system_info: SystemInfo {
                class,
                devices: Vec::new(),
            },
        }
    }

    /// Returns a clone of `batch` on every call.
    pub fn from_batch(class: DeviceClass, batch: Batch) -> Self {
        Self::from_fn(class, move |_| Ok(batch.clone()))
    }

    /// Fails every call with `message`.
    pub fn failing(class: DeviceClass, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_fn(class, move |_| Err(CollectError::Backend(message.clone())))
    }

    pub fn with_system_info(mut self, system_info: SystemInfo) -> Self {
        self.system_info = system_info;
        self
    }

    /// Shared call counter, readable after the collector moved into a pipeline.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Collector for MockCollector {
    fn get_metrics(&mut self) -> Result<Batch, CollectError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
        (self.script)(call)
    }

    fn system_info(&self) -> &SystemInfo {
        &self.system_info
    }
}

enum Mode {
    Scripted(Mutex<HashMap<DeviceClass, MockCollector>>),
    Synthetic,
}

/// Factory over mock collectors.
///
/// Classes without a registered collector are reported unsupported, which
/// disables them in the pipeline. Each handed-out collector comes with a
/// cleanup that bumps [`MockCollectorFactory::cleanups`].
pub struct MockCollectorFactory {
    mode: Mode,
    cleanups: Arc<AtomicUsize>,
}

impl MockCollectorFactory {
    pub fn new() -> Self {
        Self {
            mode: Mode::Scripted(Mutex::new(HashMap::new())),
            cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every class gets a synthetic collector over the requested counters.
    pub fn synthetic() -> Self {
        Self {
            mode: Mode::Synthetic,
            cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Registers the collector handed out for `class`.
    pub fn with(mut self, class: DeviceClass, collector: MockCollector) -> Self {
        if let Mode::Scripted(slots) = &mut self.mode
            && let Ok(slots) = slots.get_mut()
        {
            slots.insert(class, collector);
        }
        self
    }

    /// Number of cleanup callbacks that have run.
    pub fn cleanups(&self) -> Arc<AtomicUsize> {
        self.cleanups.clone()
    }

    fn cleanup_for(&self, class: DeviceClass) -> Cleanup {
        let cleanups = self.cleanups.clone();
        Cleanup::new(move || {
            debug!(class = %class, "releasing mock collector");
            cleanups.fetch_add(1, Ordering::SeqCst);
        })
    }
}

impl Default for MockCollectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorFactory for MockCollectorFactory {
    fn new_collector(
        &self,
        counters: &[Arc<Counter>],
        config: &Config,
        class: DeviceClass,
    ) -> Result<(Box<dyn Collector>, Cleanup), CollectError> {
        let collector = match &self.mode {
            Mode::Scripted(slots) => {
                let mut slots = slots
                    .lock()
                    .map_err(|_| CollectError::Backend("mock factory lock poisoned".to_string()))?;
                slots.remove(&class).ok_or(CollectError::Unsupported(class))?
            }
            Mode::Synthetic => MockCollector::synthetic(counters, config, class)?,
        };

        Ok((Box::new(collector), self.cleanup_for(class)))
    }
}
