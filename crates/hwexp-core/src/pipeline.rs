//! Metrics pipeline: collect, transform, render, publish.
//!
//! One cycle ([`MetricsPipeline::run_once`]):
//!
//! ```text
//! gpu collector ──► transforms ──► render ─┐
//! switch collector ──────────────► render ─┤
//! link collector ────────────────► render ─┼──► concatenated text
//! cpu collector ─────────────────► render ─┤
//! cpu core collector ────────────► render ─┘
//! ```
//!
//! Any GPU failure and any collection failure fail the cycle. A render
//! failure on a secondary class only drops that class's text.
//!
//! The scheduling loop ([`MetricsPipeline::run`]) executes one cycle per
//! tick on a dedicated thread and publishes through a bounded channel,
//! dropping results the consumer has no room for.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, select, tick};
use tracing::{debug, error, info, warn};

use crate::collector::{Cleanup, Collector, CollectorFactory};
use crate::config::Config;
use crate::counters::{Counter, extract_counters};
use crate::error::PipelineError;
use crate::metric::DeviceClass;
use crate::render::{MetricsFormat, format_metrics};
use crate::transform::{PodMapper, Transform};

/// Classes rendered after the GPU block, in output order.
const SECONDARY_CLASSES: [DeviceClass; 4] = [
    DeviceClass::Switch,
    DeviceClass::Link,
    DeviceClass::Cpu,
    DeviceClass::CpuCore,
];

/// One optional collector per device class. `None` means disabled.
#[derive(Default)]
struct CollectorSlots {
    gpu: Option<Box<dyn Collector>>,
    switch: Option<Box<dyn Collector>>,
    link: Option<Box<dyn Collector>>,
    cpu: Option<Box<dyn Collector>>,
    cpu_core: Option<Box<dyn Collector>>,
}

impl CollectorSlots {
    fn slot_mut(&mut self, class: DeviceClass) -> &mut Option<Box<dyn Collector>> {
        match class {
            DeviceClass::Gpu => &mut self.gpu,
            DeviceClass::Switch => &mut self.switch,
            DeviceClass::Link => &mut self.link,
            DeviceClass::Cpu => &mut self.cpu,
            DeviceClass::CpuCore => &mut self.cpu_core,
        }
    }

    fn slot(&self, class: DeviceClass) -> &Option<Box<dyn Collector>> {
        match class {
            DeviceClass::Gpu => &self.gpu,
            DeviceClass::Switch => &self.switch,
            DeviceClass::Link => &self.link,
            DeviceClass::Cpu => &self.cpu,
            DeviceClass::CpuCore => &self.cpu_core,
        }
    }
}

/// Per-class line layouts, built once at construction.
struct Formats {
    gpu: MetricsFormat,
    switch: MetricsFormat,
    link: MetricsFormat,
    cpu: MetricsFormat,
    cpu_core: MetricsFormat,
}

impl Formats {
    fn new() -> Self {
        Self {
            gpu: MetricsFormat::for_class(DeviceClass::Gpu),
            switch: MetricsFormat::for_class(DeviceClass::Switch),
            link: MetricsFormat::for_class(DeviceClass::Link),
            cpu: MetricsFormat::for_class(DeviceClass::Cpu),
            cpu_core: MetricsFormat::for_class(DeviceClass::CpuCore),
        }
    }

    fn get(&self, class: DeviceClass) -> &MetricsFormat {
        match class {
            DeviceClass::Gpu => &self.gpu,
            DeviceClass::Switch => &self.switch,
            DeviceClass::Link => &self.link,
            DeviceClass::Cpu => &self.cpu,
            DeviceClass::CpuCore => &self.cpu_core,
        }
    }
}

pub struct MetricsPipeline {
    interval: Duration,
    counters: Vec<Arc<Counter>>,
    collectors: CollectorSlots,
    transforms: Vec<Box<dyn Transform>>,
    formats: Formats,
}

impl MetricsPipeline {
    /// Builds a pipeline with one collector per class the factory supports.
    ///
    /// Only counter loading is fatal. Classes whose collector cannot be built
    /// are disabled, as is the pod mapper when it cannot start. The returned
    /// cleanup releases every collector that was built.
    pub fn new(
        config: &Config,
        factory: &dyn CollectorFactory,
    ) -> Result<(Self, Cleanup), PipelineError> {
        let counters = extract_counters(config)?;
        Ok(Self::with_counters(config, counters, factory))
    }

    /// Same as [`MetricsPipeline::new`] with an already loaded counter list.
    pub fn with_counters(
        config: &Config,
        counters: Vec<Arc<Counter>>,
        factory: &dyn CollectorFactory,
    ) -> (Self, Cleanup) {
        let mut collectors = CollectorSlots::default();
        let mut cleanup = Cleanup::noop();

        for class in DeviceClass::ALL {
            match factory.new_collector(&counters, config, class) {
                Ok((collector, collector_cleanup)) => {
                    debug!(
                        class = %class,
                        devices = collector.system_info().device_count(),
                        "collector enabled"
                    );
                    *collectors.slot_mut(class) = Some(collector);
                    cleanup.extend(collector_cleanup);
                }
                Err(e) => info!(error = %e, "Not collecting {} metrics", class),
            }
        }

        let mut transforms: Vec<Box<dyn Transform>> = Vec::new();
        if config.kubernetes {
            match PodMapper::new(config) {
                Ok(mapper) => transforms.push(Box::new(mapper)),
                Err(e) => warn!(error = %e, "Could not enable kubernetes metric collection"),
            }
        }

        let pipeline = Self {
            interval: config.collect_interval,
            counters,
            collectors,
            transforms,
            formats: Formats::new(),
        };
        (pipeline, cleanup)
    }

    /// A pipeline around a single GPU collector. The caller owns its cleanup.
    pub fn with_gpu_collector(
        config: &Config,
        counters: Vec<Arc<Counter>>,
        collector: Box<dyn Collector>,
    ) -> Self {
        let mut collectors = CollectorSlots::default();
        collectors.gpu = Some(collector);
        Self {
            interval: config.collect_interval,
            counters,
            collectors,
            transforms: Vec::new(),
            formats: Formats::new(),
        }
    }

    /// Appends a transform after the configured ones.
    pub fn with_transform(mut self, transform: Box<dyn Transform>) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn counters(&self) -> &[Arc<Counter>] {
        &self.counters
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Classes with a collector, in output order.
    pub fn enabled_classes(&self) -> Vec<DeviceClass> {
        DeviceClass::ALL
            .into_iter()
            .filter(|class| self.collectors.slot(*class).is_some())
            .collect()
    }

    /// Names of the active transforms, in application order.
    pub fn transform_names(&self) -> Vec<&str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// Runs one collection cycle and returns the rendered text.
    pub fn run_once(&mut self) -> Result<String, PipelineError> {
        let mut formatted = String::new();

        if let Some(gpu) = self.collectors.gpu.as_mut() {
            let mut batch = gpu.get_metrics().map_err(|source| PipelineError::Collect {
                class: DeviceClass::Gpu,
                source,
            })?;

            for transform in &mut self.transforms {
                transform
                    .process(&mut batch, gpu.system_info())
                    .map_err(|source| PipelineError::Transform {
                        name: transform.name().to_string(),
                        source,
                    })?;
            }

            formatted = format_metrics(&self.formats.gpu, &batch).map_err(|source| {
                PipelineError::Render {
                    class: DeviceClass::Gpu,
                    source,
                }
            })?;
        }

        for class in SECONDARY_CLASSES {
            let Some(collector) = self.collectors.slot_mut(class).as_mut() else {
                continue;
            };

            let batch = collector
                .get_metrics()
                .map_err(|source| PipelineError::Collect { class, source })?;
            if batch.is_empty() {
                continue;
            }

            match format_metrics(self.formats.get(class), &batch) {
                Ok(text) => formatted.push_str(&text),
                Err(e) => warn!(error = %e, "Failed to format {} metrics", class),
            }
        }

        Ok(formatted)
    }

    /// Scheduling loop: one cycle per tick until `stop` fires or is dropped.
    ///
    /// A failed cycle publishes an empty string so the consumer stops serving
    /// the previous text. When `out` is full the new text is dropped. The
    /// loop also ends once every receiver of `out` is gone.
    pub fn run(mut self, out: Sender<String>, stop: Receiver<()>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Pipeline starting");

        // Ticks are not queued: a cycle longer than the interval is followed
        // by the next tick as soon as it completes.
        let ticker = tick(self.interval);
        let mut cycles: u64 = 0;

        loop {
            select! {
                recv(stop) -> _ => {
                    info!(cycles, "Pipeline stopping");
                    return;
                }
                recv(ticker) -> _ => {
                    let started = Instant::now();
                    let text = match self.run_once() {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "Failed to collect metrics");
                            String::new()
                        }
                    };
                    cycles += 1;

                    let elapsed = started.elapsed();
                    debug!(
                        cycle = cycles,
                        bytes = text.len(),
                        duration_ms = elapsed.as_millis() as u64,
                        "cycle completed"
                    );
                    if elapsed > self.interval {
                        warn!(
                            duration_ms = elapsed.as_millis() as u64,
                            interval_ms = self.interval.as_millis() as u64,
                            "cycle exceeded collect interval"
                        );
                    }

                    if !publish(&out, text) {
                        info!(cycles, "Output channel closed, pipeline stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Runs [`MetricsPipeline::run`] on a dedicated thread.
    pub fn spawn(self, out: Sender<String>, stop: Receiver<()>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("hwexp-pipeline".to_string())
            .spawn(move || self.run(out, stop))
    }
}

/// Non-blocking send. Returns `false` once the consumer is gone.
fn publish(out: &Sender<String>, text: String) -> bool {
    match out.try_send(text) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(capacity = ?out.capacity(), "Channel is full skipping");
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}
