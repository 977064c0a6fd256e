use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;

use hwexp_core::collector::{MockCollector, MockCollectorFactory};
use hwexp_core::{
    Batch, CollectError, Config, Counter, DeviceClass, Metric, MetricsFormat, MetricsPipeline,
    PipelineError, PromType, SystemInfo, Transform, TransformError, format_metrics,
};

fn counter(name: &str, help: &str) -> Arc<Counter> {
    Arc::new(Counter::new(name, PromType::Gauge, help))
}

fn gpu_metric(counter: &Arc<Counter>, index: u32, value: &str) -> Metric {
    Metric::new(counter.clone(), index.to_string(), value)
        .with_uuid("uuid", format!("GPU-{index}"))
        .with_device(format!("nvidia{index}"))
        .with_model_name("NVIDIA H100 80GB HBM3")
}

fn config_with_interval(ms: u64) -> Config {
    Config {
        collect_interval: Duration::from_millis(ms),
        ..Config::default()
    }
}

/// Polls until `calls` reaches `n` or two seconds pass.
fn wait_for_calls(calls: &AtomicUsize, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while calls.load(Ordering::SeqCst) < n && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

struct FailingTransform;

impl Transform for FailingTransform {
    fn process(&mut self, _batch: &mut Batch, _system_info: &SystemInfo) -> Result<(), TransformError> {
        Err(TransformError::Other("lookup service unavailable".to_string()))
    }

    fn name(&self) -> &str {
        "failingMapper"
    }
}

struct TagTransform(&'static str);

impl Transform for TagTransform {
    fn process(&mut self, batch: &mut Batch, _system_info: &SystemInfo) -> Result<(), TransformError> {
        for metric in batch.iter_mut().flatten() {
            metric
                .attributes
                .insert("stage".to_string(), self.0.to_string());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        self.0
    }
}

// ============================================================
// Rendering properties
// ============================================================

#[test]
fn test_two_gpus_same_counter_example() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "GPU utilization");
    let batch = vec![vec![gpu_metric(&util, 0, "42")], vec![gpu_metric(&util, 1, "87")]];

    let text = format_metrics(&MetricsFormat::for_class(DeviceClass::Gpu), &batch).unwrap();
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(text.matches("# HELP").count(), 1);
    assert_eq!(text.matches("# TYPE").count(), 1);
    assert_eq!(lines[0], "# HELP DCGM_FI_DEV_GPU_UTIL GPU utilization");
    assert_eq!(lines[1], "# TYPE DCGM_FI_DEV_GPU_UTIL gauge");
    assert!(lines[2].starts_with("DCGM_FI_DEV_GPU_UTIL{gpu=\"0\","));
    assert!(lines[2].ends_with("} 42"));
    assert!(lines[3].starts_with("DCGM_FI_DEV_GPU_UTIL{gpu=\"1\","));
    assert!(lines[3].ends_with("} 87"));
}

#[test]
fn test_header_and_value_line_counts() {
    let counters: Vec<Arc<Counter>> = (0..3)
        .map(|i| counter(&format!("DCGM_FI_TEST_{i}"), "test"))
        .collect();

    // 4 devices; device d reports counters 0..=d%3.
    let batch: Batch = (0..4u32)
        .map(|d| {
            (0..=(d as usize % 3))
                .map(|c| gpu_metric(&counters[c], d, &format!("{}", d * 10 + c as u32)))
                .collect()
        })
        .collect();
    let n: usize = batch.iter().map(Vec::len).sum();

    let text = format_metrics(&MetricsFormat::for_class(DeviceClass::Gpu), &batch).unwrap();
    let help = text.lines().filter(|l| l.starts_with("# HELP ")).count();
    let types = text.lines().filter(|l| l.starts_with("# TYPE ")).count();
    let values: Vec<&str> = text
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();

    assert_eq!(help, 3);
    assert_eq!(types, 3);
    assert_eq!(values.len(), n);
    for line in values {
        assert!(counters.iter().any(|c| line.starts_with(&format!("{}{{", c.field_name))));
    }
}

#[test]
fn test_rendering_is_stable() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "GPU utilization");
    let power = counter("DCGM_FI_DEV_POWER_USAGE", "Power draw");
    let batch = vec![
        vec![gpu_metric(&util, 0, "1"), gpu_metric(&power, 0, "250.5")],
        vec![gpu_metric(&power, 1, "251.0"), gpu_metric(&util, 1, "2")],
    ];
    let format = MetricsFormat::for_class(DeviceClass::Gpu);

    let first = format_metrics(&format, &batch).unwrap();
    let second = format_metrics(&format, &batch).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_equal_field_names_with_distinct_identity_are_not_merged() {
    let a = counter("DCGM_FI_DEV_GPU_UTIL", "first");
    let b = counter("DCGM_FI_DEV_GPU_UTIL", "second");
    let batch = vec![vec![gpu_metric(&a, 0, "1"), gpu_metric(&b, 0, "2")]];

    let text = format_metrics(&MetricsFormat::for_class(DeviceClass::Gpu), &batch).unwrap();
    assert!(text.contains("# HELP DCGM_FI_DEV_GPU_UTIL first\n"));
    assert!(text.contains("# HELP DCGM_FI_DEV_GPU_UTIL second\n"));
}

// ============================================================
// Cycle orchestration
// ============================================================

#[test]
fn test_gpu_collection_failure_fails_cycle() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let mut pipeline = MetricsPipeline::with_gpu_collector(
        &Config::default(),
        vec![util],
        Box::new(MockCollector::failing(DeviceClass::Gpu, "driver not loaded")),
    );

    let err = pipeline.run_once().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Collect {
            class: DeviceClass::Gpu,
            ..
        }
    ));
}

#[test]
fn test_gpu_render_failure_fails_cycle() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let temp = counter("DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT", "t");
    let factory = MockCollectorFactory::new()
        .with(
            DeviceClass::Gpu,
            MockCollector::from_batch(
                DeviceClass::Gpu,
                vec![vec![gpu_metric(&util, 0, "42")], vec![gpu_metric(&util, 1, "4 2")]],
            ),
        )
        .with(
            DeviceClass::Switch,
            MockCollector::from_batch(
                DeviceClass::Switch,
                vec![vec![Metric::new(temp.clone(), "0", "45")]],
            ),
        );

    let (mut pipeline, _cleanup) =
        MetricsPipeline::with_counters(&Config::default(), vec![util, temp], &factory);
    let result = pipeline.run_once();
    assert!(matches!(
        result,
        Err(PipelineError::Render {
            class: DeviceClass::Gpu,
            ..
        })
    ));
}

#[test]
fn test_gpu_render_failure_publishes_empty_string() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let collector = MockCollector::from_batch(DeviceClass::Gpu, vec![vec![gpu_metric(&util, 0, "")]]);
    let pipeline =
        MetricsPipeline::with_gpu_collector(&config_with_interval(10), vec![util], Box::new(collector));

    let (out_tx, out_rx) = bounded(16);
    let (stop_tx, stop_rx) = bounded(1);
    let handle = pipeline.spawn(out_tx, stop_rx).unwrap();

    let first = out_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    stop_tx.send(()).unwrap();
    handle.join().unwrap();

    assert_eq!(first, "");
    assert!(out_rx.try_iter().all(|text| text.is_empty()));
}

#[test]
fn test_transform_failure_names_transform() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let collector = MockCollector::from_batch(DeviceClass::Gpu, vec![vec![gpu_metric(&util, 0, "1")]]);
    let mut pipeline =
        MetricsPipeline::with_gpu_collector(&Config::default(), vec![util], Box::new(collector))
            .with_transform(Box::new(FailingTransform));

    let err = pipeline.run_once().unwrap_err();
    assert!(matches!(err, PipelineError::Transform { ref name, .. } if name == "failingMapper"));
    assert!(err.to_string().contains("failingMapper"));
}

#[test]
fn test_transforms_apply_in_order_to_gpu_only() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let temp = counter("DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT", "t");
    let factory = MockCollectorFactory::new()
        .with(
            DeviceClass::Gpu,
            MockCollector::from_batch(DeviceClass::Gpu, vec![vec![gpu_metric(&util, 0, "1")]]),
        )
        .with(
            DeviceClass::Switch,
            MockCollector::from_batch(
                DeviceClass::Switch,
                vec![vec![Metric::new(temp.clone(), "0", "45")]],
            ),
        );

    let (pipeline, _cleanup) =
        MetricsPipeline::with_counters(&Config::default(), vec![util, temp], &factory);
    let mut pipeline = pipeline
        .with_transform(Box::new(TagTransform("first")))
        .with_transform(Box::new(TagTransform("second")));

    let text = pipeline.run_once().unwrap();
    assert!(text.contains("stage=\"second\"} 1\n"));
    assert!(text.contains("DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT{nvswitch=\"0\"} 45\n"));
}

#[test]
fn test_secondary_render_failure_keeps_gpu_text() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let temp = counter("DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT", "t");
    let link = counter("DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL", "l");
    let factory = MockCollectorFactory::new()
        .with(
            DeviceClass::Gpu,
            MockCollector::from_batch(DeviceClass::Gpu, vec![vec![gpu_metric(&util, 0, "42")]]),
        )
        .with(
            DeviceClass::Switch,
            // Empty value cannot be rendered.
            MockCollector::from_batch(
                DeviceClass::Switch,
                vec![vec![Metric::new(temp.clone(), "0", "")]],
            ),
        )
        .with(
            DeviceClass::Link,
            MockCollector::from_batch(
                DeviceClass::Link,
                vec![vec![Metric::new(link.clone(), "2", "1000").with_device("0")]],
            ),
        );

    let (mut pipeline, _cleanup) =
        MetricsPipeline::with_counters(&Config::default(), vec![util, temp, link], &factory);
    let text = pipeline.run_once().unwrap();

    assert!(text.contains("# HELP DCGM_FI_DEV_GPU_UTIL u\n"));
    assert!(!text.contains("NVSWITCH_TEMPERATURE"));
    assert!(text.contains("DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL{nvlink=\"2\",nvswitch=\"0\"} 1000\n"));
}

#[test]
fn test_secondary_collection_failure_fails_cycle() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let factory = MockCollectorFactory::new()
        .with(
            DeviceClass::Gpu,
            MockCollector::from_batch(DeviceClass::Gpu, vec![vec![gpu_metric(&util, 0, "42")]]),
        )
        .with(DeviceClass::CpuCore, MockCollector::failing(DeviceClass::CpuCore, "gone"));

    let (mut pipeline, _cleanup) =
        MetricsPipeline::with_counters(&Config::default(), vec![util], &factory);
    let err = pipeline.run_once().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Collect {
            class: DeviceClass::CpuCore,
            ..
        }
    ));
}

#[test]
fn test_classes_concatenate_in_fixed_order() {
    let factory = MockCollectorFactory::synthetic();
    let counters = vec![counter("DCGM_FI_TEST_VALUE", "v")];
    let (mut pipeline, _cleanup) =
        MetricsPipeline::with_counters(&Config::default(), counters, &factory);
    assert_eq!(pipeline.enabled_classes(), DeviceClass::ALL.to_vec());

    let text = pipeline.run_once().unwrap();
    let gpu = text.find("{gpu=").unwrap();
    let switch = text.find("{nvswitch=").unwrap();
    let link = text.find("{nvlink=").unwrap();
    let cpu = text.find("{cpu=").unwrap();
    let core = text.find("{cpucore=").unwrap();
    assert!(gpu < switch && switch < link && link < cpu && cpu < core);
}

#[test]
fn test_empty_secondary_batch_contributes_nothing() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let factory = MockCollectorFactory::new()
        .with(
            DeviceClass::Gpu,
            MockCollector::from_batch(DeviceClass::Gpu, vec![vec![gpu_metric(&util, 0, "42")]]),
        )
        .with(DeviceClass::Cpu, MockCollector::from_batch(DeviceClass::Cpu, Vec::new()));

    let (mut pipeline, _cleanup) =
        MetricsPipeline::with_counters(&Config::default(), vec![util.clone()], &factory);
    let text = pipeline.run_once().unwrap();
    let expected = format_metrics(
        &MetricsFormat::for_class(DeviceClass::Gpu),
        &vec![vec![gpu_metric(&util, 0, "42")]],
    )
    .unwrap();
    assert_eq!(text, expected);
}

// ============================================================
// Construction
// ============================================================

#[test]
fn test_new_loads_counters_and_cleans_up_once() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "DCGM_FI_DEV_GPU_UTIL, gauge, GPU utilization (in %).").unwrap();
    writeln!(file, "DCGM_FI_DEV_FB_USED, gauge, Framebuffer memory used (in MiB).").unwrap();
    let config = Config {
        collectors_file: file.path().to_path_buf(),
        ..Config::default()
    };

    let factory = MockCollectorFactory::synthetic();
    let cleanups = factory.cleanups();
    let (mut pipeline, cleanup) = MetricsPipeline::new(&config, &factory).unwrap();
    assert_eq!(pipeline.counters().len(), 2);
    assert!(pipeline.run_once().unwrap().contains("DCGM_FI_DEV_FB_USED{gpu=\"1\""));

    cleanup.run();
    assert_eq!(cleanups.load(Ordering::SeqCst), DeviceClass::ALL.len());
}

#[test]
fn test_new_fails_without_counters() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        collectors_file: dir.path().join("missing.csv"),
        ..Config::default()
    };
    let result = MetricsPipeline::new(&config, &MockCollectorFactory::synthetic());
    assert!(matches!(result, Err(PipelineError::Counters(_))));
}

#[test]
fn test_closure_factory_disables_failing_classes() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let factory = |counters: &[Arc<Counter>],
                   config: &Config,
                   class: DeviceClass|
     -> Result<(Box<dyn hwexp_core::Collector>, hwexp_core::Cleanup), CollectError> {
        match class {
            DeviceClass::Link => {
                let collector: Box<dyn hwexp_core::Collector> =
                    Box::new(MockCollector::synthetic(counters, config, class)?);
                Ok((collector, hwexp_core::Cleanup::noop()))
            }
            _ => Err(CollectError::Unsupported(class)),
        }
    };

    let (pipeline, cleanup) = MetricsPipeline::with_counters(&Config::default(), vec![util], &factory);
    assert_eq!(pipeline.enabled_classes(), vec![DeviceClass::Link]);
    assert!(cleanup.is_empty());
}

// ============================================================
// Scheduling loop
// ============================================================

#[test]
fn test_failed_cycle_publishes_empty_string_not_stale_text() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let good = vec![vec![gpu_metric(&util, 0, "42")]];
    let collector = MockCollector::from_fn(DeviceClass::Gpu, move |call| {
        if call == 0 {
            Ok(good.clone())
        } else {
            Err(CollectError::Backend("xid 79".to_string()))
        }
    });
    let calls = collector.calls();
    let pipeline =
        MetricsPipeline::with_gpu_collector(&config_with_interval(10), vec![util], Box::new(collector));

    let (out_tx, out_rx) = bounded(16);
    let (stop_tx, stop_rx) = bounded(1);
    let handle = pipeline.spawn(out_tx, stop_rx).unwrap();

    let first = out_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(first.contains("} 42\n"));
    let second = out_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(second, "");

    wait_for_calls(&calls, 4);
    stop_tx.send(()).unwrap();
    handle.join().unwrap();

    // One message per tick: each later tick failed and sent exactly one empty string.
    let rest: Vec<String> = out_rx.try_iter().collect();
    assert_eq!(rest.len() + 2, calls.load(Ordering::SeqCst));
    assert!(rest.iter().all(String::is_empty));
}

#[test]
fn test_full_channel_drops_new_results_without_blocking() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let collector =
        MockCollector::from_batch(DeviceClass::Gpu, vec![vec![gpu_metric(&util, 0, "42")]]);
    let calls = collector.calls();
    let pipeline =
        MetricsPipeline::with_gpu_collector(&config_with_interval(5), vec![util], Box::new(collector));

    let (out_tx, out_rx) = bounded(1);
    out_tx.send("stale".to_string()).unwrap();
    let (stop_tx, stop_rx) = bounded(1);
    let handle = pipeline.spawn(out_tx, stop_rx).unwrap();

    wait_for_calls(&calls, 3);
    assert!(calls.load(Ordering::SeqCst) >= 3, "worker blocked on a full channel");

    stop_tx.send(()).unwrap();
    handle.join().unwrap();

    let received: Vec<String> = out_rx.try_iter().collect();
    assert_eq!(received, vec!["stale".to_string()]);
}

#[test]
fn test_stop_without_pending_tick_exits_without_writes() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let collector =
        MockCollector::from_batch(DeviceClass::Gpu, vec![vec![gpu_metric(&util, 0, "42")]]);
    let calls = collector.calls();
    let pipeline = MetricsPipeline::with_gpu_collector(
        &config_with_interval(60 * 60 * 1000),
        vec![util],
        Box::new(collector),
    );

    let (out_tx, out_rx) = bounded(4);
    let (stop_tx, stop_rx) = bounded(1);
    let handle = pipeline.spawn(out_tx, stop_rx).unwrap();

    stop_tx.send(()).unwrap();
    handle.join().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(out_rx.try_recv().is_err());
}

#[test]
fn test_dropping_stop_sender_stops_loop() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let collector =
        MockCollector::from_batch(DeviceClass::Gpu, vec![vec![gpu_metric(&util, 0, "42")]]);
    let pipeline = MetricsPipeline::with_gpu_collector(
        &config_with_interval(60 * 60 * 1000),
        vec![util],
        Box::new(collector),
    );

    let (out_tx, _out_rx) = bounded(1);
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let handle = pipeline.spawn(out_tx, stop_rx).unwrap();

    drop(stop_tx);
    handle.join().unwrap();
}

#[test]
fn test_outputs_arrive_in_cycle_order() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let script_counter = util.clone();
    let collector = MockCollector::from_fn(DeviceClass::Gpu, move |call| {
        Ok(vec![vec![gpu_metric(&script_counter, 0, &call.to_string())]])
    });
    let calls = collector.calls();
    let pipeline =
        MetricsPipeline::with_gpu_collector(&config_with_interval(5), vec![util], Box::new(collector));

    let (out_tx, out_rx) = bounded(64);
    let (stop_tx, stop_rx) = bounded(1);
    let handle = pipeline.spawn(out_tx, stop_rx).unwrap();

    wait_for_calls(&calls, 5);
    stop_tx.send(()).unwrap();
    handle.join().unwrap();

    let values: Vec<u64> = out_rx
        .try_iter()
        .map(|text| {
            let line = text.lines().nth(2).unwrap();
            line.rsplit(' ').next().unwrap().parse().unwrap()
        })
        .collect();
    assert!(values.len() >= 5);
    assert!(values.windows(2).all(|w| w[1] == w[0] + 1));
    assert_eq!(values[0], 0);
}

#[test]
fn test_loop_stops_when_consumer_is_gone() {
    let util = counter("DCGM_FI_DEV_GPU_UTIL", "u");
    let collector =
        MockCollector::from_batch(DeviceClass::Gpu, vec![vec![gpu_metric(&util, 0, "42")]]);
    let pipeline =
        MetricsPipeline::with_gpu_collector(&config_with_interval(5), vec![util], Box::new(collector));

    let (out_tx, out_rx) = bounded::<String>(1);
    let (_stop_tx, stop_rx) = bounded(1);
    drop(out_rx);
    let handle = pipeline.spawn(out_tx, stop_rx).unwrap();
    handle.join().unwrap();
}
