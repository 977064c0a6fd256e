//! hwexpd - hardware telemetry exporter daemon.
//!
//! Collects device metrics on a fixed interval and writes them as Prometheus
//! exposition text to a node-exporter textfile (or stdout).

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{Sender, bounded};
use tempfile::NamedTempFile;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hwexp_core::collector::{MockCollectorFactory, ProcfsCollectorFactory, RealFs};
use hwexp_core::config::{DEFAULT_COLLECTORS_FILE, DEFAULT_POD_RESOURCES_PATH};
use hwexp_core::{CollectorFactory, Config, MetricsPipeline};

/// Hardware telemetry exporter daemon.
#[derive(Parser, Debug)]
#[command(name = "hwexpd", about = "Hardware telemetry exporter daemon", version)]
struct Args {
    /// Counter list (CSV: field, type, help).
    #[arg(short = 'f', long, env = "HWEXP_COLLECTORS", default_value = DEFAULT_COLLECTORS_FILE)]
    collectors: PathBuf,

    /// Collection interval in milliseconds.
    #[arg(short = 'c', long, env = "HWEXP_COLLECT_INTERVAL", default_value = "30000")]
    collect_interval: u64,

    /// Tag GPU metrics with the owning Kubernetes pod.
    #[arg(short = 'k', long, env = "HWEXP_KUBERNETES")]
    kubernetes: bool,

    /// Device ownership mapping used with --kubernetes.
    #[arg(long, env = "HWEXP_POD_RESOURCES", default_value = DEFAULT_POD_RESOURCES_PATH)]
    pod_resources: PathBuf,

    /// Use legacy label names (UUID, pod_name, pod_namespace, container_name).
    #[arg(long, env = "HWEXP_USE_OLD_NAMESPACE")]
    use_old_namespace: bool,

    /// Do not attach the Hostname label.
    #[arg(long, env = "HWEXP_NO_HOSTNAME")]
    no_hostname: bool,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, env = "HWEXP_PROC_PATH", default_value = "/proc")]
    proc_path: PathBuf,

    /// Path to /sys filesystem (for testing/mocking).
    #[arg(long, env = "HWEXP_SYS_PATH", default_value = "/sys")]
    sys_path: PathBuf,

    /// Textfile to write metrics to. Writes to stdout when omitted.
    #[arg(short, long, env = "HWEXP_OUTPUT", value_name = "PATH")]
    output: Option<PathBuf>,

    /// Pending results kept between the collector and the writer.
    /// Results that do not fit are dropped.
    #[arg(long, default_value = "1", value_parser = parse_capacity)]
    channel_capacity: usize,

    /// Serve synthetic hardware instead of reading the host.
    #[arg(long)]
    mock: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            collectors_file: self.collectors.clone(),
            collect_interval: Duration::from_millis(self.collect_interval),
            kubernetes: self.kubernetes,
            pod_resources_path: self.pod_resources.clone(),
            use_old_namespace: self.use_old_namespace,
            no_hostname: self.no_hostname,
            proc_path: self.proc_path.clone(),
            sys_path: self.sys_path.clone(),
        }
    }
}

/// Parses a channel capacity. Zero is rejected: results would never fit.
fn parse_capacity(s: &str) -> Result<usize, String> {
    let capacity = s
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("invalid capacity '{}': {}", s, e))?;
    if capacity == 0 {
        return Err("capacity must be at least 1".to_string());
    }
    Ok(capacity)
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hwexpd={level},hwexp_core={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Replaces the exposition with `text`.
///
/// Files are replaced atomically so a scraper never reads a partial write.
/// An empty `text` leaves an empty file behind.
fn write_exposition(output: Option<&Path>, text: &str) -> io::Result<()> {
    let Some(path) = output else {
        let mut stdout = io::stdout().lock();
        stdout.write_all(text.as_bytes())?;
        return stdout.flush();
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(text.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Routes Ctrl-C to `stop`.
///
/// The handler owns a clone: if installation fails the caller's sender is
/// still connected and the pipeline keeps running.
fn install_stop_handler(stop: &Sender<()>) -> Result<(), ctrlc::Error> {
    let stop = stop.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        let _ = stop.try_send(());
    })
}

/// An empty text only signals a failed cycle when some class is collecting.
fn cycle_failed(text: &str, collecting: bool) -> bool {
    text.is_empty() && collecting
}

/// Describes exposition text for logging.
fn describe_exposition(text: &str) -> String {
    let families = text.lines().filter(|l| l.starts_with("# TYPE ")).count();
    let samples = text
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .count();
    format!("{} families, {} samples", families, samples)
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let config = args.config();

    info!("hwexpd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={}ms, counters={}, output={}",
        args.collect_interval,
        config.collectors_file.display(),
        args.output
            .as_deref()
            .map_or_else(|| "stdout".to_string(), |p| p.display().to_string())
    );

    let factory: Box<dyn CollectorFactory> = if args.mock {
        info!("Using synthetic hardware");
        Box::new(MockCollectorFactory::synthetic())
    } else {
        Box::new(ProcfsCollectorFactory::new(RealFs::new()))
    };

    let (pipeline, cleanup) = match MetricsPipeline::new(&config, factory.as_ref()) {
        Ok(built) => built,
        Err(e) => {
            error!("Failed to initialize pipeline: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Pipeline ready: {} counters, classes [{}], transforms [{}]",
        pipeline.counters().len(),
        pipeline
            .enabled_classes()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        pipeline.transform_names().join(", ")
    );

    let (out_tx, out_rx) = bounded::<String>(args.channel_capacity);
    let (stop_tx, stop_rx) = bounded::<()>(1);

    // Setup graceful shutdown
    if let Err(e) = install_stop_handler(&stop_tx) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let collecting = !pipeline.enabled_classes().is_empty();
    if !collecting {
        warn!("No collector enabled, exposition stays empty");
    }

    let worker = match pipeline.spawn(out_tx, stop_rx) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start pipeline worker: {}", e);
            cleanup.run();
            std::process::exit(1);
        }
    };

    // Ends once the worker stops and drops its sender.
    let mut written: u64 = 0;
    for text in out_rx.iter() {
        if cycle_failed(&text, collecting) {
            warn!("Collection failed, clearing exposition");
        }
        match write_exposition(args.output.as_deref(), &text) {
            Ok(()) => {
                written += 1;
                debug!("Exposition #{}: {}", written, describe_exposition(&text));
            }
            Err(e) => error!("Failed to write metrics: {}", e),
        }
    }

    info!("Shutting down...");
    if worker.join().is_err() {
        error!("Pipeline worker panicked");
    }
    cleanup.run();
    drop(stop_tx);

    info!("Shutdown complete");
}
