use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::metric::DeviceClass;

/// Failure while loading the counter list.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("failed to read counters file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("line {line}: unknown counter type '{value}'")]
    UnknownType { line: usize, value: String },
    #[error("no counters defined")]
    Empty,
}

/// Failure while building a collector or taking a sample.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("{0} metrics are not supported by this backend")]
    Unsupported(DeviceClass),
    #[error("none of the requested counters is available for {0}")]
    NoCounters(DeviceClass),
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Backend(String),
}

/// Failure inside a transform stage.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("pod resources path {0:?} does not exist")]
    Missing(PathBuf),
    #[error("failed to read pod resources from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed pod resources in {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// Failure while rendering a batch into exposition text.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("counter {field}: unsupported value {value:?}")]
    UnsupportedValue { field: String, value: String },
    #[error("counter {field}: invalid label name {key:?}")]
    InvalidLabel { field: String, key: String },
    #[error(transparent)]
    Fmt(#[from] std::fmt::Error),
}

/// Pipeline construction or cycle failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to load counters: {0}")]
    Counters(#[from] CounterError),
    #[error("failed to collect {class} metrics: {source}")]
    Collect {
        class: DeviceClass,
        #[source]
        source: CollectError,
    },
    #[error("failed to transform metrics for transform {name}: {source}")]
    Transform {
        name: String,
        #[source]
        source: TransformError,
    },
    #[error("failed to format {class} metrics: {source}")]
    Render {
        class: DeviceClass,
        #[source]
        source: RenderError,
    },
}
