//! Counter definitions and counter-list parsing.
//!
//! A counter list is a CSV-like text file with one counter per line:
//!
//! ```text
//! # Format: field name, exposition type, help message
//! DCGM_FI_DEV_GPU_UTIL,      gauge,   GPU utilization (in %).
//! DCGM_FI_DEV_XID_ERRORS,    gauge,   Value of the last XID error encountered.
//! ```
//!
//! Counters are handed out as `Arc<Counter>`: every metric record points at
//! the definition that describes it, and rendering groups records by that
//! pointer rather than by field name.

use std::fmt;
use std::fs;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::error::CounterError;

/// Exposition type of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromType {
    Gauge,
    Counter,
    /// Value is exported as a label on other metrics rather than a sample.
    Label,
}

impl PromType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromType::Gauge => "gauge",
            PromType::Counter => "counter",
            PromType::Label => "label",
        }
    }
}

impl fmt::Display for PromType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gauge" => Ok(PromType::Gauge),
            "counter" => Ok(PromType::Counter),
            "label" => Ok(PromType::Label),
            _ => Err(s.to_string()),
        }
    }
}

/// Static description of a monitored field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub field_name: String,
    pub prom_type: PromType,
    pub help: String,
}

impl Counter {
    pub fn new(field_name: impl Into<String>, prom_type: PromType, help: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            prom_type,
            help: help.into(),
        }
    }
}

/// Loads the counters listed in `config.collectors_file`.
pub fn extract_counters(config: &Config) -> Result<Vec<Arc<Counter>>, CounterError> {
    let path = &config.collectors_file;
    let content = fs::read_to_string(path).map_err(|source| CounterError::Io {
        path: path.clone(),
        source,
    })?;

    let counters = parse_counters(&content)?;
    debug!(count = counters.len(), path = ?path, "loaded counters");
    Ok(counters)
}

/// Parses counter-list content.
///
/// Blank lines and `#` comments are skipped. Everything after the second
/// comma belongs to the help text, so help messages may contain commas.
pub fn parse_counters(content: &str) -> Result<Vec<Arc<Counter>>, CounterError> {
    let mut counters = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(3, ',');
        let field_name = parts.next().unwrap_or("").trim();
        let (Some(kind), Some(help)) = (parts.next(), parts.next()) else {
            return Err(CounterError::Malformed {
                line: line_no,
                message: format!("expected 3 fields, got '{}'", line),
            });
        };

        if field_name.is_empty() {
            return Err(CounterError::Malformed {
                line: line_no,
                message: "empty field name".to_string(),
            });
        }
        if field_name.chars().any(char::is_whitespace) {
            return Err(CounterError::Malformed {
                line: line_no,
                message: format!("field name '{}' contains whitespace", field_name),
            });
        }

        let prom_type = kind
            .trim()
            .parse::<PromType>()
            .map_err(|value| CounterError::UnknownType {
                line: line_no,
                value,
            })?;

        counters.push(Arc::new(Counter::new(field_name, prom_type, help.trim())));
    }

    if counters.is_empty() {
        return Err(CounterError::Empty);
    }

    Ok(counters)
}
