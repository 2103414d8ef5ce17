//! Metric samples and snapshots produced by collection cycles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Prometheus metric type of a query's value columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    #[default]
    Gauge,
    Counter,
}

impl MetricType {
    /// Parse a metric type name (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gauge" => Some(MetricType::Gauge),
            "counter" => Some(MetricType::Counter),
            _ => None,
        }
    }

    /// Get the TYPE comment string for Prometheus exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HELP and TYPE information for one metric name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: String,
    pub help: String,
    pub metric_type: MetricType,
}

impl MetricDescriptor {
    pub fn new(name: impl Into<String>, help: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            metric_type,
        }
    }
}

/// Descriptors indexed by metric name, shared by every snapshot.
pub type Descriptors = Arc<HashMap<String, MetricDescriptor>>;

/// A single metric value produced by a collection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Full Prometheus metric name.
    pub metric_name: String,
    /// Label set; keys are unique.
    pub labels: BTreeMap<String, String>,
    /// Sample value.
    pub value: f64,
    /// Unix epoch milliseconds of the collection cycle.
    pub timestamp: i64,
}

impl MetricSample {
    /// Create a sample without labels.
    pub fn new(metric_name: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            metric_name: metric_name.into(),
            labels: BTreeMap::new(),
            value,
            timestamp,
        }
    }

    /// Add a label to this sample.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Metadata describing how a snapshot was collected.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMeta {
    /// Unix epoch milliseconds at which the cycle started.
    pub collected_at: i64,
    /// Wall time of the whole cycle.
    pub duration: Duration,
    /// True only if every query succeeded.
    pub success: bool,
    /// Joined description of every failed query.
    pub error: Option<String>,
    /// Whether the instance database answered during the cycle.
    pub database_up: bool,
    /// Number of failed query executions.
    pub queries_failed: usize,
}

/// Immutable result of one collection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub samples: Vec<MetricSample>,
    pub meta: CollectionMeta,
    descriptors: Descriptors,
}

impl Snapshot {
    pub fn new(samples: Vec<MetricSample>, meta: CollectionMeta, descriptors: Descriptors) -> Self {
        Self {
            samples,
            meta,
            descriptors,
        }
    }

    /// Look up the HELP/TYPE descriptor for a metric name.
    pub fn descriptor(&self, name: &str) -> Option<&MetricDescriptor> {
        self.descriptors.get(name)
    }

    /// Samples of one metric, in collection order.
    pub fn samples_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MetricSample> {
        self.samples.iter().filter(move |s| s.metric_name == name)
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
