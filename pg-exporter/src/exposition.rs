//! Prometheus text exposition of snapshots and exporter health.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use crate::collector::CollectorStats;
use crate::mapping::{escape_help, escape_label_value, format_labels, format_value};
use crate::sample::{MetricSample, MetricType, Snapshot};

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render a snapshot followed by the exporter's own health metrics.
///
/// Samples sharing a metric name are grouped under a single HELP/TYPE
/// header, in order of the name's first appearance. With no snapshot only
/// health metrics are written and `exporter_last_scrape_success` is 0.
pub fn render(snapshot: Option<&Snapshot>, stats: &CollectorStats) -> String {
    let mut output = String::with_capacity(
        snapshot.map_or(0, |s| s.samples.len() * 96) + 2048,
    );

    if let Some(snapshot) = snapshot {
        render_snapshot(&mut output, snapshot);
    }

    render_health(&mut output, snapshot, stats);
    output
}

fn render_snapshot(output: &mut String, snapshot: &Snapshot) {
    let mut order: Vec<&str> = Vec::new();
    let mut by_name: HashMap<&str, Vec<&MetricSample>> = HashMap::new();
    for sample in &snapshot.samples {
        by_name
            .entry(sample.metric_name.as_str())
            .or_insert_with(|| {
                order.push(sample.metric_name.as_str());
                Vec::new()
            })
            .push(sample);
    }

    for name in order {
        let (help, metric_type) = match snapshot.descriptor(name) {
            Some(descriptor) => (descriptor.help.as_str(), descriptor.metric_type),
            None => (name, MetricType::Gauge),
        };
        write_header(output, name, help, metric_type);

        for sample in &by_name[name] {
            writeln!(
                output,
                "{}{} {}",
                name,
                format_labels(&sample.labels),
                format_value(sample.value)
            )
            .ok();
        }
    }
}

fn render_health(output: &mut String, snapshot: Option<&Snapshot>, stats: &CollectorStats) {
    let meta = snapshot.map(|s| &s.meta);

    write_metric(
        output,
        "exporter_last_scrape_success",
        "Whether the last collection cycle succeeded for every query",
        MetricType::Gauge,
        if meta.is_some_and(|m| m.success) { 1.0 } else { 0.0 },
    );
    write_metric(
        output,
        "exporter_last_scrape_duration_seconds",
        "Duration of the last collection cycle",
        MetricType::Gauge,
        meta.map_or(0.0, |m| m.duration.as_secs_f64()),
    );
    write_metric(
        output,
        "exporter_last_scrape_timestamp_seconds",
        "Unix time at which the last collection cycle started",
        MetricType::Gauge,
        meta.map_or(0.0, |m| m.collected_at as f64 / 1000.0),
    );
    write_metric(
        output,
        "exporter_scrape_errors_total",
        "Collection cycles in which at least one query failed",
        MetricType::Counter,
        stats.failed_collections_total as f64,
    );
    write_metric(
        output,
        "exporter_collections_total",
        "Completed collection cycles",
        MetricType::Counter,
        stats.collections_total as f64,
    );
    write_metric(
        output,
        "exporter_collection_duration_seconds_total",
        "Total time spent in collection cycles",
        MetricType::Counter,
        stats.collection_duration_total.as_secs_f64(),
    );
    write_metric(
        output,
        "exporter_serialization_errors_total",
        "Samples dropped because their value could not be rendered",
        MetricType::Counter,
        stats.serialization_errors_total as f64,
    );
    write_per_query(
        output,
        "exporter_query_errors_total",
        "Failed query executions",
        &stats.query_errors,
    );
    write_per_query(
        output,
        "exporter_query_invalid_values_total",
        "Null or non-numeric values skipped",
        &stats.invalid_values,
    );
}

fn write_header(output: &mut String, name: &str, help: &str, metric_type: MetricType) {
    writeln!(output, "# HELP {} {}", name, escape_help(help)).ok();
    writeln!(output, "# TYPE {} {}", name, metric_type.as_str()).ok();
}

fn write_metric(output: &mut String, name: &str, help: &str, metric_type: MetricType, value: f64) {
    write_header(output, name, help, metric_type);
    writeln!(output, "{} {}", name, format_value(value)).ok();
}

fn write_per_query(output: &mut String, name: &str, help: &str, counts: &BTreeMap<String, u64>) {
    write_header(output, name, help, MetricType::Counter);
    for (query, count) in counts {
        writeln!(
            output,
            "{}{{query=\"{}\"}} {}",
            name,
            escape_label_value(query),
            count
        )
        .ok();
    }
}
