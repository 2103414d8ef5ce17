//! Collection cycles: run the query catalog and publish snapshots.
//!
//! A cycle walks the catalog in order, runs each query against its targets
//! (the instance database, or every included database for per-database
//! queries), turns rows into samples and publishes one immutable
//! [`Snapshot`]. A failing query never aborts the cycle; its error is
//! recorded in the snapshot metadata and the other queries' samples are
//! still published.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::catalog::{PG_UP_METRIC, QueryDefinition, QueryScope, SharedCatalog};
use crate::connection::QueryExecutor;
use crate::error::{CollectError, QueryError, SerializationError};
use crate::row::ResultRow;
use crate::sample::{
    CollectionMeta, Descriptors, MetricDescriptor, MetricSample, MetricType, Snapshot,
    current_timestamp_millis,
};
use crate::store::SharedStore;

/// Query used to ping the instance database when no catalog query targets it.
const PING_SQL: &str = "SELECT 1";

/// Cumulative counters about collection cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectorStats {
    /// Completed collection cycles.
    pub collections_total: u64,
    /// Cycles in which at least one query failed.
    pub failed_collections_total: u64,
    /// Sum of all cycle durations.
    pub collection_duration_total: Duration,
    /// Samples dropped because their value could not be rendered.
    pub serialization_errors_total: u64,
    /// Failed executions per query name.
    pub query_errors: BTreeMap<String, u64>,
    /// Null or non-numeric values skipped per query name.
    pub invalid_values: BTreeMap<String, u64>,
}

/// Thread-safe holder of [`CollectorStats`].
#[derive(Debug, Default)]
pub struct StatsRegistry {
    stats: RwLock<CollectorStats>,
}

/// Shareable stats handle.
pub type SharedStats = Arc<StatsRegistry>;

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with zeroed per-query counters for every query.
    pub fn for_catalog(catalog: &SharedCatalog) -> Self {
        let registry = Self::new();
        {
            let mut stats = registry.stats.write();
            for query in catalog.queries() {
                stats.query_errors.insert(query.name.clone(), 0);
                stats.invalid_values.insert(query.name.clone(), 0);
            }
        }
        registry
    }

    /// Copy of the current counters.
    pub fn stats(&self) -> CollectorStats {
        self.stats.read().clone()
    }

    fn record(&self, report: &CycleReport) {
        let mut stats = self.stats.write();
        stats.collections_total += 1;
        stats.collection_duration_total += report.duration;
        if report.failed_queries > 0 {
            stats.failed_collections_total += 1;
        }
        stats.serialization_errors_total += report.serialization_errors;
        for (query, count) in &report.query_errors {
            *stats.query_errors.entry(query.clone()).or_default() += count;
        }
        for (query, count) in &report.invalid_values {
            *stats.invalid_values.entry(query.clone()).or_default() += count;
        }
    }
}

/// Counters produced by a single cycle.
#[derive(Debug, Default)]
struct CycleReport {
    duration: Duration,
    failed_queries: usize,
    serialization_errors: u64,
    query_errors: HashMap<String, u64>,
    invalid_values: HashMap<String, u64>,
}

/// Samples converted from one query's rows.
#[derive(Debug, Default)]
struct Conversion {
    samples: Vec<MetricSample>,
    invalid_values: u64,
    filtered_rows: u64,
    serialization_errors: Vec<SerializationError>,
}

/// Result of running one query against one database.
struct JobOutcome<'a> {
    query: &'a QueryDefinition,
    database: String,
    is_instance: bool,
    result: Result<Conversion, QueryError>,
}

/// Resets the running flag when a cycle ends or is dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs the query catalog and publishes snapshots.
pub struct Collector<E: QueryExecutor> {
    catalog: SharedCatalog,
    instance: Arc<E>,
    databases: Vec<Arc<E>>,
    database_filter: Vec<String>,
    store: SharedStore,
    stats: SharedStats,
    descriptors: Descriptors,
    interval: Duration,
    query_timeout: Duration,
    concurrency: usize,
    running: AtomicBool,
}

impl<E: QueryExecutor> Collector<E> {
    /// Create a collector running every query against `instance`.
    pub fn new(catalog: SharedCatalog, instance: Arc<E>, store: SharedStore, stats: SharedStats) -> Self {
        let mut descriptors = catalog.descriptors();
        descriptors.insert(
            PG_UP_METRIC.to_string(),
            MetricDescriptor::new(
                PG_UP_METRIC,
                "Whether the last collection reached the PostgreSQL server",
                MetricType::Gauge,
            ),
        );

        Self {
            catalog,
            instance,
            databases: Vec::new(),
            database_filter: Vec::new(),
            store,
            stats,
            descriptors: Arc::new(descriptors),
            interval: Duration::from_secs(60),
            query_timeout: Duration::from_secs(15),
            concurrency: 1,
            running: AtomicBool::new(false),
        }
    }

    /// Databases that per-database queries run against.
    ///
    /// Without any, per-database queries are skipped.
    pub fn with_databases(mut self, databases: Vec<Arc<E>>) -> Self {
        self.databases = databases;
        self
    }

    /// Database names kept by queries that declare a `database_column`.
    /// Empty keeps every row.
    pub fn with_database_filter(mut self, databases: Vec<String>) -> Self {
        self.database_filter = databases;
        self
    }

    /// Time between the starts of two cycles.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Upper bound for a single query, connection time included.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Maximum number of queries in flight. 1 runs queries sequentially.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one collection cycle and publish its snapshot.
    ///
    /// Refuses to start while another cycle is in progress. Dropping the
    /// returned future before completion publishes nothing.
    pub async fn collect_once(&self) -> Result<CollectionMeta, CollectError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CollectError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let started = Instant::now();
        let collected_at = current_timestamp_millis();

        let jobs = self.jobs();
        debug!(jobs = jobs.len(), concurrency = self.concurrency, "Starting collection cycle");

        // `buffered` keeps output in catalog order regardless of completion order
        let outcomes: Vec<JobOutcome<'_>> = stream::iter(jobs)
            .map(|(index, executor, is_instance)| self.run_job(index, executor, is_instance, collected_at))
            .buffered(self.concurrency)
            .collect()
            .await;

        let instance_jobs = outcomes.iter().filter(|o| o.is_instance).count();
        let mut instance_up = outcomes.iter().any(|o| o.is_instance && o.result.is_ok());
        if instance_jobs == 0 {
            instance_up = self.ping_instance().await;
        }
        if !instance_up {
            let state = self.instance.state();
            warn!(
                database = self.instance.database(),
                status = ?state.status,
                last_error = state.last_error.as_deref().unwrap_or("none"),
                "PostgreSQL instance is down"
            );
        }

        // Any unreachable target database also reports the server as down
        let unreachable: Vec<&str> = outcomes
            .iter()
            .filter(|o| !o.is_instance && o.result.as_ref().is_err_and(QueryError::is_connection))
            .map(|o| o.database.as_str())
            .collect();
        if !unreachable.is_empty() {
            warn!(databases = ?unreachable, "Target databases are unreachable");
        }
        let database_up = instance_up && unreachable.is_empty();

        let mut samples = Vec::new();
        let mut errors = Vec::new();
        let mut report = CycleReport::default();

        for outcome in outcomes {
            let name = &outcome.query.name;
            match outcome.result {
                Ok(conversion) => {
                    if conversion.invalid_values > 0 {
                        *report.invalid_values.entry(name.clone()).or_default() +=
                            conversion.invalid_values;
                    }
                    for err in &conversion.serialization_errors {
                        warn!(query = %name, error = %err, "Dropping sample");
                    }
                    report.serialization_errors += conversion.serialization_errors.len() as u64;
                    if conversion.filtered_rows > 0 {
                        trace!(query = %name, rows = conversion.filtered_rows, "Filtered rows of excluded databases");
                    }
                    samples.extend(conversion.samples);
                }
                Err(err) => {
                    warn!(query = %name, database = %outcome.database, error = %err, "Query failed");
                    *report.query_errors.entry(name.clone()).or_default() += 1;
                    report.failed_queries += 1;
                    errors.push(format!("{} on {}: {}", name, outcome.database, err));
                }
            }
        }

        let (mut samples, duplicates) = dedupe_samples(samples);
        if duplicates > 0 {
            debug!(duplicates, "Replaced samples with a repeated label set");
        }

        samples.push(MetricSample::new(
            PG_UP_METRIC,
            if database_up { 1.0 } else { 0.0 },
            collected_at,
        ));

        report.duration = started.elapsed();
        let meta = CollectionMeta {
            collected_at,
            duration: report.duration,
            success: errors.is_empty(),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            database_up,
            queries_failed: report.failed_queries,
        };

        let sample_count = samples.len();
        self.stats.record(&report);
        self.store
            .publish(Snapshot::new(samples, meta.clone(), Arc::clone(&self.descriptors)));

        debug!(
            samples = sample_count,
            failed = meta.queries_failed,
            duration_ms = meta.duration.as_millis() as u64,
            "Published snapshot"
        );

        Ok(meta)
    }

    /// Run cycles on a fixed interval until shutdown is signalled.
    ///
    /// Ticks missed by an overrunning cycle are skipped. On shutdown an
    /// in-flight cycle is abandoned without publishing.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.interval.as_secs_f64(),
            queries = self.catalog.len(),
            databases = self.databases.len(),
            "Collector started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                result = self.collect_once() => match result {
                    Ok(meta) if meta.success => {
                        debug!(duration_ms = meta.duration.as_millis() as u64, "Collection succeeded");
                    }
                    Ok(meta) => {
                        warn!(
                            failed = meta.queries_failed,
                            database_up = meta.database_up,
                            "Collection finished with errors"
                        );
                    }
                    Err(e) => error!(error = %e, "Collection did not start"),
                },
                _ = shutdown.changed() => {
                    info!("Shutdown requested, abandoning in-flight collection");
                    break;
                }
            }
        }

        info!("Collector stopped");
    }

    /// Every (query index, target) pair in catalog order.
    fn jobs(&self) -> Vec<(usize, Arc<E>, bool)> {
        let mut jobs = Vec::new();
        for (index, query) in self.catalog.queries().iter().enumerate() {
            match query.scope {
                QueryScope::PerDatabase => {
                    for database in &self.databases {
                        jobs.push((index, Arc::clone(database), false));
                    }
                }
                QueryScope::Instance => jobs.push((index, Arc::clone(&self.instance), true)),
            }
        }
        jobs
    }

    async fn run_job(
        &self,
        index: usize,
        executor: Arc<E>,
        is_instance: bool,
        timestamp: i64,
    ) -> JobOutcome<'_> {
        let query = &self.catalog.queries()[index];
        let started = Instant::now();
        let result = match tokio::time::timeout(self.query_timeout, executor.fetch(&query.sql)).await {
            Ok(Ok(rows)) => convert_rows(query, &rows, &self.database_filter, timestamp),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(QueryError::Timeout(self.query_timeout)),
        };

        trace!(
            query = %query.name,
            database = executor.database(),
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query finished"
        );

        JobOutcome {
            query,
            database: executor.database().to_string(),
            is_instance,
            result,
        }
    }

    async fn ping_instance(&self) -> bool {
        matches!(
            tokio::time::timeout(self.query_timeout, self.instance.fetch(PING_SQL)).await,
            Ok(Ok(_))
        )
    }
}

/// Turn result rows into samples, one per value column per row.
///
/// A missing column fails the whole query. Null and non-numeric values are
/// skipped and counted; non-finite values are dropped as serialization errors.
/// Rows naming a database outside a non-empty `database_filter` are dropped
/// when the query declares a database column.
fn convert_rows(
    query: &QueryDefinition,
    rows: &[ResultRow],
    database_filter: &[String],
    timestamp: i64,
) -> Result<Conversion, QueryError> {
    let mut conversion = Conversion {
        samples: Vec::with_capacity(rows.len() * query.value_columns.len()),
        ..Conversion::default()
    };

    let database_column = query
        .database_column
        .as_deref()
        .filter(|_| !database_filter.is_empty());

    for row in rows {
        if let Some(column) = database_column {
            let database = row
                .get(column)
                .ok_or_else(|| QueryError::MissingColumn(column.to_string()))?
                .as_label();
            if !database_filter.contains(&database) {
                conversion.filtered_rows += 1;
                continue;
            }
        }

        let mut labels = Vec::with_capacity(query.label_columns.len());
        for (column, label) in query.labels() {
            let cell = row
                .get(column)
                .ok_or_else(|| QueryError::MissingColumn(column.to_string()))?;
            labels.push((label, cell.as_label()));
        }

        for value_column in &query.value_columns {
            let cell = row
                .get(&value_column.column)
                .ok_or_else(|| QueryError::MissingColumn(value_column.column.clone()))?;

            let Some(value) = cell.as_f64() else {
                trace!(
                    query = %query.name,
                    column = %value_column.column,
                    "Skipping null or non-numeric value"
                );
                conversion.invalid_values += 1;
                continue;
            };

            if !value.is_finite() {
                conversion.serialization_errors.push(SerializationError::NonFinite {
                    metric: value_column.metric_name.clone(),
                    value,
                });
                continue;
            }

            let sample = labels.iter().fold(
                MetricSample::new(&value_column.metric_name, value, timestamp),
                |sample, (label, label_value)| sample.with_label(*label, label_value.clone()),
            );
            conversion.samples.push(sample);
        }
    }

    Ok(conversion)
}

/// Keep one sample per metric name and label set.
///
/// A repeated series keeps its first position and takes the later value.
/// Returns the number of replaced samples.
fn dedupe_samples(samples: Vec<MetricSample>) -> (Vec<MetricSample>, usize) {
    let mut positions: HashMap<(String, BTreeMap<String, String>), usize> =
        HashMap::with_capacity(samples.len());
    let mut unique: Vec<MetricSample> = Vec::with_capacity(samples.len());
    let mut duplicates = 0;

    for sample in samples {
        match positions.entry((sample.metric_name.clone(), sample.labels.clone())) {
            Entry::Occupied(entry) => {
                unique[*entry.get()] = sample;
                duplicates += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(unique.len());
                unique.push(sample);
            }
        }
    }

    (unique, duplicates)
}
