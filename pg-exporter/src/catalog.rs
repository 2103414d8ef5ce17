//! Query catalog: the immutable set of queries run by every collection cycle.
//!
//! A catalog is loaded once at startup from the exporter configuration (inline
//! `queries`), from a separate JSON5 file (`queries_file`), or from the
//! built-in default. Any problem is a [`ConfigError`] and stops the exporter
//! before it starts serving.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mapping::{build_metric_name, is_valid_metric_name, sanitize_label_name};
use crate::sample::{MetricDescriptor, MetricType};

/// Metric names produced by the exporter itself.
pub const RESERVED_METRIC_PREFIX: &str = "exporter_";
pub const PG_UP_METRIC: &str = "pg_up";

const BUILTIN_CATALOG: &str = include_str!("../queries/default.json5");

/// Which databases a query runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryScope {
    /// Once, against the database named in the data source URL.
    #[default]
    Instance,
    /// Once per database listed in `include_databases`. Skipped when none
    /// are listed.
    PerDatabase,
}

/// Query definition as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Query name, also the default metric name prefix.
    pub name: String,

    /// SQL text. Must be a single read-only statement.
    pub sql: String,

    /// "gauge" or "counter" (default: "gauge").
    #[serde(default = "default_metric_type")]
    pub metric_type: String,

    #[serde(default)]
    pub scope: QueryScope,

    /// Columns turned into labels, in order.
    #[serde(default)]
    pub label_columns: Vec<String>,

    /// Columns turned into samples, in order.
    #[serde(default)]
    pub value_columns: Vec<ValueColumnConfig>,

    /// Declared result columns. Defaults to label and value columns.
    #[serde(default)]
    pub columns: Option<Vec<String>>,

    /// Help text used for value columns without their own.
    #[serde(default)]
    pub help: Option<String>,

    /// Label column holding a database name. When `include_databases` is
    /// set, rows naming any other database are dropped.
    #[serde(default)]
    pub database_column: Option<String>,
}

fn default_metric_type() -> String {
    "gauge".to_string()
}

/// A value column, either bare (`"numbackends"`) or detailed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueColumnConfig {
    Column(String),
    Detailed {
        column: String,
        /// Full metric name (default: `{query}_{column}`).
        #[serde(default)]
        metric: Option<String>,
        #[serde(default)]
        help: Option<String>,
    },
}

impl ValueColumnConfig {
    fn column(&self) -> &str {
        match self {
            ValueColumnConfig::Column(column) => column,
            ValueColumnConfig::Detailed { column, .. } => column,
        }
    }
}

/// A validated value column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueColumn {
    pub column: String,
    pub metric_name: String,
    pub help: String,
}

/// A validated query, immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDefinition {
    pub name: String,
    pub sql: String,
    pub value_columns: Vec<ValueColumn>,
    pub label_columns: Vec<String>,
    pub metric_type: MetricType,
    pub scope: QueryScope,
    pub database_column: Option<String>,
    label_names: Vec<String>,
}

impl QueryDefinition {
    /// `(column, label name)` pairs in declaration order.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.label_columns
            .iter()
            .zip(&self.label_names)
            .map(|(column, label)| (column.as_str(), label.as_str()))
    }

    fn from_config(config: &QueryConfig) -> Result<Self, ConfigError> {
        let name = config.name.trim().to_string();
        if !is_valid_metric_name(&name) {
            return Err(ConfigError::query(
                &config.name,
                "name must match [a-zA-Z_:][a-zA-Z0-9_:]*",
            ));
        }

        validate_sql(&config.sql).map_err(|msg| ConfigError::query(&name, msg))?;

        let metric_type = MetricType::parse(&config.metric_type).ok_or_else(|| {
            ConfigError::query(
                &name,
                format!(
                    "unrecognized metric_type '{}' (expected gauge or counter)",
                    config.metric_type
                ),
            )
        })?;

        if config.value_columns.is_empty() {
            return Err(ConfigError::query(&name, "value_columns must not be empty"));
        }

        // Every column may appear once across labels and values
        let mut seen: HashSet<&str> = HashSet::new();
        let all_columns = config
            .label_columns
            .iter()
            .map(String::as_str)
            .chain(config.value_columns.iter().map(ValueColumnConfig::column));
        for column in all_columns {
            if column.trim().is_empty() {
                return Err(ConfigError::query(&name, "column names must not be empty"));
            }
            if !seen.insert(column) {
                return Err(ConfigError::query(
                    &name,
                    format!("column '{}' is declared more than once", column),
                ));
            }
        }

        if let Some(declared) = &config.columns {
            let mut declared_set = HashSet::new();
            for column in declared {
                if !declared_set.insert(column.as_str()) {
                    return Err(ConfigError::query(
                        &name,
                        format!("result column '{}' is declared more than once", column),
                    ));
                }
            }
            let used = config
                .label_columns
                .iter()
                .map(String::as_str)
                .chain(config.value_columns.iter().map(ValueColumnConfig::column));
            if let Some(missing) = used.into_iter().find(|c| !declared_set.contains(c)) {
                return Err(ConfigError::query(
                    &name,
                    format!("column '{}' is not one of the declared result columns", missing),
                ));
            }
        }

        if let Some(column) = &config.database_column {
            if !config.label_columns.contains(column) {
                return Err(ConfigError::query(
                    &name,
                    format!("database_column '{}' must be one of the label columns", column),
                ));
            }
        }

        let mut label_names = Vec::with_capacity(config.label_columns.len());
        for column in &config.label_columns {
            let label = sanitize_label_name(column);
            if label_names.contains(&label) {
                return Err(ConfigError::query(
                    &name,
                    format!("label '{}' is produced by more than one column", label),
                ));
            }
            label_names.push(label);
        }

        let mut value_columns = Vec::with_capacity(config.value_columns.len());
        for value in &config.value_columns {
            let (column, metric, help) = match value {
                ValueColumnConfig::Column(column) => (column, None, None),
                ValueColumnConfig::Detailed {
                    column,
                    metric,
                    help,
                } => (column, metric.as_ref(), help.as_ref()),
            };

            let metric_name = match metric {
                Some(metric) => metric.clone(),
                None => build_metric_name(&name, column),
            };
            if !is_valid_metric_name(&metric_name) {
                return Err(ConfigError::query(
                    &name,
                    format!("invalid metric name '{}'", metric_name),
                ));
            }
            if metric_name == PG_UP_METRIC || metric_name.starts_with(RESERVED_METRIC_PREFIX) {
                return Err(ConfigError::query(
                    &name,
                    format!("metric name '{}' is reserved for the exporter", metric_name),
                ));
            }

            let help = help
                .or(config.help.as_ref())
                .cloned()
                .unwrap_or_else(|| format!("Column {} of query {}", column, name));

            value_columns.push(ValueColumn {
                column: column.clone(),
                metric_name,
                help,
            });
        }

        Ok(Self {
            name,
            sql: config.sql.trim().to_string(),
            value_columns,
            label_columns: config.label_columns.clone(),
            metric_type,
            scope: config.scope,
            database_column: config.database_column.clone(),
            label_names,
        })
    }
}

/// Where a catalog comes from.
#[derive(Debug, Clone)]
pub enum CatalogSource {
    Inline(Vec<QueryConfig>),
    File(PathBuf),
    Builtin,
}

/// Shape of a standalone catalog file.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    queries: Vec<QueryConfig>,
}

/// Ordered, validated query definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCatalog {
    queries: Vec<QueryDefinition>,
}

/// Catalog handle shared by every collection cycle.
pub type SharedCatalog = Arc<QueryCatalog>;

impl QueryCatalog {
    /// Load and validate a catalog.
    pub fn load(source: &CatalogSource) -> Result<SharedCatalog, ConfigError> {
        let catalog = match source {
            CatalogSource::Inline(queries) => Self::from_configs(queries)?,
            CatalogSource::File(path) => Self::load_from_file(path)?,
            CatalogSource::Builtin => Self::builtin()?,
        };
        Ok(Arc::new(catalog))
    }

    /// Load a JSON5 catalog file of the form `{ queries: [...] }`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a JSON5 catalog document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile = json5::from_str(content)?;
        Self::from_configs(&file.queries)
    }

    /// The catalog shipped with the exporter.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::parse(BUILTIN_CATALOG)
    }

    /// Validate query configurations into a catalog.
    pub fn from_configs(configs: &[QueryConfig]) -> Result<Self, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::validation("query catalog is empty"));
        }

        let mut names = HashSet::new();
        let mut metric_types: HashMap<String, MetricType> = HashMap::new();
        let mut queries = Vec::with_capacity(configs.len());

        for config in configs {
            let query = QueryDefinition::from_config(config)?;

            if !names.insert(query.name.clone()) {
                return Err(ConfigError::query(&query.name, "query name is used more than once"));
            }

            let mut query_metrics = HashSet::new();
            for value in &query.value_columns {
                if !query_metrics.insert(value.metric_name.as_str()) {
                    return Err(ConfigError::query(
                        &query.name,
                        format!(
                            "metric '{}' is produced by more than one column",
                            value.metric_name
                        ),
                    ));
                }

                // Queries may share a metric name only with the same type
                match metric_types.get(&value.metric_name) {
                    Some(existing) if *existing != query.metric_type => {
                        return Err(ConfigError::query(
                            &query.name,
                            format!(
                                "metric '{}' is already defined as a {}",
                                value.metric_name, existing
                            ),
                        ));
                    }
                    Some(_) => {}
                    None => {
                        metric_types.insert(value.metric_name.clone(), query.metric_type);
                    }
                }
            }

            queries.push(query);
        }

        Ok(Self { queries })
    }

    pub fn queries(&self) -> &[QueryDefinition] {
        &self.queries
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Whether any query needs per-database connections.
    pub fn has_per_database_queries(&self) -> bool {
        self.queries.iter().any(|q| q.scope == QueryScope::PerDatabase)
    }

    /// HELP/TYPE descriptors for every metric the catalog can produce.
    ///
    /// When several queries share a metric name, the first one's help wins.
    pub fn descriptors(&self) -> HashMap<String, MetricDescriptor> {
        let mut descriptors = HashMap::new();
        for query in &self.queries {
            for value in &query.value_columns {
                descriptors
                    .entry(value.metric_name.clone())
                    .or_insert_with(|| {
                        MetricDescriptor::new(&value.metric_name, &value.help, query.metric_type)
                    });
            }
        }
        descriptors
    }
}

/// Lightweight structural check of a query's SQL text.
///
/// Rejects empty text, unbalanced quotes, comments or parentheses, more than
/// one statement, and anything that is not a read-only query.
pub fn validate_sql(sql: &str) -> Result<(), String> {
    let sql = sql.trim();
    if sql.is_empty() {
        return Err("sql must not be empty".to_string());
    }

    #[derive(PartialEq)]
    enum State {
        Code,
        SingleQuote,
        DoubleQuote,
        LineComment,
        BlockComment,
    }

    let chars: Vec<char> = sql.chars().collect();
    let mut state = State::Code;
    let mut depth: i32 = 0;
    let mut code = String::with_capacity(sql.len());
    let mut statement_ended = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match state {
            State::Code => {
                if statement_ended && !c.is_whitespace() {
                    if c == '-' && next == Some('-') {
                        state = State::LineComment;
                        i += 2;
                        continue;
                    }
                    if c == '/' && next == Some('*') {
                        state = State::BlockComment;
                        i += 2;
                        continue;
                    }
                    return Err("sql must contain a single statement".to_string());
                }
                match c {
                    '\'' => state = State::SingleQuote,
                    '"' => state = State::DoubleQuote,
                    '-' if next == Some('-') => {
                        state = State::LineComment;
                        code.push(' ');
                        i += 2;
                        continue;
                    }
                    '/' if next == Some('*') => {
                        state = State::BlockComment;
                        code.push(' ');
                        i += 2;
                        continue;
                    }
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth < 0 {
                            return Err("unbalanced parentheses".to_string());
                        }
                    }
                    ';' => statement_ended = true,
                    _ => {}
                }
                if !statement_ended {
                    code.push(c);
                }
            }
            State::SingleQuote => {
                if c == '\'' {
                    if next == Some('\'') {
                        i += 2;
                        continue;
                    }
                    state = State::Code;
                }
            }
            State::DoubleQuote => {
                if c == '"' {
                    state = State::Code;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = State::Code;
                    i += 2;
                    continue;
                }
            }
        }
        i += 1;
    }

    match state {
        State::SingleQuote => return Err("unterminated string literal".to_string()),
        State::DoubleQuote => return Err("unterminated quoted identifier".to_string()),
        State::BlockComment => return Err("unterminated block comment".to_string()),
        State::Code | State::LineComment => {}
    }
    if depth != 0 {
        return Err("unbalanced parentheses".to_string());
    }

    let first_word: String = code
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    match first_word.as_str() {
        "SELECT" | "WITH" | "TABLE" | "VALUES" => Ok(()),
        "" => Err("sql contains no statement".to_string()),
        other => Err(format!(
            "sql must be a read-only query, found '{}' statement",
            other
        )),
    }
}
