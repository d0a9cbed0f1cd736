//! Read-only specifications for data sources, features and models.

use std::fmt;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;

use crate::duration::serde_duration;
use crate::frame::EventFrame;
use crate::primitive::Primitive;
use crate::program::Program;
use crate::selector::DEFAULT_NAMESPACE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AggregationFunction {
    Sum,
    Avg,
    Max,
    Min,
    Count,
    DistinctCount,
    ApproxDistinctCount,
}

impl AggregationFunction {
    pub const ALL: [AggregationFunction; 7] = [
        Self::Sum,
        Self::Avg,
        Self::Max,
        Self::Min,
        Self::Count,
        Self::DistinctCount,
        Self::ApproxDistinctCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Max => "max",
            Self::Min => "min",
            Self::Count => "count",
            Self::DistinctCount => "distinct_count",
            Self::ApproxDistinctCount => "approx_distinct_count",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sum" => Some(Self::Sum),
            "avg" | "mean" => Some(Self::Avg),
            "max" => Some(Self::Max),
            "min" => Some(Self::Min),
            "count" => Some(Self::Count),
            "distinct_count" => Some(Self::DistinctCount),
            "approx_distinct_count" => Some(Self::ApproxDistinctCount),
            _ => None,
        }
    }

    /// sum/avg/max/min need numbers; counting works on anything.
    pub fn supports(self, primitive: Primitive) -> bool {
        match self {
            Self::Sum | Self::Avg | Self::Max | Self::Min => primitive.is_numeric(),
            Self::Count | Self::DistinctCount | Self::ApproxDistinctCount => true,
        }
    }
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggrSpec {
    pub funcs: Vec<AggregationFunction>,
    #[serde(serialize_with = "serde_duration::serialize")]
    pub over: Duration,
    #[serde(serialize_with = "serde_duration::serialize")]
    pub granularity: Duration,
}

impl AggrSpec {
    /// Keeps the first occurrence of every function.
    pub fn new(funcs: Vec<AggregationFunction>, over: Duration, granularity: Duration) -> Self {
        let mut unique = Vec::with_capacity(funcs.len());
        for f in funcs {
            if !unique.contains(&f) {
                unique.push(f);
            }
        }
        Self {
            funcs: unique,
            over,
            granularity,
        }
    }

    pub fn has(&self, func: AggregationFunction) -> bool {
        self.funcs.contains(&func)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeepPrevious {
    pub versions: u32,
    #[serde(serialize_with = "serde_duration::serialize")]
    pub over: Duration,
}

impl KeepPrevious {
    /// Negative version counts are taken as positive; zero means no history.
    pub fn new(versions: i64, over: Duration) -> Option<Self> {
        let versions = u32::try_from(versions.unsigned_abs()).ok()?;
        if versions == 0 {
            return None;
        }
        Some(Self { versions, over })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DataSourceSpec {
    pub name: String,
    pub namespace: String,
    pub description: Option<String>,
    pub keys: Vec<String>,
    pub timestamp: Option<String>,
    pub kind: Option<String>,
    #[serde(skip)]
    pub frame: Option<Arc<EventFrame>>,
}

impl DataSourceSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: String::new(),
            description: None,
            keys: Vec::new(),
            timestamp: None,
            kind: None,
            frame: None,
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_timestamp(mut self, column: &str) -> Self {
        self.timestamp = Some(column.to_string());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn with_frame(mut self, frame: EventFrame) -> Self {
        self.frame = Some(Arc::new(frame));
        self
    }

    pub fn fqn(&self) -> String {
        format!("{}.{}", self.namespace(), self.name)
    }

    /// Empty until registration fills in the session's default.
    pub fn namespace(&self) -> &str {
        or_default_namespace(&self.namespace)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureSpec {
    pub name: String,
    pub namespace: String,
    pub description: Option<String>,
    pub keys: Vec<String>,
    pub primitive: Primitive,
    #[serde(serialize_with = "serde_duration::serialize_opt")]
    pub freshness: Option<Duration>,
    #[serde(serialize_with = "serde_duration::serialize_opt")]
    pub staleness: Option<Duration>,
    #[serde(serialize_with = "serde_duration::serialize_opt")]
    pub timeout: Option<Duration>,
    pub keep_previous: Option<KeepPrevious>,
    pub aggr: Option<AggrSpec>,
    pub data_source: Option<String>,
    pub program: Arc<Program>,
}

impl FeatureSpec {
    /// Name and primitive default to the program's function name and return type.
    pub fn new(program: Program) -> Self {
        Self {
            name: program.name().to_string(),
            namespace: String::new(),
            description: None,
            keys: Vec::new(),
            primitive: program.primitive(),
            freshness: None,
            staleness: None,
            timeout: None,
            keep_previous: None,
            aggr: None,
            data_source: None,
            program: Arc::new(program),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_data_source(mut self, selector: &str) -> Self {
        self.data_source = Some(selector.to_string());
        self
    }

    /// `invalid_after` is the staleness; it defaults to the freshness target.
    pub fn with_freshness(mut self, target: Duration, invalid_after: Option<Duration>) -> Self {
        self.freshness = Some(target);
        self.staleness = Some(invalid_after.unwrap_or(target));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_aggregation(mut self, aggr: AggrSpec) -> Self {
        self.aggr = Some(aggr);
        self
    }

    pub fn with_keep_previous(mut self, keep_previous: KeepPrevious) -> Self {
        self.keep_previous = Some(keep_previous);
        self
    }

    pub fn fqn(&self) -> String {
        format!("{}.{}", self.namespace(), self.name)
    }

    /// Empty until registration fills in the session's default.
    pub fn namespace(&self) -> &str {
        or_default_namespace(&self.namespace)
    }

    /// Aggregated features refresh at their granularity.
    pub fn effective_freshness(&self) -> Option<Duration> {
        match &self.aggr {
            Some(aggr) if !aggr.granularity.is_zero() => Some(aggr.granularity),
            _ => self.freshness,
        }
    }

    /// Zero means values never go stale.
    pub fn effective_staleness(&self) -> Duration {
        match (self.staleness, &self.aggr) {
            (Some(staleness), _) => staleness,
            (None, Some(aggr)) => aggr.over,
            (None, None) => Duration::zero(),
        }
    }

    /// Stream FQNs this feature writes: one per aggregation function, or the base FQN.
    pub fn output_fqns(&self) -> Vec<String> {
        let base = self.fqn();
        match &self.aggr {
            Some(aggr) => aggr.funcs.iter().map(|f| format!("{base}+{f}")).collect(),
            None => vec![base],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSpec {
    pub name: String,
    pub namespace: String,
    pub description: Option<String>,
    pub keys: Vec<String>,
    pub features: Vec<String>,
    pub labels: Vec<String>,
    pub key_feature: Option<String>,
    #[serde(serialize_with = "serde_duration::serialize_opt")]
    pub freshness: Option<Duration>,
    #[serde(serialize_with = "serde_duration::serialize_opt")]
    pub staleness: Option<Duration>,
}

impl ModelSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: String::new(),
            description: None,
            keys: Vec::new(),
            features: Vec::new(),
            labels: Vec::new(),
            key_feature: None,
            freshness: None,
            staleness: None,
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_features(mut self, selectors: &[&str]) -> Self {
        self.features = selectors.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_labels(mut self, selectors: &[&str]) -> Self {
        self.labels = selectors.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_key_feature(mut self, selector: &str) -> Self {
        self.key_feature = Some(selector.to_string());
        self
    }

    pub fn with_freshness(mut self, target: Duration, invalid_after: Option<Duration>) -> Self {
        self.freshness = Some(target);
        self.staleness = Some(invalid_after.unwrap_or(target));
        self
    }

    pub fn fqn(&self) -> String {
        format!("{}.{}", self.namespace(), self.name)
    }

    /// Empty until registration fills in the session's default.
    pub fn namespace(&self) -> &str {
        or_default_namespace(&self.namespace)
    }

    /// The spine selector: the declared key feature, else the first input feature.
    pub fn spine(&self) -> Option<&str> {
        self.key_feature
            .as_deref()
            .or_else(|| self.features.first().map(String::as_str))
    }

    /// Features then labels, duplicates removed, in declaration order.
    pub fn referenced(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for s in self.features.iter().chain(self.labels.iter()) {
            if !out.contains(&s.as_str()) {
                out.push(s.as_str());
            }
        }
        out
    }
}

fn or_default_namespace(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}
