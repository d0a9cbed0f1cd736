//! Append-only time-series store of feature values.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::primitive::{Primitive, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureValue {
    pub fqn: String,
    /// Encoded entity keys.
    pub keys: String,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Set,
    Append,
    Incr,
    Update,
}

/// A state change expressed against the latest stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteInstruction {
    pub op: WriteOp,
    pub fqn: String,
    pub keys: String,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("{fqn} expects {expected}, got {actual}")]
    TypeMismatch {
        fqn: String,
        expected: Primitive,
        actual: String,
    },
    #[error("cannot append to scalar feature {fqn}")]
    AppendToScalar { fqn: String },
    #[error("cannot increment non-numeric feature {fqn}")]
    IncrNonNumeric { fqn: String },
    #[error("integer overflow incrementing {fqn}")]
    Overflow { fqn: String },
}

type SeriesKey = (String, String);

/// Records per `(fqn, encoded keys)`, each series ordered by timestamp.
#[derive(Debug, Default)]
pub struct TimeSeriesStore {
    series: RwLock<HashMap<SeriesKey, Vec<FeatureValue>>>,
}

fn insert_ordered(series: &mut Vec<FeatureValue>, record: FeatureValue) {
    // Equal timestamps go after existing ones so the later append reads as more recent.
    let at = series.partition_point(|r| r.timestamp <= record.timestamp);
    series.insert(at, record);
}

fn latest_at<'s>(
    series: Option<&'s Vec<FeatureValue>>,
    as_of: DateTime<Utc>,
    window: Option<Duration>,
) -> impl Iterator<Item = &'s FeatureValue> {
    let records = series.map(Vec::as_slice).unwrap_or_default();
    let end = records.partition_point(|r| r.timestamp <= as_of);
    let floor = window.map(|w| as_of - w);
    records[..end]
        .iter()
        .rev()
        .take_while(move |r| floor.map_or(true, |f| r.timestamp >= f))
}

impl TimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds records; never replaces anything already stored.
    pub fn append(&self, records: Vec<FeatureValue>) -> usize {
        let count = records.len();
        if count == 0 {
            return 0;
        }
        let mut series = self
            .series
            .write()
            .expect("time-series store lock should not be poisoned");
        for record in records {
            let key = (record.fqn.clone(), record.keys.clone());
            insert_ordered(series.entry(key).or_default(), record);
        }
        debug!(
            component = "store",
            event = "store.append",
            records = count,
            "appended records"
        );
        count
    }

    /// Up to `limit` records with `ts <= as_of` (and `ts >= as_of - window`), newest first.
    pub fn query(
        &self,
        fqn: &str,
        keys: &str,
        as_of: DateTime<Utc>,
        window: Option<Duration>,
        limit: usize,
    ) -> Vec<FeatureValue> {
        let series = self
            .series
            .read()
            .expect("time-series store lock should not be poisoned");
        latest_at(
            series.get(&(fqn.to_string(), keys.to_string())),
            as_of,
            window,
        )
        .take(limit)
        .cloned()
        .collect()
    }

    /// Every record of the given streams, ordered by fqn, keys, then time.
    pub fn records_for(&self, fqns: &[String]) -> Vec<FeatureValue> {
        let series = self
            .series
            .read()
            .expect("time-series store lock should not be poisoned");
        let mut keys: Vec<&SeriesKey> = series
            .keys()
            .filter(|(fqn, _)| fqns.contains(fqn))
            .collect();
        keys.sort();
        keys.into_iter()
            .flat_map(|key| series[key].iter().cloned())
            .collect()
    }

    pub fn fqns(&self) -> BTreeSet<String> {
        let series = self
            .series
            .read()
            .expect("time-series store lock should not be poisoned");
        series.keys().map(|(fqn, _)| fqn.clone()).collect()
    }

    pub fn len(&self) -> usize {
        let series = self
            .series
            .read()
            .expect("time-series store lock should not be poisoned");
        series.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a write instruction as a new appended record.
    ///
    /// `Append` and `Incr` build on the latest value that is still valid
    /// under `staleness` (zero means always valid). The read and the append
    /// happen under one lock.
    pub fn apply(
        &self,
        instruction: WriteInstruction,
        primitive: Primitive,
        staleness: Duration,
    ) -> Result<FeatureValue, StoreError> {
        let WriteInstruction {
            op,
            fqn,
            keys,
            timestamp,
            value,
        } = instruction;
        let op = match op {
            WriteOp::Update if primitive.is_scalar() => WriteOp::Set,
            WriteOp::Update => WriteOp::Append,
            other => other,
        };

        let mut series = self
            .series
            .write()
            .expect("time-series store lock should not be poisoned");
        let key = (fqn.clone(), keys.clone());
        let window = (staleness > Duration::zero()).then_some(staleness);
        let previous = latest_at(series.get(&key), timestamp, window)
            .next()
            .map(|r| r.value.clone());

        let mismatch = |expected: Primitive, actual: &Value| StoreError::TypeMismatch {
            fqn: fqn.clone(),
            expected,
            actual: actual
                .primitive()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "empty list".to_string()),
        };

        let value = match op {
            WriteOp::Set | WriteOp::Update => value
                .conform_to(primitive)
                .map_err(|v| mismatch(primitive, &v))?,
            WriteOp::Append => {
                let element = primitive
                    .element()
                    .ok_or_else(|| StoreError::AppendToScalar { fqn: fqn.clone() })?;
                let item = value.conform_to(element).map_err(|v| mismatch(element, &v))?;
                let mut items = match previous {
                    Some(Value::List(items)) => items,
                    _ => Vec::new(),
                };
                items.push(item);
                Value::List(items)
            }
            WriteOp::Incr => {
                if !primitive.is_numeric() {
                    return Err(StoreError::IncrNonNumeric { fqn: fqn.clone() });
                }
                let delta = value
                    .conform_to(primitive)
                    .map_err(|v| mismatch(primitive, &v))?;
                match (previous, delta) {
                    (Some(Value::Int(a)), Value::Int(b)) => Value::Int(
                        a.checked_add(b)
                            .ok_or_else(|| StoreError::Overflow { fqn: fqn.clone() })?,
                    ),
                    (Some(prev), delta) => Value::Float(
                        prev.as_f64().unwrap_or(0.0) + delta.as_f64().unwrap_or(0.0),
                    ),
                    (None, delta) => delta,
                }
            }
        };

        let record = FeatureValue {
            fqn,
            keys,
            timestamp,
            value,
        };
        insert_ordered(series.entry(key).or_default(), record.clone());
        debug!(
            component = "store",
            event = "store.apply",
            fqn = %record.fqn,
            op = ?op,
            "applied write instruction"
        );
        Ok(record)
    }
}
