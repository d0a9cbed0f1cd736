//! Point-in-time join of feature streams into a training table.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{Map, Number, Value as JsonValue};
use tracing::info;

use crate::error::EngineError;
use crate::frame::{parse_timestamp, FrameError};
use crate::primitive::Value;
use crate::registry::Registry;
use crate::selector::Selector;
use crate::spec::ModelSpec;
use crate::store::{FeatureValue, TimeSeriesStore};

pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const KEYS_COLUMN: &str = "keys";

/// One row per spine event: timestamp, encoded keys, then one cell per feature.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingTable {
    columns: Vec<String>,
    rows: Vec<Vec<Option<Value>>>,
}

impl TrainingTable {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<Value>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<Vec<Option<&Value>>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row[idx].as_ref()).collect())
    }

    /// Writes a headed CSV; nulls are empty cells.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), FrameError> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(
                row.iter()
                    .map(|cell| cell.as_ref().map(Value::to_key_string).unwrap_or_default()),
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_json_rows(&self) -> Vec<JsonValue> {
        self.rows
            .iter()
            .map(|row| {
                let object: Map<String, JsonValue> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(|cell| cell.as_ref().map_or(JsonValue::Null, to_json)))
                    .collect();
                JsonValue::Object(object)
            })
            .collect()
    }
}

fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Str(s) => JsonValue::String(s.clone()),
        Value::Int(i) => JsonValue::from(*i),
        Value::Float(f) => Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number),
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Timestamp(ts) => {
            JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        Value::List(items) => JsonValue::Array(items.iter().map(to_json).collect()),
    }
}

/// Parses a join bound. `""` and `"-1"` mean unbounded; naive times are UTC.
pub fn parse_time_bound(raw: &str) -> Result<Option<DateTime<Utc>>, EngineError> {
    match raw.trim() {
        "" | "-1" => Ok(None),
        other => parse_timestamp(other)
            .map(Some)
            .ok_or_else(|| EngineError::InvalidTimeBound(raw.to_string())),
    }
}

struct JoinColumn {
    name: String,
    storage_fqn: String,
    /// Zero joins without a tolerance.
    tolerance: Duration,
}

/// What `historical_get` reads: the spine stream and the columns joined onto it.
struct JoinPlan {
    spine: JoinColumn,
    others: Vec<JoinColumn>,
}

impl JoinPlan {
    fn new(model: &ModelSpec, registry: &Registry) -> Result<Self, EngineError> {
        let column = |raw: &str| -> Result<JoinColumn, EngineError> {
            let selector = Selector::parse(raw, model.namespace())?;
            let (spec, canonical) = registry.check_selector(&selector)?;
            Ok(JoinColumn {
                name: canonical.to_string(),
                storage_fqn: canonical.storage_fqn(),
                tolerance: spec.effective_staleness(),
            })
        };

        let spine_raw = model.spine().ok_or_else(|| EngineError::NoDataFound {
            model: model.fqn(),
        })?;
        let spine = column(spine_raw)?;
        let mut others: Vec<JoinColumn> = Vec::new();
        for raw in model.referenced() {
            let col = column(raw)?;
            if col.name != spine.name && others.iter().all(|o| o.name != col.name) {
                others.push(col);
            }
        }
        Ok(Self { spine, others })
    }

    fn fqns(&self) -> Vec<String> {
        std::iter::once(&self.spine)
            .chain(&self.others)
            .map(|c| c.storage_fqn.clone())
            .collect()
    }
}

type AsOfIndex = HashMap<String, BTreeMap<DateTime<Utc>, Value>>;

/// Builds the training table for `model` from the store.
///
/// Spine rows come from the key feature. Every other column takes, per
/// entity, the latest record at or before the spine timestamp that is
/// within that feature's staleness.
pub fn historical_get(
    model: &ModelSpec,
    registry: &Registry,
    store: &TimeSeriesStore,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> Result<TrainingTable, EngineError> {
    if let (Some(since), Some(until)) = (since, until) {
        if since > until {
            return Err(EngineError::SinceAfterUntil {
                since: since.to_rfc3339(),
                until: until.to_rfc3339(),
            });
        }
    }
    let no_data = || EngineError::NoDataFound {
        model: model.fqn(),
    };

    let plan = JoinPlan::new(model, registry)?;
    let records = store.records_for(&plan.fqns());
    if records.is_empty() {
        return Err(no_data());
    }
    let in_range = |r: &FeatureValue| {
        since.map_or(true, |s| r.timestamp >= s) && until.map_or(true, |u| r.timestamp <= u)
    };

    let mut spine: Vec<&FeatureValue> = Vec::new();
    let mut indexes: HashMap<&str, AsOfIndex> = HashMap::new();
    for record in records.iter().filter(|r| in_range(*r)) {
        if record.fqn == plan.spine.storage_fqn {
            spine.push(record);
        }
        // Later appends at an equal timestamp overwrite earlier ones.
        indexes
            .entry(record.fqn.as_str())
            .or_default()
            .entry(record.keys.clone())
            .or_default()
            .insert(record.timestamp, record.value.clone());
    }
    if spine.is_empty() {
        return Err(no_data());
    }
    spine.sort_by_key(|r| r.timestamp);

    let mut columns = vec![
        TIMESTAMP_COLUMN.to_string(),
        KEYS_COLUMN.to_string(),
        plan.spine.name.clone(),
    ];
    columns.extend(plan.others.iter().map(|c| c.name.clone()));

    let rows: Vec<Vec<Option<Value>>> = spine
        .iter()
        .map(|event| {
            let mut row = Vec::with_capacity(columns.len());
            row.push(Some(Value::Timestamp(event.timestamp)));
            row.push(Some(Value::Str(event.keys.clone())));
            row.push(Some(event.value.clone()));
            for col in &plan.others {
                row.push(as_of(indexes.get(col.storage_fqn.as_str()), col, event));
            }
            row
        })
        .collect();

    info!(
        component = "historical",
        event = "historical.join.finish",
        model = %model.fqn(),
        spine = %plan.spine.name,
        columns = columns.len(),
        rows = rows.len()
    );
    Ok(TrainingTable { columns, rows })
}

fn as_of(index: Option<&AsOfIndex>, col: &JoinColumn, event: &FeatureValue) -> Option<Value> {
    let (ts, value) = index?
        .get(&event.keys)?
        .range(..=event.timestamp)
        .next_back()?;
    let fresh = col.tolerance <= Duration::zero() || event.timestamp - *ts <= col.tolerance;
    fresh.then(|| value.clone())
}
