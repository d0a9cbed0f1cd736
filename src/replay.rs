//! Replays historical events through a feature program.
//!
//! Each event row is evaluated as of its own timestamp, so dependency
//! lookups made by the program only see records at or before that time.
//! Aggregated features are then rolled up per entity over their trailing
//! window and written as one stream per aggregation function.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::aggregate::rolling_aggregate;
use crate::context::{Context, FeatureResolver};
use crate::error::EngineError;
use crate::frame::{cell_timestamp, EventFrame};
use crate::keys::{encode_keys, EntityKeys};
use crate::primitive::Value;
use crate::program::Row;
use crate::spec::{DataSourceSpec, FeatureSpec};
use crate::store::{FeatureValue, TimeSeriesStore};
use crate::windows::bucket_name;

/// Column names tried, in order, when a data source declares no timestamp column.
pub const TIMESTAMP_CANDIDATES: [&str; 11] = [
    "timestamp",
    "time",
    "date",
    "datetime",
    "ts",
    "event_timestamp",
    "event_at",
    "event_time",
    "event_date",
    "event_datetime",
    "event_ts",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Append the produced records to the store.
    pub persist: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self { persist: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub feature: String,
    pub input_rows: usize,
    pub dropped_rows: usize,
    pub output_records: usize,
    pub aggregated_buckets: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutput {
    pub records: Vec<FeatureValue>,
    pub report: ReplayReport,
}

/// First known timestamp column name, else the first column whose non-null cells are all timestamps.
pub fn detect_timestamp_column(frame: &EventFrame) -> Option<String> {
    if let Some(found) = TIMESTAMP_CANDIDATES
        .iter()
        .find(|name| frame.column_index(name).is_some())
    {
        return Some(found.to_string());
    }
    frame
        .columns()
        .iter()
        .find(|name| {
            frame.column(name).is_some_and(|mut cells| {
                let mut any = false;
                let all = cells.all(|cell| match cell {
                    None => true,
                    Some(value) => {
                        any = true;
                        matches!(value, Value::Timestamp(_))
                            || (matches!(value, Value::Str(_)) && cell_timestamp(value).is_some())
                    }
                });
                any && all
            })
        })
        .cloned()
}

struct Produced {
    keys: String,
    timestamp: DateTime<Utc>,
    value: Value,
}

/// Replays `source`'s historical events through `spec`'s program.
pub fn replay(
    spec: &FeatureSpec,
    source: &DataSourceSpec,
    resolver: &dyn FeatureResolver,
    store: &TimeSeriesStore,
    options: ReplayOptions,
) -> Result<ReplayOutput, EngineError> {
    let fqn = spec.fqn();
    let frame = source
        .frame
        .as_deref()
        .ok_or_else(|| EngineError::NoDataSource {
            feature: fqn.clone(),
        })?;

    let ts_column = source
        .timestamp
        .clone()
        .or_else(|| detect_timestamp_column(frame))
        .ok_or_else(|| EngineError::NoTimestampColumn {
            feature: fqn.clone(),
        })?;
    let ts_idx = column_index(frame, &fqn, &ts_column)?;

    let key_columns = if spec.keys.is_empty() {
        source.keys.clone()
    } else {
        spec.keys.clone()
    };
    if key_columns.is_empty() {
        return Err(EngineError::NoKeyColumns { feature: fqn });
    }
    let key_idx = key_columns
        .iter()
        .map(|k| column_index(frame, &fqn, k))
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        component = "replay",
        event = "replay.start",
        feature = %fqn,
        data_source = %source.fqn(),
        rows = frame.len(),
        timestamp_column = %ts_column,
        keys = ?key_columns,
        persist = options.persist
    );

    let mut dropped_rows = 0;
    let mut produced = Vec::with_capacity(frame.len());
    for (row_no, cells) in frame.rows().iter().enumerate() {
        let timestamp = cells[ts_idx]
            .as_ref()
            .and_then(cell_timestamp)
            .ok_or_else(|| EngineError::InvalidTimestamp {
                feature: fqn.clone(),
                column: ts_column.clone(),
                row: row_no,
            })?;

        let keys: EntityKeys = key_columns
            .iter()
            .zip(&key_idx)
            .map(|(name, idx)| {
                let rendered = cells[*idx]
                    .as_ref()
                    .map(Value::to_key_string)
                    .unwrap_or_default();
                (name.clone(), rendered)
            })
            .collect();

        let row: Row = frame
            .columns()
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != ts_idx && !key_idx.contains(idx))
            .map(|(idx, name)| (name.clone(), cells[idx].clone()))
            .collect();

        let ctx = Context::new(&fqn, keys.clone(), timestamp, resolver)?;
        let output = spec
            .program
            .call(&row, &ctx)
            .map_err(|source| EngineError::ProgramFailed {
                feature: fqn.clone(),
                source,
            })?;

        let Some(value) = output.value else {
            dropped_rows += 1;
            debug!(
                component = "replay",
                event = "replay.row_dropped",
                feature = %fqn,
                row = row_no
            );
            continue;
        };
        let value = value
            .conform_to(spec.primitive)
            .map_err(|actual| EngineError::TypeMismatch {
                feature: fqn.clone(),
                expected: spec.primitive,
                actual: actual
                    .primitive()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "empty list".to_string()),
            })?;

        let keys = output.keys.unwrap_or(keys);
        produced.push(Produced {
            keys: encode_keys(&key_columns, &keys)?,
            timestamp: output.timestamp.unwrap_or(timestamp),
            value,
        });
    }

    if produced.is_empty() {
        return Err(EngineError::NoDataProduced { feature: fqn });
    }

    let mut aggregated_buckets = 0;
    let records = match &spec.aggr {
        None => produced
            .into_iter()
            .map(|p| FeatureValue {
                fqn: fqn.clone(),
                keys: p.keys,
                timestamp: p.timestamp,
                value: p.value,
            })
            .collect(),
        Some(aggr) => {
            let mut groups: BTreeMap<String, Vec<(DateTime<Utc>, Value)>> = BTreeMap::new();
            for p in produced {
                groups.entry(p.keys).or_default().push((p.timestamp, p.value));
            }

            let mut buckets = BTreeSet::new();
            let mut records = Vec::new();
            for (keys, events) in groups {
                for row in rolling_aggregate(events, aggr.over, &aggr.funcs, spec.primitive) {
                    if aggr.granularity > Duration::zero() {
                        buckets.insert(bucket_name(row.timestamp, aggr.granularity)?);
                    }
                    for (func, value) in row.values {
                        records.push(FeatureValue {
                            fqn: format!("{fqn}+{func}"),
                            keys: keys.clone(),
                            timestamp: row.timestamp,
                            value,
                        });
                    }
                }
            }
            aggregated_buckets = buckets.len();
            records
        }
    };

    if options.persist {
        store.append(records.clone());
    }

    let report = ReplayReport {
        feature: fqn,
        input_rows: frame.len(),
        dropped_rows,
        output_records: records.len(),
        aggregated_buckets,
    };
    info!(
        component = "replay",
        event = "replay.finish",
        feature = %report.feature,
        input_rows = report.input_rows,
        dropped_rows = report.dropped_rows,
        output_records = report.output_records,
        aggregated_buckets = report.aggregated_buckets
    );
    Ok(ReplayOutput { records, report })
}

fn column_index(frame: &EventFrame, feature: &str, column: &str) -> Result<usize, EngineError> {
    frame
        .column_index(column)
        .ok_or_else(|| EngineError::MissingColumn {
            feature: feature.to_string(),
            column: column.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::context::FeatureLookup;
    use crate::primitive::Primitive;
    use crate::program::Program;
    use crate::spec::{AggrSpec, AggregationFunction};

    struct NoDependencies;

    impl FeatureResolver for NoDependencies {
        fn get_feature(
            &self,
            _selector: &str,
            _keys: &EntityKeys,
            _as_of: DateTime<Utc>,
        ) -> Result<FeatureLookup, EngineError> {
            Ok((None, None))
        }

        fn get_prediction(
            &self,
            selector: &str,
            _keys: &EntityKeys,
            _as_of: DateTime<Utc>,
        ) -> Result<Value, EngineError> {
            Err(EngineError::ModelNotTrained(selector.to_string()))
        }
    }

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn source(rows: Vec<(i64, &str, Option<i64>)>) -> DataSourceSpec {
        let frame = EventFrame::from_rows(
            &["event_at", "account", "amount"],
            rows.into_iter()
                .map(|(m, account, amount)| {
                    vec![
                        Some(Value::Timestamp(t(m))),
                        Some(Value::from(account)),
                        amount.map(Value::Int),
                    ]
                })
                .collect(),
        )
        .unwrap();
        DataSourceSpec::new("deposits")
            .with_namespace("bank")
            .with_keys(&["account"])
            .with_frame(frame)
    }

    fn feature(body: &str, ret: &str) -> FeatureSpec {
        let source = format!("def amount(row, ctx) -> {ret}:\n{body}");
        FeatureSpec::new(Program::parse(&source).unwrap())
            .with_namespace("bank")
            .with_freshness(Duration::minutes(1), Some(Duration::hours(1)))
    }

    #[test]
    fn scalar_replay_drops_none_and_persists() {
        let store = TimeSeriesStore::new();
        let spec = feature(
            "    if row['amount'] is None:\n        return None\n    return row['amount']\n",
            "int",
        );
        let out = replay(
            &spec,
            &source(vec![(0, "a", Some(1)), (5, "a", None), (10, "b", Some(3))]),
            &NoDependencies,
            &store,
            ReplayOptions::default(),
        )
        .unwrap();

        assert_eq!(out.records.len(), 2);
        assert_eq!(out.report.dropped_rows, 1);
        assert_eq!(out.report.input_rows, 3);
        assert_eq!(out.records[1].keys, "b");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn aggregated_replay_writes_one_stream_per_function() {
        let store = TimeSeriesStore::new();
        let spec = feature("    return row['amount']\n", "int").with_aggregation(AggrSpec::new(
            vec![AggregationFunction::Sum, AggregationFunction::Count],
            Duration::hours(1),
            Duration::minutes(10),
        ));
        let out = replay(
            &spec,
            &source(vec![(0, "a", Some(1)), (30, "a", Some(2)), (70, "a", Some(3))]),
            &NoDependencies,
            &store,
            ReplayOptions { persist: false },
        )
        .unwrap();

        let sums: Vec<_> = out
            .records
            .iter()
            .filter(|r| r.fqn == "bank.amount+sum")
            .map(|r| r.value.clone())
            .collect();
        assert_eq!(sums, vec![Value::Int(1), Value::Int(3), Value::Int(5)]);
        assert_eq!(out.report.output_records, 6);
        assert_eq!(out.report.aggregated_buckets, 3);
        assert!(store.is_empty());
    }

    #[test]
    fn empty_result_is_an_error() {
        let err = replay(
            &feature("    return None\n", "int"),
            &source(vec![(0, "a", Some(1))]),
            &NoDependencies,
            &TimeSeriesStore::new(),
            ReplayOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NoDataProduced { .. }));
    }

    #[test]
    fn wrong_return_type_is_rejected() {
        let err = replay(
            &feature("    return 'x'\n", "int"),
            &source(vec![(0, "a", Some(1))]),
            &NoDependencies,
            &TimeSeriesStore::new(),
            ReplayOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TypeMismatch {
                expected: Primitive::Integer,
                ..
            }
        ));
    }

    #[test]
    fn missing_keys_and_timestamps_are_reported() {
        let spec = feature("    return 1\n", "int");
        let mut src = source(vec![(0, "a", Some(1))]);
        src.keys.clear();
        assert!(matches!(
            replay(&spec, &src, &NoDependencies, &TimeSeriesStore::new(), ReplayOptions::default()),
            Err(EngineError::NoKeyColumns { .. })
        ));

        let src = source(vec![(0, "a", Some(1))]).with_keys(&["customer"]);
        assert!(matches!(
            replay(&spec, &src, &NoDependencies, &TimeSeriesStore::new(), ReplayOptions::default()),
            Err(EngineError::MissingColumn { .. })
        ));

        let frame = EventFrame::from_rows(&["account", "amount"], vec![vec![Some(Value::from("a")), None]])
            .unwrap();
        let src = DataSourceSpec::new("d").with_keys(&["account"]).with_frame(frame);
        assert!(matches!(
            replay(&spec, &src, &NoDependencies, &TimeSeriesStore::new(), ReplayOptions::default()),
            Err(EngineError::NoTimestampColumn { .. })
        ));
    }

    #[test]
    fn program_errors_carry_feature_and_line() {
        let err = replay(
            &feature("    x = 1\n    return x // 0\n", "int"),
            &source(vec![(0, "a", Some(1))]),
            &NoDependencies,
            &TimeSeriesStore::new(),
            ReplayOptions::default(),
        )
        .unwrap_err();
        match err {
            EngineError::ProgramFailed { feature, source } => {
                assert_eq!(feature, "bank.amount");
                assert!(matches!(source, crate::program::ProgramError::Runtime { line: 3, .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn detects_timestamp_columns() {
        let frame = EventFrame::from_rows(
            &["when", "v"],
            vec![vec![Some(Value::from("2024-01-01 00:00:00")), Some(Value::Int(1))]],
        )
        .unwrap();
        assert_eq!(detect_timestamp_column(&frame).as_deref(), Some("when"));
    }
}
