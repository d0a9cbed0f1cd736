//! Trailing-window aggregation over `(ts - over, ts]`.
//!
//! Every function is kept as an accumulator that supports `push` and
//! `evict`, so the value after each event equals a full recomputation over
//! the events inside the window.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::primitive::{Primitive, Value};
use crate::spec::AggregationFunction;

/// Aggregated values emitted for one input event.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRow {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<(AggregationFunction, Value)>,
}

/// Maps values to dense integer surrogates so distinct counting works on any primitive.
#[derive(Debug, Default)]
struct Factorizer {
    ids: HashMap<String, u64>,
}

impl Factorizer {
    fn id(&mut self, value: &Value) -> u64 {
        let next = self.ids.len() as u64;
        *self.ids.entry(value.to_key_string()).or_insert(next)
    }
}

/// Neumaier-compensated running sum of finite values.
///
/// Non-finite inputs are counted instead of summed so they stop affecting
/// the result once their event is evicted.
#[derive(Debug, Default)]
struct FloatSum {
    sum: f64,
    compensation: f64,
    nan: usize,
    pos_inf: usize,
    neg_inf: usize,
}

impl FloatSum {
    fn add(&mut self, x: f64) {
        if x.is_nan() {
            self.nan += 1;
        } else if x == f64::INFINITY {
            self.pos_inf += 1;
        } else if x == f64::NEG_INFINITY {
            self.neg_inf += 1;
        } else {
            self.add_finite(x);
        }
    }

    fn remove(&mut self, x: f64) {
        if x.is_nan() {
            self.nan -= 1;
        } else if x == f64::INFINITY {
            self.pos_inf -= 1;
        } else if x == f64::NEG_INFINITY {
            self.neg_inf -= 1;
        } else {
            self.add_finite(-x);
        }
    }

    fn add_finite(&mut self, x: f64) {
        let t = self.sum + x;
        if self.sum.abs() >= x.abs() {
            self.compensation += (self.sum - t) + x;
        } else {
            self.compensation += (x - t) + self.sum;
        }
        self.sum = t;
    }

    fn value(&self) -> f64 {
        if self.nan > 0 || (self.pos_inf > 0 && self.neg_inf > 0) {
            f64::NAN
        } else if self.pos_inf > 0 {
            f64::INFINITY
        } else if self.neg_inf > 0 {
            f64::NEG_INFINITY
        } else {
            self.sum + self.compensation
        }
    }
}

/// Integers are summed exactly; everything else goes through [`FloatSum`].
#[derive(Debug, Default)]
struct Total {
    int: i128,
    float: FloatSum,
    n: usize,
}

impl Total {
    fn push(&mut self, value: &Value) {
        match value {
            Value::Int(i) => self.int += i128::from(*i),
            _ => self.float.add(value.as_f64().unwrap_or(0.0)),
        }
        self.n += 1;
    }

    fn evict(&mut self, value: &Value) {
        match value {
            Value::Int(i) => self.int -= i128::from(*i),
            _ => self.float.remove(value.as_f64().unwrap_or(0.0)),
        }
        self.n -= 1;
        if self.n == 0 {
            *self = Self::default();
        }
    }

    fn as_f64(&self) -> f64 {
        self.float.value() + self.int as f64
    }
}

#[derive(Debug)]
enum Accumulator {
    Sum(Total),
    Avg(Total),
    Extreme { max: bool, deque: VecDeque<(u64, f64, Value)> },
    Count(usize),
    Distinct(HashMap<u64, usize>),
}

impl Accumulator {
    fn new(func: AggregationFunction) -> Self {
        match func {
            AggregationFunction::Sum => Self::Sum(Total::default()),
            AggregationFunction::Avg => Self::Avg(Total::default()),
            AggregationFunction::Max => Self::Extreme {
                max: true,
                deque: VecDeque::new(),
            },
            AggregationFunction::Min => Self::Extreme {
                max: false,
                deque: VecDeque::new(),
            },
            AggregationFunction::Count => Self::Count(0),
            AggregationFunction::DistinctCount | AggregationFunction::ApproxDistinctCount => {
                Self::Distinct(HashMap::new())
            }
        }
    }

    fn push(&mut self, seq: u64, value: &Value, id: u64) {
        match self {
            Self::Sum(total) | Self::Avg(total) => total.push(value),
            Self::Extreme { max, deque } => {
                let x = value.as_f64().unwrap_or(0.0);
                while let Some((_, back, _)) = deque.back() {
                    let dominated = match back.partial_cmp(&x) {
                        Some(Ordering::Less) => *max,
                        Some(Ordering::Greater) => !*max,
                        _ => true,
                    };
                    if !dominated {
                        break;
                    }
                    deque.pop_back();
                }
                deque.push_back((seq, x, value.clone()));
            }
            Self::Count(n) => *n += 1,
            Self::Distinct(counts) => *counts.entry(id).or_default() += 1,
        }
    }

    fn evict(&mut self, seq: u64, value: &Value, id: u64) {
        match self {
            Self::Sum(total) | Self::Avg(total) => total.evict(value),
            Self::Extreme { deque, .. } => {
                if deque.front().is_some_and(|(front, _, _)| *front == seq) {
                    deque.pop_front();
                }
            }
            Self::Count(n) => *n -= 1,
            Self::Distinct(counts) => {
                if let Some(count) = counts.get_mut(&id) {
                    *count -= 1;
                    if *count == 0 {
                        counts.remove(&id);
                    }
                }
            }
        }
    }

    fn value(&self, primitive: Primitive) -> Option<Value> {
        match self {
            Self::Sum(total) => Some(match primitive {
                Primitive::Integer => i64::try_from(total.int)
                    .map(Value::Int)
                    .unwrap_or(Value::Float(total.int as f64)),
                _ => Value::Float(total.as_f64()),
            }),
            Self::Avg(total) => {
                (total.n > 0).then(|| Value::Float(total.as_f64() / total.n as f64))
            }
            Self::Extreme { deque, .. } => deque.front().map(|(_, _, v)| v.clone()),
            Self::Count(n) => Some(Value::Int(*n as i64)),
            Self::Distinct(counts) => Some(Value::Int(counts.len() as i64)),
        }
    }
}

/// Incremental trailing window for one entity's event stream.
#[derive(Debug)]
pub struct RollingWindow {
    over: Duration,
    primitive: Primitive,
    events: VecDeque<(u64, DateTime<Utc>, Value, u64)>,
    accumulators: Vec<(AggregationFunction, Accumulator)>,
    factorizer: Factorizer,
    seq: u64,
}

impl RollingWindow {
    pub fn new(over: Duration, funcs: &[AggregationFunction], primitive: Primitive) -> Self {
        Self {
            over,
            primitive,
            events: VecDeque::new(),
            accumulators: funcs.iter().map(|f| (*f, Accumulator::new(*f))).collect(),
            factorizer: Factorizer::default(),
            seq: 0,
        }
    }

    /// Adds an event and returns every function's value over `(ts - over, ts]`.
    ///
    /// Events must arrive in non-decreasing timestamp order.
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: Value) -> AggregatedRow {
        let floor = timestamp - self.over;
        while let Some((seq, ts, _, _)) = self.events.front() {
            if *ts > floor {
                break;
            }
            let seq = *seq;
            if let Some((_, _, old, id)) = self.events.pop_front() {
                for (_, acc) in &mut self.accumulators {
                    acc.evict(seq, &old, id);
                }
            }
        }

        let seq = self.seq;
        self.seq += 1;
        let id = self.factorizer.id(&value);
        for (_, acc) in &mut self.accumulators {
            acc.push(seq, &value, id);
        }
        self.events.push_back((seq, timestamp, value, id));

        let values = self
            .accumulators
            .iter()
            .filter_map(|(f, acc)| acc.value(self.primitive).map(|v| (*f, v)))
            .collect();
        AggregatedRow { timestamp, values }
    }
}

/// Stable-sorts `events` by time and emits one aggregated row per event.
pub fn rolling_aggregate(
    mut events: Vec<(DateTime<Utc>, Value)>,
    over: Duration,
    funcs: &[AggregationFunction],
    primitive: Primitive,
) -> Vec<AggregatedRow> {
    events.sort_by_key(|(ts, _)| *ts);
    let mut window = RollingWindow::new(over, funcs, primitive);
    events
        .into_iter()
        .map(|(ts, value)| window.push(ts, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::spec::AggregationFunction::*;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn value_of(row: &AggregatedRow, func: AggregationFunction) -> Option<&Value> {
        row.values.iter().find(|(f, _)| *f == func).map(|(_, v)| v)
    }

    #[test]
    fn window_excludes_left_edge() {
        let rows = rolling_aggregate(
            vec![(t(0), Value::Int(1)), (t(10), Value::Int(2)), (t(70), Value::Int(3))],
            Duration::hours(1),
            &[Sum, Count],
            Primitive::Integer,
        );
        assert_eq!(value_of(&rows[1], Sum), Some(&Value::Int(3)));
        // t=10 is exactly one hour back from t=70 and falls out of (10, 70]
        assert_eq!(value_of(&rows[2], Sum), Some(&Value::Int(3)));
        assert_eq!(value_of(&rows[2], Count), Some(&Value::Int(1)));
    }

    #[test]
    fn sum_at_seventy_minutes() {
        let rows = rolling_aggregate(
            vec![(t(0), Value::Int(1)), (t(30), Value::Int(2)), (t(70), Value::Int(3))],
            Duration::hours(1),
            &[Sum],
            Primitive::Integer,
        );
        assert_eq!(value_of(&rows[2], Sum), Some(&Value::Int(5)));
    }

    #[test]
    fn incremental_matches_recomputation() {
        let raw = [5.0, 1.0, 4.0, 4.0, 9.0, 2.0, 6.0, 3.0, 8.0, 7.0];
        let events: Vec<_> = raw
            .iter()
            .enumerate()
            .map(|(i, v)| (t(i as i64 * 7), Value::Float(*v)))
            .collect();
        let over = Duration::minutes(20);
        let rows = rolling_aggregate(
            events.clone(),
            over,
            &[Sum, Avg, Max, Min, Count, DistinctCount],
            Primitive::Float,
        );

        for (row, (ts, _)) in rows.iter().zip(&events) {
            let window: Vec<f64> = events
                .iter()
                .filter(|(e, _)| *e > *ts - over && *e <= *ts)
                .filter_map(|(_, v)| v.as_f64())
                .collect();
            let sum: f64 = window.iter().sum();
            let max = window.iter().cloned().fold(f64::MIN, f64::max);
            let min = window.iter().cloned().fold(f64::MAX, f64::min);
            let mut distinct = window.clone();
            distinct.sort_by(|a, b| a.partial_cmp(b).unwrap());
            distinct.dedup();

            let got = |f| value_of(row, f).and_then(Value::as_f64).unwrap();
            assert!((got(Sum) - sum).abs() < 1e-9);
            assert!((got(Avg) - sum / window.len() as f64).abs() < 1e-9);
            assert_eq!(got(Max), max);
            assert_eq!(got(Min), min);
            assert_eq!(value_of(row, Count), Some(&Value::Int(window.len() as i64)));
            assert_eq!(
                value_of(row, DistinctCount),
                Some(&Value::Int(distinct.len() as i64))
            );
        }
    }

    #[test]
    fn small_values_survive_a_large_outlier() {
        let rows = rolling_aggregate(
            vec![
                (t(0), Value::Float(1e17)),
                (t(30), Value::Float(1.0)),
                (t(70), Value::Float(1.0)),
            ],
            Duration::hours(1),
            &[Sum, Avg],
            Primitive::Float,
        );
        assert_eq!(value_of(&rows[2], Sum), Some(&Value::Float(2.0)));
        assert_eq!(value_of(&rows[2], Avg), Some(&Value::Float(1.0)));
    }

    #[test]
    fn non_finite_values_leave_with_their_event() {
        let rows = rolling_aggregate(
            vec![
                (t(0), Value::Float(f64::NAN)),
                (t(1), Value::Float(f64::INFINITY)),
                (t(40), Value::Float(1.5)),
                (t(90), Value::Float(2.5)),
            ],
            Duration::hours(1),
            &[Sum, Avg],
            Primitive::Float,
        );
        let sum = |row: &AggregatedRow| value_of(row, Sum).and_then(Value::as_f64).unwrap();
        assert!(sum(&rows[0]).is_nan());
        assert!(sum(&rows[2]).is_nan());
        assert_eq!(value_of(&rows[3], Sum), Some(&Value::Float(4.0)));
        assert_eq!(value_of(&rows[3], Avg), Some(&Value::Float(2.0)));

        let infinite = rolling_aggregate(
            vec![
                (t(0), Value::Float(f64::INFINITY)),
                (t(5), Value::Float(3.0)),
                (t(10), Value::Float(f64::NEG_INFINITY)),
                (t(65), Value::Float(4.0)),
            ],
            Duration::hours(1),
            &[Sum],
            Primitive::Float,
        );
        assert_eq!(value_of(&infinite[1], Sum), Some(&Value::Float(f64::INFINITY)));
        assert!(sum(&infinite[2]).is_nan());
        assert_eq!(value_of(&infinite[3], Sum), Some(&Value::Float(f64::NEG_INFINITY)));
    }

    #[test]
    fn distinct_counts_strings() {
        let rows = rolling_aggregate(
            vec![
                (t(0), Value::from("a")),
                (t(1), Value::from("b")),
                (t(2), Value::from("a")),
                (t(90), Value::from("c")),
            ],
            Duration::hours(1),
            &[DistinctCount, ApproxDistinctCount, Count],
            Primitive::String,
        );
        assert_eq!(value_of(&rows[2], DistinctCount), Some(&Value::Int(2)));
        assert_eq!(value_of(&rows[2], ApproxDistinctCount), Some(&Value::Int(2)));
        assert_eq!(value_of(&rows[3], DistinctCount), Some(&Value::Int(1)));
        assert_eq!(value_of(&rows[3], Count), Some(&Value::Int(1)));
    }

    #[test]
    fn min_max_keep_integer_type() {
        let rows = rolling_aggregate(
            vec![(t(0), Value::Int(4)), (t(1), Value::Int(2)), (t(2), Value::Int(9))],
            Duration::hours(1),
            &[Min, Max, Avg],
            Primitive::Integer,
        );
        assert_eq!(value_of(&rows[2], Min), Some(&Value::Int(2)));
        assert_eq!(value_of(&rows[2], Max), Some(&Value::Int(9)));
        assert_eq!(value_of(&rows[2], Avg), Some(&Value::Float(5.0)));
    }
}
