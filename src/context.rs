//! Point-in-time feature lookups made from inside a running program.

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::error::EngineError;
use crate::keys::EntityKeys;
use crate::primitive::Value;
use crate::selector::{normalize, Selector, SelectorError};
use crate::spec::FeatureSpec;
use crate::store::TimeSeriesStore;

/// `(value, timestamp)`, both `None` when nothing valid exists as of the query time.
pub type FeatureLookup = (Option<Value>, Option<DateTime<Utc>>);

/// Read path a [`Context`] delegates to. Selectors arrive normalized.
pub trait FeatureResolver {
    fn get_feature(
        &self,
        selector: &str,
        keys: &EntityKeys,
        as_of: DateTime<Utc>,
    ) -> Result<FeatureLookup, EngineError>;

    fn get_prediction(
        &self,
        selector: &str,
        keys: &EntityKeys,
        as_of: DateTime<Utc>,
    ) -> Result<Value, EngineError>;
}

/// The calling feature, its entity keys and the as-of time of one evaluation.
pub struct Context<'a> {
    fqn: String,
    namespace: String,
    keys: EntityKeys,
    timestamp: DateTime<Utc>,
    resolver: &'a dyn FeatureResolver,
}

impl<'a> Context<'a> {
    /// `fqn` must carry a namespace; it becomes the default for dependency selectors.
    pub fn new(
        fqn: &str,
        keys: EntityKeys,
        timestamp: DateTime<Utc>,
        resolver: &'a dyn FeatureResolver,
    ) -> Result<Self, EngineError> {
        if !fqn.contains('.') {
            return Err(SelectorError::InvalidSelector(fqn.to_string()).into());
        }
        let parsed = Selector::parse(fqn, "")?;
        Ok(Self {
            fqn: parsed.to_string(),
            namespace: parsed.namespace,
            keys,
            timestamp,
            resolver,
        })
    }

    pub fn fqn(&self) -> &str {
        &self.fqn
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn keys(&self) -> &EntityKeys {
        &self.keys
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Looks `selector` up as of the context timestamp, for `keys` or the context's own keys.
    pub fn get_feature(
        &self,
        selector: &str,
        keys: Option<&EntityKeys>,
    ) -> Result<FeatureLookup, EngineError> {
        let selector = normalize(selector, &self.namespace)?;
        let keys = keys.unwrap_or(&self.keys);
        let (value, ts) = self.resolver.get_feature(&selector, keys, self.timestamp)?;
        if let Some(ts) = ts.filter(|ts| *ts > self.timestamp) {
            warn!(
                component = "context",
                event = "context.future_record_discarded",
                feature = %self.fqn,
                selector = %selector,
                record_ts = %ts,
                as_of = %self.timestamp,
                "resolver returned a record newer than the as-of time"
            );
            return Ok((None, None));
        }
        Ok((value, ts))
    }

    /// Runs the model's predictor for these keys; the result is stamped with the context time.
    pub fn get_prediction(
        &self,
        selector: &str,
        keys: Option<&EntityKeys>,
    ) -> Result<(Value, DateTime<Utc>), EngineError> {
        let selector = normalize(selector, &self.namespace)?;
        let keys = keys.unwrap_or(&self.keys);
        let value = self.resolver.get_prediction(&selector, keys, self.timestamp)?;
        Ok((value, self.timestamp))
    }
}

/// Resolves `selector` against the stored history of `spec` as of `as_of`.
///
/// Without a version the latest record at or before `as_of` is returned if it
/// is not stale. With `@-N` the N-th most recent record is returned, subject
/// to the feature's keep-previous retention.
pub fn resolve_point_in_time(
    store: &TimeSeriesStore,
    spec: &FeatureSpec,
    selector: &Selector,
    encoded_keys: &str,
    as_of: DateTime<Utc>,
) -> Result<FeatureLookup, EngineError> {
    let fqn = selector.storage_fqn();

    if selector.version == 0 {
        let staleness = spec.effective_staleness();
        let window = (staleness > Duration::zero()).then_some(staleness);
        return Ok(store
            .query(&fqn, encoded_keys, as_of, window, 1)
            .into_iter()
            .next()
            .map(|record| (Some(record.value), Some(record.timestamp)))
            .unwrap_or((None, None)));
    }

    let versions = spec.keep_previous.map(|kp| kp.versions).unwrap_or(0);
    if versions < selector.version {
        return Err(EngineError::MissingVersionHistory {
            feature: spec.fqn(),
            requested: selector.version,
            kept: versions,
        });
    }

    let depth = selector.version as usize + 1;
    let history = store.query(&fqn, encoded_keys, as_of, None, depth);
    let (Some(latest), Some(target)) = (history.first(), history.get(depth - 1)) else {
        return Ok((None, None));
    };

    if let Some(kp) = spec.keep_previous.filter(|kp| kp.over > Duration::zero()) {
        let retention = kp.over * selector.version as i32;
        let target_expired = latest.timestamp - target.timestamp > retention;
        let query_expired = as_of - latest.timestamp > retention;
        if target_expired || query_expired {
            return Ok((None, None));
        }
    }
    Ok((Some(target.value.clone()), Some(target.timestamp)))
}
