use thiserror::Error;

use crate::duration::DurationError;
use crate::frame::FrameError;
use crate::keys::KeyError;
use crate::primitive::Primitive;
use crate::program::ProgramError;
use crate::selector::SelectorError;
use crate::spec::AggregationFunction;
use crate::store::StoreError;
use crate::windows::WindowError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("{feature}: {source}")]
    ProgramFailed {
        feature: String,
        source: ProgramError,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Duration(#[from] DurationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Window(#[from] WindowError),

    #[error("{feature}: no timestamp column detected; declare one on the data source")]
    NoTimestampColumn { feature: String },
    #[error("{feature}: no key columns defined on the feature or its data source")]
    NoKeyColumns { feature: String },
    #[error("{feature}: column '{column}' not found in the event frame")]
    MissingColumn { feature: String, column: String },
    #[error("{feature}: row {row} has an invalid timestamp in column '{column}'")]
    InvalidTimestamp {
        feature: String,
        column: String,
        row: usize,
    },
    #[error("{feature}: program returned {actual}, expected {expected}")]
    TypeMismatch {
        feature: String,
        expected: Primitive,
        actual: String,
    },
    #[error("{feature}: replay produced no data")]
    NoDataProduced { feature: String },
    #[error("{model}: no feature data found")]
    NoDataFound { model: String },
    #[error("since {since} is after until {until}")]
    SinceAfterUntil { since: String, until: String },
    #[error("invalid time bound '{0}'")]
    InvalidTimeBound(String),
    #[error("{feature}: aggregation {function} is not supported for {primitive}")]
    UnsupportedAggregationForType {
        feature: String,
        function: AggregationFunction,
        primitive: Primitive,
    },
    #[error("{feature}: requested {requested} previous versions but only {kept} are kept")]
    MissingVersionHistory {
        feature: String,
        requested: u32,
        kept: u32,
    },
    #[error("{feature}: aggregation '{function}' is not declared")]
    AggregationNotDeclared { feature: String, function: String },
    #[error("{0} is not a feature")]
    NotAFeature(String),
    #[error("{0} is not a model")]
    NotAModel(String),
    #[error("unknown spec {0}")]
    UnknownSpec(String),
    #[error("{feature}: no data source with historical events is attached")]
    NoDataSource { feature: String },
    #[error("{feature}: freshness and staleness are required unless the feature is aggregated")]
    MissingFreshness { feature: String },
    #[error("model {0} is not trained")]
    ModelNotTrained(String),
    #[error("prediction with {model} failed: {message}")]
    Prediction { model: String, message: String },
    #[error("training {model} failed: {message}")]
    Training { model: String, message: String },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
}
