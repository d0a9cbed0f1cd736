//! Point-in-time feature replay and resolution.
//!
//! Implemented scope:
//! - feature programs: parsing, static validation, dependency extraction, interpretation
//! - append-only time-series store with point-in-time and versioned lookups
//! - replay of historical events, including trailing-window aggregations
//! - as-of joins of feature streams into training tables
//! - an online program cache keyed by source checksum

mod aggregate;
mod config;
mod context;
mod duration;
mod error;
mod frame;
mod historical;
mod keys;
mod model;
mod observability;
mod primitive;
mod program;
mod registry;
mod replay;
mod runtime;
mod selector;
mod session;
mod spec;
mod store;
mod windows;

pub use aggregate::{rolling_aggregate, AggregatedRow, RollingWindow};
pub use config::{session_config_from_env, SessionConfig};
pub use context::{resolve_point_in_time, Context, FeatureLookup, FeatureResolver};
pub use duration::{format_duration, parse_duration, DurationError};
pub use error::EngineError;
pub use frame::{cell_timestamp, parse_timestamp, Cell, EventFrame, FrameError};
pub use historical::{historical_get, parse_time_bound, TrainingTable, KEYS_COLUMN, TIMESTAMP_COLUMN};
pub use keys::{decode_keys, encode_keys, EntityKeys, KeyError, KEY_SEPARATOR};
pub use model::{FeatureBatch, ModelError, Predictor, Trainer, TrainingContext};
pub use observability::{
    init_logging, log_app_start, log_replay_report, log_source_selected, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use primitive::{Primitive, Value};
pub use program::{
    source_checksum, DependencyResolver, Program, ProgramError, ProgramOutput, Row, SideEffect,
    SideEffectKind,
};
pub use registry::{Registry, Spec};
pub use replay::{
    detect_timestamp_column, replay, ReplayOptions, ReplayOutput, ReplayReport,
    TIMESTAMP_CANDIDATES,
};
pub use runtime::{Execution, LoadedProgram, ProgramRuntime};
pub use selector::{is_valid_name, normalize, Selector, SelectorError, DEFAULT_NAMESPACE};
pub use session::Session;
pub use spec::{
    AggrSpec, AggregationFunction, DataSourceSpec, FeatureSpec, KeepPrevious, ModelSpec,
};
pub use store::{FeatureValue, StoreError, TimeSeriesStore, WriteInstruction, WriteOp};
pub use windows::{bucket_name, WindowError};
