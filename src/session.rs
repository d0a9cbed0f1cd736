//! A session owns the registry, the store and trained predictors.
//!
//! Everything that was process-wide state in a notebook workflow lives
//! here instead, so independent sessions never observe each other.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::context::{resolve_point_in_time, Context, FeatureLookup, FeatureResolver};
use crate::error::EngineError;
use crate::historical::{self, TrainingTable};
use crate::keys::{encode_keys, EntityKeys};
use crate::model::{FeatureBatch, Predictor, Trainer, TrainingContext};
use crate::primitive::Value;
use crate::program::{Program, ProgramError, SideEffectKind};
use crate::registry::{Registry, Spec};
use crate::replay::{self, ReplayOptions, ReplayOutput, ReplayReport};
use crate::selector::{is_valid_name, Selector, SelectorError};
use crate::spec::{DataSourceSpec, FeatureSpec, ModelSpec};
use crate::store::{FeatureValue, TimeSeriesStore, WriteInstruction};

pub struct Session {
    config: SessionConfig,
    registry: Registry,
    store: Arc<TimeSeriesStore>,
    predictors: HashMap<String, Box<dyn Predictor>>,
    /// `(fqn, program checksum)` pairs whose replay output is already in the store.
    replayed: Mutex<HashSet<(String, String)>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            store: Arc::new(TimeSeriesStore::new()),
            predictors: HashMap::new(),
            replayed: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    fn fill_namespace(&self, namespace: &mut String) {
        if namespace.is_empty() {
            *namespace = self.config.default_namespace.clone();
        }
    }

    fn check_name(name: &str) -> Result<(), EngineError> {
        if is_valid_name(name) {
            Ok(())
        } else {
            Err(SelectorError::InvalidSelector(name.to_string()).into())
        }
    }

    fn registered(&mut self, spec: Spec) {
        info!(
            component = "session",
            event = "session.spec.registered",
            kind = spec.kind(),
            fqn = %spec.fqn()
        );
        self.registry.register(spec);
    }

    pub fn register_data_source(
        &mut self,
        mut spec: DataSourceSpec,
    ) -> Result<Arc<DataSourceSpec>, EngineError> {
        self.fill_namespace(&mut spec.namespace);
        Self::check_name(&spec.name)?;
        Self::check_name(&spec.namespace)?;
        let spec = Arc::new(spec);
        self.registered(Spec::DataSource(Arc::clone(&spec)));
        Ok(spec)
    }

    /// Validates and registers a feature, replacing any feature with the same FQN.
    ///
    /// The data source reference is normalized, and a feature without keys
    /// inherits its data source's key columns.
    pub fn register_feature(&mut self, mut spec: FeatureSpec) -> Result<Arc<FeatureSpec>, EngineError> {
        self.fill_namespace(&mut spec.namespace);
        Self::check_name(&spec.name)?;
        Self::check_name(&spec.namespace)?;
        let fqn = spec.fqn();

        if spec.staleness.is_none() && spec.aggr.is_none() {
            return Err(EngineError::MissingFreshness { feature: fqn });
        }
        if let Some(aggr) = &spec.aggr {
            if let Some(function) = aggr.funcs.iter().find(|f| !f.supports(spec.primitive)) {
                return Err(EngineError::UnsupportedAggregationForType {
                    feature: fqn,
                    function: *function,
                    primitive: spec.primitive,
                });
            }
        }

        if let Some(raw) = spec.data_source.take() {
            let source_fqn = Selector::parse(&raw, spec.namespace())?.base_fqn();
            let source = self.registry.data_source(&source_fqn)?;
            if spec.keys.is_empty() {
                spec.keys = source.keys.clone();
            }
            spec.data_source = Some(source_fqn);
        }

        let spec = Arc::new(spec);
        self.registered(Spec::Feature(Arc::clone(&spec)));
        Ok(spec)
    }

    /// Registers a model. Every input must be a registered feature and
    /// versioned (`@-N`) inputs are rejected.
    pub fn register_model(&mut self, mut spec: ModelSpec) -> Result<Arc<ModelSpec>, EngineError> {
        self.fill_namespace(&mut spec.namespace);
        Self::check_name(&spec.name)?;
        Self::check_name(&spec.namespace)?;
        if spec.features.is_empty() {
            return Err(EngineError::NoDataFound { model: spec.fqn() });
        }

        let normalize = |raw: &str| -> Result<String, EngineError> {
            let selector = Selector::parse(raw, spec.namespace())?;
            if selector.version > 0 {
                return Err(SelectorError::InvalidSelector(raw.to_string()).into());
            }
            let (_, canonical) = self.registry.check_selector(&selector)?;
            Ok(canonical.to_string())
        };
        let features = spec
            .features
            .iter()
            .map(|s| normalize(s))
            .collect::<Result<Vec<_>, _>>()?;
        let labels = spec
            .labels
            .iter()
            .map(|s| normalize(s))
            .collect::<Result<Vec<_>, _>>()?;
        let key_feature = spec.key_feature.as_deref().map(normalize).transpose()?;
        spec.features = features;
        spec.labels = labels;
        spec.key_feature = key_feature;

        let spec = Arc::new(spec);
        self.registered(Spec::Model(Arc::clone(&spec)));
        Ok(spec)
    }

    /// Compiles a program, resolving bare-name dependencies against registered features.
    pub fn parse_program(&self, source: &str) -> Result<Program, ProgramError> {
        let namespace = self.config.default_namespace.as_str();
        Program::parse_with_resolver(source, &|name| {
            self.registry.resolve_dependency_name(name, namespace)
        })
    }

    /// Base FQNs of the features `spec`'s program reads.
    pub fn dependencies(&self, spec: &FeatureSpec) -> Result<Vec<String>, EngineError> {
        let mut out: Vec<String> = Vec::new();
        for effect in spec.program.side_effects() {
            if effect.kind != SideEffectKind::GetFeature {
                continue;
            }
            let fqn = Selector::parse(&effect.selector, spec.namespace())?.base_fqn();
            if !out.contains(&fqn) {
                out.push(fqn);
            }
        }
        Ok(out)
    }

    fn replay_into(
        &self,
        spec: &FeatureSpec,
        options: ReplayOptions,
    ) -> Result<ReplayOutput, EngineError> {
        let fqn = spec.fqn();
        let source_fqn = spec
            .data_source
            .as_deref()
            .ok_or_else(|| EngineError::NoDataSource {
                feature: fqn.clone(),
            })?;
        let source = self.registry.data_source(source_fqn)?;
        let output = replay::replay(spec, source, self, &self.store, options)?;
        if options.persist {
            self.replayed
                .lock()
                .expect("replay tracking lock should not be poisoned")
                .insert((fqn, spec.program.checksum().to_string()));
        }
        Ok(output)
    }

    /// Replays one feature from its data source. Output is appended to the
    /// store when the session persists replays and the current program has
    /// not been appended yet.
    pub fn replay(&self, fqn: &str) -> Result<ReplayOutput, EngineError> {
        let spec = Arc::clone(self.registry.feature(fqn)?);
        let mut persist = self.config.persist_replays;
        if persist && self.already_replayed(&spec) {
            debug!(
                component = "session",
                event = "session.replay.skipped",
                feature = %spec.fqn()
            );
            persist = false;
        }
        self.replay_into(&spec, ReplayOptions { persist })
    }

    fn already_replayed(&self, spec: &FeatureSpec) -> bool {
        self.replayed
            .lock()
            .expect("replay tracking lock should not be poisoned")
            .contains(&(spec.fqn(), spec.program.checksum().to_string()))
    }

    /// Replays `fqn` after everything it depends on, skipping features whose
    /// current program was already replayed into the store.
    pub fn replay_with_dependencies(&self, fqn: &str) -> Result<Vec<ReplayReport>, EngineError> {
        let mut order = Vec::new();
        self.visit(fqn, &mut Vec::new(), &mut order)?;

        let mut reports = Vec::new();
        for spec in order {
            if self.already_replayed(&spec) {
                debug!(
                    component = "session",
                    event = "session.replay.skipped",
                    feature = %spec.fqn()
                );
                continue;
            }
            let output = self.replay_into(&spec, ReplayOptions { persist: true })?;
            reports.push(output.report);
        }
        Ok(reports)
    }

    fn visit(
        &self,
        fqn: &str,
        path: &mut Vec<String>,
        order: &mut Vec<Arc<FeatureSpec>>,
    ) -> Result<(), EngineError> {
        if let Some(start) = path.iter().position(|p| p == fqn) {
            let mut cycle = path[start..].to_vec();
            cycle.push(fqn.to_string());
            return Err(EngineError::DependencyCycle(cycle));
        }
        if order.iter().any(|s| s.fqn() == fqn) {
            return Ok(());
        }
        let spec = Arc::clone(self.registry.feature(fqn)?);
        path.push(fqn.to_string());
        for dependency in self.dependencies(&spec)? {
            self.visit(&dependency, path, order)?;
        }
        path.pop();
        order.push(spec);
        Ok(())
    }

    /// Replays every feature `model_fqn` references, then joins them.
    pub fn historical_get(
        &self,
        model_fqn: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<TrainingTable, EngineError> {
        let model = Arc::clone(self.registry.model(model_fqn)?);
        let mut referenced: Vec<String> = Vec::new();
        for raw in model.spine().into_iter().chain(model.referenced()) {
            let fqn = Selector::parse(raw, model.namespace())?.base_fqn();
            if !referenced.contains(&fqn) {
                referenced.push(fqn);
            }
        }
        for fqn in &referenced {
            self.replay_with_dependencies(fqn)?;
        }
        historical::historical_get(&model, &self.registry, &self.store, since, until)
    }

    /// Input columns of a model in the order trainers and predictors see them.
    fn model_columns(model: &ModelSpec) -> (Vec<String>, Vec<String>) {
        let mut features: Vec<String> = Vec::new();
        for name in model.spine().into_iter().chain(model.features.iter().map(String::as_str)) {
            if !features.iter().any(|f| f == name) {
                features.push(name.to_string());
            }
        }
        (features, model.labels.clone())
    }

    /// Builds the training table and hands it to `trainer`; the returned
    /// predictor serves `get_prediction` for this model.
    pub fn train_model(&mut self, model_fqn: &str, trainer: &dyn Trainer) -> Result<usize, EngineError> {
        let model = Arc::clone(self.registry.model(model_fqn)?);
        let table = self.historical_get(model_fqn, None, None)?;
        let rows = table.len();
        let (features, labels) = Self::model_columns(&model);
        let ctx = TrainingContext::new(Arc::clone(&model), table, features, labels);
        let predictor = trainer.train(&ctx).map_err(|err| EngineError::Training {
            model: model.fqn(),
            message: err.to_string(),
        })?;
        self.set_predictor(model_fqn, predictor);
        info!(
            component = "session",
            event = "session.model.trained",
            model = %model.fqn(),
            rows
        );
        Ok(rows)
    }

    pub fn set_predictor(&mut self, model_fqn: &str, predictor: Box<dyn Predictor>) {
        self.predictors.insert(model_fqn.to_string(), predictor);
    }

    /// A context for evaluating `fqn` against this session's store.
    pub fn context(
        &self,
        fqn: &str,
        keys: EntityKeys,
        timestamp: DateTime<Utc>,
    ) -> Result<Context<'_>, EngineError> {
        Context::new(fqn, keys, timestamp, self)
    }

    /// Applies a write instruction to the stream of a registered feature.
    pub fn apply_instruction(&self, instruction: WriteInstruction) -> Result<FeatureValue, EngineError> {
        let selector = Selector::parse(&instruction.fqn, &self.config.default_namespace)?;
        let spec = self.registry.feature(&selector.base_fqn())?;
        let instruction = WriteInstruction {
            fqn: selector.storage_fqn(),
            ..instruction
        };
        Ok(self
            .store
            .apply(instruction, spec.primitive, spec.effective_staleness())?)
    }
}

impl FeatureResolver for Session {
    fn get_feature(
        &self,
        selector: &str,
        keys: &EntityKeys,
        as_of: DateTime<Utc>,
    ) -> Result<FeatureLookup, EngineError> {
        let parsed = Selector::parse(selector, &self.config.default_namespace)?;
        let (spec, canonical) = self.registry.check_selector(&parsed)?;
        let encoded = encode_keys(&spec.keys, keys)?;
        resolve_point_in_time(&self.store, &spec, &canonical, &encoded, as_of)
    }

    fn get_prediction(
        &self,
        selector: &str,
        keys: &EntityKeys,
        as_of: DateTime<Utc>,
    ) -> Result<Value, EngineError> {
        let fqn = Selector::parse(selector, &self.config.default_namespace)?.base_fqn();
        let model = self.registry.model(&fqn)?;
        let predictor = self
            .predictors
            .get(&fqn)
            .ok_or_else(|| EngineError::ModelNotTrained(fqn.clone()))?;

        let (columns, _) = Self::model_columns(model);
        let mut row = Vec::with_capacity(columns.len());
        for column in &columns {
            row.push(self.get_feature(column, keys, as_of)?.0);
        }
        let batch = FeatureBatch {
            columns,
            rows: vec![row],
        };
        let prediction_error = |message: String| EngineError::Prediction {
            model: fqn.clone(),
            message,
        };
        predictor
            .predict(&batch)
            .map_err(|err| prediction_error(err.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| prediction_error("predictor returned no rows".to_string()))
    }
}
