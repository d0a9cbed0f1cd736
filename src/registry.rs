//! Specs registered in a session, keyed by `namespace.name`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::EngineError;
use crate::program::ProgramError;
use crate::selector::Selector;
use crate::spec::{AggregationFunction, DataSourceSpec, FeatureSpec, ModelSpec};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Spec {
    Feature(Arc<FeatureSpec>),
    Model(Arc<ModelSpec>),
    DataSource(Arc<DataSourceSpec>),
}

impl Spec {
    pub fn fqn(&self) -> String {
        match self {
            Spec::Feature(spec) => spec.fqn(),
            Spec::Model(spec) => spec.fqn(),
            Spec::DataSource(spec) => spec.fqn(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Spec::Feature(_) => "feature",
            Spec::Model(_) => "model",
            Spec::DataSource(_) => "data_source",
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    specs: BTreeMap<String, Spec>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `spec`, returning whatever it replaced under the same FQN.
    pub fn register(&mut self, spec: Spec) -> Option<Spec> {
        self.specs.insert(spec.fqn(), spec)
    }

    pub fn get(&self, fqn: &str) -> Option<&Spec> {
        self.specs.get(fqn)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> impl Iterator<Item = &Spec> {
        self.specs.values()
    }

    pub fn features(&self) -> impl Iterator<Item = &Arc<FeatureSpec>> {
        self.specs.values().filter_map(|spec| match spec {
            Spec::Feature(feature) => Some(feature),
            Spec::Model(_) | Spec::DataSource(_) => None,
        })
    }

    pub fn feature(&self, fqn: &str) -> Result<&Arc<FeatureSpec>, EngineError> {
        match self.specs.get(fqn) {
            Some(Spec::Feature(spec)) => Ok(spec),
            Some(Spec::Model(_) | Spec::DataSource(_)) => Err(EngineError::NotAFeature(fqn.to_string())),
            None => Err(EngineError::UnknownSpec(fqn.to_string())),
        }
    }

    pub fn model(&self, fqn: &str) -> Result<&Arc<ModelSpec>, EngineError> {
        match self.specs.get(fqn) {
            Some(Spec::Model(spec)) => Ok(spec),
            Some(Spec::Feature(_) | Spec::DataSource(_)) => Err(EngineError::NotAModel(fqn.to_string())),
            None => Err(EngineError::UnknownSpec(fqn.to_string())),
        }
    }

    pub fn data_source(&self, fqn: &str) -> Result<&Arc<DataSourceSpec>, EngineError> {
        match self.specs.get(fqn) {
            Some(Spec::DataSource(spec)) => Ok(spec),
            Some(Spec::Feature(_) | Spec::Model(_)) | None => {
                Err(EngineError::UnknownSpec(fqn.to_string()))
            }
        }
    }

    /// Validates `selector` against the feature it names.
    ///
    /// Returns the feature and the selector with its aggregation function in
    /// canonical form (`mean` becomes `avg`).
    pub fn check_selector(
        &self,
        selector: &Selector,
    ) -> Result<(Arc<FeatureSpec>, Selector), EngineError> {
        let fqn = selector.base_fqn();
        let spec = self.feature(&fqn)?;
        let mut canonical = selector.clone();

        match (&selector.aggr_fn, &spec.aggr) {
            (Some(raw), aggr) => {
                let func = AggregationFunction::parse(raw)
                    .filter(|f| aggr.as_ref().is_some_and(|a| a.has(*f)))
                    .ok_or_else(|| EngineError::AggregationNotDeclared {
                        feature: fqn.clone(),
                        function: raw.clone(),
                    })?;
                canonical.aggr_fn = Some(func.as_str().to_string());
            }
            (None, Some(_)) => {
                return Err(ProgramError::AggregatedFeatureRequiresSelector(fqn).into());
            }
            (None, None) => {}
        }

        if selector.version > 0 {
            let kept = spec.keep_previous.map(|kp| kp.versions).unwrap_or(0);
            if kept < selector.version {
                return Err(EngineError::MissingVersionHistory {
                    feature: fqn,
                    requested: selector.version,
                    kept,
                });
            }
        }
        Ok((Arc::clone(spec), canonical))
    }

    /// Resolves a bare feature name used as a program dependency.
    ///
    /// `namespace.name` wins; otherwise the name must match exactly one
    /// registered feature. Aggregated features need an explicit selector.
    pub fn resolve_dependency_name(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<String, ProgramError> {
        let local = format!("{namespace}.{name}");
        let spec = match self.specs.get(&local) {
            Some(Spec::Feature(spec)) => spec,
            _ => {
                let mut matches = self.features().filter(|f| f.name == name);
                match (matches.next(), matches.next()) {
                    (Some(spec), None) => spec,
                    _ => return Err(ProgramError::UnresolvableDependency(name.to_string())),
                }
            }
        };
        if spec.aggr.is_some() {
            return Err(ProgramError::AggregatedFeatureRequiresSelector(spec.fqn()));
        }
        Ok(spec.fqn())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::program::Program;
    use crate::spec::{AggrSpec, KeepPrevious};

    fn feature(name: &str) -> FeatureSpec {
        let source = format!("def {name}(row, ctx) -> float:\n    return row['v']\n");
        FeatureSpec::new(Program::parse(&source).unwrap())
            .with_namespace("bank")
            .with_freshness(Duration::minutes(1), None)
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(Spec::Feature(Arc::new(feature("plain").with_keep_previous(
            KeepPrevious::new(2, Duration::zero()).unwrap(),
        ))));
        registry.register(Spec::Feature(Arc::new(feature("spend").with_aggregation(
            AggrSpec::new(
                vec![AggregationFunction::Sum, AggregationFunction::Avg],
                Duration::hours(1),
                Duration::minutes(5),
            ),
        ))));
        registry.register(Spec::Model(Arc::new(ModelSpec::new("m").with_namespace("bank"))));
        registry
    }

    #[test]
    fn lookups_distinguish_kinds() {
        let registry = registry();
        assert!(registry.feature("bank.plain").is_ok());
        assert!(matches!(registry.feature("bank.m"), Err(EngineError::NotAFeature(_))));
        assert!(matches!(registry.model("bank.plain"), Err(EngineError::NotAModel(_))));
        assert!(matches!(registry.feature("bank.nope"), Err(EngineError::UnknownSpec(_))));
        assert_eq!(registry.get("bank.m").map(Spec::kind), Some("model"));
    }

    #[test]
    fn reregistration_overwrites() {
        let mut registry = registry();
        let previous = registry.register(Spec::Feature(Arc::new(feature("plain"))));
        assert!(previous.is_some());
        assert_eq!(registry.len(), 3);
        assert!(registry.feature("bank.plain").unwrap().keep_previous.is_none());
    }

    #[test]
    fn selectors_are_checked_against_specs() {
        let registry = registry();
        let check = |raw: &str| registry.check_selector(&Selector::parse(raw, "bank").unwrap());

        let (_, canonical) = check("spend+MEAN").unwrap();
        assert_eq!(canonical.storage_fqn(), "bank.spend+avg");
        assert!(matches!(
            check("spend+max"),
            Err(EngineError::AggregationNotDeclared { .. })
        ));
        assert!(matches!(
            check("spend"),
            Err(EngineError::Program(ProgramError::AggregatedFeatureRequiresSelector(_)))
        ));
        assert!(check("plain@-2").is_ok());
        assert!(matches!(
            check("plain@-3"),
            Err(EngineError::MissingVersionHistory { requested: 3, kept: 2, .. })
        ));
    }

    #[test]
    fn resolves_bare_dependency_names() {
        let registry = registry();
        assert_eq!(registry.resolve_dependency_name("plain", "bank").unwrap(), "bank.plain");
        assert_eq!(registry.resolve_dependency_name("plain", "other").unwrap(), "bank.plain");
        assert!(matches!(
            registry.resolve_dependency_name("ghost", "bank"),
            Err(ProgramError::UnresolvableDependency(_))
        ));
        assert!(matches!(
            registry.resolve_dependency_name("spend", "bank"),
            Err(ProgramError::AggregatedFeatureRequiresSelector(_))
        ));
    }
}
