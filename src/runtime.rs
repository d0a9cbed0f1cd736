//! Program cache for serving: load once per source checksum, execute concurrently.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::context::{Context, FeatureResolver};
use crate::error::EngineError;
use crate::keys::EntityKeys;
use crate::primitive::{Primitive, Value};
use crate::program::{source_checksum, Program, Row, SideEffect};
use crate::selector::Selector;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedProgram {
    pub fqn: String,
    pub primitive: Primitive,
    pub side_effects: Vec<SideEffect>,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// `None` when the program found the event not applicable.
    pub result: Option<Value>,
    pub keys: EntityKeys,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ProgramRuntime {
    programs: RwLock<HashMap<String, Arc<Program>>>,
}

impl ProgramRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and caches `source` under `fqn`. Loading the same source again is a no-op.
    pub fn load_program(&self, fqn: &str, source: &str) -> Result<LoadedProgram, EngineError> {
        let fqn = canonical_fqn(fqn)?;
        let checksum = source_checksum(source);

        let cached = self
            .programs
            .read()
            .expect("program table lock should not be poisoned")
            .get(&fqn)
            .filter(|p| p.checksum() == checksum)
            .cloned();
        let program = match cached {
            Some(program) => {
                debug!(
                    component = "runtime",
                    event = "runtime.program.cached",
                    fqn = %fqn,
                    checksum = %checksum
                );
                program
            }
            None => {
                let program = Arc::new(Program::parse(source)?);
                self.programs
                    .write()
                    .expect("program table lock should not be poisoned")
                    .insert(fqn.clone(), Arc::clone(&program));
                info!(
                    component = "runtime",
                    event = "runtime.program.loaded",
                    fqn = %fqn,
                    checksum = %checksum,
                    dependencies = program.side_effects().len()
                );
                program
            }
        };

        Ok(LoadedProgram {
            fqn,
            primitive: program.primitive(),
            side_effects: program.side_effects().to_vec(),
            checksum,
        })
    }

    pub fn unload_program(&self, fqn: &str) -> bool {
        self.programs
            .write()
            .expect("program table lock should not be poisoned")
            .remove(fqn)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.programs
            .read()
            .expect("program table lock should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the program loaded under `fqn` for one event.
    ///
    /// Keys and timestamp returned by the program replace the calling ones.
    pub fn execute_program(
        &self,
        fqn: &str,
        keys: EntityKeys,
        timestamp: DateTime<Utc>,
        row: &Row,
        resolver: &dyn FeatureResolver,
    ) -> Result<Execution, EngineError> {
        let fqn = canonical_fqn(fqn)?;
        let program = self
            .programs
            .read()
            .expect("program table lock should not be poisoned")
            .get(&fqn)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSpec(fqn.clone()))?;

        let ctx = Context::new(&fqn, keys.clone(), timestamp, resolver)?;
        let output = program
            .call(row, &ctx)
            .map_err(|source| EngineError::ProgramFailed {
                feature: fqn.clone(),
                source,
            })?;

        let result = output
            .value
            .map(|value| {
                value
                    .conform_to(program.primitive())
                    .map_err(|actual| EngineError::TypeMismatch {
                        feature: fqn.clone(),
                        expected: program.primitive(),
                        actual: actual
                            .primitive()
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "empty list".to_string()),
                    })
            })
            .transpose()?;

        Ok(Execution {
            result,
            keys: output.keys.unwrap_or(keys),
            timestamp: output.timestamp.unwrap_or(timestamp),
        })
    }
}

fn canonical_fqn(fqn: &str) -> Result<String, EngineError> {
    let selector = Selector::parse(fqn, "")?;
    if selector.namespace.is_empty() {
        return Err(crate::selector::SelectorError::InvalidSelector(fqn.to_string()).into());
    }
    Ok(selector.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::context::FeatureLookup;

    struct Constant;

    impl FeatureResolver for Constant {
        fn get_feature(
            &self,
            _selector: &str,
            _keys: &EntityKeys,
            as_of: DateTime<Utc>,
        ) -> Result<FeatureLookup, EngineError> {
            Ok((Some(Value::Int(10)), Some(as_of)))
        }

        fn get_prediction(
            &self,
            _selector: &str,
            _keys: &EntityKeys,
            _as_of: DateTime<Utc>,
        ) -> Result<Value, EngineError> {
            Ok(Value::Float(0.5))
        }
    }

    const SOURCE: &str = "def plus(row, ctx) -> int:\n    base, _ = ctx.get_feature('ns.base')\n    return base + row['n']\n";

    #[test]
    fn loading_is_idempotent_per_checksum() {
        let runtime = ProgramRuntime::new();
        let first = runtime.load_program("ns.plus", SOURCE).unwrap();
        let again = runtime.load_program("ns.plus", SOURCE).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.primitive, Primitive::Integer);
        assert_eq!(first.side_effects[0].selector, "ns.base");
        assert_eq!(runtime.len(), 1);

        let changed = runtime
            .load_program("ns.plus", "def plus(row, ctx) -> int:\n    return 1\n")
            .unwrap();
        assert_ne!(changed.checksum, first.checksum);
        assert_eq!(runtime.len(), 1);
    }

    #[test]
    fn executes_with_resolver() {
        let runtime = ProgramRuntime::new();
        runtime.load_program("ns.plus", SOURCE).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let row = Row::from([("n".to_string(), Some(Value::Int(5)))]);
        let out = runtime
            .execute_program("ns.plus", EntityKeys::new(), ts, &row, &Constant)
            .unwrap();
        assert_eq!(out.result, Some(Value::Int(15)));
        assert_eq!(out.timestamp, ts);

        assert!(matches!(
            runtime.execute_program("ns.other", EntityKeys::new(), ts, &row, &Constant),
            Err(EngineError::UnknownSpec(_))
        ));
        assert!(runtime.unload_program("ns.plus"));
        assert!(runtime.is_empty());
    }

    #[test]
    fn rejects_unqualified_names() {
        let runtime = ProgramRuntime::new();
        assert!(runtime.load_program("plus", SOURCE).is_err());
    }
}
