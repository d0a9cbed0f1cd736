//! Feature programs: a small sandboxed language with Python-like syntax.
//!
//! A program is one function `def name(row, ctx) -> type:` whose body is
//! parsed into an AST, statically checked, and interpreted per row.
//! Parsing also extracts the program's dependencies (its `ctx.get_feature`
//! and `ctx.get_prediction` calls) so the caller can order replays.

mod ast;
mod interp;
mod lexer;
mod parser;
mod validate;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::context::Context;
use crate::error::EngineError;
use crate::keys::EntityKeys;
use crate::primitive::{Primitive, Value};

use ast::{ExprKind, FunctionDef};
use validate::Import;

/// Column name to cell; nulls are `None`.
pub type Row = BTreeMap<String, Option<Value>>;

/// Maps a bare feature name used as a dependency argument to its FQN.
pub type DependencyResolver<'a> = dyn Fn(&str) -> Result<String, ProgramError> + 'a;

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("syntax error at line {line}, column {col}: {message}")]
    Syntax {
        line: usize,
        col: usize,
        message: String,
    },
    #[error("invalid program at line {line}: {message}")]
    Validation { line: usize, message: String },
    #[error("function {function} needs a supported return type annotation")]
    MissingTypeAnnotation { function: String },
    #[error("cannot resolve dependency '{0}': no such feature")]
    UnresolvableDependency(String),
    #[error("'{0}' is an aggregated feature; reference it with a selector such as '{0}+sum'")]
    AggregatedFeatureRequiresSelector(String),
    #[error("{function} failed at line {line}: {message}")]
    Runtime {
        function: String,
        line: usize,
        message: String,
    },
    #[error("{function} failed at line {line}: {source}")]
    Dependency {
        function: String,
        line: usize,
        source: Box<EngineError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    GetFeature,
    GetPrediction,
}

/// A dependency call found in the program body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SideEffect {
    pub kind: SideEffectKind,
    pub selector: String,
    pub conditional: bool,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramOutput {
    pub value: Option<Value>,
    /// Entity keys returned by the program, overriding the calling keys.
    pub keys: Option<EntityKeys>,
    /// Timestamp returned by the program, overriding the calling timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Program {
    name: String,
    source: String,
    checksum: String,
    primitive: Primitive,
    side_effects: Vec<SideEffect>,
    #[serde(skip)]
    function: FunctionDef,
    #[serde(skip)]
    imports: HashMap<String, Import>,
}

impl Program {
    /// Parses a program whose dependencies are all string selectors.
    pub fn parse(source: &str) -> Result<Self, ProgramError> {
        Self::compile(source, None)
    }

    /// Parses a program, resolving bare-name dependency arguments with `resolver`.
    pub fn parse_with_resolver(
        source: &str,
        resolver: &DependencyResolver<'_>,
    ) -> Result<Self, ProgramError> {
        Self::compile(source, Some(resolver))
    }

    fn compile(
        source: &str,
        resolver: Option<&DependencyResolver<'_>>,
    ) -> Result<Self, ProgramError> {
        let mut function = parser::parse_function(source)?;
        let primitive = function
            .returns
            .as_ref()
            .and_then(annotation_primitive)
            .ok_or_else(|| ProgramError::MissingTypeAnnotation {
                function: function.name.clone(),
            })?;
        let analysis = validate::analyze(&mut function, resolver)?;

        Ok(Self {
            name: function.name.clone(),
            source: source.to_string(),
            checksum: source_checksum(source),
            primitive,
            side_effects: analysis.side_effects,
            function,
            imports: analysis.imports,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// SHA-256 of the source, hex encoded.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn primitive(&self) -> Primitive {
        self.primitive
    }

    pub fn side_effects(&self) -> &[SideEffect] {
        &self.side_effects
    }

    /// Runs the program for one row.
    pub fn call(&self, row: &Row, ctx: &Context<'_>) -> Result<ProgramOutput, ProgramError> {
        interp::Interpreter::new(self, ctx, row).run()
    }
}

pub fn source_checksum(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

fn annotation_primitive(expr: &ast::Expr) -> Option<Primitive> {
    match &expr.kind {
        ExprKind::Name(name) => scalar_annotation(name),
        ExprKind::Str(name) => scalar_annotation(name),
        ExprKind::Attr(module, name) => match (&module.kind, name.as_str()) {
            (ExprKind::Name(m), "datetime") if m == "datetime" => Some(Primitive::Timestamp),
            _ => None,
        },
        ExprKind::Index(container, element) => match &container.kind {
            ExprKind::Name(c) if c == "List" || c == "list" => {
                annotation_primitive(element)?.list_of()
            }
            ExprKind::Attr(module, c)
                if c == "List" && matches!(&module.kind, ExprKind::Name(m) if m == "typing") =>
            {
                annotation_primitive(element)?.list_of()
            }
            _ => None,
        },
        _ => None,
    }
}

fn scalar_annotation(name: &str) -> Option<Primitive> {
    match name {
        "str" => Some(Primitive::String),
        "int" => Some(Primitive::Integer),
        "float" => Some(Primitive::Float),
        "bool" => Some(Primitive::Boolean),
        "datetime" => Some(Primitive::Timestamp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_return_annotation() {
        let cases = [
            ("str", Primitive::String),
            ("int", Primitive::Integer),
            ("float", Primitive::Float),
            ("bool", Primitive::Boolean),
            ("datetime", Primitive::Timestamp),
            ("datetime.datetime", Primitive::Timestamp),
            ("List[str]", Primitive::StringList),
            ("list[float]", Primitive::FloatList),
        ];
        for (annotation, expected) in cases {
            let source = format!("def f(row, ctx) -> {annotation}:\n    return None\n");
            assert_eq!(Program::parse(&source).unwrap().primitive(), expected);
        }
    }

    #[test]
    fn missing_annotation_is_rejected() {
        for source in [
            "def f(row, ctx):\n    return 1\n",
            "def f(row, ctx) -> dict:\n    return 1\n",
            "def f(row, ctx) -> List[List[int]]:\n    return 1\n",
        ] {
            assert!(matches!(
                Program::parse(source).unwrap_err(),
                ProgramError::MissingTypeAnnotation { .. }
            ));
        }
    }

    #[test]
    fn checksum_tracks_source() {
        let a = Program::parse("def f(row, ctx) -> int:\n    return 1\n").unwrap();
        let b = Program::parse("def f(row, ctx) -> int:\n    return 2\n").unwrap();
        assert_eq!(a.checksum().len(), 64);
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.checksum(), source_checksum(a.source()));
    }

    #[test]
    fn serializes_public_fields() {
        let p = Program::parse(
            "def f(row, ctx) -> float:\n    v, _ = ctx.get_feature('ns.other')\n    return v\n",
        )
        .unwrap();
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["name"], "f");
        assert_eq!(json["primitive"], "float");
        assert_eq!(json["side_effects"][0]["kind"], "get_feature");
        assert_eq!(json["side_effects"][0]["selector"], "ns.other");
        assert!(json.get("function").is_none());
    }
}
