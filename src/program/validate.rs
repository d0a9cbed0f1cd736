use std::collections::HashMap;

use super::ast::{Expr, ExprKind, FunctionDef, ImportName, Stmt, StmtKind};
use super::{DependencyResolver, ProgramError, SideEffect, SideEffectKind};
use crate::selector::{Selector, DEFAULT_NAMESPACE};

const BLOCKED_DATASET_PACKAGES: &[&str] = &["pandas", "polars", "dask", "pyspark"];

const BLOCKED_MODELING_PACKAGES: &[&str] = &[
    "sklearn", "tensorflow", "xgboost", "lightgbm", "catboost", "torch", "torchvision",
    "torchaudio", "keras", "fastai", "pytorch_lightning", "onnx", "onnxruntime", "scipy",
    "matplotlib", "statsmodels", "sktime", "pmdarima", "seaborn", "transformers", "theano",
    "nltk", "h5py", "librosa",
];

const BLOCKED_IO_PACKAGES: &[&str] = &[
    "os", "sys", "subprocess", "shutil", "http", "urllib", "urllib2", "urllib3", "socket",
    "multiprocessing", "threading", "winreg", "requests", "tempfile", "asyncio", "io", "gevent",
    "grequests", "aiohttp", "uplink", "httpx", "builtins", "importlib", "ctypes", "pickle",
];

const BLOCKED_BUILTINS: &[&str] = &[
    "compile", "eval", "exec", "open", "input", "file", "dir", "quit", "exit", "globals",
    "locals", "vars", "getattr", "setattr", "delattr", "__import__", "breakpoint", "help",
    "memoryview",
];

pub(crate) const BUILTINS: &[&str] = &[
    "len", "abs", "min", "max", "sum", "round", "int", "float", "str", "bool", "timedelta",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SandboxModule {
    Math,
    Datetime,
}

impl SandboxModule {
    fn by_name(name: &str) -> Option<Self> {
        match name {
            "math" => Some(Self::Math),
            "datetime" => Some(Self::Datetime),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Math => "math",
            Self::Datetime => "datetime",
        }
    }

    pub fn has_function(self, function: &str) -> bool {
        match self {
            Self::Math => matches!(
                function,
                "sqrt" | "log" | "log10" | "exp" | "floor" | "ceil" | "fabs" | "pow" | "isnan"
                    | "isinf"
            ),
            Self::Datetime => matches!(function, "timedelta" | "datetime"),
        }
    }

    fn has_member(self, member: &str) -> bool {
        self.has_function(member)
            || match self {
                Self::Math => matches!(member, "pi" | "e" | "inf" | "nan"),
                Self::Datetime => member == "timezone",
            }
    }
}

/// What an imported name is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Import {
    Module(SandboxModule),
    Function(SandboxModule, String),
    /// Importable but only meaningful in annotations (`from datetime import timezone`).
    Marker,
}

pub(crate) struct Analysis {
    pub side_effects: Vec<SideEffect>,
    pub imports: HashMap<String, Import>,
}

struct Analyzer<'r, 'a> {
    function: String,
    ctx_param: String,
    resolver: Option<&'r DependencyResolver<'a>>,
    imports: HashMap<String, Import>,
    side_effects: Vec<SideEffect>,
    conditional: usize,
}

/// Enforces the sandbox rules and collects dependencies and imports.
///
/// Bare-name dependency arguments are rewritten in place to the FQN the
/// resolver returns.
pub(crate) fn analyze(
    function: &mut FunctionDef,
    resolver: Option<&DependencyResolver<'_>>,
) -> Result<Analysis, ProgramError> {
    if function.params.len() != 2 {
        return Err(ProgramError::Validation {
            line: function.line,
            message: format!(
                "function {} must take exactly two arguments (row, context), got {}",
                function.name,
                function.params.len()
            ),
        });
    }

    let mut analyzer = Analyzer {
        function: function.name.clone(),
        ctx_param: function.params[1].clone(),
        resolver,
        imports: HashMap::new(),
        side_effects: Vec::new(),
        conditional: 0,
    };
    for stmt in &function.preamble {
        analyzer.import(stmt)?;
    }
    analyzer.block(&mut function.body)?;

    Ok(Analysis {
        side_effects: analyzer.side_effects,
        imports: analyzer.imports,
    })
}

fn invalid(line: usize, message: impl Into<String>) -> ProgramError {
    ProgramError::Validation {
        line,
        message: message.into(),
    }
}

fn check_module_allowed(module: &str, line: usize) -> Result<SandboxModule, ProgramError> {
    let root = module.split('.').next().unwrap_or(module);
    if BLOCKED_DATASET_PACKAGES.contains(&root) {
        return Err(invalid(
            line,
            format!("dataset package '{root}' cannot be used; feature programs work on one row at a time"),
        ));
    }
    if BLOCKED_MODELING_PACKAGES.contains(&root) {
        return Err(invalid(
            line,
            format!("modeling package '{root}' cannot be used in a feature program"),
        ));
    }
    if BLOCKED_IO_PACKAGES.contains(&root) {
        return Err(invalid(
            line,
            format!("i/o package '{root}' is restricted in feature programs"),
        ));
    }
    match SandboxModule::by_name(module) {
        Some(m) => Ok(m),
        None => Err(invalid(
            line,
            format!("module '{module}' is not available in feature programs"),
        )),
    }
}

impl Analyzer<'_, '_> {
    fn import(&mut self, stmt: &Stmt) -> Result<(), ProgramError> {
        match &stmt.kind {
            StmtKind::Import(names) => {
                for ImportName { name, alias } in names {
                    let module = check_module_allowed(name, stmt.line)?;
                    let bound = alias.clone().unwrap_or_else(|| name.clone());
                    self.imports.insert(bound, Import::Module(module));
                }
            }
            StmtKind::FromImport { module, names } => {
                let sandbox = check_module_allowed(module, stmt.line)?;
                for item in names {
                    if !sandbox.has_member(&item.name) {
                        return Err(invalid(
                            stmt.line,
                            format!("cannot import '{}' from {}", item.name, sandbox.name()),
                        ));
                    }
                    let binding = if sandbox.has_function(&item.name) {
                        Import::Function(sandbox, item.name.clone())
                    } else {
                        Import::Marker
                    };
                    self.imports.insert(item.bound_name().to_string(), binding);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn block(&mut self, stmts: &mut [Stmt]) -> Result<(), ProgramError> {
        for stmt in stmts {
            self.statement(stmt)?;
        }
        Ok(())
    }

    fn conditional_block(&mut self, stmts: &mut [Stmt]) -> Result<(), ProgramError> {
        self.conditional += 1;
        let result = self.block(stmts);
        self.conditional -= 1;
        result
    }

    fn conditional_expr(&mut self, expr: &mut Expr) -> Result<(), ProgramError> {
        self.conditional += 1;
        let result = self.expr(expr);
        self.conditional -= 1;
        result
    }

    fn statement(&mut self, stmt: &mut Stmt) -> Result<(), ProgramError> {
        if matches!(stmt.kind, StmtKind::Import(_) | StmtKind::FromImport { .. }) {
            return self.import(stmt);
        }
        match &mut stmt.kind {
            StmtKind::Return(Some(value)) | StmtKind::Expr(value) => self.expr(value),
            StmtKind::Assign { value, .. } | StmtKind::AugAssign { value, .. } => self.expr(value),
            StmtKind::If { branches, orelse } => {
                for (idx, (cond, body)) in branches.iter_mut().enumerate() {
                    if idx == 0 {
                        self.expr(cond)?;
                    } else {
                        self.conditional_expr(cond)?;
                    }
                    self.conditional_block(body)?;
                }
                self.conditional_block(orelse)
            }
            StmtKind::For { iter, body, .. } => {
                self.expr(iter)?;
                self.block(body)
            }
            StmtKind::Import(_)
            | StmtKind::FromImport { .. }
            | StmtKind::Return(None)
            | StmtKind::Pass => Ok(()),
        }
    }

    fn expr(&mut self, expr: &mut Expr) -> Result<(), ProgramError> {
        let line = expr.line;
        match &mut expr.kind {
            ExprKind::None
            | ExprKind::Bool(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::Name(_) => Ok(()),
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                items.iter_mut().try_for_each(|item| self.expr(item))
            }
            ExprKind::Dict(entries) => {
                for (key, value) in entries {
                    self.expr(key)?;
                    self.expr(value)?;
                }
                Ok(())
            }
            ExprKind::Attr(target, _) => self.expr(target),
            ExprKind::Index(target, index) => {
                self.expr(target)?;
                self.expr(index)
            }
            ExprKind::Unary(_, operand) => self.expr(operand),
            ExprKind::Binary(_, left, right) => {
                self.expr(left)?;
                self.expr(right)
            }
            ExprKind::Compare(left, rest) => {
                self.expr(left)?;
                rest.iter_mut().try_for_each(|(_, right)| self.expr(right))
            }
            ExprKind::Logic(_, left, right) => {
                self.expr(left)?;
                self.conditional_expr(right)
            }
            ExprKind::IfExp { cond, then, orelse } => {
                self.expr(cond)?;
                self.conditional_expr(then)?;
                self.conditional_expr(orelse)
            }
            ExprKind::Call { func, args, kwargs } => {
                self.call(func, args, kwargs, line)?;
                args.iter_mut().try_for_each(|arg| self.expr(arg))?;
                kwargs.iter_mut().try_for_each(|(_, arg)| self.expr(arg))
            }
        }
    }

    fn call(
        &mut self,
        func: &mut Expr,
        args: &mut [Expr],
        kwargs: &mut [(String, Expr)],
        line: usize,
    ) -> Result<(), ProgramError> {
        if !matches!(func.kind, ExprKind::Name(_) | ExprKind::Attr(..)) {
            return self.expr(func);
        }
        match &mut func.kind {
            ExprKind::Name(name) => {
                if *name == self.function {
                    return Err(invalid(line, "recursion is not allowed in feature programs"));
                }
                if BLOCKED_BUILTINS.contains(&name.as_str()) {
                    return Err(invalid(line, format!("builtin '{name}' is blocked")));
                }
                let imported = matches!(self.imports.get(name.as_str()), Some(Import::Function(..)));
                if !imported && !BUILTINS.contains(&name.as_str()) {
                    return Err(invalid(line, format!("unknown function '{name}'")));
                }
                Ok(())
            }
            ExprKind::Attr(target, method) => {
                if let ExprKind::Name(object) = &target.kind {
                    if *object == self.ctx_param {
                        let kind = match method.as_str() {
                            "get_feature" | "f" => SideEffectKind::GetFeature,
                            "get_prediction" => SideEffectKind::GetPrediction,
                            other => {
                                return Err(invalid(
                                    line,
                                    format!("context has no method '{other}'"),
                                ))
                            }
                        };
                        return self.dependency(kind, args, kwargs, line);
                    }
                    if let Some(Import::Module(module)) = self.imports.get(object.as_str()) {
                        if !module.has_function(method) {
                            return Err(invalid(
                                line,
                                format!("module {} has no function '{method}'", module.name()),
                            ));
                        }
                        return Ok(());
                    }
                }
                self.expr(target)
            }
            _ => Ok(()),
        }
    }

    fn dependency(
        &mut self,
        kind: SideEffectKind,
        args: &mut [Expr],
        kwargs: &mut [(String, Expr)],
        line: usize,
    ) -> Result<(), ProgramError> {
        let target = match args.first_mut() {
            Some(arg) => Some(arg),
            None => kwargs
                .iter_mut()
                .find(|(name, _)| name == "selector" || name == "fqn")
                .map(|(_, arg)| arg),
        };
        let Some(target) = target else {
            return Err(invalid(line, "dependency call needs a selector argument"));
        };

        let selector = match &target.kind {
            ExprKind::Str(selector) => selector.clone(),
            ExprKind::Name(name) => {
                let name = name.clone();
                let Some(resolver) = self.resolver else {
                    return Err(invalid(
                        line,
                        format!("non-string dependency argument '{name}'; pass the selector as a string"),
                    ));
                };
                let fqn = resolver(&name)?;
                target.kind = ExprKind::Str(fqn.clone());
                fqn
            }
            _ => return Err(invalid(line, "non-string dependency argument")),
        };

        if Selector::parse(&selector, DEFAULT_NAMESPACE).is_err() {
            return Err(invalid(line, format!("invalid dependency selector '{selector}'")));
        }
        self.side_effects.push(SideEffect {
            kind,
            selector,
            conditional: self.conditional > 0,
            line,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Program;
    use super::*;

    fn validation_message(source: &str) -> String {
        match Program::parse(source).unwrap_err() {
            ProgramError::Validation { message, .. } => message,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn requires_two_parameters() {
        let msg = validation_message("def f(row) -> int:\n    return 1\n");
        assert!(msg.contains("exactly two arguments"));
    }

    #[test]
    fn rejects_denylisted_imports() {
        assert!(validation_message("import pandas\ndef f(r, c) -> int:\n    return 1\n")
            .contains("dataset package"));
        assert!(validation_message("def f(r, c) -> int:\n    import sklearn.linear_model\n    return 1\n")
            .contains("modeling package"));
        assert!(validation_message("def f(r, c) -> int:\n    from os import path\n    return 1\n")
            .contains("i/o package"));
        assert!(validation_message("def f(r, c) -> int:\n    import json\n    return 1\n")
            .contains("not available"));
    }

    #[test]
    fn rejects_recursion_and_blocked_builtins() {
        assert!(validation_message("def f(r, c) -> int:\n    return f(r, c)\n")
            .contains("recursion"));
        assert!(validation_message("def f(r, c) -> int:\n    return eval('1')\n")
            .contains("blocked"));
        assert!(validation_message("def f(r, c) -> int:\n    return frobnicate(1)\n")
            .contains("unknown function"));
    }

    #[test]
    fn collects_side_effects_with_conditional_flag() {
        let program = Program::parse(
            "def f(row, ctx) -> float:\n    a, _ = ctx.get_feature('ns.a')\n    if a is None:\n        b, _ = ctx.f('b+sum')\n        return b\n    return ctx.get_prediction('ns.model')[0] if a > 1 else a\n",
        )
        .unwrap();
        let effects = program.side_effects();
        assert_eq!(effects.len(), 3);
        assert_eq!(effects[0].selector, "ns.a");
        assert!(!effects[0].conditional);
        assert_eq!(effects[1].selector, "b+sum");
        assert!(effects[1].conditional);
        assert_eq!(effects[1].line, 4);
        assert_eq!(effects[2].kind, SideEffectKind::GetPrediction);
        assert!(effects[2].conditional);
    }

    #[test]
    fn bare_names_need_a_resolver() {
        let source = "def f(row, ctx) -> float:\n    v, _ = ctx.get_feature(other)\n    return v\n";
        assert!(validation_message(source).contains("non-string dependency argument"));

        let resolver = |name: &str| -> Result<String, ProgramError> {
            match name {
                "other" => Ok("bank.other".to_string()),
                "agg" => Err(ProgramError::AggregatedFeatureRequiresSelector(name.to_string())),
                _ => Err(ProgramError::UnresolvableDependency(name.to_string())),
            }
        };
        let program = Program::parse_with_resolver(source, &resolver).unwrap();
        assert_eq!(program.side_effects()[0].selector, "bank.other");

        let err = Program::parse_with_resolver(
            "def f(row, ctx) -> float:\n    return ctx.get_feature(missing)[0]\n",
            &resolver,
        )
        .unwrap_err();
        assert!(matches!(err, ProgramError::UnresolvableDependency(name) if name == "missing"));

        let err = Program::parse_with_resolver(
            "def f(row, ctx) -> float:\n    return ctx.get_feature(agg)[0]\n",
            &resolver,
        )
        .unwrap_err();
        assert!(matches!(err, ProgramError::AggregatedFeatureRequiresSelector(_)));
    }

    #[test]
    fn computed_selectors_are_rejected() {
        let msg = validation_message(
            "def f(row, ctx) -> float:\n    return ctx.get_feature('a' + 'b')[0]\n",
        );
        assert!(msg.contains("non-string"));
    }
}
