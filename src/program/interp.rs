use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, SecondsFormat, Timelike, Utc};

use super::ast::{BinOp, BoolOp, CmpOp, Expr, ExprKind, Stmt, StmtKind, UnaryOp};
use super::validate::{Import, SandboxModule};
use super::{Program, ProgramError, ProgramOutput, Row};
use crate::context::Context;
use crate::error::EngineError;
use crate::keys::EntityKeys;
use crate::primitive::Value;

/// Runtime values. A superset of [`Value`] with the shapes programs
/// juggle internally.
#[derive(Debug, Clone)]
enum RtValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
    Interval(Duration),
    List(Vec<RtValue>),
    Tuple(Vec<RtValue>),
    Dict(BTreeMap<String, RtValue>),
    Context,
    Module(SandboxModule),
}

impl RtValue {
    fn type_name(&self) -> &'static str {
        match self {
            RtValue::None => "NoneType",
            RtValue::Bool(_) => "bool",
            RtValue::Int(_) => "int",
            RtValue::Float(_) => "float",
            RtValue::Str(_) => "str",
            RtValue::Timestamp(_) => "datetime",
            RtValue::Interval(_) => "timedelta",
            RtValue::List(_) => "list",
            RtValue::Tuple(_) => "tuple",
            RtValue::Dict(_) => "dict",
            RtValue::Context => "Context",
            RtValue::Module(_) => "module",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            RtValue::None => false,
            RtValue::Bool(b) => *b,
            RtValue::Int(i) => *i != 0,
            RtValue::Float(f) => *f != 0.0,
            RtValue::Str(s) => !s.is_empty(),
            RtValue::Interval(d) => !d.is_zero(),
            RtValue::List(items) | RtValue::Tuple(items) => !items.is_empty(),
            RtValue::Dict(entries) => !entries.is_empty(),
            RtValue::Timestamp(_) | RtValue::Context | RtValue::Module(_) => true,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            RtValue::Int(i) => Some(*i as f64),
            RtValue::Float(f) => Some(*f),
            RtValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn from_value(value: Value) -> Self {
        match value {
            Value::Str(s) => RtValue::Str(s),
            Value::Int(i) => RtValue::Int(i),
            Value::Float(f) => RtValue::Float(f),
            Value::Bool(b) => RtValue::Bool(b),
            Value::Timestamp(ts) => RtValue::Timestamp(ts),
            Value::List(items) => RtValue::List(items.into_iter().map(Self::from_value).collect()),
        }
    }

    fn from_optional(value: Option<Value>) -> Self {
        value.map(Self::from_value).unwrap_or(RtValue::None)
    }

    fn into_value(self) -> Result<Option<Value>, String> {
        match self {
            RtValue::None => Ok(None),
            RtValue::Bool(b) => Ok(Some(Value::Bool(b))),
            RtValue::Int(i) => Ok(Some(Value::Int(i))),
            RtValue::Float(f) => Ok(Some(Value::Float(f))),
            RtValue::Str(s) => Ok(Some(Value::Str(s))),
            RtValue::Timestamp(ts) => Ok(Some(Value::Timestamp(ts))),
            RtValue::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item.into_value()? {
                        Some(v) => values.push(v),
                        None => return Err("lists may not contain None".to_string()),
                    }
                }
                Value::list(values)
                    .map(Some)
                    .ok_or_else(|| "list values must share one primitive type".to_string())
            }
            other => Err(format!("cannot return a {} value", other.type_name())),
        }
    }
}

impl fmt::Display for RtValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtValue::None => f.write_str("None"),
            RtValue::Bool(true) => f.write_str("True"),
            RtValue::Bool(false) => f.write_str("False"),
            RtValue::Int(i) => write!(f, "{i}"),
            RtValue::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{v:.1}"),
            RtValue::Float(v) => write!(f, "{v}"),
            RtValue::Str(s) => f.write_str(s),
            RtValue::Timestamp(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            RtValue::Interval(d) => f.write_str(&crate::duration::format_duration(*d)),
            RtValue::List(items) => write_seq(f, "[", items, "]"),
            RtValue::Tuple(items) => write_seq(f, "(", items, ")"),
            RtValue::Dict(entries) => {
                f.write_str("{")?;
                for (idx, (k, v)) in entries.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{k}': {v}")?;
                }
                f.write_str("}")
            }
            RtValue::Context => f.write_str("<context>"),
            RtValue::Module(m) => write!(f, "<module '{}'>", m.name()),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, open: &str, items: &[RtValue], close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        match item {
            RtValue::Str(s) => write!(f, "'{s}'")?,
            other => write!(f, "{other}")?,
        }
    }
    f.write_str(close)
}

enum Flow {
    Normal,
    Return(RtValue),
}

type EvalResult = Result<RtValue, ProgramError>;

pub(crate) struct Interpreter<'a> {
    program: &'a Program,
    ctx: &'a Context<'a>,
    locals: HashMap<String, RtValue>,
}

impl<'a> Interpreter<'a> {
    pub fn new(program: &'a Program, ctx: &'a Context<'a>, row: &Row) -> Self {
        let mut locals = HashMap::new();
        let row_dict = row
            .iter()
            .map(|(column, cell)| (column.clone(), RtValue::from_optional(cell.clone())))
            .collect();
        locals.insert(program.function.params[0].clone(), RtValue::Dict(row_dict));
        locals.insert(program.function.params[1].clone(), RtValue::Context);
        for (name, import) in &program.imports {
            if let Import::Module(module) = import {
                locals.insert(name.clone(), RtValue::Module(*module));
            }
        }
        Self {
            program,
            ctx,
            locals,
        }
    }

    pub fn run(mut self) -> Result<ProgramOutput, ProgramError> {
        let program = self.program;
        let line = program.function.line;
        let result = match self.block(&program.function.body)? {
            Flow::Return(value) => value,
            Flow::Normal => RtValue::None,
        };

        if let RtValue::Tuple(items) = &result {
            let overrides_keys = matches!(items.get(1), Some(RtValue::Dict(_) | RtValue::None));
            if (items.len() == 2 || items.len() == 3) && overrides_keys {
                return self.output_with_overrides(items.clone(), line);
            }
        }
        let value = result
            .into_value()
            .map_err(|message| self.fail(line, message))?;
        Ok(ProgramOutput {
            value,
            keys: None,
            timestamp: None,
        })
    }

    fn output_with_overrides(
        &self,
        items: Vec<RtValue>,
        line: usize,
    ) -> Result<ProgramOutput, ProgramError> {
        let mut items = items.into_iter();
        let value = items
            .next()
            .unwrap_or(RtValue::None)
            .into_value()
            .map_err(|message| self.fail(line, message))?;
        let keys = match items.next() {
            Some(RtValue::Dict(entries)) => Some(self.entity_keys(entries, line)?),
            _ => None,
        };
        let timestamp = match items.next() {
            Some(RtValue::Timestamp(ts)) => Some(ts),
            None | Some(RtValue::None) => None,
            Some(other) => {
                return Err(self.fail(
                    line,
                    format!("returned timestamp must be a datetime, got {}", other.type_name()),
                ))
            }
        };
        Ok(ProgramOutput {
            value,
            keys,
            timestamp,
        })
    }

    fn fail(&self, line: usize, message: impl Into<String>) -> ProgramError {
        ProgramError::Runtime {
            function: self.program.name.clone(),
            line,
            message: message.into(),
        }
    }

    fn entity_keys(
        &self,
        entries: BTreeMap<String, RtValue>,
        line: usize,
    ) -> Result<EntityKeys, ProgramError> {
        entries
            .into_iter()
            .map(|(k, v)| match v {
                RtValue::None => Err(self.fail(line, format!("key '{k}' is None"))),
                other => Ok((k, other.to_string())),
            })
            .collect()
    }

    fn block(&mut self, stmts: &'a [Stmt]) -> Result<Flow, ProgramError> {
        for stmt in stmts {
            if let Flow::Return(value) = self.statement(stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn statement(&mut self, stmt: &'a Stmt) -> Result<Flow, ProgramError> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => RtValue::None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Assign {
                targets,
                unpack,
                value,
            } => {
                let value = self.eval(value)?;
                if *unpack {
                    self.unpack(targets, value, line)?;
                } else if let Some(target) = targets.first() {
                    self.locals.insert(target.clone(), value);
                }
                Ok(Flow::Normal)
            }
            StmtKind::AugAssign { target, op, value } => {
                let current = self
                    .locals
                    .get(target)
                    .cloned()
                    .ok_or_else(|| self.fail(line, format!("name '{target}' is not defined")))?;
                let rhs = self.eval(value)?;
                let updated = self.binary(*op, current, rhs, line)?;
                self.locals.insert(target.clone(), updated);
                Ok(Flow::Normal)
            }
            StmtKind::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.block(body);
                    }
                }
                self.block(orelse)
            }
            StmtKind::For {
                targets,
                iter,
                body,
            } => {
                let items = match self.eval(iter)? {
                    RtValue::List(items) | RtValue::Tuple(items) => items,
                    RtValue::Dict(entries) => entries.into_keys().map(RtValue::Str).collect(),
                    RtValue::Str(s) => s.chars().map(|c| RtValue::Str(c.to_string())).collect(),
                    other => {
                        return Err(
                            self.fail(line, format!("'{}' object is not iterable", other.type_name()))
                        )
                    }
                };
                for item in items {
                    if targets.len() == 1 {
                        self.locals.insert(targets[0].clone(), item);
                    } else {
                        self.unpack(targets, item, line)?;
                    }
                    if let Flow::Return(value) = self.block(body)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            StmtKind::Pass | StmtKind::Import(_) | StmtKind::FromImport { .. } => Ok(Flow::Normal),
        }
    }

    fn unpack(&mut self, targets: &[String], value: RtValue, line: usize) -> Result<(), ProgramError> {
        let items = match value {
            RtValue::Tuple(items) | RtValue::List(items) => items,
            other => {
                return Err(self.fail(
                    line,
                    format!("cannot unpack non-sequence {}", other.type_name()),
                ))
            }
        };
        if items.len() != targets.len() {
            return Err(self.fail(
                line,
                format!(
                    "expected {} values to unpack, got {}",
                    targets.len(),
                    items.len()
                ),
            ));
        }
        for (target, item) in targets.iter().zip(items) {
            self.locals.insert(target.clone(), item);
        }
        Ok(())
    }

    fn eval(&mut self, expr: &'a Expr) -> EvalResult {
        let line = expr.line;
        match &expr.kind {
            ExprKind::None => Ok(RtValue::None),
            ExprKind::Bool(b) => Ok(RtValue::Bool(*b)),
            ExprKind::Int(i) => Ok(RtValue::Int(*i)),
            ExprKind::Float(f) => Ok(RtValue::Float(*f)),
            ExprKind::Str(s) => Ok(RtValue::Str(s.clone())),
            ExprKind::Name(name) => self
                .locals
                .get(name)
                .cloned()
                .ok_or_else(|| self.fail(line, format!("name '{name}' is not defined"))),
            ExprKind::List(items) => Ok(RtValue::List(self.eval_all(items)?)),
            ExprKind::Tuple(items) => Ok(RtValue::Tuple(self.eval_all(items)?)),
            ExprKind::Dict(entries) => {
                let mut out = BTreeMap::new();
                for (key, value) in entries {
                    let RtValue::Str(key) = self.eval(key)? else {
                        return Err(self.fail(line, "dict keys must be strings"));
                    };
                    let value = self.eval(value)?;
                    out.insert(key, value);
                }
                Ok(RtValue::Dict(out))
            }
            ExprKind::Attr(target, name) => {
                let target = self.eval(target)?;
                self.attribute(target, name, line)
            }
            ExprKind::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                self.index(target, index, line)
            }
            ExprKind::Call { func, args, kwargs } => self.call(func, args, kwargs, line),
            ExprKind::Unary(op, operand) => {
                let value = self.eval(operand)?;
                self.unary(*op, value, line)
            }
            ExprKind::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, left, right, line)
            }
            ExprKind::Compare(left, rest) => {
                let mut current = self.eval(left)?;
                for (op, right) in rest {
                    let right = self.eval(right)?;
                    if !self.compare(*op, &current, &right, line)? {
                        return Ok(RtValue::Bool(false));
                    }
                    current = right;
                }
                Ok(RtValue::Bool(true))
            }
            ExprKind::Logic(op, left, right) => {
                let left = self.eval(left)?;
                match (op, left.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(left),
                    _ => self.eval(right),
                }
            }
            ExprKind::IfExp { cond, then, orelse } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(orelse)
                }
            }
        }
    }

    fn eval_all(&mut self, items: &'a [Expr]) -> Result<Vec<RtValue>, ProgramError> {
        items.iter().map(|item| self.eval(item)).collect()
    }

    fn attribute(&self, target: RtValue, name: &str, line: usize) -> EvalResult {
        let value = match (&target, name) {
            (RtValue::Context, "timestamp") => Some(RtValue::Timestamp(self.ctx.timestamp())),
            (RtValue::Context, "fqn") => Some(RtValue::Str(self.ctx.fqn().to_string())),
            (RtValue::Context, "namespace") => Some(RtValue::Str(self.ctx.namespace().to_string())),
            (RtValue::Context, "keys") => Some(RtValue::Dict(
                self.ctx
                    .keys()
                    .iter()
                    .map(|(k, v)| (k.clone(), RtValue::Str(v.clone())))
                    .collect(),
            )),
            (RtValue::Timestamp(ts), field) => match field {
                "year" => Some(RtValue::Int(i64::from(ts.year()))),
                "month" => Some(RtValue::Int(i64::from(ts.month()))),
                "day" => Some(RtValue::Int(i64::from(ts.day()))),
                "hour" => Some(RtValue::Int(i64::from(ts.hour()))),
                "minute" => Some(RtValue::Int(i64::from(ts.minute()))),
                "second" => Some(RtValue::Int(i64::from(ts.second()))),
                "microsecond" => Some(RtValue::Int(i64::from(ts.timestamp_subsec_micros()))),
                _ => None,
            },
            (RtValue::Interval(d), "days") => Some(RtValue::Int(d.num_days())),
            (RtValue::Module(SandboxModule::Math), constant) => match constant {
                "pi" => Some(RtValue::Float(std::f64::consts::PI)),
                "e" => Some(RtValue::Float(std::f64::consts::E)),
                "inf" => Some(RtValue::Float(f64::INFINITY)),
                "nan" => Some(RtValue::Float(f64::NAN)),
                _ => None,
            },
            _ => None,
        };
        value.ok_or_else(|| {
            self.fail(
                line,
                format!("'{}' object has no attribute '{name}'", target.type_name()),
            )
        })
    }

    fn index(&self, target: RtValue, index: RtValue, line: usize) -> EvalResult {
        match (target, index) {
            (RtValue::Dict(mut entries), RtValue::Str(key)) => entries
                .remove(&key)
                .ok_or_else(|| self.fail(line, format!("KeyError: '{key}'"))),
            (RtValue::List(items) | RtValue::Tuple(items), RtValue::Int(i)) => {
                let idx = normalize_index(i, items.len())
                    .ok_or_else(|| self.fail(line, "index out of range"))?;
                Ok(items.into_iter().nth(idx).unwrap_or(RtValue::None))
            }
            (RtValue::Str(s), RtValue::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = normalize_index(i, chars.len())
                    .ok_or_else(|| self.fail(line, "string index out of range"))?;
                Ok(RtValue::Str(chars[idx].to_string()))
            }
            (target, index) => Err(self.fail(
                line,
                format!(
                    "'{}' object cannot be indexed by {}",
                    target.type_name(),
                    index.type_name()
                ),
            )),
        }
    }

    fn call(
        &mut self,
        func: &'a Expr,
        args: &'a [Expr],
        kwargs: &'a [(String, Expr)],
        line: usize,
    ) -> EvalResult {
        match &func.kind {
            ExprKind::Attr(target, method) => {
                let target = self.eval(target)?;
                let args = self.eval_all(args)?;
                let kwargs = self.eval_kwargs(kwargs)?;
                match target {
                    RtValue::Context => self.context_call(method, args, kwargs, line),
                    RtValue::Module(module) => self.module_call(module, method, args, kwargs, line),
                    other => self.method_call(other, method, args, line),
                }
            }
            ExprKind::Name(name) => {
                let args = self.eval_all(args)?;
                let kwargs = self.eval_kwargs(kwargs)?;
                match self.program.imports.get(name) {
                    Some(Import::Function(module, function)) => {
                        self.module_call(*module, function, args, kwargs, line)
                    }
                    _ => self.builtin(name, args, kwargs, line),
                }
            }
            _ => Err(self.fail(line, "object is not callable")),
        }
    }

    fn eval_kwargs(
        &mut self,
        kwargs: &'a [(String, Expr)],
    ) -> Result<Vec<(String, RtValue)>, ProgramError> {
        kwargs
            .iter()
            .map(|(name, expr)| Ok((name.clone(), self.eval(expr)?)))
            .collect()
    }

    fn context_call(
        &self,
        method: &str,
        args: Vec<RtValue>,
        kwargs: Vec<(String, RtValue)>,
        line: usize,
    ) -> EvalResult {
        let mut args = args.into_iter();
        let selector = args
            .next()
            .or_else(|| kwarg(&kwargs, "selector"))
            .or_else(|| kwarg(&kwargs, "fqn"));
        let Some(RtValue::Str(selector)) = selector else {
            return Err(self.fail(line, "dependency selector must be a string"));
        };
        let keys = match args.next().or_else(|| kwarg(&kwargs, "keys")) {
            None | Some(RtValue::None) => None,
            Some(RtValue::Dict(entries)) => Some(self.entity_keys(entries, line)?),
            Some(other) => {
                return Err(self.fail(
                    line,
                    format!("keys must be a dict, got {}", other.type_name()),
                ))
            }
        };

        let dependency_error = |source: EngineError| ProgramError::Dependency {
            function: self.program.name.clone(),
            line,
            source: Box::new(source),
        };
        match method {
            "get_feature" | "f" => {
                let (value, ts) = self
                    .ctx
                    .get_feature(&selector, keys.as_ref())
                    .map_err(dependency_error)?;
                Ok(RtValue::Tuple(vec![
                    RtValue::from_optional(value),
                    ts.map(RtValue::Timestamp).unwrap_or(RtValue::None),
                ]))
            }
            "get_prediction" => {
                let (value, ts) = self
                    .ctx
                    .get_prediction(&selector, keys.as_ref())
                    .map_err(dependency_error)?;
                Ok(RtValue::Tuple(vec![
                    RtValue::from_value(value),
                    RtValue::Timestamp(ts),
                ]))
            }
            other => Err(self.fail(line, format!("context has no method '{other}'"))),
        }
    }

    fn module_call(
        &self,
        module: SandboxModule,
        function: &str,
        args: Vec<RtValue>,
        kwargs: Vec<(String, RtValue)>,
        line: usize,
    ) -> EvalResult {
        match module {
            SandboxModule::Datetime => match function {
                "timedelta" => self.timedelta(args, kwargs, line),
                "datetime" => self.datetime(args, line),
                other => Err(self.fail(line, format!("datetime has no function '{other}'"))),
            },
            SandboxModule::Math => {
                let numbers = args
                    .iter()
                    .map(|a| {
                        a.as_number().ok_or_else(|| {
                            self.fail(line, format!("math.{function} needs numbers, got {}", a.type_name()))
                        })
                    })
                    .collect::<Result<Vec<f64>, _>>()?;
                let first = *numbers
                    .first()
                    .ok_or_else(|| self.fail(line, format!("math.{function} needs an argument")))?;
                let domain = || self.fail(line, "math domain error");
                match function {
                    "sqrt" if first < 0.0 => Err(domain()),
                    "sqrt" => Ok(RtValue::Float(first.sqrt())),
                    "log" | "log10" if first <= 0.0 => Err(domain()),
                    "log" => match numbers.get(1) {
                        Some(base) if *base <= 0.0 || *base == 1.0 => Err(domain()),
                        Some(base) => Ok(RtValue::Float(first.ln() / base.ln())),
                        None => Ok(RtValue::Float(first.ln())),
                    },
                    "log10" => Ok(RtValue::Float(first.log10())),
                    "exp" => Ok(RtValue::Float(first.exp())),
                    "floor" => float_to_int(first.floor())
                        .map(RtValue::Int)
                        .ok_or_else(|| self.fail(line, "cannot convert to integer")),
                    "ceil" => float_to_int(first.ceil())
                        .map(RtValue::Int)
                        .ok_or_else(|| self.fail(line, "cannot convert to integer")),
                    "fabs" => Ok(RtValue::Float(first.abs())),
                    "pow" => {
                        let exponent = numbers
                            .get(1)
                            .ok_or_else(|| self.fail(line, "math.pow needs two arguments"))?;
                        Ok(RtValue::Float(first.powf(*exponent)))
                    }
                    "isnan" => Ok(RtValue::Bool(first.is_nan())),
                    "isinf" => Ok(RtValue::Bool(first.is_infinite())),
                    other => Err(self.fail(line, format!("math has no function '{other}'"))),
                }
            }
        }
    }

    fn builtin(
        &self,
        name: &str,
        args: Vec<RtValue>,
        kwargs: Vec<(String, RtValue)>,
        line: usize,
    ) -> EvalResult {
        let single = |args: &[RtValue]| -> Result<RtValue, ProgramError> {
            match args {
                [one] => Ok(one.clone()),
                _ => Err(self.fail(
                    line,
                    format!("{name}() takes exactly one argument ({} given)", args.len()),
                )),
            }
        };
        match name {
            "len" => match single(&args)? {
                RtValue::Str(s) => Ok(RtValue::Int(s.chars().count() as i64)),
                RtValue::List(items) | RtValue::Tuple(items) => Ok(RtValue::Int(items.len() as i64)),
                RtValue::Dict(entries) => Ok(RtValue::Int(entries.len() as i64)),
                other => Err(self.fail(
                    line,
                    format!("object of type '{}' has no len()", other.type_name()),
                )),
            },
            "abs" => match single(&args)? {
                RtValue::Int(i) => i
                    .checked_abs()
                    .map(RtValue::Int)
                    .ok_or_else(|| self.fail(line, "integer overflow")),
                RtValue::Float(f) => Ok(RtValue::Float(f.abs())),
                RtValue::Interval(d) if d < Duration::zero() => Ok(RtValue::Interval(-d)),
                RtValue::Interval(d) => Ok(RtValue::Interval(d)),
                other => Err(self.fail(
                    line,
                    format!("bad operand type for abs(): '{}'", other.type_name()),
                )),
            },
            "min" | "max" => {
                let items = match <[RtValue; 1]>::try_from(args) {
                    Ok([RtValue::List(items) | RtValue::Tuple(items)]) => items,
                    Ok([other]) => vec![other],
                    Err(args) => args,
                };
                let mut iter = items.into_iter();
                let mut best = iter
                    .next()
                    .ok_or_else(|| self.fail(line, format!("{name}() arg is an empty sequence")))?;
                for item in iter {
                    let ord = self.ordering(&item, &best, line)?;
                    let better = if name == "min" {
                        ord == Ordering::Less
                    } else {
                        ord == Ordering::Greater
                    };
                    if better {
                        best = item;
                    }
                }
                Ok(best)
            }
            "sum" => {
                let items = match single(&args)? {
                    RtValue::List(items) | RtValue::Tuple(items) => items,
                    other => {
                        return Err(self.fail(
                            line,
                            format!("'{}' object is not iterable", other.type_name()),
                        ))
                    }
                };
                let start = kwarg(&kwargs, "start").unwrap_or(RtValue::Int(0));
                items
                    .into_iter()
                    .try_fold(start, |acc, item| self.binary(BinOp::Add, acc, item, line))
            }
            "round" => {
                let (value, digits) = match args.as_slice() {
                    [value] => (value.clone(), kwarg(&kwargs, "ndigits")),
                    [value, digits] => (value.clone(), Some(digits.clone())),
                    _ => return Err(self.fail(line, "round() takes one or two arguments")),
                };
                match (value, digits) {
                    (RtValue::Int(i), _) => Ok(RtValue::Int(i)),
                    (RtValue::Float(f), None | Some(RtValue::None)) => float_to_int(round_half_even(f))
                        .map(RtValue::Int)
                        .ok_or_else(|| self.fail(line, "cannot round a non-finite float")),
                    (RtValue::Float(f), Some(RtValue::Int(n))) => {
                        let n = i32::try_from(n).map_err(|_| self.fail(line, "ndigits out of range"))?;
                        let scale = 10f64.powi(n);
                        Ok(RtValue::Float(round_half_even(f * scale) / scale))
                    }
                    (other, _) => Err(self.fail(
                        line,
                        format!("type {} doesn't define __round__", other.type_name()),
                    )),
                }
            }
            "int" => match single(&args)? {
                RtValue::Int(i) => Ok(RtValue::Int(i)),
                RtValue::Bool(b) => Ok(RtValue::Int(i64::from(b))),
                RtValue::Float(f) => float_to_int(f.trunc())
                    .map(RtValue::Int)
                    .ok_or_else(|| self.fail(line, "cannot convert float to integer")),
                RtValue::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(RtValue::Int)
                    .map_err(|_| self.fail(line, format!("invalid literal for int(): '{s}'"))),
                other => Err(self.fail(
                    line,
                    format!("int() argument must be a string or a number, not '{}'", other.type_name()),
                )),
            },
            "float" => match single(&args)? {
                RtValue::Str(s) => parse_float(&s)
                    .map(RtValue::Float)
                    .ok_or_else(|| self.fail(line, format!("could not convert string to float: '{s}'"))),
                other => other.as_number().map(RtValue::Float).ok_or_else(|| {
                    self.fail(
                        line,
                        format!("float() argument must be a string or a number, not '{}'", other.type_name()),
                    )
                }),
            },
            "str" => Ok(RtValue::Str(single(&args)?.to_string())),
            "bool" => Ok(RtValue::Bool(
                args.first().map(RtValue::truthy).unwrap_or(false),
            )),
            "timedelta" => self.timedelta(args, kwargs, line),
            other => Err(self.fail(line, format!("unknown function '{other}'"))),
        }
    }

    /// `timedelta(days, seconds, microseconds, milliseconds, minutes, hours, weeks)`.
    fn timedelta(
        &self,
        args: Vec<RtValue>,
        kwargs: Vec<(String, RtValue)>,
        line: usize,
    ) -> EvalResult {
        const UNITS: [(&str, f64); 7] = [
            ("days", 86_400e9),
            ("seconds", 1e9),
            ("microseconds", 1e3),
            ("milliseconds", 1e6),
            ("minutes", 60e9),
            ("hours", 3_600e9),
            ("weeks", 604_800e9),
        ];
        if args.len() > UNITS.len() {
            return Err(self.fail(line, "timedelta() takes at most 7 positional arguments"));
        }
        let mut nanos = 0f64;
        let named = kwargs.into_iter().map(|(k, v)| (Some(k), v));
        let positional = args.into_iter().map(|v| (None, v));
        for (idx, (name, value)) in positional.chain(named).enumerate() {
            let scale = match &name {
                None => UNITS[idx].1,
                Some(name) => UNITS
                    .iter()
                    .find(|(unit, _)| unit == name)
                    .map(|(_, scale)| *scale)
                    .ok_or_else(|| self.fail(line, format!("timedelta() got an unexpected keyword '{name}'")))?,
            };
            let amount = value.as_number().ok_or_else(|| {
                self.fail(line, format!("timedelta() needs numbers, got {}", value.type_name()))
            })?;
            nanos += amount * scale;
        }
        if !nanos.is_finite() || nanos.abs() > i64::MAX as f64 {
            return Err(self.fail(line, "timedelta out of range"));
        }
        Ok(RtValue::Interval(Duration::nanoseconds(nanos.round() as i64)))
    }

    /// `datetime(year, month, day[, hour[, minute[, second]]])` in UTC.
    fn datetime(&self, args: Vec<RtValue>, line: usize) -> EvalResult {
        let mut parts = [0i64; 6];
        if !(3..=6).contains(&args.len()) {
            return Err(self.fail(line, "datetime() takes three to six integer arguments"));
        }
        for (slot, arg) in parts.iter_mut().zip(&args) {
            let RtValue::Int(v) = arg else {
                return Err(self.fail(line, format!("datetime() needs integers, got {}", arg.type_name())));
            };
            *slot = *v;
        }
        let [year, month, day, hour, minute, second] = parts;
        let field = |v: i64| u32::try_from(v).ok();
        i32::try_from(year)
            .ok()
            .zip(field(month).zip(field(day)))
            .and_then(|(y, (m, d))| NaiveDate::from_ymd_opt(y, m, d))
            .and_then(|date| date.and_hms_opt(field(hour)?, field(minute)?, field(second)?))
            .map(|naive| RtValue::Timestamp(naive.and_utc()))
            .ok_or_else(|| self.fail(line, "datetime() arguments out of range"))
    }

    fn method_call(&self, target: RtValue, method: &str, args: Vec<RtValue>, line: usize) -> EvalResult {
        let str_arg = |idx: usize| -> Result<String, ProgramError> {
            match args.get(idx) {
                Some(RtValue::Str(s)) => Ok(s.clone()),
                _ => Err(self.fail(line, format!("{method}() needs a string argument"))),
            }
        };
        let result = match (&target, method) {
            (RtValue::Str(s), "lower") => RtValue::Str(s.to_lowercase()),
            (RtValue::Str(s), "upper") => RtValue::Str(s.to_uppercase()),
            (RtValue::Str(s), "strip") => RtValue::Str(s.trim().to_string()),
            (RtValue::Str(s), "startswith") => RtValue::Bool(s.starts_with(&str_arg(0)?)),
            (RtValue::Str(s), "endswith") => RtValue::Bool(s.ends_with(&str_arg(0)?)),
            (RtValue::Str(s), "replace") => RtValue::Str(s.replace(&str_arg(0)?, &str_arg(1)?)),
            (RtValue::Str(s), "split") => {
                let parts: Vec<RtValue> = if args.is_empty() {
                    s.split_whitespace().map(|p| RtValue::Str(p.to_string())).collect()
                } else {
                    let sep = str_arg(0)?;
                    if sep.is_empty() {
                        return Err(self.fail(line, "empty separator"));
                    }
                    s.split(sep.as_str()).map(|p| RtValue::Str(p.to_string())).collect()
                };
                RtValue::List(parts)
            }
            (RtValue::Timestamp(ts), "timestamp") => {
                RtValue::Float(ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_nanos()) / 1e9)
            }
            (RtValue::Timestamp(ts), "weekday") => {
                RtValue::Int(i64::from(ts.weekday().num_days_from_monday()))
            }
            (RtValue::Timestamp(ts), "isoformat") => {
                RtValue::Str(ts.to_rfc3339_opts(SecondsFormat::AutoSi, false))
            }
            (RtValue::Interval(d), "total_seconds") => RtValue::Float(interval_seconds(*d)),
            (RtValue::Dict(entries), "get") => {
                let key = str_arg(0)?;
                entries
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| args.get(1).cloned().unwrap_or(RtValue::None))
            }
            (RtValue::Dict(entries), "keys") => {
                RtValue::List(entries.keys().cloned().map(RtValue::Str).collect())
            }
            (RtValue::Dict(entries), "values") => RtValue::List(entries.values().cloned().collect()),
            (RtValue::List(items) | RtValue::Tuple(items), "count") => {
                let needle = args
                    .first()
                    .ok_or_else(|| self.fail(line, "count() takes exactly one argument"))?;
                RtValue::Int(items.iter().filter(|item| values_equal(item, needle)).count() as i64)
            }
            _ => {
                return Err(self.fail(
                    line,
                    format!("'{}' object has no attribute '{method}'", target.type_name()),
                ))
            }
        };
        Ok(result)
    }

    fn unary(&self, op: UnaryOp, value: RtValue, line: usize) -> EvalResult {
        match (op, value) {
            (UnaryOp::Not, value) => Ok(RtValue::Bool(!value.truthy())),
            (UnaryOp::Neg, RtValue::Int(i)) => i
                .checked_neg()
                .map(RtValue::Int)
                .ok_or_else(|| self.fail(line, "integer overflow")),
            (UnaryOp::Neg, RtValue::Float(f)) => Ok(RtValue::Float(-f)),
            (UnaryOp::Neg, RtValue::Interval(d)) => Ok(RtValue::Interval(-d)),
            (UnaryOp::Pos, v @ (RtValue::Int(_) | RtValue::Float(_) | RtValue::Interval(_))) => Ok(v),
            (op, value) => Err(self.fail(
                line,
                format!(
                    "bad operand type for unary {}: '{}'",
                    if op == UnaryOp::Neg { "-" } else { "+" },
                    value.type_name()
                ),
            )),
        }
    }

    fn binary(&self, op: BinOp, left: RtValue, right: RtValue, line: usize) -> EvalResult {
        use RtValue::*;
        let overflow = || self.fail(line, "integer overflow");
        let zero_division = || self.fail(line, "division by zero");
        match (op, left, right) {
            (op, Int(a), Int(b)) => match op {
                BinOp::Add => a.checked_add(b).map(Int).ok_or_else(overflow),
                BinOp::Sub => a.checked_sub(b).map(Int).ok_or_else(overflow),
                BinOp::Mul => a.checked_mul(b).map(Int).ok_or_else(overflow),
                BinOp::Div if b == 0 => Err(zero_division()),
                BinOp::Div => Ok(Float(a as f64 / b as f64)),
                BinOp::FloorDiv if b == 0 => Err(zero_division()),
                BinOp::FloorDiv => {
                    let q = a.checked_div(b).ok_or_else(overflow)?;
                    Ok(Int(if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q }))
                }
                BinOp::Mod if b == 0 => Err(zero_division()),
                BinOp::Mod => {
                    let r = a.checked_rem(b).ok_or_else(overflow)?;
                    Ok(Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }))
                }
                BinOp::Pow if b >= 0 => {
                    let exp = u32::try_from(b).map_err(|_| overflow())?;
                    a.checked_pow(exp).map(Int).ok_or_else(overflow)
                }
                BinOp::Pow => Ok(Float((a as f64).powf(b as f64))),
            },
            (op, left @ (Int(_) | Float(_) | Bool(_)), right @ (Int(_) | Float(_) | Bool(_))) => {
                let (a, b) = (left.as_number().unwrap_or(0.0), right.as_number().unwrap_or(0.0));
                match op {
                    BinOp::Add => Ok(Float(a + b)),
                    BinOp::Sub => Ok(Float(a - b)),
                    BinOp::Mul => Ok(Float(a * b)),
                    BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => Err(zero_division()),
                    BinOp::Div => Ok(Float(a / b)),
                    BinOp::FloorDiv => Ok(Float((a / b).floor())),
                    BinOp::Mod => Ok(Float(a - b * (a / b).floor())),
                    BinOp::Pow => Ok(Float(a.powf(b))),
                }
            }
            (BinOp::Add, Str(a), Str(b)) => Ok(Str(a + &b)),
            (BinOp::Mul, Str(s), Int(n)) | (BinOp::Mul, Int(n), Str(s)) => {
                Ok(Str(s.repeat(usize::try_from(n).unwrap_or(0))))
            }
            (BinOp::Add, List(mut a), List(b)) => {
                a.extend(b);
                Ok(List(a))
            }
            (BinOp::Add, Tuple(mut a), Tuple(b)) => {
                a.extend(b);
                Ok(Tuple(a))
            }
            (BinOp::Sub, Timestamp(a), Timestamp(b)) => Ok(Interval(a - b)),
            (BinOp::Add, Timestamp(t), Interval(d)) | (BinOp::Add, Interval(d), Timestamp(t)) => t
                .checked_add_signed(d)
                .map(Timestamp)
                .ok_or_else(|| self.fail(line, "datetime out of range")),
            (BinOp::Sub, Timestamp(t), Interval(d)) => t
                .checked_sub_signed(d)
                .map(Timestamp)
                .ok_or_else(|| self.fail(line, "datetime out of range")),
            (BinOp::Add, Interval(a), Interval(b)) => {
                a.checked_add(&b).map(Interval).ok_or_else(overflow)
            }
            (BinOp::Sub, Interval(a), Interval(b)) => {
                a.checked_sub(&b).map(Interval).ok_or_else(overflow)
            }
            (BinOp::Div, Interval(a), Interval(b)) => {
                if b.is_zero() {
                    Err(zero_division())
                } else {
                    Ok(Float(interval_seconds(a) / interval_seconds(b)))
                }
            }
            (BinOp::Mul, Interval(d), factor @ (Int(_) | Float(_)))
            | (BinOp::Mul, factor @ (Int(_) | Float(_)), Interval(d)) => {
                let scaled = interval_seconds(d) * factor.as_number().unwrap_or(0.0);
                seconds_to_interval(scaled)
                    .map(Interval)
                    .ok_or_else(|| self.fail(line, "timedelta out of range"))
            }
            (BinOp::Div, Interval(d), divisor @ (Int(_) | Float(_))) => {
                let divisor = divisor.as_number().unwrap_or(0.0);
                if divisor == 0.0 {
                    return Err(zero_division());
                }
                seconds_to_interval(interval_seconds(d) / divisor)
                    .map(Interval)
                    .ok_or_else(|| self.fail(line, "timedelta out of range"))
            }
            (op, left, right) => Err(self.fail(
                line,
                format!(
                    "unsupported operand types for {}: '{}' and '{}'",
                    op.symbol(),
                    left.type_name(),
                    right.type_name()
                ),
            )),
        }
    }

    fn compare(&self, op: CmpOp, left: &RtValue, right: &RtValue, line: usize) -> Result<bool, ProgramError> {
        match op {
            CmpOp::Eq => Ok(values_equal(left, right)),
            CmpOp::NotEq => Ok(!values_equal(left, right)),
            CmpOp::Lt => Ok(self.ordering(left, right, line)? == Ordering::Less),
            CmpOp::LtE => Ok(self.ordering(left, right, line)? != Ordering::Greater),
            CmpOp::Gt => Ok(self.ordering(left, right, line)? == Ordering::Greater),
            CmpOp::GtE => Ok(self.ordering(left, right, line)? != Ordering::Less),
            CmpOp::In => self.contains(right, left, line),
            CmpOp::NotIn => Ok(!self.contains(right, left, line)?),
            CmpOp::Is => Ok(identical(left, right)),
            CmpOp::IsNot => Ok(!identical(left, right)),
        }
    }

    fn ordering(&self, left: &RtValue, right: &RtValue, line: usize) -> Result<Ordering, ProgramError> {
        let ord = match (left, right) {
            (RtValue::Int(a), RtValue::Int(b)) => Some(a.cmp(b)),
            (RtValue::Str(a), RtValue::Str(b)) => Some(a.cmp(b)),
            (RtValue::Timestamp(a), RtValue::Timestamp(b)) => Some(a.cmp(b)),
            (RtValue::Interval(a), RtValue::Interval(b)) => Some(a.cmp(b)),
            (RtValue::List(a), RtValue::List(b)) | (RtValue::Tuple(a), RtValue::Tuple(b)) => {
                for (x, y) in a.iter().zip(b) {
                    let ord = self.ordering(x, y, line)?;
                    if ord != Ordering::Equal {
                        return Ok(ord);
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        };
        ord.ok_or_else(|| {
            self.fail(
                line,
                format!(
                    "ordering not supported between '{}' and '{}'",
                    left.type_name(),
                    right.type_name()
                ),
            )
        })
    }

    fn contains(&self, container: &RtValue, needle: &RtValue, line: usize) -> Result<bool, ProgramError> {
        match (container, needle) {
            (RtValue::Str(haystack), RtValue::Str(n)) => Ok(haystack.contains(n.as_str())),
            (RtValue::List(items) | RtValue::Tuple(items), needle) => {
                Ok(items.iter().any(|item| values_equal(item, needle)))
            }
            (RtValue::Dict(entries), RtValue::Str(key)) => Ok(entries.contains_key(key)),
            (container, needle) => Err(self.fail(
                line,
                format!(
                    "'in' not supported between '{}' and '{}'",
                    needle.type_name(),
                    container.type_name()
                ),
            )),
        }
    }
}

fn kwarg(kwargs: &[(String, RtValue)], name: &str) -> Option<RtValue> {
    kwargs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

fn values_equal(left: &RtValue, right: &RtValue) -> bool {
    match (left, right) {
        (RtValue::None, RtValue::None) => true,
        (RtValue::Str(a), RtValue::Str(b)) => a == b,
        (RtValue::Int(a), RtValue::Int(b)) => a == b,
        (RtValue::Timestamp(a), RtValue::Timestamp(b)) => a == b,
        (RtValue::Interval(a), RtValue::Interval(b)) => a == b,
        (RtValue::List(a), RtValue::List(b)) | (RtValue::Tuple(a), RtValue::Tuple(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (RtValue::Dict(a), RtValue::Dict(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|((ka, va), (kb, vb))| ka == kb && values_equal(va, vb))
        }
        (a, b) => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn identical(left: &RtValue, right: &RtValue) -> bool {
    match (left, right) {
        (RtValue::None, RtValue::None) => true,
        (RtValue::Bool(a), RtValue::Bool(b)) => a == b,
        (RtValue::Context, RtValue::Context) => true,
        _ => false,
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let idx = if index < 0 { index + len } else { index };
    if (0..len).contains(&idx) {
        usize::try_from(idx).ok()
    } else {
        None
    }
}

fn float_to_int(value: f64) -> Option<i64> {
    if value.is_finite() && value >= i64::MIN as f64 && value <= i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

fn round_half_even(value: f64) -> f64 {
    let rounded = value.round();
    if (value - value.trunc()).abs() == 0.5 {
        2.0 * (value / 2.0).round()
    } else {
        rounded
    }
}

fn parse_float(raw: &str) -> Option<f64> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "nan" => Some(f64::NAN),
        "inf" | "infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

fn interval_seconds(d: Duration) -> f64 {
    match d.num_nanoseconds() {
        Some(ns) => ns as f64 / 1e9,
        None => d.num_milliseconds() as f64 / 1e3,
    }
}

fn seconds_to_interval(seconds: f64) -> Option<Duration> {
    let nanos = seconds * 1e9;
    if nanos.is_finite() && nanos.abs() <= i64::MAX as f64 {
        Some(Duration::nanoseconds(nanos.round() as i64))
    } else {
        None
    }
}
