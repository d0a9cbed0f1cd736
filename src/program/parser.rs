use super::ast::{
    BinOp, BoolOp, CmpOp, Expr, ExprKind, FunctionDef, ImportName, Stmt, StmtKind, UnaryOp,
};
use super::lexer::{tokenize, Tok, Token};
use super::ProgramError;

const KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

pub(crate) fn parse_function(source: &str) -> Result<FunctionDef, ProgramError> {
    let tokens = tokenize(source)?;
    Parser { tokens, pos: 0 }.module()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_nth(&self, n: usize) -> &Tok {
        self.tokens
            .get(self.pos + n)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.position().0
    }

    fn position(&self) -> (usize, usize) {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| (t.line, t.col))
            .unwrap_or((1, 1))
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> ProgramError {
        let (line, col) = self.position();
        ProgramError::Syntax {
            line,
            col,
            message: message.into(),
        }
    }

    fn unsupported(&self, what: &str) -> ProgramError {
        ProgramError::Validation {
            line: self.line(),
            message: format!("{what} is not supported in feature programs"),
        }
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ProgramError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}', found {}", describe(self.peek()))))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ProgramError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{kw}', found {}", describe(self.peek()))))
        }
    }

    fn expect_newline(&mut self) -> Result<(), ProgramError> {
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            other => Err(self.error(format!("expected end of line, found {}", describe(other)))),
        }
    }

    fn identifier(&mut self) -> Result<String, ProgramError> {
        match self.peek().clone() {
            Tok::Name(n) if !KEYWORDS.contains(&n.as_str()) => {
                self.pos += 1;
                Ok(n)
            }
            other => Err(self.error(format!("expected a name, found {}", describe(&other)))),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.pos += 1;
        }
    }

    fn module(&mut self) -> Result<FunctionDef, ProgramError> {
        let mut preamble = Vec::new();
        let mut function: Option<FunctionDef> = None;
        loop {
            self.skip_newlines();
            match self.peek().clone() {
                Tok::Eof => break,
                Tok::Op("@") => self.skip_decorator()?,
                Tok::Str(_) if function.is_none() => {
                    self.pos += 1;
                    self.expect_newline()?;
                }
                Tok::Name(n) if n == "def" => {
                    if function.is_some() {
                        return Err(ProgramError::Validation {
                            line: self.line(),
                            message: "only one function definition is allowed".to_string(),
                        });
                    }
                    function = Some(self.function_def()?);
                }
                Tok::Name(n) if (n == "import" || n == "from") && function.is_none() => {
                    let line = self.line();
                    let kind = self.import_stmt()?;
                    self.expect_newline()?;
                    preamble.push(Stmt { kind, line });
                }
                other => {
                    return Err(self.error(format!(
                        "expected a function definition, found {}",
                        describe(&other)
                    )))
                }
            }
        }

        let mut function = function.ok_or_else(|| ProgramError::Validation {
            line: 1,
            message: "no function definition found".to_string(),
        })?;
        function.preamble = preamble;
        Ok(function)
    }

    fn skip_decorator(&mut self) -> Result<(), ProgramError> {
        while !matches!(self.peek(), Tok::Newline | Tok::Eof) {
            self.pos += 1;
        }
        self.expect_newline()
    }

    fn function_def(&mut self) -> Result<FunctionDef, ProgramError> {
        let line = self.line();
        self.expect_keyword("def")?;
        let name = self.identifier()?;
        self.expect_op("(")?;
        let mut params = Vec::new();
        while !self.at_op(")") {
            if self.at_op("*") || self.at_op("**") {
                return Err(self.unsupported("variadic parameters"));
            }
            params.push(self.identifier()?);
            if self.eat_op(":") {
                self.expression()?;
            }
            if self.at_op("=") {
                return Err(self.unsupported("default parameter values"));
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        let returns = if self.eat_op("->") {
            Some(self.expression()?)
        } else {
            None
        };
        self.expect_op(":")?;
        let body = self.block()?;
        Ok(FunctionDef {
            name,
            params,
            returns,
            body,
            line,
            preamble: Vec::new(),
        })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ProgramError> {
        if !matches!(self.peek(), Tok::Newline) {
            let stmt = self.simple_statement()?;
            self.expect_newline()?;
            return Ok(vec![stmt]);
        }
        self.pos += 1;
        self.skip_newlines();
        if !matches!(self.peek(), Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.pos += 1;

        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    break;
                }
                Tok::Eof => break,
                _ => body.push(self.statement()?),
            }
        }
        Ok(body)
    }

    fn statement(&mut self) -> Result<Stmt, ProgramError> {
        let line = self.line();
        let Tok::Name(word) = self.peek().clone() else {
            let stmt = self.simple_statement()?;
            self.expect_newline()?;
            return Ok(stmt);
        };
        match word.as_str() {
            "if" => {
                self.pos += 1;
                self.if_statement(line)
            }
            "for" => {
                self.pos += 1;
                let targets = self.target_list()?;
                self.expect_keyword("in")?;
                let iter = self.expression_list()?;
                self.expect_op(":")?;
                let body = self.block()?;
                Ok(Stmt {
                    kind: StmtKind::For {
                        targets,
                        iter,
                        body,
                    },
                    line,
                })
            }
            "while" => Err(self.unsupported("while loop")),
            "def" => Err(self.unsupported("nested function definition")),
            "class" => Err(self.unsupported("class definition")),
            "try" | "with" => Err(self.unsupported(&format!("'{word}' statement"))),
            _ => {
                let stmt = self.simple_statement()?;
                self.expect_newline()?;
                Ok(stmt)
            }
        }
    }

    fn if_statement(&mut self, line: usize) -> Result<Stmt, ProgramError> {
        let mut branches = Vec::new();
        let cond = self.expression()?;
        self.expect_op(":")?;
        branches.push((cond, self.block()?));

        let mut orelse = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat_keyword("elif") {
                let cond = self.expression()?;
                self.expect_op(":")?;
                branches.push((cond, self.block()?));
            } else if self.eat_keyword("else") {
                self.expect_op(":")?;
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            kind: StmtKind::If { branches, orelse },
            line,
        })
    }

    fn target_list(&mut self) -> Result<Vec<String>, ProgramError> {
        let parenthesized = self.eat_op("(");
        let mut targets = vec![self.identifier()?];
        while self.eat_op(",") {
            if self.at_keyword("in") || self.at_op(")") {
                break;
            }
            targets.push(self.identifier()?);
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        Ok(targets)
    }

    fn simple_statement(&mut self) -> Result<Stmt, ProgramError> {
        let line = self.line();
        if let Tok::Name(word) = self.peek().clone() {
            match word.as_str() {
                "return" => {
                    self.pos += 1;
                    let value = if matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent) {
                        None
                    } else {
                        Some(self.expression_list()?)
                    };
                    return Ok(Stmt {
                        kind: StmtKind::Return(value),
                        line,
                    });
                }
                "pass" => {
                    self.pos += 1;
                    return Ok(Stmt {
                        kind: StmtKind::Pass,
                        line,
                    });
                }
                "import" | "from" => {
                    let kind = self.import_stmt()?;
                    return Ok(Stmt { kind, line });
                }
                "break" | "continue" | "raise" | "del" | "global" | "nonlocal" | "yield"
                | "assert" | "lambda" => {
                    return Err(self.unsupported(&format!("'{word}'")));
                }
                _ => {}
            }
        }

        let target = self.expression_list()?;
        if self.eat_op("=") {
            let (targets, unpack) = assignment_targets(&target).ok_or_else(|| {
                ProgramError::Validation {
                    line,
                    message: "only names can be assigned to".to_string(),
                }
            })?;
            let value = self.expression_list()?;
            if self.at_op("=") {
                return Err(self.unsupported("chained assignment"));
            }
            return Ok(Stmt {
                kind: StmtKind::Assign {
                    targets,
                    unpack,
                    value,
                },
                line,
            });
        }

        let aug = match self.peek() {
            Tok::Op("+=") => Some(BinOp::Add),
            Tok::Op("-=") => Some(BinOp::Sub),
            Tok::Op("*=") => Some(BinOp::Mul),
            Tok::Op("/=") => Some(BinOp::Div),
            Tok::Op("//=") => Some(BinOp::FloorDiv),
            Tok::Op("%=") => Some(BinOp::Mod),
            Tok::Op("**=") => Some(BinOp::Pow),
            _ => None,
        };
        if let Some(op) = aug {
            self.pos += 1;
            let ExprKind::Name(name) = target.kind else {
                return Err(ProgramError::Validation {
                    line,
                    message: "augmented assignment needs a plain name".to_string(),
                });
            };
            let value = self.expression()?;
            return Ok(Stmt {
                kind: StmtKind::AugAssign {
                    target: name,
                    op,
                    value,
                },
                line,
            });
        }

        Ok(Stmt {
            kind: StmtKind::Expr(target),
            line,
        })
    }

    fn dotted_name(&mut self) -> Result<String, ProgramError> {
        let mut name = self.identifier()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    fn import_stmt(&mut self) -> Result<StmtKind, ProgramError> {
        if self.eat_keyword("import") {
            let mut names = Vec::new();
            loop {
                let name = self.dotted_name()?;
                let alias = if self.eat_keyword("as") {
                    Some(self.identifier()?)
                } else {
                    None
                };
                names.push(ImportName { name, alias });
                if !self.eat_op(",") {
                    break;
                }
            }
            return Ok(StmtKind::Import(names));
        }

        self.expect_keyword("from")?;
        let module = self.dotted_name()?;
        self.expect_keyword("import")?;
        let parenthesized = self.eat_op("(");
        let mut names = Vec::new();
        loop {
            if self.at_op("*") {
                return Err(self.unsupported("wildcard import"));
            }
            let name = self.identifier()?;
            let alias = if self.eat_keyword("as") {
                Some(self.identifier()?)
            } else {
                None
            };
            names.push(ImportName { name, alias });
            if !self.eat_op(",") || (parenthesized && self.at_op(")")) {
                break;
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        Ok(StmtKind::FromImport { module, names })
    }

    /// Comma-separated expressions; more than one (or a trailing comma) makes a tuple.
    fn expression_list(&mut self) -> Result<Expr, ProgramError> {
        let line = self.line();
        let first = self.expression()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.ends_expression_list() {
                break;
            }
            items.push(self.expression()?);
        }
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            line,
        })
    }

    fn ends_expression_list(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Newline | Tok::Eof | Tok::Dedent | Tok::Op("=") | Tok::Op(")") | Tok::Op(":")
        )
    }

    pub(crate) fn expression(&mut self) -> Result<Expr, ProgramError> {
        let line = self.line();
        if self.at_keyword("lambda") {
            return Err(self.unsupported("lambda"));
        }
        let value = self.or_test()?;
        if !self.eat_keyword("if") {
            return Ok(value);
        }
        let cond = self.or_test()?;
        self.expect_keyword("else")?;
        let orelse = self.expression()?;
        Ok(Expr {
            kind: ExprKind::IfExp {
                cond: Box::new(cond),
                then: Box::new(value),
                orelse: Box::new(orelse),
            },
            line,
        })
    }

    fn or_test(&mut self) -> Result<Expr, ProgramError> {
        let mut left = self.and_test()?;
        while self.at_keyword("or") {
            let line = self.line();
            self.pos += 1;
            let right = self.and_test()?;
            left = Expr {
                kind: ExprKind::Logic(BoolOp::Or, Box::new(left), Box::new(right)),
                line,
            };
        }
        Ok(left)
    }

    fn and_test(&mut self) -> Result<Expr, ProgramError> {
        let mut left = self.not_test()?;
        while self.at_keyword("and") {
            let line = self.line();
            self.pos += 1;
            let right = self.not_test()?;
            left = Expr {
                kind: ExprKind::Logic(BoolOp::And, Box::new(left), Box::new(right)),
                line,
            };
        }
        Ok(left)
    }

    fn not_test(&mut self) -> Result<Expr, ProgramError> {
        let line = self.line();
        if self.eat_keyword("not") {
            let operand = self.not_test()?;
            return Ok(Expr {
                kind: ExprKind::Unary(UnaryOp::Not, Box::new(operand)),
                line,
            });
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek().clone() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Name(n) if n == "in" => CmpOp::In,
            Tok::Name(n) if n == "not" && matches!(self.peek_nth(1), Tok::Name(m) if m == "in") => {
                self.pos += 1;
                CmpOp::NotIn
            }
            Tok::Name(n) if n == "is" => {
                if matches!(self.peek_nth(1), Tok::Name(m) if m == "not") {
                    self.pos += 1;
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn comparison(&mut self) -> Result<Expr, ProgramError> {
        let line = self.line();
        let left = self.arith()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            return Ok(left);
        }
        Ok(Expr {
            kind: ExprKind::Compare(Box::new(left), rest),
            line,
        })
    }

    fn arith(&mut self) -> Result<Expr, ProgramError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => return Ok(left),
            };
            let line = self.line();
            self.pos += 1;
            let right = self.term()?;
            left = Expr {
                kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
                line,
            };
        }
    }

    fn term(&mut self) -> Result<Expr, ProgramError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => return Ok(left),
            };
            let line = self.line();
            self.pos += 1;
            let right = self.factor()?;
            left = Expr {
                kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
                line,
            };
        }
    }

    fn factor(&mut self) -> Result<Expr, ProgramError> {
        let line = self.line();
        let op = match self.peek() {
            Tok::Op("-") => Some(UnaryOp::Neg),
            Tok::Op("+") => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let operand = self.factor()?;
            return Ok(Expr {
                kind: ExprKind::Unary(op, Box::new(operand)),
                line,
            });
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ProgramError> {
        let line = self.line();
        let base = self.postfix()?;
        if !self.eat_op("**") {
            return Ok(base);
        }
        let exponent = self.factor()?;
        Ok(Expr {
            kind: ExprKind::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)),
            line,
        })
    }

    fn postfix(&mut self) -> Result<Expr, ProgramError> {
        let mut expr = self.atom()?;
        loop {
            let line = self.line();
            if self.eat_op("(") {
                let (args, kwargs) = self.call_arguments()?;
                expr = Expr {
                    kind: ExprKind::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                    },
                    line,
                };
            } else if self.eat_op("[") {
                if self.at_op(":") {
                    return Err(self.unsupported("slicing"));
                }
                let index = self.expression_list()?;
                if self.at_op(":") {
                    return Err(self.unsupported("slicing"));
                }
                self.expect_op("]")?;
                expr = Expr {
                    kind: ExprKind::Index(Box::new(expr), Box::new(index)),
                    line,
                };
            } else if self.eat_op(".") {
                let attr = self.identifier()?;
                expr = Expr {
                    kind: ExprKind::Attr(Box::new(expr), attr),
                    line,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ProgramError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.at_op(")") {
            if self.at_op("*") || self.at_op("**") {
                return Err(self.unsupported("argument unpacking"));
            }
            let keyword = match (self.peek(), self.peek_nth(1)) {
                (Tok::Name(n), Tok::Op("=")) if !KEYWORDS.contains(&n.as_str()) => {
                    Some(n.clone())
                }
                _ => None,
            };
            if let Some(name) = keyword {
                self.pos += 2;
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(format!("keyword argument repeated: {name}")));
                }
                kwargs.push((name, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.expression()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr, ProgramError> {
        let line = self.line();
        let kind = match self.advance() {
            Tok::Int(i) => ExprKind::Int(i),
            Tok::Float(f) => ExprKind::Float(f),
            Tok::Str(mut s) => {
                while let Tok::Str(next) = self.peek().clone() {
                    s.push_str(&next);
                    self.pos += 1;
                }
                ExprKind::Str(s)
            }
            Tok::Name(n) => match n.as_str() {
                "None" => ExprKind::None,
                "True" => ExprKind::Bool(true),
                "False" => ExprKind::Bool(false),
                "lambda" => return Err(self.unsupported("lambda")),
                "yield" | "await" => return Err(self.unsupported(&format!("'{n}'"))),
                kw if KEYWORDS.contains(&kw) => {
                    self.pos -= 1;
                    return Err(self.error(format!("unexpected keyword '{kw}'")));
                }
                _ => ExprKind::Name(n),
            },
            Tok::Op("(") => {
                if self.eat_op(")") {
                    ExprKind::Tuple(Vec::new())
                } else {
                    let inner = self.expression_list()?;
                    self.expect_op(")")?;
                    return Ok(inner);
                }
            }
            Tok::Op("[") => {
                let mut items = Vec::new();
                while !self.at_op("]") {
                    items.push(self.expression()?);
                    if self.at_keyword("for") {
                        return Err(self.unsupported("list comprehension"));
                    }
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                ExprKind::List(items)
            }
            Tok::Op("{") => {
                let mut entries = Vec::new();
                while !self.at_op("}") {
                    let key = self.expression()?;
                    if !self.eat_op(":") {
                        return Err(self.unsupported("set literal"));
                    }
                    let value = self.expression()?;
                    if self.at_keyword("for") {
                        return Err(self.unsupported("dict comprehension"));
                    }
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                ExprKind::Dict(entries)
            }
            other => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.error(format!("unexpected {}", describe(&other))));
            }
        };
        Ok(Expr { kind, line })
    }
}

fn assignment_targets(target: &Expr) -> Option<(Vec<String>, bool)> {
    match &target.kind {
        ExprKind::Name(n) => Some((vec![n.clone()], false)),
        ExprKind::Tuple(items) | ExprKind::List(items) => {
            let names = items
                .iter()
                .map(|item| match &item.kind {
                    ExprKind::Name(n) => Some(n.clone()),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?;
            Some((names, true))
        }
        _ => None,
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Name(n) => format!("'{n}'"),
        Tok::Int(i) => format!("'{i}'"),
        Tok::Float(f) => format!("'{f}'"),
        Tok::Str(_) => "string literal".to_string(),
        Tok::Op(op) => format!("'{op}'"),
        Tok::Newline => "end of line".to_string(),
        Tok::Indent => "indent".to_string(),
        Tok::Dedent => "dedent".to_string(),
        Tok::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_with_docstring_and_branches() {
        let f = parse_function(
            "@feature(keys=['id'])\ndef total(row, ctx) -> float:\n    \"\"\"Doc.\"\"\"\n    if row['a'] > 1:\n        return 1.0\n    elif row['a'] == 0:\n        return 0.0\n    else:\n        return -1.0\n",
        )
        .unwrap();
        assert_eq!(f.name, "total");
        assert_eq!(f.params, vec!["row", "ctx"]);
        assert_eq!(f.body.len(), 2);
        let StmtKind::If { branches, orelse } = &f.body[1].kind else {
            panic!("expected if statement");
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(orelse.len(), 1);
        assert_eq!(f.body[1].line, 4);
    }

    #[test]
    fn parses_tuple_unpacking_and_keyword_calls() {
        let f = parse_function(
            "def f(row, ctx) -> int:\n    v, ts = ctx.get_feature('x', keys={'id': '1'})\n    return v\n",
        )
        .unwrap();
        let StmtKind::Assign {
            targets, unpack, ..
        } = &f.body[0].kind
        else {
            panic!("expected assignment");
        };
        assert_eq!(targets, &vec!["v".to_string(), "ts".to_string()]);
        assert!(unpack);
    }

    #[test]
    fn operator_precedence() {
        let f = parse_function("def f(a, b) -> int:\n    return 1 + 2 * 3 ** 2\n").unwrap();
        let StmtKind::Return(Some(expr)) = &f.body[0].kind else {
            panic!("expected return");
        };
        let ExprKind::Binary(BinOp::Add, _, right) = &expr.kind else {
            panic!("expected addition at the root");
        };
        assert!(matches!(right.kind, ExprKind::Binary(BinOp::Mul, _, _)));
    }

    #[test]
    fn rejects_while_loops_and_second_functions() {
        let err = parse_function("def f(a, b) -> int:\n    while True:\n        pass\n")
            .unwrap_err();
        assert!(matches!(err, ProgramError::Validation { line: 2, .. }));

        let err = parse_function("def f(a, b) -> int:\n    return 1\ndef g(a, b) -> int:\n    return 2\n")
            .unwrap_err();
        assert!(matches!(err, ProgramError::Validation { line: 3, .. }));
    }

    #[test]
    fn syntax_errors_carry_position() {
        let err = parse_function("def f(a, b) -> int:\n    return (1 +\n").unwrap_err();
        assert!(matches!(err, ProgramError::Syntax { .. }));
    }
}
