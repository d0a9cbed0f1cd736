use super::ProgramError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub line: usize,
    pub col: usize,
}

const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "->", "+=", "-=", "*=", "/=", "%=", "(",
    ")", "[", "]", "{", "}", ",", ":", ".", ";", "+", "-", "*", "/", "%", "<", ">", "=", "@",
    "|", "&",
];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ProgramError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        col: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ProgramError {
        ProgramError::Syntax {
            line: self.line,
            col: self.col,
            message: message.into(),
        }
    }

    fn push(&mut self, tok: Tok, line: usize, col: usize) {
        self.tokens.push(Token { tok, line, col });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    fn run(&mut self) -> Result<(), ProgramError> {
        let mut at_line_start = true;
        loop {
            if at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    break;
                }
                at_line_start = false;
            }
            let Some(c) = self.peek() else { break };
            let (line, col) = (self.line, self.col);
            match c {
                '\n' => {
                    self.bump();
                    if self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(Tok::Newline, line, col);
                        }
                        at_line_start = true;
                    }
                }
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.bump();
                    self.bump();
                }
                '#' => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.bump();
                    }
                }
                '"' | '\'' => {
                    let s = self.string(c)?;
                    self.push(Tok::Str(s), line, col);
                }
                c if c.is_ascii_digit()
                    || (c == '.' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit())) =>
                {
                    let tok = self.number()?;
                    self.push(tok, line, col);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut name = String::new();
                    while let Some(n) = self.peek() {
                        if n.is_alphanumeric() || n == '_' {
                            name.push(n);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    self.push(Tok::Name(name), line, col);
                }
                _ => {
                    let op = OPERATORS
                        .iter()
                        .find(|op| {
                            op.chars()
                                .enumerate()
                                .all(|(i, oc)| self.peek_at(i) == Some(oc))
                        })
                        .copied()
                        .ok_or_else(|| self.error(format!("unexpected character '{c}'")))?;
                    for _ in 0..op.chars().count() {
                        self.bump();
                    }
                    match op {
                        "(" | "[" | "{" => self.depth += 1,
                        ")" | "]" | "}" => {
                            self.depth = self
                                .depth
                                .checked_sub(1)
                                .ok_or_else(|| self.error(format!("unmatched '{op}'")))?;
                        }
                        _ => {}
                    }
                    self.push(Tok::Op(op), line, col);
                }
            }
        }

        if self.depth > 0 {
            return Err(self.error("unexpected end of input inside brackets"));
        }
        let (line, col) = (self.line, self.col);
        if !self.last_is_newline() {
            self.push(Tok::Newline, line, col);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, line, col);
        }
        self.push(Tok::Eof, line, col);
        Ok(())
    }

    /// Measures the indentation of the next logical line and emits
    /// INDENT/DEDENT tokens. Blank and comment-only lines are skipped.
    /// Returns false at end of input.
    fn indentation(&mut self) -> Result<bool, ProgramError> {
        loop {
            let mut width = 0;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => width += 1,
                    '\t' => width += 4 - width % 4,
                    '\r' => {}
                    _ => break,
                }
                self.bump();
            }
            match self.peek() {
                None => return Ok(false),
                Some('\n') => {
                    self.bump();
                    continue;
                }
                Some('#') => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.bump();
                    }
                    continue;
                }
                Some(_) => {}
            }

            let (line, col) = (self.line, self.col);
            let current = self.indents.last().copied().unwrap_or(0);
            if width > current {
                self.indents.push(width);
                self.push(Tok::Indent, line, col);
            } else {
                while width < self.indents.last().copied().unwrap_or(0) {
                    self.indents.pop();
                    self.push(Tok::Dedent, line, col);
                }
                if width != self.indents.last().copied().unwrap_or(0) {
                    return Err(self.error("unindent does not match any outer indentation level"));
                }
            }
            return Ok(true);
        }
    }

    fn string(&mut self, quote: char) -> Result<String, ProgramError> {
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        let opening = if triple { 3 } else { 1 };
        for _ in 0..opening {
            self.bump();
        }

        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    self.bump();
                    return Ok(out);
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    for _ in 0..3 {
                        self.bump();
                    }
                    return Ok(out);
                }
            }
            if c == '\n' && !triple {
                return Err(self.error("unterminated string literal"));
            }
            self.bump();
            if c != '\\' {
                out.push(c);
                continue;
            }
            let Some(escaped) = self.bump() else {
                return Err(self.error("unterminated string literal"));
            };
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' | '\'' | '"' => out.push(escaped),
                '\n' => {}
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
        }
    }

    fn number(&mut self) -> Result<Tok, ProgramError> {
        let mut raw = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    raw.push(c);
                }
            } else if c == '.' && !is_float {
                is_float = true;
                raw.push(c);
            } else if (c == 'e' || c == 'E')
                && self
                    .peek_at(1)
                    .is_some_and(|n| n.is_ascii_digit() || n == '-' || n == '+')
            {
                is_float = true;
                raw.push(c);
                self.bump();
                if let Some(sign) = self.peek().filter(|s| *s == '-' || *s == '+') {
                    raw.push(sign);
                    self.bump();
                }
                continue;
            } else {
                break;
            }
            self.bump();
        }
        if is_float {
            raw.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.error(format!("invalid number literal '{raw}'")))
        } else {
            raw.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.error(format!("integer literal out of range '{raw}'")))
        }
    }
}
