//! Recursive-descent parser for the script subset.
//!
//! The parser is generic over its input source and emits the span-annotated
//! tree from `crate::ast`.  Two goals exist: whole scripts, and single
//! expressions (recorded closure source text is always an expression).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::ast::{
    AssignOp, BinaryOp, Binding, Block, CatchClause, ClassMember, ClassMemberKind, ClassNode,
    Element, Expression, ExpressionKind, ForInit, FunctionBody, FunctionKind, FunctionNode,
    IdentifierRef, LogicalOp, MemberProperty, NodeId, ObjectProperty, Param, ParseGoal, Program,
    PropertyName, SourceSpan, Statement, UnaryOp, UpdateOp, VariableDeclaration,
    VariableDeclarator, VariableKind,
};
use crate::lexer::{Token, TokenKind, tokenize};

pub type ParseResult<T> = Result<T, ParseError>;

/// Name of the scope-lookup call recognized in recorded source text.
pub const SCOPE_LOOKUP_FUNCTION: &str = "__$getFromScope";

/// Stable parse error codes for deterministic diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseErrorCode {
    EmptySource,
    UnexpectedToken,
    UnexpectedEof,
    UnsupportedSyntax,
    InvalidAssignmentTarget,
    InvalidNumber,
    InvalidEscape,
    UnterminatedString,
    UnterminatedComment,
    IoReadFailed,
}

impl ParseErrorCode {
    pub fn stable_code(self) -> &'static str {
        match self {
            Self::EmptySource => "FE-PARSE-0001",
            Self::UnexpectedToken => "FE-PARSE-0002",
            Self::UnexpectedEof => "FE-PARSE-0003",
            Self::UnsupportedSyntax => "FE-PARSE-0004",
            Self::InvalidAssignmentTarget => "FE-PARSE-0005",
            Self::InvalidNumber => "FE-PARSE-0006",
            Self::InvalidEscape => "FE-PARSE-0007",
            Self::UnterminatedString => "FE-PARSE-0008",
            Self::UnterminatedComment => "FE-PARSE-0009",
            Self::IoReadFailed => "FE-PARSE-0010",
        }
    }
}

/// Deterministic parse error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub code: ParseErrorCode,
    pub message: String,
    pub source_label: String,
    pub span: Option<SourceSpan>,
}

impl ParseError {
    pub(crate) fn new(
        code: ParseErrorCode,
        message: impl Into<String>,
        source_label: impl Into<String>,
        span: Option<SourceSpan>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source_label: source_label.into(),
            span,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            Some(span) => write!(
                f,
                "{:?}: {} (source={}, line={}, column={})",
                self.code, self.message, self.source_label, span.start_line, span.start_column
            ),
            None => write!(
                f,
                "{:?}: {} (source={})",
                self.code, self.message, self.source_label
            ),
        }
    }
}

impl std::error::Error for ParseError {}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Something the parser can read source text from.
pub trait ParserInput {
    fn source_label(&self) -> String;
    fn read_source(self) -> ParseResult<String>;
}

impl ParserInput for &str {
    fn source_label(&self) -> String {
        "<inline>".to_string()
    }

    fn read_source(self) -> ParseResult<String> {
        Ok(self.to_string())
    }
}

impl ParserInput for String {
    fn source_label(&self) -> String {
        "<inline>".to_string()
    }

    fn read_source(self) -> ParseResult<String> {
        Ok(self)
    }
}

impl ParserInput for &Path {
    fn source_label(&self) -> String {
        self.display().to_string()
    }

    fn read_source(self) -> ParseResult<String> {
        fs::read_to_string(self).map_err(|error| {
            ParseError::new(
                ParseErrorCode::IoReadFailed,
                format!("failed to read source: {error}"),
                self.display().to_string(),
                None,
            )
        })
    }
}

impl ParserInput for PathBuf {
    fn source_label(&self) -> String {
        self.display().to_string()
    }

    fn read_source(self) -> ParseResult<String> {
        self.as_path().read_source()
    }
}

/// Parse a whole script.
pub fn parse_script(source: &str, source_label: &str) -> ParseResult<Program> {
    let mut parser = Parser::new(source, source_label)?;
    parser.program()
}

/// Parse a single expression; trailing tokens are an error.
pub fn parse_expression_source(source: &str, source_label: &str) -> ParseResult<Expression> {
    let mut parser = Parser::new(source, source_label)?;
    if parser.at_eof() {
        return Err(parser.error_here(ParseErrorCode::EmptySource, "expected an expression"));
    }
    let expression = parser.expression()?;
    parser.eat_punct(";");
    if !parser.at_eof() {
        return Err(parser.unexpected());
    }
    Ok(expression)
}

/// Read and parse any [`ParserInput`] for the given goal.  Expression goals
/// are wrapped into a one-statement program.
pub fn parse_input<I: ParserInput>(input: I, goal: ParseGoal) -> ParseResult<Program> {
    let label = input.source_label();
    let source = input.read_source()?;
    match goal {
        ParseGoal::Script => parse_script(&source, &label),
        ParseGoal::Expression => {
            let expression = parse_expression_source(&source, &label)?;
            let span = expression.span;
            Ok(Program {
                body: vec![Statement::Expression { expression, span }],
                span,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

const RESERVED_WORDS: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do",
    "else", "export", "extends", "false", "finally", "for", "function", "if", "import", "in",
    "instanceof", "new", "null", "return", "super", "switch", "this", "throw", "true", "try",
    "typeof", "var", "void", "while", "with", "yield",
];

fn is_reserved(name: &str) -> bool {
    RESERVED_WORDS.contains(&name)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    label: &'a str,
    next_id: u32,
    prev_span: SourceSpan,
}

impl<'a> Parser<'a> {
    fn new(source: &str, label: &'a str) -> ParseResult<Self> {
        let tokens = tokenize(source, label)?;
        Ok(Self {
            tokens,
            pos: 0,
            label,
            next_id: 0,
            prev_span: SourceSpan::default(),
        })
    }

    // -- token helpers ------------------------------------------------------

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> &Token {
        let index = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[index]
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !matches!(token.kind, TokenKind::Eof) {
            self.pos += 1;
        }
        self.prev_span = token.span;
        token
    }

    fn next_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek().kind, TokenKind::Punct(q) if q == p)
    }

    fn is_punct_at(&self, n: usize, p: &str) -> bool {
        matches!(self.peek_at(n).kind, TokenKind::Punct(q) if q == p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> ParseResult<Token> {
        if self.is_punct(p) {
            Ok(self.advance())
        } else {
            Err(self.error_here(
                self.unexpected_code(),
                format!("expected `{p}`, found {}", describe(&self.peek().kind)),
            ))
        }
    }

    fn is_ident(&self, name: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(s) if s == name)
    }

    fn is_ident_at(&self, n: usize, name: &str) -> bool {
        matches!(&self.peek_at(n).kind, TokenKind::Ident(s) if s == name)
    }

    fn eat_ident(&mut self, name: &str) -> bool {
        if self.is_ident(name) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, name: &str) -> ParseResult<Token> {
        if self.is_ident(name) {
            Ok(self.advance())
        } else {
            Err(self.error_here(
                self.unexpected_code(),
                format!("expected `{name}`, found {}", describe(&self.peek().kind)),
            ))
        }
    }

    fn unexpected_code(&self) -> ParseErrorCode {
        if self.at_eof() {
            ParseErrorCode::UnexpectedEof
        } else {
            ParseErrorCode::UnexpectedToken
        }
    }

    fn unexpected(&self) -> ParseError {
        self.error_here(
            self.unexpected_code(),
            format!("unexpected {}", describe(&self.peek().kind)),
        )
    }

    fn error_here(&self, code: ParseErrorCode, message: impl Into<String>) -> ParseError {
        ParseError::new(code, message, self.label, Some(self.peek().span))
    }

    fn span_from(&self, start: SourceSpan) -> SourceSpan {
        start.to(&self.prev_span)
    }

    /// Automatic semicolon insertion: `;`, `}`, end of input, or a preceding
    /// line break all terminate a statement.
    fn consume_semicolon(&mut self) -> ParseResult<()> {
        if self.eat_punct(";") {
            return Ok(());
        }
        if self.is_punct("}") || self.at_eof() || self.peek().newline_before {
            return Ok(());
        }
        Err(self.unexpected())
    }

    fn binding_identifier(&mut self) -> ParseResult<Binding> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident(name) if !is_reserved(&name) => {
                self.advance();
                Ok(Binding {
                    name,
                    span: token.span,
                    id: self.next_id(),
                })
            }
            TokenKind::Punct("#") => Err(self.error_here(
                ParseErrorCode::UnsupportedSyntax,
                "private names are not supported",
            )),
            _ => Err(self.unexpected()),
        }
    }

    // -- statements ----------------------------------------------------------

    fn program(&mut self) -> ParseResult<Program> {
        let start = self.peek().span;
        let mut body = Vec::new();
        while !self.at_eof() {
            body.push(self.statement()?);
        }
        let span = if body.is_empty() {
            start
        } else {
            self.span_from(start)
        };
        Ok(Program { body, span })
    }

    fn statement(&mut self) -> ParseResult<Statement> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Punct("{") => Ok(Statement::Block(self.block()?)),
            TokenKind::Punct(";") => {
                self.advance();
                Ok(Statement::Empty { span: token.span })
            }
            TokenKind::Ident(word) => match word.as_str() {
                "var" | "const" => {
                    let decl = self.variable_declaration()?;
                    self.consume_semicolon()?;
                    Ok(Statement::Variable(self.with_end(decl)))
                }
                "let" if matches!(self.peek_at(1).kind, TokenKind::Ident(_))
                    || self.is_punct_at(1, "[")
                    || self.is_punct_at(1, "{") =>
                {
                    let decl = self.variable_declaration()?;
                    self.consume_semicolon()?;
                    Ok(Statement::Variable(self.with_end(decl)))
                }
                "function" => Ok(Statement::Function(self.function(FunctionKind::Declaration)?)),
                "async" if self.is_ident_at(1, "function") && !self.peek_at(1).newline_before => {
                    Err(self.error_here(
                        ParseErrorCode::UnsupportedSyntax,
                        "async functions are not supported",
                    ))
                }
                "class" => Ok(Statement::Class(self.class(true)?)),
                "if" => self.if_statement(),
                "while" => self.while_statement(),
                "for" => self.for_statement(),
                "return" => {
                    self.advance();
                    let argument = if self.is_punct(";")
                        || self.is_punct("}")
                        || self.at_eof()
                        || self.peek().newline_before
                    {
                        None
                    } else {
                        Some(self.expression()?)
                    };
                    self.consume_semicolon()?;
                    Ok(Statement::Return {
                        argument,
                        span: self.span_from(token.span),
                    })
                }
                "throw" => {
                    self.advance();
                    if self.peek().newline_before {
                        return Err(self.unexpected());
                    }
                    let argument = self.expression()?;
                    self.consume_semicolon()?;
                    Ok(Statement::Throw {
                        argument,
                        span: self.span_from(token.span),
                    })
                }
                "try" => self.try_statement(),
                "break" => {
                    self.advance();
                    self.consume_semicolon()?;
                    Ok(Statement::Break {
                        span: self.span_from(token.span),
                    })
                }
                "continue" => {
                    self.advance();
                    self.consume_semicolon()?;
                    Ok(Statement::Continue {
                        span: self.span_from(token.span),
                    })
                }
                "import" | "export" | "switch" | "do" | "with" => Err(self.error_here(
                    ParseErrorCode::UnsupportedSyntax,
                    format!("`{word}` statements are not supported"),
                )),
                _ => self.expression_statement(),
            },
            _ => self.expression_statement(),
        }
    }

    fn with_end(&self, mut decl: VariableDeclaration) -> VariableDeclaration {
        decl.span = self.span_from(decl.span);
        decl
    }

    fn expression_statement(&mut self) -> ParseResult<Statement> {
        let expression = self.expression()?;
        self.consume_semicolon()?;
        let span = expression.span.to(&self.prev_span);
        Ok(Statement::Expression { expression, span })
    }

    fn block(&mut self) -> ParseResult<Block> {
        let open = self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected());
            }
            body.push(self.statement()?);
        }
        self.advance();
        Ok(Block {
            body,
            span: self.span_from(open.span),
            id: self.next_id(),
        })
    }

    fn variable_declaration(&mut self) -> ParseResult<VariableDeclaration> {
        let keyword = self.advance();
        let kind = match &keyword.kind {
            TokenKind::Ident(word) if word == "var" => VariableKind::Var,
            TokenKind::Ident(word) if word == "let" => VariableKind::Let,
            _ => VariableKind::Const,
        };
        let mut declarators = Vec::new();
        loop {
            if self.is_punct("[") || self.is_punct("{") {
                return Err(self.error_here(
                    ParseErrorCode::UnsupportedSyntax,
                    "destructuring declarations are not supported",
                ));
            }
            let binding = self.binding_identifier()?;
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            declarators.push(VariableDeclarator { binding, init });
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(VariableDeclaration {
            kind,
            declarators,
            span: keyword.span,
        })
    }

    fn if_statement(&mut self) -> ParseResult<Statement> {
        let start = self.advance().span;
        self.expect_punct("(")?;
        let test = self.expression()?;
        self.expect_punct(")")?;
        let consequent = Box::new(self.statement()?);
        let alternate = if self.eat_ident("else") {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Statement::If {
            test,
            consequent,
            alternate,
            span: self.span_from(start),
        })
    }

    fn while_statement(&mut self) -> ParseResult<Statement> {
        let start = self.advance().span;
        self.expect_punct("(")?;
        let test = self.expression()?;
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Statement::While {
            test,
            body,
            span: self.span_from(start),
        })
    }

    fn for_statement(&mut self) -> ParseResult<Statement> {
        let start = self.advance().span;
        self.expect_punct("(")?;
        let init = if self.is_punct(";") {
            None
        } else if self.is_ident("var") || self.is_ident("let") || self.is_ident("const") {
            let decl = self.variable_declaration()?;
            Some(ForInit::Variable(self.with_end(decl)))
        } else {
            Some(ForInit::Expression(self.expression()?))
        };
        if self.is_ident("of") || self.is_ident("in") {
            return Err(self.error_here(
                ParseErrorCode::UnsupportedSyntax,
                "for-in and for-of loops are not supported",
            ));
        }
        self.expect_punct(";")?;
        let test = if self.is_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Statement::For {
            init,
            test,
            update,
            body,
            span: self.span_from(start),
            id: self.next_id(),
        })
    }

    fn try_statement(&mut self) -> ParseResult<Statement> {
        let start = self.advance().span;
        let block = self.block()?;
        let handler = if self.eat_ident("catch") {
            let param = if self.eat_punct("(") {
                let binding = self.binding_identifier()?;
                self.expect_punct(")")?;
                Some(binding)
            } else {
                None
            };
            let body = self.block()?;
            Some(CatchClause {
                param,
                body,
                id: self.next_id(),
            })
        } else {
            None
        };
        let finalizer = if self.eat_ident("finally") {
            Some(self.block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error_here(
                ParseErrorCode::UnexpectedToken,
                "`try` needs `catch` or `finally`",
            ));
        }
        Ok(Statement::Try {
            block,
            handler,
            finalizer,
            span: self.span_from(start),
        })
    }

    // -- functions and classes ----------------------------------------------

    /// `function name?(params) { body }` as declaration or expression.
    fn function(&mut self, kind: FunctionKind) -> ParseResult<Rc<FunctionNode>> {
        let start = self.expect_keyword("function")?.span;
        if self.is_punct("*") {
            return Err(self.error_here(
                ParseErrorCode::UnsupportedSyntax,
                "generator functions are not supported",
            ));
        }
        let name = if kind == FunctionKind::Declaration || !self.is_punct("(") {
            Some(self.binding_identifier()?)
        } else {
            None
        };
        let params_start = self.peek().span.start_offset;
        let (params, rest) = self.parameters()?;
        let body = self.block()?;
        Ok(Rc::new(FunctionNode {
            id: self.next_id(),
            kind,
            name,
            params,
            rest,
            body: FunctionBody::Block(body),
            span: self.span_from(start),
            params_start,
        }))
    }

    /// Method-style function: `(params) { body }` starting at the `(`.
    fn method_function(&mut self, kind: FunctionKind) -> ParseResult<Rc<FunctionNode>> {
        let start = self.peek().span;
        let (params, rest) = self.parameters()?;
        let body = self.block()?;
        Ok(Rc::new(FunctionNode {
            id: self.next_id(),
            kind,
            name: None,
            params,
            rest,
            body: FunctionBody::Block(body),
            span: self.span_from(start),
            params_start: start.start_offset,
        }))
    }

    fn parameters(&mut self) -> ParseResult<(Vec<Param>, Option<Binding>)> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        let mut rest = None;
        while !self.is_punct(")") {
            if self.eat_punct("...") {
                rest = Some(self.binding_identifier()?);
                break;
            }
            if self.is_punct("[") || self.is_punct("{") {
                return Err(self.error_here(
                    ParseErrorCode::UnsupportedSyntax,
                    "destructuring parameters are not supported",
                ));
            }
            let binding = self.binding_identifier()?;
            let default = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            params.push(Param { binding, default });
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok((params, rest))
    }

    /// Is the `(` at token `start` the start of an arrow parameter list?
    fn arrow_ahead(&self, start: usize) -> bool {
        let mut depth = 0usize;
        for (index, token) in self.tokens.iter().enumerate().skip(start) {
            match token.kind {
                TokenKind::Punct("(" | "[" | "{") => depth += 1,
                TokenKind::Punct(")" | "]" | "}") => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return matches!(
                            self.tokens.get(index + 1).map(|t| &t.kind),
                            Some(TokenKind::Punct("=>"))
                        );
                    }
                }
                TokenKind::Eof => return false,
                _ => {}
            }
        }
        false
    }

    fn arrow_function(&mut self) -> ParseResult<Expression> {
        let start = self.peek().span;
        let (params, rest) = if self.is_punct("(") {
            self.parameters()?
        } else {
            let binding = self.binding_identifier()?;
            (
                vec![Param {
                    binding,
                    default: None,
                }],
                None,
            )
        };
        if self.peek().newline_before {
            return Err(self.unexpected());
        }
        self.expect_punct("=>")?;
        let body = if self.is_punct("{") {
            FunctionBody::Block(self.block()?)
        } else {
            FunctionBody::Expression(Box::new(self.assignment()?))
        };
        let span = self.span_from(start);
        let node = Rc::new(FunctionNode {
            id: self.next_id(),
            kind: FunctionKind::Arrow,
            name: None,
            params,
            rest,
            body,
            span,
            params_start: start.start_offset,
        });
        Ok(Expression::new(ExpressionKind::Arrow(node), span))
    }

    fn class(&mut self, is_declaration: bool) -> ParseResult<Rc<ClassNode>> {
        let start = self.expect_keyword("class")?.span;
        let name = if is_declaration || !(self.is_ident("extends") || self.is_punct("{")) {
            Some(self.binding_identifier()?)
        } else {
            None
        };
        let super_class = if self.eat_ident("extends") {
            Some(Box::new(self.left_hand_side()?))
        } else {
            None
        };
        self.expect_punct("{")?;
        let mut constructor = None;
        let mut members = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected());
            }
            if self.eat_punct(";") {
                continue;
            }
            let member_start = self.peek().span;
            let is_static = self.is_ident("static") && !self.member_name_ends_at(1);
            if is_static {
                self.advance();
            }
            let accessor = if (self.is_ident("get") || self.is_ident("set")) && !self.member_name_ends_at(1)
            {
                let word = self.advance();
                Some(matches!(&word.kind, TokenKind::Ident(w) if w == "get"))
            } else {
                None
            };
            if self.is_ident("async") && !self.member_name_ends_at(1) {
                return Err(self.error_here(
                    ParseErrorCode::UnsupportedSyntax,
                    "async methods are not supported",
                ));
            }
            if self.is_punct("*") {
                return Err(self.error_here(
                    ParseErrorCode::UnsupportedSyntax,
                    "generator methods are not supported",
                ));
            }
            let key = self.property_name()?;
            if self.is_punct("(") {
                let is_constructor = !is_static
                    && accessor.is_none()
                    && matches!(&key, PropertyName::Identifier(n) | PropertyName::String(n) if n == "constructor");
                if is_constructor {
                    if constructor.is_some() {
                        return Err(self.error_here(
                            ParseErrorCode::UnexpectedToken,
                            "a class may only have one constructor",
                        ));
                    }
                    constructor = Some(self.method_function(FunctionKind::Constructor)?);
                    continue;
                }
                let kind = match accessor {
                    Some(true) => ClassMemberKind::Getter(self.method_function(FunctionKind::Getter)?),
                    Some(false) => ClassMemberKind::Setter(self.method_function(FunctionKind::Setter)?),
                    None => ClassMemberKind::Method(self.method_function(FunctionKind::Method)?),
                };
                members.push(ClassMember {
                    key,
                    is_static,
                    kind,
                    span: self.span_from(member_start),
                });
            } else {
                if accessor.is_some() {
                    return Err(self.unexpected());
                }
                let value = if self.eat_punct("=") {
                    Some(self.assignment()?)
                } else {
                    None
                };
                self.consume_semicolon()?;
                members.push(ClassMember {
                    key,
                    is_static,
                    kind: ClassMemberKind::Field {
                        value,
                        id: self.next_id(),
                    },
                    span: self.span_from(member_start),
                });
            }
        }
        self.advance();
        Ok(Rc::new(ClassNode {
            id: self.next_id(),
            name,
            super_class,
            constructor,
            members,
            span: self.span_from(start),
            is_declaration,
        }))
    }

    /// Does the member name end at token `n` (so a modifier word is itself the name)?
    fn member_name_ends_at(&self, n: usize) -> bool {
        self.is_punct_at(n, "(")
            || self.is_punct_at(n, "=")
            || self.is_punct_at(n, ";")
            || self.is_punct_at(n, "}")
            || self.is_punct_at(n, ":")
            || self.is_punct_at(n, ",")
    }

    fn property_name(&mut self) -> ParseResult<PropertyName> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(PropertyName::Identifier(name))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(PropertyName::String(s))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(PropertyName::Number(n))
            }
            TokenKind::Punct("[") => {
                self.advance();
                let expression = self.assignment()?;
                self.expect_punct("]")?;
                Ok(PropertyName::Computed(Box::new(expression)))
            }
            TokenKind::Punct("#") => Err(self.error_here(
                ParseErrorCode::UnsupportedSyntax,
                "private names are not supported",
            )),
            _ => Err(self.unexpected()),
        }
    }

    // -- expressions ---------------------------------------------------------

    fn expression(&mut self) -> ParseResult<Expression> {
        let first = self.assignment()?;
        if !self.is_punct(",") {
            return Ok(first);
        }
        let start = first.span;
        let mut items = vec![first];
        while self.eat_punct(",") {
            items.push(self.assignment()?);
        }
        Ok(Expression::new(
            ExpressionKind::Sequence(items),
            self.span_from(start),
        ))
    }

    fn assignment(&mut self) -> ParseResult<Expression> {
        if matches!(&self.peek().kind, TokenKind::Ident(name) if !is_reserved(name))
            && self.is_punct_at(1, "=>")
        {
            return self.arrow_function();
        }
        if self.is_punct("(") && self.arrow_ahead(self.pos) {
            return self.arrow_function();
        }
        if self.is_ident("async")
            && !self.peek_at(1).newline_before
            && (self.is_ident_at(1, "function")
                || (self.is_punct_at(1, "(") && self.arrow_ahead(self.pos + 1))
                || (matches!(self.peek_at(1).kind, TokenKind::Ident(_)) && self.is_punct_at(2, "=>")))
        {
            return Err(self.error_here(
                ParseErrorCode::UnsupportedSyntax,
                "async functions are not supported",
            ));
        }

        let target = self.conditional()?;
        let op = match self.peek().kind {
            TokenKind::Punct("=") => AssignOp::Assign,
            TokenKind::Punct("+=") => AssignOp::Add,
            TokenKind::Punct("-=") => AssignOp::Sub,
            TokenKind::Punct("*=") => AssignOp::Mul,
            TokenKind::Punct("/=") => AssignOp::Div,
            TokenKind::Punct("%=") => AssignOp::Rem,
            TokenKind::Punct("&&=") => AssignOp::And,
            TokenKind::Punct("||=") => AssignOp::Or,
            TokenKind::Punct("??=") => AssignOp::Nullish,
            _ => return Ok(target),
        };
        if !is_assignable(&target) {
            return Err(self.error_here(
                ParseErrorCode::InvalidAssignmentTarget,
                "invalid assignment target",
            ));
        }
        self.advance();
        let value = self.assignment()?;
        let span = target.span.to(&value.span);
        Ok(Expression::new(
            ExpressionKind::Assign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        ))
    }

    fn conditional(&mut self) -> ParseResult<Expression> {
        let test = self.binary(0)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let consequent = self.assignment()?;
        self.expect_punct(":")?;
        let alternate = self.assignment()?;
        let span = test.span.to(&alternate.span);
        Ok(Expression::new(
            ExpressionKind::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            },
            span,
        ))
    }

    fn binary(&mut self, min_precedence: u8) -> ParseResult<Expression> {
        let mut left = self.unary()?;
        loop {
            let Some((precedence, op)) = self.binary_operator() else {
                break;
            };
            if precedence < min_precedence {
                break;
            }
            self.advance();
            let next_min = if matches!(op, BinaryOrLogical::Binary(BinaryOp::Exp)) {
                precedence
            } else {
                precedence + 1
            };
            let right = self.binary(next_min)?;
            let span = left.span.to(&right.span);
            let kind = match op {
                BinaryOrLogical::Binary(op) => ExpressionKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                BinaryOrLogical::Logical(op) => ExpressionKind::Logical {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
            left = Expression::new(kind, span);
        }
        Ok(left)
    }

    fn binary_operator(&self) -> Option<(u8, BinaryOrLogical)> {
        use BinaryOrLogical::{Binary, Logical};
        let entry = match &self.peek().kind {
            TokenKind::Punct(p) => match *p {
                "??" => (1, Logical(LogicalOp::Nullish)),
                "||" => (1, Logical(LogicalOp::Or)),
                "&&" => (2, Logical(LogicalOp::And)),
                "|" => (3, Binary(BinaryOp::BitOr)),
                "^" => (4, Binary(BinaryOp::BitXor)),
                "&" => (5, Binary(BinaryOp::BitAnd)),
                "==" => (6, Binary(BinaryOp::Eq)),
                "!=" => (6, Binary(BinaryOp::NotEq)),
                "===" => (6, Binary(BinaryOp::StrictEq)),
                "!==" => (6, Binary(BinaryOp::StrictNotEq)),
                "<" => (7, Binary(BinaryOp::Lt)),
                ">" => (7, Binary(BinaryOp::Gt)),
                "<=" => (7, Binary(BinaryOp::LtEq)),
                ">=" => (7, Binary(BinaryOp::GtEq)),
                "+" => (9, Binary(BinaryOp::Add)),
                "-" => (9, Binary(BinaryOp::Sub)),
                "*" => (10, Binary(BinaryOp::Mul)),
                "/" => (10, Binary(BinaryOp::Div)),
                "%" => (10, Binary(BinaryOp::Rem)),
                "**" => (11, Binary(BinaryOp::Exp)),
                _ => return None,
            },
            TokenKind::Ident(word) if word == "instanceof" => (7, Binary(BinaryOp::InstanceOf)),
            TokenKind::Ident(word) if word == "in" => (7, Binary(BinaryOp::In)),
            _ => return None,
        };
        Some(entry)
    }

    fn unary(&mut self) -> ParseResult<Expression> {
        let token = self.peek().clone();
        let op = match &token.kind {
            TokenKind::Punct("!") => Some(UnaryOp::Not),
            TokenKind::Punct("-") => Some(UnaryOp::Minus),
            TokenKind::Punct("+") => Some(UnaryOp::Plus),
            TokenKind::Punct("~") => Some(UnaryOp::BitNot),
            TokenKind::Ident(w) if w == "typeof" => Some(UnaryOp::TypeOf),
            TokenKind::Ident(w) if w == "void" => Some(UnaryOp::Void),
            TokenKind::Ident(w) if w == "delete" => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let argument = self.unary()?;
            let span = token.span.to(&argument.span);
            return Ok(Expression::new(
                ExpressionKind::Unary {
                    op,
                    argument: Box::new(argument),
                },
                span,
            ));
        }
        if self.is_punct("++") || self.is_punct("--") {
            let op = if self.is_punct("++") {
                UpdateOp::Increment
            } else {
                UpdateOp::Decrement
            };
            self.advance();
            let target = self.unary()?;
            if !is_assignable(&target) {
                return Err(self.error_here(
                    ParseErrorCode::InvalidAssignmentTarget,
                    "invalid update target",
                ));
            }
            let span = token.span.to(&target.span);
            return Ok(Expression::new(
                ExpressionKind::Update {
                    op,
                    prefix: true,
                    target: Box::new(target),
                },
                span,
            ));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult<Expression> {
        let target = self.left_hand_side()?;
        if (self.is_punct("++") || self.is_punct("--")) && !self.peek().newline_before {
            let op = if self.is_punct("++") {
                UpdateOp::Increment
            } else {
                UpdateOp::Decrement
            };
            if !is_assignable(&target) {
                return Err(self.error_here(
                    ParseErrorCode::InvalidAssignmentTarget,
                    "invalid update target",
                ));
            }
            self.advance();
            let span = self.span_from(target.span);
            return Ok(Expression::new(
                ExpressionKind::Update {
                    op,
                    prefix: false,
                    target: Box::new(target),
                },
                span,
            ));
        }
        Ok(target)
    }

    /// Member accesses, calls and `new`.
    fn left_hand_side(&mut self) -> ParseResult<Expression> {
        let mut expression = if self.is_ident("new") {
            self.new_expression()?
        } else if self.is_ident("super") {
            self.super_expression()?
        } else {
            self.primary()?
        };
        loop {
            if self.is_punct(".") || self.is_punct("[") {
                expression = self.member_access(expression)?;
            } else if self.is_punct("(") {
                let arguments = self.arguments()?;
                let span = self.span_from(expression.span);
                expression = Expression::new(
                    ExpressionKind::Call {
                        callee: Box::new(expression),
                        arguments,
                    },
                    span,
                );
            } else {
                break;
            }
        }
        Ok(expression)
    }

    fn new_expression(&mut self) -> ParseResult<Expression> {
        let start = self.advance().span;
        let mut callee = if self.is_ident("new") {
            self.new_expression()?
        } else {
            self.primary()?
        };
        while self.is_punct(".") || self.is_punct("[") {
            callee = self.member_access(callee)?;
        }
        let arguments = if self.is_punct("(") {
            self.arguments()?
        } else {
            Vec::new()
        };
        Ok(Expression::new(
            ExpressionKind::New {
                callee: Box::new(callee),
                arguments,
            },
            self.span_from(start),
        ))
    }

    fn super_expression(&mut self) -> ParseResult<Expression> {
        let start = self.advance().span;
        if self.is_punct("(") {
            let arguments = self.arguments()?;
            return Ok(Expression::new(
                ExpressionKind::SuperCall { arguments },
                self.span_from(start),
            ));
        }
        let property = self.member_property()?;
        Ok(Expression::new(
            ExpressionKind::SuperMember { property },
            self.span_from(start),
        ))
    }

    fn member_access(&mut self, object: Expression) -> ParseResult<Expression> {
        let property = self.member_property()?;
        let span = self.span_from(object.span);
        Ok(Expression::new(
            ExpressionKind::Member {
                object: Box::new(object),
                property,
            },
            span,
        ))
    }

    fn member_property(&mut self) -> ParseResult<MemberProperty> {
        if self.eat_punct(".") {
            let token = self.peek().clone();
            return match token.kind {
                TokenKind::Ident(name) => {
                    self.advance();
                    Ok(MemberProperty::Named {
                        name,
                        span: token.span,
                    })
                }
                TokenKind::Punct("#") => Err(self.error_here(
                    ParseErrorCode::UnsupportedSyntax,
                    "private names are not supported",
                )),
                _ => Err(self.unexpected()),
            };
        }
        self.expect_punct("[")?;
        let expression = self.expression()?;
        self.expect_punct("]")?;
        Ok(MemberProperty::Computed(Box::new(expression)))
    }

    fn arguments(&mut self) -> ParseResult<Vec<Element>> {
        self.expect_punct("(")?;
        let mut arguments = Vec::new();
        while !self.is_punct(")") {
            let spread = self.eat_punct("...");
            let expression = self.assignment()?;
            arguments.push(Element { expression, spread });
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(arguments)
    }

    fn primary(&mut self) -> ParseResult<Expression> {
        let token = self.peek().clone();
        let span = token.span;
        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expression::new(ExpressionKind::Number(n), span))
            }
            TokenKind::BigInt(n) => {
                self.advance();
                Ok(Expression::new(ExpressionKind::BigInt(n), span))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expression::new(ExpressionKind::String(s), span))
            }
            TokenKind::Punct("(") => {
                self.advance();
                let inner = self.expression()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            TokenKind::Punct("[") => self.array_literal(),
            TokenKind::Punct("{") => self.object_literal(),
            TokenKind::Ident(word) => match word.as_str() {
                "true" | "false" => {
                    self.advance();
                    Ok(Expression::new(ExpressionKind::Bool(word == "true"), span))
                }
                "null" => {
                    self.advance();
                    Ok(Expression::new(ExpressionKind::Null, span))
                }
                "this" => {
                    self.advance();
                    Ok(Expression::new(ExpressionKind::This, span))
                }
                "function" => {
                    let node = self.function(FunctionKind::Expression)?;
                    let span = node.span;
                    Ok(Expression::new(ExpressionKind::Function(node), span))
                }
                "class" => {
                    let node = self.class(false)?;
                    let span = node.span;
                    Ok(Expression::new(ExpressionKind::Class(node), span))
                }
                SCOPE_LOOKUP_FUNCTION
                    if self.is_punct_at(1, "(")
                        && matches!(self.peek_at(2).kind, TokenKind::Str(_))
                        && self.is_punct_at(3, ")") =>
                {
                    self.advance();
                    self.advance();
                    let TokenKind::Str(name) = self.advance().kind else {
                        return Err(self.unexpected());
                    };
                    self.advance();
                    Ok(Expression::new(
                        ExpressionKind::ScopeLookup(name),
                        self.span_from(span),
                    ))
                }
                _ if is_reserved(&word) => Err(self.unexpected()),
                _ => {
                    self.advance();
                    Ok(Expression::new(
                        ExpressionKind::Identifier(IdentifierRef {
                            name: word,
                            id: self.next_id(),
                        }),
                        span,
                    ))
                }
            },
            _ => Err(self.unexpected()),
        }
    }

    fn array_literal(&mut self) -> ParseResult<Expression> {
        let start = self.advance().span;
        let mut elements = Vec::new();
        while !self.is_punct("]") {
            if self.eat_punct(",") {
                elements.push(None);
                continue;
            }
            let spread = self.eat_punct("...");
            let expression = self.assignment()?;
            elements.push(Some(Element { expression, spread }));
            if !self.is_punct("]") {
                self.expect_punct(",")?;
            }
        }
        self.advance();
        Ok(Expression::new(
            ExpressionKind::Array(elements),
            self.span_from(start),
        ))
    }

    fn object_literal(&mut self) -> ParseResult<Expression> {
        let start = self.advance().span;
        let mut properties = Vec::new();
        while !self.is_punct("}") {
            let prop_start = self.peek().span;
            if self.eat_punct("...") {
                let argument = self.assignment()?;
                properties.push(ObjectProperty::Spread {
                    argument,
                    span: self.span_from(prop_start),
                });
            } else if (self.is_ident("get") || self.is_ident("set")) && !self.member_name_ends_at(1) {
                let getter = self.is_ident("get");
                self.advance();
                let key = self.property_name()?;
                if getter {
                    let function = self.method_function(FunctionKind::Getter)?;
                    properties.push(ObjectProperty::Getter {
                        key,
                        function,
                        span: self.span_from(prop_start),
                    });
                } else {
                    let function = self.method_function(FunctionKind::Setter)?;
                    properties.push(ObjectProperty::Setter {
                        key,
                        function,
                        span: self.span_from(prop_start),
                    });
                }
            } else {
                if (self.is_ident("async") && !self.member_name_ends_at(1)) || self.is_punct("*") {
                    return Err(self.error_here(
                        ParseErrorCode::UnsupportedSyntax,
                        "async and generator methods are not supported",
                    ));
                }
                let key_token = self.peek().clone();
                let key = self.property_name()?;
                if self.is_punct("(") {
                    let function = self.method_function(FunctionKind::Method)?;
                    properties.push(ObjectProperty::Method {
                        key,
                        function,
                        span: self.span_from(prop_start),
                    });
                } else if self.eat_punct(":") {
                    let value = self.assignment()?;
                    properties.push(ObjectProperty::KeyValue {
                        key,
                        value,
                        shorthand: false,
                        span: self.span_from(prop_start),
                    });
                } else {
                    let PropertyName::Identifier(name) = key else {
                        return Err(self.unexpected());
                    };
                    if is_reserved(&name) {
                        return Err(self.unexpected());
                    }
                    let value = Expression::new(
                        ExpressionKind::Identifier(IdentifierRef {
                            name: name.clone(),
                            id: self.next_id(),
                        }),
                        key_token.span,
                    );
                    properties.push(ObjectProperty::KeyValue {
                        key: PropertyName::Identifier(name),
                        value,
                        shorthand: true,
                        span: key_token.span,
                    });
                }
            }
            if !self.is_punct("}") {
                self.expect_punct(",")?;
            }
        }
        self.advance();
        Ok(Expression::new(
            ExpressionKind::Object(properties),
            self.span_from(start),
        ))
    }
}

enum BinaryOrLogical {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn is_assignable(expression: &Expression) -> bool {
    matches!(
        expression.kind,
        ExpressionKind::Identifier(_)
            | ExpressionKind::Member { .. }
            | ExpressionKind::SuperMember { .. }
            | ExpressionKind::ScopeLookup(_)
    )
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(name) => format!("`{name}`"),
        TokenKind::Number(n) => format!("number {n}"),
        TokenKind::BigInt(n) => format!("bigint {n}n"),
        TokenKind::Str(_) => "string literal".to_string(),
        TokenKind::Punct(p) => format!("`{p}`"),
        TokenKind::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(src: &str) -> Expression {
        parse_expression_source(src, "test").expect("parse")
    }

    #[test]
    fn precedence_and_associativity() {
        let e = expr("1 + 2 * 3");
        let ExpressionKind::Binary { op, right, .. } = e.kind else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(right.kind, ExpressionKind::Binary { op: BinaryOp::Mul, .. }));

        let e = expr("2 ** 3 ** 2");
        let ExpressionKind::Binary { right, .. } = e.kind else {
            panic!("expected binary");
        };
        assert!(matches!(right.kind, ExpressionKind::Binary { op: BinaryOp::Exp, .. }));
    }

    #[test]
    fn arrow_functions_with_and_without_parens() {
        assert!(matches!(expr("x => x + 1").kind, ExpressionKind::Arrow(_)));
        let e = expr("(a, b = 2, ...rest) => { return a; }");
        let ExpressionKind::Arrow(node) = e.kind else {
            panic!("expected arrow");
        };
        assert_eq!(node.params.len(), 2);
        assert!(node.rest.is_some());
        assert_eq!(node.declared_length(), 1);
    }

    #[test]
    fn parenthesized_expression_is_not_an_arrow() {
        assert!(matches!(expr("(a + b) * c").kind, ExpressionKind::Binary { .. }));
    }

    #[test]
    fn scope_lookup_is_recognized_and_assignable() {
        let e = expr(r#"__$getFromScope("count") += 1"#);
        let ExpressionKind::Assign { target, .. } = e.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(target.kind, ExpressionKind::ScopeLookup(ref n) if n == "count"));
    }

    #[test]
    fn class_members_are_classified() {
        let program = parse_script(
            "class A extends B { constructor(x) { super(x); } static make() {} get v() { return 1; } set v(x) {} f = 1; static g; }",
            "test",
        )
        .expect("parse");
        let Statement::Class(class) = &program.body[0] else {
            panic!("expected class");
        };
        assert!(class.constructor.is_some());
        assert!(class.super_class.is_some());
        assert_eq!(class.members.len(), 5);
        assert!(class.members[0].is_static);
        assert!(matches!(class.members[1].kind, ClassMemberKind::Getter(_)));
        assert!(matches!(class.members[2].kind, ClassMemberKind::Setter(_)));
        assert!(matches!(class.members[3].kind, ClassMemberKind::Field { .. }));
        assert!(class.members[4].is_static);
    }

    #[test]
    fn object_literal_forms() {
        let e = expr("({ a, b: 1, m() {}, get g() { return 1; }, ['k']: 2, ...rest })");
        let ExpressionKind::Object(props) = e.kind else {
            panic!("expected object");
        };
        assert_eq!(props.len(), 6);
        assert!(matches!(props[0], ObjectProperty::KeyValue { shorthand: true, .. }));
        assert!(matches!(props[2], ObjectProperty::Method { .. }));
        assert!(matches!(props[3], ObjectProperty::Getter { .. }));
        assert!(matches!(props[5], ObjectProperty::Spread { .. }));
    }

    #[test]
    fn function_spans_cover_source() {
        let src = "const f = function named(a) { return a; };";
        let program = parse_script(src, "test").expect("parse");
        let Statement::Variable(decl) = &program.body[0] else {
            panic!("expected declaration");
        };
        let init = decl.declarators[0].init.as_ref().expect("init");
        assert_eq!(init.span.slice(src), "function named(a) { return a; }");
    }

    #[test]
    fn asi_on_newlines() {
        let program = parse_script("let a = 1\nlet b = 2\na + b", "test").expect("parse");
        assert_eq!(program.body.len(), 3);
    }

    #[test]
    fn unsupported_syntax_is_reported() {
        let err = parse_script("async function f() {}", "test").expect_err("must fail");
        assert_eq!(err.code, ParseErrorCode::UnsupportedSyntax);
        let err = parse_script("class A { #x = 1 }", "test").expect_err("must fail");
        assert_eq!(err.code, ParseErrorCode::UnsupportedSyntax);
    }

    #[test]
    fn invalid_assignment_target() {
        let err = parse_expression_source("1 = 2", "test").expect_err("must fail");
        assert_eq!(err.code, ParseErrorCode::InvalidAssignmentTarget);
    }

    #[test]
    fn parse_error_display_with_span() {
        let err = parse_script("let = ;", "demo.js").expect_err("must fail");
        let text = err.to_string();
        assert!(text.contains("source=demo.js"), "{text}");
        assert!(text.contains("line=1"), "{text}");
    }
}
