//! Span-annotated syntax tree for the script subset the runtime executes.
//!
//! Every node that opens a lexical scope or names a binding carries a
//! [`NodeId`] so scope analysis and the transpiler can refer back to it.
//! Spans are byte offsets into the original source text; the transpiler
//! splices instrumentation into the text at these offsets.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Parse-goal marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseGoal {
    /// A sequence of statements.
    Script,
    /// A single expression (used to re-evaluate recorded source text).
    Expression,
}

impl ParseGoal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Expression => "expression",
        }
    }
}

/// Byte range plus the 1-based line/column of its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start_offset: usize,
    pub end_offset: usize,
    pub start_line: u32,
    pub start_column: u32,
}

impl SourceSpan {
    pub fn new(start_offset: usize, end_offset: usize, start_line: u32, start_column: u32) -> Self {
        Self {
            start_offset,
            end_offset,
            start_line,
            start_column,
        }
    }

    /// Span from the start of `self` to the end of `end`.
    pub fn to(&self, end: &SourceSpan) -> SourceSpan {
        SourceSpan {
            end_offset: end.end_offset,
            ..*self
        }
    }

    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        text.get(self.start_offset..self.end_offset).unwrap_or("")
    }
}

/// Identity of a scope-bearing or binding node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

// ---------------------------------------------------------------------------
// Program and statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Program {
    pub body: Vec<Statement>,
    pub span: SourceSpan,
}

/// A declared name (`let x`, a parameter, a function or class name).
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub span: SourceSpan,
    pub id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Var,
    Let,
    Const,
}

#[derive(Debug, Clone)]
pub struct VariableDeclarator {
    pub binding: Binding,
    pub init: Option<Expression>,
}

#[derive(Debug, Clone)]
pub struct VariableDeclaration {
    pub kind: VariableKind,
    pub declarators: Vec<VariableDeclarator>,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub body: Vec<Statement>,
    pub span: SourceSpan,
    pub id: NodeId,
}

#[derive(Debug, Clone)]
pub struct CatchClause {
    pub param: Option<Binding>,
    pub body: Block,
    pub id: NodeId,
}

#[derive(Debug, Clone)]
pub enum ForInit {
    Variable(VariableDeclaration),
    Expression(Expression),
}

#[derive(Debug, Clone)]
pub enum Statement {
    Variable(VariableDeclaration),
    Function(Rc<FunctionNode>),
    Class(Rc<ClassNode>),
    Expression {
        expression: Expression,
        span: SourceSpan,
    },
    Return {
        argument: Option<Expression>,
        span: SourceSpan,
    },
    If {
        test: Expression,
        consequent: Box<Statement>,
        alternate: Option<Box<Statement>>,
        span: SourceSpan,
    },
    While {
        test: Expression,
        body: Box<Statement>,
        span: SourceSpan,
    },
    For {
        init: Option<ForInit>,
        test: Option<Expression>,
        update: Option<Expression>,
        body: Box<Statement>,
        span: SourceSpan,
        id: NodeId,
    },
    Block(Block),
    Throw {
        argument: Expression,
        span: SourceSpan,
    },
    Try {
        block: Block,
        handler: Option<CatchClause>,
        finalizer: Option<Block>,
        span: SourceSpan,
    },
    Break {
        span: SourceSpan,
    },
    Continue {
        span: SourceSpan,
    },
    Empty {
        span: SourceSpan,
    },
}

impl Statement {
    pub fn span(&self) -> SourceSpan {
        match self {
            Self::Variable(decl) => decl.span,
            Self::Function(node) => node.span,
            Self::Class(node) => node.span,
            Self::Block(block) => block.span,
            Self::Expression { span, .. }
            | Self::Return { span, .. }
            | Self::If { span, .. }
            | Self::While { span, .. }
            | Self::For { span, .. }
            | Self::Throw { span, .. }
            | Self::Try { span, .. }
            | Self::Break { span }
            | Self::Continue { span }
            | Self::Empty { span } => *span,
        }
    }
}

// ---------------------------------------------------------------------------
// Functions and classes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Declaration,
    Expression,
    Arrow,
    Method,
    Getter,
    Setter,
    Constructor,
}

impl FunctionKind {
    /// Methods, accessors and arrows have no own `prototype` and cannot be
    /// called with `new`.
    pub fn is_constructable(self) -> bool {
        matches!(self, Self::Declaration | Self::Expression)
    }

    pub fn binds_this(self) -> bool {
        !matches!(self, Self::Arrow)
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub binding: Binding,
    pub default: Option<Expression>,
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    Block(Block),
    Expression(Box<Expression>),
}

#[derive(Debug, Clone)]
pub struct FunctionNode {
    pub id: NodeId,
    pub kind: FunctionKind,
    pub name: Option<Binding>,
    pub params: Vec<Param>,
    pub rest: Option<Binding>,
    pub body: FunctionBody,
    /// Whole construct.  For methods and accessors this starts at the
    /// parameter list.
    pub span: SourceSpan,
    /// Offset of the parameter list (`(`, or the lone arrow parameter).
    pub params_start: usize,
}

impl FunctionNode {
    /// Number of parameters before the first default or rest parameter.
    pub fn declared_length(&self) -> usize {
        self.params
            .iter()
            .take_while(|param| param.default.is_none())
            .count()
    }
}

#[derive(Debug, Clone)]
pub enum PropertyName {
    Identifier(String),
    String(String),
    Number(f64),
    Computed(Box<Expression>),
}

impl PropertyName {
    /// Static key text, or `None` for computed keys.
    pub fn static_key(&self) -> Option<String> {
        match self {
            Self::Identifier(name) | Self::String(name) => Some(name.clone()),
            Self::Number(n) => Some(crate::object_model::number_to_string(*n)),
            Self::Computed(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClassMemberKind {
    Method(Rc<FunctionNode>),
    Getter(Rc<FunctionNode>),
    Setter(Rc<FunctionNode>),
    Field {
        value: Option<Expression>,
        /// Scope of the initializer (binds `this`).
        id: NodeId,
    },
}

#[derive(Debug, Clone)]
pub struct ClassMember {
    pub key: PropertyName,
    pub is_static: bool,
    pub kind: ClassMemberKind,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub struct ClassNode {
    pub id: NodeId,
    pub name: Option<Binding>,
    pub super_class: Option<Box<Expression>>,
    pub constructor: Option<Rc<FunctionNode>>,
    pub members: Vec<ClassMember>,
    pub span: SourceSpan,
    pub is_declaration: bool,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IdentifierRef {
    pub name: String,
    pub id: NodeId,
}

#[derive(Debug, Clone)]
pub enum ObjectProperty {
    KeyValue {
        key: PropertyName,
        value: Expression,
        shorthand: bool,
        span: SourceSpan,
    },
    Method {
        key: PropertyName,
        function: Rc<FunctionNode>,
        span: SourceSpan,
    },
    Getter {
        key: PropertyName,
        function: Rc<FunctionNode>,
        span: SourceSpan,
    },
    Setter {
        key: PropertyName,
        function: Rc<FunctionNode>,
        span: SourceSpan,
    },
    Spread {
        argument: Expression,
        span: SourceSpan,
    },
}

/// Array element or call argument, optionally spread.
#[derive(Debug, Clone)]
pub struct Element {
    pub expression: Expression,
    pub spread: bool,
}

#[derive(Debug, Clone)]
pub enum MemberProperty {
    Named { name: String, span: SourceSpan },
    Computed(Box<Expression>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Minus,
    Plus,
    BitNot,
    TypeOf,
    Void,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Increment,
    Decrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Exp,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    BitAnd,
    BitOr,
    BitXor,
    InstanceOf,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Nullish,
}

impl AssignOp {
    pub fn binary(self) -> Option<BinaryOp> {
        match self {
            Self::Add => Some(BinaryOp::Add),
            Self::Sub => Some(BinaryOp::Sub),
            Self::Mul => Some(BinaryOp::Mul),
            Self::Div => Some(BinaryOp::Div),
            Self::Rem => Some(BinaryOp::Rem),
            Self::Assign | Self::And | Self::Or | Self::Nullish => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub kind: ExpressionKind,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub enum ExpressionKind {
    Number(f64),
    BigInt(i128),
    String(String),
    Bool(bool),
    Null,
    Identifier(IdentifierRef),
    This,
    /// `__$getFromScope("name")` inside recorded source text.
    ScopeLookup(String),
    Array(Vec<Option<Element>>),
    Object(Vec<ObjectProperty>),
    Function(Rc<FunctionNode>),
    Arrow(Rc<FunctionNode>),
    Class(Rc<ClassNode>),
    Unary {
        op: UnaryOp,
        argument: Box<Expression>,
    },
    Update {
        op: UpdateOp,
        prefix: bool,
        target: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expression>,
        value: Box<Expression>,
    },
    Conditional {
        test: Box<Expression>,
        consequent: Box<Expression>,
        alternate: Box<Expression>,
    },
    Call {
        callee: Box<Expression>,
        arguments: Vec<Element>,
    },
    New {
        callee: Box<Expression>,
        arguments: Vec<Element>,
    },
    Member {
        object: Box<Expression>,
        property: MemberProperty,
    },
    SuperMember {
        property: MemberProperty,
    },
    SuperCall {
        arguments: Vec<Element>,
    },
    Sequence(Vec<Expression>),
}

impl Expression {
    pub fn new(kind: ExpressionKind, span: SourceSpan) -> Self {
        Self { kind, span }
    }

    /// Anonymous function, arrow or class definitions pick up a name from
    /// the binding they are assigned to.
    pub fn is_anonymous_definition(&self) -> bool {
        match &self.kind {
            ExpressionKind::Function(node) => node.name.is_none(),
            ExpressionKind::Arrow(_) => true,
            ExpressionKind::Class(node) => node.name.is_none(),
            _ => false,
        }
    }
}
