//! Source-to-source instrumentation.
//!
//! [`instrument`] parses a script, works out which outer bindings every
//! function and class captures, and splices registration calls into the
//! original text so the runtime can later serialize those closures:
//!
//! - function and arrow expressions become
//!   `__SerializableJs.registerFunction(<fn>, { scope: () => ({ a, b }), source: "…" })`;
//! - function declarations are registered at the top of the statement list
//!   that declares them, class declarations right after the declaration;
//! - object methods become `key: __SerializableJs.registerFunction(function (…) {…}, …)`;
//! - object getters and setters with static keys are registered through
//!   `registerAccessors` wrapped around the object literal.
//!
//! The recorded `source` of each construct is its own (instrumented) text
//! with every captured reference replaced by `__$getFromScope("name")`.
//! The live output keeps the author's formatting everywhere else.

use serde::{Deserialize, Serialize};

use crate::ast::{
    ClassMemberKind, ClassNode, Expression, ExpressionKind, ForInit, FunctionBody, FunctionNode,
    MemberProperty, NodeId, ObjectProperty, PropertyName, SourceSpan, Statement, UnaryOp,
    VariableDeclaration,
};
use crate::intrinsics::RUNTIME_GLOBAL;
use crate::parser::{ParseError, SCOPE_LOOKUP_FUNCTION, parse_script};
use crate::registry::json_quote;
use crate::scope_analysis::{ScopeAnalysis, ScopeId, THIS_BINDING};

pub const INSTRUMENT_LABEL: &str = "<instrument>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentOptions {
    /// Wrap every eligible expression in `ensureSerializable(...)`.
    pub wrap_expressions: bool,
}

/// Instrument `source` for the serialization runtime.
pub fn instrument(source: &str, options: &InstrumentOptions) -> Result<String, ParseError> {
    let program = parse_script(source, INSTRUMENT_LABEL)?;
    let mut instrumenter = Instrumenter {
        source,
        analysis: ScopeAnalysis::analyze(&program),
        options: *options,
        splices: Vec::new(),
        depth: 0,
    };
    instrumenter.statements(&program.body, 0);
    Ok(instrumenter.render(0, source.len(), None))
}

// ---------------------------------------------------------------------------
// Splices
// ---------------------------------------------------------------------------

/// Order of insertions that share an offset: closing text of earlier
/// constructs, then hoisted registrations, then opening text, then the
/// replacement of a captured reference starting there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Close,
    Hoist,
    Open,
    Replace,
}

#[derive(Debug, Clone)]
struct Capture {
    name: String,
    declared: ScopeId,
}

#[derive(Debug, Clone)]
enum Piece {
    Text(String),
    /// `scope: () => ({ … }), source: "…"`
    Options { captures: Vec<Capture>, source: String },
}

impl From<&str> for Piece {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Piece {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

#[derive(Debug, Clone)]
struct Splice {
    at: usize,
    phase: Phase,
    /// Nesting rank of the owning node; larger is more deeply nested.
    rank: u32,
    /// Span of the node this text instruments.
    owner: (usize, usize),
    pieces: Vec<Piece>,
}

/// Rendering the recorded source of one construct.
struct Context {
    scope: ScopeId,
    rank: u32,
    replacements: Vec<(usize, usize, String)>,
}

fn rank(depth: u32, slot: u32) -> u32 {
    depth * 2 + slot
}

fn scope_lookup(name: &str) -> String {
    format!("{SCOPE_LOOKUP_FUNCTION}({})", json_quote(name))
}

/// Parentheses, brackets and braces in `text` close in order and none
/// closes before it opens.  Spans of parenthesized operands stop inside
/// the parentheses, so such a slice is not safe to wrap.
fn is_balanced(text: &str) -> bool {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in text.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0 && quote.is_none()
}

/// `__SerializableJs.<anything>(...)` calls are left untouched.
fn is_runtime_call(callee: &Expression) -> bool {
    matches!(
        &callee.kind,
        ExpressionKind::Member { object, .. }
            if matches!(&object.kind, ExpressionKind::Identifier(ident) if ident.name == RUNTIME_GLOBAL)
    )
}

struct Instrumenter<'s> {
    source: &'s str,
    analysis: ScopeAnalysis,
    options: InstrumentOptions,
    splices: Vec<Splice>,
    depth: u32,
}

impl Instrumenter<'_> {
    fn push(&mut self, at: usize, phase: Phase, rank: u32, owner: SourceSpan, pieces: Vec<Piece>) {
        self.splices.push(Splice {
            at,
            phase,
            rank,
            owner: (owner.start_offset, owner.end_offset),
            pieces,
        });
    }

    /// Surround `span` with `open` and `close`.
    fn wrap(&mut self, span: SourceSpan, rank: u32, open: String, close: Vec<Piece>) {
        self.push(span.start_offset, Phase::Open, rank, span, vec![Piece::Text(open)]);
        self.push(span.end_offset, Phase::Close, rank, span, close);
    }

    // -- registration text ---------------------------------------------------

    fn captures(&self, id: NodeId, span: SourceSpan) -> Vec<Capture> {
        let mut out: Vec<Capture> = Vec::new();
        for reference in self.analysis.captured_references(id, span) {
            let Some(declared) = reference.resolved else {
                continue;
            };
            if out.iter().all(|c| c.name != reference.name) {
                out.push(Capture {
                    name: reference.name.clone(),
                    declared,
                });
            }
        }
        out
    }

    /// `{ scope, source }` contents for the construct `id`, whose own
    /// instrumentation sits at `own_rank`.
    fn options(&self, id: NodeId, span: SourceSpan, own_rank: u32, prefix: &str) -> Piece {
        let captures = self.captures(id, span);
        let text = match self.analysis.construct_scope(id) {
            Some(scope) => {
                let replacements = self
                    .analysis
                    .captured_references(id, span)
                    .into_iter()
                    .map(|r| {
                        let lookup = scope_lookup(&r.name);
                        let text = if r.shorthand {
                            format!("{}: {lookup}", r.name)
                        } else {
                            lookup
                        };
                        (r.span.start_offset, r.span.end_offset, text)
                    })
                    .collect();
                let context = Context {
                    scope,
                    rank: own_rank,
                    replacements,
                };
                self.render(span.start_offset, span.end_offset, Some(&context))
            }
            None => span.slice(self.source).to_string(),
        };
        Piece::Options {
            captures,
            source: format!("{prefix}{text}"),
        }
    }

    fn render_piece(&self, piece: &Piece, scope: Option<ScopeId>) -> String {
        match piece {
            Piece::Text(text) => text.clone(),
            Piece::Options { captures, source } => {
                let entries: Vec<String> = captures
                    .iter()
                    .map(|capture| {
                        // Inside another construct's recorded source, names
                        // that construct captures are only reachable through
                        // its scope table.
                        let outer = scope.is_some_and(|s| !self.analysis.is_within(capture.declared, s));
                        let value = if outer {
                            scope_lookup(&capture.name)
                        } else {
                            capture.name.clone()
                        };
                        if outer || capture.name == THIS_BINDING {
                            format!("{}: {value}", capture.name)
                        } else {
                            value
                        }
                    })
                    .collect();
                let scope = if entries.is_empty() {
                    "() => ({})".to_string()
                } else {
                    format!("() => ({{ {} }})", entries.join(", "))
                };
                format!("scope: {scope}, source: {}", json_quote(source))
            }
        }
    }

    /// Text of `start..end` with every applicable splice applied.  Without
    /// a context this is the live output; with one it is the recorded
    /// source of that construct.
    fn render(&self, start: usize, end: usize, context: Option<&Context>) -> String {
        let scope = context.map(|c| c.scope);
        let mut events: Vec<(usize, Phase, i64, usize, Option<usize>, String)> = Vec::new();
        for (seq, splice) in self.splices.iter().enumerate() {
            if let Some(context) = context {
                let inside = splice.owner.0 >= start && splice.owner.1 <= end;
                if !inside || splice.rank <= context.rank {
                    continue;
                }
            }
            let tiebreak = match splice.phase {
                Phase::Close => -i64::from(splice.rank),
                Phase::Open => i64::from(splice.rank),
                Phase::Hoist | Phase::Replace => 0,
            };
            let text: String = splice.pieces.iter().map(|p| self.render_piece(p, scope)).collect();
            events.push((splice.at, splice.phase, tiebreak, seq, None, text));
        }
        if let Some(context) = context {
            for (seq, (from, to, text)) in context.replacements.iter().enumerate() {
                events.push((*from, Phase::Replace, 0, seq, Some(*to), text.clone()));
            }
        }
        events.sort_by(|a, b| (a.0, a.1, a.2, a.3).cmp(&(b.0, b.1, b.2, b.3)));

        let mut out = String::new();
        let mut cursor = start;
        for (at, _, _, _, replaced_until, text) in events {
            if at > cursor {
                out.push_str(self.source.get(cursor..at).unwrap_or(""));
                cursor = at;
            }
            out.push_str(&text);
            if let Some(until) = replaced_until {
                cursor = cursor.max(until);
            }
        }
        if end > cursor {
            out.push_str(self.source.get(cursor..end).unwrap_or(""));
        }
        out
    }

    // -- walk ----------------------------------------------------------------

    fn statements(&mut self, body: &[Statement], hoist_at: usize) {
        for statement in body {
            self.statement(statement, hoist_at);
        }
    }

    fn statement(&mut self, statement: &Statement, hoist_at: usize) {
        self.depth += 1;
        let depth = self.depth;
        match statement {
            Statement::Variable(decl) => self.variable(decl),
            Statement::Function(node) => {
                self.function_body(node);
                if let Some(name) = &node.name {
                    let own = rank(depth, 1);
                    let options = self.options(node.id, node.span, own, "");
                    let pieces = vec![
                        format!("{RUNTIME_GLOBAL}.registerFunction({}, {{ ", name.name).into(),
                        options,
                        " }); ".into(),
                    ];
                    self.push(hoist_at, Phase::Hoist, own, node.span, pieces);
                }
            }
            Statement::Class(node) => {
                self.class_body(node);
                if let Some(name) = &node.name {
                    let own = rank(depth, 1);
                    let options = self.options(node.id, node.span, own, "");
                    let pieces = vec![
                        format!(" {RUNTIME_GLOBAL}.registerClass({}, {{ ", name.name).into(),
                        options,
                        " });".into(),
                    ];
                    self.push(node.span.end_offset, Phase::Close, own, node.span, pieces);
                }
            }
            Statement::Expression { expression, .. } => self.expression(expression, false),
            Statement::Return { argument, .. } => {
                if let Some(argument) = argument {
                    self.expression(argument, true);
                }
            }
            Statement::If {
                test,
                consequent,
                alternate,
                ..
            } => {
                self.expression(test, true);
                self.statement(consequent, hoist_at);
                if let Some(alternate) = alternate {
                    self.statement(alternate, hoist_at);
                }
            }
            Statement::While { test, body, .. } => {
                self.expression(test, true);
                self.statement(body, hoist_at);
            }
            Statement::For {
                init,
                test,
                update,
                body,
                ..
            } => {
                match init {
                    Some(ForInit::Variable(decl)) => self.variable(decl),
                    Some(ForInit::Expression(expression)) => self.expression(expression, false),
                    None => {}
                }
                if let Some(test) = test {
                    self.expression(test, true);
                }
                if let Some(update) = update {
                    self.expression(update, false);
                }
                self.statement(body, hoist_at);
            }
            Statement::Block(block) => self.statements(&block.body, block.span.start_offset + 1),
            Statement::Throw { argument, .. } => self.expression(argument, true),
            Statement::Try {
                block,
                handler,
                finalizer,
                ..
            } => {
                self.statements(&block.body, block.span.start_offset + 1);
                if let Some(handler) = handler {
                    self.statements(&handler.body.body, handler.body.span.start_offset + 1);
                }
                if let Some(finalizer) = finalizer {
                    self.statements(&finalizer.body, finalizer.span.start_offset + 1);
                }
            }
            Statement::Break { .. } | Statement::Continue { .. } | Statement::Empty { .. } => {}
        }
        self.depth -= 1;
    }

    fn variable(&mut self, decl: &VariableDeclaration) {
        for declarator in &decl.declarators {
            if let Some(init) = &declarator.init {
                self.expression(init, true);
            }
        }
    }

    fn function_body(&mut self, node: &FunctionNode) {
        for param in &node.params {
            if let Some(default) = &param.default {
                self.expression(default, true);
            }
        }
        match &node.body {
            FunctionBody::Block(block) => self.statements(&block.body, block.span.start_offset + 1),
            FunctionBody::Expression(expression) => self.expression(expression, true),
        }
    }

    /// Class members are registered by the runtime when the class is.
    fn class_body(&mut self, node: &ClassNode) {
        if let Some(super_class) = &node.super_class {
            self.expression(super_class, true);
        }
        if let Some(constructor) = &node.constructor {
            self.nested_function(constructor);
        }
        for member in &node.members {
            self.property_name(&member.key);
            match &member.kind {
                ClassMemberKind::Method(function)
                | ClassMemberKind::Getter(function)
                | ClassMemberKind::Setter(function) => self.nested_function(function),
                ClassMemberKind::Field { value, .. } => {
                    if let Some(value) = value {
                        self.expression(value, true);
                    }
                }
            }
        }
    }

    fn nested_function(&mut self, node: &FunctionNode) {
        self.depth += 1;
        self.function_body(node);
        self.depth -= 1;
    }

    fn property_name(&mut self, key: &PropertyName) {
        if let PropertyName::Computed(expression) = key {
            self.expression(expression, true);
        }
    }

    fn member_property(&mut self, property: &MemberProperty) {
        if let MemberProperty::Computed(expression) = property {
            self.expression(expression, true);
        }
    }

    /// `new` binds tighter than a call, so nothing on the callee's member
    /// chain may turn into a call.
    fn constructor_callee(&mut self, callee: &Expression) {
        match &callee.kind {
            ExpressionKind::Member { object, property } => {
                self.depth += 1;
                self.constructor_callee(object);
                self.member_property(property);
                self.depth -= 1;
            }
            _ => self.expression(callee, false),
        }
    }

    fn expression(&mut self, expression: &Expression, wrap: bool) {
        self.depth += 1;
        let depth = self.depth;
        let mut eligible = wrap;
        match &expression.kind {
            ExpressionKind::Number(_)
            | ExpressionKind::BigInt(_)
            | ExpressionKind::String(_)
            | ExpressionKind::Bool(_)
            | ExpressionKind::Null
            | ExpressionKind::Identifier(_)
            | ExpressionKind::This => {}
            ExpressionKind::ScopeLookup(_) => eligible = false,
            ExpressionKind::Array(elements) => {
                for element in elements.iter().flatten() {
                    self.expression(&element.expression, true);
                }
            }
            ExpressionKind::Object(properties) => self.object_literal(expression.span, properties, depth),
            ExpressionKind::Function(node) | ExpressionKind::Arrow(node) => {
                self.function_body(node);
                let own = rank(depth, 1);
                let options = self.options(node.id, node.span, own, "");
                self.wrap(
                    expression.span,
                    own,
                    format!("{RUNTIME_GLOBAL}.registerFunction("),
                    vec![", { ".into(), options, " })".into()],
                );
            }
            ExpressionKind::Class(node) => {
                self.class_body(node);
                let own = rank(depth, 1);
                let options = self.options(node.id, node.span, own, "");
                self.wrap(
                    expression.span,
                    own,
                    format!("{RUNTIME_GLOBAL}.registerClass("),
                    vec![", { ".into(), options, " })".into()],
                );
            }
            ExpressionKind::Unary { op, argument } => {
                let wrap_argument = match op {
                    UnaryOp::Delete => false,
                    UnaryOp::TypeOf => !matches!(argument.kind, ExpressionKind::Identifier(_)),
                    _ => true,
                };
                self.expression(argument, wrap_argument);
            }
            ExpressionKind::Update { target, .. } => self.expression(target, false),
            ExpressionKind::Binary { left, right, .. } | ExpressionKind::Logical { left, right, .. } => {
                self.expression(left, true);
                self.expression(right, true);
            }
            ExpressionKind::Assign { target, value, .. } => {
                self.expression(target, false);
                self.expression(value, true);
            }
            ExpressionKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.expression(test, true);
                self.expression(consequent, true);
                self.expression(alternate, true);
            }
            ExpressionKind::Call { callee, arguments } => {
                if is_runtime_call(callee) {
                    eligible = false;
                } else {
                    self.expression(callee, false);
                    for argument in arguments {
                        self.expression(&argument.expression, true);
                    }
                }
            }
            ExpressionKind::New { callee, arguments } => {
                self.constructor_callee(callee);
                for argument in arguments {
                    self.expression(&argument.expression, true);
                }
            }
            ExpressionKind::Member { object, property } => {
                self.expression(object, true);
                self.member_property(property);
            }
            ExpressionKind::SuperMember { property } => self.member_property(property),
            ExpressionKind::SuperCall { arguments } => {
                for argument in arguments {
                    self.expression(&argument.expression, true);
                }
            }
            ExpressionKind::Sequence(items) => {
                eligible = false;
                for item in items {
                    self.expression(item, true);
                }
            }
        }
        if eligible && self.options.wrap_expressions && is_balanced(expression.span.slice(self.source)) {
            self.wrap(
                expression.span,
                rank(depth, 0),
                format!("{RUNTIME_GLOBAL}.ensureSerializable("),
                vec![")".into()],
            );
        }
        self.depth -= 1;
    }

    fn object_literal(&mut self, span: SourceSpan, properties: &[ObjectProperty], depth: u32) {
        let mut accessors: Vec<Piece> = Vec::new();
        for property in properties {
            match property {
                ObjectProperty::KeyValue {
                    key,
                    value,
                    shorthand,
                    ..
                } => {
                    self.property_name(key);
                    if !shorthand {
                        self.expression(value, true);
                    }
                }
                ObjectProperty::Method { key, function, .. } => {
                    self.property_name(key);
                    self.depth += 1;
                    self.function_body(function);
                    let own = rank(self.depth, 1);
                    let options = self.options(function.id, function.span, own, "function ");
                    self.wrap(
                        function.span,
                        own,
                        format!(": {RUNTIME_GLOBAL}.registerFunction(function "),
                        vec![", { ".into(), options, " })".into()],
                    );
                    self.depth -= 1;
                }
                ObjectProperty::Getter { key, function, .. } | ObjectProperty::Setter { key, function, .. } => {
                    let kind = if matches!(property, ObjectProperty::Getter { .. }) { "get" } else { "set" };
                    self.property_name(key);
                    self.depth += 1;
                    self.function_body(function);
                    if let Some(name) = key.static_key() {
                        let own = rank(self.depth, 1);
                        if !accessors.is_empty() {
                            accessors.push(", ".into());
                        }
                        accessors.push(format!("{{ key: {}, kind: \"{kind}\", ", json_quote(&name)).into());
                        accessors.push(self.options(function.id, function.span, own, "function "));
                        accessors.push(" }".into());
                    }
                    self.depth -= 1;
                }
                ObjectProperty::Spread { argument, .. } => self.expression(argument, true),
            }
        }
        if !accessors.is_empty() {
            let mut close: Vec<Piece> = vec![", [".into()];
            close.extend(accessors);
            close.push("])".into());
            self.wrap(span, rank(depth, 1), format!("{RUNTIME_GLOBAL}.registerAccessors("), close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(src: &str) -> String {
        instrument(src, &InstrumentOptions::default()).expect("instrument")
    }

    fn wrapped(src: &str) -> String {
        instrument(src, &InstrumentOptions { wrap_expressions: true }).expect("instrument")
    }

    #[test]
    fn arrows_are_registered_with_their_captures() {
        let out = plain("const x = 5;\nconst f = () => x * 2;");
        assert_eq!(
            out,
            r#"const x = 5;
const f = __SerializableJs.registerFunction(() => x * 2, { scope: () => ({ x }), source: "() => __$getFromScope(\"x\") * 2" });"#
        );
    }

    #[test]
    fn code_without_functions_is_unchanged() {
        let src = "let a = 1;\n// note\na = a + 2;\n";
        assert_eq!(plain(src), src);
    }

    #[test]
    fn function_declarations_are_registered_up_front() {
        let out = plain("function fact(n) { return n <= 1 ? 1 : n * fact(n - 1); }");
        assert_eq!(
            out,
            r#"__SerializableJs.registerFunction(fact, { scope: () => ({ fact }), source: "function fact(n) { return n <= 1 ? 1 : n * __$getFromScope(\"fact\")(n - 1); }" }); function fact(n) { return n <= 1 ? 1 : n * fact(n - 1); }"#
        );
    }

    #[test]
    fn declarations_in_blocks_are_registered_inside_the_block() {
        let out = plain("{ function f() { return 1; } }");
        assert!(out.starts_with("{__SerializableJs.registerFunction(f, "), "{out}");
    }

    #[test]
    fn nested_thunks_read_outer_captures_from_the_scope_table() {
        let src = "const outer = 1;\nconst fn = () => { const inner = 2; return () => outer + inner; };";
        let out = plain(src);
        // live thunk of the inner arrow
        assert!(out.contains("scope: () => ({ outer, inner })"), "{out}");
        // the same thunk inside the outer arrow's recorded source
        assert!(
            out.contains(r#"scope: () => ({ outer: __$getFromScope(\"outer\"), inner })"#),
            "{out}"
        );
        assert!(out.contains("scope: () => ({ outer }), source: "), "{out}");
    }

    #[test]
    fn object_methods_become_registered_function_expressions() {
        let out = plain("const o = { m(a) { return a; } };");
        assert_eq!(
            out,
            r#"const o = { m: __SerializableJs.registerFunction(function (a) { return a; }, { scope: () => ({}), source: "function (a) { return a; }" }) };"#
        );
    }

    #[test]
    fn accessors_are_registered_around_the_literal() {
        let out = plain("let v = 1;\nconst o = { get p() { return v; }, set p(x) { v = x; } };");
        assert!(out.contains("const o = __SerializableJs.registerAccessors({ get p() {"), "{out}");
        assert!(out.contains(r#"{ key: "p", kind: "get", scope: () => ({ v }), source: "function () { return __$getFromScope(\"v\"); }" }"#), "{out}");
        assert!(out.contains(r#"{ key: "p", kind: "set", scope: () => ({ v }), "#), "{out}");
        assert!(out.ends_with("}]);"), "{out}");
    }

    #[test]
    fn class_declarations_are_registered_after_the_body() {
        let out = plain("let y = 1;\nclass A { m() { return y; } }");
        assert!(
            out.ends_with(r#"class A { m() { return y; } } __SerializableJs.registerClass(A, { scope: () => ({ y }), source: "class A { m() { return __$getFromScope(\"y\"); } }" });"#),
            "{out}"
        );
    }

    #[test]
    fn arrows_capture_lexical_this() {
        let out = plain("function f() { return () => this.v; }");
        assert!(out.contains("scope: () => ({ this: this })"), "{out}");
        assert!(out.contains(r#"__$getFromScope(\"this\").v"#), "{out}");
    }

    #[test]
    fn shorthand_captures_keep_their_key() {
        let out = plain("let a = 1;\nconst f = () => ({ a });");
        assert!(out.contains(r#"({ a: __$getFromScope(\"a\") })"#), "{out}");
    }

    #[test]
    fn wrapping_skips_targets_and_callees() {
        let out = wrapped("let x;\nx = 10;\nobj.prop = f(1);\nx++;");
        assert_eq!(
            out,
            "let x;\nx = __SerializableJs.ensureSerializable(10);\n\
             __SerializableJs.ensureSerializable(obj).prop = \
             __SerializableJs.ensureSerializable(f(__SerializableJs.ensureSerializable(1)));\nx++;"
        );
    }

    #[test]
    fn wrapped_functions_are_registered_inside_the_check() {
        let out = wrapped("const f = () => 1;");
        assert!(
            out.starts_with(
                "const f = __SerializableJs.ensureSerializable(__SerializableJs.registerFunction(() => __SerializableJs.ensureSerializable(1), "
            ),
            "{out}"
        );
    }

    #[test]
    fn runtime_calls_are_left_alone() {
        let src = "__SerializableJs.ensureSerializable(1);";
        assert_eq!(wrapped(src), src);
    }

    #[test]
    fn output_parses_again() {
        let src = "let n = 0;\nconst api = { inc() { return ++n; }, get value() { return n; } };\n\
                   class C extends Object { static make() { return new C(); } read = () => n; }\n\
                   function twice(g) { return (x) => g(g(x)); }";
        for options in [InstrumentOptions::default(), InstrumentOptions { wrap_expressions: true }] {
            let out = instrument(src, &options).expect("instrument");
            parse_script(&out, "reparse").expect("instrumented output parses");
        }
    }

    #[test]
    fn syntax_errors_surface() {
        assert!(instrument("let = ;", &InstrumentOptions::default()).is_err());
    }

    #[test]
    fn balance_check_ignores_quoted_brackets() {
        assert!(is_balanced("f(')')"));
        assert!(!is_balanced("a) + (b"));
    }
}
