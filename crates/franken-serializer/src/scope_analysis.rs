//! Lexical scope resolution and closure-capture sets.
//!
//! Every identifier reference is resolved to the scope that declares it (or
//! to nothing, for globals).  A function or class construct *captures* a
//! reference when the declaring scope lies outside the construct.  Lexical
//! `this` is modelled as a pseudo-binding named `this`, declared by every
//! non-arrow function, every class field initializer and the program.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{
    Block, ClassMemberKind, ClassNode, Expression, ExpressionKind, ForInit, FunctionBody,
    FunctionKind, FunctionNode, MemberProperty, NodeId, ObjectProperty, Program, PropertyName,
    SourceSpan, Statement, VariableKind,
};

/// Name of the `this` pseudo-binding.
pub const THIS_BINDING: &str = "this";

pub type ScopeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Program,
    Function,
    Block,
    Class,
    FieldInitializer,
}

#[derive(Debug, Clone)]
struct ScopeData {
    parent: Option<ScopeId>,
    kind: ScopeKind,
    binds_this: bool,
    names: BTreeSet<String>,
}

/// One resolved identifier (or `this`) occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub span: SourceSpan,
    /// Declaring scope; `None` for unresolved (global) names.
    pub resolved: Option<ScopeId>,
    /// The identifier is the value half of a shorthand property `{ name }`.
    pub shorthand: bool,
}

/// Result of analysing one program.
#[derive(Debug, Clone, Default)]
pub struct ScopeAnalysis {
    scopes: Vec<ScopeData>,
    references: Vec<Reference>,
    constructs: BTreeMap<NodeId, ScopeId>,
}

impl ScopeAnalysis {
    pub fn analyze(program: &Program) -> Self {
        let mut analyzer = Analyzer {
            out: ScopeAnalysis::default(),
        };
        let root = analyzer.push_scope(None, ScopeKind::Program, true);
        analyzer.declare_var_names(root, &program.body);
        analyzer.declare_lexical(root, &program.body);
        analyzer.walk_statements(root, &program.body);
        analyzer.out
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    pub fn scope_kind(&self, scope: ScopeId) -> Option<ScopeKind> {
        self.scopes.get(scope).map(|s| s.kind)
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// Scope opened by a function or class construct.
    pub fn construct_scope(&self, construct: NodeId) -> Option<ScopeId> {
        self.constructs.get(&construct).copied()
    }

    /// Is `scope` equal to `ancestor` or nested inside it?
    pub fn is_within(&self, scope: ScopeId, ancestor: ScopeId) -> bool {
        let mut cursor = Some(scope);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.scopes.get(current).and_then(|s| s.parent);
        }
        false
    }

    /// References inside `span` that resolve to a binding outside the
    /// construct, in source order.
    pub fn captured_references(&self, construct: NodeId, span: SourceSpan) -> Vec<&Reference> {
        let Some(scope) = self.construct_scope(construct) else {
            return Vec::new();
        };
        self.references
            .iter()
            .filter(|r| r.span.start_offset >= span.start_offset && r.span.end_offset <= span.end_offset)
            .filter(|r| r.resolved.is_some_and(|declared| !self.is_within(declared, scope)))
            .collect()
    }

    /// Distinct captured names in order of first occurrence.
    pub fn captures(&self, construct: NodeId, span: SourceSpan) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.captured_references(construct, span)
            .into_iter()
            .filter(|r| seen.insert(r.name.clone()))
            .map(|r| r.name.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

struct Analyzer {
    out: ScopeAnalysis,
}

impl Analyzer {
    fn push_scope(&mut self, parent: Option<ScopeId>, kind: ScopeKind, binds_this: bool) -> ScopeId {
        let id = self.out.scopes.len();
        let mut names = BTreeSet::new();
        if binds_this {
            names.insert(THIS_BINDING.to_string());
        }
        self.out.scopes.push(ScopeData {
            parent,
            kind,
            binds_this,
            names,
        });
        id
    }

    fn declare(&mut self, scope: ScopeId, name: &str) {
        if let Some(data) = self.out.scopes.get_mut(scope) {
            data.names.insert(name.to_string());
        }
    }

    fn resolve(&self, name: &str, from: ScopeId) -> Option<ScopeId> {
        let mut cursor = Some(from);
        while let Some(current) = cursor {
            let data = &self.out.scopes[current];
            let found = if name == THIS_BINDING {
                data.binds_this
            } else {
                data.names.contains(name)
            };
            if found {
                return Some(current);
            }
            cursor = data.parent;
        }
        None
    }

    fn reference(&mut self, scope: ScopeId, name: &str, span: SourceSpan, shorthand: bool) {
        let resolved = self.resolve(name, scope);
        self.out.references.push(Reference {
            name: name.to_string(),
            span,
            resolved,
            shorthand,
        });
    }

    /// `let`, `const`, `class` and function declarations of one statement list.
    fn declare_lexical(&mut self, scope: ScopeId, body: &[Statement]) {
        for statement in body {
            match statement {
                Statement::Variable(decl) if decl.kind != VariableKind::Var => {
                    for declarator in &decl.declarators {
                        self.declare(scope, &declarator.binding.name);
                    }
                }
                Statement::Function(node) => {
                    if let Some(name) = &node.name {
                        self.declare(scope, &name.name);
                    }
                }
                Statement::Class(node) => {
                    if let Some(name) = &node.name {
                        self.declare(scope, &name.name);
                    }
                }
                _ => {}
            }
        }
    }

    /// `var` declarations anywhere in a function body, not crossing into
    /// nested functions.
    fn declare_var_names(&mut self, scope: ScopeId, body: &[Statement]) {
        for statement in body {
            self.declare_var_names_in(scope, statement);
        }
    }

    fn declare_var_names_in(&mut self, scope: ScopeId, statement: &Statement) {
        match statement {
            Statement::Variable(decl) if decl.kind == VariableKind::Var => {
                for declarator in &decl.declarators {
                    self.declare(scope, &declarator.binding.name);
                }
            }
            Statement::If {
                consequent,
                alternate,
                ..
            } => {
                self.declare_var_names_in(scope, consequent);
                if let Some(alternate) = alternate {
                    self.declare_var_names_in(scope, alternate);
                }
            }
            Statement::While { body, .. } => self.declare_var_names_in(scope, body),
            Statement::For { init, body, .. } => {
                if let Some(ForInit::Variable(decl)) = init
                    && decl.kind == VariableKind::Var
                {
                    for declarator in &decl.declarators {
                        self.declare(scope, &declarator.binding.name);
                    }
                }
                self.declare_var_names_in(scope, body);
            }
            Statement::Block(block) => self.declare_var_names(scope, &block.body),
            Statement::Try {
                block,
                handler,
                finalizer,
                ..
            } => {
                self.declare_var_names(scope, &block.body);
                if let Some(handler) = handler {
                    self.declare_var_names(scope, &handler.body.body);
                }
                if let Some(finalizer) = finalizer {
                    self.declare_var_names(scope, &finalizer.body);
                }
            }
            _ => {}
        }
    }

    fn walk_statements(&mut self, scope: ScopeId, body: &[Statement]) {
        for statement in body {
            self.walk_statement(scope, statement);
        }
    }

    fn walk_block(&mut self, scope: ScopeId, block: &Block) {
        let inner = self.push_scope(Some(scope), ScopeKind::Block, false);
        self.declare_lexical(inner, &block.body);
        self.walk_statements(inner, &block.body);
    }

    fn walk_statement(&mut self, scope: ScopeId, statement: &Statement) {
        match statement {
            Statement::Variable(decl) => {
                for declarator in &decl.declarators {
                    if let Some(init) = &declarator.init {
                        self.walk_expression(scope, init);
                    }
                }
            }
            Statement::Function(node) => self.walk_function(scope, node),
            Statement::Class(node) => self.walk_class(scope, node),
            Statement::Expression { expression, .. } => self.walk_expression(scope, expression),
            Statement::Return { argument, .. } => {
                if let Some(argument) = argument {
                    self.walk_expression(scope, argument);
                }
            }
            Statement::If {
                test,
                consequent,
                alternate,
                ..
            } => {
                self.walk_expression(scope, test);
                self.walk_statement(scope, consequent);
                if let Some(alternate) = alternate {
                    self.walk_statement(scope, alternate);
                }
            }
            Statement::While { test, body, .. } => {
                self.walk_expression(scope, test);
                self.walk_statement(scope, body);
            }
            Statement::For {
                init,
                test,
                update,
                body,
                ..
            } => {
                let inner = self.push_scope(Some(scope), ScopeKind::Block, false);
                match init {
                    Some(ForInit::Variable(decl)) => {
                        if decl.kind != VariableKind::Var {
                            for declarator in &decl.declarators {
                                self.declare(inner, &declarator.binding.name);
                            }
                        }
                        for declarator in &decl.declarators {
                            if let Some(value) = &declarator.init {
                                self.walk_expression(inner, value);
                            }
                        }
                    }
                    Some(ForInit::Expression(expression)) => self.walk_expression(inner, expression),
                    None => {}
                }
                if let Some(test) = test {
                    self.walk_expression(inner, test);
                }
                if let Some(update) = update {
                    self.walk_expression(inner, update);
                }
                self.walk_statement(inner, body);
            }
            Statement::Block(block) => self.walk_block(scope, block),
            Statement::Throw { argument, .. } => self.walk_expression(scope, argument),
            Statement::Try {
                block,
                handler,
                finalizer,
                ..
            } => {
                self.walk_block(scope, block);
                if let Some(handler) = handler {
                    let catch_scope = self.push_scope(Some(scope), ScopeKind::Block, false);
                    if let Some(param) = &handler.param {
                        self.declare(catch_scope, &param.name);
                    }
                    self.walk_block(catch_scope, &handler.body);
                }
                if let Some(finalizer) = finalizer {
                    self.walk_block(scope, finalizer);
                }
            }
            Statement::Break { .. } | Statement::Continue { .. } | Statement::Empty { .. } => {}
        }
    }

    fn walk_function(&mut self, scope: ScopeId, node: &FunctionNode) {
        let inner = self.push_scope(Some(scope), ScopeKind::Function, node.kind.binds_this());
        self.out.constructs.insert(node.id, inner);
        if node.kind == FunctionKind::Expression
            && let Some(name) = &node.name
        {
            self.declare(inner, &name.name);
        }
        for param in &node.params {
            self.declare(inner, &param.binding.name);
        }
        if let Some(rest) = &node.rest {
            self.declare(inner, &rest.name);
        }
        if let FunctionBody::Block(block) = &node.body {
            self.declare_var_names(inner, &block.body);
            self.declare_lexical(inner, &block.body);
        }
        for param in &node.params {
            if let Some(default) = &param.default {
                self.walk_expression(inner, default);
            }
        }
        match &node.body {
            FunctionBody::Block(block) => self.walk_statements(inner, &block.body),
            FunctionBody::Expression(expression) => self.walk_expression(inner, expression),
        }
    }

    fn walk_class(&mut self, scope: ScopeId, node: &ClassNode) {
        let class_scope = self.push_scope(Some(scope), ScopeKind::Class, false);
        self.out.constructs.insert(node.id, class_scope);
        if let Some(name) = &node.name {
            self.declare(class_scope, &name.name);
        }
        if let Some(super_class) = &node.super_class {
            self.walk_expression(class_scope, super_class);
        }
        if let Some(constructor) = &node.constructor {
            self.walk_function(class_scope, constructor);
        }
        for member in &node.members {
            self.walk_property_name(class_scope, &member.key);
            match &member.kind {
                ClassMemberKind::Method(function)
                | ClassMemberKind::Getter(function)
                | ClassMemberKind::Setter(function) => self.walk_function(class_scope, function),
                ClassMemberKind::Field { value, id } => {
                    let field_scope =
                        self.push_scope(Some(class_scope), ScopeKind::FieldInitializer, true);
                    self.out.constructs.insert(*id, field_scope);
                    if let Some(value) = value {
                        self.walk_expression(field_scope, value);
                    }
                }
            }
        }
    }

    fn walk_property_name(&mut self, scope: ScopeId, key: &PropertyName) {
        if let PropertyName::Computed(expression) = key {
            self.walk_expression(scope, expression);
        }
    }

    fn walk_member_property(&mut self, scope: ScopeId, property: &MemberProperty) {
        if let MemberProperty::Computed(expression) = property {
            self.walk_expression(scope, expression);
        }
    }

    fn walk_expression(&mut self, scope: ScopeId, expression: &Expression) {
        match &expression.kind {
            ExpressionKind::Number(_)
            | ExpressionKind::BigInt(_)
            | ExpressionKind::String(_)
            | ExpressionKind::Bool(_)
            | ExpressionKind::Null
            | ExpressionKind::ScopeLookup(_) => {}
            ExpressionKind::Identifier(ident) => {
                self.reference(scope, &ident.name, expression.span, false);
            }
            ExpressionKind::This => self.reference(scope, THIS_BINDING, expression.span, false),
            ExpressionKind::Array(elements) => {
                for element in elements.iter().flatten() {
                    self.walk_expression(scope, &element.expression);
                }
            }
            ExpressionKind::Object(properties) => {
                for property in properties {
                    match property {
                        ObjectProperty::KeyValue {
                            key,
                            value,
                            shorthand,
                            ..
                        } => {
                            self.walk_property_name(scope, key);
                            if *shorthand && let ExpressionKind::Identifier(ident) = &value.kind {
                                self.reference(scope, &ident.name, value.span, true);
                            } else {
                                self.walk_expression(scope, value);
                            }
                        }
                        ObjectProperty::Method { key, function, .. }
                        | ObjectProperty::Getter { key, function, .. }
                        | ObjectProperty::Setter { key, function, .. } => {
                            self.walk_property_name(scope, key);
                            self.walk_function(scope, function);
                        }
                        ObjectProperty::Spread { argument, .. } => {
                            self.walk_expression(scope, argument);
                        }
                    }
                }
            }
            ExpressionKind::Function(node) | ExpressionKind::Arrow(node) => {
                self.walk_function(scope, node);
            }
            ExpressionKind::Class(node) => self.walk_class(scope, node),
            ExpressionKind::Unary { argument, .. } => self.walk_expression(scope, argument),
            ExpressionKind::Update { target, .. } => self.walk_expression(scope, target),
            ExpressionKind::Binary { left, right, .. }
            | ExpressionKind::Logical { left, right, .. } => {
                self.walk_expression(scope, left);
                self.walk_expression(scope, right);
            }
            ExpressionKind::Assign { target, value, .. } => {
                self.walk_expression(scope, target);
                self.walk_expression(scope, value);
            }
            ExpressionKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.walk_expression(scope, test);
                self.walk_expression(scope, consequent);
                self.walk_expression(scope, alternate);
            }
            ExpressionKind::Call { callee, arguments } | ExpressionKind::New { callee, arguments } => {
                self.walk_expression(scope, callee);
                for argument in arguments {
                    self.walk_expression(scope, &argument.expression);
                }
            }
            ExpressionKind::Member { object, property } => {
                self.walk_expression(scope, object);
                self.walk_member_property(scope, property);
            }
            ExpressionKind::SuperMember { property } => self.walk_member_property(scope, property),
            ExpressionKind::SuperCall { arguments } => {
                for argument in arguments {
                    self.walk_expression(scope, &argument.expression);
                }
            }
            ExpressionKind::Sequence(items) => {
                for item in items {
                    self.walk_expression(scope, item);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_script;

    fn first_function(program: &Program) -> (NodeId, SourceSpan) {
        match &program.body[0] {
            Statement::Function(node) => (node.id, node.span),
            Statement::Variable(decl) => match &decl.declarators[0].init.as_ref().expect("init").kind {
                ExpressionKind::Function(node) | ExpressionKind::Arrow(node) => (node.id, node.span),
                ExpressionKind::Class(node) => (node.id, node.span),
                other => panic!("unexpected initializer {other:?}"),
            },
            Statement::Class(node) => (node.id, node.span),
            other => panic!("unexpected statement {other:?}"),
        }
    }

    fn captures_of(src: &str, index: usize) -> Vec<String> {
        let program = parse_script(src, "test").expect("parse");
        let analysis = ScopeAnalysis::analyze(&program);
        let single = Program {
            body: vec![program.body[index].clone()],
            span: program.span,
        };
        let (id, span) = first_function(&single);
        analysis.captures(id, span)
    }

    #[test]
    fn outer_bindings_are_captured_in_order() {
        let src = "let a = 1; let b = 2; const f = (x) => b + a + x + b;";
        assert_eq!(captures_of(src, 2), vec!["b", "a"]);
    }

    #[test]
    fn globals_are_not_captured() {
        let src = "let a = 1; function f() { return Math.max(a, undefinedThing); }";
        assert_eq!(captures_of(src, 1), vec!["a"]);
    }

    #[test]
    fn declarations_capture_their_own_name() {
        let src = "function fact(n) { return n <= 1 ? 1 : n * fact(n - 1); }";
        assert_eq!(captures_of(src, 0), vec!["fact"]);
    }

    #[test]
    fn named_function_expressions_bind_themselves() {
        let src = "const f = function loop(n) { return n ? loop(n - 1) : 0; };";
        assert!(captures_of(src, 0).is_empty());
    }

    #[test]
    fn class_inner_name_is_not_captured() {
        let src = "class A { static self = A; make() { return new A(); } }";
        assert!(captures_of(src, 0).is_empty());
    }

    #[test]
    fn locals_and_parameters_shadow_outer_names() {
        let src = "let x = 1; let y = 2; function f(x) { let y = 3; { var z = x; } return x + y + z; }";
        assert!(captures_of(src, 2).is_empty());
    }

    #[test]
    fn arrows_capture_lexical_this() {
        let src = "const f = () => this.value;";
        assert_eq!(captures_of(src, 0), vec![THIS_BINDING]);
        let src = "const g = function () { return () => this; };";
        assert!(captures_of(src, 0).is_empty());
    }

    #[test]
    fn shorthand_references_are_flagged() {
        let program = parse_script("let a = 1; const f = () => ({ a });", "test").expect("parse");
        let analysis = ScopeAnalysis::analyze(&program);
        assert!(analysis.references().iter().any(|r| r.name == "a" && r.shorthand));
    }
}
