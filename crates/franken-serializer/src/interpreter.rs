//! Tree-walking evaluator for the script subset.
//!
//! Strict-mode semantics throughout: assignments to undeclared names and to
//! read-only properties throw, `this` is never coerced, and functions
//! declared in blocks are block-scoped.

use std::rc::Rc;

use crate::ast::{
    AssignOp, BinaryOp, Block, ClassMemberKind, ClassNode, Element, Expression, ExpressionKind,
    ForInit, FunctionBody, FunctionNode, LogicalOp, MemberProperty, ObjectProperty, Program,
    PropertyName, Statement, UnaryOp, UpdateOp, VariableDeclaration, VariableKind,
};
use crate::error::{EngineError, EngineResult};
use crate::object_model::{
    FieldInit, FunctionBehavior, JsValue, ObjectHandle, ObjectKind, PropertyDescriptor, PropertyKey,
    number_to_string,
};
use crate::realm::{
    BindingSlot, EnvironmentHandle, EnvironmentKind, PrimitiveHint, Realm, ThisBinding,
    string_to_number,
};

/// How a statement finished.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Completion {
    Normal,
    Return(JsValue),
    Break,
    Continue,
}

/// Assignment target after evaluating its base and key.
#[derive(Debug, Clone)]
enum Place {
    Binding(String),
    ScopeEntry(String),
    Property { base: JsValue, key: PropertyKey },
    SuperProperty { key: PropertyKey, this: JsValue, home: ObjectHandle },
}

impl Realm {
    // -----------------------------------------------------------------------
    // Programs and statements
    // -----------------------------------------------------------------------

    pub(crate) fn run_program(&mut self, program: &Program) -> EngineResult<JsValue> {
        let script_env = self.script_env;
        let mut names = Vec::new();
        collect_var_names(&program.body, &mut names);
        for name in names {
            self.declare_var(self.global_env, &name)?;
        }
        self.instantiate_lexical(&program.body, script_env, Some(self.global_env))?;

        let mut last = JsValue::Undefined;
        for statement in &program.body {
            if let Statement::Expression { expression, .. } = statement {
                last = self.eval_expression(expression, script_env)?;
                continue;
            }
            if let Completion::Return(value) = self.eval_statement(statement, script_env)? {
                return Ok(value);
            }
        }
        Ok(last)
    }

    /// Declare the lexical names of one statement list and instantiate its
    /// function declarations.  Functions go to `function_target` when given
    /// (function bodies and the program), to `env` otherwise (blocks).
    fn instantiate_lexical(
        &mut self,
        body: &[Statement],
        env: EnvironmentHandle,
        function_target: Option<EnvironmentHandle>,
    ) -> EngineResult<()> {
        for statement in body {
            match statement {
                Statement::Variable(decl) if decl.kind != VariableKind::Var => {
                    for declarator in &decl.declarators {
                        let slot = BindingSlot::new_lexical(decl.kind != VariableKind::Const);
                        self.declare_binding(env, &declarator.binding.name, slot)?;
                    }
                }
                Statement::Class(node) => {
                    if let Some(name) = &node.name {
                        self.declare_binding(env, &name.name, BindingSlot::new_lexical(true))?;
                    }
                }
                Statement::Function(node) => {
                    let Some(name) = &node.name else {
                        continue;
                    };
                    let function = JsValue::Object(self.create_function(node, env, None, None)?);
                    match function_target {
                        Some(target) => {
                            self.declare_var(target, &name.name)?;
                            self.set_binding_value(target, &name.name, function)?;
                        }
                        None => {
                            self.declare_binding(
                                env,
                                &name.name,
                                BindingSlot::new_initialized(function, true),
                            )?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn eval_statements(&mut self, body: &[Statement], env: EnvironmentHandle) -> EngineResult<Completion> {
        for statement in body {
            let completion = self.eval_statement(statement, env)?;
            if completion != Completion::Normal {
                return Ok(completion);
            }
        }
        Ok(Completion::Normal)
    }

    fn eval_block(&mut self, block: &Block, env: EnvironmentHandle) -> EngineResult<Completion> {
        let block_env = self.new_env(Some(env), EnvironmentKind::Declarative);
        self.instantiate_lexical(&block.body, block_env, None)?;
        self.eval_statements(&block.body, block_env)
    }

    fn eval_statement(&mut self, statement: &Statement, env: EnvironmentHandle) -> EngineResult<Completion> {
        match statement {
            Statement::Variable(decl) => {
                self.eval_variable_declaration(decl, env)?;
                Ok(Completion::Normal)
            }
            Statement::Function(_) | Statement::Empty { .. } => Ok(Completion::Normal),
            Statement::Class(node) => {
                let class = self.eval_class(node, env, None)?;
                if let Some(name) = &node.name {
                    self.initialize_binding(env, &name.name, class)?;
                }
                Ok(Completion::Normal)
            }
            Statement::Expression { expression, .. } => {
                self.eval_expression(expression, env)?;
                Ok(Completion::Normal)
            }
            Statement::Return { argument, .. } => {
                let value = match argument {
                    Some(argument) => self.eval_expression(argument, env)?,
                    None => JsValue::Undefined,
                };
                Ok(Completion::Return(value))
            }
            Statement::If {
                test,
                consequent,
                alternate,
                ..
            } => {
                let test = self.eval_expression(test, env)?;
                if self.to_boolean(&test) {
                    self.eval_statement(consequent, env)
                } else if let Some(alternate) = alternate {
                    self.eval_statement(alternate, env)
                } else {
                    Ok(Completion::Normal)
                }
            }
            Statement::While { test, body, .. } => {
                loop {
                    let value = self.eval_expression(test, env)?;
                    if !self.to_boolean(&value) {
                        break;
                    }
                    match self.eval_statement(body, env)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                }
                Ok(Completion::Normal)
            }
            Statement::For {
                init,
                test,
                update,
                body,
                ..
            } => self.eval_for(init.as_ref(), test.as_ref(), update.as_ref(), body, env),
            Statement::Block(block) => self.eval_block(block, env),
            Statement::Throw { argument, .. } => {
                let value = self.eval_expression(argument, env)?;
                Err(self.throw_value(value))
            }
            Statement::Try {
                block,
                handler,
                finalizer,
                ..
            } => {
                let outcome = self.eval_block(block, env);
                let outcome = match (outcome, handler) {
                    (Err(error), Some(handler)) => {
                        let value = self.error_to_value(error);
                        let catch_env = self.new_env(Some(env), EnvironmentKind::Declarative);
                        if let Some(param) = &handler.param {
                            self.declare_binding(
                                catch_env,
                                &param.name,
                                BindingSlot::new_initialized(value, true),
                            )?;
                        }
                        self.eval_block(&handler.body, catch_env)
                    }
                    (outcome, _) => outcome,
                };
                if let Some(finalizer) = finalizer {
                    let completion = self.eval_block(finalizer, env)?;
                    if completion != Completion::Normal {
                        return Ok(completion);
                    }
                }
                outcome
            }
            Statement::Break { .. } => Ok(Completion::Break),
            Statement::Continue { .. } => Ok(Completion::Continue),
        }
    }

    fn eval_variable_declaration(
        &mut self,
        decl: &VariableDeclaration,
        env: EnvironmentHandle,
    ) -> EngineResult<()> {
        for declarator in &decl.declarators {
            let name = &declarator.binding.name;
            match (decl.kind, &declarator.init) {
                (VariableKind::Var, Some(init)) => {
                    let value = self.eval_named(init, name, env)?;
                    self.set_binding_value(env, name, value)?;
                }
                (VariableKind::Var, None) => {}
                (_, init) => {
                    let value = match init {
                        Some(init) => self.eval_named(init, name, env)?,
                        None => JsValue::Undefined,
                    };
                    self.initialize_binding(env, name, value)?;
                }
            }
        }
        Ok(())
    }

    fn eval_for(
        &mut self,
        init: Option<&ForInit>,
        test: Option<&Expression>,
        update: Option<&Expression>,
        body: &Statement,
        env: EnvironmentHandle,
    ) -> EngineResult<Completion> {
        let loop_env = self.new_env(Some(env), EnvironmentKind::Declarative);
        let mut per_iteration = false;
        match init {
            Some(ForInit::Variable(decl)) if decl.kind == VariableKind::Var => {
                self.eval_variable_declaration(decl, env)?;
            }
            Some(ForInit::Variable(decl)) => {
                for declarator in &decl.declarators {
                    let slot = BindingSlot::new_lexical(decl.kind != VariableKind::Const);
                    self.declare_binding(loop_env, &declarator.binding.name, slot)?;
                }
                self.eval_variable_declaration(decl, loop_env)?;
                per_iteration = decl.kind == VariableKind::Let;
            }
            Some(ForInit::Expression(expression)) => {
                self.eval_expression(expression, env)?;
            }
            None => {}
        }
        let mut iteration_env = if per_iteration {
            self.copy_env(loop_env)?
        } else {
            loop_env
        };
        loop {
            if let Some(test) = test {
                let value = self.eval_expression(test, iteration_env)?;
                if !self.to_boolean(&value) {
                    break;
                }
            }
            match self.eval_statement(body, iteration_env)? {
                Completion::Break => break,
                Completion::Return(value) => return Ok(Completion::Return(value)),
                Completion::Normal | Completion::Continue => {}
            }
            if per_iteration {
                iteration_env = self.copy_env(iteration_env)?;
            }
            if let Some(update) = update {
                self.eval_expression(update, iteration_env)?;
            }
        }
        Ok(Completion::Normal)
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    pub(crate) fn eval_expression(&mut self, expression: &Expression, env: EnvironmentHandle) -> EngineResult<JsValue> {
        match &expression.kind {
            ExpressionKind::Number(n) => Ok(JsValue::Number(*n)),
            ExpressionKind::BigInt(n) => Ok(JsValue::BigInt(*n)),
            ExpressionKind::String(s) => Ok(JsValue::Str(s.clone())),
            ExpressionKind::Bool(b) => Ok(JsValue::Bool(*b)),
            ExpressionKind::Null => Ok(JsValue::Null),
            ExpressionKind::Identifier(reference) => self.get_binding_value(env, &reference.name),
            ExpressionKind::This => self.this_value(env),
            ExpressionKind::ScopeLookup(name) => self.scope_lookup(env, name),
            ExpressionKind::Array(elements) => self.eval_array(elements, env),
            ExpressionKind::Object(properties) => self.eval_object(properties, env),
            ExpressionKind::Function(node) => self.instantiate_function_expression(node, env, None),
            ExpressionKind::Arrow(node) => Ok(JsValue::Object(self.create_function(node, env, None, None)?)),
            ExpressionKind::Class(node) => self.eval_class(node, env, None),
            ExpressionKind::Unary { op, argument } => self.eval_unary(*op, argument, env),
            ExpressionKind::Update { op, prefix, target } => self.eval_update(*op, *prefix, target, env),
            ExpressionKind::Binary { op, left, right } => {
                let left = self.eval_expression(left, env)?;
                let right = self.eval_expression(right, env)?;
                self.binary_op(*op, &left, &right)
            }
            ExpressionKind::Logical { op, left, right } => {
                let left = self.eval_expression(left, env)?;
                let short_circuit = match op {
                    LogicalOp::And => !self.to_boolean(&left),
                    LogicalOp::Or => self.to_boolean(&left),
                    LogicalOp::Nullish => !left.is_nullish(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval_expression(right, env)
                }
            }
            ExpressionKind::Assign { op, target, value } => self.eval_assign(*op, target, value, env),
            ExpressionKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                let test = self.eval_expression(test, env)?;
                if self.to_boolean(&test) {
                    self.eval_expression(consequent, env)
                } else {
                    self.eval_expression(alternate, env)
                }
            }
            ExpressionKind::Call { callee, arguments } => self.eval_call(callee, arguments, env),
            ExpressionKind::New { callee, arguments } => {
                let constructor = self.eval_expression(callee, env)?;
                let args = self.eval_arguments(arguments, env)?;
                match constructor.as_object() {
                    Some(target) if self.is_constructor(&constructor) => {
                        self.construct(&constructor, args, target)
                    }
                    _ => Err(self.type_error(format!(
                        "{} is not a constructor",
                        describe_expression(callee)
                    ))),
                }
            }
            ExpressionKind::Member { object, property } => {
                let base = self.eval_expression(object, env)?;
                let key = self.member_key(property, env)?;
                self.get_property(&base, &key)
            }
            ExpressionKind::SuperMember { property } => {
                let key = self.member_key(property, env)?;
                let this = self.this_value(env)?;
                let home = self.home_object(env)?;
                self.super_get(home, &key, &this)
            }
            ExpressionKind::SuperCall { arguments } => {
                let args = self.eval_arguments(arguments, env)?;
                self.super_call(env, args)
            }
            ExpressionKind::Sequence(items) => {
                let mut last = JsValue::Undefined;
                for item in items {
                    last = self.eval_expression(item, env)?;
                }
                Ok(last)
            }
        }
    }

    /// Evaluate with name inference for anonymous functions and classes.
    fn eval_named(&mut self, expression: &Expression, name: &str, env: EnvironmentHandle) -> EngineResult<JsValue> {
        match &expression.kind {
            ExpressionKind::Function(node) if node.name.is_none() => {
                self.instantiate_function_expression(node, env, Some(name))
            }
            ExpressionKind::Arrow(node) => {
                Ok(JsValue::Object(self.create_function(node, env, None, Some(name))?))
            }
            ExpressionKind::Class(node) if node.name.is_none() => self.eval_class(node, env, Some(name)),
            _ => self.eval_expression(expression, env),
        }
    }

    fn scope_lookup(&mut self, env: EnvironmentHandle, name: &str) -> EngineResult<JsValue> {
        match self.scope_table_of(env)? {
            Some(table) => self.scope_entry_value(table, name),
            None => Err(self.reference_error("__$getFromScope is not defined")),
        }
    }

    fn member_key(&mut self, property: &MemberProperty, env: EnvironmentHandle) -> EngineResult<PropertyKey> {
        match property {
            MemberProperty::Named { name, .. } => Ok(PropertyKey::String(name.clone())),
            MemberProperty::Computed(expression) => {
                let value = self.eval_expression(expression, env)?;
                self.to_property_key(&value)
            }
        }
    }

    fn eval_property_name(&mut self, name: &PropertyName, env: EnvironmentHandle) -> EngineResult<PropertyKey> {
        match name {
            PropertyName::Identifier(s) | PropertyName::String(s) => Ok(PropertyKey::String(s.clone())),
            PropertyName::Number(n) => Ok(PropertyKey::String(number_to_string(*n))),
            PropertyName::Computed(expression) => {
                let value = self.eval_expression(expression, env)?;
                self.to_property_key(&value)
            }
        }
    }

    /// `name` a function defined under `key` receives.
    pub(crate) fn function_name_for_key(&self, key: &PropertyKey) -> String {
        match key {
            PropertyKey::String(s) => s.clone(),
            PropertyKey::Symbol(id) => format!("[{}]", self.symbols.description(*id).unwrap_or("")),
        }
    }

    fn eval_array(&mut self, elements: &[Option<Element>], env: EnvironmentHandle) -> EngineResult<JsValue> {
        let array = self.create_array(Vec::new())?;
        let mut index: u32 = 0;
        for element in elements {
            let Some(element) = element else {
                index += 1;
                continue;
            };
            let value = self.eval_expression(&element.expression, env)?;
            let values = if element.spread { self.iterate(&value)? } else { vec![value] };
            for value in values {
                self.create_data_property(array, PropertyKey::String(index.to_string()), value)?;
                index += 1;
            }
        }
        self.set_property(&JsValue::Object(array), PropertyKey::from("length"), JsValue::Number(f64::from(index)))?;
        Ok(JsValue::Object(array))
    }

    fn eval_object(&mut self, properties: &[ObjectProperty], env: EnvironmentHandle) -> EngineResult<JsValue> {
        let object = self.create_object();
        for property in properties {
            match property {
                ObjectProperty::KeyValue { key, value, .. } => {
                    let key = self.eval_property_name(key, env)?;
                    let name = self.function_name_for_key(&key);
                    let value = self.eval_named(value, &name, env)?;
                    self.create_data_property(object, key, value)?;
                }
                ObjectProperty::Method { key, function, .. } => {
                    let key = self.eval_property_name(key, env)?;
                    let name = self.function_name_for_key(&key);
                    let method = self.create_function(function, env, Some(object), Some(&name))?;
                    self.create_data_property(object, key, JsValue::Object(method))?;
                }
                ObjectProperty::Getter { key, function, .. } => {
                    let key = self.eval_property_name(key, env)?;
                    let name = self.function_name_for_key(&key);
                    let getter = self.create_function(function, env, Some(object), Some(&name))?;
                    self.merge_accessor(object, key, Some(getter), None, true)?;
                }
                ObjectProperty::Setter { key, function, .. } => {
                    let key = self.eval_property_name(key, env)?;
                    let name = self.function_name_for_key(&key);
                    let setter = self.create_function(function, env, Some(object), Some(&name))?;
                    self.merge_accessor(object, key, None, Some(setter), true)?;
                }
                ObjectProperty::Spread { argument, .. } => {
                    let source = self.eval_expression(argument, env)?;
                    self.copy_data_properties(object, &source)?;
                }
            }
        }
        Ok(JsValue::Object(object))
    }

    /// Install one half of an accessor pair, keeping the other half.
    fn merge_accessor(
        &mut self,
        target: ObjectHandle,
        key: PropertyKey,
        get: Option<ObjectHandle>,
        set: Option<ObjectHandle>,
        enumerable: bool,
    ) -> EngineResult<()> {
        let (existing_get, existing_set) = match self.heap.get_own_property_descriptor(target, &key)? {
            Some(PropertyDescriptor::Accessor { get, set, .. }) => (get, set),
            _ => (None, None),
        };
        self.define_or_throw(
            target,
            key,
            PropertyDescriptor::Accessor {
                get: get.or(existing_get),
                set: set.or(existing_set),
                enumerable,
                configurable: true,
            },
        )
    }

    /// `{ ...source }`.
    fn copy_data_properties(&mut self, target: ObjectHandle, source: &JsValue) -> EngineResult<()> {
        match source {
            JsValue::Object(handle) => {
                for (key, desc) in self.heap.own_property_entries(*handle)? {
                    if !desc.is_enumerable() {
                        continue;
                    }
                    let value = self.get_from(*handle, &key, source)?;
                    self.create_data_property(target, key, value)?;
                }
                Ok(())
            }
            JsValue::Str(text) => {
                for (index, ch) in text.chars().enumerate() {
                    self.create_data_property(target, PropertyKey::String(index.to_string()), JsValue::Str(ch.to_string()))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Values produced by iterating `value` (arrays, strings, Map, Set,
    /// `Uint8Array`).
    pub(crate) fn iterate(&mut self, value: &JsValue) -> EngineResult<Vec<JsValue>> {
        match value {
            JsValue::Str(text) => Ok(text.chars().map(|c| JsValue::Str(c.to_string())).collect()),
            JsValue::Object(handle) => match self.heap.kind(*handle)?.clone() {
                ObjectKind::Array | ObjectKind::Uint8Array { .. } => self.array_items(*handle),
                ObjectKind::Map(entries) => entries
                    .into_iter()
                    .map(|(key, value)| Ok(JsValue::Object(self.create_array(vec![key.to_value(), value])?)))
                    .collect(),
                ObjectKind::Set(elements) => Ok(elements.iter().map(|key| key.to_value()).collect()),
                _ => Err(self.type_error(format!("{} is not iterable", self.display_value(value)))),
            },
            _ => Err(self.type_error(format!("{} is not iterable", self.display_value(value)))),
        }
    }

    fn eval_arguments(&mut self, arguments: &[Element], env: EnvironmentHandle) -> EngineResult<Vec<JsValue>> {
        let mut values = Vec::with_capacity(arguments.len());
        for argument in arguments {
            let value = self.eval_expression(&argument.expression, env)?;
            if argument.spread {
                values.extend(self.iterate(&value)?);
            } else {
                values.push(value);
            }
        }
        Ok(values)
    }

    fn eval_unary(&mut self, op: UnaryOp, argument: &Expression, env: EnvironmentHandle) -> EngineResult<JsValue> {
        match op {
            UnaryOp::TypeOf => {
                if let ExpressionKind::Identifier(reference) = &argument.kind
                    && self.resolve_binding(env, &reference.name)?.is_none()
                {
                    return Ok(JsValue::str("undefined"));
                }
                let value = self.eval_expression(argument, env)?;
                Ok(JsValue::str(self.type_of(&value)))
            }
            UnaryOp::Delete => match &argument.kind {
                ExpressionKind::Member { object, property } => {
                    let base = self.eval_expression(object, env)?;
                    let key = self.member_key(property, env)?;
                    Ok(JsValue::Bool(self.delete_property(&base, &key)?))
                }
                ExpressionKind::Identifier(_) => {
                    Err(self.syntax_error("Delete of an unqualified identifier in strict mode."))
                }
                _ => {
                    self.eval_expression(argument, env)?;
                    Ok(JsValue::Bool(true))
                }
            },
            UnaryOp::Void => {
                self.eval_expression(argument, env)?;
                Ok(JsValue::Undefined)
            }
            UnaryOp::Not => {
                let value = self.eval_expression(argument, env)?;
                Ok(JsValue::Bool(!self.to_boolean(&value)))
            }
            UnaryOp::Plus => {
                let value = self.eval_expression(argument, env)?;
                Ok(JsValue::Number(self.to_number(&value)?))
            }
            UnaryOp::Minus => {
                let value = self.eval_expression(argument, env)?;
                match self.to_numeric(&value)? {
                    JsValue::BigInt(n) => Ok(JsValue::BigInt(-n)),
                    JsValue::Number(n) => Ok(JsValue::Number(-n)),
                    _ => Ok(JsValue::Number(f64::NAN)),
                }
            }
            UnaryOp::BitNot => {
                let value = self.eval_expression(argument, env)?;
                match self.to_numeric(&value)? {
                    JsValue::BigInt(n) => Ok(JsValue::BigInt(!n)),
                    JsValue::Number(n) => Ok(JsValue::Number(f64::from(!to_int32(n)))),
                    _ => Ok(JsValue::Number(f64::NAN)),
                }
            }
        }
    }

    fn eval_update(
        &mut self,
        op: UpdateOp,
        prefix: bool,
        target: &Expression,
        env: EnvironmentHandle,
    ) -> EngineResult<JsValue> {
        let place = self.eval_place(target, env)?;
        let current = self.get_place(&place, env)?;
        let old = self.to_numeric(&current)?;
        let delta = match op {
            UpdateOp::Increment => 1,
            UpdateOp::Decrement => -1,
        };
        let new = match &old {
            JsValue::BigInt(n) => JsValue::BigInt(n + i128::from(delta)),
            JsValue::Number(n) => JsValue::Number(n + f64::from(delta)),
            _ => JsValue::Number(f64::NAN),
        };
        self.put_place(&place, new.clone(), env)?;
        Ok(if prefix { new } else { old })
    }

    fn eval_assign(
        &mut self,
        op: AssignOp,
        target: &Expression,
        value: &Expression,
        env: EnvironmentHandle,
    ) -> EngineResult<JsValue> {
        let place = self.eval_place(target, env)?;
        let inferred_name = match &place {
            Place::Binding(name) | Place::ScopeEntry(name) => Some(name.clone()),
            _ => None,
        };
        let rhs = |realm: &mut Realm| match &inferred_name {
            Some(name) => realm.eval_named(value, name, env),
            None => realm.eval_expression(value, env),
        };
        let result = match op {
            AssignOp::Assign => rhs(self)?,
            AssignOp::And | AssignOp::Or | AssignOp::Nullish => {
                let current = self.get_place(&place, env)?;
                let keep = match op {
                    AssignOp::And => !self.to_boolean(&current),
                    AssignOp::Or => self.to_boolean(&current),
                    _ => !current.is_nullish(),
                };
                if keep {
                    return Ok(current);
                }
                rhs(self)?
            }
            compound => {
                let current = self.get_place(&place, env)?;
                let right = self.eval_expression(value, env)?;
                match compound.binary() {
                    Some(binary) => self.binary_op(binary, &current, &right)?,
                    None => right,
                }
            }
        };
        self.put_place(&place, result.clone(), env)?;
        Ok(result)
    }

    fn eval_place(&mut self, target: &Expression, env: EnvironmentHandle) -> EngineResult<Place> {
        match &target.kind {
            ExpressionKind::Identifier(reference) => Ok(Place::Binding(reference.name.clone())),
            ExpressionKind::ScopeLookup(name) => Ok(Place::ScopeEntry(name.clone())),
            ExpressionKind::Member { object, property } => {
                let base = self.eval_expression(object, env)?;
                let key = self.member_key(property, env)?;
                Ok(Place::Property { base, key })
            }
            ExpressionKind::SuperMember { property } => {
                let key = self.member_key(property, env)?;
                let this = self.this_value(env)?;
                let home = self.home_object(env)?;
                Ok(Place::SuperProperty { key, this, home })
            }
            _ => Err(self.syntax_error("Invalid left-hand side in assignment")),
        }
    }

    fn get_place(&mut self, place: &Place, env: EnvironmentHandle) -> EngineResult<JsValue> {
        match place {
            Place::Binding(name) => self.get_binding_value(env, name),
            Place::ScopeEntry(name) => self.scope_lookup(env, name),
            Place::Property { base, key } => self.get_property(base, key),
            Place::SuperProperty { key, this, home } => self.super_get(*home, key, this),
        }
    }

    fn put_place(&mut self, place: &Place, value: JsValue, env: EnvironmentHandle) -> EngineResult<()> {
        match place {
            Place::Binding(name) => self.set_binding_value(env, name, value),
            Place::ScopeEntry(name) => match self.scope_table_of(env)? {
                Some(table) => self.set_scope_entry(table, name, value),
                None => Err(self.reference_error("__$getFromScope is not defined")),
            },
            Place::Property { base, key } => self.set_property(base, key.clone(), value),
            Place::SuperProperty { key, this, .. } => self.set_property(this, key.clone(), value),
        }
    }

    fn super_get(&mut self, home: ObjectHandle, key: &PropertyKey, this: &JsValue) -> EngineResult<JsValue> {
        match self.heap.get_prototype_of(home)? {
            Some(prototype) => self.get_from(prototype, key, this),
            None => Ok(JsValue::Undefined),
        }
    }

    fn home_object(&mut self, env: EnvironmentHandle) -> EngineResult<ObjectHandle> {
        let this_env = self.this_environment(env)?;
        match self.env_ref(this_env)?.home_object {
            Some(home) => Ok(home),
            None => Err(self.syntax_error("'super' keyword unexpected here")),
        }
    }

    // -----------------------------------------------------------------------
    // Operators
    // -----------------------------------------------------------------------

    pub(crate) fn binary_op(&mut self, op: BinaryOp, left: &JsValue, right: &JsValue) -> EngineResult<JsValue> {
        match op {
            BinaryOp::Add => {
                let left = self.to_primitive(left, PrimitiveHint::Number)?;
                let right = self.to_primitive(right, PrimitiveHint::Number)?;
                if matches!(left, JsValue::Str(_)) || matches!(right, JsValue::Str(_)) {
                    let mut text = self.to_js_string(&left)?;
                    text.push_str(&self.to_js_string(&right)?);
                    return Ok(JsValue::Str(text));
                }
                self.numeric_op(op, &left, &right)
            }
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem | BinaryOp::Exp => {
                self.numeric_op(op, left, right)
            }
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => self.bitwise_op(op, left, right),
            BinaryOp::Eq => Ok(JsValue::Bool(self.loose_equals(left, right)?)),
            BinaryOp::NotEq => Ok(JsValue::Bool(!self.loose_equals(left, right)?)),
            BinaryOp::StrictEq => Ok(JsValue::Bool(left.strict_equals(right))),
            BinaryOp::StrictNotEq => Ok(JsValue::Bool(!left.strict_equals(right))),
            BinaryOp::Lt => Ok(JsValue::Bool(self.less_than(left, right)? == Some(true))),
            BinaryOp::Gt => Ok(JsValue::Bool(self.less_than(right, left)? == Some(true))),
            BinaryOp::LtEq => Ok(JsValue::Bool(self.less_than(right, left)? == Some(false))),
            BinaryOp::GtEq => Ok(JsValue::Bool(self.less_than(left, right)? == Some(false))),
            BinaryOp::InstanceOf => Ok(JsValue::Bool(self.instance_of(left, right)?)),
            BinaryOp::In => {
                let JsValue::Object(target) = right else {
                    return Err(self.type_error(format!(
                        "Cannot use 'in' operator to search for '{}' in {}",
                        self.display_value(left),
                        self.display_value(right)
                    )));
                };
                let key = self.to_property_key(left)?;
                Ok(JsValue::Bool(self.has_property(*target, &key)?))
            }
        }
    }

    fn numeric_op(&mut self, op: BinaryOp, left: &JsValue, right: &JsValue) -> EngineResult<JsValue> {
        let left = self.to_numeric(left)?;
        let right = self.to_numeric(right)?;
        match (left, right) {
            (JsValue::Number(a), JsValue::Number(b)) => Ok(JsValue::Number(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                _ => exponentiate(a, b),
            })),
            (JsValue::BigInt(a), JsValue::BigInt(b)) => {
                let result = match op {
                    BinaryOp::Add => a.checked_add(b),
                    BinaryOp::Sub => a.checked_sub(b),
                    BinaryOp::Mul => a.checked_mul(b),
                    BinaryOp::Div | BinaryOp::Rem if b == 0 => {
                        return Err(self.range_error("Division by zero"));
                    }
                    BinaryOp::Div => a.checked_div(b),
                    BinaryOp::Rem => a.checked_rem(b),
                    _ if b < 0 => return Err(self.range_error("Exponent must be non-negative")),
                    _ => u32::try_from(b).ok().and_then(|b| a.checked_pow(b)),
                };
                result
                    .map(JsValue::BigInt)
                    .ok_or_else(|| self.range_error("Maximum BigInt size exceeded"))
            }
            _ => Err(self.type_error("Cannot mix BigInt and other types, use explicit conversions")),
        }
    }

    fn bitwise_op(&mut self, op: BinaryOp, left: &JsValue, right: &JsValue) -> EngineResult<JsValue> {
        let left = self.to_numeric(left)?;
        let right = self.to_numeric(right)?;
        match (left, right) {
            (JsValue::Number(a), JsValue::Number(b)) => {
                let (a, b) = (to_int32(a), to_int32(b));
                Ok(JsValue::Number(f64::from(match op {
                    BinaryOp::BitAnd => a & b,
                    BinaryOp::BitOr => a | b,
                    _ => a ^ b,
                })))
            }
            (JsValue::BigInt(a), JsValue::BigInt(b)) => Ok(JsValue::BigInt(match op {
                BinaryOp::BitAnd => a & b,
                BinaryOp::BitOr => a | b,
                _ => a ^ b,
            })),
            _ => Err(self.type_error("Cannot mix BigInt and other types, use explicit conversions")),
        }
    }

    /// Abstract relational comparison; `None` means undefined (NaN involved).
    fn less_than(&mut self, left: &JsValue, right: &JsValue) -> EngineResult<Option<bool>> {
        let left = self.to_primitive(left, PrimitiveHint::Number)?;
        let right = self.to_primitive(right, PrimitiveHint::Number)?;
        if let (JsValue::Str(a), JsValue::Str(b)) = (&left, &right) {
            return Ok(Some(a.encode_utf16().lt(b.encode_utf16())));
        }
        match (&left, &right) {
            (JsValue::BigInt(a), JsValue::BigInt(b)) => return Ok(Some(a < b)),
            (JsValue::BigInt(a), _) => {
                let b = self.to_number(&right)?;
                return Ok(if b.is_nan() { None } else { Some((*a as f64) < b) });
            }
            (_, JsValue::BigInt(b)) => {
                let a = self.to_number(&left)?;
                return Ok(if a.is_nan() { None } else { Some(a < *b as f64) });
            }
            _ => {}
        }
        let a = self.to_number(&left)?;
        let b = self.to_number(&right)?;
        if a.is_nan() || b.is_nan() {
            return Ok(None);
        }
        Ok(Some(a < b))
    }

    pub(crate) fn loose_equals(&mut self, left: &JsValue, right: &JsValue) -> EngineResult<bool> {
        if std::mem::discriminant(left) == std::mem::discriminant(right) {
            return Ok(left.strict_equals(right));
        }
        match (left, right) {
            (JsValue::Undefined | JsValue::Null, JsValue::Undefined | JsValue::Null) => Ok(true),
            (JsValue::Undefined | JsValue::Null, _) | (_, JsValue::Undefined | JsValue::Null) => Ok(false),
            (JsValue::Number(a), JsValue::Str(b)) => Ok(*a == string_to_number(b)),
            (JsValue::Str(a), JsValue::Number(b)) => Ok(string_to_number(a) == *b),
            (JsValue::BigInt(a), JsValue::Str(b)) | (JsValue::Str(b), JsValue::BigInt(a)) => {
                Ok(b.trim().parse::<i128>().is_ok_and(|b| b == *a))
            }
            (JsValue::BigInt(a), JsValue::Number(b)) | (JsValue::Number(b), JsValue::BigInt(a)) => {
                Ok(b.fract() == 0.0 && (*a as f64) == *b)
            }
            (JsValue::Bool(b), other) | (other, JsValue::Bool(b)) => {
                let number = JsValue::Number(if *b { 1.0 } else { 0.0 });
                let other = other.clone();
                self.loose_equals(&number, &other)
            }
            (JsValue::Object(_), other) | (other, JsValue::Object(_)) => {
                let object = if left.is_object() { left } else { right };
                let primitive = self.to_primitive(object, PrimitiveHint::Number)?;
                let other = other.clone();
                self.loose_equals(&primitive, &other)
            }
            _ => Ok(false),
        }
    }

    fn instance_of(&mut self, value: &JsValue, target: &JsValue) -> EngineResult<bool> {
        if !self.is_callable(target) {
            return Err(self.type_error("Right-hand side of 'instanceof' is not callable"));
        }
        let prototype = self.get_property(target, &PropertyKey::from("prototype"))?;
        let Some(prototype) = prototype.as_object() else {
            return Err(self.type_error("Function has non-object prototype in instanceof check"));
        };
        let Some(mut cursor) = value.as_object() else {
            return Ok(false);
        };
        while let Some(next) = self.heap.get_prototype_of(cursor)? {
            if next == prototype {
                return Ok(true);
            }
            cursor = next;
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    /// Allocate a script function object closing over `env`.
    pub(crate) fn create_function(
        &mut self,
        node: &Rc<FunctionNode>,
        env: EnvironmentHandle,
        home_object: Option<ObjectHandle>,
        name: Option<&str>,
    ) -> EngineResult<ObjectHandle> {
        let function = self.heap.alloc(
            Some(self.intrinsics.function_prototype),
            ObjectKind::Function(FunctionBehavior::Script {
                node: node.clone(),
                env,
                home_object,
            }),
        );
        let base_name = name
            .map(str::to_string)
            .or_else(|| node.name.as_ref().map(|binding| binding.name.clone()))
            .unwrap_or_default();
        let name = match node.kind {
            crate::ast::FunctionKind::Getter => format!("get {base_name}"),
            crate::ast::FunctionKind::Setter => format!("set {base_name}"),
            _ => base_name,
        };
        self.heap.define_property(
            function,
            PropertyKey::from("length"),
            PropertyDescriptor::readonly_hidden(JsValue::Number(node.declared_length() as f64)),
        )?;
        self.heap.define_property(
            function,
            PropertyKey::from("name"),
            PropertyDescriptor::readonly_hidden(JsValue::Str(name)),
        )?;
        if node.kind.is_constructable() {
            let prototype = self.create_object();
            self.heap.define_property(
                prototype,
                PropertyKey::from("constructor"),
                PropertyDescriptor::hidden(JsValue::Object(function)),
            )?;
            self.heap.define_property(
                function,
                PropertyKey::from("prototype"),
                PropertyDescriptor::Data {
                    value: JsValue::Object(prototype),
                    writable: true,
                    enumerable: false,
                    configurable: false,
                },
            )?;
        }
        Ok(function)
    }

    /// Function expression; a named one binds its own name in a private scope.
    fn instantiate_function_expression(
        &mut self,
        node: &Rc<FunctionNode>,
        env: EnvironmentHandle,
        inferred_name: Option<&str>,
    ) -> EngineResult<JsValue> {
        let Some(binding) = &node.name else {
            return Ok(JsValue::Object(self.create_function(node, env, None, inferred_name)?));
        };
        let own_env = self.new_env(Some(env), EnvironmentKind::Declarative);
        self.declare_binding(own_env, &binding.name, BindingSlot::new_lexical(false))?;
        let function = JsValue::Object(self.create_function(node, own_env, None, None)?);
        self.initialize_binding(own_env, &binding.name, function.clone())?;
        Ok(function)
    }

    fn eval_call(&mut self, callee: &Expression, arguments: &[Element], env: EnvironmentHandle) -> EngineResult<JsValue> {
        let (function, this) = match &callee.kind {
            ExpressionKind::Member { object, property } => {
                let base = self.eval_expression(object, env)?;
                let key = self.member_key(property, env)?;
                let function = self.get_property(&base, &key)?;
                (function, base)
            }
            ExpressionKind::SuperMember { property } => {
                let key = self.member_key(property, env)?;
                let this = self.this_value(env)?;
                let home = self.home_object(env)?;
                (self.super_get(home, &key, &this)?, this)
            }
            _ => (self.eval_expression(callee, env)?, JsValue::Undefined),
        };
        let args = self.eval_arguments(arguments, env)?;
        if !self.is_callable(&function) {
            return Err(self.type_error(format!("{} is not a function", describe_expression(callee))));
        }
        self.call(&function, this, args)
    }

    fn enter_call(&mut self) -> EngineResult<()> {
        let max = self.config().max_call_depth;
        if self.call_depth >= max {
            return Err(EngineError::CallDepthExceeded { max });
        }
        self.call_depth += 1;
        Ok(())
    }

    fn function_behavior(&mut self, value: &JsValue) -> EngineResult<Option<(ObjectHandle, FunctionBehavior)>> {
        let Some(handle) = value.as_object() else {
            return Ok(None);
        };
        match self.heap.kind(handle)? {
            ObjectKind::Function(behavior) => Ok(Some((handle, behavior.clone()))),
            _ => Ok(None),
        }
    }

    /// `[[Call]]`.
    pub(crate) fn call(&mut self, function: &JsValue, this: JsValue, args: Vec<JsValue>) -> EngineResult<JsValue> {
        let Some((handle, behavior)) = self.function_behavior(function)? else {
            return Err(self.type_error(format!("{} is not a function", self.display_value(function))));
        };
        self.enter_call()?;
        let result = match behavior {
            FunctionBehavior::Script {
                node,
                env,
                home_object,
            } => self.call_script(handle, &node, env, home_object, this, args, None),
            FunctionBehavior::Class { .. } => {
                let name = self.function_name(handle);
                Err(self.type_error(format!("Class constructor {name} cannot be invoked without 'new'")))
            }
            FunctionBehavior::Native { id, slot } => self.call_native(id, slot, this, args, None),
        };
        self.call_depth -= 1;
        result
    }

    /// `[[Construct]]`.
    pub(crate) fn construct(
        &mut self,
        constructor: &JsValue,
        args: Vec<JsValue>,
        new_target: ObjectHandle,
    ) -> EngineResult<JsValue> {
        let behavior = match self.function_behavior(constructor)? {
            Some(found) if self.is_constructor(constructor) => found,
            _ => {
                return Err(self.type_error(format!(
                    "{} is not a constructor",
                    self.display_value(constructor)
                )));
            }
        };
        let (handle, behavior) = behavior;
        self.enter_call()?;
        let result = match behavior {
            FunctionBehavior::Script {
                node,
                env,
                home_object,
            } => {
                let fallback = self.intrinsics.object_prototype;
                match self.prototype_from_constructor(Some(new_target), fallback) {
                    Ok(prototype) => {
                        let object = self.heap.alloc(Some(prototype), ObjectKind::Ordinary);
                        self.call_script(
                            handle,
                            &node,
                            env,
                            home_object,
                            JsValue::Object(object),
                            args,
                            Some(new_target),
                        )
                        .map(|value| if value.is_object() { value } else { JsValue::Object(object) })
                    }
                    Err(error) => Err(error),
                }
            }
            FunctionBehavior::Class {
                node, env, derived, ..
            } => self.construct_class(handle, &node, env, derived, args, new_target),
            FunctionBehavior::Native { id, slot } => {
                self.call_native(id, slot, JsValue::Undefined, args, Some(new_target))
            }
        };
        self.call_depth -= 1;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn call_script(
        &mut self,
        function: ObjectHandle,
        node: &Rc<FunctionNode>,
        closure_env: EnvironmentHandle,
        home_object: Option<ObjectHandle>,
        this: JsValue,
        args: Vec<JsValue>,
        new_target: Option<ObjectHandle>,
    ) -> EngineResult<JsValue> {
        let env = self.new_env(Some(closure_env), EnvironmentKind::Function);
        let record = self.env_mut(env)?;
        record.function = Some(function);
        record.home_object = home_object;
        record.new_target = new_target;
        if node.kind.binds_this() {
            record.this_binding = ThisBinding::Bound(this);
        }
        self.bind_parameters(node, env, args)?;
        self.run_function_body(node, env)
    }

    fn bind_parameters(&mut self, node: &FunctionNode, env: EnvironmentHandle, args: Vec<JsValue>) -> EngineResult<()> {
        for param in &node.params {
            self.declare_binding(env, &param.binding.name, BindingSlot::new_lexical(true))?;
        }
        if let Some(rest) = &node.rest {
            self.declare_binding(env, &rest.name, BindingSlot::new_lexical(true))?;
        }
        let mut args = args.into_iter();
        for param in &node.params {
            let mut value = args.next().unwrap_or(JsValue::Undefined);
            if value == JsValue::Undefined
                && let Some(default) = &param.default
            {
                value = self.eval_named(default, &param.binding.name, env)?;
            }
            self.initialize_binding(env, &param.binding.name, value)?;
        }
        if let Some(rest) = &node.rest {
            let array = self.create_array(args.collect())?;
            self.initialize_binding(env, &rest.name, JsValue::Object(array))?;
        }
        Ok(())
    }

    fn run_function_body(&mut self, node: &FunctionNode, env: EnvironmentHandle) -> EngineResult<JsValue> {
        match &node.body {
            FunctionBody::Expression(expression) => self.eval_expression(expression, env),
            FunctionBody::Block(block) => {
                let mut names = Vec::new();
                collect_var_names(&block.body, &mut names);
                for name in names {
                    self.declare_var(env, &name)?;
                }
                self.instantiate_lexical(&block.body, env, Some(env))?;
                match self.eval_statements(&block.body, env)? {
                    Completion::Return(value) => Ok(value),
                    _ => Ok(JsValue::Undefined),
                }
            }
        }
    }

    /// Own `name` of a function object, for messages.
    pub(crate) fn function_name(&self, function: ObjectHandle) -> String {
        match self
            .heap
            .get_own_property_descriptor(function, &PropertyKey::from("name"))
        {
            Ok(Some(PropertyDescriptor::Data {
                value: JsValue::Str(name),
                ..
            })) if !name.is_empty() => name,
            _ => "anonymous".to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Classes
    // -----------------------------------------------------------------------

    pub(crate) fn eval_class(
        &mut self,
        node: &Rc<ClassNode>,
        env: EnvironmentHandle,
        inferred_name: Option<&str>,
    ) -> EngineResult<JsValue> {
        let class_env = self.new_env(Some(env), EnvironmentKind::Declarative);
        if let Some(binding) = &node.name {
            self.declare_binding(class_env, &binding.name, BindingSlot::new_lexical(false))?;
        }
        let (prototype_parent, constructor_parent) = match &node.super_class {
            None => (
                Some(self.intrinsics.object_prototype),
                self.intrinsics.function_prototype,
            ),
            Some(expression) => {
                let parent = self.eval_expression(expression, class_env)?;
                match &parent {
                    JsValue::Null => (None, self.intrinsics.function_prototype),
                    JsValue::Object(handle) if self.is_constructor(&parent) => {
                        match self.get_property(&parent, &PropertyKey::from("prototype"))? {
                            JsValue::Object(prototype) => (Some(prototype), *handle),
                            JsValue::Null => (None, *handle),
                            _ => {
                                return Err(self.type_error(
                                    "Class extends value does not have valid prototype property",
                                ));
                            }
                        }
                    }
                    other => {
                        return Err(self.type_error(format!(
                            "Class extends value {} is not a constructor or null",
                            self.display_value(other)
                        )));
                    }
                }
            }
        };

        let prototype = self.heap.alloc(prototype_parent, ObjectKind::Ordinary);
        let class = self.heap.alloc(
            Some(constructor_parent),
            ObjectKind::Function(FunctionBehavior::Class {
                node: node.clone(),
                env: class_env,
                fields: Vec::new(),
                derived: node.super_class.is_some(),
            }),
        );
        let name = node
            .name
            .as_ref()
            .map(|binding| binding.name.clone())
            .or_else(|| inferred_name.map(str::to_string))
            .unwrap_or_default();
        let length = node.constructor.as_ref().map_or(0, |ctor| ctor.declared_length());
        self.heap.define_property(
            class,
            PropertyKey::from("length"),
            PropertyDescriptor::readonly_hidden(JsValue::Number(length as f64)),
        )?;
        self.heap.define_property(
            class,
            PropertyKey::from("name"),
            PropertyDescriptor::readonly_hidden(JsValue::Str(name)),
        )?;
        self.heap.define_property(
            class,
            PropertyKey::from("prototype"),
            PropertyDescriptor::data_frozen(JsValue::Object(prototype)),
        )?;
        self.heap.define_property(
            prototype,
            PropertyKey::from("constructor"),
            PropertyDescriptor::hidden(JsValue::Object(class)),
        )?;

        let mut fields = Vec::new();
        let mut static_fields = Vec::new();
        for (index, member) in node.members.iter().enumerate() {
            let key = self.eval_property_name(&member.key, class_env)?;
            let target = if member.is_static { class } else { prototype };
            let name = self.function_name_for_key(&key);
            match &member.kind {
                ClassMemberKind::Method(function) => {
                    let method = self.create_function(function, class_env, Some(target), Some(&name))?;
                    self.define_or_throw(target, key, PropertyDescriptor::hidden(JsValue::Object(method)))?;
                }
                ClassMemberKind::Getter(function) => {
                    let getter = self.create_function(function, class_env, Some(target), Some(&name))?;
                    self.merge_accessor(target, key, Some(getter), None, false)?;
                }
                ClassMemberKind::Setter(function) => {
                    let setter = self.create_function(function, class_env, Some(target), Some(&name))?;
                    self.merge_accessor(target, key, None, Some(setter), false)?;
                }
                ClassMemberKind::Field { .. } => {
                    let field = FieldInit {
                        key,
                        member_index: index,
                    };
                    if member.is_static {
                        static_fields.push(field);
                    } else {
                        fields.push(field);
                    }
                }
            }
        }
        if let ObjectKind::Function(FunctionBehavior::Class { fields: slot, .. }) =
            &mut self.heap.get_mut(class)?.kind
        {
            *slot = fields;
        }
        if let Some(binding) = &node.name {
            self.initialize_binding(class_env, &binding.name, JsValue::Object(class))?;
        }
        for field in static_fields {
            self.define_field(node, class_env, &field, class, class)?;
        }
        Ok(JsValue::Object(class))
    }

    /// Evaluate one field initializer with `this` = `receiver` and define it.
    fn define_field(
        &mut self,
        node: &ClassNode,
        class_env: EnvironmentHandle,
        field: &FieldInit,
        receiver: ObjectHandle,
        home: ObjectHandle,
    ) -> EngineResult<()> {
        let Some(ClassMemberKind::Field { value, .. }) =
            node.members.get(field.member_index).map(|member| &member.kind)
        else {
            return Ok(());
        };
        let field_env = self.new_env(Some(class_env), EnvironmentKind::Function);
        let record = self.env_mut(field_env)?;
        record.this_binding = ThisBinding::Bound(JsValue::Object(receiver));
        record.home_object = Some(home);
        let value = match value {
            Some(expression) => {
                let name = self.function_name_for_key(&field.key);
                self.eval_named(expression, &name, field_env)?
            }
            None => JsValue::Undefined,
        };
        self.create_data_property(receiver, field.key.clone(), value)
    }

    fn initialize_fields(&mut self, class: ObjectHandle, instance: ObjectHandle) -> EngineResult<()> {
        let (node, class_env, fields) = match self.heap.kind(class)? {
            ObjectKind::Function(FunctionBehavior::Class {
                node, env, fields, ..
            }) => (node.clone(), *env, fields.clone()),
            _ => return Ok(()),
        };
        let home = self.class_prototype(class)?;
        for field in &fields {
            self.define_field(&node, class_env, field, instance, home)?;
        }
        Ok(())
    }

    /// The object in a class's own `prototype` slot.
    pub(crate) fn class_prototype(&mut self, class: ObjectHandle) -> EngineResult<ObjectHandle> {
        match self
            .heap
            .get_own_property_descriptor(class, &PropertyKey::from("prototype"))?
        {
            Some(PropertyDescriptor::Data {
                value: JsValue::Object(prototype),
                ..
            }) => Ok(prototype),
            _ => Err(self.type_error("class has no prototype object")),
        }
    }

    fn construct_class(
        &mut self,
        class: ObjectHandle,
        node: &Rc<ClassNode>,
        class_env: EnvironmentHandle,
        derived: bool,
        args: Vec<JsValue>,
        new_target: ObjectHandle,
    ) -> EngineResult<JsValue> {
        let home = self.class_prototype(class)?;
        let env = self.new_env(Some(class_env), EnvironmentKind::Function);
        let record = self.env_mut(env)?;
        record.function = Some(class);
        record.home_object = Some(home);
        record.new_target = Some(new_target);
        record.this_binding = ThisBinding::Uninitialized;
        if !derived {
            let fallback = self.intrinsics.object_prototype;
            let prototype = self.prototype_from_constructor(Some(new_target), fallback)?;
            let instance = self.heap.alloc(Some(prototype), ObjectKind::Ordinary);
            self.env_mut(env)?.this_binding = ThisBinding::Bound(JsValue::Object(instance));
            self.initialize_fields(class, instance)?;
        }
        let returned = match &node.constructor {
            Some(constructor) => {
                self.bind_parameters(constructor, env, args)?;
                self.run_function_body(constructor, env)?
            }
            None if derived => {
                self.super_call(env, args)?;
                JsValue::Undefined
            }
            None => JsValue::Undefined,
        };
        if returned.is_object() {
            return Ok(returned);
        }
        self.this_value(env)
    }

    fn super_call(&mut self, env: EnvironmentHandle, args: Vec<JsValue>) -> EngineResult<JsValue> {
        let this_env = self.this_environment(env)?;
        let record = self.env_ref(this_env)?;
        let (Some(class), Some(new_target)) = (record.function, record.new_target) else {
            return Err(self.syntax_error("'super' keyword unexpected here"));
        };
        let parent = match self.heap.get_prototype_of(class)? {
            Some(parent) => JsValue::Object(parent),
            None => JsValue::Null,
        };
        if !self.is_constructor(&parent) {
            return Err(self.type_error("Super constructor is not a constructor"));
        }
        let result = self.construct(&parent, args, new_target)?;
        if self.env_ref(this_env)?.this_binding != ThisBinding::Uninitialized {
            return Err(self.reference_error("Super constructor may only be called once"));
        }
        self.env_mut(this_env)?.this_binding = ThisBinding::Bound(result.clone());
        if let Some(instance) = result.as_object() {
            self.initialize_fields(class, instance)?;
        }
        Ok(result)
    }
}

/// `var` names declared anywhere in `body`, not crossing function boundaries.
fn collect_var_names(body: &[Statement], out: &mut Vec<String>) {
    for statement in body {
        collect_var_names_in(statement, out);
    }
}

fn collect_var_names_in(statement: &Statement, out: &mut Vec<String>) {
    let push_decl = |decl: &VariableDeclaration, out: &mut Vec<String>| {
        if decl.kind == VariableKind::Var {
            for declarator in &decl.declarators {
                if !out.contains(&declarator.binding.name) {
                    out.push(declarator.binding.name.clone());
                }
            }
        }
    };
    match statement {
        Statement::Variable(decl) => push_decl(decl, out),
        Statement::If {
            consequent,
            alternate,
            ..
        } => {
            collect_var_names_in(consequent, out);
            if let Some(alternate) = alternate {
                collect_var_names_in(alternate, out);
            }
        }
        Statement::While { body, .. } => collect_var_names_in(body, out),
        Statement::For { init, body, .. } => {
            if let Some(ForInit::Variable(decl)) = init {
                push_decl(decl, out);
            }
            collect_var_names_in(body, out);
        }
        Statement::Block(block) => collect_var_names(&block.body, out),
        Statement::Try {
            block,
            handler,
            finalizer,
            ..
        } => {
            collect_var_names(&block.body, out);
            if let Some(handler) = handler {
                collect_var_names(&handler.body.body, out);
            }
            if let Some(finalizer) = finalizer {
                collect_var_names(&finalizer.body, out);
            }
        }
        _ => {}
    }
}

/// Short source-like rendering of a callee for error messages.
fn describe_expression(expression: &Expression) -> String {
    match &expression.kind {
        ExpressionKind::Identifier(reference) => reference.name.clone(),
        ExpressionKind::ScopeLookup(name) => name.clone(),
        ExpressionKind::This => "this".to_string(),
        ExpressionKind::Member {
            object,
            property: MemberProperty::Named { name, .. },
        } => format!("{}.{name}", describe_expression(object)),
        ExpressionKind::Member { object, .. } => format!("{}[...]", describe_expression(object)),
        ExpressionKind::SuperMember {
            property: MemberProperty::Named { name, .. },
        } => format!("super.{name}"),
        _ => "expression".to_string(),
    }
}

pub(crate) fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc().rem_euclid(4_294_967_296.0) as u32) as i32
}

fn exponentiate(base: f64, exponent: f64) -> f64 {
    if exponent.is_nan() || (base.abs() == 1.0 && exponent.is_infinite()) {
        return f64::NAN;
    }
    base.powf(exponent)
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::object_model::JsValue;
    use crate::realm::Realm;

    fn eval(source: &str) -> JsValue {
        let mut realm = Realm::new(EngineConfig::default()).expect("realm");
        realm.eval_script(source).expect("eval")
    }

    fn eval_err(source: &str) -> String {
        let mut realm = Realm::new(EngineConfig::default()).expect("realm");
        realm.eval_script(source).expect_err("must throw").to_string()
    }

    #[test]
    fn nested_var_declarations_are_hoisted_to_the_function() {
        let source = "
            function f(flag) {
                const before = typeof inner;
                if (flag) { while (false) { var inner = 1; } var inner = 2; }
                return before + ':' + inner;
            }
            f(true) + ',' + f(false)
        ";
        assert_eq!(eval(source), JsValue::str("undefined:2,undefined:undefined"));
    }

    #[test]
    fn arithmetic_and_strings() {
        assert_eq!(eval("1 + 2 * 3"), JsValue::Number(7.0));
        assert_eq!(eval("'a' + 1 + 2"), JsValue::str("a12"));
        assert_eq!(eval("2 ** 10"), JsValue::Number(1024.0));
        assert_eq!(eval("7 % 3"), JsValue::Number(1.0));
        assert_eq!(eval("10n * 3n"), JsValue::BigInt(30));
        assert_eq!(eval("5 & 3 | 8"), JsValue::Number(9.0));
        assert_eq!(eval("typeof undeclared"), JsValue::str("undefined"));
    }

    #[test]
    fn equality_rules() {
        assert_eq!(eval("null == undefined"), JsValue::Bool(true));
        assert_eq!(eval("'1' == 1"), JsValue::Bool(true));
        assert_eq!(eval("0 === -0"), JsValue::Bool(true));
        assert_eq!(eval("NaN === NaN"), JsValue::Bool(false));
        assert_eq!(eval("'b' > 'a'"), JsValue::Bool(true));
        assert_eq!(eval("1n == 1"), JsValue::Bool(true));
    }

    #[test]
    fn closures_capture_live_bindings() {
        let source = "
            function counter() {
                let count = 0;
                return { inc: () => ++count, get: () => count };
            }
            const c = counter();
            c.inc(); c.inc();
            c.get()
        ";
        assert_eq!(eval(source), JsValue::Number(2.0));
    }

    #[test]
    fn for_loop_creates_a_binding_per_iteration() {
        let source = "
            const fns = [];
            for (let i = 0; i < 3; i++) { fns.push(() => i); }
            fns[0]() + fns[1]() * 10 + fns[2]() * 100
        ";
        assert_eq!(eval(source), JsValue::Number(210.0));
    }

    #[test]
    fn classes_support_inheritance_fields_and_super() {
        let source = "
            class Animal {
                legs = 4;
                constructor(name) { this.name = name; }
                describe() { return this.name + ' has ' + this.legs + ' legs'; }
                static create(name) { return new this(name); }
            }
            class Bird extends Animal {
                legs = 2;
                describe() { return 'bird: ' + super.describe(); }
            }
            Bird.create('tweety').describe()
        ";
        assert_eq!(eval(source), JsValue::str("bird: tweety has 2 legs"));
    }

    #[test]
    fn static_fields_see_the_class_binding() {
        assert_eq!(eval("class K { static self = K; } K.self === K"), JsValue::Bool(true));
    }

    #[test]
    fn accessors_and_name_inference() {
        let source = "
            const o = { _v: 1, get v() { return this._v; }, set v(x) { this._v = x * 2; } };
            o.v = 5;
            const f = () => 1;
            o.v + ':' + f.name + ':' + Object.getOwnPropertyDescriptor(o, 'v').get.name
        ";
        assert_eq!(eval(source), JsValue::str("10:f:get v"));
    }

    #[test]
    fn try_catch_finally_and_thrown_values() {
        let source = "
            let log = '';
            try { null.x; } catch (e) { log += e instanceof TypeError; } finally { log += '!'; }
            try { throw 42; } catch (e) { log += e; }
            log
        ";
        assert_eq!(eval(source), JsValue::str("true!42"));
    }

    #[test]
    fn strict_mode_errors() {
        assert!(eval_err("undeclared = 1").contains("ReferenceError"));
        assert!(eval_err("const k = 1; k = 2").contains("Assignment to constant variable"));
        assert!(eval_err("class A {} A()").contains("cannot be invoked without 'new'"));
        assert!(eval_err("const o = Object.freeze({a: 1}); o.a = 2").contains("read only"));
        assert!(eval_err("let x = x + 1").contains("before initialization"));
    }

    #[test]
    fn call_depth_is_bounded() {
        let config = EngineConfig {
            max_call_depth: 16,
            ..EngineConfig::default()
        };
        let mut realm = Realm::new(config).expect("realm");
        let err = realm
            .eval_script("function f() { return f(); } f()")
            .expect_err("too deep");
        assert_eq!(err.stable_code(), "FE-SER-5003");
        let caught = realm
            .eval_script("function g() { return g(); } let r; try { g(); } catch (e) { r = e instanceof RangeError; } r")
            .expect("caught");
        assert_eq!(caught, JsValue::Bool(true));
    }

    #[test]
    fn spread_in_arrays_calls_and_objects() {
        let source = "
            const a = [1, 2];
            const b = [0, ...a, 3];
            const o = { ...{ x: 1 }, y: 2 };
            Math.max(...b) + o.x + o.y + b.length
        ";
        assert_eq!(eval(source), JsValue::Number(10.0));
    }
}
