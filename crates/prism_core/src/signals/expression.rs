// expression.rs - Signal expression compiler and evaluator
//
// Grammar (whitespace is required before operators and function names):
//
//   expr    := orExpr
//   orExpr  := andExpr ('||' andExpr)*
//   andExpr := cmpExpr ('&&' cmpExpr)*
//   cmpExpr := addExpr (cmpOp addExpr)?
//   addExpr := mulExpr (('+'|'-') mulExpr)*
//   mulExpr := unary (('*'|'/') unary)*
//   unary   := '-' unary | '!' unary | atom
//   atom    := number | funcCall | signalRef | fieldRef | '(' expr ')'
//
// Booleans treat inputs >= 0.5 as true and output 0.0/1.0. Division by zero
// evaluates to 0.0, as does any reference past the binding depth limit.

use crate::ecs::components::{ops_by_name, ComponentOps};
use crate::ecs::lock::Lock;
use crate::events::EventData;
use crate::focus::FocusLayer;
use crate::refs::{EntityRef, EntityScope, Name, ReferenceManager, SignalRef};
use crate::signals::MAX_SIGNAL_BINDING_DEPTH;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("expression is empty")]
    Empty,
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("expected '{expected}', found '{found}'")]
    Expected { expected: String, found: String },
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown focus layer '{0}'")]
    UnknownFocusLayer(String),
    #[error("unknown component '{0}'")]
    UnknownComponent(String),
    #[error("invalid reference '{0}'")]
    InvalidReference(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Func {
    Sin,
    Cos,
    Tan,
    Floor,
    Ceil,
    Abs,
    Min,
    Max,
}

impl Func {
    fn parse(name: &str) -> Option<(Func, usize)> {
        match name {
            "sin" => Some((Func::Sin, 1)),
            "cos" => Some((Func::Cos, 1)),
            "tan" => Some((Func::Tan, 1)),
            "floor" => Some((Func::Floor, 1)),
            "ceil" => Some((Func::Ceil, 1)),
            "abs" => Some((Func::Abs, 1)),
            "min" => Some((Func::Min, 2)),
            "max" => Some((Func::Max, 2)),
            _ => None,
        }
    }
}

pub(crate) enum Node {
    Constant(f64),
    Signal(SignalRef),
    Field {
        entity: EntityRef,
        ops: &'static ComponentOps,
        field: String,
    },
    IsFocused(FocusLayer),
    IfFocused(FocusLayer, Box<Node>),
    EventInput,
    Negate(Box<Node>),
    Not(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

thread_local! {
    /// Set when any signal read exceeds the binding depth during the current
    /// top-level evaluation; poisons the result to 0.0.
    pub(crate) static DEPTH_EXCEEDED: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn flag_depth_exceeded() {
    DEPTH_EXCEEDED.with(|flag| flag.set(true));
}

pub(crate) fn reset_depth_exceeded() {
    DEPTH_EXCEEDED.with(|flag| flag.set(false));
}

pub(crate) fn take_depth_exceeded() -> bool {
    DEPTH_EXCEEDED.with(Cell::get)
}

struct EvalContext<'a, 'l> {
    lock: &'a Lock<'l>,
    input: Option<&'a EventData>,
    depth: usize,
}

impl Node {
    fn truthy(value: f64) -> bool {
        value >= 0.5
    }

    fn bool_value(value: bool) -> f64 {
        if value {
            1.0
        } else {
            0.0
        }
    }

    fn evaluate(&self, ctx: &EvalContext) -> f64 {
        match self {
            Node::Constant(value) => *value,
            Node::Signal(signal) => signal.get_signal(ctx.lock, ctx.depth),
            Node::Field { entity, ops, field } => {
                let ent = entity.get(ctx.lock.instance_kind());
                (ops.read_field)(ctx.lock, ent, field).unwrap_or(0.0)
            }
            Node::IsFocused(layer) => Self::bool_value(
                ctx.lock
                    .focus()
                    .map(|focus| focus.has_focus(*layer))
                    .unwrap_or(false),
            ),
            Node::IfFocused(layer, body) => {
                let focused = ctx
                    .lock
                    .focus()
                    .map(|focus| focus.has_focus(*layer))
                    .unwrap_or(false);
                if focused {
                    body.evaluate(ctx)
                } else {
                    0.0
                }
            }
            Node::EventInput => ctx.input.map(EventData::as_f64).unwrap_or(0.0),
            Node::Negate(child) => -child.evaluate(ctx),
            Node::Not(child) => Self::bool_value(!Self::truthy(child.evaluate(ctx))),
            Node::Binary(op, left, right) => {
                let a = left.evaluate(ctx);
                match op {
                    BinaryOp::And => {
                        Self::bool_value(Self::truthy(a) && Self::truthy(right.evaluate(ctx)))
                    }
                    BinaryOp::Or => {
                        Self::bool_value(Self::truthy(a) || Self::truthy(right.evaluate(ctx)))
                    }
                    BinaryOp::Add => a + right.evaluate(ctx),
                    BinaryOp::Sub => a - right.evaluate(ctx),
                    BinaryOp::Mul => a * right.evaluate(ctx),
                    BinaryOp::Div => {
                        let b = right.evaluate(ctx);
                        if b == 0.0 {
                            0.0
                        } else {
                            a / b
                        }
                    }
                    BinaryOp::Gt => Self::bool_value(a > right.evaluate(ctx)),
                    BinaryOp::Ge => Self::bool_value(a >= right.evaluate(ctx)),
                    BinaryOp::Lt => Self::bool_value(a < right.evaluate(ctx)),
                    BinaryOp::Le => Self::bool_value(a <= right.evaluate(ctx)),
                    BinaryOp::Eq => Self::bool_value(a == right.evaluate(ctx)),
                    BinaryOp::Ne => Self::bool_value(a != right.evaluate(ctx)),
                }
            }
            Node::Call(func, args) => {
                let a = args[0].evaluate(ctx);
                match func {
                    Func::Sin => a.sin(),
                    Func::Cos => a.cos(),
                    Func::Tan => a.tan(),
                    Func::Floor => a.floor(),
                    Func::Ceil => a.ceil(),
                    Func::Abs => a.abs(),
                    Func::Min => a.min(args[1].evaluate(ctx)),
                    Func::Max => a.max(args[1].evaluate(ctx)),
                }
            }
        }
    }

    fn collect_signals(&self, out: &mut Vec<SignalRef>) {
        match self {
            Node::Signal(signal) => {
                if !out.iter().any(|s| s.ptr_eq(signal)) {
                    out.push(signal.clone());
                }
            }
            Node::IfFocused(_, child) | Node::Negate(child) | Node::Not(child) => {
                child.collect_signals(out)
            }
            Node::Binary(_, left, right) => {
                left.collect_signals(out);
                right.collect_signals(out);
            }
            Node::Call(_, args) => {
                for arg in args {
                    arg.collect_signals(out);
                }
            }
            Node::Constant(_) | Node::Field { .. } | Node::IsFocused(_) | Node::EventInput => {}
        }
    }

    /// True when the subtree reads nothing but constants and signals, which
    /// is the cacheability requirement.
    fn signals_only(&self) -> bool {
        match self {
            Node::Constant(_) | Node::Signal(_) => true,
            Node::Field { .. } | Node::IsFocused(_) | Node::IfFocused(..) | Node::EventInput => {
                false
            }
            Node::Negate(child) | Node::Not(child) => child.signals_only(),
            Node::Binary(_, left, right) => left.signals_only() && right.signals_only(),
            Node::Call(_, args) => args.iter().all(Node::signals_only),
        }
    }
}

/// A parsed arithmetic/logic expression over signals, component fields, and
/// focus state.
///
/// The textual source and its resolution scope are retained; re-scoping
/// re-compiles from source. Deserialized expressions stay uncompiled until
/// their owning component's scope is applied.
#[derive(Clone, Default)]
pub struct SignalExpression {
    source: String,
    scope: EntityScope,
    root: Option<Arc<Node>>,
}

impl SignalExpression {
    /// Create an uncompiled expression. Call [`SignalExpression::compile`]
    /// (or bind it to a signal, which compiles on demand) before evaluating.
    pub fn new(source: impl Into<String>, scope: EntityScope) -> Self {
        Self {
            source: source.into(),
            scope,
            root: None,
        }
    }

    /// Wrap a single signal reference.
    pub fn from_signal(signal: &SignalRef) -> Self {
        Self {
            source: signal.key().to_string(),
            scope: EntityScope::default(),
            root: Some(Arc::new(Node::Signal(signal.clone()))),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn scope(&self) -> &EntityScope {
        &self.scope
    }

    pub fn is_compiled(&self) -> bool {
        self.root.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn compile(&mut self, refs: &ReferenceManager) -> Result<(), ExprError> {
        let tokens = tokenize(&self.source);
        let mut parser = Parser {
            tokens,
            pos: 0,
            scope: self.scope.clone(),
            refs,
        };
        let root = parser.parse_expr()?;
        match parser.peek() {
            Some(extra) => Err(ExprError::UnexpectedToken(extra.to_string())),
            None => {
                self.root = Some(Arc::new(root));
                Ok(())
            }
        }
    }

    /// Change the resolution scope, re-compiling from source. Equivalent to
    /// re-parsing the original text under the new scope.
    pub fn set_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        self.scope = scope.clone();
        if self.source.is_empty() {
            self.root = None;
            return;
        }
        if let Err(err) = self.compile(refs) {
            tracing::warn!(expr = %self.source, error = %err, "failed to re-compile expression");
            self.root = None;
        }
    }

    /// Every signal the compiled tree references.
    pub fn references(&self) -> Vec<SignalRef> {
        let mut out = Vec::new();
        if let Some(root) = self.root.as_ref() {
            root.collect_signals(&mut out);
        }
        out
    }

    /// True when the tree reads only signals (no fields, focus, or event
    /// input), making memoization sound.
    pub fn references_signals_only(&self) -> bool {
        self.root.as_ref().map(|r| r.signals_only()).unwrap_or(true)
    }

    /// Evaluate under a signal read lock. A depth of zero marks a top-level
    /// evaluation: any reference past the depth bound poisons the whole
    /// result to 0.0.
    pub fn evaluate(&self, lock: &Lock, depth: usize) -> f64 {
        self.evaluate_with(lock, depth, None)
    }

    /// Evaluate with an event payload available to `event()` nodes.
    pub fn evaluate_event(&self, lock: &Lock, input: &EventData) -> f64 {
        self.evaluate_with(lock, 0, Some(input))
    }

    fn evaluate_with(&self, lock: &Lock, depth: usize, input: Option<&EventData>) -> f64 {
        let Some(root) = self.root.as_ref() else {
            return 0.0;
        };
        if depth > MAX_SIGNAL_BINDING_DEPTH {
            flag_depth_exceeded();
            return 0.0;
        }
        let ctx = EvalContext { lock, input, depth };
        if depth == 0 {
            DEPTH_EXCEEDED.with(|flag| flag.set(false));
            let value = root.evaluate(&ctx);
            if DEPTH_EXCEEDED.with(Cell::get) {
                tracing::warn!(expr = %self.source, "expression exceeded max binding depth");
                0.0
            } else {
                value
            }
        } else {
            root.evaluate(&ctx)
        }
    }
}

impl PartialEq for SignalExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.scope == other.scope
    }
}

impl std::fmt::Debug for SignalExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalExpression")
            .field("source", &self.source)
            .field("scope", &self.scope.to_string())
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

impl Serialize for SignalExpression {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for SignalExpression {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Ok(SignalExpression::new(source, EntityScope::default()))
    }
}

const OPERATORS: &[&str] = &[
    "||", "&&", ">", ">=", "<", "<=", "==", "!=", "+", "-", "*", "/", "!",
];

fn is_operator(token: &str) -> bool {
    OPERATORS.contains(&token)
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in input.split_whitespace() {
        // Parens and commas separate regardless of whitespace
        let mut chunk = String::new();
        let mut chunks = Vec::new();
        for ch in word.chars() {
            match ch {
                '(' | ')' | ',' => {
                    if !chunk.is_empty() {
                        chunks.push(std::mem::take(&mut chunk));
                    }
                    chunks.push(ch.to_string());
                }
                _ => chunk.push(ch),
            }
        }
        if !chunk.is_empty() {
            chunks.push(chunk);
        }

        for mut chunk in chunks {
            if is_operator(&chunk) || chunk.parse::<f64>().is_ok() {
                tokens.push(chunk);
                continue;
            }
            // Leading unary prefixes stick to their operand without spaces
            while (chunk.starts_with('-') || chunk.starts_with('!')) && chunk.len() > 1 {
                tokens.push(chunk[..1].to_string());
                chunk = chunk[1..].to_string();
                if is_operator(&chunk) || chunk.parse::<f64>().is_ok() {
                    break;
                }
            }
            tokens.push(chunk);
        }
    }
    tokens
}

struct Parser<'a> {
    tokens: Vec<String>,
    pos: usize,
    scope: EntityScope,
    refs: &'a ReferenceManager,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Result<String, ExprError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &str) -> Result<(), ExprError> {
        let found = self.next()?;
        if found == expected {
            Ok(())
        } else {
            Err(ExprError::Expected {
                expected: expected.to_string(),
                found,
            })
        }
    }

    fn parse_expr(&mut self) -> Result<Node, ExprError> {
        if self.tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_and()?;
        while self.peek() == Some("||") {
            self.pos += 1;
            let right = self.parse_and()?;
            node = Node::Binary(BinaryOp::Or, Box::new(node), Box::new(right));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_cmp()?;
        while self.peek() == Some("&&") {
            self.pos += 1;
            let right = self.parse_cmp()?;
            node = Node::Binary(BinaryOp::And, Box::new(node), Box::new(right));
        }
        Ok(node)
    }

    fn parse_cmp(&mut self) -> Result<Node, ExprError> {
        let node = self.parse_add()?;
        let op = match self.peek() {
            Some(">") => Some(BinaryOp::Gt),
            Some(">=") => Some(BinaryOp::Ge),
            Some("<") => Some(BinaryOp::Lt),
            Some("<=") => Some(BinaryOp::Le),
            Some("==") => Some(BinaryOp::Eq),
            Some("!=") => Some(BinaryOp::Ne),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let right = self.parse_add()?;
                Ok(Node::Binary(op, Box::new(node), Box::new(right)))
            }
            None => Ok(node),
        }
    }

    fn parse_add(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some("+") => BinaryOp::Add,
                Some("-") => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_mul()?;
            node = Node::Binary(op, Box::new(node), Box::new(right));
        }
        Ok(node)
    }

    fn parse_mul(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some("*") => BinaryOp::Mul,
                Some("/") => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            node = Node::Binary(op, Box::new(node), Box::new(right));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some("-") => {
                self.pos += 1;
                Ok(Node::Negate(Box::new(self.parse_unary()?)))
            }
            Some("!") => {
                self.pos += 1;
                Ok(Node::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Node, ExprError> {
        let token = self.next()?;
        if token == "(" {
            let node = self.parse_expr()?;
            self.expect(")")?;
            return Ok(node);
        }
        if let Ok(value) = token.parse::<f64>() {
            return Ok(Node::Constant(value));
        }
        if self.peek() == Some("(") {
            return self.parse_call(&token);
        }
        if token.contains('#') {
            return self.parse_field_ref(&token);
        }
        if token.contains('/') {
            let signal = self.refs.get_signal_by_path(&token, &self.scope);
            if !signal.is_valid() {
                return Err(ExprError::InvalidReference(token));
            }
            return Ok(Node::Signal(signal));
        }
        Err(ExprError::UnexpectedToken(token))
    }

    fn parse_call(&mut self, name: &str) -> Result<Node, ExprError> {
        self.expect("(")?;
        match name {
            "is_focused" => {
                let layer = self.parse_focus_layer()?;
                self.expect(")")?;
                Ok(Node::IsFocused(layer))
            }
            "if_focused" => {
                let layer = self.parse_focus_layer()?;
                self.expect(",")?;
                let body = self.parse_expr()?;
                self.expect(")")?;
                Ok(Node::IfFocused(layer, Box::new(body)))
            }
            "event" => {
                self.expect(")")?;
                Ok(Node::EventInput)
            }
            _ => {
                let (func, arity) = Func::parse(name)
                    .ok_or_else(|| ExprError::UnknownFunction(name.to_string()))?;
                let mut args = vec![self.parse_expr()?];
                while args.len() < arity {
                    self.expect(",")?;
                    args.push(self.parse_expr()?);
                }
                self.expect(")")?;
                Ok(Node::Call(func, args))
            }
        }
    }

    fn parse_focus_layer(&mut self) -> Result<FocusLayer, ExprError> {
        let token = self.next()?;
        FocusLayer::parse(&token).ok_or(ExprError::UnknownFocusLayer(token))
    }

    fn parse_field_ref(&mut self, token: &str) -> Result<Node, ExprError> {
        let (entity_part, rest) = token
            .split_once('#')
            .ok_or_else(|| ExprError::InvalidReference(token.to_string()))?;
        let (component, field) = rest
            .split_once('.')
            .ok_or_else(|| ExprError::InvalidReference(token.to_string()))?;
        let name = Name::parse(entity_part, &self.scope)
            .ok_or_else(|| ExprError::InvalidReference(token.to_string()))?;
        let ops =
            ops_by_name(component).ok_or_else(|| ExprError::UnknownComponent(component.into()))?;
        Ok(Node::Field {
            entity: self.refs.get_entity(&name),
            ops,
            field: field.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_splits_parens_and_prefixes() {
        assert_eq!(
            tokenize("(a/b + 1) > 10"),
            vec!["(", "a/b", "+", "1", ")", ">", "10"]
        );
        assert_eq!(tokenize("min(1, x/y)"), vec!["min", "(", "1", ",", "x/y", ")"]);
        assert_eq!(tokenize("!a/b"), vec!["!", "a/b"]);
        assert_eq!(tokenize("-5 + -a/b"), vec!["-5", "+", "-", "a/b"]);
        assert_eq!(tokenize("a != b"), vec!["a", "!=", "b"]);
    }

    #[test]
    fn parse_rejects_garbage() {
        let refs = ReferenceManager::new();
        let scope = EntityScope::new("scene", "");

        let mut expr = SignalExpression::new("1 +", scope.clone());
        assert!(expr.compile(&refs).is_err());

        let mut expr = SignalExpression::new("bogus", scope.clone());
        assert!(expr.compile(&refs).is_err());

        let mut expr = SignalExpression::new("nope(1)", scope.clone());
        assert!(matches!(expr.compile(&refs), Err(ExprError::UnknownFunction(_))));

        let mut expr = SignalExpression::new("1 2", scope);
        assert!(matches!(expr.compile(&refs), Err(ExprError::UnexpectedToken(_))));
    }

    #[test]
    fn compiled_references_are_collected() {
        let refs = ReferenceManager::new();
        let scope = EntityScope::new("scene", "");
        let mut expr = SignalExpression::new("a/x + b/y * a/x", scope);
        expr.compile(&refs).unwrap();
        let signals = expr.references();
        assert_eq!(signals.len(), 2);
        assert!(expr.references_signals_only());
    }

    #[test]
    fn field_and_focus_nodes_are_uncacheable() {
        let refs = ReferenceManager::new();
        let scope = EntityScope::new("scene", "");

        let mut expr = SignalExpression::new("door#physics.mass + 1", scope.clone());
        expr.compile(&refs).unwrap();
        assert!(!expr.references_signals_only());

        let mut expr = SignalExpression::new("is_focused ( Game )", scope.clone());
        expr.compile(&refs).unwrap();
        assert!(!expr.references_signals_only());

        let mut expr = SignalExpression::new("door#bogus.mass", scope);
        assert!(matches!(expr.compile(&refs), Err(ExprError::UnknownComponent(_))));
    }
}
