//! A query and transformation language for JSON.
//!
//! Expressions compile once into a shareable [`CompiledExpr`] and evaluate
//! many times against [`Value`] documents:
//!
//! ```
//! use jsonata_core::{compile, Value};
//!
//! let expr = compile("Account.Order.Product.Price").unwrap();
//! let input = Value::from_json_str(r#"{
//!     "Account": { "Order": { "Product": { "Price": 34.45 } } }
//! }"#).unwrap();
//! let result = expr.evaluate(&input).unwrap();
//! assert_eq!(result, Value::from(34.45));
//! ```
//!
//! Compilation runs the tokenizer, a Pratt parser and an AST normalizer
//! that folds navigation chains into explicit path forms and resolves
//! parent (`%`) references. Evaluation walks the normalized tree with
//! JSONata's sequence semantics: missing data is the absent `Undefined`
//! value rather than an error, and singleton sequences collapse to their
//! single element.
//!
//! Variable bindings, host functions and resource limits hang off a
//! [`Frame`]; create one with [`new_frame`] so the built-in function
//! library is in scope, then pass it to [`CompiledExpr::evaluate_with_frame`].

mod ast;
mod errors;
mod evaluator;
mod frame;
mod functions;
mod normalizer;
mod parser;
mod signature;
mod tokenizer;
mod value;

use std::sync::Arc;

pub use ast::{BinaryOp, Node, NodeKind};
pub use errors::{Error, Result};
pub use evaluator::TraceHook;
pub use frame::{Frame, RuntimeBounds};
pub use signature::Signature;
pub use value::{ArrayFlags, BuiltinFn, Value};

use evaluator::Evaluator;

/// A compiled expression, reusable and shareable across threads.
///
/// The AST is immutable after compilation; each `evaluate` call gets its
/// own evaluator state, so one `CompiledExpr` can serve concurrent
/// evaluations.
#[derive(Clone)]
pub struct CompiledExpr {
    source: String,
    body: Arc<Node>,
    slot_labels: Arc<Vec<String>>,
    errors: Vec<Error>,
    entry_hook: Option<TraceHook>,
    exit_hook: Option<TraceHook>,
}

/// Compile `source`, failing on the first error.
pub fn compile(source: &str) -> Result<CompiledExpr> {
    let raw = parser::Parser::parse(source)?;
    let (body, slot_labels) = normalizer::normalize(raw)?;
    log::debug!("compiled expression ({} chars)", source.len());
    Ok(CompiledExpr {
        source: source.to_string(),
        body: Arc::new(body),
        slot_labels: Arc::new(slot_labels),
        errors: Vec::new(),
        entry_hook: None,
        exit_hook: None,
    })
}

/// Compile `source`, recovering past syntax errors to collect as many as
/// possible. The returned expression, if any, refuses to evaluate while
/// it holds errors; it exists so tooling can inspect the partial AST.
pub fn compile_with_recovery(source: &str) -> (Option<CompiledExpr>, Vec<Error>) {
    let (raw, errors) = parser::Parser::parse_with_recovery(source);
    let raw = match raw {
        Some(raw) => raw,
        None => return (None, errors),
    };
    let (body, slot_labels) = if errors.is_empty() {
        match normalizer::normalize(raw) {
            Ok(ok) => ok,
            Err(e) => return (None, vec![e]),
        }
    } else {
        // error recovery skips normalization: the raw shape is all the
        // caller can rely on
        (raw, Vec::new())
    };
    log::debug!(
        "compiled expression with {} recovered error(s)",
        errors.len()
    );
    let expr = CompiledExpr {
        source: source.to_string(),
        body: Arc::new(body),
        slot_labels: Arc::new(slot_labels),
        errors: errors.clone(),
        entry_hook: None,
        exit_hook: None,
    };
    (Some(expr), errors)
}

/// A frame with the built-in function library in scope. Bind variables,
/// register natives and set [`RuntimeBounds`] on it, then evaluate under
/// it.
pub fn new_frame() -> Frame {
    let root = Frame::new();
    functions::bind_builtins(&root);
    Frame::new_child(&root)
}

impl CompiledExpr {
    /// The expression text this was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Syntax errors collected during recovering compilation.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// The normalized AST root.
    pub fn ast(&self) -> &Node {
        &self.body
    }

    /// Install per-node instrumentation, called on entry to and exit from
    /// every node evaluation.
    pub fn with_tracing(mut self, entry: TraceHook, exit: TraceHook) -> CompiledExpr {
        self.entry_hook = Some(entry);
        self.exit_hook = Some(exit);
        self
    }

    /// Evaluate against `input` with a fresh frame.
    pub fn evaluate(&self, input: &Value) -> Result<Value> {
        self.evaluate_with_frame(input, &new_frame())
    }

    /// Evaluate against `input` under `frame` (normally from
    /// [`new_frame`], possibly with caller bindings and bounds on it).
    pub fn evaluate_with_frame(&self, input: &Value, frame: &Frame) -> Result<Value> {
        if !self.errors.is_empty() {
            return Err(Error::EvaluatedWithErrors);
        }

        // an array input is wrapped so the whole document is one context
        // item; `$` refers to the wrapper
        let input = match input {
            Value::Array(..) => Value::singleton_sequence(input.clone()).with_flags(ArrayFlags {
                sequence: true,
                outer_wrapper: true,
                ..ArrayFlags::PLAIN
            }),
            other => other.clone(),
        };

        let env = Frame::new_child(frame);
        env.bind("$", input.clone());

        let mut evaluator = Evaluator::new(Arc::clone(&self.slot_labels), &env);
        evaluator.set_hooks(self.entry_hook.clone(), self.exit_hook.clone());
        log::debug!("evaluating expression ({} chars)", self.source.len());
        evaluator.evaluate(&self.body, &input, &env)
    }
}

impl std::fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledExpr")
            .field("source", &self.source)
            .field("errors", &self.errors)
            .finish()
    }
}
