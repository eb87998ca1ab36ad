// Lexically chained binding frames.
//
// A frame is a mutable map of variable bindings with a parent link. Frames
// are Rc-shared so closures can capture their definition environment in
// O(1); mutation goes through a RefCell since evaluation is single-threaded
// per call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::signature::Signature;
use crate::value::{BuiltinFn, NativeFunction, NativeImpl, Value};

/// Runtime limits enforced by the evaluator. Stored on the root frame so
/// child frames inherit them through the chain.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeBounds {
    /// Wall-clock budget for a single evaluate call, in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Maximum evaluator recursion depth.
    pub max_depth: Option<usize>,
}

impl Default for RuntimeBounds {
    fn default() -> Self {
        RuntimeBounds {
            timeout_ms: None,
            max_depth: None,
        }
    }
}

struct FrameData {
    bindings: RefCell<HashMap<String, Value>>,
    parent: Option<Frame>,
    /// Millis since the Unix epoch, captured once when the root frame of an
    /// evaluation is created, so $now/$millis are stable within one call.
    timestamp: i64,
    bounds: RefCell<RuntimeBounds>,
}

/// A shareable handle to one frame in the chain.
#[derive(Clone)]
pub struct Frame(Rc<FrameData>);

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.0.bindings.borrow().keys().cloned().collect();
        f.debug_struct("Frame")
            .field("bindings", &names)
            .field("has_parent", &self.0.parent.is_some())
            .finish()
    }
}

impl Frame {
    /// A fresh root frame stamped with the current time.
    pub fn new() -> Frame {
        Frame(Rc::new(FrameData {
            bindings: RefCell::new(HashMap::new()),
            parent: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            bounds: RefCell::new(RuntimeBounds::default()),
        }))
    }

    /// A child frame; lookups fall through to the parent.
    pub fn new_child(parent: &Frame) -> Frame {
        Frame(Rc::new(FrameData {
            bindings: RefCell::new(HashMap::new()),
            parent: Some(parent.clone()),
            timestamp: parent.0.timestamp,
            bounds: RefCell::new(*parent.0.bounds.borrow()),
        }))
    }

    /// Bind `name` in this frame, shadowing any parent binding.
    pub fn bind(&self, name: impl Into<String>, value: Value) {
        self.0.bindings.borrow_mut().insert(name.into(), value);
    }

    /// Resolve a variable by walking the chain. Unknown names are
    /// Undefined, not an error.
    pub fn lookup(&self, name: &str) -> Value {
        let mut frame = self;
        loop {
            if let Some(v) = frame.0.bindings.borrow().get(name) {
                return v.clone();
            }
            match &frame.0.parent {
                Some(parent) => frame = parent,
                None => return Value::Undefined,
            }
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp
    }

    pub fn bounds(&self) -> RuntimeBounds {
        *self.0.bounds.borrow()
    }

    /// Set the depth/timeout limits for evaluations run under this frame.
    pub fn set_runtime_bounds(&self, bounds: RuntimeBounds) {
        *self.0.bounds.borrow_mut() = bounds;
    }

    /// Register a host function under `$name`. `signature` uses the same
    /// mini-language as built-ins, e.g. `"<n-n:n>"`; pass None to skip
    /// argument validation.
    pub fn register_native(
        &self,
        name: &str,
        signature: Option<&str>,
        imp: BuiltinFn,
    ) -> crate::errors::Result<()> {
        let sig = match signature {
            Some(s) => Some(Signature::parse(s)?),
            None => None,
        };
        self.bind(
            name,
            Value::Native(Rc::new(NativeFunction {
                name: name.to_string(),
                signature: sig,
                imp: NativeImpl::Builtin(imp),
            })),
        );
        Ok(())
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_chain() {
        let root = Frame::new();
        root.bind("x", Value::from(1i64));
        let child = Frame::new_child(&root);
        child.bind("y", Value::from(2i64));

        assert_eq!(child.lookup("x"), Value::from(1i64));
        assert_eq!(child.lookup("y"), Value::from(2i64));
        assert_eq!(root.lookup("y"), Value::Undefined);
        assert_eq!(child.lookup("z"), Value::Undefined);
    }

    #[test]
    fn test_child_shadows_parent() {
        let root = Frame::new();
        root.bind("x", Value::from(1i64));
        let child = Frame::new_child(&root);
        child.bind("x", Value::from(9i64));

        assert_eq!(child.lookup("x"), Value::from(9i64));
        assert_eq!(root.lookup("x"), Value::from(1i64));
    }

    #[test]
    fn test_bounds_inherit() {
        let root = Frame::new();
        root.set_runtime_bounds(RuntimeBounds {
            timeout_ms: Some(500),
            max_depth: Some(64),
        });
        let child = Frame::new_child(&root);
        assert_eq!(child.bounds().timeout_ms, Some(500));
        assert_eq!(child.bounds().max_depth, Some(64));
    }

    #[test]
    fn test_timestamp_shared_down_the_chain() {
        let root = Frame::new();
        let child = Frame::new_child(&root);
        assert_eq!(root.timestamp_millis(), child.timestamp_millis());
    }
}
