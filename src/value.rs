// Runtime value model: Rc-wrapped for O(1) cloning.
//
// This is the evaluator's value domain, deliberately wider than JSON:
// Undefined is first-class (absence, distinct from null), arrays carry
// sequence flags that drive singleton/empty collapsing, and callables
// (closures, natives, pending tail calls, compiled regexes) are variants
// rather than tagged objects.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::ast::Node;
use crate::errors::Result;
use crate::frame::Frame;
use crate::signature::Signature;

/// Flags carried by array values.
///
/// Only `sequence`-flagged arrays undergo the empty-to-undefined and
/// singleton-to-element collapsing rule; `keep_singleton` (set by the `[]`
/// keep-array marker) suppresses the singleton half of it. `cons` marks an
/// array constructed by an array literal so path flattening leaves it
/// intact. `outer_wrapper` marks a whole-array input wrapped to act as one
/// context item. `tuple_stream` marks a sequence of binding records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayFlags {
    pub sequence: bool,
    pub keep_singleton: bool,
    pub cons: bool,
    pub outer_wrapper: bool,
    pub tuple_stream: bool,
}

impl ArrayFlags {
    pub const PLAIN: ArrayFlags = ArrayFlags {
        sequence: false,
        keep_singleton: false,
        cons: false,
        outer_wrapper: false,
        tuple_stream: false,
    };

    pub const SEQUENCE: ArrayFlags = ArrayFlags {
        sequence: true,
        keep_singleton: false,
        cons: false,
        outer_wrapper: false,
        tuple_stream: false,
    };
}

/// Built-in or caller-registered native function body.
pub type BuiltinFn = fn(&mut crate::evaluator::Evaluator, &Value, &[Value]) -> Result<Value>;

/// How a native-function value executes when applied.
#[derive(Clone)]
pub enum NativeImpl {
    /// A plain host function (builtins, caller-registered natives).
    Builtin(BuiltinFn),
    /// A partial application: `bound` has one entry per parameter of the
    /// target, `None` marking the still-free placeholder positions.
    Partial {
        target: Value,
        bound: Vec<Option<Value>>,
    },
    /// Function composition produced by `f ~> g` when both sides are
    /// functions: applies `first`, then `second` on its result.
    Compose { first: Value, second: Value },
    /// A transform value `|pattern|update[,delete]|`: applying it to a
    /// value deep-clones the value and rewrites every pattern match.
    Transformer {
        pattern: Arc<Node>,
        update: Arc<Node>,
        delete: Option<Arc<Node>>,
        frame: Frame,
    },
}

impl fmt::Debug for NativeImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeImpl::Builtin(_) => write!(f, "Builtin(..)"),
            NativeImpl::Partial { bound, .. } => write!(f, "Partial(bound: {})", bound.len()),
            NativeImpl::Compose { .. } => write!(f, "Compose(..)"),
            NativeImpl::Transformer { .. } => write!(f, "Transformer(..)"),
        }
    }
}

/// A native function value: name, optional signature, body.
#[derive(Debug, Clone)]
pub struct NativeFunction {
    pub name: String,
    pub signature: Option<Signature>,
    pub imp: NativeImpl,
}

/// A user lambda closed over its definition environment.
#[derive(Debug, Clone)]
pub struct Closure {
    pub params: Vec<String>,
    pub signature: Option<Signature>,
    pub body: Arc<Node>,
    pub frame: Frame,
    pub input: Value,
}

/// A pending tail call captured by the trampoline: the wrapped call AST
/// plus the frame and context it must run in. Produced by evaluating a
/// thunk lambda; consumed exclusively by the apply loop.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub call: Arc<Node>,
    pub frame: Frame,
    pub input: Value,
}

/// The runtime value domain.
#[derive(Clone, Debug)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<Vec<Value>>, ArrayFlags),
    Object(Rc<IndexMap<String, Value>>),
    Lambda(Rc<Closure>),
    Native(Rc<NativeFunction>),
    Thunk(Rc<PendingCall>),
    Regex(Arc<regex::Regex>),
}

// ── Construction ─────────────────────────────────────────────────────────────

impl Value {
    #[inline]
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::String(s.into())
    }

    #[inline]
    pub fn number(n: f64) -> Self {
        Value::Number(n)
    }

    /// A plain (non-sequence) array.
    #[inline]
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items), ArrayFlags::PLAIN)
    }

    /// A result sequence, subject to the collapsing rule.
    #[inline]
    pub fn sequence(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items), ArrayFlags::SEQUENCE)
    }

    #[inline]
    pub fn empty_sequence() -> Self {
        Value::sequence(Vec::new())
    }

    #[inline]
    pub fn singleton_sequence(item: Value) -> Self {
        Value::sequence(vec![item])
    }

    #[inline]
    pub fn object(map: IndexMap<String, Value>) -> Self {
        Value::Object(Rc::new(map))
    }
}

// ── Type checks ──────────────────────────────────────────────────────────────

impl Value {
    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(..))
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(
            self,
            Value::Lambda(_) | Value::Native(_) | Value::Thunk(_) | Value::Regex(_)
        )
    }

    /// An integer for range purposes: finite with no fractional part.
    #[inline]
    pub fn is_integer(&self) -> bool {
        match self {
            Value::Number(n) => n.is_finite() && n.fract() == 0.0,
            _ => false,
        }
    }

    #[inline]
    pub fn flags(&self) -> ArrayFlags {
        match self {
            Value::Array(_, flags) => *flags,
            _ => ArrayFlags::PLAIN,
        }
    }

    #[inline]
    pub fn is_sequence(&self) -> bool {
        self.flags().sequence
    }

    #[inline]
    pub fn is_tuple_stream(&self) -> bool {
        self.flags().tuple_stream
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

impl Value {
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn items(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items, _) => Some(items),
            _ => None,
        }
    }

    #[inline]
    pub fn entries(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Mutable access to array items, cloning if shared.
    #[inline]
    pub fn items_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(items, _) => Some(Rc::make_mut(items)),
            _ => None,
        }
    }

    /// Mutable access to object entries, cloning if shared.
    #[inline]
    pub fn entries_mut(&mut self) -> Option<&mut IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(Rc::make_mut(map)),
            _ => None,
        }
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Rewrite the array flags, leaving the items shared.
    pub fn with_flags(self, flags: ArrayFlags) -> Value {
        match self {
            Value::Array(items, _) => Value::Array(items, flags),
            other => other,
        }
    }

    /// Append one item to an array value in place (copy-on-write).
    pub fn push(&mut self, item: Value) {
        if let Value::Array(items, _) = self {
            Rc::make_mut(items).push(item);
        }
    }
}

// ── Semantics helpers ────────────────────────────────────────────────────────

impl Value {
    /// Effective boolean value. `None` means undefined input (the $boolean
    /// builtin propagates that; predicates treat it as false).
    pub fn truthy(&self) -> Option<bool> {
        match self {
            Value::Undefined => None,
            Value::Null => Some(false),
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(*n != 0.0),
            Value::String(s) => Some(!s.is_empty()),
            Value::Array(items, _) => match items.len() {
                0 => Some(false),
                1 => Some(items[0].truthy().unwrap_or(false)),
                _ => Some(items.iter().any(|v| v.truthy() == Some(true))),
            },
            Value::Object(map) => Some(!map.is_empty()),
            Value::Lambda(_) | Value::Native(_) | Value::Thunk(_) | Value::Regex(_) => Some(false),
        }
    }

    /// Hand back array items; wrap a non-array into a one-element vec.
    pub fn arrayify(self) -> Vec<Value> {
        match self {
            Value::Undefined => Vec::new(),
            Value::Array(items, _) => match Rc::try_unwrap(items) {
                Ok(v) => v,
                Err(rc) => rc.as_ref().clone(),
            },
            other => vec![other],
        }
    }

    /// Deep structural copy over the closed variant set. With the Rc-backed
    /// representation mutation already copies on write, but transforms and
    /// `$clone` are specified as producing an independent tree.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::Array(items, flags) => {
                Value::Array(Rc::new(items.iter().map(Value::deep_clone).collect()), *flags)
            }
            Value::Object(map) => Value::Object(Rc::new(
                map.iter().map(|(k, v)| (k.clone(), v.deep_clone())).collect(),
            )),
            other => other.clone(),
        }
    }
}

/// The universal append rule: undefined on either side yields the other,
/// non-arrays promote to singletons, and the result is always a new
/// container - shared inputs are never mutated.
pub fn append(lhs: Value, rhs: Value) -> Value {
    if lhs.is_undefined() {
        return rhs;
    }
    if rhs.is_undefined() {
        return lhs;
    }
    let mut items = match lhs {
        Value::Array(a, _) => a.as_ref().clone(),
        other => vec![other],
    };
    match rhs {
        Value::Array(b, _) => items.extend(b.iter().cloned()),
        other => items.push(other),
    }
    Value::sequence(items)
}

// ── PartialEq ────────────────────────────────────────────────────────────────

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            // NaN != NaN, IEEE semantics
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            // flags do not participate in equality
            (Value::Array(a, _), Value::Array(b, _)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Lambda(a), Value::Lambda(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Thunk(a), Value::Thunk(b)) => Rc::ptr_eq(a, b),
            (Value::Regex(a), Value::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

// ── From impls ───────────────────────────────────────────────────────────────

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::array(v)
    }
}

// ── Display ──────────────────────────────────────────────────────────────────

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => format_number(*n, f),
            Value::String(s) => write!(f, "\"{}\"", escape_json_string(s)),
            Value::Array(items, _) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "\"{}\":{}", escape_json_string(k), v)?;
                }
                write!(f, "}}")
            }
            Value::Lambda(_) => write!(f, "\"<lambda>\""),
            Value::Native(n) => write!(f, "\"<function:{}>\"", n.name),
            Value::Thunk(_) => write!(f, "\"<thunk>\""),
            Value::Regex(r) => write!(f, "\"<regex:/{}/>\"", r.as_str()),
        }
    }
}

fn escape_json_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            c if c < '\x20' => {
                result.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => result.push(c),
        }
    }
    result
}

fn format_number(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !n.is_finite() {
        write!(f, "null")
    } else if n.fract() == 0.0 && n.abs() < 1e20 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{}", n)
    }
}

// ── Serialization ────────────────────────────────────────────────────────────

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Undefined | Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => {
                if !n.is_finite() {
                    serializer.serialize_none()
                } else if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items, _) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for v in items.iter() {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map.iter() {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            Value::Lambda(_) | Value::Native(_) | Value::Thunk(_) => serializer.serialize_str(""),
            Value::Regex(r) => serializer.serialize_str(r.as_str()),
        }
    }
}

impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "any valid JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Number(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        Ok(Value::Number(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Number(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::string(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::String(v.into()))
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut vec = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(elem) = seq.next_element()? {
            vec.push(elem);
        }
        Ok(Value::array(vec))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Value, A::Error> {
        let mut m = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((k, v)) = map.next_entry()? {
            m.insert(k, v);
        }
        Ok(Value::object(m))
    }
}

// ── JSON string I/O ──────────────────────────────────────────────────────────

impl Value {
    /// Serialize to a JSON string.
    pub fn to_json_string(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serialize to a pretty-printed JSON string.
    pub fn to_json_string_pretty(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a JSON string into a Value (single pass, no intermediate
    /// serde_json::Value).
    pub fn from_json_str(s: &str) -> std::result::Result<Value, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s.into()),
            serde_json::Value::Array(arr) => {
                Value::array(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                let m: IndexMap<String, Value> =
                    map.into_iter().map(|(k, v)| (k, Value::from(v))).collect();
                Value::object(m)
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null | Value::Undefined => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if !n.is_finite() {
                    serde_json::Value::Null
                } else if n.fract() == 0.0 && n.abs() < 1e15 {
                    serde_json::json!(*n as i64)
                } else {
                    serde_json::json!(*n)
                }
            }
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Array(items, _) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Object(map) => {
                let m: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect();
                serde_json::Value::Object(m)
            }
            Value::Lambda(_) | Value::Native(_) | Value::Thunk(_) => serde_json::Value::Null,
            Value::Regex(r) => serde_json::Value::String(r.as_str().to_string()),
        }
    }
}

// ── value! macro ─────────────────────────────────────────────────────────────

/// Macro for constructing Value literals, similar to serde_json::json!
///
/// Usage:
///   value!(null)           → Value::Null
///   value!(true)           → Value::Bool(true)
///   value!(42)             → Value::Number(42.0)
///   value!("hello")        → Value::String
///   value!([1, 2, 3])      → plain array
///   value!({"k": v, ...})  → object (insertion-ordered)
#[macro_export]
macro_rules! value {
    (null) => {
        $crate::Value::Null
    };

    (true) => {
        $crate::Value::Bool(true)
    };

    (false) => {
        $crate::Value::Bool(false)
    };

    ([ $($elem:tt),* $(,)? ]) => {
        $crate::Value::array(vec![ $( $crate::value!($elem) ),* ])
    };

    ({ $($key:tt : $val:tt),* $(,)? }) => {
        {
            let mut map = indexmap::IndexMap::new();
            $(
                map.insert(($key).to_string(), $crate::value!($val));
            )*
            $crate::Value::object(map)
        }
    };

    ($other:expr) => {
        $crate::Value::from($other)
    };
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_is_cheap() {
        let arr = Value::array(vec![Value::from(1i64), Value::from(2i64)]);
        let arr2 = arr.clone();
        if let (Value::Array(a, _), Value::Array(b, _)) = (&arr, &arr2) {
            assert!(Rc::ptr_eq(a, b));
        } else {
            panic!("expected arrays");
        }
    }

    #[test]
    fn test_sequence_flags() {
        let seq = Value::sequence(vec![Value::from(1i64)]);
        assert!(seq.is_sequence());
        assert!(!Value::array(vec![]).is_sequence());

        let kept = seq.with_flags(ArrayFlags {
            keep_singleton: true,
            ..ArrayFlags::SEQUENCE
        });
        assert!(kept.flags().keep_singleton);
    }

    #[test]
    fn test_flags_do_not_affect_equality() {
        let a = Value::sequence(vec![Value::from(1i64)]);
        let b = Value::array(vec![Value::from(1i64)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_truthiness() {
        assert_eq!(Value::Undefined.truthy(), None);
        assert_eq!(Value::Null.truthy(), Some(false));
        assert_eq!(Value::from(0i64).truthy(), Some(false));
        assert_eq!(Value::from(3i64).truthy(), Some(true));
        assert_eq!(Value::from("").truthy(), Some(false));
        assert_eq!(Value::array(vec![]).truthy(), Some(false));
        assert_eq!(
            Value::array(vec![Value::from(0i64), Value::from(1i64)]).truthy(),
            Some(true)
        );
    }

    #[test]
    fn test_append_builds_new_container() {
        let a = Value::array(vec![Value::from(1i64)]);
        let b = Value::from(2i64);
        let joined = append(a.clone(), b);
        assert_eq!(joined.items().unwrap().len(), 2);
        // original untouched
        assert_eq!(a.items().unwrap().len(), 1);

        assert_eq!(append(Value::Undefined, Value::from(5i64)), Value::from(5i64));
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let v = value!({"a": [1, 2], "b": {"c": 3}});
        let mut cloned = v.deep_clone();
        cloned
            .entries_mut()
            .unwrap()
            .insert("d".to_string(), Value::from(4i64));
        assert!(v.get("d").is_none());
        assert_eq!(v.get("a"), cloned.get("a"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let v = value!({"name": "Alice", "scores": [1, 2, 3], "active": true});
        let json_str = v.to_json_string().unwrap();
        let parsed = Value::from_json_str(&json_str).unwrap();
        assert_eq!(v, parsed);
    }

    #[test]
    fn test_from_serde_json() {
        let sv = serde_json::json!({"name": "Alice", "age": 30});
        let v = Value::from(sv);
        assert_eq!(v.get("name").and_then(|v| v.as_str()), Some("Alice"));
        assert_eq!(v.get("age").and_then(|v| v.as_f64()), Some(30.0));
    }

    #[test]
    fn test_integral_numbers_serialize_as_integers() {
        assert_eq!(Value::Number(3.0).to_json_string().unwrap(), "3");
        assert_eq!(Value::Number(3.5).to_json_string().unwrap(), "3.5");
    }
}
