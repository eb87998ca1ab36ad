// Built-in function library.
//
// Every builtin is a plain fn registered with its signature string; the
// signature machinery boxes singletons and splices the evaluation context
// before the implementation runs. Higher-order builtins call back into the
// evaluator through `Evaluator::apply`, so user comparators and callbacks
// get the same trampolining and resource guards as any other call.

use std::rc::Rc;
use std::sync::OnceLock;

use indexmap::{IndexMap, IndexSet};

use crate::errors::{Error, Result};
use crate::evaluator::{self, Evaluator};
use crate::signature::Signature;
use crate::value::{append, BuiltinFn, NativeFunction, NativeImpl, Value};

struct Builtin {
    name: &'static str,
    signature: &'static str,
    func: BuiltinFn,
}

const BUILTINS: &[Builtin] = &[
    Builtin { name: "map", signature: "<af>", func: fn_map },
    Builtin { name: "filter", signature: "<af>", func: fn_filter },
    Builtin { name: "reduce", signature: "<afj?:j>", func: fn_reduce },
    Builtin { name: "single", signature: "<af?>", func: fn_single },
    Builtin { name: "sift", signature: "<o-f?:o>", func: fn_sift },
    Builtin { name: "each", signature: "<o-f:a>", func: fn_each },
    Builtin { name: "sort", signature: "<af?:a>", func: fn_sort },
    Builtin { name: "exists", signature: "<x:b>", func: fn_exists },
    Builtin { name: "count", signature: "<a:n>", func: fn_count },
    Builtin { name: "append", signature: "<xx:a>", func: fn_append },
    Builtin { name: "keys", signature: "<x-:a<s>>", func: fn_keys },
    Builtin { name: "lookup", signature: "<x-s:x>", func: fn_lookup },
    Builtin { name: "string", signature: "<x-b?:s>", func: fn_string },
    Builtin { name: "number", signature: "<(nsb)-:n>", func: fn_number },
    Builtin { name: "boolean", signature: "<x-:b>", func: fn_boolean },
    Builtin { name: "not", signature: "<x-:b>", func: fn_not },
    Builtin { name: "type", signature: "<x:s>", func: fn_type },
    Builtin { name: "error", signature: "<s?>", func: fn_error },
    Builtin { name: "assert", signature: "<bs?>", func: fn_assert },
    Builtin { name: "clone", signature: "<x-:x>", func: fn_clone },
    Builtin { name: "now", signature: "<:s>", func: fn_now },
    Builtin { name: "millis", signature: "<:n>", func: fn_millis },
];

fn parsed_signatures() -> &'static Vec<Signature> {
    static SIGNATURES: OnceLock<Vec<Signature>> = OnceLock::new();
    SIGNATURES.get_or_init(|| {
        BUILTINS
            .iter()
            .map(|b| match Signature::parse(b.signature) {
                Ok(sig) => sig,
                // a bad builtin signature is a programming error in this
                // table, not a user input
                Err(e) => panic!("invalid signature for ${}: {}", b.name, e),
            })
            .collect()
    })
}

/// Bind the whole library into `frame`.
pub fn bind_builtins(frame: &crate::frame::Frame) {
    let signatures = parsed_signatures();
    for (builtin, sig) in BUILTINS.iter().zip(signatures) {
        frame.bind(
            builtin.name.to_string(),
            Value::Native(Rc::new(NativeFunction {
                name: builtin.name.to_string(),
                signature: Some(sig.clone()),
                imp: NativeImpl::Builtin(builtin.func),
            })),
        );
    }
}

// ── higher-order functions ───────────────────────────────────────────────────

/// How many arguments a function value accepts, where that is knowable.
fn arity(proc: &Value) -> Option<usize> {
    match proc {
        Value::Lambda(closure) => Some(closure.params.len()),
        Value::Native(nf) => match (&nf.imp, &nf.signature) {
            (NativeImpl::Partial { bound, .. }, _) => {
                Some(bound.iter().filter(|slot| slot.is_none()).count())
            }
            (_, Some(sig)) => Some(sig.params().len()),
            _ => None,
        },
        _ => None,
    }
}

/// Trim the (value, index, collection) callback arguments to the arity the
/// callback declares, always passing at least the value.
fn hof_args(proc: &Value, full: Vec<Value>) -> Vec<Value> {
    let n = arity(proc).unwrap_or(full.len()).clamp(1, full.len());
    let mut args = full;
    args.truncate(n);
    args
}

fn fn_map(ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let arr = args[0].clone().arrayify();
    let func = &args[1];
    let whole = Value::array(arr.clone());
    let mut out = Vec::new();
    for (i, item) in arr.iter().enumerate() {
        let call_args = hof_args(
            func,
            vec![item.clone(), Value::from(i), whole.clone()],
        );
        let res = ev.apply(func, &call_args, &Value::Undefined, 0)?;
        if !res.is_undefined() {
            out.push(res);
        }
    }
    Ok(Value::sequence(out))
}

fn fn_filter(ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let arr = args[0].clone().arrayify();
    let func = &args[1];
    let whole = Value::array(arr.clone());
    let mut out = Vec::new();
    for (i, item) in arr.iter().enumerate() {
        let call_args = hof_args(
            func,
            vec![item.clone(), Value::from(i), whole.clone()],
        );
        let res = ev.apply(func, &call_args, &Value::Undefined, 0)?;
        if res.truthy() == Some(true) {
            out.push(item.clone());
        }
    }
    Ok(Value::sequence(out))
}

fn fn_reduce(ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let arr = args[0].clone().arrayify();
    let func = &args[1];
    if matches!(arity(func), Some(n) if n < 2) {
        return Err(Error::ReduceBadFunction);
    }
    let init = args.get(2).cloned().unwrap_or(Value::Undefined);
    let whole = Value::array(arr.clone());

    let (mut acc, start) = if init.is_undefined() {
        match arr.first() {
            Some(first) => (first.clone(), 1),
            None => return Ok(Value::Undefined),
        }
    } else {
        (init, 0)
    };
    for (i, item) in arr.iter().enumerate().skip(start) {
        let mut call_args = vec![acc, item.clone()];
        if let Some(n) = arity(func) {
            if n >= 3 {
                call_args.push(Value::from(i));
            }
            if n >= 4 {
                call_args.push(whole.clone());
            }
        }
        acc = ev.apply(func, &call_args, &Value::Undefined, 0)?;
    }
    Ok(acc)
}

fn fn_single(ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let arr = args[0].clone().arrayify();
    let func = args.get(1).cloned().unwrap_or(Value::Undefined);
    let whole = Value::array(arr.clone());
    let mut found: Option<Value> = None;
    for (i, item) in arr.iter().enumerate() {
        let matched = if func.is_undefined() {
            true
        } else {
            let call_args = hof_args(
                &func,
                vec![item.clone(), Value::from(i), whole.clone()],
            );
            ev.apply(&func, &call_args, &Value::Undefined, 0)?.truthy() == Some(true)
        };
        if matched {
            if found.is_some() {
                return Err(Error::SingleMultipleMatches);
            }
            found = Some(item.clone());
        }
    }
    found.ok_or(Error::SingleNoMatch)
}

fn fn_sift(ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let entries = match args[0].entries() {
        Some(map) => map.clone(),
        None => return Ok(Value::Undefined),
    };
    let func = &args[1];
    let whole = args[0].clone();
    let mut out = IndexMap::new();
    for (key, value) in entries {
        let call_args = hof_args(
            func,
            vec![value.clone(), Value::string(key.as_str()), whole.clone()],
        );
        if ev.apply(func, &call_args, &Value::Undefined, 0)?.truthy() == Some(true) {
            out.insert(key, value);
        }
    }
    if out.is_empty() {
        return Ok(Value::Undefined);
    }
    Ok(Value::object(out))
}

fn fn_each(ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let entries = match args[0].entries() {
        Some(map) => map.clone(),
        None => return Ok(Value::Undefined),
    };
    let func = &args[1];
    let mut out = Vec::new();
    for (key, value) in entries {
        let call_args = hof_args(func, vec![value, Value::string(key.as_str())]);
        let res = ev.apply(func, &call_args, &Value::Undefined, 0)?;
        if !res.is_undefined() {
            out.push(res);
        }
    }
    Ok(Value::sequence(out))
}

fn fn_sort(ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let arr = args[0].clone().arrayify();
    if arr.len() <= 1 {
        return Ok(Value::array(arr));
    }
    let comparator = args.get(1).cloned().unwrap_or(Value::Undefined);
    let sorted = if comparator.is_undefined() {
        let all_numbers = arr.iter().all(Value::is_number);
        let all_strings = arr.iter().all(Value::is_string);
        if !all_numbers && !all_strings {
            return Err(Error::SortNotComparable);
        }
        merge_sort(arr, &mut |a, b| {
            Ok(match (a, b) {
                (Value::Number(x), Value::Number(y)) => x > y,
                (Value::String(x), Value::String(y)) => x > y,
                _ => false,
            })
        })?
    } else {
        merge_sort(arr, &mut |a, b| {
            let swap = ev.apply(
                &comparator,
                &[a.clone(), b.clone()],
                &Value::Undefined,
                0,
            )?;
            Ok(swap.truthy() == Some(true))
        })?
    };
    Ok(Value::array(sorted))
}

// ── sequence and object functions ────────────────────────────────────────────

fn fn_exists(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    Ok(Value::Bool(!args[0].is_undefined()))
}

fn fn_count(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let count = match &args[0] {
        Value::Undefined => 0,
        Value::Array(items, _) => items.len(),
        _ => 1,
    };
    Ok(Value::from(count))
}

fn fn_append(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    Ok(append(args[0].clone(), args[1].clone()))
}

fn fn_keys(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Object(map) => Ok(Value::sequence(
            map.keys().map(|k| Value::string(k.as_str())).collect(),
        )),
        Value::Array(items, _) => {
            // union of the keys of every element, first-seen order
            let mut keys = IndexSet::new();
            for item in items.iter() {
                if let Some(map) = item.entries() {
                    for k in map.keys() {
                        keys.insert(k.clone());
                    }
                }
            }
            Ok(Value::sequence(
                keys.into_iter().map(Value::string).collect(),
            ))
        }
        _ => Ok(Value::Undefined),
    }
}

fn fn_lookup(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let key = match args[1].as_str() {
        Some(key) => key,
        None => return Ok(Value::Undefined),
    };
    Ok(evaluator::lookup_name(&args[0], key))
}

// ── casts and checks ─────────────────────────────────────────────────────────

fn fn_string(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let value = &args[0];
    if value.is_undefined() {
        return Ok(Value::Undefined);
    }
    let prettify = args.get(1).map(|v| v == &Value::Bool(true)).unwrap_or(false);
    if prettify && !value.is_string() && !value.is_function() {
        let rendered = value
            .to_json_string_pretty()
            .map_err(|e| Error::FunctionFailed {
                name: "string".to_string(),
                message: e.to_string(),
            })?;
        return Ok(Value::string(rendered));
    }
    Ok(Value::string(stringify(value)))
}

fn fn_number(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Undefined => Ok(Value::Undefined),
        Value::Number(n) => Ok(Value::Number(*n)),
        Value::Bool(b) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Value::Number(n)),
            _ => Err(Error::CastToNumberFailed {
                value: s.to_string(),
            }),
        },
        other => Err(Error::CastToNumberFailed {
            value: other.to_string(),
        }),
    }
}

fn fn_boolean(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    match args[0].truthy() {
        Some(b) => Ok(Value::Bool(b)),
        None => Ok(Value::Undefined),
    }
}

fn fn_not(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    match args[0].truthy() {
        Some(b) => Ok(Value::Bool(!b)),
        None => Ok(Value::Undefined),
    }
}

fn fn_type(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let name = match &args[0] {
        Value::Undefined => return Ok(Value::Undefined),
        Value::Null => "null",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Array(..) => "array",
        Value::Object(_) => "object",
        Value::Lambda(_) | Value::Native(_) | Value::Thunk(_) | Value::Regex(_) => "function",
    };
    Ok(Value::string(name))
}

fn fn_error(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    let message = match args.first().and_then(Value::as_str) {
        Some(m) => m.to_string(),
        None => "$error() function evaluated".to_string(),
    };
    Err(Error::UserError { message })
}

fn fn_assert(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    if args[0] == Value::Bool(false) {
        let message = match args.get(1).and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => "$assert() statement failed".to_string(),
        };
        return Err(Error::AssertFailed { message });
    }
    Ok(Value::Undefined)
}

fn fn_clone(_ev: &mut Evaluator, _context: &Value, args: &[Value]) -> Result<Value> {
    Ok(args[0].deep_clone())
}

// ── time ─────────────────────────────────────────────────────────────────────

fn fn_now(ev: &mut Evaluator, _context: &Value, _args: &[Value]) -> Result<Value> {
    Ok(Value::string(
        ev.timestamp().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
    ))
}

fn fn_millis(ev: &mut Evaluator, _context: &Value, _args: &[Value]) -> Result<Value> {
    Ok(Value::Number(ev.timestamp().timestamp_millis() as f64))
}

// ── shared helpers ───────────────────────────────────────────────────────────

/// Render a value for string contexts: strings pass through unquoted,
/// functions render empty, everything else serializes as JSON.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Undefined => String::new(),
        Value::String(s) => s.to_string(),
        Value::Lambda(_) | Value::Native(_) | Value::Thunk(_) | Value::Regex(_) => String::new(),
        other => other.to_string(),
    }
}

/// Stable merge sort; `after` answers whether the left value must come
/// after the right one, and may fail (user comparators, mixed sort keys).
pub(crate) fn merge_sort<F>(mut items: Vec<Value>, after: &mut F) -> Result<Vec<Value>>
where
    F: FnMut(&Value, &Value) -> Result<bool>,
{
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, after)?;
    let right = merge_sort(right, after)?;

    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut li = 0;
    let mut ri = 0;
    while li < left.len() && ri < right.len() {
        if after(&left[li], &right[ri])? {
            out.push(right[ri].clone());
            ri += 1;
        } else {
            out.push(left[li].clone());
            li += 1;
        }
    }
    out.extend(left[li..].iter().cloned());
    out.extend(right[ri..].iter().cloned());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sort_is_stable() {
        // equal keys keep their original relative order
        let items = vec![
            Value::from(2.0),
            Value::from(1.0),
            Value::from(2.0),
            Value::from(1.0),
        ];
        let sorted = merge_sort(items, &mut |a, b| {
            Ok(a.as_f64().unwrap() > b.as_f64().unwrap())
        })
        .unwrap();
        let nums: Vec<f64> = sorted.iter().filter_map(Value::as_f64).collect();
        assert_eq!(nums, vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_stringify_shapes() {
        assert_eq!(stringify(&Value::string("hi")), "hi");
        assert_eq!(stringify(&Value::from(5.0)), "5");
        assert_eq!(stringify(&Value::Undefined), "");
        assert_eq!(stringify(&Value::Bool(true)), "true");
    }
}
