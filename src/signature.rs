// Function signature mini-language.
//
// A signature is written `<params:return>` where each param is a type
// letter (b boolean, n number, s string, l null, a array, o object,
// f function, j any JSON, x anything), an optional sub-type in angle
// brackets on `a`/`f`, a union in parentheses like `(sao)`, and an
// optional modifier: `+` one-or-more, `?` optional, `-` context-splice.
// The return type after `:` is parsed but not enforced.

use std::fmt;

use crate::errors::{Error, Result};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    Bool,
    Number,
    Str,
    Null,
    Object,
    Function,
    /// `a` or `a<...>`: the element type, if given, is checked per item.
    Array(Option<Box<TypeSpec>>),
    /// `j`: any non-function value.
    Json,
    /// `x`: anything, functions included.
    Any,
    /// `(sao)` style alternatives.
    Union(Vec<TypeSpec>),
}

impl TypeSpec {
    fn matches(&self, value: &Value) -> bool {
        // undefined satisfies every parameter type; builtins decide
        // whether to propagate it
        if value.is_undefined() {
            return true;
        }
        match self {
            TypeSpec::Bool => matches!(value, Value::Bool(_)),
            TypeSpec::Number => value.is_number(),
            TypeSpec::Str => value.is_string(),
            TypeSpec::Null => value.is_null(),
            TypeSpec::Object => value.is_object(),
            TypeSpec::Function => value.is_function(),
            TypeSpec::Array(elem) => match value.items() {
                Some(items) => match elem {
                    Some(t) => items.iter().all(|v| t.matches(v)),
                    None => true,
                },
                None => false,
            },
            TypeSpec::Json => !value.is_function(),
            TypeSpec::Any => true,
            TypeSpec::Union(alts) => alts.iter().any(|t| t.matches(value)),
        }
    }

    /// Whether a non-array argument may be boxed into a singleton array to
    /// satisfy this parameter.
    fn accepts_boxed(&self, value: &Value) -> bool {
        match self {
            TypeSpec::Array(elem) => match elem {
                Some(t) => t.matches(value),
                None => true,
            },
            TypeSpec::Union(alts) => alts.iter().any(|t| t.accepts_boxed(value)),
            _ => false,
        }
    }

    fn is_array(&self) -> bool {
        matches!(self, TypeSpec::Array(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub spec: TypeSpec,
    pub one_or_more: bool,
    pub optional: bool,
    pub context: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    source: String,
    params: Vec<Param>,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl Signature {
    /// Parse a signature string, with or without the surrounding `<>`.
    pub fn parse(source: &str) -> Result<Signature> {
        let inner = source
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(source);
        let chars: Vec<char> = inner.chars().collect();
        let mut params = Vec::new();
        let mut pos = 0;
        while pos < chars.len() {
            if chars[pos] == ':' {
                // return type; parsed for validity, never enforced
                pos += 1;
                parse_type(&chars, &mut pos)?;
                break;
            }
            let spec = parse_type(&chars, &mut pos)?;
            let mut param = Param {
                spec,
                one_or_more: false,
                optional: false,
                context: false,
            };
            while pos < chars.len() {
                match chars[pos] {
                    '+' => param.one_or_more = true,
                    '?' => param.optional = true,
                    '-' => param.context = true,
                    _ => break,
                }
                pos += 1;
            }
            params.push(param);
        }
        Ok(Signature {
            source: source.to_string(),
            params,
        })
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Validate `args` against this signature, splicing in the evaluation
    /// context where a `-` parameter allows it. Returns the effective
    /// argument list (context spliced, singletons boxed for array params).
    pub fn validate(&self, name: &str, args: &[Value], context: &Value) -> Result<Vec<Value>> {
        let mut supplied: Vec<Value> = args.to_vec();

        // context splice: a `-` parameter stands in for a missing argument
        if supplied.len() < self.params.len() && !context.is_undefined() {
            if let Some(idx) = self.params.iter().position(|p| p.context) {
                if idx <= supplied.len() {
                    supplied.insert(idx, context.clone());
                }
            }
        }

        let mut out = Vec::with_capacity(supplied.len());
        let mut ai = 0usize;
        for (pi, param) in self.params.iter().enumerate() {
            if param.one_or_more {
                if ai >= supplied.len() {
                    return Err(Error::ArgumentMismatch {
                        name: name.to_string(),
                        index: pi + 1,
                    });
                }
                let mut consumed = 0;
                while ai < supplied.len() && check_one(&param.spec, &supplied[ai]) {
                    out.push(coerce(&param.spec, supplied[ai].clone()));
                    ai += 1;
                    consumed += 1;
                }
                if consumed == 0 {
                    return Err(Error::ArgumentMismatch {
                        name: name.to_string(),
                        index: ai + 1,
                    });
                }
                continue;
            }
            if ai >= supplied.len() {
                if param.optional {
                    continue;
                }
                // missing trailing argument: treated as undefined
                out.push(Value::Undefined);
                continue;
            }
            let arg = &supplied[ai];
            if check_one(&param.spec, arg) {
                out.push(coerce(&param.spec, arg.clone()));
                ai += 1;
            } else if param.optional {
                // optional param not satisfied; leave the arg for the next
                out.push(Value::Undefined);
            } else {
                return Err(Error::ArgumentMismatch {
                    name: name.to_string(),
                    index: ai + 1,
                });
            }
        }
        if ai < supplied.len() {
            // surplus arguments are passed through unchecked
            out.extend(supplied[ai..].iter().cloned());
        }
        Ok(out)
    }
}

fn check_one(spec: &TypeSpec, value: &Value) -> bool {
    spec.matches(value)
        || ((spec.is_array() || matches!(spec, TypeSpec::Union(_))) && spec.accepts_boxed(value))
}

/// Box a matching non-array into a singleton when the param wants an array.
fn coerce(spec: &TypeSpec, value: Value) -> Value {
    if value.is_undefined() || value.is_array() {
        return value;
    }
    if spec.is_array() && spec.accepts_boxed(&value)
        || matches!(spec, TypeSpec::Union(_)) && !spec.matches(&value) && spec.accepts_boxed(&value)
    {
        Value::array(vec![value])
    } else {
        value
    }
}

fn parse_type(chars: &[char], pos: &mut usize) -> Result<TypeSpec> {
    let c = match chars.get(*pos) {
        Some(c) => *c,
        None => {
            return Err(Error::UnsupportedSignatureType {
                position: *pos,
                token: "<end>".to_string(),
            })
        }
    };
    *pos += 1;
    match c {
        'b' => Ok(TypeSpec::Bool),
        'n' => Ok(TypeSpec::Number),
        's' => Ok(TypeSpec::Str),
        'l' => Ok(TypeSpec::Null),
        'o' => Ok(TypeSpec::Object),
        'j' => Ok(TypeSpec::Json),
        'x' => Ok(TypeSpec::Any),
        'a' => {
            if chars.get(*pos) == Some(&'<') {
                *pos += 1;
                let elem = parse_type(chars, pos)?;
                expect_close(chars, pos)?;
                Ok(TypeSpec::Array(Some(Box::new(elem))))
            } else {
                Ok(TypeSpec::Array(None))
            }
        }
        'f' => {
            // sub-signature on a function param is accepted but not
            // enforced at call time
            if chars.get(*pos) == Some(&'<') {
                let mut depth = 1;
                *pos += 1;
                while *pos < chars.len() && depth > 0 {
                    match chars[*pos] {
                        '<' => depth += 1,
                        '>' => depth -= 1,
                        _ => {}
                    }
                    *pos += 1;
                }
                if depth > 0 {
                    return Err(Error::UnsupportedSignatureType {
                        position: *pos,
                        token: "<end>".to_string(),
                    });
                }
            }
            Ok(TypeSpec::Function)
        }
        '(' => {
            let mut alts = Vec::new();
            while chars.get(*pos).map_or(false, |c| *c != ')') {
                alts.push(parse_type(chars, pos)?);
            }
            if chars.get(*pos) != Some(&')') {
                return Err(Error::UnsupportedSignatureType {
                    position: *pos,
                    token: "<end>".to_string(),
                });
            }
            *pos += 1;
            Ok(TypeSpec::Union(alts))
        }
        other => Err(Error::UnsupportedSignatureType {
            position: *pos,
            token: other.to_string(),
        }),
    }
}

fn expect_close(chars: &[char], pos: &mut usize) -> Result<()> {
    if chars.get(*pos) == Some(&'>') {
        *pos += 1;
        Ok(())
    } else {
        Err(Error::UnsupportedSignatureType {
            position: *pos,
            token: "<end>".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shapes() {
        let sig = Signature::parse("<a<n>n?:a>").unwrap();
        assert_eq!(sig.params().len(), 2);
        assert_eq!(
            sig.params()[0].spec,
            TypeSpec::Array(Some(Box::new(TypeSpec::Number)))
        );
        assert!(sig.params()[1].optional);

        let sig = Signature::parse("<x-:s>").unwrap();
        assert!(sig.params()[0].context);

        let sig = Signature::parse("<(sao):o>").unwrap();
        assert!(matches!(sig.params()[0].spec, TypeSpec::Union(_)));

        assert!(Signature::parse("<q>").is_err());
    }

    #[test]
    fn test_validate_basic() {
        let sig = Signature::parse("<n-n:n>").unwrap();
        let out = sig
            .validate("power", &[Value::from(2i64), Value::from(3i64)], &Value::Undefined)
            .unwrap();
        assert_eq!(out, vec![Value::from(2i64), Value::from(3i64)]);

        let err = sig
            .validate("power", &[Value::from("x"), Value::from(3i64)], &Value::Undefined)
            .unwrap_err();
        assert_eq!(err.code(), "T0410");
    }

    #[test]
    fn test_context_splice() {
        let sig = Signature::parse("<n-n:n>").unwrap();
        // one argument short; the context fills the `-` parameter
        let out = sig
            .validate("power", &[Value::from(3i64)], &Value::from(2i64))
            .unwrap();
        assert_eq!(out, vec![Value::from(2i64), Value::from(3i64)]);
    }

    #[test]
    fn test_singleton_boxed_for_array_param() {
        let sig = Signature::parse("<a<n>:n>").unwrap();
        let out = sig
            .validate("sum", &[Value::from(5i64)], &Value::Undefined)
            .unwrap();
        assert_eq!(out, vec![Value::array(vec![Value::from(5i64)])]);

        let err = sig
            .validate("sum", &[Value::from("five")], &Value::Undefined)
            .unwrap_err();
        assert_eq!(err.code(), "T0410");
    }

    #[test]
    fn test_undefined_validates_everywhere() {
        let sig = Signature::parse("<n:n>").unwrap();
        let out = sig.validate("abs", &[Value::Undefined], &Value::Undefined).unwrap();
        assert_eq!(out, vec![Value::Undefined]);
    }

    #[test]
    fn test_one_or_more() {
        let sig = Signature::parse("<s+:s>").unwrap();
        let out = sig
            .validate(
                "join",
                &[Value::from("a"), Value::from("b")],
                &Value::Undefined,
            )
            .unwrap();
        assert_eq!(out.len(), 2);

        let err = sig.validate("join", &[], &Value::Undefined).unwrap_err();
        assert_eq!(err.code(), "T0410");
    }
}
