// Error taxonomy
// Every failure the compiler or evaluator can produce, with the stable
// JSONata error codes (S0xxx static, T/D evaluation, U1xxx resource).

use thiserror::Error;

/// All errors raised by compilation and evaluation.
///
/// Variants carry the source position (byte offset just past the offending
/// token) where one is available, so callers can point at the expression
/// text in diagnostics.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // ── Lexical ──────────────────────────────────────────────────────────
    #[error("S0101: String literal must be terminated by a matching quote @ {position}")]
    UnterminatedString { position: usize },

    #[error("S0102: Number out of range: {token} @ {position}")]
    NumberOutOfRange { position: usize, token: String },

    #[error("S0103: Unsupported escape sequence: \\{escape} @ {position}")]
    UnsupportedEscape { position: usize, escape: char },

    #[error("S0104: The escape sequence \\u must be followed by 4 hex digits @ {position}")]
    InvalidUnicodeEscape { position: usize },

    #[error("S0105: Quoted property name must be terminated with a backquote @ {position}")]
    UnterminatedQuotedName { position: usize },

    #[error("S0106: Comment has no closing tag @ {position}")]
    UnterminatedComment { position: usize },

    #[error("S0204: Unknown operator: {token} @ {position}")]
    UnknownOperator { position: usize, token: String },

    #[error("S0301: Empty regular expression @ {position}")]
    EmptyRegex { position: usize },

    #[error("S0302: No terminating / in regular expression @ {position}")]
    UnterminatedRegex { position: usize },

    #[error("S0303: Invalid regular expression: {message} @ {position}")]
    InvalidRegex { position: usize, message: String },

    // ── Syntax ───────────────────────────────────────────────────────────
    #[error("S0201: Syntax error: {token} @ {position}")]
    SyntaxError { position: usize, token: String },

    #[error("S0202: Expected {expected}, got {token} @ {position}")]
    ExpectedToken {
        position: usize,
        expected: String,
        token: String,
    },

    #[error("S0203: Expected {expected} before end of expression")]
    ExpectedTokenBeforeEnd { expected: String },

    #[error("S0208: Parameter {token} of function definition must be a variable name (start with $) @ {position}")]
    InvalidFunctionParam { position: usize, token: String },

    #[error("S0211: The symbol {token} cannot be used as a unary operator @ {position}")]
    InvalidUnary { position: usize, token: String },

    #[error("S0212: The left side of := must be a variable name (start with $) @ {position}")]
    InvalidBindTarget { position: usize },

    #[error("S0214: The right side of {token} must be a variable name (start with $) @ {position}")]
    InvalidBinderTarget { position: usize, token: String },

    // ── Static semantic ──────────────────────────────────────────────────
    #[error("S0209: A predicate cannot follow a grouping expression in a step @ {position}")]
    PredicateAfterGroup { position: usize },

    #[error("S0210: Each step can only have one grouping expression @ {position}")]
    MultipleGroupings { position: usize },

    #[error("S0213: The literal value {token} cannot be used as a step within a path expression @ {position}")]
    LiteralPathStep { position: usize, token: String },

    #[error("S0215: A context variable binding must precede any predicates on a step @ {position}")]
    BinderAfterPredicate { position: usize },

    #[error("S0216: A context variable binding must precede the 'order-by' clause on a step @ {position}")]
    BinderAfterSort { position: usize },

    #[error("S0217: The object representing the 'parent' cannot be derived from this expression @ {position}")]
    UnresolvedAncestor { position: usize },

    #[error("S0401: Type parameter {token} is not supported in a function signature @ {position}")]
    UnsupportedSignatureType { position: usize, token: String },

    #[error("S0500: Attempted to evaluate an expression containing syntax error(s)")]
    EvaluatedWithErrors,

    // ── Type ─────────────────────────────────────────────────────────────
    #[error("T0410: Argument {index} of function {name} does not match function signature")]
    ArgumentMismatch { name: String, index: usize },

    #[error("T1003: Key in object structure must evaluate to a string; got: {value} @ {position}")]
    NonStringKey { position: usize, value: String },

    #[error("T1005: Attempted to invoke a non-function. Did you mean ${name}? @ {position}")]
    InvokeNonFunctionSuggest { position: usize, name: String },

    #[error("T1006: Attempted to invoke a non-function @ {position}")]
    InvokeNonFunction { position: usize },

    #[error("T1007: Attempted to partially apply a non-function. Did you mean ${name}? @ {position}")]
    PartialNonFunctionSuggest { position: usize, name: String },

    #[error("T1008: Attempted to partially apply a non-function @ {position}")]
    PartialNonFunction { position: usize },

    #[error("T2001: The left side of the {op} operator must evaluate to a number @ {position}")]
    LhsNotNumber { position: usize, op: String },

    #[error("T2002: The right side of the {op} operator must evaluate to a number @ {position}")]
    RhsNotNumber { position: usize, op: String },

    #[error("T2003: The left side of the range operator (..) must evaluate to an integer @ {position}")]
    RangeLhsNotInteger { position: usize },

    #[error("T2004: The right side of the range operator (..) must evaluate to an integer @ {position}")]
    RangeRhsNotInteger { position: usize },

    #[error("T2006: The right side of the function application operator ~> must be a function @ {position}")]
    ApplyRhsNotFunction { position: usize },

    #[error("T2007: Type mismatch when comparing values {left} and {right} in order-by clause @ {position}")]
    SortTypeMismatch {
        position: usize,
        left: String,
        right: String,
    },

    #[error("T2008: The expressions within an order-by clause must evaluate to numeric or string values @ {position}")]
    NonComparableSortTerm { position: usize },

    #[error("T2009: The values {left} and {right} either side of operator {op} must be of the same data type @ {position}")]
    ComparisonTypeMismatch {
        position: usize,
        op: String,
        left: String,
        right: String,
    },

    #[error("T2010: The expressions either side of operator {op} must evaluate to numeric or string values @ {position}")]
    NotComparable { position: usize, op: String },

    #[error("T2011: The insert/update clause of the transform expression must evaluate to an object: {value} @ {position}")]
    TransformUpdateNotObject { position: usize, value: String },

    #[error("T2012: The delete clause of the transform expression must evaluate to a string or array of strings: {value} @ {position}")]
    TransformDeleteNotStrings { position: usize, value: String },

    #[error("D1009: Multiple key definitions evaluate to same key: {key} @ {position}")]
    DuplicateGroupKey { position: usize, key: String },

    // ── Dynamic ──────────────────────────────────────────────────────────
    #[error("D1001: Number out of range: {value}")]
    NumericOverflow { value: String },

    #[error("D1002: Cannot negate a non-numeric value: {value} @ {position}")]
    NegateNonNumber { position: usize, value: String },

    #[error("D2014: The size of the sequence allocated by the range operator (..) must not exceed 1e7 entries. Attempted to allocate {size} @ {position}")]
    RangeTooLarge { position: usize, size: u64 },

    #[error("D3030: Unable to cast value to a number: {value}")]
    CastToNumberFailed { value: String },

    #[error("D3050: The second argument of reduce function must be a function with at least two arguments")]
    ReduceBadFunction,

    #[error("D3070: The single argument form of the sort function can only be used on an array of strings or an array of numbers. Use the second argument to specify a comparison function")]
    SortNotComparable,

    #[error("D3137: {message}")]
    UserError { message: String },

    #[error("D3138: The $single() function expected exactly 1 matching result. Instead it matched more")]
    SingleMultipleMatches,

    #[error("D3139: The $single() function expected exactly 1 matching result. Instead it matched 0")]
    SingleNoMatch,

    #[error("D3141: {message}")]
    AssertFailed { message: String },

    #[error("D3121: Function {name} failed: {message}")]
    FunctionFailed { name: String, message: String },

    // ── Resource ─────────────────────────────────────────────────────────
    #[error("U1001: Stack overflow error: Check for non-terminating recursive function. Consider rewriting as tail-recursive")]
    StackOverflow,

    #[error("U1002: Expression evaluation timeout: Check for infinite loop")]
    Timeout,
}

impl Error {
    /// The stable error code ("S0101", "T2003", ...) for this error.
    ///
    /// Every message is rendered as "CODE: description", so the code is the
    /// leading token; kept in one place instead of a second full match.
    pub fn code(&self) -> String {
        let rendered = self.to_string();
        rendered.split(':').next().unwrap_or("").to_string()
    }

    /// Source position, where the error has one.
    pub fn position(&self) -> Option<usize> {
        use Error::*;
        match self {
            UnterminatedString { position }
            | NumberOutOfRange { position, .. }
            | UnsupportedEscape { position, .. }
            | InvalidUnicodeEscape { position }
            | UnterminatedQuotedName { position }
            | UnterminatedComment { position }
            | UnknownOperator { position, .. }
            | EmptyRegex { position }
            | UnterminatedRegex { position }
            | InvalidRegex { position, .. }
            | SyntaxError { position, .. }
            | ExpectedToken { position, .. }
            | InvalidFunctionParam { position, .. }
            | InvalidUnary { position, .. }
            | InvalidBindTarget { position }
            | InvalidBinderTarget { position, .. }
            | PredicateAfterGroup { position }
            | MultipleGroupings { position }
            | LiteralPathStep { position, .. }
            | BinderAfterPredicate { position }
            | BinderAfterSort { position }
            | UnresolvedAncestor { position }
            | UnsupportedSignatureType { position, .. }
            | NonStringKey { position, .. }
            | InvokeNonFunctionSuggest { position, .. }
            | InvokeNonFunction { position }
            | PartialNonFunctionSuggest { position, .. }
            | PartialNonFunction { position }
            | LhsNotNumber { position, .. }
            | RhsNotNumber { position, .. }
            | RangeLhsNotInteger { position }
            | RangeRhsNotInteger { position }
            | ApplyRhsNotFunction { position }
            | SortTypeMismatch { position, .. }
            | NonComparableSortTerm { position }
            | ComparisonTypeMismatch { position, .. }
            | NotComparable { position, .. }
            | TransformUpdateNotObject { position, .. }
            | TransformDeleteNotStrings { position, .. }
            | DuplicateGroupKey { position, .. }
            | NegateNonNumber { position, .. }
            | RangeTooLarge { position, .. } => Some(*position),
            _ => None,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_codes() {
        let e = Error::StackOverflow;
        assert!(e.to_string().starts_with("U1001:"));
        assert_eq!(e.code(), "U1001");

        let e = Error::RangeTooLarge {
            position: 7,
            size: 10_000_001,
        };
        assert!(e.to_string().starts_with("D2014:"));
        assert_eq!(e.position(), Some(7));
    }

    #[test]
    fn test_position_absent_for_resource_errors() {
        assert_eq!(Error::Timeout.position(), None);
        assert_eq!(Error::StackOverflow.position(), None);
    }
}
