// Pratt parser producing the raw AST.
//
// Every operator has a left-binding-power; tokens that can start an
// expression have a prefix rule (nud) and infix operators have an infix
// rule (led). The normalizer later folds the raw path operators into Path
// nodes; this module is purely about grammar.

use std::sync::Arc;

use crate::ast::{BinaryOp, Node, NodeKind, SortTerm};
use crate::errors::{Error, Result};
use crate::signature::Signature;
use crate::tokenizer::{Token, TokenKind, Tokenizer};

/// Left-binding-powers. Tokens listed here but lacking an infix rule
/// (`|`, `**`, `;`, `:`, `,`) never actually bind; the parser gates on the
/// existence of a led.
fn binding_power(op: &str) -> u32 {
    match op {
        "." => 75,
        "[" | "{" | "(" | "@" | "#" | ";" | ":" => 80,
        "," => 0,
        "?" | "|" | ".." => 20,
        "+" | "-" | "&" => 50,
        "*" | "/" | "%" | "**" => 60,
        "=" | "<" | ">" | "!=" | "<=" | ">=" | "^" | "in" | "~>" => 40,
        "and" => 30,
        "or" => 25,
        ":=" => 10,
        _ => 0,
    }
}

/// Whether an operator has an infix rule at all.
fn has_led(op: &str) -> bool {
    matches!(
        op,
        "." | "[" | "{" | "(" | "@" | "#" | "^" | "?" | "~>" | ":=" | ".." | "+" | "-" | "*"
            | "/" | "%" | "=" | "<" | ">" | "!=" | "<=" | ">=" | "&" | "and" | "or" | "in"
    )
}

fn infix_op(op: &str) -> Option<BinaryOp> {
    Some(match op {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Subtract,
        "*" => BinaryOp::Multiply,
        "/" => BinaryOp::Divide,
        "%" => BinaryOp::Modulo,
        "=" => BinaryOp::Equal,
        "!=" => BinaryOp::NotEqual,
        "<" => BinaryOp::Less,
        "<=" => BinaryOp::LessEqual,
        ">" => BinaryOp::Greater,
        ">=" => BinaryOp::GreaterEqual,
        "&" => BinaryOp::Concat,
        "and" => BinaryOp::And,
        "or" => BinaryOp::Or,
        "in" => BinaryOp::In,
        ".." => BinaryOp::Range,
        _ => return None,
    })
}

pub struct Parser {
    tokenizer: Tokenizer,
    token: Token,
    recover: bool,
    errors: Vec<Error>,
}

impl Parser {
    /// Parse to a raw AST, failing on the first syntax error.
    pub fn parse(source: &str) -> Result<Node> {
        let mut parser = Parser::new(source, false)?;
        let node = parser.expression(0)?;
        if parser.token.kind != TokenKind::End {
            return Err(Error::SyntaxError {
                token: token_text(&parser.token),
                position: parser.token.position,
            });
        }
        Ok(node)
    }

    /// Parse in recovery mode: syntax errors are collected and the failed
    /// region is replaced by an error sentinel, so callers can report every
    /// problem found before giving up.
    pub fn parse_with_recovery(source: &str) -> (Option<Node>, Vec<Error>) {
        let mut parser = match Parser::new(source, true) {
            Ok(p) => p,
            Err(e) => return (None, vec![e]),
        };
        let node = match parser.expression(0) {
            Ok(n) => Some(n),
            Err(e) => {
                parser.errors.push(e);
                None
            }
        };
        // keep parsing past the first expression so every broken region of
        // the input reports its own error, not just the first
        while parser.token.kind != TokenKind::End {
            if matches!(parser.token.op(), Some(";" | ")" | "]" | "}" | ",")) {
                if parser.advance(None, false).is_err() {
                    break;
                }
                continue;
            }
            let t = parser.token.clone();
            let before = parser.errors.len();
            match parser.expression(0) {
                Ok(_) => {}
                Err(e) => {
                    // an error escaping a recovering parse is lexical; the
                    // tokenizer cannot make progress past it
                    parser.errors.push(e);
                    break;
                }
            }
            if parser.errors.len() == before && before == 0 {
                parser.errors.push(Error::SyntaxError {
                    token: token_text(&t),
                    position: t.position,
                });
            }
        }
        (node, parser.errors)
    }

    fn new(source: &str, recover: bool) -> Result<Parser> {
        let mut tokenizer = Tokenizer::new(source);
        let token = tokenizer.next(false)?;
        Ok(Parser {
            tokenizer,
            token,
            recover,
            errors: Vec::new(),
        })
    }

    /// Consume the current token, optionally requiring it to be a specific
    /// operator; `infix` tells the lexer how to treat a following `/`.
    fn advance(&mut self, expected: Option<&str>, infix: bool) -> Result<()> {
        if let Some(id) = expected {
            if self.token.kind == TokenKind::End {
                return Err(Error::ExpectedTokenBeforeEnd {
                    expected: id.to_string(),
                });
            }
            if self.token.op() != Some(id) {
                return Err(Error::ExpectedToken {
                    expected: id.to_string(),
                    token: token_text(&self.token),
                    position: self.token.position,
                });
            }
        }
        self.token = self.tokenizer.next(infix)?;
        Ok(())
    }

    fn lbp(&self) -> u32 {
        match self.token.op() {
            Some(op) if has_led(op) => binding_power(op),
            _ => 0,
        }
    }

    /// The Pratt core.
    fn expression(&mut self, rbp: u32) -> Result<Node> {
        let t = self.token.clone();
        self.advance(None, true)?;
        let mut left = match self.nud(t) {
            Ok(node) => node,
            Err(e) => return self.recover_from(e),
        };
        while rbp < self.lbp() {
            let t = self.token.clone();
            self.advance(None, false)?;
            left = match self.led(t, left) {
                Ok(node) => node,
                Err(e) => return self.recover_from(e),
            };
        }
        Ok(left)
    }

    /// In recovery mode, record the error and stand an error sentinel in
    /// for the failed subexpression; parsing resumes at the current token,
    /// so later regions of the input still get parsed and reported.
    fn recover_from(&mut self, err: Error) -> Result<Node> {
        if !self.recover {
            return Err(err);
        }
        let position = err.position().unwrap_or(self.token.position);
        self.errors.push(err);
        Ok(Node::new(NodeKind::ErrorStub, position))
    }

    // ── prefix rules ─────────────────────────────────────────────────────

    fn nud(&mut self, t: Token) -> Result<Node> {
        let position = t.position;
        match t.kind {
            TokenKind::Str(s) => Ok(Node::new(NodeKind::Str(s), position)),
            TokenKind::Number(n) => Ok(Node::new(NodeKind::Number(n), position)),
            TokenKind::Bool(b) => Ok(Node::new(NodeKind::Bool(b), position)),
            TokenKind::Null => Ok(Node::new(NodeKind::Null, position)),
            TokenKind::Name(name) => Ok(Node::new(NodeKind::Name(name), position)),
            TokenKind::Variable(name) => Ok(Node::new(NodeKind::Variable(name), position)),
            TokenKind::Regex(pattern) => {
                let compiled = regex::Regex::new(&pattern).map_err(|e| Error::InvalidRegex {
                    position,
                    message: e.to_string(),
                })?;
                Ok(Node::new(NodeKind::Regex(Arc::new(compiled)), position))
            }
            TokenKind::End => Err(Error::ExpectedTokenBeforeEnd {
                expected: "(expression)".to_string(),
            }),
            TokenKind::Operator(op) => match op.as_str() {
                "-" => {
                    let expr = self.expression(70)?;
                    Ok(Node::new(NodeKind::Negate(Box::new(expr)), position))
                }
                "*" => Ok(Node::new(NodeKind::Wildcard, position)),
                "**" => Ok(Node::new(NodeKind::Descendant, position)),
                "%" => Ok(Node::new(NodeKind::ParentOp, position)),
                // these double as field names
                "and" | "or" | "in" => Ok(Node::new(NodeKind::Name(op), position)),
                "(" => self.parse_block(position),
                "[" => self.parse_array_ctor(position),
                "{" => {
                    let pairs = self.parse_pairs()?;
                    Ok(Node::new(NodeKind::ObjectCtor(pairs), position))
                }
                "|" => self.parse_transform(position),
                other => Err(Error::InvalidUnary {
                    token: other.to_string(),
                    position,
                }),
            },
        }
    }

    fn parse_block(&mut self, position: usize) -> Result<Node> {
        let mut exprs = Vec::new();
        if self.token.op() != Some(")") {
            loop {
                exprs.push(self.expression(0)?);
                if self.token.op() != Some(";") {
                    break;
                }
                self.advance(Some(";"), false)?;
            }
        }
        self.advance(Some(")"), true)?;
        Ok(Node::new(NodeKind::Block(exprs), position))
    }

    fn parse_array_ctor(&mut self, position: usize) -> Result<Node> {
        let mut items = Vec::new();
        if self.token.op() != Some("]") {
            loop {
                items.push(self.expression(0)?);
                if self.token.op() != Some(",") {
                    break;
                }
                self.advance(Some(","), false)?;
            }
        }
        self.advance(Some("]"), true)?;
        Ok(Node::new(NodeKind::ArrayCtor(items), position))
    }

    fn parse_pairs(&mut self) -> Result<Vec<(Node, Node)>> {
        let mut pairs = Vec::new();
        if self.token.op() != Some("}") {
            loop {
                let key = self.expression(0)?;
                self.advance(Some(":"), false)?;
                let value = self.expression(0)?;
                pairs.push((key, value));
                if self.token.op() != Some(",") {
                    break;
                }
                self.advance(Some(","), false)?;
            }
        }
        self.advance(Some("}"), true)?;
        Ok(pairs)
    }

    fn parse_transform(&mut self, position: usize) -> Result<Node> {
        let pattern = self.expression(0)?;
        self.advance(Some("|"), false)?;
        let update = self.expression(0)?;
        let delete = if self.token.op() == Some(",") {
            self.advance(Some(","), false)?;
            Some(Box::new(self.expression(0)?))
        } else {
            None
        };
        self.advance(Some("|"), true)?;
        Ok(Node::new(
            NodeKind::Transform {
                pattern: Box::new(pattern),
                update: Box::new(update),
                delete,
            },
            position,
        ))
    }

    // ── infix rules ──────────────────────────────────────────────────────

    fn led(&mut self, t: Token, left: Node) -> Result<Node> {
        let position = t.position;
        let op = match t.op() {
            Some(op) => op.to_string(),
            None => {
                return Err(Error::SyntaxError {
                    token: token_text(&t),
                    position,
                })
            }
        };
        if let Some(binop) = infix_op(&op) {
            let rhs = self.expression(binding_power(&op))?;
            return Ok(Node::new(
                NodeKind::Binary(binop, Box::new(left), Box::new(rhs)),
                position,
            ));
        }
        match op.as_str() {
            "." => {
                let rhs = self.expression(binding_power("."))?;
                Ok(Node::new(
                    NodeKind::PathOp(Box::new(left), Box::new(rhs)),
                    position,
                ))
            }
            ":=" => {
                let name = match &left.kind {
                    NodeKind::Variable(name) => name.clone(),
                    _ => {
                        return Err(Error::InvalidBindTarget {
                            position: left.position,
                        })
                    }
                };
                // right-associative
                let rhs = self.expression(binding_power(":=") - 1)?;
                Ok(Node::new(NodeKind::Bind(name, Box::new(rhs)), position))
            }
            "~>" => {
                let rhs = self.expression(binding_power("~>"))?;
                Ok(Node::new(
                    NodeKind::Apply(Box::new(left), Box::new(rhs)),
                    position,
                ))
            }
            "?" => {
                let then_branch = self.expression(0)?;
                let else_branch = if self.token.op() == Some(":") {
                    self.advance(Some(":"), false)?;
                    Some(Box::new(self.expression(0)?))
                } else {
                    None
                };
                Ok(Node::new(
                    NodeKind::Condition {
                        condition: Box::new(left),
                        then_branch: Box::new(then_branch),
                        else_branch,
                    },
                    position,
                ))
            }
            "(" => self.parse_call(left, position),
            "[" => {
                if self.token.op() == Some("]") {
                    // keep-array marker on the preceding step
                    self.advance(Some("]"), true)?;
                    let mut kept = left;
                    kept.keep_array = true;
                    Ok(kept)
                } else {
                    let filter = self.expression(0)?;
                    self.advance(Some("]"), true)?;
                    Ok(Node::new(
                        NodeKind::FilterOp(Box::new(left), Box::new(filter)),
                        position,
                    ))
                }
            }
            "{" => {
                let pairs = self.parse_pairs()?;
                Ok(Node::new(NodeKind::GroupOp(Box::new(left), pairs), position))
            }
            "^" => {
                self.advance(Some("("), false)?;
                let mut terms = Vec::new();
                loop {
                    let mut descending = false;
                    if self.token.op() == Some("<") {
                        self.advance(Some("<"), false)?;
                    } else if self.token.op() == Some(">") {
                        descending = true;
                        self.advance(Some(">"), false)?;
                    }
                    let expr = self.expression(0)?;
                    terms.push(SortTerm { expr, descending });
                    if self.token.op() != Some(",") {
                        break;
                    }
                    self.advance(Some(","), false)?;
                }
                self.advance(Some(")"), true)?;
                Ok(Node::new(NodeKind::SortOp(Box::new(left), terms), position))
            }
            "@" | "#" => {
                let rhs = self.expression(binding_power(&op))?;
                let name = match rhs.kind {
                    NodeKind::Variable(name) => name,
                    _ => {
                        return Err(Error::InvalidBinderTarget {
                            token: op,
                            position: rhs.position,
                        })
                    }
                };
                let kind = if op == "@" {
                    NodeKind::FocusOp(Box::new(left), name)
                } else {
                    NodeKind::IndexOp(Box::new(left), name)
                };
                Ok(Node::new(kind, position))
            }
            other => Err(Error::SyntaxError {
                token: other.to_string(),
                position,
            }),
        }
    }

    /// `left(...)`: a call, a partial application if any argument is a bare
    /// `?`, or a lambda definition when the callee is the literal name
    /// `function` / `λ`.
    fn parse_call(&mut self, left: Node, position: usize) -> Result<Node> {
        let mut args = Vec::new();
        let mut partial = false;
        if self.token.op() != Some(")") {
            loop {
                if self.token.op() == Some("?") {
                    partial = true;
                    args.push(Node::new(NodeKind::Placeholder, self.token.position));
                    self.advance(Some("?"), false)?;
                } else {
                    args.push(self.expression(0)?);
                }
                if self.token.op() != Some(",") {
                    break;
                }
                self.advance(Some(","), false)?;
            }
        }
        self.advance(Some(")"), true)?;

        let is_lambda_def = matches!(&left.kind,
            NodeKind::Name(name) if name == "function" || name == "\u{03BB}");
        if is_lambda_def {
            return self.parse_lambda_tail(args, position);
        }

        let kind = if partial {
            NodeKind::PartialCall {
                procedure: Box::new(left),
                args,
            }
        } else {
            NodeKind::FunctionCall {
                procedure: Box::new(left),
                args,
            }
        };
        Ok(Node::new(kind, position))
    }

    fn parse_lambda_tail(&mut self, args: Vec<Node>, position: usize) -> Result<Node> {
        let mut params = Vec::new();
        for arg in args {
            match arg.kind {
                NodeKind::Variable(name) => params.push(name),
                _ => {
                    return Err(Error::InvalidFunctionParam {
                        token: format!("{:?}", arg.kind),
                        position: arg.position,
                    })
                }
            }
        }
        let signature = if self.token.op() == Some("<") {
            // the rest of the signature text is captured verbatim from the
            // source, not tokenized
            let inner = self.tokenizer.capture_signature_rest()?;
            let sig = Signature::parse(&format!("<{}", inner))?;
            self.token = self.tokenizer.next(false)?;
            Some(sig)
        } else {
            None
        };
        self.advance(Some("{"), false)?;
        let body = self.expression(0)?;
        self.advance(Some("}"), true)?;
        Ok(Node::new(
            NodeKind::Lambda {
                params,
                signature,
                body: Arc::new(body),
                thunk: false,
            },
            position,
        ))
    }
}

fn token_text(t: &Token) -> String {
    match &t.kind {
        TokenKind::Operator(op) => op.clone(),
        TokenKind::Name(n) => n.clone(),
        TokenKind::Variable(v) => format!("${}", v),
        TokenKind::Str(s) => format!("\"{}\"", s),
        TokenKind::Number(n) => n.to_string(),
        TokenKind::Bool(b) => b.to_string(),
        TokenKind::Null => "null".to_string(),
        TokenKind::Regex(r) => format!("/{}/", r),
        TokenKind::End => "(end)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_shapes() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let node = Parser::parse("1 + 2 * 3").unwrap();
        match node.kind {
            NodeKind::Binary(BinaryOp::Add, _, rhs) => {
                assert!(matches!(rhs.kind, NodeKind::Binary(BinaryOp::Multiply, _, _)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_path_and_filter_raw_nodes() {
        let node = Parser::parse("a.b[0]").unwrap();
        match node.kind {
            NodeKind::FilterOp(lhs, _) => {
                assert!(matches!(lhs.kind, NodeKind::PathOp(_, _)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_keep_array_marker() {
        let node = Parser::parse("a[]").unwrap();
        assert!(node.keep_array);
        assert!(matches!(node.kind, NodeKind::Name(_)));
    }

    #[test]
    fn test_bind_is_right_associative() {
        let node = Parser::parse("$a := $b := 1").unwrap();
        match node.kind {
            NodeKind::Bind(name, rhs) => {
                assert_eq!(name, "a");
                assert!(matches!(rhs.kind, NodeKind::Bind(_, _)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_bind_target_must_be_variable() {
        let err = Parser::parse("a := 1").unwrap_err();
        assert_eq!(err.code(), "S0212");
    }

    #[test]
    fn test_lambda_with_signature() {
        let node = Parser::parse("function($x, $y)<nn:n>{ $x + $y }").unwrap();
        match node.kind {
            NodeKind::Lambda {
                params, signature, ..
            } => {
                assert_eq!(params, vec!["x".to_string(), "y".to_string()]);
                assert!(signature.is_some());
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_lambda_param_must_be_variable() {
        let err = Parser::parse("function(x){ x }").unwrap_err();
        assert_eq!(err.code(), "S0208");
    }

    #[test]
    fn test_partial_application_placeholder() {
        let node = Parser::parse("$substring(?, 0, 5)").unwrap();
        match node.kind {
            NodeKind::PartialCall { args, .. } => {
                assert!(matches!(args[0].kind, NodeKind::Placeholder));
                assert_eq!(args.len(), 3);
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_ternary_and_range() {
        let node = Parser::parse("a > 1 ? [1..3] : []").unwrap();
        assert!(matches!(node.kind, NodeKind::Condition { .. }));
        let node = Parser::parse("[1..3]").unwrap();
        match node.kind {
            NodeKind::ArrayCtor(items) => {
                assert!(matches!(items[0].kind, NodeKind::Binary(BinaryOp::Range, _, _)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_range_is_an_infix_operator() {
        // ranges are legal anywhere an expression is, not just inside
        // array constructors
        let node = Parser::parse("5..1").unwrap();
        assert!(matches!(node.kind, NodeKind::Binary(BinaryOp::Range, _, _)));

        let node = Parser::parse("(0..9999999)").unwrap();
        match node.kind {
            NodeKind::Block(exprs) => {
                assert!(matches!(exprs[0].kind, NodeKind::Binary(BinaryOp::Range, _, _)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }

        // arithmetic binds tighter than the range bounds
        let node = Parser::parse("[1..2+3]").unwrap();
        match node.kind {
            NodeKind::ArrayCtor(items) => match &items[0].kind {
                NodeKind::Binary(BinaryOp::Range, _, rhs) => {
                    assert!(matches!(rhs.kind, NodeKind::Binary(BinaryOp::Add, _, _)));
                }
                other => panic!("unexpected shape: {:?}", other),
            },
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_sort_terms() {
        let node = Parser::parse("Product^(>Price, Name)").unwrap();
        match node.kind {
            NodeKind::SortOp(_, terms) => {
                assert_eq!(terms.len(), 2);
                assert!(terms[0].descending);
                assert!(!terms[1].descending);
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_focus_and_index_binders() {
        let node = Parser::parse("a@$item").unwrap();
        assert!(matches!(node.kind, NodeKind::FocusOp(_, _)));
        let err = Parser::parse("a@b").unwrap_err();
        assert_eq!(err.code(), "S0214");
        let err = Parser::parse("a#3").unwrap_err();
        assert_eq!(err.code(), "S0214");
    }

    #[test]
    fn test_transform_form() {
        let node = Parser::parse("|Address|{'City': 'X'}, ['Phone']|").unwrap();
        match node.kind {
            NodeKind::Transform { delete, .. } => assert!(delete.is_some()),
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_keywords_as_field_names() {
        let node = Parser::parse("a.and").unwrap();
        match node.kind {
            NodeKind::PathOp(_, rhs) => {
                assert!(matches!(rhs.kind, NodeKind::Name(ref n) if n == "and"));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_end_and_token() {
        assert_eq!(Parser::parse("1 +").unwrap_err().code(), "S0203");
        assert_eq!(Parser::parse("(1").unwrap_err().code(), "S0203");
        assert_eq!(Parser::parse("1 2").unwrap_err().code(), "S0201");
        assert_eq!(Parser::parse("~ 1").unwrap_err().code(), "S0211");
    }

    #[test]
    fn test_recovery_collects_errors() {
        let (node, errors) = Parser::parse_with_recovery("$x := ; $y := 2");
        assert!(node.is_some());
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| e.code().starts_with('S')));
    }

    #[test]
    fn test_recovery_reports_each_failed_region() {
        // three bindings, three missing right-hand sides
        let (node, errors) = Parser::parse_with_recovery("$x := ; $y := ; $z := ");
        assert!(node.is_some());
        assert_eq!(errors.len(), 3);

        // a valid expression followed by trailing garbage still reports
        let (_, errors) = Parser::parse_with_recovery("1 2");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), "S0201");
    }

    #[test]
    fn test_regex_literal_in_operand_position() {
        let node = Parser::parse("$match(name, /ab+c/i)").unwrap();
        match node.kind {
            NodeKind::FunctionCall { args, .. } => {
                assert!(matches!(args[1].kind, NodeKind::Regex(_)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }
}
