// Hand-written lexer for JSONata source text.
//
// The parser drives it one token at a time; the `infix` flag on `next`
// tells the lexer whether a `/` at the current position is a division
// operator or the start of a regex literal.

use crate::errors::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Punctuation and keyword operators (`and`, `or`, `in` included).
    Operator(String),
    /// A bare or back-quoted field name.
    Name(String),
    /// `$name`; the context reference `$` lexes as `Variable("")` and the
    /// root reference `$$` as `Variable("$")`.
    Variable(String),
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
    /// Regex literal body, inline flags already folded in.
    Regex(String),
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Source offset just past the token, matching error positions.
    pub position: usize,
}

impl Token {
    fn new(kind: TokenKind, position: usize) -> Token {
        Token { kind, position }
    }

    /// The operator string if this is an operator token.
    pub fn op(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Operator(op) => Some(op),
            _ => None,
        }
    }
}

const TWO_CHAR_OPS: [&str; 7] = ["..", ":=", "!=", ">=", "<=", "**", "~>"];
const SINGLE_CHAR_OPS: &str = ".[]{}()@#;,:?+-*/%|=<>^&!~";

pub struct Tokenizer {
    input: Vec<char>,
    position: usize,
}

impl Tokenizer {
    pub fn new(source: &str) -> Self {
        Tokenizer {
            input: source.chars().collect(),
            position: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    /// Skip whitespace and `/* ... */` comments.
    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.current() {
                Some(c) if c.is_whitespace() => self.position += 1,
                Some('/') if self.peek(1) == Some('*') => {
                    let start = self.position;
                    self.position += 2;
                    loop {
                        match self.current() {
                            Some('*') if self.peek(1) == Some('/') => {
                                self.position += 2;
                                break;
                            }
                            Some(_) => self.position += 1,
                            None => return Err(Error::UnterminatedComment { position: start }),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Next token, or `End` at end of input. When `infix` is true a `/`
    /// is the division operator; otherwise it starts a regex literal.
    pub fn next(&mut self, infix: bool) -> Result<Token> {
        self.skip_trivia()?;
        let c = match self.current() {
            Some(c) => c,
            None => return Ok(Token::new(TokenKind::End, self.position)),
        };

        if c == '/' && !infix {
            return self.scan_regex();
        }

        // greedy two-character operators first
        if let Some(next) = self.peek(1) {
            let pair: String = [c, next].iter().collect();
            if TWO_CHAR_OPS.contains(&pair.as_str()) {
                self.position += 2;
                return Ok(Token::new(TokenKind::Operator(pair), self.position));
            }
        }

        if SINGLE_CHAR_OPS.contains(c) {
            self.position += 1;
            return Ok(Token::new(TokenKind::Operator(c.to_string()), self.position));
        }

        match c {
            '"' | '\'' => self.scan_string(c),
            '`' => self.scan_quoted_name(),
            '$' => self.scan_variable(),
            '0'..='9' => self.scan_number(),
            c if is_name_start(c) => Ok(self.scan_name()),
            other => Err(Error::UnknownOperator {
                token: other.to_string(),
                position: self.position,
            }),
        }
    }

    /// Capture the remainder of a `<...>` signature verbatim, starting just
    /// past the opening `<` (already consumed as a lookahead token). Returns
    /// the text up to and including the matching `>`.
    pub fn capture_signature_rest(&mut self) -> Result<String> {
        let mut depth = 1usize;
        let mut text = String::new();
        loop {
            match self.current() {
                Some(c) => {
                    self.position += 1;
                    if c == '<' {
                        depth += 1;
                    } else if c == '>' {
                        depth -= 1;
                    }
                    text.push(c);
                    if depth == 0 {
                        return Ok(text);
                    }
                }
                None => {
                    return Err(Error::SyntaxError {
                        token: "(end)".to_string(),
                        position: self.position,
                    })
                }
            }
        }
    }

    fn scan_regex(&mut self) -> Result<Token> {
        let start = self.position;
        self.position += 1; // opening '/'
        let mut body = String::new();
        let mut depth = 0usize;
        loop {
            match self.current() {
                Some('\\') => {
                    body.push('\\');
                    self.position += 1;
                    if let Some(c) = self.current() {
                        body.push(c);
                        self.position += 1;
                    }
                }
                Some(c @ ('(' | '[' | '{')) => {
                    depth += 1;
                    body.push(c);
                    self.position += 1;
                }
                Some(c @ (')' | ']' | '}')) => {
                    depth = depth.saturating_sub(1);
                    body.push(c);
                    self.position += 1;
                }
                Some('/') if depth == 0 => {
                    self.position += 1;
                    break;
                }
                Some(c) => {
                    body.push(c);
                    self.position += 1;
                }
                None => return Err(Error::UnterminatedRegex { position: start }),
            }
        }
        if body.is_empty() {
            return Err(Error::EmptyRegex { position: start });
        }
        let mut flags = String::new();
        while let Some(c @ ('i' | 'm' | 's')) = self.current() {
            flags.push(c);
            self.position += 1;
        }
        let pattern = if flags.is_empty() {
            body
        } else {
            format!("(?{}){}", flags, body)
        };
        Ok(Token::new(TokenKind::Regex(pattern), self.position))
    }

    fn scan_string(&mut self, quote: char) -> Result<Token> {
        let start = self.position;
        self.position += 1;
        let mut s = String::new();
        loop {
            match self.current() {
                Some(c) if c == quote => {
                    self.position += 1;
                    return Ok(Token::new(TokenKind::Str(s), self.position));
                }
                Some('\\') => {
                    self.position += 1;
                    match self.current() {
                        Some('"') => s.push('"'),
                        Some('\'') => s.push('\''),
                        Some('\\') => s.push('\\'),
                        Some('/') => s.push('/'),
                        Some('b') => s.push('\u{0008}'),
                        Some('f') => s.push('\u{000C}'),
                        Some('n') => s.push('\n'),
                        Some('r') => s.push('\r'),
                        Some('t') => s.push('\t'),
                        Some('u') => {
                            self.position += 1;
                            let cp = self.scan_hex4()?;
                            // surrogate pairs arrive as two \u escapes
                            let ch = if (0xD800..0xDC00).contains(&cp)
                                && self.current() == Some('\\')
                                && self.peek(1) == Some('u')
                            {
                                self.position += 2;
                                let low = self.scan_hex4()?;
                                let combined =
                                    0x10000 + ((cp - 0xD800) << 10) + (low - 0xDC00);
                                char::from_u32(combined).unwrap_or('\u{FFFD}')
                            } else {
                                char::from_u32(cp).unwrap_or('\u{FFFD}')
                            };
                            s.push(ch);
                            continue;
                        }
                        Some(other) => {
                            return Err(Error::UnsupportedEscape {
                                escape: other,
                                position: self.position,
                            })
                        }
                        None => return Err(Error::UnterminatedString { position: start }),
                    }
                    self.position += 1;
                }
                Some(c) => {
                    s.push(c);
                    self.position += 1;
                }
                None => return Err(Error::UnterminatedString { position: start }),
            }
        }
    }

    fn scan_hex4(&mut self) -> Result<u32> {
        let mut cp = 0u32;
        for _ in 0..4 {
            let d = self
                .current()
                .and_then(|c| c.to_digit(16))
                .ok_or(Error::InvalidUnicodeEscape {
                    position: self.position,
                })?;
            cp = cp * 16 + d;
            self.position += 1;
        }
        Ok(cp)
    }

    fn scan_quoted_name(&mut self) -> Result<Token> {
        let start = self.position;
        self.position += 1;
        let mut name = String::new();
        loop {
            match self.current() {
                Some('`') => {
                    self.position += 1;
                    return Ok(Token::new(TokenKind::Name(name), self.position));
                }
                Some(c) => {
                    name.push(c);
                    self.position += 1;
                }
                None => return Err(Error::UnterminatedQuotedName { position: start }),
            }
        }
    }

    fn scan_variable(&mut self) -> Result<Token> {
        self.position += 1;
        if self.current() == Some('$') {
            self.position += 1;
            return Ok(Token::new(
                TokenKind::Variable("$".to_string()),
                self.position,
            ));
        }
        let mut name = String::new();
        while let Some(c) = self.current() {
            if is_name_continue(c) {
                name.push(c);
                self.position += 1;
            } else {
                break;
            }
        }
        Ok(Token::new(TokenKind::Variable(name), self.position))
    }

    fn scan_number(&mut self) -> Result<Token> {
        let start = self.position;
        // a leading zero is only valid on its own or before a fraction
        if self.current() == Some('0') && matches!(self.peek(1), Some('0'..='9')) {
            while matches!(self.current(), Some('0'..='9')) {
                self.position += 1;
            }
            let text: String = self.input[start..self.position].iter().collect();
            return Err(Error::NumberOutOfRange {
                token: text,
                position: start,
            });
        }
        while matches!(self.current(), Some('0'..='9')) {
            self.position += 1;
        }
        if self.current() == Some('.') && matches!(self.peek(1), Some('0'..='9')) {
            self.position += 1;
            while matches!(self.current(), Some('0'..='9')) {
                self.position += 1;
            }
        }
        if matches!(self.current(), Some('e' | 'E')) {
            let mut ahead = 1;
            if matches!(self.peek(1), Some('+' | '-')) {
                ahead = 2;
            }
            if matches!(self.peek(ahead), Some('0'..='9')) {
                self.position += ahead;
                while matches!(self.current(), Some('0'..='9')) {
                    self.position += 1;
                }
            }
        }
        let text: String = self.input[start..self.position].iter().collect();
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(Token::new(TokenKind::Number(n), self.position)),
            _ => Err(Error::NumberOutOfRange {
                token: text,
                position: start,
            }),
        }
    }

    fn scan_name(&mut self) -> Token {
        let start = self.position;
        while let Some(c) = self.current() {
            if is_name_continue(c) {
                self.position += 1;
            } else {
                break;
            }
        }
        let name: String = self.input[start..self.position].iter().collect();
        let kind = match name.as_str() {
            "and" | "or" | "in" => TokenKind::Operator(name),
            "true" => TokenKind::Bool(true),
            "false" => TokenKind::Bool(false),
            "null" => TokenKind::Null,
            _ => TokenKind::Name(name),
        };
        Token::new(kind, self.position)
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || !c.is_ascii()
}

fn is_name_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || !c.is_ascii()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(source: &str) -> Vec<TokenKind> {
        let mut t = Tokenizer::new(source);
        let mut out = Vec::new();
        loop {
            let tok = t.next(true).unwrap();
            if tok.kind == TokenKind::End {
                return out;
            }
            out.push(tok.kind);
        }
    }

    #[test]
    fn test_two_char_operators_win() {
        assert_eq!(
            lex_all("a := 1 .. 2"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::Operator(":=".into()),
                TokenKind::Number(1.0),
                TokenKind::Operator("..".into()),
                TokenKind::Number(2.0),
            ]
        );
        assert_eq!(lex_all("~>")[0], TokenKind::Operator("~>".into()));
        assert_eq!(lex_all("**")[0], TokenKind::Operator("**".into()));
    }

    #[test]
    fn test_keywords_and_literals() {
        assert_eq!(
            lex_all("x and true or null"),
            vec![
                TokenKind::Name("x".into()),
                TokenKind::Operator("and".into()),
                TokenKind::Bool(true),
                TokenKind::Operator("or".into()),
                TokenKind::Null,
            ]
        );
    }

    #[test]
    fn test_variables() {
        assert_eq!(lex_all("$")[0], TokenKind::Variable("".into()));
        assert_eq!(lex_all("$$")[0], TokenKind::Variable("$".into()));
        assert_eq!(lex_all("$foo")[0], TokenKind::Variable("foo".into()));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            lex_all(r#""a\nbA""#)[0],
            TokenKind::Str("a\nbA".into())
        );
        // surrogate pair
        assert_eq!(
            lex_all(r#""😀""#)[0],
            TokenKind::Str("\u{1F600}".into())
        );
        let err = Tokenizer::new(r#""\x""#).next(true).unwrap_err();
        assert_eq!(err.code(), "S0103");
        let err = Tokenizer::new(r#""\u00g0""#).next(true).unwrap_err();
        assert_eq!(err.code(), "S0104");
        let err = Tokenizer::new(r#""open"#).next(true).unwrap_err();
        assert_eq!(err.code(), "S0101");
    }

    #[test]
    fn test_backquoted_names() {
        assert_eq!(
            lex_all("`Product Name`")[0],
            TokenKind::Name("Product Name".into())
        );
        let err = Tokenizer::new("`open").next(true).unwrap_err();
        assert_eq!(err.code(), "S0105");
    }

    #[test]
    fn test_comments_are_trivia() {
        assert_eq!(
            lex_all("1 /* skip * me */ + 2"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Operator("+".into()),
                TokenKind::Number(2.0),
            ]
        );
        let err = Tokenizer::new("1 /* open").next(true).unwrap_err();
        assert_eq!(err.code(), "S0106");
    }

    #[test]
    fn test_numbers() {
        assert_eq!(lex_all("3.14")[0], TokenKind::Number(3.14));
        assert_eq!(lex_all("1e3")[0], TokenKind::Number(1000.0));
        assert_eq!(lex_all("2.5e-1")[0], TokenKind::Number(0.25));
        let err = Tokenizer::new("1e999").next(true).unwrap_err();
        assert_eq!(err.code(), "S0102");
    }

    #[test]
    fn test_leading_zero_rejected() {
        let err = Tokenizer::new("007").next(true).unwrap_err();
        assert_eq!(err.code(), "S0102");
        // a lone zero and a zero-led fraction are still numbers
        assert_eq!(lex_all("0")[0], TokenKind::Number(0.0));
        assert_eq!(lex_all("0.5")[0], TokenKind::Number(0.5));
    }

    #[test]
    fn test_slash_mode_switch() {
        // infix position: division
        let mut t = Tokenizer::new("/");
        assert_eq!(t.next(true).unwrap().kind, TokenKind::Operator("/".into()));
        // prefix position: regex, with bracket depth tracking
        let mut t = Tokenizer::new("/a[/]b/i");
        match t.next(false).unwrap().kind {
            TokenKind::Regex(p) => assert_eq!(p, "(?i)a[/]b"),
            other => panic!("expected regex, got {:?}", other),
        }
        let err = Tokenizer::new("//").next(false).unwrap_err();
        assert_eq!(err.code(), "S0301");
        let err = Tokenizer::new("/a[bc/").next(false).unwrap_err();
        assert_eq!(err.code(), "S0302");
    }
}
