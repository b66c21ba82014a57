//! Parser for the expression language accepted on the command line.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | power
//! power   := primary ('^' unary)?
//! primary := number | name | name '(' args ')' | '(' expr ')' | list
//! args    := (arg (',' arg)*)?
//! arg     := expr | name '=' expr
//! list    := '[' (int (',' int)*)? ']'
//! ```
//!
//! Keyword arguments must follow positional arguments.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Syntax tree of a parsed expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Ast {
    Number(f32),
    Name(String),
    /// Integer list literal, eg. `[0, -1]`.
    List(Vec<i32>),
    Neg(Box<Ast>),
    Binary {
        op: BinOp,
        lhs: Box<Ast>,
        rhs: Box<Ast>,
    },
    Call {
        name: String,
        args: Vec<Ast>,
        kwargs: Vec<(String, Ast)>,
    },
}

impl Ast {
    fn binary(op: BinOp, lhs: Ast, rhs: Ast) -> Ast {
        Ast::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Equals,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(num) => write!(f, "number {}", num),
            Token::Ident(name) => write!(f, "name \"{}\"", name),
            Token::Plus => write!(f, "'+'"),
            Token::Minus => write!(f, "'-'"),
            Token::Star => write!(f, "'*'"),
            Token::Slash => write!(f, "'/'"),
            Token::Caret => write!(f, "'^'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::Comma => write!(f, "','"),
            Token::Equals => write!(f, "'='"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParseErrorKind {
    UnexpectedChar(char),
    /// Found a token other than the one expected.
    UnexpectedToken { expected: &'static str, found: String },
    UnexpectedEnd { expected: &'static str },
    InvalidNumber(String),
    PositionalAfterKeyword,
}

/// Error when parsing an expression.
#[derive(Clone, Debug, PartialEq)]
pub struct ParseError {
    /// Byte offset in the expression where the error was found.
    pub offset: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    fn new(offset: usize, kind: ParseErrorKind) -> ParseError {
        ParseError { offset, kind }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syntax error at offset {}: ", self.offset)?;
        match &self.kind {
            ParseErrorKind::UnexpectedChar(ch) => write!(f, "unexpected character '{}'", ch),
            ParseErrorKind::UnexpectedToken { expected, found } => {
                write!(f, "expected {} but found {}", expected, found)
            }
            ParseErrorKind::UnexpectedEnd { expected } => {
                write!(f, "expected {} but reached the end", expected)
            }
            ParseErrorKind::InvalidNumber(num) => write!(f, "invalid number \"{}\"", num),
            ParseErrorKind::PositionalAfterKeyword => {
                write!(f, "positional argument follows keyword argument")
            }
        }
    }
}

impl std::error::Error for ParseError {}

fn tokenize(expr: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        let token = match ch {
            ch if ch.is_whitespace() => continue,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '^' => Token::Caret,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            '=' => Token::Equals,
            ch if ch.is_ascii_digit() || ch == '.' => {
                let mut num = ch.to_string();
                while let Some((_, next)) = chars.peek() {
                    let exponent_sign =
                        (*next == '-' || *next == '+') && num.ends_with(['e', 'E']);
                    if next.is_ascii_digit() || *next == '.' || *next == 'e' || *next == 'E' || exponent_sign
                    {
                        num.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                Token::Number(num)
            }
            ch if ch.is_alphabetic() || ch == '_' => {
                let mut name = ch.to_string();
                while let Some((_, next)) = chars.peek() {
                    if next.is_alphanumeric() || *next == '_' {
                        name.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                Token::Ident(name)
            }
            ch => return Err(ParseError::new(offset, ParseErrorKind::UnexpectedChar(ch))),
        };
        tokens.push((offset, token));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,

    /// Length of the input, used as the offset of errors at the end.
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, tok)| tok)
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(_, tok)| tok)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.end)
    }

    fn next(&mut self, expected: &'static str) -> Result<Token, ParseError> {
        match self.tokens.get(self.pos) {
            Some((_, tok)) => {
                self.pos += 1;
                Ok(tok.clone())
            }
            None => Err(ParseError::new(
                self.end,
                ParseErrorKind::UnexpectedEnd { expected },
            )),
        }
    }

    fn expect(&mut self, token: Token, expected: &'static str) -> Result<(), ParseError> {
        let offset = self.offset();
        let found = self.next(expected)?;
        if found != token {
            return Err(ParseError::new(
                offset,
                ParseErrorKind::UnexpectedToken {
                    expected,
                    found: found.to_string(),
                },
            ));
        }
        Ok(())
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Ast, ParseError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Ast::binary(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> Result<Ast, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Ast::binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Ast, ParseError> {
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Ast::Neg(Box::new(operand)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Ast, ParseError> {
        let base = self.primary()?;
        if self.eat(&Token::Caret) {
            // Right associative, and binds tighter than a unary minus on the
            // left, so `-x^2` is `-(x^2)`.
            let exponent = self.unary()?;
            return Ok(Ast::binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Ast, ParseError> {
        const EXPECTED: &str = "a number, name, '(' or '['";

        let offset = self.offset();
        match self.next(EXPECTED)? {
            Token::Number(num) => num
                .parse::<f32>()
                .map(Ast::Number)
                .map_err(|_| ParseError::new(offset, ParseErrorKind::InvalidNumber(num))),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    self.call(name)
                } else {
                    Ok(Ast::Name(name))
                }
            }
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => self.list(),
            tok => Err(ParseError::new(
                offset,
                ParseErrorKind::UnexpectedToken {
                    expected: EXPECTED,
                    found: tok.to_string(),
                },
            )),
        }
    }

    /// Parse the arguments of a call, after the opening parenthesis.
    fn call(&mut self, name: String) -> Result<Ast, ParseError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        if !self.eat(&Token::RParen) {
            loop {
                let is_keyword = matches!(
                    (self.peek(), self.peek_nth(1)),
                    (Some(Token::Ident(_)), Some(Token::Equals))
                );
                if is_keyword {
                    let Token::Ident(key) = self.next("keyword")? else {
                        unreachable!("keyword argument starts with a name");
                    };
                    self.pos += 1; // '='
                    kwargs.push((key, self.expr()?));
                } else {
                    if !kwargs.is_empty() {
                        return Err(ParseError::new(
                            self.offset(),
                            ParseErrorKind::PositionalAfterKeyword,
                        ));
                    }
                    args.push(self.expr()?);
                }

                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen, "',' or ')'")?;
                break;
            }
        }

        Ok(Ast::Call { name, args, kwargs })
    }

    /// Parse an integer list, after the opening bracket.
    fn list(&mut self) -> Result<Ast, ParseError> {
        let mut items = Vec::new();
        if self.eat(&Token::RBracket) {
            return Ok(Ast::List(items));
        }
        loop {
            let offset = self.offset();
            let negative = self.eat(&Token::Minus);
            match self.next("an integer")? {
                Token::Number(num) => {
                    let Ok(value) = num.parse::<i32>() else {
                        return Err(ParseError::new(offset, ParseErrorKind::InvalidNumber(num)));
                    };
                    items.push(if negative { -value } else { value });
                }
                tok => {
                    return Err(ParseError::new(
                        offset,
                        ParseErrorKind::UnexpectedToken {
                            expected: "an integer",
                            found: tok.to_string(),
                        },
                    ));
                }
            }
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RBracket, "',' or ']'")?;
            return Ok(Ast::List(items));
        }
    }
}

/// Parse an expression such as `sum(exp(x) * 2, axes=[-1])`.
pub fn parse(expr: &str) -> Result<Ast, ParseError> {
    let mut parser = Parser {
        tokens: tokenize(expr)?,
        pos: 0,
        end: expr.len(),
    };
    let ast = parser.expr()?;
    if let Some(tok) = parser.peek() {
        return Err(ParseError::new(
            parser.offset(),
            ParseErrorKind::UnexpectedToken {
                expected: "an operator or the end of the expression",
                found: tok.to_string(),
            },
        ));
    }
    Ok(ast)
}

#[cfg(test)]
mod tests {
    use sten_testing::TestCases;

    use super::{parse, Ast, BinOp, ParseError, ParseErrorKind};

    fn name(name: &str) -> Ast {
        Ast::Name(name.to_string())
    }

    fn binary(op: BinOp, lhs: Ast, rhs: Ast) -> Ast {
        Ast::binary(op, lhs, rhs)
    }

    fn neg(x: Ast) -> Ast {
        Ast::Neg(Box::new(x))
    }

    #[test]
    fn test_parse() {
        #[derive(Debug)]
        struct Case {
            expr: &'static str,
            expected: Ast,
        }

        let cases = [
            Case {
                expr: "x",
                expected: name("x"),
            },
            Case {
                expr: "2.5e-1",
                expected: Ast::Number(0.25),
            },
            Case {
                expr: "x + y * 2",
                expected: binary(
                    BinOp::Add,
                    name("x"),
                    binary(BinOp::Mul, name("y"), Ast::Number(2.)),
                ),
            },
            Case {
                expr: "x - y - z",
                expected: binary(
                    BinOp::Sub,
                    binary(BinOp::Sub, name("x"), name("y")),
                    name("z"),
                ),
            },
            Case {
                expr: "(x + y) / 2",
                expected: binary(
                    BinOp::Div,
                    binary(BinOp::Add, name("x"), name("y")),
                    Ast::Number(2.),
                ),
            },
            Case {
                expr: "-x^2",
                expected: neg(binary(BinOp::Pow, name("x"), Ast::Number(2.))),
            },
            Case {
                expr: "x^-y^2",
                expected: binary(
                    BinOp::Pow,
                    name("x"),
                    neg(binary(BinOp::Pow, name("y"), Ast::Number(2.))),
                ),
            },
            Case {
                expr: "--x",
                expected: neg(neg(name("x"))),
            },
            Case {
                expr: "sum(exp(x), axes=[0, -1], keep_dims=1)",
                expected: Ast::Call {
                    name: "sum".into(),
                    args: vec![Ast::Call {
                        name: "exp".into(),
                        args: vec![name("x")],
                        kwargs: vec![],
                    }],
                    kwargs: vec![
                        ("axes".into(), Ast::List(vec![0, -1])),
                        ("keep_dims".into(), Ast::Number(1.)),
                    ],
                },
            },
            Case {
                expr: "reshape(x, [])",
                expected: Ast::Call {
                    name: "reshape".into(),
                    args: vec![name("x"), Ast::List(vec![])],
                    kwargs: vec![],
                },
            },
            Case {
                expr: "f()",
                expected: Ast::Call {
                    name: "f".into(),
                    args: vec![],
                    kwargs: vec![],
                },
            },
        ];

        cases.test_each(|case| {
            assert_eq!(parse(case.expr), Ok(case.expected.clone()));
        })
    }

    #[test]
    fn test_parse_errors() {
        #[derive(Debug)]
        struct Case {
            expr: &'static str,
            expected: ParseError,
        }

        let cases = [
            Case {
                expr: "x $ y",
                expected: ParseError::new(2, ParseErrorKind::UnexpectedChar('$')),
            },
            Case {
                expr: "x +",
                expected: ParseError::new(
                    3,
                    ParseErrorKind::UnexpectedEnd {
                        expected: "a number, name, '(' or '['",
                    },
                ),
            },
            Case {
                expr: "(x",
                expected: ParseError::new(2, ParseErrorKind::UnexpectedEnd { expected: "')'" }),
            },
            Case {
                expr: "x y",
                expected: ParseError::new(
                    2,
                    ParseErrorKind::UnexpectedToken {
                        expected: "an operator or the end of the expression",
                        found: "name \"y\"".into(),
                    },
                ),
            },
            Case {
                expr: "1.2.3",
                expected: ParseError::new(0, ParseErrorKind::InvalidNumber("1.2.3".into())),
            },
            Case {
                expr: "[1.5]",
                expected: ParseError::new(1, ParseErrorKind::InvalidNumber("1.5".into())),
            },
            Case {
                expr: "sum(axis=0, x)",
                expected: ParseError::new(12, ParseErrorKind::PositionalAfterKeyword),
            },
            Case {
                expr: "f(x;",
                expected: ParseError::new(3, ParseErrorKind::UnexpectedChar(';')),
            },
        ];

        cases.test_each(|case| {
            assert_eq!(parse(case.expr), Err(case.expected.clone()));
        })
    }

    #[test]
    fn test_error_display() {
        let err = parse("x +").err().unwrap();
        assert_eq!(
            err.to_string(),
            "syntax error at offset 3: expected a number, name, '(' or '[' but reached the end"
        );
    }
}
