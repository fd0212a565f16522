//! Recursive-descent parser for coefficient expressions.
//!
//! Grammar: `expr := term (('+'|'-') term)*`, `term := factor (('*'|'/')
//! factor)*`, `factor := unary ('^' factor)?`, `unary := '-' unary | primary`,
//! `primary := number | ident | ident '(' args ')' | '(' expr ')'`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Ident(String),
    Call(String, Vec<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(v) => write!(f, "{v}"),
            Token::Ident(s) => write!(f, "{s}"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Caret => write!(f, "^"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit() || bytes[i] == '.')
                {
                    i += 1;
                }
                // Scientific notation tail: e or E, optional sign, digits.
                if i < bytes.len() && (bytes[i] == 'e' || bytes[i] == 'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && (bytes[j] == '+' || bytes[j] == '-') {
                        j += 1;
                    }
                    if j < bytes.len() && bytes[j].is_ascii_digit() {
                        i = j;
                        while i < bytes.len() && bytes[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = bytes[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number literal `{text}`"))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == '_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(bytes[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: &Token) -> Result<(), String> {
        match self.advance() {
            Some(t) if &t == token => Ok(()),
            Some(t) => Err(format!("expected `{token}`, found `{t}`")),
            None => Err(format!("expected `{token}`, found end of input")),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(BinOp::Add),
            Some(Token::Minus) => Some(BinOp::Sub),
            _ => None,
        } {
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.factor()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(BinOp::Mul),
            Some(Token::Slash) => Some(BinOp::Div),
            _ => None,
        } {
            self.advance();
            let rhs = self.factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, String> {
        let base = self.unary()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.advance();
            let exponent = self.factor()?;
            return Ok(Expr::Binary(
                BinOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        loop {
                            args.push(self.expr()?);
                            if matches!(self.peek(), Some(Token::Comma)) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(t) => Err(format!("unexpected token `{t}`")),
            None => Err("unexpected end of input".to_string()),
        }
    }
}

pub fn parse(src: &str) -> Result<Expr, String> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!(
            "trailing input starting at `{}`",
            parser.tokens[parser.pos]
        ));
    }
    Ok(expr)
}

/// Pointwise scalar evaluation, used for Dirichlet values, initial conditions
/// and sensor placement where no AD content is needed.
pub struct PointContext<'a> {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub t: f64,
    /// Scalar parameter lookup by name.
    pub scalars: &'a dyn Fn(&str) -> Option<f64>,
}

impl Expr {
    pub fn eval_pointwise(&self, ctx: &PointContext) -> Result<f64, String> {
        match self {
            Expr::Number(v) => Ok(*v),
            Expr::Ident(name) => match name.as_str() {
                "x" => Ok(ctx.x),
                "y" => Ok(ctx.y),
                "z" => Ok(ctx.z),
                "t" => Ok(ctx.t),
                "pi" => Ok(std::f64::consts::PI),
                other => (ctx.scalars)(other)
                    .ok_or_else(|| format!("unknown identifier `{other}`")),
            },
            Expr::Call(name, args) => {
                let vals: Result<Vec<f64>, String> =
                    args.iter().map(|a| a.eval_pointwise(ctx)).collect();
                let vals = vals?;
                apply_function(name, &vals)
            }
            Expr::Neg(inner) => Ok(-inner.eval_pointwise(ctx)?),
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval_pointwise(ctx)?;
                let r = rhs.eval_pointwise(ctx)?;
                Ok(match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    BinOp::Pow => l.powf(r),
                })
            }
        }
    }
}

fn apply_function(name: &str, args: &[f64]) -> Result<f64, String> {
    let unary = |f: fn(f64) -> f64| -> Result<f64, String> {
        if args.len() != 1 {
            return Err(format!("`{name}` takes one argument"));
        }
        Ok(f(args[0]))
    };
    match name {
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "tan" => unary(f64::tan),
        "exp" => unary(f64::exp),
        "log" => unary(f64::ln),
        "sqrt" => unary(f64::sqrt),
        "abs" => unary(f64::abs),
        "min" | "max" | "pow" => {
            if args.len() != 2 {
                return Err(format!("`{name}` takes two arguments"));
            }
            Ok(match name {
                "min" => args[0].min(args[1]),
                "max" => args[0].max(args[1]),
                _ => args[0].powf(args[1]),
            })
        }
        other => Err(format!("unknown function `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_scalars(_: &str) -> Option<f64> {
        None
    }

    fn eval(src: &str) -> f64 {
        let ctx = PointContext {
            x: 0.5,
            y: 0.25,
            z: 0.0,
            t: 2.0,
            scalars: &no_scalars,
        };
        parse(src).unwrap().eval_pointwise(&ctx).unwrap()
    }

    #[test]
    fn precedence_and_unary_minus() {
        assert_eq!(eval("2 + 3 * 4"), 14.0);
        assert_eq!(eval("-2^2"), -4.0);
        assert_eq!(eval("(2 + 3) * 4"), 20.0);
        assert_eq!(eval("2 - 3 - 4"), -5.0);
    }

    #[test]
    fn coordinates_and_functions() {
        assert!((eval("sin(pi*x)") - 1.0).abs() < 1e-14);
        assert!((eval("x*y + t") - 2.125).abs() < 1e-14);
        assert_eq!(eval("max(x, y)"), 0.5);
    }

    #[test]
    fn scientific_notation() {
        assert_eq!(eval("1.5e-2"), 0.015);
        assert_eq!(eval("2E3"), 2000.0);
    }

    #[test]
    fn scalar_parameter_lookup() {
        let lookup = |name: &str| (name == "kappa").then_some(3.0);
        let ctx = PointContext {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            t: 0.0,
            scalars: &lookup,
        };
        let v = parse("2*kappa").unwrap().eval_pointwise(&ctx).unwrap();
        assert_eq!(v, 6.0);
    }

    #[test]
    fn reports_parse_failures() {
        assert!(parse("2 +").is_err());
        assert!(parse("foo(1,").is_err());
        assert!(parse("2 3").is_err());
        assert!(parse("").is_err());
    }
}
