//! 合成工具沙箱：受限算术表达式解释器
//!
//! 合成的计算体是一个小表达式语言，不是宿主代码：没有 I/O、没有模块、
//! 没有对进程的任何反射面。白名单函数之外一律拒绝。
//! 资源上界：表达式长度、解析深度、求值步数（代替 CPU/内存 rlimit）。
//! 解释器是纯函数：同一表达式同一入参永远得到同一结果，
//! 这让注册表里存的测试用例可以随时复跑验证。

use std::collections::HashMap;

use crate::core::WorkerError;

const MAX_EXPR_LEN: usize = 2000;
const MAX_DEPTH: usize = 32;
const MAX_EVAL_STEPS: usize = 10_000;

/// 沙箱值：标量或数值列表
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxValue {
    Num(f64),
    List(Vec<f64>),
}

impl SandboxValue {
    pub fn from_json(v: &serde_json::Value) -> Option<SandboxValue> {
        match v {
            serde_json::Value::Number(n) => n.as_f64().map(SandboxValue::Num),
            serde_json::Value::Bool(b) => Some(SandboxValue::Num(if *b { 1.0 } else { 0.0 })),
            serde_json::Value::Array(arr) => {
                let nums: Option<Vec<f64>> = arr.iter().map(|x| x.as_f64()).collect();
                nums.map(SandboxValue::List)
            }
            _ => None,
        }
    }
}

// ── 词法 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    Question,
    Colon,
    And,
    Or,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                tokens.push(Token::Num(s.parse().map_err(|_| format!("bad number: {}", s))?));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
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
            '%' => {
                tokens.push(Token::Percent);
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
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err("single '=' not allowed".to_string());
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err("single '!' not allowed".to_string());
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err("single '&' not allowed".to_string());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err("single '|' not allowed".to_string());
                }
            }
            other => return Err(format!("illegal character: {:?}", other)),
        }
    }
    Ok(tokens)
}

// ── 语法 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Var(String),
    Unary(Token, Box<Expr>),
    Binary(Token, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(format!("expected {:?}, got {:?}", token, other)),
        }
    }

    /// 三目最低优先级：cond ? a : b
    fn parse_expr(&mut self, depth: usize) -> Result<Expr, String> {
        if depth > MAX_DEPTH {
            return Err("expression too deeply nested".to_string());
        }
        let cond = self.parse_or(depth + 1)?;
        if self.peek() == Some(&Token::Question) {
            self.next();
            let then_branch = self.parse_expr(depth + 1)?;
            self.expect(Token::Colon)?;
            let else_branch = self.parse_expr(depth + 1)?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then_branch),
                Box::new(else_branch),
            ));
        }
        Ok(cond)
    }

    fn parse_or(&mut self, depth: usize) -> Result<Expr, String> {
        let mut left = self.parse_and(depth)?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and(depth)?;
            left = Expr::Binary(Token::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self, depth: usize) -> Result<Expr, String> {
        let mut left = self.parse_comparison(depth)?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_comparison(depth)?;
            left = Expr::Binary(Token::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self, depth: usize) -> Result<Expr, String> {
        let left = self.parse_additive(depth)?;
        if let Some(op) = self.peek().cloned() {
            if matches!(op, Token::Lt | Token::Le | Token::Gt | Token::Ge | Token::EqEq | Token::NotEq) {
                self.next();
                let right = self.parse_additive(depth)?;
                return Ok(Expr::Binary(op, Box::new(left), Box::new(right)));
            }
        }
        Ok(left)
    }

    fn parse_additive(&mut self, depth: usize) -> Result<Expr, String> {
        let mut left = self.parse_multiplicative(depth)?;
        while let Some(op) = self.peek().cloned() {
            if matches!(op, Token::Plus | Token::Minus) {
                self.next();
                let right = self.parse_multiplicative(depth)?;
                left = Expr::Binary(op, Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self, depth: usize) -> Result<Expr, String> {
        let mut left = self.parse_power(depth)?;
        while let Some(op) = self.peek().cloned() {
            if matches!(op, Token::Star | Token::Slash | Token::Percent) {
                self.next();
                let right = self.parse_power(depth)?;
                left = Expr::Binary(op, Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_power(&mut self, depth: usize) -> Result<Expr, String> {
        let base = self.parse_unary(depth)?;
        if self.peek() == Some(&Token::Caret) {
            self.next();
            // 右结合
            let exp = self.parse_power(depth + 1)?;
            return Ok(Expr::Binary(Token::Caret, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn parse_unary(&mut self, depth: usize) -> Result<Expr, String> {
        if depth > MAX_DEPTH {
            return Err("expression too deeply nested".to_string());
        }
        if self.peek() == Some(&Token::Minus) {
            self.next();
            let operand = self.parse_unary(depth + 1)?;
            return Ok(Expr::Unary(Token::Minus, Box::new(operand)));
        }
        self.parse_primary(depth)
    }

    fn parse_primary(&mut self, depth: usize) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::LParen) => {
                let inner = self.parse_expr(depth + 1)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr(depth + 1)?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => Err(format!("unexpected token: {:?}", other)),
        }
    }
}

// ── 求值 ────────────────────────────────────────────────────────────────

const ALLOWED_FUNCTIONS: [&str; 13] = [
    "abs", "min", "max", "round", "round2", "floor", "ceil", "sqrt", "ln", "exp", "pow", "sum",
    "len",
];

struct Evaluator<'a> {
    params: &'a HashMap<String, SandboxValue>,
    steps: usize,
}

impl<'a> Evaluator<'a> {
    fn tick(&mut self) -> Result<(), String> {
        self.steps += 1;
        if self.steps > MAX_EVAL_STEPS {
            return Err("evaluation step limit exceeded".to_string());
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<SandboxValue, String> {
        self.tick()?;
        match expr {
            Expr::Num(n) => Ok(SandboxValue::Num(*n)),
            Expr::Var(name) => self
                .params
                .get(name)
                .cloned()
                .ok_or_else(|| format!("unknown identifier: {}", name)),
            Expr::Unary(Token::Minus, operand) => {
                let v = self.eval_num(operand)?;
                Ok(SandboxValue::Num(-v))
            }
            Expr::Unary(op, _) => Err(format!("bad unary operator: {:?}", op)),
            Expr::Ternary(cond, then_branch, else_branch) => {
                let c = self.eval_num(cond)?;
                if c != 0.0 {
                    self.eval(then_branch)
                } else {
                    self.eval(else_branch)
                }
            }
            Expr::Binary(op, left, right) => {
                let l = self.eval_num(left)?;
                let r = self.eval_num(right)?;
                let v = match op {
                    Token::Plus => l + r,
                    Token::Minus => l - r,
                    Token::Star => l * r,
                    Token::Slash => {
                        if r == 0.0 {
                            return Err("division by zero".to_string());
                        }
                        l / r
                    }
                    Token::Percent => {
                        if r == 0.0 {
                            return Err("modulo by zero".to_string());
                        }
                        l % r
                    }
                    Token::Caret => l.powf(r),
                    Token::Lt => bool_num(l < r),
                    Token::Le => bool_num(l <= r),
                    Token::Gt => bool_num(l > r),
                    Token::Ge => bool_num(l >= r),
                    Token::EqEq => bool_num((l - r).abs() < 1e-12),
                    Token::NotEq => bool_num((l - r).abs() >= 1e-12),
                    Token::And => bool_num(l != 0.0 && r != 0.0),
                    Token::Or => bool_num(l != 0.0 || r != 0.0),
                    other => return Err(format!("bad operator: {:?}", other)),
                };
                if !v.is_finite() {
                    return Err("non-finite result".to_string());
                }
                Ok(SandboxValue::Num(v))
            }
            Expr::Call(name, args) => self.eval_call(name, args),
        }
    }

    fn eval_num(&mut self, expr: &Expr) -> Result<f64, String> {
        match self.eval(expr)? {
            SandboxValue::Num(n) => Ok(n),
            SandboxValue::List(_) => Err("expected a number, got a list".to_string()),
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Expr]) -> Result<SandboxValue, String> {
        if !ALLOWED_FUNCTIONS.contains(&name) {
            return Err(format!("function not allowed: {}", name));
        }
        let values: Vec<SandboxValue> = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<_, _>>()?;

        let result = match (name, values.as_slice()) {
            ("abs", [SandboxValue::Num(n)]) => n.abs(),
            ("round", [SandboxValue::Num(n)]) => n.round(),
            ("round2", [SandboxValue::Num(n)]) => (n * 100.0).round() / 100.0,
            ("floor", [SandboxValue::Num(n)]) => n.floor(),
            ("ceil", [SandboxValue::Num(n)]) => n.ceil(),
            ("sqrt", [SandboxValue::Num(n)]) => {
                if *n < 0.0 {
                    return Err("sqrt of negative".to_string());
                }
                n.sqrt()
            }
            ("ln", [SandboxValue::Num(n)]) => {
                if *n <= 0.0 {
                    return Err("ln of non-positive".to_string());
                }
                n.ln()
            }
            ("exp", [SandboxValue::Num(n)]) => n.exp(),
            ("pow", [SandboxValue::Num(base), SandboxValue::Num(e)]) => base.powf(*e),
            ("sum", [SandboxValue::List(list)]) => list.iter().sum(),
            ("len", [SandboxValue::List(list)]) => list.len() as f64,
            ("min", _) => {
                let mut all: Vec<f64> = Vec::new();
                for v in &values {
                    match v {
                        SandboxValue::Num(n) => all.push(*n),
                        SandboxValue::List(l) => all.extend(l),
                    }
                }
                if all.is_empty() {
                    return Err("min of nothing".to_string());
                }
                all.iter().cloned().fold(f64::INFINITY, f64::min)
            }
            ("max", _) => {
                let mut all: Vec<f64> = Vec::new();
                for v in &values {
                    match v {
                        SandboxValue::Num(n) => all.push(*n),
                        SandboxValue::List(l) => all.extend(l),
                    }
                }
                if all.is_empty() {
                    return Err("max of nothing".to_string());
                }
                all.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            }
            _ => return Err(format!("bad arguments for {}", name)),
        };
        if !result.is_finite() {
            return Err("non-finite result".to_string());
        }
        Ok(SandboxValue::Num(result))
    }
}

fn bool_num(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// 解析并求值一个表达式
pub fn evaluate(expr: &str, params: &HashMap<String, SandboxValue>) -> Result<f64, WorkerError> {
    if expr.len() > MAX_EXPR_LEN {
        return Err(WorkerError::Sandbox("expression too long".into()));
    }
    let tokens = tokenize(expr).map_err(WorkerError::Sandbox)?;
    if tokens.is_empty() {
        return Err(WorkerError::Sandbox("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr(0).map_err(WorkerError::Sandbox)?;
    if parser.pos != parser.tokens.len() {
        return Err(WorkerError::Sandbox("trailing tokens".into()));
    }
    let mut evaluator = Evaluator { params, steps: 0 };
    match evaluator.eval(&ast).map_err(WorkerError::Sandbox)? {
        SandboxValue::Num(n) => Ok(n),
        SandboxValue::List(_) => Err(WorkerError::Sandbox("expression returned a list".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, SandboxValue)]) -> HashMap<String, SandboxValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        let p = params(&[]);
        assert_eq!(evaluate("2 + 3 * 4", &p).unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4", &p).unwrap(), 20.0);
        assert_eq!(evaluate("2 ^ 3 ^ 2", &p).unwrap(), 512.0);
        assert_eq!(evaluate("-3 + 5", &p).unwrap(), 2.0);
    }

    #[test]
    fn test_params_and_functions() {
        let p = params(&[
            ("principal", SandboxValue::Num(1000.0)),
            ("rate", SandboxValue::Num(5.0)),
            ("flows", SandboxValue::List(vec![100.0, 200.0, 300.0])),
        ]);
        assert_eq!(evaluate("principal * rate / 100", &p).unwrap(), 50.0);
        assert_eq!(evaluate("sum(flows)", &p).unwrap(), 600.0);
        assert_eq!(evaluate("sum(flows) / len(flows)", &p).unwrap(), 200.0);
        assert_eq!(evaluate("round2(principal / 3)", &p).unwrap(), 333.33);
        assert_eq!(evaluate("max(rate, 10)", &p).unwrap(), 10.0);
    }

    #[test]
    fn test_conditional() {
        let p = params(&[("variance", SandboxValue::Num(2.23))]);
        assert_eq!(evaluate("variance > 2 ? 1 : 0", &p).unwrap(), 1.0);
        assert_eq!(evaluate("variance > 3 ? 1 : 0", &p).unwrap(), 0.0);
    }

    #[test]
    fn test_unknown_identifier_rejected() {
        let p = params(&[]);
        assert!(evaluate("secret_host_call()", &p).is_err());
        assert!(evaluate("open", &p).is_err());
    }

    #[test]
    fn test_disallowed_function_rejected() {
        let p = params(&[("x", SandboxValue::Num(1.0))]);
        let err = evaluate("import(x)", &p).unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_division_by_zero() {
        let p = params(&[]);
        assert!(evaluate("1 / 0", &p).is_err());
    }

    #[test]
    fn test_depth_cap() {
        let p = params(&[]);
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert!(evaluate(&deep, &p).is_err());
    }

    #[test]
    fn test_determinism() {
        // 纯解释器：同一表达式同一入参结果恒等，注册表测试用例可复跑
        let p = params(&[("x", SandboxValue::Num(7.0))]);
        let a = evaluate("sqrt(x) * ln(x) + x ^ 2", &p).unwrap();
        let b = evaluate("sqrt(x) * ln(x) + x ^ 2", &p).unwrap();
        assert_eq!(a, b);
    }
}
