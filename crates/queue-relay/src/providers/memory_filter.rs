//! SQL-like filter and action evaluation for the in-memory broker.
//!
//! Supports the subset needed to observe subscription routing locally:
//! comparisons (`=`, `<>`, `!=`, `<`, `<=`, `>`, `>=`), `IS [NOT] NULL`,
//! `AND`/`OR`/`NOT`, parentheses, `TRUE`/`FALSE`, string/number/bool literals,
//! and `+ - * /` arithmetic. Actions are `SET field = value` and
//! `REMOVE field` statements separated by `;`.
//!
//! Identifiers prefixed with `sys.` address system fields; any other
//! identifier (optionally prefixed with `user.`) addresses an application
//! property. Property names match exactly first, then case-insensitively.

use crate::message::{Message, PropertyValue};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct FilterSyntaxError {
    pub message: String,
}

impl FilterSyntaxError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ============================================================================
// Syntax Tree
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemField {
    MessageId,
    CorrelationId,
    Subject,
    To,
    ReplyTo,
    ContentType,
    SessionId,
}

#[derive(Debug, Clone, PartialEq)]
enum Field {
    System(SystemField),
    User(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Field(Field),
    Value(PropertyValue),
    Arith(Box<Operand>, ArithOp, Box<Operand>),
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Literal(bool),
    Compare(Operand, CmpOp, Operand),
    IsNull { field: Field, negated: bool },
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Set(Field, Operand),
    Remove(Field),
}

/// A parsed filter expression
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter(Predicate);

/// A parsed rule action
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledAction(Vec<Statement>);

impl CompiledFilter {
    pub fn parse(expression: &str) -> Result<Self, FilterSyntaxError> {
        let mut parser = Parser::new(tokenize(expression)?);
        let predicate = parser.predicate()?;
        parser.expect_end()?;
        Ok(Self(predicate))
    }

    pub fn matches(&self, message: &Message) -> bool {
        evaluate(&self.0, message)
    }
}

impl CompiledAction {
    pub fn parse(expression: &str) -> Result<Self, FilterSyntaxError> {
        let mut parser = Parser::new(tokenize(expression)?);
        let mut statements = Vec::new();

        loop {
            while parser.eat(&Token::Semicolon) {}
            if parser.at_end() {
                break;
            }
            statements.push(parser.statement()?);
            if !parser.at_end() && !parser.eat(&Token::Semicolon) {
                return Err(FilterSyntaxError::new("expected ';' between action statements"));
            }
        }

        if statements.is_empty() {
            return Err(FilterSyntaxError::new("action contains no statements"));
        }

        Ok(Self(statements))
    }

    /// Apply every statement in order to `message`
    pub fn apply(&self, message: &mut Message) {
        for statement in &self.0 {
            match statement {
                Statement::Set(field, operand) => {
                    if let Some(value) = resolve_operand(operand, message) {
                        set_field(message, field, value);
                    }
                }
                Statement::Remove(field) => remove_field(message, field),
            }
        }
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Cmp(CmpOp),
    Arith(ArithOp),
    LParen,
    RParen,
    Semicolon,
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterSyntaxError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Arith(ArithOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Arith(ArithOp::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Arith(ArithOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Arith(ArithOp::Div));
                i += 1;
            }
            '=' => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    tokens.push(Token::Cmp(CmpOp::Ne));
                    i += 2;
                }
                Some('=') => {
                    tokens.push(Token::Cmp(CmpOp::Le));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Cmp(CmpOp::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Gt));
                    i += 1;
                }
            }
            '\'' => {
                // '' inside a literal is an escaped quote
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                        None => return Err(FilterSyntaxError::new("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text.contains('.') {
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| FilterSyntaxError::new(format!("invalid number '{}'", text)))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|_| FilterSyntaxError::new(format!("invalid number '{}'", text)))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '$'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(FilterSyntaxError::new(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn at_end(&self) -> bool {
        self.position >= self.tokens.len()
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Ident(ident)) if ident.eq_ignore_ascii_case(keyword) => {
                self.position += 1;
                true
            }
            _ => false,
        }
    }

    fn expect_end(&self) -> Result<(), FilterSyntaxError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(FilterSyntaxError::new(format!(
                "unexpected trailing token {:?}",
                token
            ))),
        }
    }

    fn predicate(&mut self) -> Result<Predicate, FilterSyntaxError> {
        let mut left = self.conjunction()?;
        while self.eat_keyword("OR") {
            let right = self.conjunction()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn conjunction(&mut self) -> Result<Predicate, FilterSyntaxError> {
        let mut left = self.negation()?;
        while self.eat_keyword("AND") {
            let right = self.negation()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn negation(&mut self) -> Result<Predicate, FilterSyntaxError> {
        if self.eat_keyword("NOT") {
            return Ok(Predicate::Not(Box::new(self.negation()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Predicate, FilterSyntaxError> {
        if self.eat(&Token::LParen) {
            let inner = self.predicate()?;
            if !self.eat(&Token::RParen) {
                return Err(FilterSyntaxError::new("expected ')'"));
            }
            return Ok(inner);
        }

        let left = self.operand()?;

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            if !self.eat_keyword("NULL") {
                return Err(FilterSyntaxError::new("expected NULL after IS"));
            }
            return match left {
                Operand::Field(field) => Ok(Predicate::IsNull { field, negated }),
                _ => Err(FilterSyntaxError::new("IS NULL requires a property name")),
            };
        }

        match self.peek() {
            Some(Token::Cmp(op)) => {
                let op = *op;
                self.position += 1;
                let right = self.operand()?;
                Ok(Predicate::Compare(left, op, right))
            }
            _ => match left {
                Operand::Value(PropertyValue::Bool(b)) => Ok(Predicate::Literal(b)),
                _ => Err(FilterSyntaxError::new("expected a comparison operator")),
            },
        }
    }

    fn operand(&mut self) -> Result<Operand, FilterSyntaxError> {
        let mut left = self.term()?;
        while let Some(Token::Arith(op @ (ArithOp::Add | ArithOp::Sub))) = self.peek() {
            let op = *op;
            self.position += 1;
            let right = self.term()?;
            left = Operand::Arith(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Operand, FilterSyntaxError> {
        let mut left = self.atom()?;
        while let Some(Token::Arith(op @ (ArithOp::Mul | ArithOp::Div))) = self.peek() {
            let op = *op;
            self.position += 1;
            let right = self.atom()?;
            left = Operand::Arith(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn atom(&mut self) -> Result<Operand, FilterSyntaxError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Operand::Value(PropertyValue::String(s))),
            Some(Token::Int(i)) => Ok(Operand::Value(PropertyValue::Int(i))),
            Some(Token::Float(f)) => Ok(Operand::Value(PropertyValue::Float(f))),
            Some(Token::Arith(ArithOp::Sub)) => match self.next() {
                Some(Token::Int(i)) => Ok(Operand::Value(PropertyValue::Int(-i))),
                Some(Token::Float(f)) => Ok(Operand::Value(PropertyValue::Float(-f))),
                _ => Err(FilterSyntaxError::new("expected a number after '-'")),
            },
            Some(Token::LParen) => {
                let inner = self.operand()?;
                if !self.eat(&Token::RParen) {
                    return Err(FilterSyntaxError::new("expected ')'"));
                }
                Ok(inner)
            }
            Some(Token::Ident(ident)) => {
                if ident.eq_ignore_ascii_case("TRUE") {
                    Ok(Operand::Value(PropertyValue::Bool(true)))
                } else if ident.eq_ignore_ascii_case("FALSE") {
                    Ok(Operand::Value(PropertyValue::Bool(false)))
                } else {
                    Ok(Operand::Field(parse_field(&ident)?))
                }
            }
            Some(token) => Err(FilterSyntaxError::new(format!(
                "unexpected token {:?}",
                token
            ))),
            None => Err(FilterSyntaxError::new("unexpected end of expression")),
        }
    }

    fn statement(&mut self) -> Result<Statement, FilterSyntaxError> {
        if self.eat_keyword("SET") {
            let field = match self.next() {
                Some(Token::Ident(ident)) => parse_field(&ident)?,
                _ => return Err(FilterSyntaxError::new("expected a property name after SET")),
            };
            if !self.eat(&Token::Cmp(CmpOp::Eq)) {
                return Err(FilterSyntaxError::new("expected '=' in SET statement"));
            }
            let value = self.operand()?;
            return Ok(Statement::Set(field, value));
        }

        if self.eat_keyword("REMOVE") {
            return match self.next() {
                Some(Token::Ident(ident)) => Ok(Statement::Remove(parse_field(&ident)?)),
                _ => Err(FilterSyntaxError::new("expected a property name after REMOVE")),
            };
        }

        Err(FilterSyntaxError::new("expected SET or REMOVE"))
    }
}

fn parse_field(ident: &str) -> Result<Field, FilterSyntaxError> {
    let lower = ident.to_ascii_lowercase();

    if let Some(name) = lower.strip_prefix("sys.") {
        let field = match name {
            "messageid" => SystemField::MessageId,
            "correlationid" => SystemField::CorrelationId,
            "label" | "subject" => SystemField::Subject,
            "to" => SystemField::To,
            "replyto" => SystemField::ReplyTo,
            "contenttype" => SystemField::ContentType,
            "sessionid" => SystemField::SessionId,
            _ => {
                return Err(FilterSyntaxError::new(format!(
                    "unsupported system property '{}'",
                    ident
                )))
            }
        };
        return Ok(Field::System(field));
    }

    let name = match lower.strip_prefix("user.") {
        Some(_) => &ident["user.".len()..],
        None => ident,
    };

    if name.is_empty() {
        return Err(FilterSyntaxError::new("empty property name"));
    }

    Ok(Field::User(name.to_string()))
}

// ============================================================================
// Evaluation
// ============================================================================

fn evaluate(predicate: &Predicate, message: &Message) -> bool {
    match predicate {
        Predicate::Literal(b) => *b,
        Predicate::Compare(left, op, right) => {
            match (
                resolve_operand(left, message),
                resolve_operand(right, message),
            ) {
                (Some(l), Some(r)) => compare(&l, *op, &r),
                // Comparisons with a missing property are unknown, never true
                _ => false,
            }
        }
        Predicate::IsNull { field, negated } => resolve_field(field, message).is_none() != *negated,
        Predicate::Not(inner) => !evaluate(inner, message),
        Predicate::And(l, r) => evaluate(l, message) && evaluate(r, message),
        Predicate::Or(l, r) => evaluate(l, message) || evaluate(r, message),
    }
}

fn compare(left: &PropertyValue, op: CmpOp, right: &PropertyValue) -> bool {
    let ordering = match (left, right) {
        (PropertyValue::String(l), PropertyValue::String(r)) => Some(l.cmp(r)),
        (PropertyValue::Bool(l), PropertyValue::Bool(r)) => {
            return match op {
                CmpOp::Eq => l == r,
                CmpOp::Ne => l != r,
                _ => false,
            }
        }
        (PropertyValue::Timestamp(l), PropertyValue::Timestamp(r)) => Some(l.cmp(r)),
        (l, r) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => None,
        },
    };

    match ordering {
        Some(ordering) => match op {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        },
        None => false,
    }
}

fn resolve_operand(operand: &Operand, message: &Message) -> Option<PropertyValue> {
    match operand {
        Operand::Value(value) => Some(value.clone()),
        Operand::Field(field) => resolve_field(field, message),
        Operand::Arith(left, op, right) => {
            let left = resolve_operand(left, message)?;
            let right = resolve_operand(right, message)?;
            arithmetic(&left, *op, &right)
        }
    }
}

fn arithmetic(left: &PropertyValue, op: ArithOp, right: &PropertyValue) -> Option<PropertyValue> {
    match (left, right) {
        (PropertyValue::Int(l), PropertyValue::Int(r)) => {
            let value = match op {
                ArithOp::Add => l.checked_add(*r),
                ArithOp::Sub => l.checked_sub(*r),
                ArithOp::Mul => l.checked_mul(*r),
                ArithOp::Div => l.checked_div(*r),
            }?;
            Some(PropertyValue::Int(value))
        }
        (PropertyValue::String(l), PropertyValue::String(r)) if op == ArithOp::Add => {
            Some(PropertyValue::String(format!("{}{}", l, r)))
        }
        (l, r) => {
            let (l, r) = (l.as_f64()?, r.as_f64()?);
            let value = match op {
                ArithOp::Add => l + r,
                ArithOp::Sub => l - r,
                ArithOp::Mul => l * r,
                ArithOp::Div if r == 0.0 => return None,
                ArithOp::Div => l / r,
            };
            Some(PropertyValue::Float(value))
        }
    }
}

fn user_property_key(message: &Message, name: &str) -> Option<String> {
    if message.properties.contains_key(name) {
        return Some(name.to_string());
    }
    message
        .properties
        .keys()
        .find(|key| key.eq_ignore_ascii_case(name))
        .cloned()
}

fn resolve_field(field: &Field, message: &Message) -> Option<PropertyValue> {
    match field {
        Field::User(name) => {
            let key = user_property_key(message, name)?;
            message.properties.get(&key).cloned()
        }
        Field::System(system) => {
            let value = match system {
                SystemField::MessageId => Some(message.message_id.as_str().to_string()),
                SystemField::CorrelationId => message.correlation_id.clone(),
                SystemField::Subject => message.subject.clone(),
                SystemField::To => message.to.clone(),
                SystemField::ReplyTo => message.reply_to.clone(),
                SystemField::ContentType => message.content_type.clone(),
                SystemField::SessionId => {
                    message.session_id.as_ref().map(|s| s.as_str().to_string())
                }
            };
            value.map(PropertyValue::String)
        }
    }
}

fn set_field(message: &mut Message, field: &Field, value: PropertyValue) {
    match field {
        Field::User(name) => {
            let key = user_property_key(message, name).unwrap_or_else(|| name.clone());
            message.properties.insert(key, value);
        }
        Field::System(system) => {
            let text = Some(value.to_string());
            match system {
                SystemField::CorrelationId => message.correlation_id = text,
                SystemField::Subject => message.subject = text,
                SystemField::To => message.to = text,
                SystemField::ReplyTo => message.reply_to = text,
                SystemField::ContentType => message.content_type = text,
                // Identity fields are not rewritten by rule actions
                SystemField::MessageId | SystemField::SessionId => {}
            }
        }
    }
}

fn remove_field(message: &mut Message, field: &Field) {
    match field {
        Field::User(name) => {
            if let Some(key) = user_property_key(message, name) {
                message.properties.remove(&key);
            }
        }
        Field::System(system) => match system {
            SystemField::CorrelationId => message.correlation_id = None,
            SystemField::Subject => message.subject = None,
            SystemField::To => message.to = None,
            SystemField::ReplyTo => message.reply_to = None,
            SystemField::ContentType => message.content_type = None,
            SystemField::MessageId | SystemField::SessionId => {}
        },
    }
}

#[cfg(test)]
#[path = "memory_filter_tests.rs"]
mod tests;
