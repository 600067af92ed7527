use serde_json::Value;

use super::lexer::{Token, tokenize};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Syntax tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    In,
    NotIn,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    /// A variable, or a collection when no variable has the name.
    Name(String),
    Attribute(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    /// Function name is stored upper-cased.
    Call(String, Vec<Expr>),
    Subquery(Box<Query>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SortKey {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Collect {
    pub groups: Vec<(String, Expr)>,
    pub aggregates: Vec<(String, Expr)>,
    /// `INTO var [= projection]`
    pub into: Option<(String, Option<Expr>)>,
    pub count_into: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Op {
    For { var: String, source: Expr },
    Let { var: String, value: Expr },
    Filter(Expr),
    Sort(Vec<SortKey>),
    Limit { offset: Option<Expr>, count: Expr },
    Collect(Collect),
    Insert { document: Expr, collection: String },
    Remove { key: Expr, collection: String },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Return {
    pub distinct: bool,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Query {
    pub ops: Vec<Op>,
    pub ret: Option<Return>,
}

/// A parsed top-level query.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub query: Query,
    /// Whether an `INSERT` or `REMOVE` appears anywhere, subqueries included.
    pub modifies: bool,
}

const RESERVED: &[&str] = &[
    "FOR", "LET", "FILTER", "SORT", "LIMIT", "COLLECT", "INSERT", "REMOVE", "RETURN", "IN",
    "INTO", "AND", "OR", "NOT", "WITH", "AGGREGATE", "DISTINCT", "ASC", "DESC",
];

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(word))
}

pub(crate) fn parse(src: &str) -> Result<Statement> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
        allow_in: true,
        modifies: false,
    };
    let query = parser.query()?;
    parser.expect_eof()?;
    Ok(Statement {
        query,
        modifies: parser.modifies,
    })
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Cleared while parsing a `REMOVE` key so `IN` ends the expression.
    allow_in: bool,
    modifies: bool,
}

fn unexpected(found: &Token, wanted: &str) -> Error {
    Error::InvalidQuery(format!("expected {wanted}, found {found:?}"))
}

impl Parser {
    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.pos + offset)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if self.peek().is_sym(sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(unexpected(self.peek(), keyword))
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(unexpected(self.peek(), &format!("'{sym}'")))
        }
    }

    fn expect_eof(&self) -> Result<()> {
        match self.peek() {
            Token::Eof => Ok(()),
            other => Err(unexpected(other, "end of query")),
        }
    }

    /// A variable or collection name.
    fn name(&mut self) -> Result<String> {
        match self.advance() {
            Token::Word(w) if !is_reserved(&w) => Ok(w),
            Token::Quoted(q) => Ok(q),
            other => Err(unexpected(&other, "a name")),
        }
    }

    fn with_in_allowed<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = std::mem::replace(&mut self.allow_in, true);
        let result = f(self);
        self.allow_in = saved;
        result
    }

    // -- operations -----------------------------------------------------------

    fn query(&mut self) -> Result<Query> {
        let mut ops = Vec::new();
        let mut ret = None;

        loop {
            let token = self.peek().clone();
            if token.is_keyword("FOR") {
                self.pos += 1;
                let var = self.name()?;
                self.expect_keyword("IN")?;
                let source = self.expr()?;
                ops.push(Op::For { var, source });
            } else if token.is_keyword("LET") {
                self.pos += 1;
                let var = self.name()?;
                self.expect_sym("=")?;
                let value = self.expr()?;
                ops.push(Op::Let { var, value });
            } else if token.is_keyword("FILTER") {
                self.pos += 1;
                ops.push(Op::Filter(self.expr()?));
            } else if token.is_keyword("SORT") {
                self.pos += 1;
                ops.push(Op::Sort(self.sort_keys()?));
            } else if token.is_keyword("LIMIT") {
                self.pos += 1;
                let first = self.expr()?;
                if self.eat_sym(",") {
                    let count = self.expr()?;
                    ops.push(Op::Limit {
                        offset: Some(first),
                        count,
                    });
                } else {
                    ops.push(Op::Limit {
                        offset: None,
                        count: first,
                    });
                }
            } else if token.is_keyword("COLLECT") {
                self.pos += 1;
                ops.push(Op::Collect(self.collect()?));
            } else if token.is_keyword("INSERT") {
                self.pos += 1;
                let document = self.expr()?;
                if !self.eat_keyword("INTO") {
                    self.expect_keyword("IN")?;
                }
                let collection = self.name()?;
                self.modifies = true;
                ops.push(Op::Insert {
                    document,
                    collection,
                });
            } else if token.is_keyword("REMOVE") {
                self.pos += 1;
                let saved = std::mem::replace(&mut self.allow_in, false);
                let key = self.expr();
                self.allow_in = saved;
                let key = key?;
                self.expect_keyword("IN")?;
                let collection = self.name()?;
                self.modifies = true;
                ops.push(Op::Remove { key, collection });
            } else if token.is_keyword("RETURN") {
                self.pos += 1;
                let distinct = self.eat_keyword("DISTINCT");
                let expr = self.expr()?;
                ret = Some(Return { distinct, expr });
                break;
            } else {
                break;
            }
        }

        let ends_in_modification =
            matches!(ops.last(), Some(Op::Insert { .. } | Op::Remove { .. }));
        if ret.is_none() && !ends_in_modification {
            return Err(unexpected(self.peek(), "RETURN"));
        }
        Ok(Query { ops, ret })
    }

    fn sort_keys(&mut self) -> Result<Vec<SortKey>> {
        let mut keys = Vec::new();
        loop {
            let expr = self.expr()?;
            let descending = if self.eat_keyword("DESC") {
                true
            } else {
                self.eat_keyword("ASC");
                false
            };
            keys.push(SortKey { expr, descending });
            if !self.eat_sym(",") {
                return Ok(keys);
            }
        }
    }

    fn assignments(&mut self) -> Result<Vec<(String, Expr)>> {
        let mut out = Vec::new();
        loop {
            let name = self.name()?;
            self.expect_sym("=")?;
            out.push((name, self.expr()?));
            if !self.eat_sym(",") {
                return Ok(out);
            }
        }
    }

    fn collect(&mut self) -> Result<Collect> {
        let mut collect = Collect::default();

        let starts_group = matches!(self.peek(), Token::Word(w) if !is_reserved(w))
            || matches!(self.peek(), Token::Quoted(_));
        if starts_group && self.peek_at(1).is_sym("=") {
            collect.groups = self.assignments()?;
        }

        if self.eat_keyword("AGGREGATE") {
            collect.aggregates = self.assignments()?;
        }

        if self.eat_keyword("WITH") {
            self.expect_keyword("COUNT")?;
            self.expect_keyword("INTO")?;
            collect.count_into = Some(self.name()?);
        } else if self.eat_keyword("INTO") {
            let var = self.name()?;
            let projection = if self.eat_sym("=") {
                Some(self.expr()?)
            } else {
                None
            };
            collect.into = Some((var, projection));
        }

        Ok(collect)
    }

    // -- expressions ----------------------------------------------------------

    fn expr(&mut self) -> Result<Expr> {
        let cond = self.or()?;
        if self.eat_sym("?") {
            let then = self.expr()?;
            self.expect_sym(":")?;
            let otherwise = self.expr()?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.eat_sym("||") || self.eat_keyword("OR") {
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        while self.eat_sym("&&") || self.eat_keyword("AND") {
            let right = self.equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut left = self.membership()?;
        loop {
            let op = if self.eat_sym("==") {
                BinaryOp::Eq
            } else if self.eat_sym("!=") {
                BinaryOp::Ne
            } else {
                return Ok(left);
            };
            let right = self.membership()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn membership(&mut self) -> Result<Expr> {
        let mut left = self.relational()?;
        loop {
            let op = if self.allow_in && self.eat_keyword("IN") {
                BinaryOp::In
            } else if self.allow_in
                && self.peek().is_keyword("NOT")
                && self.peek_at(1).is_keyword("IN")
            {
                self.pos += 2;
                BinaryOp::NotIn
            } else {
                return Ok(left);
            };
            let right = self.relational()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn relational(&mut self) -> Result<Expr> {
        let mut left = self.additive()?;
        loop {
            let op = if self.eat_sym("<=") {
                BinaryOp::Le
            } else if self.eat_sym(">=") {
                BinaryOp::Ge
            } else if self.eat_sym("<") {
                BinaryOp::Lt
            } else if self.eat_sym(">") {
                BinaryOp::Gt
            } else {
                return Ok(left);
            };
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat_sym("+") {
                BinaryOp::Add
            } else if self.eat_sym("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_sym("*") {
                BinaryOp::Mul
            } else if self.eat_sym("/") {
                BinaryOp::Div
            } else if self.eat_sym("%") {
                BinaryOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat_sym("!") || self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat_sym("-") {
            return Ok(Expr::Negate(Box::new(self.unary()?)));
        }
        if self.eat_sym("+") {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_sym(".") {
                let attr = match self.advance() {
                    Token::Word(w) | Token::Quoted(w) => w,
                    other => return Err(unexpected(&other, "an attribute name")),
                };
                expr = Expr::Attribute(Box::new(expr), attr);
            } else if self.eat_sym("[") {
                let index = self.with_in_allowed(Self::expr)?;
                self.expect_sym("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(n)),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Quoted(name) => Ok(Expr::Name(name)),
            Token::Word(w) => {
                if w.eq_ignore_ascii_case("true") {
                    Ok(Expr::Literal(Value::Bool(true)))
                } else if w.eq_ignore_ascii_case("false") {
                    Ok(Expr::Literal(Value::Bool(false)))
                } else if w.eq_ignore_ascii_case("null") {
                    Ok(Expr::Literal(Value::Null))
                } else if self.peek().is_sym("(") {
                    self.pos += 1;
                    let args = self.with_in_allowed(Self::arguments)?;
                    Ok(Expr::Call(w.to_ascii_uppercase(), args))
                } else if is_reserved(&w) {
                    Err(unexpected(&Token::Word(w), "an expression"))
                } else {
                    Ok(Expr::Name(w))
                }
            }
            Token::Sym("(") => {
                let starts_query = ["FOR", "LET", "RETURN", "COLLECT"]
                    .iter()
                    .any(|k| self.peek().is_keyword(k));
                let inner = if starts_query {
                    Expr::Subquery(Box::new(self.with_in_allowed(Self::query)?))
                } else {
                    self.with_in_allowed(Self::expr)?
                };
                self.expect_sym(")")?;
                Ok(inner)
            }
            Token::Sym("[") => {
                let items = self.with_in_allowed(|p| p.list("]"))?;
                Ok(Expr::Array(items))
            }
            Token::Sym("{") => self.with_in_allowed(Self::object),
            other => Err(unexpected(&other, "an expression")),
        }
    }

    /// Call arguments after the opening parenthesis.
    fn arguments(&mut self) -> Result<Vec<Expr>> {
        self.list(")")
    }

    /// Comma-separated expressions up to and including `close`.
    fn list(&mut self, close: &str) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat_sym(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.eat_sym(close) {
                return Ok(items);
            }
            self.expect_sym(",")?;
        }
    }

    /// Object literal after the opening brace.
    fn object(&mut self) -> Result<Expr> {
        let mut entries = Vec::new();
        if self.eat_sym("}") {
            return Ok(Expr::Object(entries));
        }
        loop {
            let key = match self.advance() {
                Token::Word(w) | Token::Quoted(w) | Token::Str(w) => w,
                Token::Number(n) => n.to_string(),
                other => return Err(unexpected(&other, "an attribute name")),
            };
            let value = if self.eat_sym(":") {
                self.expr()?
            } else {
                Expr::Name(key.clone())
            };
            entries.push((key, value));
            if self.eat_sym("}") {
                return Ok(Expr::Object(entries));
            }
            self.expect_sym(",")?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(src: &str) -> Query {
        parse(src).unwrap().query
    }

    fn name(n: &str) -> Box<Expr> {
        Box::new(Expr::Name(n.into()))
    }

    #[test]
    fn parses_for_filter_return() {
        let q = query("FOR d IN `users` FILTER d.age > 3 RETURN d");
        assert_eq!(q.ops.len(), 2);
        assert_eq!(
            q.ops[0],
            Op::For {
                var: "d".into(),
                source: Expr::Name("users".into())
            }
        );
        assert_eq!(
            q.ops[1],
            Op::Filter(Expr::Binary(
                BinaryOp::Gt,
                Box::new(Expr::Attribute(name("d"), "age".into())),
                Box::new(Expr::Literal(json!(3)))
            ))
        );
        assert_eq!(q.ret.unwrap().expr, Expr::Name("d".into()));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let q = query("for d in xs filter d return distinct d");
        assert_eq!(q.ops.len(), 2);
        assert!(q.ret.unwrap().distinct);
    }

    #[test]
    fn precedence_and_ternary() {
        let q = query("RETURN IS_ARRAY(l) ? d.f IN l : d.f == l");
        let Expr::Ternary(cond, then, otherwise) = q.ret.unwrap().expr else {
            panic!("expected ternary");
        };
        assert!(matches!(*cond, Expr::Call(ref f, _) if f == "IS_ARRAY"));
        assert!(matches!(*then, Expr::Binary(BinaryOp::In, _, _)));
        assert!(matches!(*otherwise, Expr::Binary(BinaryOp::Eq, _, _)));

        let q = query("RETURN 1 + 2 * 3 == 7 AND NOT false");
        let Expr::Binary(BinaryOp::And, left, right) = q.ret.unwrap().expr else {
            panic!("expected AND");
        };
        assert!(matches!(*left, Expr::Binary(BinaryOp::Eq, _, _)));
        assert!(matches!(*right, Expr::Not(_)));
    }

    #[test]
    fn not_in() {
        let q = query("RETURN 1 NOT IN [2, 3]");
        assert!(matches!(
            q.ret.unwrap().expr,
            Expr::Binary(BinaryOp::NotIn, _, _)
        ));
    }

    #[test]
    fn subqueries_and_lets() {
        let q = query("LET s = (\n  FOR d IN xs\n  RETURN d\n)\nFOR r IN s RETURN r");
        let Op::Let { value, .. } = &q.ops[0] else {
            panic!("expected LET");
        };
        assert!(matches!(value, Expr::Subquery(_)));
    }

    #[test]
    fn collect_forms() {
        let q = query("FOR d IN xs COLLECT WITH COUNT INTO n RETURN n");
        let Op::Collect(c) = &q.ops[1] else { panic!() };
        assert_eq!(c.count_into.as_deref(), Some("n"));
        assert!(c.groups.is_empty());

        let q =
            query("FOR d IN xs COLLECT city = d.city AGGREGATE total = SUM(d.n) INTO g RETURN g");
        let Op::Collect(c) = &q.ops[1] else { panic!() };
        assert_eq!(c.groups[0].0, "city");
        assert_eq!(c.aggregates[0].0, "total");
        assert_eq!(c.into.as_ref().map(|i| i.0.as_str()), Some("g"));

        let q = query("FOR d IN xs COLLECT collection = d.kind RETURN collection");
        let Op::Collect(c) = &q.ops[1] else { panic!() };
        assert_eq!(c.groups[0].0, "collection");
    }

    #[test]
    fn modifications() {
        let s = parse(r#"FOR r IN [{"a":1}] INSERT r INTO `users` RETURN NEW"#).unwrap();
        assert!(s.modifies);
        let s = parse(r#"REMOVE "k" IN `users` RETURN OLD"#).unwrap();
        assert!(s.modifies);
        assert!(matches!(
            &s.query.ops[0],
            Op::Remove { key: Expr::Literal(k), collection } if k == "k" && collection == "users"
        ));
        let s = parse("FOR d IN xs REMOVE d IN xs").unwrap();
        assert!(s.query.ret.is_none());
        assert!(!parse("FOR d IN xs RETURN d").unwrap().modifies);
    }

    #[test]
    fn object_literals() {
        let q = query(r#"RETURN { "a": 1, b: 2, c }"#);
        let Expr::Object(entries) = q.ret.unwrap().expr else { panic!() };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], ("c".to_string(), Expr::Name("c".into())));
    }

    #[test]
    fn errors() {
        assert!(parse("FOR d IN xs").is_err());
        assert!(parse("RETURN").is_err());
        assert!(parse("RETURN 1 2").is_err());
        assert!(parse("LET FOR = 1 RETURN 1").is_err());
        assert!(parse("RETURN (1").is_err());
    }
}
