use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::Store;
use super::functions::{self, AGGREGATES};
use super::parser::{BinaryOp, Collect, Expr, Op, Query};
use super::value::{Ordered, attribute, compare, equals, number_to_value, to_number, truthy};
use crate::error::{Error, Result};

/// Variables bound in one row of a query level, in binding order.
type Row = Vec<(String, Value)>;

fn bind(row: &mut Row, name: &str, value: Value) {
    match row.iter_mut().find(|(n, _)| n == name) {
        Some(slot) => slot.1 = value,
        None => row.push((name.to_string(), value)),
    }
}

/// Variable lookup through the current row and then the enclosing query
/// levels.
#[derive(Clone, Copy)]
struct Env<'a> {
    row: &'a Row,
    parent: Option<&'a Env<'a>>,
}

impl<'a> Env<'a> {
    fn lookup(&self, name: &str) -> Option<&'a Value> {
        self.row
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.parent.and_then(|p| p.lookup(name)))
    }
}

pub(crate) enum Access<'s> {
    Read(&'s Store),
    Write(&'s mut Store),
}

impl Access<'_> {
    fn store(&self) -> &Store {
        match self {
            Access::Read(store) => *store,
            Access::Write(store) => &**store,
        }
    }

    fn store_mut(&mut self) -> Result<&mut Store> {
        match self {
            Access::Read(_) => Err(Error::InvalidQuery(
                "modification in a read-only query".into(),
            )),
            Access::Write(store) => Ok(&mut **store),
        }
    }
}

/// Runs a parsed query against a [`Store`].
pub(crate) struct Evaluator<'s> {
    access: Access<'s>,
}

impl<'s> Evaluator<'s> {
    pub fn new(access: Access<'s>) -> Self {
        Self { access }
    }

    pub fn run(&mut self, query: &Query) -> Result<Vec<Value>> {
        self.query(query, None)
    }

    fn query(&mut self, query: &Query, parent: Option<&Env<'_>>) -> Result<Vec<Value>> {
        let mut rows: Vec<Row> = vec![Row::new()];
        for op in &query.ops {
            rows = self.apply(op, rows, parent)?;
        }

        let Some(ret) = &query.ret else {
            return Ok(Vec::new());
        };
        let mut out: Vec<Value> = Vec::with_capacity(rows.len());
        for row in &rows {
            let value = self.eval(&ret.expr, &Env { row, parent })?;
            if ret.distinct && out.iter().any(|seen| equals(seen, &value)) {
                continue;
            }
            out.push(value);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    fn apply(&mut self, op: &Op, rows: Vec<Row>, parent: Option<&Env<'_>>) -> Result<Vec<Row>> {
        match op {
            Op::For { var, source } => {
                let mut out = Vec::new();
                for row in rows {
                    let items = match self.eval(source, &Env { row: &row, parent })? {
                        Value::Array(items) => items,
                        other => {
                            return Err(Error::InvalidQuery(format!(
                                "FOR {var}: expected an array or collection, got {other}"
                            )));
                        }
                    };
                    for item in items {
                        let mut next = row.clone();
                        bind(&mut next, var, item);
                        out.push(next);
                    }
                }
                Ok(out)
            }

            Op::Let { var, value } => {
                let mut out = Vec::with_capacity(rows.len());
                for mut row in rows {
                    let v = self.eval(value, &Env { row: &row, parent })?;
                    bind(&mut row, var, v);
                    out.push(row);
                }
                Ok(out)
            }

            Op::Filter(cond) => {
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    if truthy(&self.eval(cond, &Env { row: &row, parent })?) {
                        out.push(row);
                    }
                }
                Ok(out)
            }

            Op::Sort(keys) => {
                let mut keyed = Vec::with_capacity(rows.len());
                for row in rows {
                    let env = Env { row: &row, parent };
                    let values = keys
                        .iter()
                        .map(|k| self.eval(&k.expr, &env))
                        .collect::<Result<Vec<Value>>>()?;
                    keyed.push((values, row));
                }
                keyed.sort_by(|(a, _), (b, _)| {
                    keys.iter()
                        .zip(a.iter().zip(b))
                        .map(|(k, (x, y))| {
                            let ord = compare(x, y);
                            if k.descending { ord.reverse() } else { ord }
                        })
                        .find(|ord| ord.is_ne())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                Ok(keyed.into_iter().map(|(_, row)| row).collect())
            }

            Op::Limit { offset, count } => {
                let empty = Row::new();
                let env = Env {
                    row: &empty,
                    parent,
                };
                let offset = match offset {
                    Some(expr) => self.count_value(expr, &env)?,
                    None => 0,
                };
                let count = self.count_value(count, &env)?;
                Ok(rows.into_iter().skip(offset).take(count).collect())
            }

            Op::Collect(collect) => self.collect(collect, rows, parent),

            Op::Insert {
                document,
                collection,
            } => {
                let mut out = Vec::with_capacity(rows.len());
                for mut row in rows {
                    let doc = self.eval(document, &Env { row: &row, parent })?;
                    let stored = self.access.store_mut()?.insert(collection, doc)?;
                    bind(&mut row, "NEW", stored);
                    out.push(row);
                }
                Ok(out)
            }

            Op::Remove {
                key: key_expr,
                collection,
            } => {
                let mut out = Vec::with_capacity(rows.len());
                for mut row in rows {
                    let key = match self.eval(key_expr, &Env { row: &row, parent })? {
                        Value::String(k) => k,
                        Value::Object(map) => match map.get("_key") {
                            Some(Value::String(k)) => k.clone(),
                            _ => {
                                return Err(Error::InvalidQuery(
                                    "REMOVE: document has no _key".into(),
                                ));
                            }
                        },
                        other => {
                            return Err(Error::InvalidQuery(format!(
                                "REMOVE: expected a key or document, got {other}"
                            )));
                        }
                    };
                    let removed = self.access.store_mut()?.remove(collection, &key)?;
                    bind(&mut row, "OLD", removed);
                    out.push(row);
                }
                Ok(out)
            }
        }
    }

    fn count_value(&mut self, expr: &Expr, env: &Env<'_>) -> Result<usize> {
        let v = self.eval(expr, env)?;
        v.as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                Error::InvalidQuery(format!("LIMIT expects a non-negative integer, got {v}"))
            })
    }

    /// Groups come out sorted by their group values. Without group
    /// assignments every row lands in a single group, which exists even
    /// when there are no rows.
    fn collect(
        &mut self,
        collect: &Collect,
        rows: Vec<Row>,
        parent: Option<&Env<'_>>,
    ) -> Result<Vec<Row>> {
        let mut groups: BTreeMap<Vec<Ordered>, Vec<Row>> = BTreeMap::new();
        if collect.groups.is_empty() {
            groups.insert(Vec::new(), rows);
        } else {
            for row in rows {
                let env = Env { row: &row, parent };
                let key = collect
                    .groups
                    .iter()
                    .map(|(_, expr)| self.eval(expr, &env).map(Ordered))
                    .collect::<Result<Vec<Ordered>>>()?;
                groups.entry(key).or_default().push(row);
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (key, members) in groups {
            let mut row = Row::new();
            for ((name, _), value) in collect.groups.iter().zip(key) {
                bind(&mut row, name, value.0);
            }
            if let Some(name) = &collect.count_into {
                bind(&mut row, name, Value::from(members.len()));
            }
            for (name, expr) in &collect.aggregates {
                let value = self.aggregate(expr, &members, parent)?;
                bind(&mut row, name, value);
            }
            if let Some((name, projection)) = &collect.into {
                let mut items = Vec::with_capacity(members.len());
                for member in &members {
                    items.push(match projection {
                        Some(expr) => self.eval(expr, &Env { row: member, parent })?,
                        None => Value::Object(
                            member.iter().cloned().collect::<Map<String, Value>>(),
                        ),
                    });
                }
                bind(&mut row, name, Value::Array(items));
            }
            out.push(row);
        }
        Ok(out)
    }

    fn aggregate(
        &mut self,
        expr: &Expr,
        members: &[Row],
        parent: Option<&Env<'_>>,
    ) -> Result<Value> {
        let Expr::Call(func, args) = expr else {
            return Err(Error::InvalidQuery("AGGREGATE expects a function call".into()));
        };
        if args.len() != 1 || !AGGREGATES.contains(&func.as_str()) {
            return Err(Error::InvalidQuery(format!("{func}() cannot be used in AGGREGATE")));
        }
        let mut values = Vec::with_capacity(members.len());
        for member in members {
            values.push(self.eval(&args[0], &Env { row: member, parent })?);
        }
        functions::call(func, vec![Value::Array(values)])
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn eval(&mut self, expr: &Expr, env: &Env<'_>) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),

            Expr::Name(name) => match env.lookup(name) {
                Some(v) => Ok(v.clone()),
                None => Ok(Value::Array(self.access.store().documents(name)?)),
            },

            Expr::Attribute(base, name) => Ok(attribute(&self.eval(base, env)?, name)),

            Expr::Index(base, index) => {
                let base = self.eval(base, env)?;
                let index = self.eval(index, env)?;
                Ok(match (&base, &index) {
                    (Value::Array(items), Value::Number(n)) => {
                        let i = n.as_i64().unwrap_or(0);
                        let i = if i < 0 { items.len() as i64 + i } else { i };
                        usize::try_from(i)
                            .ok()
                            .and_then(|i| items.get(i))
                            .cloned()
                            .unwrap_or(Value::Null)
                    }
                    (Value::Object(_), Value::String(name)) => attribute(&base, name),
                    _ => Value::Null,
                })
            }

            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval(item, env))
                .collect::<Result<Vec<Value>>>()
                .map(Value::Array),

            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value, env)?);
                }
                Ok(Value::Object(map))
            }

            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner, env)?))),

            Expr::Negate(inner) => Ok(number_to_value(-to_number(&self.eval(inner, env)?))),

            Expr::Binary(BinaryOp::And, left, right) => {
                let l = self.eval(left, env)?;
                if truthy(&l) { self.eval(right, env) } else { Ok(l) }
            }

            Expr::Binary(BinaryOp::Or, left, right) => {
                let l = self.eval(left, env)?;
                if truthy(&l) { Ok(l) } else { self.eval(right, env) }
            }

            Expr::Binary(op, left, right) => {
                let l = self.eval(left, env)?;
                let r = self.eval(right, env)?;
                Ok(binary(*op, &l, &r))
            }

            Expr::Ternary(cond, then, otherwise) => {
                if truthy(&self.eval(cond, env)?) {
                    self.eval(then, env)
                } else {
                    self.eval(otherwise, env)
                }
            }

            Expr::Call(name, args) if name == "RAND" => {
                if !args.is_empty() {
                    return Err(Error::InvalidQuery("RAND() takes no arguments".into()));
                }
                Ok(number_to_value(rand::random::<f64>()))
            }

            Expr::Call(name, args) => {
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg, env))
                    .collect::<Result<Vec<Value>>>()?;
                functions::call(name, values)
            }

            Expr::Subquery(query) => Ok(Value::Array(self.query(query, Some(env))?)),
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match op {
        BinaryOp::Eq => Value::Bool(equals(l, r)),
        BinaryOp::Ne => Value::Bool(!equals(l, r)),
        BinaryOp::Lt => Value::Bool(compare(l, r).is_lt()),
        BinaryOp::Le => Value::Bool(compare(l, r).is_le()),
        BinaryOp::Gt => Value::Bool(compare(l, r).is_gt()),
        BinaryOp::Ge => Value::Bool(compare(l, r).is_ge()),
        BinaryOp::In => Value::Bool(contains(r, l)),
        BinaryOp::NotIn => Value::Bool(!contains(r, l)),
        BinaryOp::Add => number_to_value(to_number(l) + to_number(r)),
        BinaryOp::Sub => number_to_value(to_number(l) - to_number(r)),
        BinaryOp::Mul => number_to_value(to_number(l) * to_number(r)),
        BinaryOp::Div | BinaryOp::Mod => {
            let divisor = to_number(r);
            if divisor == 0.0 {
                return Value::Null;
            }
            let dividend = to_number(l);
            number_to_value(if op == BinaryOp::Div {
                dividend / divisor
            } else {
                dividend % divisor
            })
        }
        // short-circuit forms are evaluated by the caller
        BinaryOp::And | BinaryOp::Or => Value::Null,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| equals(item, needle)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::parser::parse;
    use serde_json::json;

    fn store() -> Store {
        let mut store = Store::default();
        let people = [
            ("ada", 36, json!(["x", "y"])),
            ("bob", 17, json!([])),
            ("cy", 52, json!(["x"])),
        ];
        for (name, age, tags) in people {
            store
                .insert("people", json!({"name": name, "age": age, "tags": tags}))
                .unwrap();
        }
        store
    }

    fn run(store: &Store, src: &str) -> Vec<Value> {
        let statement = parse(src).unwrap();
        Evaluator::new(Access::Read(store)).run(&statement.query).unwrap()
    }

    fn run_err(store: &Store, src: &str) -> Error {
        let statement = parse(src).unwrap();
        Evaluator::new(Access::Read(store))
            .run(&statement.query)
            .unwrap_err()
    }

    #[test]
    fn for_filter_sort_return() {
        let s = store();
        let rows = run(&s, "FOR p IN people FILTER p.age > 20 SORT p.age DESC RETURN p.name");
        assert_eq!(rows, vec![json!("cy"), json!("ada")]);
    }

    #[test]
    fn limit_with_offset() {
        let s = store();
        let rows = run(&s, "FOR p IN `people` SORT p.name LIMIT 1, 5 RETURN p.name");
        assert_eq!(rows, vec![json!("bob"), json!("cy")]);
    }

    #[test]
    fn let_subquery_and_merge() {
        let s = store();
        let rows = run(
            &s,
            "LET adults = (FOR p IN people FILTER p.age >= 18 RETURN p)\n\
             FOR a IN adults SORT a.name RETURN MERGE(a, { n: LENGTH(adults) }).n",
        );
        assert_eq!(rows, vec![json!(2), json!(2)]);
    }

    #[test]
    fn correlated_subquery_sees_outer_variables() {
        let s = store();
        let rows = run(
            &s,
            "FOR p IN people SORT p.name LET same = (FOR q IN people FILTER q.age == p.age RETURN 1) RETURN LENGTH(same)",
        );
        assert_eq!(rows, vec![json!(1), json!(1), json!(1)]);
    }

    #[test]
    fn collect_with_count_on_empty_input() {
        let s = store();
        let rows = run(
            &s,
            "FOR p IN people FILTER p.age > 100 COLLECT WITH COUNT INTO n RETURN { n }",
        );
        assert_eq!(rows, vec![json!({"n": 0})]);
    }

    #[test]
    fn collect_groups_sorted_with_into() {
        let s = store();
        let rows = run(
            &s,
            "FOR p IN people COLLECT adult = p.age >= 18 INTO members = p.name RETURN { adult, members }",
        );
        assert_eq!(
            rows,
            vec![
                json!({"adult": false, "members": ["bob"]}),
                json!({"adult": true, "members": ["ada", "cy"]}),
            ]
        );
    }

    #[test]
    fn collect_aggregate() {
        let s = store();
        let rows = run(
            &s,
            "FOR p IN people COLLECT AGGREGATE total = SUM(p.age), oldest = MAX(p.age), n = LENGTH(p) RETURN { total, oldest, n }",
        );
        assert_eq!(rows, vec![json!({"total": 105, "oldest": 52, "n": 3})]);
    }

    #[test]
    fn collect_hides_loop_variables() {
        let s = store();
        // `p` is no longer bound, so it resolves as a (missing) collection
        assert!(matches!(
            run_err(&s, "FOR p IN people COLLECT WITH COUNT INTO n RETURN p"),
            Error::CollectionNotFound(name) if name == "p"
        ));
    }

    #[test]
    fn unwind_style_inner_for() {
        let s = store();
        let rows = run(
            &s,
            "FOR p IN people SORT p.name FOR t IN TO_ARRAY(p.tags) RETURN CONCAT(p.name, ':', t)",
        );
        assert_eq!(rows, vec![json!("ada:x"), json!("ada:y"), json!("cy:x")]);
    }

    #[test]
    fn membership_and_ternary() {
        let s = store();
        let rows = run(
            &s,
            r#"LET l = ["ada", "cy"] FOR p IN people FILTER IS_ARRAY(l) ? p.name IN l : p.name == l SORT p.name RETURN p.name"#,
        );
        assert_eq!(rows, vec![json!("ada"), json!("cy")]);
    }

    #[test]
    fn distinct_and_arithmetic() {
        let s = store();
        let rows = run(&s, "FOR x IN [1, 2, 2, 3] RETURN DISTINCT x * 2 % 5");
        assert_eq!(rows, vec![json!(2), json!(4), json!(1)]);
        assert_eq!(run(&s, "RETURN 1 / 0"), vec![json!(null)]);
        assert_eq!(run(&s, "RETURN [10, 20, 30][-1]"), vec![json!(30)]);
    }

    #[test]
    fn missing_collection_is_an_error() {
        let s = store();
        assert!(matches!(
            run_err(&s, "FOR x IN ghosts RETURN x"),
            Error::CollectionNotFound(name) if name == "ghosts"
        ));
    }

    #[test]
    fn read_only_access_refuses_modifications() {
        let s = store();
        assert!(matches!(
            run_err(&s, r#"INSERT {"a": 1} INTO people"#),
            Error::InvalidQuery(_)
        ));
    }

    #[test]
    fn insert_and_remove_bind_new_and_old() {
        let mut s = store();
        let statement =
            parse(r#"FOR d IN [{"name": "dee"}] INSERT d INTO people RETURN NEW._key"#).unwrap();
        let keys = Evaluator::new(Access::Write(&mut s))
            .run(&statement.query)
            .unwrap();
        assert_eq!(keys.len(), 1);

        let statement =
            parse("FOR p IN people FILTER p.age < 18 REMOVE p IN people RETURN OLD.name").unwrap();
        let removed = Evaluator::new(Access::Write(&mut s))
            .run(&statement.query)
            .unwrap();
        assert_eq!(removed, vec![json!("bob")]);
        assert_eq!(s.documents("people").unwrap().len(), 3);
    }
}
