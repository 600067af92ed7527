use serde_json::{Map, Value};

use super::value::{compare, equals, number_to_value, to_number, to_text, truthy};
use crate::error::{Error, Result};

/// Functions that `COLLECT ... AGGREGATE` accepts. Each is applied to the
/// array of per-row argument values.
pub(crate) const AGGREGATES: &[&str] = &[
    "LENGTH", "COUNT", "MIN", "MAX", "SUM", "AVERAGE", "AVG", "UNIQUE",
];

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(Error::InvalidQuery(format!(
            "{name}() takes {min}..={max} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

/// Call a built-in function. `RAND` is handled by the evaluator.
pub(crate) fn call(name: &str, args: Vec<Value>) -> Result<Value> {
    match name {
        "LENGTH" | "COUNT" => {
            arity(name, &args, 1, 1)?;
            Ok(length(&args[0]))
        }
        "MERGE" => {
            arity(name, &args, 1, usize::MAX)?;
            Ok(merge(args))
        }
        "TO_ARRAY" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Array(to_array(&args[0])))
        }
        "IS_ARRAY" => type_test(name, &args, Value::is_array),
        "IS_OBJECT" => type_test(name, &args, Value::is_object),
        "IS_NULL" => type_test(name, &args, Value::is_null),
        "IS_STRING" => type_test(name, &args, Value::is_string),
        "IS_NUMBER" => type_test(name, &args, Value::is_number),
        "NOT_NULL" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "FLATTEN" => {
            arity(name, &args, 1, 2)?;
            let depth = args.get(1).map(to_number).unwrap_or(1.0).max(0.0) as usize;
            match &args[0] {
                Value::Array(items) => Ok(Value::Array(flatten(items, depth))),
                _ => Ok(Value::Null),
            }
        }
        "SUM" => array_fold(name, &args, sum),
        "MIN" => array_fold(name, &args, |items| extreme(items, true)),
        "MAX" => array_fold(name, &args, |items| extreme(items, false)),
        "AVERAGE" | "AVG" => array_fold(name, &args, average),
        "FIRST" => array_fold(name, &args, |items| {
            items.first().cloned().unwrap_or(Value::Null)
        }),
        "LAST" => array_fold(name, &args, |items| {
            items.last().cloned().unwrap_or(Value::Null)
        }),
        "UNIQUE" => array_fold(name, &args, |items| Value::Array(unique(items))),
        "CONCAT" => {
            let mut out = String::new();
            for arg in &args {
                match arg {
                    Value::Array(items) => items.iter().for_each(|v| out.push_str(&to_text(v))),
                    other => out.push_str(&to_text(other)),
                }
            }
            Ok(Value::String(out))
        }
        "LOWER" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(to_text(&args[0]).to_lowercase()))
        }
        "UPPER" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(to_text(&args[0]).to_uppercase()))
        }
        "TO_NUMBER" => {
            arity(name, &args, 1, 1)?;
            Ok(number_to_value(to_number(&args[0])))
        }
        "TO_STRING" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(to_text(&args[0])))
        }
        "TO_BOOL" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(truthy(&args[0])))
        }
        "KEYS" | "ATTRIBUTES" => {
            arity(name, &args, 1, 3)?;
            match &args[0] {
                Value::Object(map) => Ok(Value::Array(
                    map.keys().map(|k| Value::String(k.clone())).collect(),
                )),
                _ => Ok(Value::Null),
            }
        }
        _ => Err(Error::InvalidQuery(format!("unknown function {name}()"))),
    }
}

fn type_test(name: &str, args: &[Value], test: fn(&Value) -> bool) -> Result<Value> {
    arity(name, args, 1, 1)?;
    Ok(Value::Bool(test(&args[0])))
}

/// Apply `f` to a single array argument; null for anything else.
fn array_fold(name: &str, args: &[Value], f: impl Fn(&[Value]) -> Value) -> Result<Value> {
    arity(name, args, 1, 1)?;
    match &args[0] {
        Value::Array(items) => Ok(f(items)),
        _ => Ok(Value::Null),
    }
}

fn length(v: &Value) -> Value {
    let n = match v {
        Value::Null => 0,
        Value::Bool(b) => usize::from(*b),
        Value::Number(n) => n.to_string().len(),
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
    };
    Value::from(n)
}

fn merge(args: Vec<Value>) -> Value {
    let parts = match <[Value; 1]>::try_from(args) {
        Ok([Value::Array(items)]) => items,
        Ok([single]) => vec![single],
        Err(args) => args,
    };
    let mut out = Map::new();
    for part in parts {
        match part {
            Value::Object(map) => out.extend(map),
            _ => return Value::Null,
        }
    }
    Value::Object(out)
}

pub(crate) fn to_array(v: &Value) -> Vec<Value> {
    match v {
        Value::Null => Vec::new(),
        Value::Array(items) => items.clone(),
        Value::Object(map) => map.values().cloned().collect(),
        other => vec![other.clone()],
    }
}

fn flatten(items: &[Value], depth: usize) -> Vec<Value> {
    let mut out = Vec::new();
    for item in items {
        match item {
            Value::Array(inner) if depth > 0 => out.extend(flatten(inner, depth - 1)),
            other => out.push(other.clone()),
        }
    }
    out
}

/// Nulls are ignored.
fn sum(items: &[Value]) -> Value {
    let total: f64 = items
        .iter()
        .filter(|v| !v.is_null())
        .map(to_number)
        .sum();
    number_to_value(total)
}

fn average(items: &[Value]) -> Value {
    let numbers: Vec<f64> = items
        .iter()
        .filter(|v| !v.is_null())
        .map(to_number)
        .collect();
    if numbers.is_empty() {
        return Value::Null;
    }
    number_to_value(numbers.iter().sum::<f64>() / numbers.len() as f64)
}

/// Smallest (`min == true`) or largest non-null item.
fn extreme(items: &[Value], min: bool) -> Value {
    let mut best: Option<&Value> = None;
    for item in items.iter().filter(|v| !v.is_null()) {
        best = Some(match best {
            None => item,
            Some(current) => {
                let ord = compare(item, current);
                if (min && ord.is_lt()) || (!min && ord.is_gt()) {
                    item
                } else {
                    current
                }
            }
        });
    }
    best.cloned().unwrap_or(Value::Null)
}

fn unique(items: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for item in items {
        if !out.iter().any(|seen| equals(seen, item)) {
            out.push(item.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call1(name: &str, arg: Value) -> Value {
        call(name, vec![arg]).unwrap()
    }

    #[test]
    fn length_of_each_type() {
        assert_eq!(call1("LENGTH", json!(null)), json!(0));
        assert_eq!(call1("LENGTH", json!([1, 2, 3])), json!(3));
        assert_eq!(call1("LENGTH", json!({"a": 1})), json!(1));
        assert_eq!(call1("LENGTH", json!("héllo")), json!(5));
        assert_eq!(call1("COUNT", json!([])), json!(0));
    }

    #[test]
    fn merge_objects() {
        assert_eq!(
            call("MERGE", vec![json!({"a": 1, "b": 1}), json!({"b": 2})]).unwrap(),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(
            call1("MERGE", json!([{"a": 1}, {"c": 3}])),
            json!({"a": 1, "c": 3})
        );
        assert_eq!(call("MERGE", vec![json!({}), json!(1)]).unwrap(), json!(null));
    }

    #[test]
    fn to_array_wraps_scalars() {
        assert_eq!(call1("TO_ARRAY", json!(null)), json!([]));
        assert_eq!(call1("TO_ARRAY", json!("x")), json!(["x"]));
        assert_eq!(call1("TO_ARRAY", json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn numeric_aggregates() {
        let xs = json!([3, null, 1, 2]);
        assert_eq!(call1("SUM", xs.clone()), json!(6));
        assert_eq!(call1("MIN", xs.clone()), json!(1));
        assert_eq!(call1("MAX", xs.clone()), json!(3));
        assert_eq!(call1("AVERAGE", xs), json!(2));
        assert_eq!(call1("AVG", json!([])), json!(null));
        assert_eq!(call1("SUM", json!([])), json!(0));
        assert_eq!(call1("SUM", json!("nope")), json!(null));
    }

    #[test]
    fn flatten_and_unique() {
        assert_eq!(call1("FLATTEN", json!([1, [2, [3]]])), json!([1, 2, [3]]));
        assert_eq!(
            call("FLATTEN", vec![json!([1, [2, [3]]]), json!(2)]).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(call1("UNIQUE", json!([1, 1.0, "1", 2])), json!([1, "1", 2]));
    }

    #[test]
    fn strings() {
        assert_eq!(
            call("CONCAT", vec![json!("a"), json!(1), json!(null), json!(["b", "c"])]).unwrap(),
            json!("a1bc")
        );
        assert_eq!(call1("UPPER", json!("ab")), json!("AB"));
        assert_eq!(call1("TO_STRING", json!(12)), json!("12"));
        assert_eq!(call1("TO_NUMBER", json!("4.5")), json!(4.5));
    }

    #[test]
    fn arity_and_unknown() {
        assert!(call("LENGTH", vec![]).is_err());
        assert!(call("SLEEP", vec![json!(1)]).is_err());
    }
}
