use regex::Regex;
use serde_json::{Map, Value};

use crate::compiler::{ContextBinding, Output, PipelineCompiler};
use crate::error::{Error, Result};
use crate::placeholder::PlaceholderRewriter;
use crate::stage::{Coordinate, Fragment, Lookup, Sample, Stage};
use crate::validate::{self, is_field_path};

/// The two halves of a compiled stage: the clauses that run inside the
/// stage's `FOR` loop, and the tail that shapes each output row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StageClauses {
    pub body: Vec<String>,
    pub ret: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Quote `s` as a string literal. JSON string syntax is valid AQL.
fn literal(s: &str) -> String {
    Value::String(s.to_owned()).to_string()
}

fn is_falsy(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn fragment(rw: &PlaceholderRewriter, f: &Fragment, coord: Coordinate) -> String {
    match f {
        Fragment::Int(n) => n.to_string(),
        Fragment::Text(s) => rw.rewrite(s, coord),
    }
}

/// Extracts the variables a `COLLECT` clause introduces.
#[derive(Debug, Clone)]
pub(crate) struct GroupNames {
    assignment: Regex,
    into: Regex,
}

impl GroupNames {
    pub fn new() -> Result<Self> {
        let assignment = Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s*=(?:[^=]|$)")
            .map_err(|e| Error::InvalidConfig(format!("group pattern: {e}")))?;
        let into = Regex::new(r"(?i)\bINTO\s+([A-Za-z_][A-Za-z0-9_]*)")
            .map_err(|e| Error::InvalidConfig(format!("group pattern: {e}")))?;
        Ok(Self { assignment, into })
    }

    /// Names in order of appearance, without duplicates.
    pub fn extract(&self, group: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let found = self
            .assignment
            .captures_iter(group)
            .chain(self.into.captures_iter(group))
            .map(|c| c[1].to_string());
        for name in found {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

// ---------------------------------------------------------------------------
// Stage serialization
// ---------------------------------------------------------------------------

pub(crate) fn serialize(
    compiler: &PipelineCompiler,
    stage: &Stage,
    coord: Coordinate,
) -> Result<StageClauses> {
    let rw = compiler.rewriter();
    let var = rw.variable(coord);
    let mut body = Vec::new();

    let mut conditions = Vec::new();
    if let Some(filter) = &stage.filter {
        conditions.push(format!("({})", rw.rewrite(filter, coord)));
    } else if let Some(fields) = &stage.match_fields {
        conditions.extend(match_conditions(&var, fields)?);
    }
    // Failed joins surface as null documents.
    conditions.push(format!("{var} != null"));
    body.push(format!("FILTER {}", conditions.join(" AND ")));

    let sample = stage
        .sample
        .as_ref()
        .map(|s| sample_with_defaults(compiler, s));
    if let Some(sample) = &sample {
        if let Some(chance) = sample.chance {
            body.push(format!("FILTER RAND() < {chance}"));
        }
    }

    if let Some(lookup) = &stage.lookup {
        body.extend(lookup_clauses(compiler, lookup, coord, &var)?);
    }

    if let Some(group) = &stage.group_by {
        body.push(collect_clause(&rw.rewrite(group, coord)));
    }

    if let Some(sort) = &stage.sort {
        body.push(format!("SORT {}", rw.rewrite(sort, coord)));
    }

    // `$skip` without `$limit` has no effect.
    if let Some(limit) = &stage.limit {
        let limit = fragment(rw, limit, coord);
        match &stage.skip {
            Some(skip) => body.push(format!("LIMIT {}, {limit}", fragment(rw, skip, coord))),
            None => body.push(format!("LIMIT {limit}")),
        }
    }

    if let Some(sample) = &sample {
        body.push(format!("LIMIT {}, {}", sample.skip.unwrap_or(0), sample.size));
    }

    let ret = return_clause(compiler, stage, coord, &var)?;
    Ok(StageClauses { body, ret })
}

/// `$match`: strings compare for equality, arrays test membership.
fn match_conditions(var: &str, fields: &Map<String, Value>) -> Result<Vec<String>> {
    fields
        .iter()
        .map(|(field, value)| match value {
            Value::String(s) => Ok(format!("{var}.{field} == {}", literal(s))),
            Value::Array(_) => Ok(format!("{var}.{field} IN {value}")),
            other => Err(Error::UnsupportedValue {
                operator: "$match",
                value: other.to_string(),
            }),
        })
        .collect()
}

/// Copy of `sample` with omitted `chance`/`skip` filled in. The caller's
/// stage is left as it was.
fn sample_with_defaults(compiler: &PipelineCompiler, sample: &Sample) -> Sample {
    let opts = compiler.options();
    Sample {
        size: sample.size,
        skip: Some(
            sample
                .skip
                .unwrap_or_else(|| compiler.random().next_below(opts.sample_skip_bound)),
        ),
        chance: Some(sample.chance.unwrap_or(opts.sample_chance)),
    }
}

fn collect_clause(group: &str) -> String {
    let trimmed = group.trim_start();
    let has_keyword = trimmed
        .get(..7)
        .is_some_and(|k| k.eq_ignore_ascii_case("COLLECT"))
        && trimmed[7..].chars().next().is_none_or(char::is_whitespace);
    if has_keyword {
        trimmed.to_string()
    } else {
        format!("COLLECT {trimmed}")
    }
}

/// Compile the join's nested pipeline one level deeper and bind its rows to
/// the stage's join variable.
fn lookup_clauses(
    compiler: &PipelineCompiler,
    lookup: &Lookup,
    coord: Coordinate,
    var: &str,
) -> Result<Vec<String>> {
    let mut context = Vec::new();
    if let Some(bindings) = &lookup.let_bindings {
        for (name, field) in bindings {
            validate::binding_name(name, compiler.rewriter().placeholder())?;
            context.push(ContextBinding::new(name, format!("{var}.{field}")));
        }
    }

    let mut stages = Vec::with_capacity(lookup.pipeline.len() + 1);
    if let (Some(local), Some(foreign)) = (&lookup.local_field, &lookup.foreign_field) {
        let local_value = coord.local();
        context.push(ContextBinding::new(&local_value, format!("{var}.{local}")));
        let p = compiler.rewriter().placeholder();
        stages.push(Stage::with_filter(format!(
            "IS_ARRAY({local_value}) ? {p}.{foreign} IN {local_value} : {p}.{foreign} == {local_value}"
        )));
    }
    stages.extend(lookup.pipeline.iter().cloned());

    let nested = compiler.compile_at(&lookup.from, &stages, coord.depth + 1, &context)?;
    let join = coord.join();
    Ok(match nested.output {
        Output::Rows => vec![format!("LET {join} = (\n{}\n)", indent(&nested.text))],
        Output::Binding(last) => vec![nested.text, format!("LET {join} = {last}")],
    })
}

pub(crate) fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Return clause
// ---------------------------------------------------------------------------

/// Priority: `$count`, `$unwind`, `$project`, `$lookup` merge, `$groupBy`
/// projection, then the whole document.
///
/// `COLLECT` hides the loop variable and the join variable, so a stage that
/// groups never merges or projects its `$lookup` result directly. The join
/// rows stay reachable through the group's `INTO` variable.
fn return_clause(
    compiler: &PipelineCompiler,
    stage: &Stage,
    coord: Coordinate,
    var: &str,
) -> Result<String> {
    if let Some(field) = &stage.count {
        let counter = coord.counter();
        return Ok(format!(
            "COLLECT WITH COUNT INTO {counter} RETURN {{ {}: {counter} }}",
            literal(field)
        ));
    }

    if let Some(field) = &stage.unwind {
        let item = coord.unwound();
        return Ok(format!(
            "FOR {item} IN TO_ARRAY({var}.{field}) RETURN MERGE({var}, {{ {}: {item} }})",
            literal(field)
        ));
    }

    if let Some(project) = &stage.project {
        return projection(compiler.rewriter(), stage, project, coord, var);
    }

    if let (Some(lookup), None) = (&stage.lookup, &stage.group_by) {
        return Ok(format!(
            "RETURN MERGE({var}, {{ {}: {} }})",
            literal(&lookup.alias),
            coord.join()
        ));
    }

    if let Some(group) = &stage.group_by {
        let names = compiler.group_names().extract(group);
        let entries: Vec<String> = names
            .iter()
            .map(|name| format!("{}: {name}", literal(name)))
            .collect();
        return Ok(format!("RETURN {}", object(&entries)));
    }

    Ok(format!("RETURN {var}"))
}

fn projection(
    rw: &PlaceholderRewriter,
    stage: &Stage,
    project: &Map<String, Value>,
    coord: Coordinate,
    var: &str,
) -> Result<String> {
    let mut entries = Vec::with_capacity(project.len() + 1);
    for (name, value) in project {
        if is_falsy(value) {
            continue;
        }
        let source = match value {
            Value::String(s) => match s.strip_prefix('$') {
                Some(path) if is_field_path(path) => format!("{var}.{path}"),
                Some(_) => {
                    return Err(Error::UnsupportedValue {
                        operator: "$project",
                        value: value.to_string(),
                    });
                }
                None => rw.rewrite(s, coord),
            },
            _ => format!("{var}.{name}"),
        };
        entries.push(format!("{}: {source}", literal(name)));
    }
    if let (Some(lookup), None) = (&stage.lookup, &stage.group_by) {
        entries.push(format!("{}: {}", literal(&lookup.alias), coord.join()));
    }
    Ok(format!("RETURN {}", object(&entries)))
}

fn object(entries: &[String]) -> String {
    if entries.is_empty() {
        "{}".to_string()
    } else {
        format!("{{ {} }}", entries.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::CompilerOptions;
    use crate::random::FixedSequence;
    use serde_json::json;

    fn compiler() -> PipelineCompiler {
        PipelineCompiler::new(
            CompilerOptions::default(),
            Arc::new(FixedSequence::new(vec![42])),
        )
        .unwrap()
    }

    fn stage(v: Value) -> Stage {
        serde_json::from_value(v).unwrap()
    }

    fn root() -> Coordinate {
        Coordinate::new(0, 0)
    }

    // -----------------------------------------------------------------------
    // $match / $filter
    // -----------------------------------------------------------------------

    #[test]
    fn match_string_is_equality() {
        let c = compiler();
        let out = serialize(&c, &stage(json!({"$match": {"name": "Ada"}})), root()).unwrap();
        assert_eq!(
            out.body,
            vec![r#"FILTER doc_0_0.name == "Ada" AND doc_0_0 != null"#]
        );
        assert_eq!(out.ret, "RETURN doc_0_0");
    }

    #[test]
    fn match_array_is_membership() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$match": {"tag": ["a", "b"]}})),
            Coordinate::new(0, 1),
        )
        .unwrap();
        assert_eq!(
            out.body[0],
            r#"FILTER doc_0_1.tag IN ["a","b"] AND doc_0_1 != null"#
        );
    }

    #[test]
    fn match_rejects_other_types() {
        let c = compiler();
        for value in [json!(42), json!(true), json!(null), json!({"$gt": 1})] {
            let err = serialize(&c, &stage(json!({"$match": {"age": value}})), root()).unwrap_err();
            match err {
                Error::UnsupportedValue { operator, value: v } => {
                    assert_eq!(operator, "$match");
                    assert_eq!(v, value.to_string());
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn match_string_is_escaped() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$match": {"name": "x\" || true || \""}})),
            root(),
        )
        .unwrap();
        assert_eq!(
            out.body[0],
            r#"FILTER doc_0_0.name == "x\" || true || \"" AND doc_0_0 != null"#
        );
    }

    #[test]
    fn filter_replaces_match() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$match": {"name": "Ada"}, "$filter": "doc.age > 30"})),
            root(),
        )
        .unwrap();
        assert_eq!(out.body[0], "FILTER (doc_0_0.age > 30) AND doc_0_0 != null");
    }

    #[test]
    fn empty_stage_only_excludes_nulls() {
        let c = compiler();
        let out = serialize(&c, &Stage::default(), root()).unwrap();
        assert_eq!(out.body, vec!["FILTER doc_0_0 != null"]);
        assert_eq!(out.ret, "RETURN doc_0_0");
    }

    // -----------------------------------------------------------------------
    // $sort / $limit / $skip / $sample
    // -----------------------------------------------------------------------

    #[test]
    fn sort_and_paging() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$sort": "doc.name DESC", "$limit": 10, "$skip": 20})),
            Coordinate::new(1, 2),
        )
        .unwrap();
        assert_eq!(out.body[1], "SORT doc_1_2.name DESC");
        assert_eq!(out.body[2], "LIMIT 20, 10");
    }

    #[test]
    fn skip_without_limit_is_ignored() {
        let c = compiler();
        let out = serialize(&c, &stage(json!({"$skip": 5})), root()).unwrap();
        assert_eq!(out.body.len(), 1);
    }

    #[test]
    fn sample_defaults_come_from_random_source() {
        let c = compiler();
        let s = stage(json!({"$sample": {"size": 3}}));
        let out = serialize(&c, &s, root()).unwrap();
        assert_eq!(out.body[1], "FILTER RAND() < 0.5");
        assert_eq!(out.body[2], "LIMIT 42, 3");
        // the caller's stage is not modified
        assert_eq!(s.sample().unwrap().skip, None);
        assert_eq!(s.sample().unwrap().chance, None);
    }

    #[test]
    fn sample_explicit_values() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$sample": {"size": 2, "skip": 0, "chance": 1.0}})),
            root(),
        )
        .unwrap();
        assert_eq!(out.body[1], "FILTER RAND() < 1");
        assert_eq!(out.body[2], "LIMIT 0, 2");
    }

    // -----------------------------------------------------------------------
    // Return clauses
    // -----------------------------------------------------------------------

    #[test]
    fn count_wins_over_everything() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$count": "n", "$unwind": "tags", "$project": {"a": 1}})),
            root(),
        )
        .unwrap();
        assert_eq!(
            out.ret,
            r#"COLLECT WITH COUNT INTO count_0_0 RETURN { "n": count_0_0 }"#
        );
    }

    #[test]
    fn unwind_flattens_field() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$unwind": "tags", "$project": {"a": 1}})),
            root(),
        )
        .unwrap();
        assert_eq!(
            out.ret,
            r#"FOR unwind_0_0 IN TO_ARRAY(doc_0_0.tags) RETURN MERGE(doc_0_0, { "tags": unwind_0_0 })"#
        );
    }

    #[test]
    fn project_variants() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$project": {
                "gone": false,
                "hidden": 0,
                "name": 1,
                "size": "LENGTH(doc.items)",
                "title": "$headline"
            }})),
            root(),
        )
        .unwrap();
        assert_eq!(
            out.ret,
            r#"RETURN { "name": doc_0_0.name, "size": LENGTH(doc_0_0.items), "title": doc_0_0.headline }"#
        );
    }

    #[test]
    fn project_rejects_malformed_alias() {
        let c = compiler();
        let err = serialize(
            &c,
            &stage(json!({"$project": {"x": "$a b"}})),
            root(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedValue { operator: "$project", .. }));
    }

    #[test]
    fn project_includes_lookup_alias() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({
                "$lookup": {"from": "orders", "as": "orders", "pipeline": []},
                "$project": {"name": 1}
            })),
            root(),
        )
        .unwrap();
        assert_eq!(
            out.ret,
            r#"RETURN { "name": doc_0_0.name, "orders": join_0_0 }"#
        );
    }

    #[test]
    fn group_by_projects_assigned_names() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$groupBy": "city = doc.city INTO members"})),
            root(),
        )
        .unwrap();
        assert_eq!(out.body[1], "COLLECT city = doc_0_0.city INTO members");
        assert_eq!(
            out.ret,
            r#"RETURN { "city": city, "members": members }"#
        );
    }

    #[test]
    fn group_by_keyword_is_not_doubled() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$groupBy": "COLLECT AGGREGATE total = SUM(doc.n)"})),
            root(),
        )
        .unwrap();
        assert_eq!(out.body[1], "COLLECT AGGREGATE total = SUM(doc_0_0.n)");
        assert_eq!(out.ret, r#"RETURN { "total": total }"#);
    }

    #[test]
    fn group_by_identifier_starting_with_collect() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$groupBy": "collection = doc.kind"})),
            root(),
        )
        .unwrap();
        assert_eq!(out.body[1], "COLLECT collection = doc_0_0.kind");
    }

    #[test]
    fn group_names_ignore_comparisons() {
        let names = GroupNames::new()
            .unwrap()
            .extract("k = doc.a >= 2, m = doc.b == 1 WITH COUNT INTO n");
        assert_eq!(names, vec!["k", "m", "n"]);
    }

    #[test]
    fn group_by_wins_over_lookup_merge() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({
                "$groupBy": "g = doc.g INTO m",
                "$lookup": {"from": "orders", "as": "orders", "pipeline": []}
            })),
            root(),
        )
        .unwrap();
        assert!(out.body[1].starts_with("LET join_0_0 = ("));
        assert_eq!(out.body[2], "COLLECT g = doc_0_0.g INTO m");
        assert_eq!(out.ret, r#"RETURN { "g": g, "m": m }"#);
    }

    // -----------------------------------------------------------------------
    // $lookup
    // -----------------------------------------------------------------------

    #[test]
    fn lookup_with_join_keys_binds_local_value() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$lookup": {
                "from": "orders",
                "localField": "_key",
                "foreignField": "owner",
                "as": "orders",
                "pipeline": []
            }})),
            root(),
        )
        .unwrap();
        let lookup = &out.body[1];
        assert!(lookup.starts_with("LET join_0_0 = (\n"));
        assert!(lookup.contains("LET local_0_0 = doc_0_0._key"));
        assert!(lookup.contains(
            "FILTER (IS_ARRAY(local_0_0) ? doc_1_0.owner IN local_0_0 : doc_1_0.owner == local_0_0) AND doc_1_0 != null"
        ));
        assert_eq!(
            out.ret,
            r#"RETURN MERGE(doc_0_0, { "orders": join_0_0 })"#
        );
    }

    #[test]
    fn lookup_with_let_bindings() {
        let c = compiler();
        let out = serialize(
            &c,
            &stage(json!({"$lookup": {
                "from": "orders",
                "let": {"owner": "_key"},
                "as": "orders",
                "pipeline": [{"$filter": "doc.owner == owner"}, {"$sort": "doc.total"}]
            }})),
            Coordinate::new(0, 1),
        )
        .unwrap();
        // two nested stages: inlined, and the last binding is referenced
        assert!(out.body[1].starts_with("LET owner = doc_0_1._key\nLET stage_1_0 = ("));
        assert!(out.body[1].contains("FILTER (doc_1_0.owner == owner) AND doc_1_0 != null"));
        assert!(out.body[1].contains("FOR doc_1_1 IN stage_1_0"));
        assert_eq!(out.body[2], "LET join_0_1 = stage_1_1");
    }

    #[test]
    fn lookup_let_rejects_placeholder_name() {
        let c = compiler();
        let err = serialize(
            &c,
            &stage(json!({"$lookup": {
                "from": "orders",
                "let": {"doc": "name"},
                "as": "o",
                "pipeline": [{"$filter": "doc.user == doc"}]
            }})),
            root(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Injection));
    }

    #[test]
    fn lookup_let_rejects_keyword_name() {
        let c = compiler();
        let err = serialize(
            &c,
            &stage(json!({"$lookup": {
                "from": "orders",
                "let": {"filter": "name"},
                "as": "o",
                "pipeline": []
            }})),
            root(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Injection));
    }

    #[test]
    fn lookup_let_rejects_generated_names() {
        let c = compiler();
        for name in ["stage_1_0", "local_0_0", "join_0_0", "row_1", "doc_1_0"] {
            let mut bindings = Map::new();
            bindings.insert(name.to_string(), json!("name"));
            let err = serialize(
                &c,
                &stage(json!({"$lookup": {
                    "from": "orders",
                    "let": bindings,
                    "as": "o",
                    "pipeline": []
                }})),
                root(),
            )
            .unwrap_err();
            assert!(matches!(err, Error::Injection), "{name}");
        }
    }
}
