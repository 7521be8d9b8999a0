//! # Pipeline Evaluator
//!
//! Evaluates the subset of the aggregation language the filter compiler
//! emits: `$match` (including `$expr`), `$sort`, `$skip`, `$limit`,
//! `$lookup`, `$unwind`, `$replaceRoot` and `$count`. Used by the
//! in-process connector; unknown stages are rejected.

use std::cmp::Ordering;
use std::collections::HashMap;

use bson::{Bson, Document};
use regex::RegexBuilder;

use super::errors::{DatasourceError, DatasourceResult};

/// Named collections visible to `$lookup`
pub type Collections = HashMap<String, Vec<Document>>;

/// `let` variables, keyed without the `$$` prefix
type Vars = HashMap<String, Bson>;

/// Run `pipeline` over `input`
pub fn run(
    collections: &Collections,
    input: Vec<Document>,
    pipeline: &[Document],
) -> DatasourceResult<Vec<Document>> {
    run_with_vars(collections, input, pipeline, &Vars::new())
}

/// Whether `doc` satisfies a `$match` query
pub fn matches(doc: &Document, query: &Document) -> DatasourceResult<bool> {
    matches_query(doc, query, &Vars::new())
}

fn run_with_vars(
    collections: &Collections,
    mut docs: Vec<Document>,
    pipeline: &[Document],
    vars: &Vars,
) -> DatasourceResult<Vec<Document>> {
    for stage in pipeline {
        let (name, spec) = single_entry(stage)?;
        docs = match name.as_str() {
            "$match" => {
                let query = as_document(spec, "$match")?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches_query(&doc, query, vars)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$sort" => sort(docs, as_document(spec, "$sort")?)?,
            "$skip" => {
                let n = as_count(spec, "$skip")?;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = as_count(spec, "$limit")?;
                if n == 0 {
                    return Err(invalid("$limit must be positive"));
                }
                docs.truncate(n);
                docs
            }
            "$lookup" => lookup(collections, docs, as_document(spec, "$lookup")?, vars)?,
            "$unwind" => unwind(docs, spec)?,
            "$replaceRoot" => {
                let spec = as_document(spec, "$replaceRoot")?;
                let root = spec
                    .get("newRoot")
                    .ok_or_else(|| invalid("$replaceRoot requires newRoot"))?;
                let mut replaced = Vec::with_capacity(docs.len());
                for doc in &docs {
                    match eval_expr(doc, root, vars)? {
                        Bson::Document(new_root) => replaced.push(new_root),
                        _ => return Err(invalid("$replaceRoot newRoot must be a document")),
                    }
                }
                replaced
            }
            "$count" => {
                let field = spec
                    .as_str()
                    .ok_or_else(|| invalid("$count expects a field name"))?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut counted = Document::new();
                    counted.insert(field, docs.len() as i64);
                    vec![counted]
                }
            }
            other => return Err(invalid(format!("unsupported stage {other}"))),
        };
    }
    Ok(docs)
}

fn invalid(message: impl Into<String>) -> DatasourceError {
    DatasourceError::InvalidQuery(message.into())
}

fn single_entry(stage: &Document) -> DatasourceResult<(&String, &Bson)> {
    let mut entries = stage.iter();
    match (entries.next(), entries.next()) {
        (Some(entry), None) => Ok(entry),
        _ => Err(invalid("a pipeline stage must have exactly one key")),
    }
}

fn as_document<'a>(value: &'a Bson, stage: &str) -> DatasourceResult<&'a Document> {
    value
        .as_document()
        .ok_or_else(|| invalid(format!("{stage} expects a document")))
}

fn as_count(value: &Bson, stage: &str) -> DatasourceResult<usize> {
    let n = match value {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        Bson::Double(f) if f.fract() == 0.0 => *f as i64,
        _ => return Err(invalid(format!("{stage} expects an integer"))),
    };
    usize::try_from(n).map_err(|_| invalid(format!("{stage} must not be negative")))
}

// ==================
// $match
// ==================

fn matches_query(doc: &Document, query: &Document, vars: &Vars) -> DatasourceResult<bool> {
    for (key, condition) in query {
        let satisfied = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(condition, "$and")? {
                    if !matches_query(doc, clause, vars)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(condition, "$or")? {
                    if matches_query(doc, clause, vars)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in clauses(condition, "$nor")? {
                    if matches_query(doc, clause, vars)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$expr" => truthy(&eval_expr(doc, condition, vars)?),
            op if op.starts_with('$') => {
                return Err(invalid(format!("unknown top-level operator {op}")))
            }
            field => matches_field(lookup_path(doc, field), condition)?,
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(value: &'a Bson, op: &str) -> DatasourceResult<Vec<&'a Document>> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid(format!("{op} expects an array")))?;
    items
        .iter()
        .map(|item| {
            item.as_document()
                .ok_or_else(|| invalid(format!("{op} entries must be documents")))
        })
        .collect()
}

fn is_operator_document(value: &Bson) -> bool {
    match value {
        Bson::Document(doc) => doc.keys().next().is_some_and(|k| k.starts_with('$')),
        _ => false,
    }
}

fn matches_field(value: Option<&Bson>, condition: &Bson) -> DatasourceResult<bool> {
    if !is_operator_document(condition) {
        if let Bson::RegularExpression(_) = condition {
            return regex_matches(value, condition, "");
        }
        return Ok(equals_or_contains(value, condition));
    }

    let ops = match condition {
        Bson::Document(ops) => ops,
        _ => return Ok(false),
    };
    let options = ops.get_str("$options").unwrap_or("");
    for (op, operand) in ops {
        let satisfied = match op.as_str() {
            "$eq" => equals_or_contains(value, operand),
            "$ne" => !equals_or_contains(value, operand),
            "$gt" => compares(value, operand, |o| o == Ordering::Greater),
            "$gte" => compares(value, operand, |o| o != Ordering::Less),
            "$lt" => compares(value, operand, |o| o == Ordering::Less),
            "$lte" => compares(value, operand, |o| o != Ordering::Greater),
            "$in" => operand_array(operand, "$in")?
                .iter()
                .any(|candidate| equals_or_contains(value, candidate)),
            "$nin" => !operand_array(operand, "$nin")?
                .iter()
                .any(|candidate| equals_or_contains(value, candidate)),
            "$exists" => value.is_some() == truthy(operand),
            "$regex" => regex_matches(value, operand, options)?,
            "$options" => true,
            "$not" => !matches_field(value, operand)?,
            other => return Err(invalid(format!("unknown operator {other}"))),
        };
        if !satisfied {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operand_array<'a>(operand: &'a Bson, op: &str) -> DatasourceResult<&'a Vec<Bson>> {
    operand
        .as_array()
        .ok_or_else(|| invalid(format!("{op} expects an array")))
}

/// Equality with array membership: `{tags: "x"}` matches `tags: ["x", "y"]`
fn equals_or_contains(value: Option<&Bson>, target: &Bson) -> bool {
    match value {
        None => matches!(target, Bson::Null),
        Some(Bson::Array(items)) if !matches!(target, Bson::Array(_)) => {
            items.iter().any(|item| values_equal(item, target))
        }
        Some(v) => values_equal(v, target),
    }
}

fn compares(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        None => false,
        Some(Bson::Array(items)) => items
            .iter()
            .any(|item| compare_values(item, operand).is_some_and(&accept)),
        Some(v) => compare_values(v, operand).is_some_and(accept),
    }
}

fn regex_matches(value: Option<&Bson>, pattern: &Bson, options: &str) -> DatasourceResult<bool> {
    let (pattern, options) = match pattern {
        Bson::String(p) => (p.as_str(), options),
        Bson::RegularExpression(re) => (re.pattern.as_str(), re.options.as_str()),
        _ => return Err(invalid("$regex expects a string")),
    };
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| invalid(format!("bad $regex: {e}")))?;

    Ok(match value {
        Some(Bson::String(s)) => regex.is_match(s),
        Some(Bson::Array(items)) => items
            .iter()
            .any(|item| matches!(item, Bson::String(s) if regex.is_match(s))),
        _ => false,
    })
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Null | Bson::Undefined => false,
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(f) => *f != 0.0,
        _ => true,
    }
}

/// Resolve a dotted path inside a document
fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }
    Some(current)
}

// ==================
// Comparison
// ==================

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    }
}

/// Compare two values of the same type class; `None` when incomparable
fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some(x.cmp(y)),
        (Bson::Int64(x), Bson::Int64(y)) => Some(x.cmp(y)),
        (Bson::Int32(x), Bson::Int64(y)) => Some(i64::from(*x).cmp(y)),
        (Bson::Int64(x), Bson::Int32(y)) => Some(x.cmp(&i64::from(*y))),
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    match compare_values(a, b) {
        Some(ordering) => ordering == Ordering::Equal,
        None => a == b,
    }
}

fn type_rank(value: Option<&Bson>) -> u8 {
    match value {
        None | Some(Bson::Null) | Some(Bson::Undefined) => 0,
        Some(Bson::Int32(_)) | Some(Bson::Int64(_)) | Some(Bson::Double(_)) => 1,
        Some(Bson::String(_)) => 2,
        Some(Bson::Document(_)) => 3,
        Some(Bson::Array(_)) => 4,
        Some(Bson::Binary(_)) => 5,
        Some(Bson::ObjectId(_)) => 6,
        Some(Bson::Boolean(_)) => 7,
        Some(Bson::DateTime(_)) => 8,
        Some(_) => 9,
    }
}

/// Total order used by `$sort`: type class first, then value
fn sort_order(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

fn sort(mut docs: Vec<Document>, spec: &Document) -> DatasourceResult<Vec<Document>> {
    let mut keys = Vec::with_capacity(spec.len());
    for (field, direction) in spec {
        let descending = match as_number(direction) {
            Some(d) if d == 1.0 => false,
            Some(d) if d == -1.0 => true,
            _ => return Err(invalid(format!("bad $sort direction for {field}"))),
        };
        keys.push((field.as_str(), descending));
    }
    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let ordering = sort_order(lookup_path(a, field), lookup_path(b, field));
            if ordering != Ordering::Equal {
                return if *descending { ordering.reverse() } else { ordering };
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

// ==================
// $lookup / $unwind
// ==================

fn lookup(
    collections: &Collections,
    mut docs: Vec<Document>,
    spec: &Document,
    vars: &Vars,
) -> DatasourceResult<Vec<Document>> {
    let from = spec
        .get_str("from")
        .map_err(|_| invalid("$lookup requires from"))?;
    let target = spec
        .get_str("as")
        .map_err(|_| invalid("$lookup requires as"))?
        .to_string();
    let foreign = collections.get(from).cloned().unwrap_or_default();

    let stages = match spec.get("pipeline") {
        Some(Bson::Array(items)) => Some(
            items
                .iter()
                .map(|stage| as_document(stage, "$lookup pipeline").cloned())
                .collect::<DatasourceResult<Vec<Document>>>()?,
        ),
        Some(_) => return Err(invalid("$lookup pipeline must be an array")),
        None => None,
    };

    for doc in docs.iter_mut() {
        let joined = match &stages {
            Some(stages) => {
                let mut inner = vars.clone();
                if let Ok(lets) = spec.get_document("let") {
                    for (name, expr) in lets {
                        inner.insert(name.clone(), eval_expr(doc, expr, vars)?);
                    }
                }
                run_with_vars(collections, foreign.clone(), stages, &inner)?
            }
            None => {
                let local_field = spec
                    .get_str("localField")
                    .map_err(|_| invalid("$lookup requires localField or pipeline"))?;
                let foreign_field = spec
                    .get_str("foreignField")
                    .map_err(|_| invalid("$lookup requires foreignField"))?;
                let local = lookup_path(doc, local_field).cloned().unwrap_or(Bson::Null);
                foreign
                    .iter()
                    .filter(|candidate| {
                        equals_or_contains(lookup_path(candidate, foreign_field), &local)
                    })
                    .cloned()
                    .collect()
            }
        };
        doc.insert(
            target.clone(),
            Bson::Array(joined.into_iter().map(Bson::Document).collect()),
        );
    }
    Ok(docs)
}

fn unwind(docs: Vec<Document>, spec: &Bson) -> DatasourceResult<Vec<Document>> {
    let (path, preserve) = match spec {
        Bson::String(path) => (path.as_str(), false),
        Bson::Document(options) => (
            options
                .get_str("path")
                .map_err(|_| invalid("$unwind requires path"))?,
            options
                .get_bool("preserveNullAndEmptyArrays")
                .unwrap_or(false),
        ),
        _ => return Err(invalid("$unwind expects a path")),
    };
    let field = path
        .strip_prefix('$')
        .ok_or_else(|| invalid("$unwind path must start with $"))?;

    let mut unwound = Vec::with_capacity(docs.len());
    for mut doc in docs {
        match doc.get(field).cloned() {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    copy.insert(field, item);
                    unwound.push(copy);
                }
            }
            Some(Bson::Array(_)) => {
                if preserve {
                    doc.remove(field);
                    unwound.push(doc);
                }
            }
            None | Some(Bson::Null) => {
                if preserve {
                    unwound.push(doc);
                }
            }
            Some(_) => unwound.push(doc),
        }
    }
    Ok(unwound)
}

// ==================
// Expressions
// ==================

fn eval_expr(doc: &Document, expr: &Bson, vars: &Vars) -> DatasourceResult<Bson> {
    match expr {
        Bson::String(s) if s.starts_with("$$") => {
            let reference = &s[2..];
            let (name, rest) = match reference.split_once('.') {
                Some((name, rest)) => (name, Some(rest)),
                None => (reference, None),
            };
            let base = match name {
                "ROOT" | "CURRENT" => Bson::Document(doc.clone()),
                _ => vars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| invalid(format!("undefined variable $${name}")))?,
            };
            Ok(match (rest, base) {
                (None, base) => base,
                (Some(path), Bson::Document(inner)) => {
                    lookup_path(&inner, path).cloned().unwrap_or(Bson::Null)
                }
                (Some(_), _) => Bson::Null,
            })
        }
        Bson::String(s) if s.starts_with('$') => {
            Ok(lookup_path(doc, &s[1..]).cloned().unwrap_or(Bson::Null))
        }
        Bson::Document(spec) if is_operator_document(expr) && spec.len() == 1 => {
            let (op, args) = single_entry(spec)?;
            eval_operator(doc, op, args, vars)
        }
        Bson::Document(spec) => {
            let mut out = Document::new();
            for (key, value) in spec {
                out.insert(key.clone(), eval_expr(doc, value, vars)?);
            }
            Ok(Bson::Document(out))
        }
        Bson::Array(items) => Ok(Bson::Array(
            items
                .iter()
                .map(|item| eval_expr(doc, item, vars))
                .collect::<DatasourceResult<Vec<Bson>>>()?,
        )),
        literal => Ok(literal.clone()),
    }
}

fn eval_args(doc: &Document, args: &Bson, vars: &Vars) -> DatasourceResult<Vec<Bson>> {
    match args {
        Bson::Array(items) => items.iter().map(|item| eval_expr(doc, item, vars)).collect(),
        single => Ok(vec![eval_expr(doc, single, vars)?]),
    }
}

fn eval_pair(doc: &Document, op: &str, args: &Bson, vars: &Vars) -> DatasourceResult<(Bson, Bson)> {
    let mut values = eval_args(doc, args, vars)?.into_iter();
    match (values.next(), values.next(), values.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => Err(invalid(format!("{op} expects two arguments"))),
    }
}

fn eval_operator(doc: &Document, op: &str, args: &Bson, vars: &Vars) -> DatasourceResult<Bson> {
    let result = match op {
        "$literal" => return Ok(args.clone()),
        "$eq" => {
            let (a, b) = eval_pair(doc, op, args, vars)?;
            values_equal(&a, &b)
        }
        "$ne" => {
            let (a, b) = eval_pair(doc, op, args, vars)?;
            !values_equal(&a, &b)
        }
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let (a, b) = eval_pair(doc, op, args, vars)?;
            let ordering = sort_order(Some(&a), Some(&b));
            match op {
                "$gt" => ordering == Ordering::Greater,
                "$gte" => ordering != Ordering::Less,
                "$lt" => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            }
        }
        "$and" => eval_args(doc, args, vars)?.iter().all(truthy),
        "$or" => eval_args(doc, args, vars)?.iter().any(truthy),
        "$not" => {
            let values = eval_args(doc, args, vars)?;
            !values.first().is_some_and(truthy)
        }
        "$in" => {
            let (needle, haystack) = eval_pair(doc, op, args, vars)?;
            match haystack {
                Bson::Array(items) => items.iter().any(|item| values_equal(item, &needle)),
                _ => return Err(invalid("$in expects an array as second argument")),
            }
        }
        other => return Err(invalid(format!("unsupported expression operator {other}"))),
    };
    Ok(Bson::Boolean(result))
}
