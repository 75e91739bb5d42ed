use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::error::Error;

/// Evaluate a query document against a candidate document.
///
/// Every clause in `spec` must hold for the result to be `true`. Pure and
/// terminating; the only failure mode is a spec the dialect does not cover.
pub fn matches(spec: &Document, doc: &Document) -> Result<bool, Error> {
    for (key, condition) in spec {
        let ok = match key.as_str() {
            "$and" => clauses(condition, "$and")?.into_iter().map(|clause| matches(clause, doc)).try_fold(true, fold_all)?,
            "$or" => clauses(condition, "$or")?.into_iter().map(|clause| matches(clause, doc)).try_fold(false, fold_any)?,
            "$nor" => !clauses(condition, "$nor")?.into_iter().map(|clause| matches(clause, doc)).try_fold(false, fold_any)?,
            op if op.starts_with('$') => return Err(Error::UnsupportedOperator(op.to_string())),
            path => field_matches(condition, lookup(doc, path))?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn fold_all(acc: bool, next: Result<bool, Error>) -> Result<bool, Error> { Ok(acc && next?) }
fn fold_any(acc: bool, next: Result<bool, Error>) -> Result<bool, Error> { Ok(acc || next?) }

/// The sub-documents of a logical connective's array argument.
fn clauses<'a>(condition: &'a Bson, op: &'static str) -> Result<Vec<&'a Document>, Error> {
    let Bson::Array(items) = condition else {
        return Err(Error::Malformed { op, reason: "expected an array of query documents" });
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Document(clause) => Ok(clause),
            _ => Err(Error::Malformed { op, reason: "expected an array of query documents" }),
        })
        .collect()
}

fn field_matches(condition: &Bson, value: Option<&Bson>) -> Result<bool, Error> {
    match condition {
        Bson::Document(cond) if is_operator_doc(cond) => operators_match(cond, value),
        literal => Ok(equals(value, literal)),
    }
}

/// A non-empty document whose keys are all operators. A document with plain
/// keys is an embedded-document equality literal instead.
fn is_operator_doc(cond: &Document) -> bool { !cond.is_empty() && cond.keys().all(|key| key.starts_with('$')) }

fn operators_match(cond: &Document, value: Option<&Bson>) -> Result<bool, Error> {
    for (op, argument) in cond {
        let ok = match op.as_str() {
            "$eq" => equals(value, argument),
            "$ne" => !equals(value, argument),
            "$gt" => ordered(value, argument, |ordering| ordering == Ordering::Greater),
            "$gte" => ordered(value, argument, |ordering| ordering != Ordering::Less),
            "$lt" => ordered(value, argument, |ordering| ordering == Ordering::Less),
            "$lte" => ordered(value, argument, |ordering| ordering != Ordering::Greater),
            "$in" => in_list(value, argument, "$in")?,
            "$nin" => !in_list(value, argument, "$nin")?,
            "$exists" => truthy(argument) == value.is_some(),
            "$not" => {
                let Bson::Document(inner) = argument else {
                    return Err(Error::Malformed { op: "$not", reason: "expected an operator document" });
                };
                !operators_match(inner, value)?
            }
            other => return Err(Error::UnsupportedOperator(other.to_string())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Resolve a dotted path. Numeric segments index into arrays; anything else
/// that runs off the document shape resolves to a missing field.
fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut value = doc.get(segments.next()?)?;
    for segment in segments {
        value = match value {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// Equality the way the server compares: a missing field equals `null`, an
/// array field equals a non-array literal when any element does, and numbers
/// compare across `Int32`/`Int64`/`Double`.
fn equals(value: Option<&Bson>, literal: &Bson) -> bool {
    let Some(value) = value else {
        return matches!(literal, Bson::Null);
    };
    if scalar_eq(value, literal) {
        return true;
    }
    if let Bson::Array(items) = value {
        if !matches!(literal, Bson::Array(_)) {
            return items.iter().any(|item| scalar_eq(item, literal));
        }
    }
    false
}

fn scalar_eq(a: &Bson, b: &Bson) -> bool {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Compare within the types the dialect orders. `None` for cross-type pairs,
/// which never satisfy a range operator.
fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => Some((x.time, x.increment).cmp(&(y.time, y.increment))),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        _ => None,
    }
}

fn ordered(value: Option<&Bson>, argument: &Bson, pred: impl Fn(Ordering) -> bool) -> bool {
    let Some(value) = value else { return false };
    if compare(value, argument).map(&pred).unwrap_or(false) {
        return true;
    }
    if let Bson::Array(items) = value {
        return items.iter().any(|item| compare(item, argument).map(&pred).unwrap_or(false));
    }
    false
}

fn in_list(value: Option<&Bson>, argument: &Bson, op: &'static str) -> Result<bool, Error> {
    let Bson::Array(candidates) = argument else {
        return Err(Error::Malformed { op, reason: "expected an array" });
    };
    Ok(candidates.iter().any(|candidate| equals(value, candidate)))
}

fn truthy(argument: &Bson) -> bool {
    match argument {
        Bson::Boolean(flag) => *flag,
        other => numeric(other).map(|n| n != 0.0).unwrap_or(true),
    }
}
