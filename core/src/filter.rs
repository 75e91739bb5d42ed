//! Server-side filter synthesis helpers shared by live queries and raw
//! watches.

use bson::{doc, Bson, Document};

use crate::types::OpTime;

/// True for values that may be promoted into a server-side equality
/// projection: literals the server compares the same way the client does.
/// Operator documents, embedded documents, and arrays stay client-side —
/// promoting them could produce a filter false negative, which is forbidden.
pub(crate) fn is_scalar(value: &Bson) -> bool { !matches!(value, Bson::Document(_) | Bson::Array(_)) }

/// Top-level literal-scalar equality clauses of a query spec.
pub(crate) fn scalar_equalities(spec: &Document) -> impl Iterator<Item = (&str, &Bson)> {
    spec.iter().filter(|(field, value)| !field.starts_with('$') && is_scalar(value)).map(|(field, value)| (field.as_str(), value))
}

/// An insert branch for a namespace: `{op: 'i', ns}` plus `o.`-prefixed
/// projections of the spec's promotable equality clauses.
pub(crate) fn insert_branch(ns: &str, spec: Option<&Document>) -> Document {
    let mut branch = doc! { "op": "i", "ns": ns };
    if let Some(spec) = spec {
        for (field, value) in scalar_equalities(spec) {
            branch.insert(format!("o.{field}"), value.clone());
        }
    }
    branch
}

/// An update/delete branch restricted to a bounded id set, or the whole
/// opcode for the namespace when no ids are tracked.
pub(crate) fn id_branch<'a>(op: &str, key: &str, ns: &str, ids: Option<impl Iterator<Item = &'a Bson>>) -> Document {
    let mut branch = doc! { "op": op, "ns": ns };
    if let Some(ids) = ids {
        let list: Vec<Bson> = ids.cloned().collect();
        branch.insert(key, doc! { "$in": list });
    }
    branch
}

/// Combine per-registration branches into the cursor filter, conjoined with
/// the watermark bound.
pub(crate) fn combine(branches: Vec<Document>, watermark: OpTime) -> Document {
    let mut filter = match branches.len() {
        1 => branches.into_iter().next().unwrap_or_default(),
        _ => doc! { "$or": branches },
    };
    filter.insert("ts", doc! { "$gt": watermark.timestamp() });
    filter
}
