//! Query DSL
//!
//! A filter is a JSON object. Each key either matches `record[key] == value`
//! or, when the value is an operator object (`{"gt": 5, "le": 10}`), requires
//! every operator to hold. Supported operators: `gt`, `ge`, `lt`, `le`, `in`.
//!
//! Sorting takes a list of `(field, descending)` keys. Ids that look like
//! integers compare numerically so `"10"` sorts after `"9"`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{PersistError, PersistResult, Record};

const OPERATORS: [&str; 5] = ["gt", "ge", "lt", "le", "in"];

/// Record filter (`field → value | {op: value}`)
pub type Filter = Map<String, Value>;

/// One sort key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub desc: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            desc: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            desc: true,
        }
    }
}

/// Parameters of a collection query
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Fields to return (`id` is always included); all fields when `None`
    pub fields: Option<Vec<String>>,
    pub filter: Filter,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a single field against a value or operator object
    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter.insert(field.into(), value);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filter, sort, limit and project a set of records
    pub fn apply<I>(&self, records: I) -> PersistResult<Vec<Record>>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut out = Vec::new();
        for record in records {
            if matches(&record, &self.filter)? {
                out.push(record);
            }
        }

        sort_records(&mut out, &self.sort);

        if let Some(limit) = self.limit {
            out.truncate(limit);
        }

        if let Some(fields) = &self.fields {
            for record in &mut out {
                record.retain(|k, _| k == "id" || fields.iter().any(|f| f == k));
            }
        }

        Ok(out)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Matching
// ─────────────────────────────────────────────────────────────────────────────

/// Whether `record` satisfies every condition of `filter`
pub fn matches(record: &Record, filter: &Filter) -> PersistResult<bool> {
    for (field, cond) in filter {
        let actual = record.get(field).unwrap_or(&Value::Null);
        let ok = match operator_map(cond)? {
            Some(ops) => {
                let mut all = true;
                for (op, operand) in ops {
                    if !apply_operator(op, actual, operand)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            None => values_equal(actual, cond),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Returns the operator object if `cond` is one
fn operator_map(cond: &Value) -> PersistResult<Option<&Map<String, Value>>> {
    let Value::Object(map) = cond else {
        return Ok(None);
    };
    if map.is_empty() {
        return Ok(None);
    }

    let op_count = map.keys().filter(|k| OPERATORS.contains(&k.as_str())).count();
    if op_count == 0 {
        return Ok(None);
    }
    if op_count != map.len() {
        return Err(PersistError::InvalidFilter(format!(
            "operators mixed with plain keys: {}",
            cond
        )));
    }
    Ok(Some(map))
}

fn apply_operator(op: &str, actual: &Value, operand: &Value) -> PersistResult<bool> {
    if op == "in" {
        let Value::Array(items) = operand else {
            return Err(PersistError::InvalidFilter(format!(
                "\"in\" expects a list, got {}",
                operand
            )));
        };
        return Ok(items.iter().any(|item| values_equal(actual, item)));
    }

    let Some(ord) = compare_values(actual, operand) else {
        return Ok(false);
    };
    Ok(match op {
        "gt" => ord == Ordering::Greater,
        "ge" => ord != Ordering::Less,
        "lt" => ord == Ordering::Less,
        "le" => ord != Ordering::Greater,
        _ => return Err(PersistError::InvalidFilter(format!("unknown operator {}", op))),
    })
}

/// JSON equality with numbers compared by value (`42 == 42.0`)
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

/// Order two scalars of the same kind; `None` when they are not comparable
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sorting
// ─────────────────────────────────────────────────────────────────────────────

pub fn sort_records(records: &mut [Record], sort: &[SortKey]) {
    if sort.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        for key in sort {
            let ord = sort_cmp(&key.field, a.get(&key.field), b.get(&key.field));
            let ord = if key.desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Compare two record ids: integer-looking ids come first, in numeric
/// order, followed by all other ids in lexical order.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn sort_cmp(field: &str, a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::String(x)), Some(Value::String(y))) if field == "id" => compare_ids(x, y),
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or_else(|| rank(x).cmp(&rank(y))),
    }
}

/// Fallback order between values of different kinds
fn rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        match v {
            Value::Object(map) => map,
            _ => panic!("Expected object"),
        }
    }

    fn filter(v: Value) -> Filter {
        record(v)
    }

    #[test]
    fn test_equality_and_operators() {
        let r = record(json!({"id": "a", "value": 42, "tag": "x"}));

        assert!(matches(&r, &filter(json!({"value": 42.0}))).unwrap());
        assert!(matches(&r, &filter(json!({"value": {"gt": 40, "le": 42}}))).unwrap());
        assert!(!matches(&r, &filter(json!({"value": {"gt": 42}}))).unwrap());
        assert!(matches(&r, &filter(json!({"tag": {"in": ["x", "y"]}}))).unwrap());
        assert!(!matches(&r, &filter(json!({"tag": {"in": []}}))).unwrap());
        assert!(!matches(&r, &filter(json!({"missing": {"lt": 1}}))).unwrap());
        assert!(matches(&r, &filter(json!({"missing": null}))).unwrap());
    }

    #[test]
    fn test_operator_laws() {
        // gt and le partition comparable values; ge and lt likewise
        for v in [1, 5, 9] {
            let r = record(json!({"n": v}));
            let gt = matches(&r, &filter(json!({"n": {"gt": 5}}))).unwrap();
            let le = matches(&r, &filter(json!({"n": {"le": 5}}))).unwrap();
            let ge = matches(&r, &filter(json!({"n": {"ge": 5}}))).unwrap();
            let lt = matches(&r, &filter(json!({"n": {"lt": 5}}))).unwrap();
            assert_ne!(gt, le);
            assert_ne!(ge, lt);
        }
    }

    #[test]
    fn test_invalid_filters() {
        let r = record(json!({"n": 1}));
        assert!(matches(&r, &filter(json!({"n": {"in": 3}}))).is_err());
        assert!(matches(&r, &filter(json!({"n": {"gt": 1, "other": 2}}))).is_err());
    }

    #[test]
    fn test_numeric_id_sort() {
        let mut records: Vec<Record> = ["10", "9", "100", "a"]
            .iter()
            .map(|id| record(json!({ "id": id })))
            .collect();

        sort_records(&mut records, &[SortKey::asc("id")]);
        let ids: Vec<&str> = records.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["9", "10", "100", "a"]);
    }

    #[test]
    fn test_mixed_id_order_is_total() {
        assert_eq!(compare_ids("9", "10"), Ordering::Less);
        assert_eq!(compare_ids("10", "1a"), Ordering::Less);
        assert_eq!(compare_ids("1a", "9"), Ordering::Greater);
        assert_eq!(compare_ids("01", "1"), Ordering::Less);

        let mut records: Vec<Record> = ["1a", "10", "b", "9", "1", "01"]
            .iter()
            .map(|id| record(json!({ "id": id })))
            .collect();
        sort_records(&mut records, &[SortKey::desc("id")]);
        let ids: Vec<&str> = records.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b", "1a", "10", "9", "1", "01"]);
    }

    #[test]
    fn test_query_apply() {
        let records = vec![
            record(json!({"id": "1", "kind": "a", "n": 3})),
            record(json!({"id": "2", "kind": "b", "n": 1})),
            record(json!({"id": "3", "kind": "a", "n": 2})),
        ];

        let query = Query::new()
            .filter("kind", json!("a"))
            .sort(SortKey::desc("n"))
            .fields(["n"])
            .limit(1);
        let out = query.apply(records).unwrap();

        assert_eq!(out, vec![record(json!({"id": "1", "n": 3}))]);
    }
}
