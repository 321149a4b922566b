//! Typed query surface.
//!
//! The legacy surface embedded predicate source text into queries; here each
//! clause is a tagged value instead: index ranges and id sets stay data, and
//! arbitrary predicates, projections, and mutations are caller-compiled
//! closures. Every clause renders a compact description (`@@all()`,
//! `@@index(field,lo,hi)`, `@@id(...)`, `<fn>`) so monitoring capture still
//! sees what a call asked for; [`crate::util::esc`] is the supported path for
//! embedding literal values into those descriptions.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::esc;

pub type WhereFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type MapFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type ModFn = Arc<dyn Fn(&mut Value) + Send + Sync>;
pub type CmpFn = Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>;
pub type ShardGenFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;
pub type ShardFilterFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Row predicate.
#[derive(Clone, Default)]
pub enum Filter {
    /// Every row.
    #[default]
    All,
    /// Rows with one of these ids.
    Ids(Vec<i64>),
    /// Rows whose field value lies in `[lo, hi]`; served from a range index
    /// when one covers the field.
    Range { field: String, lo: Value, hi: Value },
    /// Arbitrary caller-compiled predicate over the candidate row.
    Where(WhereFn),
}

impl Filter {
    pub fn ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Filter::Ids(ids.into_iter().collect())
    }

    pub fn range(field: impl Into<String>, lo: Value, hi: Value) -> Self {
        Filter::Range {
            field: field.into(),
            lo,
            hi,
        }
    }

    pub fn wher<F>(f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Filter::Where(Arc::new(f))
    }

    /// Whether the row passes this predicate, ignoring any index shortcut.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Ids(ids) => row
                .get("id")
                .and_then(Value::as_i64)
                .is_some_and(|id| ids.contains(&id)),
            Filter::Range { field, lo, hi } => match row.get(field.as_str()) {
                Some(v) => {
                    json_cmp(v, lo) != Ordering::Less && json_cmp(v, hi) != Ordering::Greater
                }
                None => false,
            },
            Filter::Where(f) => f(row),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Filter::All => "@@all()".to_string(),
            Filter::Ids(ids) => {
                let parts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                format!("@@id({})", parts.join(","))
            }
            Filter::Range { field, lo, hi } => {
                format!("@@index({},{},{})", field, esc(lo), esc(hi))
            }
            Filter::Where(_) => "<fn>".to_string(),
        }
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Result ordering: a field list with per-field direction, or a comparator.
#[derive(Clone)]
pub enum Sort {
    /// `(field, descending)` pairs applied in order.
    Fields(Vec<(String, bool)>),
    By(CmpFn),
}

impl Sort {
    pub fn by_field(field: impl Into<String>, descending: bool) -> Self {
        Sort::Fields(vec![(field.into(), descending)])
    }

    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        match self {
            Sort::Fields(fields) => {
                for (field, descending) in fields {
                    let av = a.get(field.as_str()).unwrap_or(&Value::Null);
                    let bv = b.get(field.as_str()).unwrap_or(&Value::Null);
                    let ord = json_cmp(av, bv);
                    if ord != Ordering::Equal {
                        return if *descending { ord.reverse() } else { ord };
                    }
                }
                Ordering::Equal
            }
            Sort::By(f) => f(a, b),
        }
    }

    fn describe(&self) -> String {
        match self {
            Sort::Fields(fields) => fields
                .iter()
                .map(|(f, d)| if *d { format!("-{f}") } else { f.clone() })
                .collect::<Vec<_>>()
                .join(","),
            Sort::By(_) => "<fn>".to_string(),
        }
    }
}

/// Merge rows from another table into each result row, keyed by an id field.
#[derive(Clone, Debug)]
pub struct JoinById {
    /// Table the secondary select runs against.
    pub table: String,
    /// Field on the primary rows holding the foreign id.
    pub field: String,
    /// Field the joined row is merged into.
    pub target: String,
}

/// Which shards of a sharded table a call fans out to.
#[derive(Clone)]
pub enum ShardSelector {
    List(Vec<String>),
    Filter(ShardFilterFn),
}

impl ShardSelector {
    fn describe(&self) -> String {
        match self {
            ShardSelector::List(names) => format!("[{}]", names.join(",")),
            ShardSelector::Filter(_) => "<fn>".to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct SelectQuery {
    pub filter: Filter,
    pub sort: Option<Sort>,
    pub map: Option<MapFn>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub join: Option<JoinById>,
    /// Sharded tables only: which shards to query (default: all).
    pub shards: Option<ShardSelector>,
    /// Sharded tables only: set or clear the long-lived shard pin.
    pub persistent: Option<bool>,
}

impl SelectQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn map<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.map = Some(Arc::new(f));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn join(mut self, join: JoinById) -> Self {
        self.join = Some(join);
        self
    }

    pub fn shards(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.shards = Some(ShardSelector::List(
            names.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn shard_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.shards = Some(ShardSelector::Filter(Arc::new(f)));
        self
    }

    pub fn persistent(mut self, pin: bool) -> Self {
        self.persistent = Some(pin);
        self
    }

    pub fn describe(&self) -> String {
        let mut out = format!("select where={}", self.filter.describe());
        if let Some(sort) = &self.sort {
            out.push_str(&format!(" sort={}", sort.describe()));
        }
        if let Some(limit) = self.limit {
            out.push_str(&format!(" limit={limit}"));
        }
        if self.offset > 0 {
            out.push_str(&format!(" offset={}", self.offset));
        }
        if let Some(join) = &self.join {
            out.push_str(&format!(" join={}.{}", join.table, join.field));
        }
        if let Some(shards) = &self.shards {
            out.push_str(&format!(" shards={}", shards.describe()));
        }
        if let Some(pin) = self.persistent {
            out.push_str(&format!(" persistent={pin}"));
        }
        out
    }
}

#[derive(Clone, Default)]
pub struct InsertQuery {
    pub rows: Vec<Value>,
    /// Overwrite rows whose id already exists.
    pub replace: bool,
    /// Silently skip rows whose id already exists.
    pub ignore: bool,
    /// Sharded tables only: yields a shard name for rows without a `shard`
    /// field; the reserved name `___auto` delegates placement to the table.
    pub shard_gen: Option<ShardGenFn>,
}

impl InsertQuery {
    pub fn rows(rows: impl IntoIterator<Item = Value>) -> Self {
        Self {
            rows: rows.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn replace(mut self, yes: bool) -> Self {
        self.replace = yes;
        self
    }

    pub fn ignore(mut self, yes: bool) -> Self {
        self.ignore = yes;
        self
    }

    pub fn shard_gen<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.shard_gen = Some(Arc::new(f));
        self
    }

    pub fn describe(&self) -> String {
        let mut out = format!("insert rows={}", self.rows.len());
        if self.replace {
            out.push_str(" replace");
        }
        if self.ignore {
            out.push_str(" ignore");
        }
        if self.shard_gen.is_some() {
            out.push_str(" shard=<fn>");
        }
        out
    }
}

#[derive(Clone)]
pub struct UpdateQuery {
    pub filter: Filter,
    /// Caller-compiled mutation applied to each matching row.
    pub modify: ModFn,
    pub shards: Option<ShardSelector>,
}

impl UpdateQuery {
    pub fn new<F>(filter: Filter, modify: F) -> Self
    where
        F: Fn(&mut Value) + Send + Sync + 'static,
    {
        Self {
            filter,
            modify: Arc::new(modify),
            shards: None,
        }
    }

    pub fn shards(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.shards = Some(ShardSelector::List(
            names.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn describe(&self) -> String {
        format!("update where={} mod=<fn>", self.filter.describe())
    }
}

#[derive(Clone, Default)]
pub struct DeleteQuery {
    pub filter: Filter,
    pub shards: Option<ShardSelector>,
}

impl DeleteQuery {
    pub fn filter(filter: Filter) -> Self {
        Self {
            filter,
            shards: None,
        }
    }

    pub fn shards(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.shards = Some(ShardSelector::List(
            names.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn describe(&self) -> String {
        format!("delete where={}", self.filter.describe())
    }
}

/// Outcome of an insert call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsertResult {
    pub inserted: u64,
    pub replaced: u64,
    pub last_insert_id: i64,
}

/// Secondary index flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Presence set over rows with a truthy field value.
    Flag,
    /// Equality lookups keyed by the rendered field value.
    Hash,
    /// Ordered lookups serving `Filter::Range`.
    Range,
}

/// A secondary index declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub kind: IndexKind,
    pub field: String,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(kind: IndexKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            unique: false,
        }
    }

    pub fn unique(mut self, yes: bool) -> Self {
        self.unique = yes;
        self
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn json_cmp(a: &Value, b: &Value) -> Ordering {
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
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = json_cmp(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Apply sort, offset, limit, and projection to raw select results.
pub fn finish_select(mut rows: Vec<Value>, query: &SelectQuery) -> Vec<Value> {
    if let Some(sort) = &query.sort {
        rows.sort_by(|a, b| sort.compare(a, b));
    }
    if query.offset > 0 {
        rows = rows.split_off(query.offset.min(rows.len()));
    }
    if let Some(limit) = query.limit {
        rows.truncate(limit);
    }
    if let Some(map) = &query.map {
        rows = rows.into_iter().map(|r| map(r)).collect();
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches() {
        let row = json!({"id": 7, "a": 3, "s": "mid"});
        assert!(Filter::All.matches(&row));
        assert!(Filter::ids([7]).matches(&row));
        assert!(!Filter::ids([8]).matches(&row));
        assert!(Filter::range("a", json!(1), json!(5)).matches(&row));
        assert!(!Filter::range("a", json!(4), json!(5)).matches(&row));
        assert!(!Filter::range("missing", json!(0), json!(9)).matches(&row));
        assert!(Filter::wher(|r| r["s"] == "mid").matches(&row));
    }

    #[test]
    fn test_describe_renders_builtins() {
        assert_eq!(Filter::All.describe(), "@@all()");
        assert_eq!(Filter::ids([1, 2]).describe(), "@@id(1,2)");
        assert_eq!(
            Filter::range("a", json!(1), json!("x")).describe(),
            r#"@@index(a,1,"x")"#
        );
        let q = SelectQuery::all()
            .filter(Filter::wher(|_| true))
            .limit(3)
            .offset(1);
        assert_eq!(q.describe(), "select where=<fn> limit=3 offset=1");
    }

    #[test]
    fn test_json_cmp_orders_across_types() {
        assert_eq!(json_cmp(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(json_cmp(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(json_cmp(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(json_cmp(&json!(5), &json!("5")), Ordering::Less);
        assert_eq!(json_cmp(&json!([1, 2]), &json!([1, 2, 3])), Ordering::Less);
    }

    #[test]
    fn test_finish_select_pipeline() {
        let rows = vec![
            json!({"id": 1, "v": 3}),
            json!({"id": 2, "v": 1}),
            json!({"id": 3, "v": 2}),
        ];
        let q = SelectQuery::all()
            .sort(Sort::by_field("v", false))
            .offset(1)
            .limit(1)
            .map(|r| r["v"].clone());
        assert_eq!(finish_select(rows, &q), vec![json!(2)]);
    }

    #[test]
    fn test_sort_field_directions() {
        let a = json!({"x": 1, "y": "b"});
        let b = json!({"x": 1, "y": "a"});
        let sort = Sort::Fields(vec![("x".into(), false), ("y".into(), true)]);
        assert_eq!(sort.compare(&a, &b), Ordering::Less);
    }
}
