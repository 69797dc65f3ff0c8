//! Typed, composable due-predicates.
//!
//! A [`Filter`] is data, not a SQL string. The same value renders to a
//! parameterised SQL fragment for the relational store and evaluates directly
//! against an in-memory [`Fixture`], so a job's predicate can be checked
//! without a database. Evaluation follows SQL three-valued logic: any
//! comparison with NULL is unknown, and only rows where the predicate is
//! definitely true match.

use rusqlite::types::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

/// Conversion of Rust literals into bound SQL values.
pub trait IntoSqlValue {
    fn into_sql_value(self) -> Value;
}

impl IntoSqlValue for Value {
    fn into_sql_value(self) -> Value {
        self
    }
}

impl IntoSqlValue for &str {
    fn into_sql_value(self) -> Value {
        Value::Text(self.to_string())
    }
}

impl IntoSqlValue for String {
    fn into_sql_value(self) -> Value {
        Value::Text(self)
    }
}

impl IntoSqlValue for i64 {
    fn into_sql_value(self) -> Value {
        Value::Integer(self)
    }
}

impl IntoSqlValue for i32 {
    fn into_sql_value(self) -> Value {
        Value::Integer(self as i64)
    }
}

impl IntoSqlValue for bool {
    fn into_sql_value(self) -> Value {
        Value::Integer(self as i64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(&'static str, Value),
    In(&'static str, Vec<Value>),
    Lt(&'static str, Value),
    Gt(&'static str, Value),
    All(Vec<Filter>),
    Any(Vec<Filter>),
    Not(Box<Filter>),
    /// At least one related row matches.
    Exists(Box<Related>),
    /// At least `n` related rows match.
    CountAtLeast(Box<Related>, i64),
}

/// Rows of `table` whose `remote_column` equals the outer row's
/// `local_column`, narrowed by `filter`.
#[derive(Debug, Clone, PartialEq)]
pub struct Related {
    pub table: &'static str,
    pub local_column: &'static str,
    pub remote_column: &'static str,
    pub filter: Filter,
}

impl Related {
    pub fn new(
        table: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
        filter: Filter,
    ) -> Self {
        Self {
            table,
            local_column,
            remote_column,
            filter,
        }
    }
}

impl Filter {
    pub fn eq(column: &'static str, value: impl IntoSqlValue) -> Self {
        Filter::Eq(column, value.into_sql_value())
    }

    pub fn in_list<V: IntoSqlValue>(column: &'static str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(column, values.into_iter().map(IntoSqlValue::into_sql_value).collect())
    }

    pub fn lt(column: &'static str, value: impl IntoSqlValue) -> Self {
        Filter::Lt(column, value.into_sql_value())
    }

    pub fn gt(column: &'static str, value: impl IntoSqlValue) -> Self {
        Filter::Gt(column, value.into_sql_value())
    }

    pub fn all(filters: Vec<Filter>) -> Self {
        Filter::All(filters)
    }

    pub fn any(filters: Vec<Filter>) -> Self {
        Filter::Any(filters)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    pub fn exists(related: Related) -> Self {
        Filter::Exists(Box::new(related))
    }

    pub fn count_at_least(related: Related, n: i64) -> Self {
        Filter::CountAtLeast(Box::new(related), n)
    }

    /// Render as a SQL boolean expression over rows aliased `outer`.
    ///
    /// Placeholders are anonymous `?` in the order of the returned values, so
    /// the fragment composes with other anonymous placeholders around it.
    pub fn to_sql(&self, outer: &str) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        self.render(outer, 0, &mut sql, &mut params);
        (sql, params)
    }

    fn render(&self, alias: &str, depth: usize, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Filter::Eq(column, value) => {
                let _ = write!(sql, "{}.{} = ?", alias, column);
                params.push(value.clone());
            }
            Filter::Lt(column, value) => {
                let _ = write!(sql, "{}.{} < ?", alias, column);
                params.push(value.clone());
            }
            Filter::Gt(column, value) => {
                let _ = write!(sql, "{}.{} > ?", alias, column);
                params.push(value.clone());
            }
            Filter::In(_, values) if values.is_empty() => sql.push('0'),
            Filter::In(column, values) => {
                let placeholders = vec!["?"; values.len()].join(", ");
                let _ = write!(sql, "{}.{} IN ({})", alias, column, placeholders);
                params.extend(values.iter().cloned());
            }
            Filter::All(filters) => Self::render_joined(filters, " AND ", "1", alias, depth, sql, params),
            Filter::Any(filters) => Self::render_joined(filters, " OR ", "0", alias, depth, sql, params),
            Filter::Not(inner) => {
                sql.push_str("NOT (");
                inner.render(alias, depth, sql, params);
                sql.push(')');
            }
            Filter::Exists(related) => {
                sql.push_str("EXISTS (SELECT 1");
                Self::render_related(related, alias, depth, sql, params);
                sql.push(')');
            }
            Filter::CountAtLeast(related, n) => {
                sql.push_str("(SELECT COUNT(*)");
                Self::render_related(related, alias, depth, sql, params);
                sql.push_str(") >= ?");
                params.push(Value::Integer(*n));
            }
        }
    }

    fn render_joined(
        filters: &[Filter],
        separator: &str,
        empty: &str,
        alias: &str,
        depth: usize,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) {
        if filters.is_empty() {
            sql.push_str(empty);
            return;
        }
        sql.push('(');
        for (i, filter) in filters.iter().enumerate() {
            if i > 0 {
                sql.push_str(separator);
            }
            filter.render(alias, depth, sql, params);
        }
        sql.push(')');
    }

    fn render_related(
        related: &Related,
        alias: &str,
        depth: usize,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) {
        let inner = format!("r{}", depth);
        let _ = write!(
            sql,
            " FROM {table} AS {inner} WHERE {inner}.{remote} = {alias}.{local} AND ",
            table = related.table,
            inner = inner,
            remote = related.remote_column,
            alias = alias,
            local = related.local_column,
        );
        related.filter.render(&inner, depth + 1, sql, params);
    }

    /// Whether `record` satisfies the predicate, looking up related rows in
    /// `fixture`.
    pub fn matches(&self, record: &Record, fixture: &Fixture) -> bool {
        self.evaluate(record, fixture) == Some(true)
    }

    /// Three-valued evaluation; `None` is SQL's unknown.
    fn evaluate(&self, record: &Record, fixture: &Fixture) -> Option<bool> {
        match self {
            Filter::Eq(column, value) => {
                compare(field(record, column), value).map(|o| o == Ordering::Equal)
            }
            Filter::Lt(column, value) => {
                compare(field(record, column), value).map(|o| o == Ordering::Less)
            }
            Filter::Gt(column, value) => {
                compare(field(record, column), value).map(|o| o == Ordering::Greater)
            }
            Filter::In(column, values) => {
                let actual = field(record, column);
                let mut unknown = false;
                for value in values {
                    match compare(actual, value) {
                        Some(Ordering::Equal) => return Some(true),
                        Some(_) => {}
                        None => unknown = true,
                    }
                }
                if unknown {
                    None
                } else {
                    Some(false)
                }
            }
            Filter::All(filters) => {
                let mut result = Some(true);
                for filter in filters {
                    match filter.evaluate(record, fixture) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Filter::Any(filters) => {
                let mut result = Some(false);
                for filter in filters {
                    match filter.evaluate(record, fixture) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Filter::Not(inner) => inner.evaluate(record, fixture).map(|b| !b),
            Filter::Exists(related) => Some(related.count_matching(record, fixture) > 0),
            Filter::CountAtLeast(related, n) => {
                Some(related.count_matching(record, fixture) as i64 >= *n)
            }
        }
    }
}

impl Related {
    fn count_matching(&self, outer: &Record, fixture: &Fixture) -> usize {
        let key = field(outer, self.local_column);
        fixture
            .rows(self.table)
            .iter()
            .filter(|row| compare(field(row, self.remote_column), key) == Some(Ordering::Equal))
            .filter(|row| self.filter.matches(row, fixture))
            .count()
    }
}

static NULL: Value = Value::Null;

fn field<'a>(record: &'a Record, column: &str) -> &'a Value {
    record.get(column).unwrap_or(&NULL)
}

fn storage_class(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Integer(_) | Value::Real(_) => 1,
        Value::Text(_) => 2,
        Value::Blob(_) => 3,
    }
}

/// SQLite's ordering between two values, `None` if either is NULL.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Integer(x), Value::Real(y)) => (*x as f64).partial_cmp(y),
        (Value::Real(x), Value::Integer(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Real(x), Value::Real(y)) => x.partial_cmp(y),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Blob(x), Value::Blob(y)) => Some(x.cmp(y)),
        _ => Some(storage_class(a).cmp(&storage_class(b))),
    }
}

/// One row: column name to value. Missing columns read as NULL.
pub type Record = BTreeMap<String, Value>;

/// In-memory tables for evaluating filters without a database.
#[derive(Debug, Default, Clone)]
pub struct Fixture {
    tables: HashMap<String, Vec<Record>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<V: IntoSqlValue>(
        &mut self,
        table: &str,
        columns: impl IntoIterator<Item = (&'static str, V)>,
    ) -> &mut Self {
        let record = columns
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.into_sql_value()))
            .collect();
        self.tables.entry(table.to_string()).or_default().push(record);
        self
    }

    pub fn rows(&self, table: &str) -> &[Record] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ids of the rows of `table` matching `filter`, ascending.
    pub fn select_ids(&self, table: &str, filter: &Filter) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .rows(table)
            .iter()
            .filter(|row| filter.matches(row, self))
            .filter_map(|row| match field(row, "id") {
                Value::Integer(id) => Some(*id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids
    }
}
