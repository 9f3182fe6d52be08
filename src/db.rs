use rusqlite::types::Value;

use crate::migrate::MigrationResult;

pub mod sqlite;

pub use sqlite::SqliteStorage;

/// Identifier column every migrated table carries.
pub const UID: &str = "uid";
/// Storage location column copied onto file references.
pub const PID: &str = "pid";

/// A single database row, keeping the column order of the query that produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    /// Sets `column`, replacing an existing value in place.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.columns.iter().position(|c| *c == column) {
            Some(idx) => self.values[idx] = value,
            None => {
                self.columns.push(column);
                self.values.push(value);
            }
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Integer view of a column; text holding a number is accepted too.
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(value_as_i64)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The row's `uid`, when it has one.
    pub fn uid(&self) -> Option<i64> {
        self.get_i64(UID)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (column, value) in iter {
            row.insert(column, value);
        }
        row
    }
}

pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(v) => Some(*v),
        Value::Real(v) if v.fract() == 0.0 => Some(*v as i64),
        Value::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Plain-text rendering used for composite keys and tuple hashes.
pub fn value_to_plain(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => v.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

/// A `SELECT` against a table or a join expression.
#[derive(Debug, Clone)]
pub struct Select {
    pub from: String,
    pub columns: String,
    pub predicate: String,
    pub group_by: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Select {
    /// `SELECT * FROM from ORDER BY uid ASC`, the shape most migrations start from.
    pub fn from(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            columns: "*".into(),
            predicate: String::new(),
            group_by: None,
            order_by: Some(format!("{UID} ASC")),
            limit: None,
        }
    }

    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = predicate.into();
        self
    }

    pub fn group_by(mut self, group_by: impl Into<String>) -> Self {
        self.group_by = Some(group_by.into());
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn unordered(mut self) -> Self {
        self.order_by = None;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_sql(&self) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.columns, self.from);
        if !self.predicate.trim().is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.predicate);
        }
        if let Some(group_by) = &self.group_by {
            sql.push_str(" GROUP BY ");
            sql.push_str(group_by);
        }
        if let Some(order_by) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }
}

/// Storage primitives the migration engine needs.
///
/// `from` arguments of `count` and `select` are inserted verbatim so they may be join
/// expressions; every other `table` argument is a plain table name.
pub trait Storage {
    fn count(&mut self, from: &str, predicate: &str) -> MigrationResult<u64>;

    fn select(&mut self, query: &Select) -> MigrationResult<Vec<Row>>;

    /// Inserts `rows` (values in `columns` order) and returns the last assigned identifier.
    /// Identifiers are assumed contiguous and assigned in the order supplied.
    fn insert_many(&mut self, table: &str, columns: &[String], rows: &[Row]) -> MigrationResult<i64>;

    fn insert_one(&mut self, table: &str, row: &Row) -> MigrationResult<i64>;

    fn update(&mut self, table: &str, predicate: &str, values: &Row) -> MigrationResult<u64>;

    fn delete(&mut self, table: &str, predicate: &str) -> MigrationResult<u64>;

    fn truncate(&mut self, table: &str) -> MigrationResult<()>;

    fn list_tables(&mut self) -> MigrationResult<Vec<String>>;

    fn begin(&mut self) -> MigrationResult<()>;

    fn commit(&mut self) -> MigrationResult<()>;

    fn rollback(&mut self) -> MigrationResult<()>;
}

/// First identifier of a contiguous block whose last identifier is `last`.
pub fn first_inserted_id(last: i64, count: usize) -> i64 {
    last - count as i64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_insert_replaces_in_place() {
        let mut row = Row::new().with("a", 1).with("b", "x".to_string());
        row.insert("a", 2);
        assert_eq!(row.columns(), &["a".to_string(), "b".to_string()]);
        assert_eq!(row.get_i64("a"), Some(2));
        assert_eq!(row.get("b"), Some(&Value::Text("x".into())));
    }

    #[test]
    fn select_renders_clauses_in_order() {
        let sql = Select::from("tx_old")
            .columns("title, year")
            .filter("deleted = 0")
            .group_by("title, year")
            .order_by("title, year")
            .limit(10)
            .to_sql();
        assert_eq!(
            sql,
            "SELECT title, year FROM tx_old WHERE deleted = 0 GROUP BY title, year ORDER BY title, year LIMIT 10"
        );
        assert_eq!(
            Select::from("t").to_sql(),
            "SELECT * FROM t ORDER BY uid ASC"
        );
    }

    #[test]
    fn numeric_text_is_read_as_integer() {
        assert_eq!(value_as_i64(&Value::Text(" 42".into())), Some(42));
        assert_eq!(value_as_i64(&Value::Null), None);
        assert_eq!(first_inserted_id(10, 3), 8);
    }
}
