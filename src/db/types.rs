use serde_json::Value as JsonValue;

use super::error::DbError;

/// A value that can be stored in the database.
#[derive(Debug, Clone)]
pub enum DbValue {
    /// NULL value
    Null,
    /// Signed 64-bit integer
    Int64(i64),
    /// Text (unlimited length)
    Text(String),
    /// Numeric string for uint256/int256 (stored as NUMERIC)
    Numeric(String),
    /// JSONB value
    JsonB(JsonValue),
    /// Array of text, matched with `= ANY(...)` in WHERE clauses
    TextArray(Vec<String>),
}

impl DbValue {
    /// BIGINT from an unsigned value, rejecting values past `i64::MAX`.
    pub fn uint(column: &str, value: u64) -> Result<Self, DbError> {
        i64::try_from(value).map(DbValue::Int64).map_err(|_| {
            DbError::OutOfRange(format!("{} = {} does not fit in BIGINT", column, value))
        })
    }
}

/// Database operation built by stores and collaborators.
#[derive(Debug, Clone)]
pub enum DbOperation {
    /// INSERT with ON CONFLICT DO UPDATE (upsert)
    Upsert {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
        /// Columns that form the unique constraint
        conflict_columns: Vec<String>,
        /// Columns to update on conflict
        update_columns: Vec<String>,
    },
    /// Simple INSERT
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
    },
    /// UPDATE with WHERE clause
    Update {
        table: String,
        set_columns: Vec<(String, DbValue)>,
        where_clause: WhereClause,
    },
    /// DELETE with WHERE clause
    Delete {
        table: String,
        where_clause: WhereClause,
    },
}

/// WHERE clause for UPDATE and DELETE operations.
#[derive(Debug, Clone)]
pub enum WhereClause {
    /// column = value
    Eq(String, DbValue),
    /// column1 = value1 AND column2 = value2 AND ...
    ///
    /// A `DbValue::TextArray` value renders as `column = ANY(value)`.
    And(Vec<(String, DbValue)>),
}
