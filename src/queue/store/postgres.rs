use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::Row;

use super::{check_document_size, LeaseFilter, LeaseSort, QueueScope, QueueStore, StoreError};
use crate::db::{DbOperation, DbPool, DbValue, WhereClause};
use crate::queue::clock::Clock;
use crate::queue::item::{QueueItem, QueueItemType};

const TABLE: &str = "queue";
const COLUMNS: &str = "type, block, address, processing, data, id, creation, count";
const INSERT_COLUMNS: [&str; 10] = [
    "protocol", "network", "id", "type", "block", "address", "processing", "data", "creation",
    "count",
];

/// Queue store backed by the `queue` table, one row per identity within a
/// `(protocol, network)` scope.
pub struct PgQueueStore {
    pool: Arc<DbPool>,
    scope: QueueScope,
    clock: Arc<dyn Clock>,
}

impl PgQueueStore {
    pub fn new(pool: Arc<DbPool>, scope: QueueScope, clock: Arc<dyn Clock>) -> Self {
        Self { pool, scope, clock }
    }

    fn scope_conditions(&self) -> Vec<(String, DbValue)> {
        vec![
            ("protocol".to_string(), DbValue::Text(self.scope.protocol.clone())),
            ("network".to_string(), DbValue::Text(self.scope.network.clone())),
        ]
    }

    fn upsert_operation(&self, item: &QueueItem) -> Result<DbOperation, StoreError> {
        Ok(DbOperation::Upsert {
            table: TABLE.to_string(),
            columns: INSERT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            values: insert_values(&self.scope, item)?,
            conflict_columns: vec!["protocol".into(), "network".into(), "id".into()],
            update_columns: INSERT_COLUMNS[3..].iter().map(|c| c.to_string()).collect(),
        })
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    fn scope(&self) -> &QueueScope {
        &self.scope
    }

    async fn upsert_many(&self, items: &[QueueItem]) -> Result<(), StoreError> {
        let mut operations = Vec::with_capacity(items.len());
        for item in items {
            check_document_size(item)?;
            operations.push(self.upsert_operation(item)?);
        }
        self.pool.execute_transaction(operations).await?;
        Ok(())
    }

    async fn submit_many(&self, items: &[QueueItem]) -> Result<Vec<QueueItem>, StoreError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        for item in items {
            check_document_size(item)?;
        }
        let (sql, values) = build_submit_sql(&self.scope, items)?;
        let rows = self.pool.query_values(&sql, &values).await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn lease_next(
        &self,
        types: &[QueueItemType],
        filter: &LeaseFilter,
        sort: LeaseSort,
    ) -> Result<Option<QueueItem>, StoreError> {
        if types.is_empty() {
            return Ok(None);
        }
        let (sql, values) = build_lease_sql(&self.scope, types, filter, sort, self.clock.now());
        let rows = self.pool.query_values(&sql, &values).await?;
        match rows.first() {
            Some(row) => Ok(Some(row_to_item(row)?)),
            None => Ok(None),
        }
    }

    async fn free(&self, id: &str, attempt_count: u32) -> Result<(), StoreError> {
        let mut conditions = self.scope_conditions();
        conditions.push(("id".to_string(), DbValue::Text(id.to_string())));
        self.pool
            .execute(DbOperation::Update {
                table: TABLE.to_string(),
                set_columns: vec![
                    ("processing".to_string(), DbValue::Int64(0)),
                    ("count".to_string(), DbValue::Int64(i64::from(attempt_count))),
                ],
                where_clause: WhereClause::And(conditions),
            })
            .await?;
        Ok(())
    }

    async fn free_stale(&self, ids: &[String], cutoff: u64) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET processing = 0 \
             WHERE protocol = $1 AND network = $2 AND id = ANY($3) \
             AND processing > 0 AND processing <= $4 RETURNING id",
            TABLE
        );
        let values = [
            DbValue::Text(self.scope.protocol.clone()),
            DbValue::Text(self.scope.network.clone()),
            DbValue::TextArray(ids.to_vec()),
            DbValue::Int64(saturating_i64(cutoff)),
        ];
        let rows = self.pool.query_values(&sql, &values).await?;
        Ok(rows.len() as u64)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conditions = self.scope_conditions();
        conditions.push(("id".to_string(), DbValue::Text(id.to_string())));
        self.pool
            .execute(DbOperation::Delete {
                table: TABLE.to_string(),
                where_clause: WhereClause::And(conditions),
            })
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE protocol = $1 AND network = $2 AND id = $3",
            COLUMNS, TABLE
        );
        let row = self
            .pool
            .query_opt(&sql, &[&self.scope.protocol, &self.scope.network, &id])
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn leased(&self) -> Result<Vec<QueueItem>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE protocol = $1 AND network = $2 AND processing > 0",
            COLUMNS, TABLE
        );
        let rows = self
            .pool
            .query(&sql, &[&self.scope.protocol, &self.scope.network])
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn poisoned(&self, ceiling: u32) -> Result<Vec<QueueItem>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE protocol = $1 AND network = $2 AND count > $3",
            COLUMNS, TABLE
        );
        let ceiling = i64::from(ceiling);
        let rows = self
            .pool
            .query(&sql, &[&self.scope.protocol, &self.scope.network, &ceiling])
            .await?;
        rows.iter().map(row_to_item).collect()
    }
}

/// Single-statement lease: the subquery picks one row and locks it, skipping
/// rows another transaction already holds, and the outer update stamps it.
fn build_lease_sql(
    scope: &QueueScope,
    types: &[QueueItemType],
    filter: &LeaseFilter,
    sort: LeaseSort,
    now: u64,
) -> (String, Vec<DbValue>) {
    let mut values = vec![
        DbValue::Int64(saturating_i64(now)),
        DbValue::Text(scope.protocol.clone()),
        DbValue::Text(scope.network.clone()),
        DbValue::TextArray(types.iter().map(|t| t.as_str().to_string()).collect()),
    ];
    let mut conditions = vec![
        "protocol = $2".to_string(),
        "network = $3".to_string(),
        "type = ANY($4)".to_string(),
    ];

    if filter.unleased_only {
        conditions.push("processing = 0".to_string());
    }
    if let Some(max) = filter.max_attempts {
        values.push(DbValue::Int64(i64::from(max)));
        conditions.push(format!("count < ${}", values.len()));
    }
    if let Some(ceiling) = filter.attempt_ceiling {
        values.push(DbValue::Int64(i64::from(ceiling)));
        conditions.push(format!("count <= ${}", values.len()));
    }
    if let Some((start, end)) = filter.block_range {
        values.push(DbValue::Int64(saturating_i64(start)));
        values.push(DbValue::Int64(saturating_i64(end)));
        conditions.push(format!(
            "block BETWEEN ${} AND ${}",
            values.len() - 1,
            values.len()
        ));
    }
    if let Some(address) = &filter.address {
        values.push(DbValue::Text(address.clone()));
        conditions.push(format!("address = ${}", values.len()));
    }

    let sql = format!(
        "UPDATE {table} SET processing = $1 \
         WHERE protocol = $2 AND network = $3 AND id = (\
         SELECT id FROM {table} WHERE {conditions} \
         ORDER BY {order} LIMIT 1 FOR UPDATE SKIP LOCKED) \
         RETURNING {columns}",
        table = TABLE,
        conditions = conditions.join(" AND "),
        order = sort.order_by_sql(),
        columns = COLUMNS,
    );
    (sql, values)
}

/// Resubmission in one statement. A conflicting row keeps its creation time,
/// loses its lease and counts the incoming document as one more attempt on
/// top of any in-batch repeats it already carries.
fn build_submit_sql(
    scope: &QueueScope,
    items: &[QueueItem],
) -> Result<(String, Vec<DbValue>), StoreError> {
    let mut values = Vec::with_capacity(items.len() * INSERT_COLUMNS.len());
    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let start = values.len();
        values.extend(insert_values(scope, item)?);
        let placeholders: Vec<String> = (start + 1..=values.len())
            .map(|idx| format!("${}", idx))
            .collect();
        rows.push(format!("({})", placeholders.join(", ")));
    }

    let sql = format!(
        "INSERT INTO {table} ({insert_columns}) VALUES {rows} \
         ON CONFLICT (protocol, network, id) DO UPDATE SET \
         type = EXCLUDED.type, block = EXCLUDED.block, address = EXCLUDED.address, \
         processing = 0, data = EXCLUDED.data, \
         count = {table}.count + EXCLUDED.count + 1 \
         RETURNING {columns}",
        table = TABLE,
        insert_columns = INSERT_COLUMNS.join(", "),
        rows = rows.join(", "),
        columns = COLUMNS,
    );
    Ok((sql, values))
}

fn insert_values(scope: &QueueScope, item: &QueueItem) -> Result<Vec<DbValue>, StoreError> {
    let uint = |column: &str, value: u64| {
        DbValue::uint(column, value).map_err(|e| invalid(&item.id, e))
    };
    Ok(vec![
        DbValue::Text(scope.protocol.clone()),
        DbValue::Text(scope.network.clone()),
        DbValue::Text(item.id.clone()),
        DbValue::Text(item.item_type.as_str().to_string()),
        uint("block", item.block)?,
        DbValue::Text(item.address.clone()),
        uint("processing", item.lease_time)?,
        DbValue::JsonB(item.payload.clone()),
        uint("creation", item.creation_time)?,
        DbValue::Int64(i64::from(item.attempt_count)),
    ])
}

/// Filter bounds past `i64::MAX` match everything a BIGINT can hold.
fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn row_to_item(row: &Row) -> Result<QueueItem, StoreError> {
    let id: String = row.try_get("id").map_err(|e| invalid("<unknown>", e))?;
    let get_u64 = |col: &str| -> Result<u64, StoreError> {
        let value = row.try_get::<_, i64>(col).map_err(|e| invalid(&id, e))?;
        u64::try_from(value).map_err(|_| invalid(&id, format!("negative {}: {}", col, value)))
    };

    let item_type: String = row.try_get("type").map_err(|e| invalid(&id, e))?;
    let item_type = item_type.parse::<QueueItemType>()?;
    let attempt_count = get_u64("count")?;

    Ok(QueueItem {
        item_type,
        block: get_u64("block")?,
        address: row.try_get("address").map_err(|e| invalid(&id, e))?,
        lease_time: get_u64("processing")?,
        payload: row.try_get("data").map_err(|e| invalid(&id, e))?,
        creation_time: get_u64("creation")?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
        id: id.clone(),
    })
}

fn invalid(id: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidDocument {
        id: id.to_string(),
        message: e.to_string(),
    }
}
