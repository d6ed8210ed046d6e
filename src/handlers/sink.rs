use std::sync::Arc;

use async_trait::async_trait;

use crate::db::{DbError, DbOperation, DbPool, DbValue};
use crate::queue::Clock;
use crate::recovery::{CollaboratorError, RescrapeRequest, Rescraper};

/// Records rescrape requests in `rescrape_requests` for the collection layer
/// to pick up.
pub struct PgRescrapeSink {
    db: Arc<DbPool>,
    clock: Arc<dyn Clock>,
}

impl PgRescrapeSink {
    pub fn new(db: Arc<DbPool>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

#[async_trait]
impl Rescraper for PgRescrapeSink {
    async fn rescrape(&self, request: &RescrapeRequest) -> Result<(), CollaboratorError> {
        self.db
            .execute(insert_request(request, self.clock.now())?)
            .await?;

        tracing::info!(
            network = %request.network,
            "Requested {} rescrape of {} addresses over blocks {}..={}: {}",
            request.kind.as_str(),
            request.addresses.len(),
            request.block_ini,
            request.block_end,
            request.reason
        );
        Ok(())
    }
}

fn insert_request(request: &RescrapeRequest, requested_at: u64) -> Result<DbOperation, DbError> {
    Ok(DbOperation::Insert {
        table: "rescrape_requests".to_string(),
        columns: vec![
            "protocol".to_string(),
            "network".to_string(),
            "kind".to_string(),
            "addresses".to_string(),
            "block_ini".to_string(),
            "block_end".to_string(),
            "step".to_string(),
            "reason".to_string(),
            "requested_at".to_string(),
        ],
        values: vec![
            DbValue::Text(request.protocol.clone()),
            DbValue::Text(request.network.clone()),
            DbValue::Text(request.kind.as_str().to_string()),
            DbValue::TextArray(request.addresses.iter().map(|a| a.to_lowercase()).collect()),
            DbValue::uint("block_ini", request.block_ini)?,
            DbValue::uint("block_end", request.block_end)?,
            DbValue::uint("step", request.step)?,
            DbValue::Text(request.reason.clone()),
            DbValue::uint("requested_at", requested_at)?,
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::RescrapeKind;

    #[test]
    fn test_insert_request_columns() {
        let request = RescrapeRequest::bounded(
            "gamma",
            "ethereum",
            RescrapeKind::RevenueOperations,
            vec!["0xABC".to_string()],
            100,
            200,
            1000,
            "fees without revenue",
        )
        .unwrap();

        let DbOperation::Insert { table, columns, values } = insert_request(&request, 42).unwrap()
        else {
            panic!("expected an insert");
        };
        assert_eq!(table, "rescrape_requests");
        assert_eq!(columns.len(), values.len());
        assert!(matches!(&values[2], DbValue::Text(k) if k == RescrapeKind::RevenueOperations.as_str()));
        assert!(matches!(&values[3], DbValue::TextArray(a) if a == &vec!["0xabc".to_string()]));
        assert!(matches!(values[8], DbValue::Int64(42)));
    }

    #[test]
    fn test_insert_request_rejects_blocks_past_bigint() {
        let request = RescrapeRequest::bounded(
            "gamma",
            "ethereum",
            RescrapeKind::Operations,
            vec!["0xabc".to_string()],
            100,
            u64::MAX,
            1000,
            "supply difference",
        )
        .unwrap();

        assert!(matches!(
            insert_request(&request, 42),
            Err(DbError::OutOfRange(msg)) if msg.contains("block_end")
        ));
    }
}
