//! Append-only durable event store with replay (spec.md §4.6).

use chrono::Utc;
use tracing::debug;

use crate::db::Db;
use crate::error::{PspError, PspResult};
use crate::ids::{new_id, CausationId, CorrelationId, TenantId};

use super::types::{DomainEvent, EventPayload};

#[derive(Clone)]
pub struct EventStore {
    db: Db,
}

impl EventStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append one event, assigning it the next per-tenant sequence number.
    pub fn append(
        &self,
        tenant_id: TenantId,
        correlation_id: CorrelationId,
        causation_id: Option<CausationId>,
        source_service: &str,
        payload: EventPayload,
    ) -> PspResult<DomainEvent> {
        let conn = self.db.conn();
        let next_seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM domain_event WHERE tenant_id = ?1",
                [tenant_id.to_string()],
                |row| row.get(0),
            )
            .map_err(PspError::from)?;

        let event = DomainEvent {
            event_id: new_id(),
            tenant_id,
            occurred_at: Utc::now(),
            correlation_id,
            causation_id,
            source_service: source_service.to_string(),
            payload,
            sequence: next_seq,
        };

        let payload_json = serde_json::to_string(&event.payload)
            .map_err(|e| PspError::Integrity(format!("event payload not serializable: {e}")))?;

        conn.execute(
            "INSERT INTO domain_event
             (event_id, tenant_id, event_type, occurred_at, correlation_id, causation_id,
              source_service, payload_json, sequence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                event.event_id.to_string(),
                event.tenant_id.to_string(),
                event.payload.type_name(),
                event.occurred_at.to_rfc3339(),
                event.correlation_id.to_string(),
                event.causation_id.map(|c| c.to_string()),
                event.source_service,
                payload_json,
                event.sequence,
            ],
        )
        .map_err(PspError::from)?;

        debug!(event_type = event.payload.type_name(), seq = event.sequence, "event appended");
        Ok(event)
    }

    /// Replay every event for a tenant in sequence order, oldest first.
    pub fn replay(&self, tenant_id: TenantId) -> PspResult<Vec<DomainEvent>> {
        self.load_by_correlation_or_all(tenant_id, None)
    }

    /// Replay only the events sharing a correlation id - the full timeline
    /// of one facade call.
    pub fn load_by_correlation(
        &self,
        tenant_id: TenantId,
        correlation_id: CorrelationId,
    ) -> PspResult<Vec<DomainEvent>> {
        self.load_by_correlation_or_all(tenant_id, Some(correlation_id))
    }

    fn load_by_correlation_or_all(
        &self,
        tenant_id: TenantId,
        correlation_id: Option<CorrelationId>,
    ) -> PspResult<Vec<DomainEvent>> {
        let conn = self.db.conn();
        let (sql, corr_filter) = match correlation_id {
            Some(c) => (
                "SELECT event_id, tenant_id, occurred_at, correlation_id, causation_id,
                        source_service, payload_json, sequence
                 FROM domain_event WHERE tenant_id = ?1 AND correlation_id = ?2 ORDER BY sequence",
                Some(c.to_string()),
            ),
            None => (
                "SELECT event_id, tenant_id, occurred_at, correlation_id, causation_id,
                        source_service, payload_json, sequence
                 FROM domain_event WHERE tenant_id = ?1 ORDER BY sequence",
                None,
            ),
        };

        let mut stmt = conn.prepare(sql).map_err(PspError::from)?;
        let rows = if let Some(corr) = corr_filter {
            stmt.query_map(rusqlite::params![tenant_id.to_string(), corr], row_to_event)
        } else {
            stmt.query_map(rusqlite::params![tenant_id.to_string()], row_to_event)
        }
        .map_err(PspError::from)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(PspError::from)?);
        }
        Ok(events)
    }
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<DomainEvent> {
    let event_id: String = row.get(0)?;
    let tenant_id: String = row.get(1)?;
    let occurred_at: String = row.get(2)?;
    let correlation_id: String = row.get(3)?;
    let causation_id: Option<String> = row.get(4)?;
    let source_service: String = row.get(5)?;
    let payload_json: String = row.get(6)?;
    let sequence: i64 = row.get(7)?;

    let payload: EventPayload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(DomainEvent {
        event_id: event_id.parse().unwrap_or_else(|_| new_id()),
        tenant_id: tenant_id.parse().unwrap_or_else(|_| new_id()),
        occurred_at: chrono::DateTime::parse_from_rfc3339(&occurred_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        correlation_id: correlation_id.parse().unwrap_or_else(|_| new_id()),
        causation_id: causation_id.and_then(|c| c.parse().ok()),
        source_service,
        payload,
        sequence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::new_id;

    #[tokio::test]
    async fn append_assigns_increasing_sequence() {
        let db = Db::open_in_memory().unwrap();
        let store = EventStore::new(db);
        let tenant = new_id();
        let correlation = new_id();

        let e1 = store
            .append(
                tenant,
                correlation,
                None,
                "test",
                EventPayload::FundingRequested {
                    account_id: "a".into(),
                    amount: rust_decimal::Decimal::new(100, 0),
                },
            )
            .unwrap();
        let e2 = store
            .append(
                tenant,
                correlation,
                Some(e1.event_id),
                "test",
                EventPayload::FundingApproved {
                    account_id: "a".into(),
                    amount: rust_decimal::Decimal::new(100, 0),
                },
            )
            .unwrap();

        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);

        let replayed = store.replay(tenant).unwrap();
        assert_eq!(replayed.len(), 2);
    }
}
