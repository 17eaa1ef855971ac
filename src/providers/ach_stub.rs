//! Deterministic in-memory ACH stub (spec.md §6, §8 scenario fixtures).
//!
//! Next-day settlement, no same-day, no cancel once submitted - that's ACH.
//! Held in a `parking_lot::Mutex` queue the same way the teacher's
//! `scrapers` stubs buffer fixture responses for integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    CancelResult, PaymentRailProvider, RailCapabilities, RailStatus, SettlementRecord,
    StatusResult, SubmitRequest, SubmitResult,
};

pub struct AchStubProvider {
    queued_settlements: Mutex<Vec<SettlementRecord>>,
}

impl AchStubProvider {
    pub fn new() -> Self {
        Self {
            queued_settlements: Mutex::new(Vec::new()),
        }
    }

    /// Test/demo hook: enqueue a settlement record as if it arrived on the
    /// next ACH settlement file.
    pub fn enqueue_settlement(&self, record: SettlementRecord) {
        self.queued_settlements.lock().push(record);
    }
}

impl Default for AchStubProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentRailProvider for AchStubProvider {
    fn name(&self) -> &'static str {
        "ach"
    }

    fn capabilities(&self) -> RailCapabilities {
        RailCapabilities {
            supports_same_day: false,
            supports_cancel: false,
            max_amount: None,
        }
    }

    async fn submit(&self, request: SubmitRequest) -> anyhow::Result<SubmitResult> {
        Ok(SubmitResult {
            provider_request_id: format!("ach-{}", request.idempotency_key),
            accepted: true,
            detail: None,
        })
    }

    async fn check_status(&self, _provider_request_id: &str) -> anyhow::Result<StatusResult> {
        Ok(StatusResult {
            status: RailStatus::Accepted,
            return_code: None,
            return_reason: None,
        })
    }

    async fn cancel(&self, _provider_request_id: &str) -> anyhow::Result<CancelResult> {
        Ok(CancelResult {
            canceled: false,
            detail: Some("ACH stub does not support cancel once submitted".to_string()),
        })
    }

    async fn fetch_settlement_feed(&self) -> anyhow::Result<Vec<SettlementRecord>> {
        let mut queue = self.queued_settlements.lock();
        Ok(std::mem::take(&mut *queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::{Currency, Direction};
    use chrono::Utc;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn submit_is_always_accepted_and_deterministic() {
        let provider = AchStubProvider::new();
        let request = SubmitRequest {
            instruction_id: "i1".into(),
            idempotency_key: "idem-1".into(),
            amount: Decimal::new(10000, 2),
            currency: Currency::Usd,
            payee_ref_id: "payee-1".into(),
        };
        let result = provider.submit(request.clone()).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.provider_request_id, "ach-idem-1");

        let result2 = provider.submit(request).await.unwrap();
        assert_eq!(result2.provider_request_id, result.provider_request_id);
    }

    #[tokio::test]
    async fn fetch_settlement_feed_drains_queue() {
        let provider = AchStubProvider::new();
        provider.enqueue_settlement(SettlementRecord {
            external_trace_id: "trace-1".into(),
            bank_account_id: "bank-1".into(),
            direction: Direction::Debit,
            amount: Decimal::new(10000, 2),
            currency: Currency::Usd,
            effective_date: Utc::now().date_naive(),
            status: RailStatus::Settled,
            return_code: None,
            return_reason: None,
            instruction_hint: None,
        });

        let first = provider.fetch_settlement_feed().await.unwrap();
        assert_eq!(first.len(), 1);
        let second = provider.fetch_settlement_feed().await.unwrap();
        assert!(second.is_empty());
    }
}
