//! Deterministic in-memory FedNow stub (spec.md §6).
//!
//! Unlike ACH, FedNow settles same-day (effectively instantly in this
//! stub) and never returns - a generic reject happens synchronously at
//! submit time instead of via a settlement-feed return code.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    CancelResult, PaymentRailProvider, RailCapabilities, RailStatus, SettlementRecord,
    StatusResult, SubmitRequest, SubmitResult,
};

pub struct FedNowStubProvider {
    queued_settlements: Mutex<Vec<SettlementRecord>>,
}

impl FedNowStubProvider {
    pub fn new() -> Self {
        Self {
            queued_settlements: Mutex::new(Vec::new()),
        }
    }

    pub fn enqueue_settlement(&self, record: SettlementRecord) {
        self.queued_settlements.lock().push(record);
    }
}

impl Default for FedNowStubProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentRailProvider for FedNowStubProvider {
    fn name(&self) -> &'static str {
        "fednow"
    }

    fn capabilities(&self) -> RailCapabilities {
        RailCapabilities {
            supports_same_day: true,
            supports_cancel: true,
            max_amount: Some(rust_decimal::Decimal::new(10_000_000, 2)),
        }
    }

    async fn submit(&self, request: SubmitRequest) -> anyhow::Result<SubmitResult> {
        if let Some(max) = self.capabilities().max_amount {
            if request.amount > max {
                return Ok(SubmitResult {
                    provider_request_id: format!("fednow-{}", request.idempotency_key),
                    accepted: false,
                    detail: Some("amount exceeds FedNow per-transaction limit".to_string()),
                });
            }
        }
        Ok(SubmitResult {
            provider_request_id: format!("fednow-{}", request.idempotency_key),
            accepted: true,
            detail: None,
        })
    }

    async fn check_status(&self, _provider_request_id: &str) -> anyhow::Result<StatusResult> {
        Ok(StatusResult {
            status: RailStatus::Settled,
            return_code: None,
            return_reason: None,
        })
    }

    async fn cancel(&self, provider_request_id: &str) -> anyhow::Result<CancelResult> {
        Ok(CancelResult {
            canceled: true,
            detail: Some(format!("canceled {provider_request_id} before settlement")),
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
    use crate::money::Currency;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn submit_rejects_amount_over_limit() {
        let provider = FedNowStubProvider::new();
        let request = SubmitRequest {
            instruction_id: "i1".into(),
            idempotency_key: "idem-1".into(),
            amount: Decimal::new(20_000_000, 2),
            currency: Currency::Usd,
            payee_ref_id: "payee-1".into(),
        };
        let result = provider.submit(request).await.unwrap();
        assert!(!result.accepted);
    }

    #[tokio::test]
    async fn check_status_reports_settled_immediately() {
        let provider = FedNowStubProvider::new();
        let status = provider.check_status("fednow-x").await.unwrap();
        assert_eq!(status.status, RailStatus::Settled);
    }
}
