//! Provider adapter contract (spec.md §6).
//!
//! `PaymentRailProvider` is the seam between the orchestrator and a concrete
//! rail. Grounded on the teacher's `ExchangeAdapter`-style async trait
//! objects (`arbitrage`/`scrapers` modules talk to venues through a trait,
//! never directly): `async_trait` so the trait stays object-safe and the
//! orchestrator can hold `Box<dyn PaymentRailProvider>` per configured rail.

pub mod ach_stub;
pub mod fednow_stub;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::money::{Amount, Currency};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RailCapabilities {
    pub supports_same_day: bool,
    pub supports_cancel: bool,
    pub max_amount: Option<Amount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub instruction_id: String,
    pub idempotency_key: String,
    pub amount: Amount,
    pub currency: Currency,
    pub payee_ref_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub provider_request_id: String,
    pub accepted: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RailStatus {
    Pending,
    Accepted,
    Settled,
    Failed,
    Returned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub status: RailStatus,
    pub return_code: Option<String>,
    pub return_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResult {
    pub canceled: bool,
    pub detail: Option<String>,
}

/// A settlement record as it arrives from a rail's settlement feed, prior
/// to being matched to a `PaymentInstruction` (spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub external_trace_id: String,
    pub bank_account_id: String,
    pub direction: crate::money::Direction,
    pub amount: Amount,
    pub currency: Currency,
    pub effective_date: NaiveDate,
    pub status: RailStatus,
    pub return_code: Option<String>,
    pub return_reason: Option<String>,
    pub instruction_hint: Option<String>,
}

#[async_trait]
pub trait PaymentRailProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> RailCapabilities;

    async fn submit(&self, request: SubmitRequest) -> anyhow::Result<SubmitResult>;
    async fn check_status(&self, provider_request_id: &str) -> anyhow::Result<StatusResult>;
    async fn cancel(&self, provider_request_id: &str) -> anyhow::Result<CancelResult>;

    /// Pull whatever settlement records have landed since the rail was last
    /// polled. Stub rails return a fixed in-memory queue; a real adapter
    /// would page a settlement-file API or subscribe to a webhook feed.
    async fn fetch_settlement_feed(&self) -> anyhow::Result<Vec<SettlementRecord>>;
}
