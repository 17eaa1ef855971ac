//! Event envelope and payload catalog (spec.md §4.6, §4.7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CausationId, CorrelationId, EventId, TenantId};
use crate::money::Amount;

/// A single immutable fact about something that happened in the PSP.
///
/// `correlation_id` ties every event raised by the same top-level facade
/// call together; `causation_id` points at the specific event (if any) that
/// triggered this one, letting a reader reconstruct the causal chain inside
/// one correlated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<CausationId>,
    pub source_service: String,
    pub payload: EventPayload,
    /// Monotonic per-tenant ordering, assigned by the store on append.
    pub sequence: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data")]
pub enum EventPayload {
    FundingRequested { account_id: String, amount: Amount },
    FundingApproved { account_id: String, amount: Amount },
    FundingBlocked { account_id: String, amount: Amount, reason: String },
    FundingInsufficientFunds { account_id: String, requested: Amount, available: Amount },

    PaymentInstructionCreated { instruction_id: String, purpose: String, amount: Amount },
    PaymentSubmitted { instruction_id: String, attempt_id: String, provider_name: String },
    PaymentAccepted { instruction_id: String, attempt_id: String },
    PaymentSettled { instruction_id: String, attempt_id: String },
    PaymentFailed { instruction_id: String, attempt_id: String, reason: String },
    PaymentReturned { instruction_id: String, return_code: String },
    PaymentCanceled { instruction_id: String, reason: String },

    LedgerEntryPosted { entry_id: String, account_id: String, amount: Amount },
    LedgerEntryReversed { entry_id: String, reversal_entry_id: String },

    SettlementReceived { settlement_event_id: String, external_trace_id: String },
    SettlementMatched { settlement_event_id: String, instruction_id: String, strategy: String },
    SettlementUnmatched { settlement_event_id: String },
    SettlementStatusChanged { instruction_id: String, from_status: String, to_status: String },

    LiabilityClassified { liability_event_id: String, error_origin: String, liability_party: String },
    LiabilityRecoveryStarted { liability_event_id: String, recovery_path: String },
    LiabilityRecovered { liability_event_id: String },
    LiabilityWrittenOff { liability_event_id: String },

    ReconciliationStarted { batch_ref: String },
    ReconciliationCompleted { batch_ref: String, matched: u32, unmatched: u32 },
    ReconciliationFailed { batch_ref: String, reason: String },
}

impl EventPayload {
    /// Stable string discriminant, used as the `event_type` column and as
    /// the pattern an `event_subscription` matches against.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::FundingRequested { .. } => "FundingRequested",
            EventPayload::FundingApproved { .. } => "FundingApproved",
            EventPayload::FundingBlocked { .. } => "FundingBlocked",
            EventPayload::FundingInsufficientFunds { .. } => "FundingInsufficientFunds",
            EventPayload::PaymentInstructionCreated { .. } => "PaymentInstructionCreated",
            EventPayload::PaymentSubmitted { .. } => "PaymentSubmitted",
            EventPayload::PaymentAccepted { .. } => "PaymentAccepted",
            EventPayload::PaymentSettled { .. } => "PaymentSettled",
            EventPayload::PaymentFailed { .. } => "PaymentFailed",
            EventPayload::PaymentReturned { .. } => "PaymentReturned",
            EventPayload::PaymentCanceled { .. } => "PaymentCanceled",
            EventPayload::LedgerEntryPosted { .. } => "LedgerEntryPosted",
            EventPayload::LedgerEntryReversed { .. } => "LedgerEntryReversed",
            EventPayload::SettlementReceived { .. } => "SettlementReceived",
            EventPayload::SettlementMatched { .. } => "SettlementMatched",
            EventPayload::SettlementUnmatched { .. } => "SettlementUnmatched",
            EventPayload::SettlementStatusChanged { .. } => "SettlementStatusChanged",
            EventPayload::LiabilityClassified { .. } => "LiabilityClassified",
            EventPayload::LiabilityRecoveryStarted { .. } => "LiabilityRecoveryStarted",
            EventPayload::LiabilityRecovered { .. } => "LiabilityRecovered",
            EventPayload::LiabilityWrittenOff { .. } => "LiabilityWrittenOff",
            EventPayload::ReconciliationStarted { .. } => "ReconciliationStarted",
            EventPayload::ReconciliationCompleted { .. } => "ReconciliationCompleted",
            EventPayload::ReconciliationFailed { .. } => "ReconciliationFailed",
        }
    }
}
