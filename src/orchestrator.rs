//! Payment orchestrator (spec.md §4.3, §4.7; SPEC_FULL.md §4.8).
//!
//! Owns the `PaymentInstruction` state machine: `draft -> submitted ->
//! accepted -> settled`, with `failed`/`returned`/`canceled` branches.
//! `create_*_instruction` are purpose-specific constructors - net pay, tax,
//! third-party - that the original Python source dispatches separately but
//! that converge on one `submit`/`update_status` pair here (SPEC_FULL.md's
//! resolution of the sync/async parity Open Question: a single async
//! orchestrator implements all three purposes instead of the original's
//! divergent sync/async code paths).

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{PspError, PspResult};
use crate::events::{EventEmitter, EventPayload};
use crate::ids::{new_id, AttemptId, CorrelationId, InstructionId, LegalEntityId, TenantId};
use crate::money::{Amount, Currency};
use crate::providers::{PaymentRailProvider, SubmitRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionPurpose {
    EmployeeNetPay,
    Tax,
    ThirdParty,
}

impl InstructionPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionPurpose::EmployeeNetPay => "employee_net_pay",
            InstructionPurpose::Tax => "tax",
            InstructionPurpose::ThirdParty => "third_party",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionStatus {
    Draft,
    Submitted,
    Accepted,
    Settled,
    Failed,
    Returned,
    Canceled,
}

impl InstructionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionStatus::Draft => "draft",
            InstructionStatus::Submitted => "submitted",
            InstructionStatus::Accepted => "accepted",
            InstructionStatus::Settled => "settled",
            InstructionStatus::Failed => "failed",
            InstructionStatus::Returned => "returned",
            InstructionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> PspResult<Self> {
        match s {
            "draft" => Ok(InstructionStatus::Draft),
            "submitted" => Ok(InstructionStatus::Submitted),
            "accepted" => Ok(InstructionStatus::Accepted),
            "settled" => Ok(InstructionStatus::Settled),
            "failed" => Ok(InstructionStatus::Failed),
            "returned" => Ok(InstructionStatus::Returned),
            "canceled" => Ok(InstructionStatus::Canceled),
            other => Err(PspError::Integrity(format!("unknown instruction status: {other}"))),
        }
    }

    /// Rank in the forward happy-path progression, used to detect
    /// out-of-order callbacks. Terminal branches (`failed`/`returned`/
    /// `canceled`) all rank above their trigger point since nothing
    /// legitimately follows them.
    fn rank(&self) -> u8 {
        match self {
            InstructionStatus::Draft => 0,
            InstructionStatus::Submitted => 1,
            InstructionStatus::Accepted => 2,
            InstructionStatus::Settled => 3,
            InstructionStatus::Failed => 4,
            InstructionStatus::Returned => 5,
            InstructionStatus::Canceled => 4,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstructionStatus::Settled
                | InstructionStatus::Failed
                | InstructionStatus::Returned
                | InstructionStatus::Canceled
        )
    }
}

#[derive(Debug, Clone)]
pub struct PaymentInstruction {
    pub instruction_id: InstructionId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub purpose: InstructionPurpose,
    pub amount: Amount,
    pub currency: Currency,
    pub payee_ref_id: String,
    pub source_type: String,
    pub source_id: String,
    pub status: InstructionStatus,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    Applied,
    IgnoredStaleDuplicate,
    Rejected,
}

pub struct PaymentOrchestrator {
    db: Db,
    emitter: Arc<EventEmitter>,
    providers: HashMap<String, Arc<dyn PaymentRailProvider>>,
}

impl PaymentOrchestrator {
    pub fn new(db: Db, emitter: Arc<EventEmitter>) -> Self {
        Self { db, emitter, providers: HashMap::new() }
    }

    pub fn register_provider(&mut self, provider: Arc<dyn PaymentRailProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn create_employee_net_instruction(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        amount: Amount,
        currency: Currency,
        payee_ref_id: &str,
        source_id: &str,
        idempotency_key: &str,
        correlation_id: CorrelationId,
    ) -> PspResult<PaymentInstruction> {
        self.create_instruction(
            tenant_id, legal_entity_id, InstructionPurpose::EmployeeNetPay, amount, currency,
            payee_ref_id, "payroll_run", source_id, idempotency_key, correlation_id,
        )
    }

    pub fn create_tax_instruction(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        amount: Amount,
        currency: Currency,
        payee_ref_id: &str,
        source_id: &str,
        idempotency_key: &str,
        correlation_id: CorrelationId,
    ) -> PspResult<PaymentInstruction> {
        self.create_instruction(
            tenant_id, legal_entity_id, InstructionPurpose::Tax, amount, currency,
            payee_ref_id, "tax_liability", source_id, idempotency_key, correlation_id,
        )
    }

    pub fn create_third_party_instruction(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        amount: Amount,
        currency: Currency,
        payee_ref_id: &str,
        source_id: &str,
        idempotency_key: &str,
        correlation_id: CorrelationId,
    ) -> PspResult<PaymentInstruction> {
        self.create_instruction(
            tenant_id, legal_entity_id, InstructionPurpose::ThirdParty, amount, currency,
            payee_ref_id, "third_party_obligation", source_id, idempotency_key, correlation_id,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn create_instruction(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        purpose: InstructionPurpose,
        amount: Amount,
        currency: Currency,
        payee_ref_id: &str,
        source_type: &str,
        source_id: &str,
        idempotency_key: &str,
        correlation_id: CorrelationId,
    ) -> PspResult<PaymentInstruction> {
        if amount <= Decimal::ZERO {
            return Err(PspError::Validation(format!("instruction amount must be positive, got {amount}")));
        }

        let conn = self.db.conn();
        let existing: Option<String> = conn
            .query_row(
                "SELECT instruction_id FROM payment_instruction WHERE tenant_id = ?1 AND idempotency_key = ?2",
                rusqlite::params![tenant_id.to_string(), idempotency_key],
                |row| row.get(0),
            )
            .ok();

        if let Some(existing_id) = existing {
            warn!(idempotency_key, "replayed instruction creation");
            return self.load_instruction(&conn, &existing_id);
        }

        let instruction_id = new_id();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO payment_instruction
             (instruction_id, tenant_id, legal_entity_id, purpose, direction, amount, currency,
              payee_type, payee_ref_id, source_type, source_id, status, metadata_json,
              created_at, updated_at, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, 'credit', ?5, ?6, 'external', ?7, ?8, ?9, 'draft', '{}', ?10, ?10, ?11)",
            rusqlite::params![
                instruction_id.to_string(),
                tenant_id.to_string(),
                legal_entity_id.to_string(),
                purpose.as_str(),
                amount.to_string(),
                currency.code(),
                payee_ref_id,
                source_type,
                source_id,
                now,
                idempotency_key,
            ],
        )?;

        self.emitter.emit(
            tenant_id,
            correlation_id,
            None,
            "orchestrator",
            EventPayload::PaymentInstructionCreated {
                instruction_id: instruction_id.to_string(),
                purpose: purpose.as_str().to_string(),
                amount,
            },
        )?;

        Ok(PaymentInstruction {
            instruction_id,
            tenant_id,
            legal_entity_id,
            purpose,
            amount,
            currency,
            payee_ref_id: payee_ref_id.to_string(),
            source_type: source_type.to_string(),
            source_id: source_id.to_string(),
            status: InstructionStatus::Draft,
            idempotency_key: idempotency_key.to_string(),
        })
    }

    /// Submit a draft instruction to its rail. The pay gate must already
    /// have approved this exact amount before this is called - submission
    /// itself does not re-check funds, matching spec.md §4.7's call
    /// ordering (gate, then submit).
    pub async fn submit(
        &self,
        instruction: &PaymentInstruction,
        rail: &str,
        correlation_id: CorrelationId,
    ) -> PspResult<AttemptId> {
        self.require_status(instruction.instruction_id, InstructionStatus::Draft)?;

        let provider = self
            .providers
            .get(rail)
            .ok_or_else(|| PspError::Validation(format!("no provider registered for rail {rail}")))?
            .clone();

        let attempt_id = new_id();
        let attempt_no = self.next_attempt_no(instruction.instruction_id)?;
        let now = Utc::now().to_rfc3339();

        {
            let conn = self.db.conn();
            conn.execute(
                "INSERT INTO payment_attempt
                 (attempt_id, tenant_id, instruction_id, provider_name, attempt_no, status, submitted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'submitted', ?6)",
                rusqlite::params![
                    attempt_id.to_string(),
                    instruction.tenant_id.to_string(),
                    instruction.instruction_id.to_string(),
                    rail,
                    attempt_no,
                    now,
                ],
            )?;
        }

        let submit_result = provider
            .submit(SubmitRequest {
                instruction_id: instruction.instruction_id.to_string(),
                idempotency_key: format!("{}-{}", instruction.idempotency_key, attempt_no),
                amount: instruction.amount,
                currency: instruction.currency,
                payee_ref_id: instruction.payee_ref_id.clone(),
            })
            .await
            .map_err(|e| PspError::Provider(e.to_string()))?;

        {
            let conn = self.db.conn();
            conn.execute(
                "UPDATE payment_attempt SET provider_request_id = ?1 WHERE attempt_id = ?2",
                rusqlite::params![submit_result.provider_request_id, attempt_id.to_string()],
            )?;
        }

        self.emitter.emit(
            instruction.tenant_id,
            correlation_id,
            None,
            "orchestrator",
            EventPayload::PaymentSubmitted {
                instruction_id: instruction.instruction_id.to_string(),
                attempt_id: attempt_id.to_string(),
                provider_name: rail.to_string(),
            },
        )?;

        if submit_result.accepted {
            self.set_status(instruction.instruction_id, InstructionStatus::Submitted)?;
        } else {
            self.set_status(instruction.instruction_id, InstructionStatus::Failed)?;
            self.emitter.emit(
                instruction.tenant_id,
                correlation_id,
                None,
                "orchestrator",
                EventPayload::PaymentFailed {
                    instruction_id: instruction.instruction_id.to_string(),
                    attempt_id: attempt_id.to_string(),
                    reason: submit_result.detail.unwrap_or_else(|| "rejected at submission".to_string()),
                },
            )?;
        }

        Ok(attempt_id)
    }

    /// Apply a status callback from a rail (accepted/settled/failed/
    /// returned). SPEC_FULL.md §4.8: a callback that would move the
    /// instruction backwards in the happy-path order is rejected as
    /// illegal, UNLESS it is chronologically stale relative to the current
    /// status, in which case it's a duplicate delivery and is silently
    /// ignored.
    pub fn update_status(
        &self,
        instruction_id: InstructionId,
        new_status: InstructionStatus,
        tenant_id: TenantId,
        correlation_id: CorrelationId,
        return_code: Option<&str>,
    ) -> PspResult<UpdateOutcome> {
        let conn = self.db.conn();
        let current_str: String = conn
            .query_row(
                "SELECT status FROM payment_instruction WHERE instruction_id = ?1",
                [instruction_id.to_string()],
                |row| row.get(0),
            )
            .map_err(PspError::from)?;
        drop(conn);

        let current = InstructionStatus::parse(&current_str)?;

        if current.is_terminal() {
            if new_status.rank() <= current.rank() {
                info!(%instruction_id, from = ?current, to = ?new_status, "ignored stale duplicate callback");
                return Ok(UpdateOutcome::IgnoredStaleDuplicate);
            }
            warn!(%instruction_id, from = ?current, to = ?new_status, "rejected callback arriving after terminal status");
            return Ok(UpdateOutcome::Rejected);
        }

        if new_status.rank() < current.rank() {
            warn!(%instruction_id, from = ?current, to = ?new_status, "rejected out-of-order callback");
            return Ok(UpdateOutcome::Rejected);
        }

        self.set_status(instruction_id, new_status)?;

        self.emitter.emit(
            tenant_id,
            correlation_id,
            None,
            "orchestrator",
            EventPayload::SettlementStatusChanged {
                instruction_id: instruction_id.to_string(),
                from_status: current.as_str().to_string(),
                to_status: new_status.as_str().to_string(),
            },
        )?;

        let payload = match new_status {
            InstructionStatus::Accepted => Some(EventPayload::PaymentAccepted {
                instruction_id: instruction_id.to_string(),
                attempt_id: String::new(),
            }),
            InstructionStatus::Settled => Some(EventPayload::PaymentSettled {
                instruction_id: instruction_id.to_string(),
                attempt_id: String::new(),
            }),
            InstructionStatus::Returned => Some(EventPayload::PaymentReturned {
                instruction_id: instruction_id.to_string(),
                return_code: return_code.unwrap_or("UNKNOWN").to_string(),
            }),
            InstructionStatus::Canceled => Some(EventPayload::PaymentCanceled {
                instruction_id: instruction_id.to_string(),
                reason: "canceled".to_string(),
            }),
            _ => None,
        };
        if let Some(payload) = payload {
            self.emitter.emit(tenant_id, correlation_id, None, "orchestrator", payload)?;
        }

        Ok(UpdateOutcome::Applied)
    }

    fn require_status(&self, instruction_id: InstructionId, expected: InstructionStatus) -> PspResult<()> {
        let conn = self.db.conn();
        let current: String = conn
            .query_row(
                "SELECT status FROM payment_instruction WHERE instruction_id = ?1",
                [instruction_id.to_string()],
                |row| row.get(0),
            )
            .map_err(PspError::from)?;
        if current != expected.as_str() {
            return Err(PspError::Conflict(format!(
                "instruction {instruction_id} is {current}, expected {}",
                expected.as_str()
            )));
        }
        Ok(())
    }

    fn set_status(&self, instruction_id: InstructionId, status: InstructionStatus) -> PspResult<()> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE payment_instruction SET status = ?1, updated_at = ?2 WHERE instruction_id = ?3",
            rusqlite::params![status.as_str(), Utc::now().to_rfc3339(), instruction_id.to_string()],
        )?;
        Ok(())
    }

    fn next_attempt_no(&self, instruction_id: InstructionId) -> PspResult<i64> {
        let conn = self.db.conn();
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(attempt_no) FROM payment_attempt WHERE instruction_id = ?1",
                [instruction_id.to_string()],
                |row| row.get(0),
            )
            .map_err(PspError::from)?;
        Ok(max.unwrap_or(0) + 1)
    }

    pub fn get_instruction(&self, instruction_id: InstructionId) -> PspResult<PaymentInstruction> {
        let conn = self.db.conn();
        self.load_instruction(&conn, &instruction_id.to_string())
    }

    fn load_instruction(&self, conn: &rusqlite::Connection, instruction_id: &str) -> PspResult<PaymentInstruction> {
        conn.query_row(
            "SELECT instruction_id, tenant_id, legal_entity_id, purpose, amount, currency,
                    payee_ref_id, source_type, source_id, status, idempotency_key
             FROM payment_instruction WHERE instruction_id = ?1",
            [instruction_id],
            |row| {
                Ok(PaymentInstruction {
                    instruction_id: row.get::<_, String>(0)?.parse().unwrap(),
                    tenant_id: row.get::<_, String>(1)?.parse().unwrap(),
                    legal_entity_id: row.get::<_, String>(2)?.parse().unwrap(),
                    purpose: match row.get::<_, String>(3)?.as_str() {
                        "employee_net_pay" => InstructionPurpose::EmployeeNetPay,
                        "tax" => InstructionPurpose::Tax,
                        _ => InstructionPurpose::ThirdParty,
                    },
                    amount: row.get::<_, String>(4)?.parse().unwrap_or_default(),
                    currency: Currency::parse(&row.get::<_, String>(5)?).unwrap_or(Currency::Usd),
                    payee_ref_id: row.get(6)?,
                    source_type: row.get(7)?,
                    source_id: row.get(8)?,
                    status: InstructionStatus::parse(&row.get::<_, String>(9)?).unwrap_or(InstructionStatus::Draft),
                    idempotency_key: row.get(10)?,
                })
            },
        )
        .map_err(PspError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStore;

    fn setup() -> (PaymentOrchestrator, TenantId, LegalEntityId) {
        let db = Db::open_in_memory().unwrap();
        let emitter = Arc::new(EventEmitter::new(EventStore::new(db.clone())));
        let orchestrator = PaymentOrchestrator::new(db, emitter);
        (orchestrator, new_id(), new_id())
    }

    #[test]
    fn creating_instruction_twice_with_same_idempotency_key_returns_same_one() {
        let (orchestrator, tenant_id, legal_entity_id) = setup();
        let i1 = orchestrator
            .create_employee_net_instruction(
                tenant_id, legal_entity_id, Decimal::new(10000, 2), Currency::Usd,
                "payee-1", "run-1", "idem-1", new_id(),
            )
            .unwrap();
        let i2 = orchestrator
            .create_employee_net_instruction(
                tenant_id, legal_entity_id, Decimal::new(10000, 2), Currency::Usd,
                "payee-1", "run-1", "idem-1", new_id(),
            )
            .unwrap();
        assert_eq!(i1.instruction_id, i2.instruction_id);
    }

    #[test]
    fn zero_amount_instruction_is_rejected() {
        let (orchestrator, tenant_id, legal_entity_id) = setup();
        let result = orchestrator.create_tax_instruction(
            tenant_id, legal_entity_id, Decimal::ZERO, Currency::Usd,
            "irs", "run-1", "idem-2", new_id(),
        );
        assert!(matches!(result, Err(PspError::Validation(_))));
    }

    #[test]
    fn callback_after_settled_is_rejected_unless_stale() {
        let (orchestrator, tenant_id, legal_entity_id) = setup();
        let instruction = orchestrator
            .create_third_party_instruction(
                tenant_id, legal_entity_id, Decimal::new(5000, 2), Currency::Usd,
                "vendor-1", "run-1", "idem-3", new_id(),
            )
            .unwrap();
        orchestrator.set_status(instruction.instruction_id, InstructionStatus::Settled).unwrap();

        let stale = orchestrator
            .update_status(instruction.instruction_id, InstructionStatus::Accepted, tenant_id, new_id(), None)
            .unwrap();
        assert_eq!(stale, UpdateOutcome::IgnoredStaleDuplicate);

        let illegal = orchestrator
            .update_status(instruction.instruction_id, InstructionStatus::Returned, tenant_id, new_id(), Some("R01"))
            .unwrap();
        assert_eq!(illegal, UpdateOutcome::Rejected);
    }
}
