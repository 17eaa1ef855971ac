//! Facade (spec.md §4.7).
//!
//! The only entry point callers outside this crate should use. Composes
//! the funding gate, ledger, orchestrator, reconciler, and liability
//! classifier into the four top-level operations spec.md names:
//! `commit_payroll_batch`, `execute_payments`, `ingest_settlement_feed`,
//! `handle_provider_callback`. Enforces the call ordering spec.md §4.7
//! requires - commit-gate before reservation, reservation before pay-gate,
//! pay-gate before submit - so a caller cannot accidentally skip a check by
//! calling the lower-level modules directly in the wrong order.
//!
//! original_source/psp.py exposed this as two classes, `PSP` (sync) and
//! `AsyncPSP` (async), whose purpose-specific dispatch had drifted out of
//! sync with each other. SPEC_FULL.md §9 resolves that by giving this
//! crate a single async facade that every purpose goes through.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::config::PspConfig;
use crate::db::Db;
use crate::error::{PspError, PspResult};
use crate::events::EventEmitter;
use crate::funding_gate::{FundingGate, GateResult};
use crate::ids::{new_id, CorrelationId, InstructionId, LegalEntityId, TenantId};
use crate::ledger::{AccountType, Ledger, PostingLeg};
use crate::liability::LiabilityClassifier;
use crate::money::{Amount, Currency, Direction};
use crate::orchestrator::{InstructionStatus, PaymentOrchestrator};
use crate::providers::PaymentRailProvider;
use crate::reconciler::{ReconciliationSummary, Reconciler};

/// Resolves the client-payable account a purpose posts against. Shared
/// with `reconciler::reverse_posting` so a settlement reversal debits the
/// same account the original settle-time posting credited.
pub(crate) fn payable_account_type_for_purpose(purpose: &str) -> PspResult<AccountType> {
    match purpose {
        "employee_net_pay" => Ok(AccountType::ClientNetPayPayable),
        "tax" => Ok(AccountType::ClientTaxPayable),
        "third_party" => Ok(AccountType::ClientThirdPartyPayable),
        other => Err(PspError::Validation(format!("unknown instruction purpose: {other}"))),
    }
}

/// One line item in a payroll batch: a single net-pay, tax, or
/// third-party obligation to turn into a payment instruction.
pub struct BatchLineItem {
    pub purpose: &'static str,
    pub amount: Amount,
    pub payee_ref_id: String,
    pub source_id: String,
    pub idempotency_key: String,
}

pub struct CommitResult {
    pub gate_result: GateResult,
    pub instruction_ids: Vec<InstructionId>,
}

pub struct ExecuteResult {
    pub submitted: Vec<InstructionId>,
    pub blocked: Vec<InstructionId>,
}

pub struct PspFacade {
    db: Db,
    ledger: Ledger,
    orchestrator: PaymentOrchestrator,
    emitter: Arc<EventEmitter>,
    config: PspConfig,
    providers: HashMap<String, Arc<dyn PaymentRailProvider>>,
}

impl PspFacade {
    pub fn new(db: Db, config: PspConfig) -> Self {
        let emitter = Arc::new(EventEmitter::new(crate::events::EventStore::new(db.clone())));
        let ledger = Ledger::new(db.clone());
        let orchestrator = PaymentOrchestrator::new(db.clone(), emitter.clone());
        Self { db, ledger, orchestrator, emitter, config, providers: HashMap::new() }
    }

    pub fn register_provider(&mut self, provider: Arc<dyn PaymentRailProvider>) {
        self.providers.insert(provider.name().to_string(), provider.clone());
        self.orchestrator.register_provider(provider);
    }

    /// Evaluate the commit gate, reserve funds for every line item that
    /// passes it, and create the corresponding draft instructions.
    pub fn commit_payroll_batch(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        funding_account_id: crate::ids::AccountId,
        line_items: Vec<BatchLineItem>,
        correlation_id: CorrelationId,
    ) -> PspResult<CommitResult> {
        let total: Amount = line_items.iter().map(|l| l.amount).sum();

        let gate = FundingGate::new(&self.ledger, &self.emitter, &self.config);
        let gate_result = gate.evaluate_commit_gate(tenant_id, funding_account_id, total, correlation_id)?;

        if !gate_result.approved() {
            return Ok(CommitResult { gate_result, instruction_ids: Vec::new() });
        }

        let mut instruction_ids = Vec::with_capacity(line_items.len());
        for item in line_items {
            self.ledger.create_reservation(
                tenant_id,
                funding_account_id,
                item.amount,
                "payment_instruction",
                &item.source_id,
                correlation_id,
                self.config.reservation_ttl_hours,
            )?;

            let instruction = match item.purpose {
                "employee_net_pay" => self.orchestrator.create_employee_net_instruction(
                    tenant_id, legal_entity_id, item.amount, Currency::Usd,
                    &item.payee_ref_id, &item.source_id, &item.idempotency_key, correlation_id,
                )?,
                "tax" => self.orchestrator.create_tax_instruction(
                    tenant_id, legal_entity_id, item.amount, Currency::Usd,
                    &item.payee_ref_id, &item.source_id, &item.idempotency_key, correlation_id,
                )?,
                "third_party" => self.orchestrator.create_third_party_instruction(
                    tenant_id, legal_entity_id, item.amount, Currency::Usd,
                    &item.payee_ref_id, &item.source_id, &item.idempotency_key, correlation_id,
                )?,
                other => return Err(PspError::Validation(format!("unknown line item purpose: {other}"))),
            };
            instruction_ids.push(instruction.instruction_id);
        }

        Ok(CommitResult { gate_result, instruction_ids })
    }

    /// Run the pay gate for every draft instruction and submit the ones
    /// that pass to their configured rail. The pay gate runs once per
    /// instruction, immediately before that instruction's submission - not
    /// once for the whole batch - so one short instruction doesn't block
    /// its siblings.
    pub async fn execute_payments(
        &self,
        tenant_id: TenantId,
        funding_account_id: crate::ids::AccountId,
        instructions: Vec<crate::orchestrator::PaymentInstruction>,
        rail: &str,
        correlation_id: CorrelationId,
    ) -> PspResult<ExecuteResult> {
        let gate = FundingGate::new(&self.ledger, &self.emitter, &self.config);
        let mut submitted = Vec::new();
        let mut blocked = Vec::new();

        for instruction in instructions {
            let gate_result =
                gate.evaluate_pay_gate(tenant_id, funding_account_id, instruction.amount, correlation_id)?;

            if !gate_result.approved() {
                blocked.push(instruction.instruction_id);
                continue;
            }

            self.orchestrator.submit(&instruction, rail, correlation_id).await?;
            self.settle_clearing_to_payable(tenant_id, &instruction, correlation_id)?;
            submitted.push(instruction.instruction_id);
        }

        Ok(ExecuteResult { submitted, blocked })
    }

    /// The actual money-movement posting at submit time: debit the client's
    /// funding clearing account, credit the purpose-specific payable
    /// account. `reconciler::reverse_posting` mirrors this exactly when a
    /// payment later returns.
    fn settle_clearing_to_payable(
        &self,
        tenant_id: TenantId,
        instruction: &crate::orchestrator::PaymentInstruction,
        correlation_id: CorrelationId,
    ) -> PspResult<()> {
        let payable_type = payable_account_type_for_purpose(instruction.purpose.as_str())?;
        let clearing = self.ledger.create_account(
            tenant_id, instruction.legal_entity_id, AccountType::ClientFundingClearing, instruction.currency,
        )?;
        let payable = self.ledger.create_account(
            tenant_id, instruction.legal_entity_id, payable_type, instruction.currency,
        )?;

        let legs = vec![
            PostingLeg { account_id: clearing.account_id, direction: Direction::Debit, amount: instruction.amount },
            PostingLeg { account_id: payable.account_id, direction: Direction::Credit, amount: instruction.amount },
        ];

        self.ledger.post(
            tenant_id, legs, instruction.currency, "payment_instruction",
            &instruction.instruction_id.to_string(), correlation_id,
            &format!("settle-{}", instruction.instruction_id),
        )?;
        Ok(())
    }

    /// Pull every registered rail's settlement feed, match records to
    /// instructions, and post the ledger consequences.
    pub async fn ingest_settlement_feed(
        &self,
        tenant_id: TenantId,
        batch_ref: &str,
        correlation_id: CorrelationId,
    ) -> PspResult<ReconciliationSummary> {
        let liability = LiabilityClassifier::new(&self.db, &self.emitter);
        let reconciler = Reconciler::new(
            &self.db, &self.ledger, &self.orchestrator, &liability, &self.emitter, &self.providers,
        );
        reconciler.run_reconciliation(tenant_id, batch_ref, correlation_id).await
    }

    /// Apply an out-of-band callback from a rail (a webhook, typically)
    /// directly to an instruction, bypassing the settlement-feed matching
    /// path. Subject to the same out-of-order-callback rules as
    /// `PaymentOrchestrator::update_status`.
    pub fn handle_provider_callback(
        &self,
        tenant_id: TenantId,
        instruction_id: InstructionId,
        new_status: InstructionStatus,
        return_code: Option<&str>,
        correlation_id: CorrelationId,
    ) -> PspResult<crate::orchestrator::UpdateOutcome> {
        let outcome =
            self.orchestrator.update_status(instruction_id, new_status, tenant_id, correlation_id, return_code)?;

        if outcome == crate::orchestrator::UpdateOutcome::Applied && new_status == InstructionStatus::Returned {
            let liability = LiabilityClassifier::new(&self.db, &self.emitter);
            let return_code = return_code.unwrap_or("UNKNOWN");
            liability.record_liability_event(
                tenant_id,
                "payment_instruction",
                &instruction_id.to_string(),
                &self.config.default_rail,
                return_code,
                "provider callback",
                Decimal::ZERO,
                &format!("liability-callback-{instruction_id}-{return_code}"),
                correlation_id,
            )?;
        }

        Ok(outcome)
    }

    pub fn new_correlation_id(&self) -> CorrelationId {
        new_id()
    }

    pub fn get_instruction(&self, instruction_id: InstructionId) -> PspResult<crate::orchestrator::PaymentInstruction> {
        self.orchestrator.get_instruction(instruction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ach_stub::AchStubProvider;

    fn setup() -> (PspFacade, TenantId, LegalEntityId) {
        let db = Db::open_in_memory().unwrap();
        let mut config = PspConfig::default();
        config.commit_gate_strict = false;
        let mut facade = PspFacade::new(db.clone(), config);
        facade.register_provider(Arc::new(AchStubProvider::new()));
        let ledger = Ledger::new(db);
        let tenant_id = new_id();
        let legal_entity_id = new_id();
        let _ = ledger.create_account(tenant_id, legal_entity_id, AccountType::ClientFundingClearing, Currency::Usd);
        (facade, tenant_id, legal_entity_id)
    }

    #[tokio::test]
    async fn happy_path_batch_commits_and_executes() {
        let (facade, tenant_id, legal_entity_id) = setup();
        let funding_account = facade
            .ledger
            .create_account(tenant_id, legal_entity_id, AccountType::ClientFundingClearing, Currency::Usd)
            .unwrap();

        facade
            .ledger
            .post(
                tenant_id,
                vec![
                    PostingLeg { account_id: funding_account.account_id, direction: Direction::Credit, amount: Decimal::new(100000, 2) },
                    PostingLeg {
                        account_id: facade.ledger.create_account(tenant_id, legal_entity_id, AccountType::PspOperating, Currency::Usd).unwrap().account_id,
                        direction: Direction::Debit,
                        amount: Decimal::new(100000, 2),
                    },
                ],
                Currency::Usd,
                "prefund",
                "prefund-1",
                new_id(),
                "prefund-idem-1",
            )
            .unwrap();

        let correlation_id = facade.new_correlation_id();
        let commit = facade
            .commit_payroll_batch(
                tenant_id,
                legal_entity_id,
                funding_account.account_id,
                vec![BatchLineItem {
                    purpose: "employee_net_pay",
                    amount: Decimal::new(50000, 2),
                    payee_ref_id: "employee-1".to_string(),
                    source_id: "run-1".to_string(),
                    idempotency_key: "line-1".to_string(),
                }],
                correlation_id,
            )
            .unwrap();
        assert!(commit.gate_result.approved());
        assert_eq!(commit.instruction_ids.len(), 1);
    }
}
