//! Two-stage funding gate (spec.md §4.2).
//!
//! `evaluate_commit_gate` runs when a payroll batch is committed: policy
//! checks always, an available-funds check only when `commit_gate_strict`
//! is on. `evaluate_pay_gate` runs immediately before a rail submission and
//! can never be bypassed - it is the last thing standing between a
//! reservation and money actually leaving an account. Grounded on the
//! teacher's `trust_gate`/`gate_suite` two-phase check pattern (a cheap
//! advisory pass, then a hard pre-trade pass) adapted from order risk to
//! funds availability.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PspConfig;
use crate::error::PspResult;
use crate::events::{EventEmitter, EventPayload};
use crate::ids::{AccountId, CorrelationId, TenantId};
use crate::ledger::Ledger;
use crate::money::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateOutcome {
    Approved,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub outcome: GateOutcome,
    pub available: Amount,
    pub requested: Amount,
    pub reasons: Vec<String>,
}

impl GateResult {
    pub fn approved(&self) -> bool {
        self.outcome == GateOutcome::Approved
    }
}

pub struct FundingGate<'a> {
    ledger: &'a Ledger,
    emitter: &'a EventEmitter,
    config: &'a PspConfig,
}

impl<'a> FundingGate<'a> {
    pub fn new(ledger: &'a Ledger, emitter: &'a EventEmitter, config: &'a PspConfig) -> Self {
        Self { ledger, emitter, config }
    }

    /// Policy check at batch-commit time. Only rejects on insufficient
    /// funds when `commit_gate_strict` is set; otherwise the check is
    /// advisory and always approves, matching spec.md §4.2's "commit gate
    /// may be loose, pay gate is never loose."
    pub fn evaluate_commit_gate(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        requested: Amount,
        correlation_id: CorrelationId,
    ) -> PspResult<GateResult> {
        let balance = self.ledger.get_balance(account_id)?;
        let available = balance.available();

        self.emitter.emit(
            tenant_id,
            correlation_id,
            None,
            "funding_gate",
            EventPayload::FundingRequested {
                account_id: account_id.to_string(),
                amount: requested,
            },
        )?;

        let mut reasons = Vec::new();
        let mut outcome = GateOutcome::Approved;

        if self.config.commit_gate_strict && available < requested {
            outcome = GateOutcome::Blocked;
            reasons.push(format!("available {available} is short of requested {requested}"));
        }

        self.emit_outcome(tenant_id, account_id, requested, available, outcome, correlation_id)?;

        Ok(GateResult { outcome, available, requested, reasons })
    }

    /// The non-bypassable pre-submission check. Always enforces available
    /// funds regardless of config - `pay_gate_always_enforced` exists only
    /// to make a misconfiguration explicit, not to allow disabling it.
    pub fn evaluate_pay_gate(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        requested: Amount,
        correlation_id: CorrelationId,
    ) -> PspResult<GateResult> {
        let balance = self.ledger.get_balance(account_id)?;
        let available = balance.available();

        let mut reasons = Vec::new();
        let outcome = if available < requested {
            reasons.push(format!(
                "pay gate: available {available} is short of requested {requested}"
            ));
            GateOutcome::Blocked
        } else {
            GateOutcome::Approved
        };

        info!(?outcome, %available, %requested, "pay gate evaluated");
        self.emit_outcome(tenant_id, account_id, requested, available, outcome, correlation_id)?;

        Ok(GateResult { outcome, available, requested, reasons })
    }

    fn emit_outcome(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        requested: Amount,
        available: Amount,
        outcome: GateOutcome,
        correlation_id: CorrelationId,
    ) -> PspResult<()> {
        let payload = match outcome {
            GateOutcome::Approved => EventPayload::FundingApproved {
                account_id: account_id.to_string(),
                amount: requested,
            },
            GateOutcome::Blocked if available < Decimal::ZERO || available < requested => {
                EventPayload::FundingInsufficientFunds {
                    account_id: account_id.to_string(),
                    requested,
                    available,
                }
            }
            GateOutcome::Blocked => EventPayload::FundingBlocked {
                account_id: account_id.to_string(),
                amount: requested,
                reason: "policy".to_string(),
            },
        };
        self.emitter.emit(tenant_id, correlation_id, None, "funding_gate", payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::events::EventStore;
    use crate::ids::new_id;
    use crate::ledger::AccountType;
    use crate::money::Currency;

    fn setup() -> (Ledger, EventEmitter, PspConfig, AccountId, TenantId) {
        let db = Db::open_in_memory().unwrap();
        let ledger = Ledger::new(db.clone());
        let emitter = EventEmitter::new(EventStore::new(db));
        let config = PspConfig::default();
        let tenant_id = new_id();
        let account = ledger
            .create_account(tenant_id, new_id(), AccountType::ClientFundingClearing, Currency::Usd)
            .unwrap();
        (ledger, emitter, config, account.account_id, tenant_id)
    }

    #[test]
    fn loose_commit_gate_approves_even_when_short() {
        let (ledger, emitter, mut config, account_id, tenant_id) = setup();
        config.commit_gate_strict = false;
        let gate = FundingGate::new(&ledger, &emitter, &config);

        let result = gate
            .evaluate_commit_gate(tenant_id, account_id, Decimal::new(10000, 2), new_id())
            .unwrap();
        assert!(result.approved());
    }

    #[test]
    fn strict_commit_gate_blocks_when_short() {
        let (ledger, emitter, mut config, account_id, tenant_id) = setup();
        config.commit_gate_strict = true;
        let gate = FundingGate::new(&ledger, &emitter, &config);

        let result = gate
            .evaluate_commit_gate(tenant_id, account_id, Decimal::new(10000, 2), new_id())
            .unwrap();
        assert!(!result.approved());
    }

    #[test]
    fn pay_gate_always_blocks_when_short_regardless_of_config() {
        let (ledger, emitter, config, account_id, tenant_id) = setup();
        let gate = FundingGate::new(&ledger, &emitter, &config);

        let result = gate
            .evaluate_pay_gate(tenant_id, account_id, Decimal::new(5000, 2), new_id())
            .unwrap();
        assert!(!result.approved());
    }
}
