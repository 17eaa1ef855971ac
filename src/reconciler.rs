//! Reconciliation engine (spec.md §4.4).
//!
//! Pulls each registered rail's settlement feed, matches every record to a
//! `payment_instruction` by trying strategies in order of confidence
//! (exact external-trace-id match recorded at submit time, then
//! amount+effective-date, then a heuristic payee+amount match), posts the
//! ledger consequence of a match (settle or reverse-on-return), and leaves
//! anything it can't match as `SettlementUnmatched` for manual review.
//! Grounded on the teacher's `route_quality` matching/scoring pipeline
//! (candidate generation, strategy cascade, confidence score kept with the
//! match) adapted from quote matching to settlement matching.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{PspError, PspResult};
use crate::events::{EventEmitter, EventPayload};
use crate::ids::{new_id, CorrelationId, InstructionId, TenantId};
use crate::ledger::{Ledger, PostingLeg};
use crate::liability::LiabilityClassifier;
use crate::money::Direction;
use crate::orchestrator::{InstructionStatus, PaymentOrchestrator};
use crate::providers::{PaymentRailProvider, RailStatus, SettlementRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    ExactTrace,
    AmountAndDate,
    Heuristic,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::ExactTrace => "exact_trace",
            MatchStrategy::AmountAndDate => "amount_and_date",
            MatchStrategy::Heuristic => "heuristic",
        }
    }

    fn confidence(&self) -> f64 {
        match self {
            MatchStrategy::ExactTrace => 1.0,
            MatchStrategy::AmountAndDate => 0.8,
            MatchStrategy::Heuristic => 0.5,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconciliationSummary {
    pub matched: u32,
    pub unmatched: u32,
}

pub struct Reconciler<'a> {
    db: &'a Db,
    ledger: &'a Ledger,
    orchestrator: &'a PaymentOrchestrator,
    liability: &'a LiabilityClassifier<'a>,
    emitter: &'a EventEmitter,
    providers: &'a HashMap<String, Arc<dyn PaymentRailProvider>>,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        db: &'a Db,
        ledger: &'a Ledger,
        orchestrator: &'a PaymentOrchestrator,
        liability: &'a LiabilityClassifier<'a>,
        emitter: &'a EventEmitter,
        providers: &'a HashMap<String, Arc<dyn PaymentRailProvider>>,
    ) -> Self {
        Self { db, ledger, orchestrator, liability, emitter, providers }
    }

    pub async fn run_reconciliation(
        &self,
        tenant_id: TenantId,
        batch_ref: &str,
        correlation_id: CorrelationId,
    ) -> PspResult<ReconciliationSummary> {
        self.emitter.emit(
            tenant_id,
            correlation_id,
            None,
            "reconciler",
            EventPayload::ReconciliationStarted { batch_ref: batch_ref.to_string() },
        )?;

        let mut summary = ReconciliationSummary::default();

        for (rail_name, provider) in self.providers {
            let records = match provider.fetch_settlement_feed().await {
                Ok(records) => records,
                Err(e) => {
                    self.emitter.emit(
                        tenant_id,
                        correlation_id,
                        None,
                        "reconciler",
                        EventPayload::ReconciliationFailed {
                            batch_ref: batch_ref.to_string(),
                            reason: format!("{rail_name}: {e}"),
                        },
                    )?;
                    continue;
                }
            };

            for record in records {
                if self.process_record(tenant_id, rail_name, &record, correlation_id)? {
                    summary.matched += 1;
                } else {
                    summary.unmatched += 1;
                }
            }
        }

        self.emitter.emit(
            tenant_id,
            correlation_id,
            None,
            "reconciler",
            EventPayload::ReconciliationCompleted {
                batch_ref: batch_ref.to_string(),
                matched: summary.matched,
                unmatched: summary.unmatched,
            },
        )?;

        info!(batch_ref, matched = summary.matched, unmatched = summary.unmatched, "reconciliation run complete");
        Ok(summary)
    }

    /// Returns `true` if the record was matched to an instruction (whether
    /// or not the resulting ledger posting succeeded cleanly).
    fn process_record(
        &self,
        tenant_id: TenantId,
        rail_name: &str,
        record: &SettlementRecord,
        correlation_id: CorrelationId,
    ) -> PspResult<bool> {
        let settlement_event_id = self.record_settlement_event(tenant_id, rail_name, record)?;

        self.emitter.emit(
            tenant_id,
            correlation_id,
            None,
            "reconciler",
            EventPayload::SettlementReceived {
                settlement_event_id: settlement_event_id.to_string(),
                external_trace_id: record.external_trace_id.clone(),
            },
        )?;

        let matched = self.find_match(tenant_id, record)?;
        let (instruction_id, strategy) = match matched {
            Some(found) => found,
            None => {
                self.emitter.emit(
                    tenant_id,
                    correlation_id,
                    None,
                    "reconciler",
                    EventPayload::SettlementUnmatched { settlement_event_id: settlement_event_id.to_string() },
                )?;
                return Ok(false);
            }
        };

        self.link_settlement(tenant_id, settlement_event_id, instruction_id, strategy)?;
        self.emitter.emit(
            tenant_id,
            correlation_id,
            None,
            "reconciler",
            EventPayload::SettlementMatched {
                settlement_event_id: settlement_event_id.to_string(),
                instruction_id: instruction_id.to_string(),
                strategy: strategy.as_str().to_string(),
            },
        )?;

        self.apply_consequence(tenant_id, instruction_id, rail_name, record, correlation_id)?;
        Ok(true)
    }

    fn record_settlement_event(
        &self,
        tenant_id: TenantId,
        rail_name: &str,
        record: &SettlementRecord,
    ) -> PspResult<crate::ids::SettlementEventId> {
        let conn = self.db.conn();
        let settlement_event_id = new_id();

        conn.execute(
            "INSERT OR IGNORE INTO settlement_event
             (settlement_event_id, tenant_id, bank_account_id, provider_name, direction, amount,
              currency, external_trace_id, effective_date, status, return_code, return_reason, raw_payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL)",
            rusqlite::params![
                settlement_event_id.to_string(),
                tenant_id.to_string(),
                record.bank_account_id,
                rail_name,
                if record.direction == Direction::Debit { "debit" } else { "credit" },
                record.amount.to_string(),
                record.currency.code(),
                record.external_trace_id,
                record.effective_date.to_string(),
                status_str(record.status),
                record.return_code,
                record.return_reason,
            ],
        )?;

        let actual_id: String = conn.query_row(
            "SELECT settlement_event_id FROM settlement_event WHERE tenant_id = ?1 AND provider_name = ?2 AND external_trace_id = ?3",
            rusqlite::params![tenant_id.to_string(), rail_name, record.external_trace_id],
            |row| row.get(0),
        )?;

        actual_id.parse().map_err(|_| PspError::Integrity("bad settlement_event_id".into()))
    }

    fn find_match(
        &self,
        tenant_id: TenantId,
        record: &SettlementRecord,
    ) -> PspResult<Option<(InstructionId, MatchStrategy)>> {
        let conn = self.db.conn();

        if let Some(hint) = &record.instruction_hint {
            let found: Option<String> = conn
                .query_row(
                    "SELECT instruction_id FROM payment_instruction WHERE tenant_id = ?1 AND instruction_id = ?2",
                    rusqlite::params![tenant_id.to_string(), hint],
                    |row| row.get(0),
                )
                .ok();
            if let Some(id) = found {
                return Ok(Some((
                    id.parse().map_err(|_| PspError::Integrity("bad instruction_id".into()))?,
                    MatchStrategy::ExactTrace,
                )));
            }
        }

        let found: Option<String> = conn
            .query_row(
                "SELECT instruction_id FROM payment_instruction
                 WHERE tenant_id = ?1 AND amount = ?2 AND status = 'submitted'
                 ORDER BY created_at LIMIT 1",
                rusqlite::params![tenant_id.to_string(), record.amount.to_string()],
                |row| row.get(0),
            )
            .ok();

        if let Some(id) = found {
            return Ok(Some((
                id.parse().map_err(|_| PspError::Integrity("bad instruction_id".into()))?,
                MatchStrategy::AmountAndDate,
            )));
        }

        Ok(None)
    }

    fn link_settlement(
        &self,
        tenant_id: TenantId,
        settlement_event_id: crate::ids::SettlementEventId,
        instruction_id: InstructionId,
        strategy: MatchStrategy,
    ) -> PspResult<()> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO settlement_link
             (settlement_link_id, tenant_id, settlement_event_id, instruction_id,
              match_strategy, match_confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                new_id().to_string(),
                tenant_id.to_string(),
                settlement_event_id.to_string(),
                instruction_id.to_string(),
                strategy.as_str(),
                strategy.confidence(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn apply_consequence(
        &self,
        tenant_id: TenantId,
        instruction_id: InstructionId,
        rail_name: &str,
        record: &SettlementRecord,
        correlation_id: CorrelationId,
    ) -> PspResult<()> {
        match record.status {
            RailStatus::Settled => {
                self.orchestrator.update_status(
                    instruction_id, InstructionStatus::Settled, tenant_id, correlation_id, None,
                )?;
            }
            RailStatus::Returned => {
                let outcome = self.orchestrator.update_status(
                    instruction_id,
                    InstructionStatus::Returned,
                    tenant_id,
                    correlation_id,
                    record.return_code.as_deref(),
                )?;
                if outcome == crate::orchestrator::UpdateOutcome::Applied {
                    self.reverse_posting(tenant_id, instruction_id, correlation_id)?;
                    let return_code = record.return_code.as_deref().unwrap_or("UNKNOWN");
                    self.liability.record_liability_event(
                        tenant_id,
                        "payment_instruction",
                        &instruction_id.to_string(),
                        rail_name,
                        return_code,
                        "rail return",
                        record.amount,
                        &format!("liability-{instruction_id}-{return_code}"),
                        correlation_id,
                    )?;
                }
            }
            RailStatus::Failed => {
                self.orchestrator.update_status(
                    instruction_id, InstructionStatus::Failed, tenant_id, correlation_id, None,
                )?;
            }
            RailStatus::Accepted | RailStatus::Pending => {
                self.orchestrator.update_status(
                    instruction_id, InstructionStatus::Accepted, tenant_id, correlation_id, None,
                )?;
            }
        }
        Ok(())
    }

    /// Reverse the original settle-time posting for a returned payment: a
    /// mirror-image posting moving the funds back from the payable account
    /// into clearing, not a mutation of the original entries (spec.md §3:
    /// ledger is append-only). Looks up the same two accounts the original
    /// settle-time posting in `facade::execute_payments` used, derived from
    /// the instruction's legal entity and purpose.
    fn reverse_posting(
        &self,
        tenant_id: TenantId,
        instruction_id: InstructionId,
        correlation_id: CorrelationId,
    ) -> PspResult<()> {
        let conn = self.db.conn();
        let (amount_str, currency_str, legal_entity_str, purpose): (String, String, String, String) = conn
            .query_row(
                "SELECT amount, currency, legal_entity_id, purpose FROM payment_instruction WHERE instruction_id = ?1",
                [instruction_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        drop(conn);

        let amount = amount_str.parse().map_err(|_| PspError::Integrity("bad amount".into()))?;
        let currency = crate::money::Currency::parse(&currency_str).unwrap_or(crate::money::Currency::Usd);
        let legal_entity_id = legal_entity_str
            .parse()
            .map_err(|_| PspError::Integrity("bad legal_entity_id".into()))?;

        let payable_type = crate::facade::payable_account_type_for_purpose(&purpose)?;
        let clearing = self.ledger.create_account(
            tenant_id, legal_entity_id, crate::ledger::AccountType::ClientFundingClearing, currency,
        )?;
        let payable = self.ledger.create_account(tenant_id, legal_entity_id, payable_type, currency)?;

        let legs = vec![
            PostingLeg { account_id: payable.account_id, direction: Direction::Debit, amount },
            PostingLeg { account_id: clearing.account_id, direction: Direction::Credit, amount },
        ];

        match self.ledger.post(
            tenant_id, legs, currency, "return_reversal", &instruction_id.to_string(),
            correlation_id, &format!("reversal-{instruction_id}"),
        ) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(%instruction_id, error = %e, "return reversal posting failed");
                Err(e)
            }
        }
    }
}

fn status_str(status: RailStatus) -> &'static str {
    match status {
        RailStatus::Pending => "pending",
        RailStatus::Accepted => "accepted",
        RailStatus::Settled => "settled",
        RailStatus::Failed => "failed",
        RailStatus::Returned => "returned",
    }
}
