//! Liability classification (spec.md §4.5).
//!
//! A table-driven mapping from (rail, return_code) to who is on the hook
//! and how the loss gets resolved. Grounded on the teacher's
//! `route_quality`/`invariants` static lookup-table style (a match over a
//! small fixed set of codes, a documented default for anything unknown)
//! rather than a config file, since spec.md treats the return-code table as
//! a fixed domain fact, not tenant-configurable policy.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::Db;
use crate::error::{PspError, PspResult};
use crate::events::{EventEmitter, EventPayload};
use crate::ids::{new_id, CorrelationId, LiabilityEventId, TenantId};
use crate::money::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorOrigin {
    Payee,
    Psp,
    Bank,
    Unknown,
}

impl ErrorOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorOrigin::Payee => "payee",
            ErrorOrigin::Psp => "psp",
            ErrorOrigin::Bank => "bank",
            ErrorOrigin::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiabilityParty {
    Client,
    Psp,
    Bank,
    Unresolved,
}

impl LiabilityParty {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiabilityParty::Client => "client",
            LiabilityParty::Psp => "psp",
            LiabilityParty::Bank => "bank",
            LiabilityParty::Unresolved => "unresolved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryPath {
    /// Re-debit the client's funding account on next payroll cycle.
    ClientRedebit,
    /// Absorbed as a PSP operating loss, no recovery attempted.
    PspAbsorb,
    /// Escalate to the bank/rail's dispute process.
    BankDispute,
    /// No automatic path; requires manual review.
    ManualReview,
}

impl RecoveryPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPath::ClientRedebit => "client_redebit",
            RecoveryPath::PspAbsorb => "psp_absorb",
            RecoveryPath::BankDispute => "bank_dispute",
            RecoveryPath::ManualReview => "manual_review",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub error_origin: ErrorOrigin,
    pub liability_party: LiabilityParty,
    pub recovery_path: RecoveryPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiabilityEventStatus {
    Open,
    RecoveryInProgress,
    Recovered,
    WrittenOff,
}

impl LiabilityEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiabilityEventStatus::Open => "open",
            LiabilityEventStatus::RecoveryInProgress => "recovery_in_progress",
            LiabilityEventStatus::Recovered => "recovered",
            LiabilityEventStatus::WrittenOff => "written_off",
        }
    }
}

/// Classify an ACH/FedNow return code into who caused it and who is
/// financially on the hook. Unknown codes default to `ManualReview` with
/// `Unresolved` liability rather than silently picking a party - spec.md
/// §4.5 requires an explicit default, not a guess.
pub fn classify_return(rail: &str, return_code: &str) -> Classification {
    match (rail, return_code) {
        ("ach", "R01") => Classification {
            error_origin: ErrorOrigin::Payee,
            liability_party: LiabilityParty::Client,
            recovery_path: RecoveryPath::ClientRedebit,
        },
        ("ach", "R02") => Classification {
            error_origin: ErrorOrigin::Payee,
            liability_party: LiabilityParty::Client,
            recovery_path: RecoveryPath::ClientRedebit,
        },
        ("ach", "R03") => Classification {
            error_origin: ErrorOrigin::Payee,
            liability_party: LiabilityParty::Client,
            recovery_path: RecoveryPath::ClientRedebit,
        },
        ("ach", "R06") => Classification {
            error_origin: ErrorOrigin::Psp,
            liability_party: LiabilityParty::Psp,
            recovery_path: RecoveryPath::PspAbsorb,
        },
        ("ach", "R10") => Classification {
            error_origin: ErrorOrigin::Payee,
            liability_party: LiabilityParty::Bank,
            recovery_path: RecoveryPath::BankDispute,
        },
        ("fednow", _) => Classification {
            error_origin: ErrorOrigin::Bank,
            liability_party: LiabilityParty::Bank,
            recovery_path: RecoveryPath::BankDispute,
        },
        (rail, code) => {
            warn!(rail, code, "unrecognized return code, defaulting to manual review");
            Classification {
                error_origin: ErrorOrigin::Unknown,
                liability_party: LiabilityParty::Unresolved,
                recovery_path: RecoveryPath::ManualReview,
            }
        }
    }
}

pub struct LiabilityClassifier<'a> {
    db: &'a Db,
    emitter: &'a EventEmitter,
}

impl<'a> LiabilityClassifier<'a> {
    pub fn new(db: &'a Db, emitter: &'a EventEmitter) -> Self {
        Self { db, emitter }
    }

    pub fn record_liability_event(
        &self,
        tenant_id: TenantId,
        source_type: &str,
        source_id: &str,
        rail: &str,
        return_code: &str,
        determination_reason: &str,
        amount: Amount,
        idempotency_key: &str,
        correlation_id: CorrelationId,
    ) -> PspResult<LiabilityEventId> {
        let classification = classify_return(rail, return_code);
        let conn = self.db.conn();
        let liability_event_id = new_id();
        let now = chrono::Utc::now().to_rfc3339();

        let existing: Option<String> = conn
            .query_row(
                "SELECT liability_event_id FROM liability_event
                 WHERE tenant_id = ?1 AND idempotency_key = ?2",
                rusqlite::params![tenant_id.to_string(), idempotency_key],
                |row| row.get(0),
            )
            .ok();
        if let Some(existing_id) = existing {
            return existing_id
                .parse()
                .map_err(|_| PspError::Integrity("bad liability_event_id".into()));
        }

        conn.execute(
            "INSERT INTO liability_event
             (liability_event_id, tenant_id, source_type, source_id, error_origin,
              liability_party, recovery_path, determination_reason, amount, status,
              idempotency_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'open', ?10, ?11)",
            rusqlite::params![
                liability_event_id.to_string(),
                tenant_id.to_string(),
                source_type,
                source_id,
                classification.error_origin.as_str(),
                classification.liability_party.as_str(),
                classification.recovery_path.as_str(),
                determination_reason,
                amount.to_string(),
                idempotency_key,
                now,
            ],
        )?;

        self.emitter.emit(
            tenant_id,
            correlation_id,
            None,
            "liability_classifier",
            EventPayload::LiabilityClassified {
                liability_event_id: liability_event_id.to_string(),
                error_origin: classification.error_origin.as_str().to_string(),
                liability_party: classification.liability_party.as_str().to_string(),
            },
        )?;

        Ok(liability_event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ach_codes_assign_client_liability() {
        let c = classify_return("ach", "R01");
        assert_eq!(c.liability_party, LiabilityParty::Client);
        assert_eq!(c.recovery_path, RecoveryPath::ClientRedebit);
    }

    #[test]
    fn ach_r06_is_psp_error() {
        let c = classify_return("ach", "R06");
        assert_eq!(c.error_origin, ErrorOrigin::Psp);
        assert_eq!(c.liability_party, LiabilityParty::Psp);
    }

    #[test]
    fn unknown_code_defaults_to_manual_review() {
        let c = classify_return("ach", "R99");
        assert_eq!(c.liability_party, LiabilityParty::Unresolved);
        assert_eq!(c.recovery_path, RecoveryPath::ManualReview);
    }

    #[test]
    fn fednow_rejects_are_bank_liability() {
        let c = classify_return("fednow", "GENERIC_REJECT");
        assert_eq!(c.liability_party, LiabilityParty::Bank);
    }
}
