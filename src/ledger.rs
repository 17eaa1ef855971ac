//! Double-entry ledger (spec.md §3, §4.1).
//!
//! Every posting is a balanced set of entries (Σdebits = Σcredits),
//! appended never mutated, keyed by an idempotency key so a retried caller
//! gets back the same entries rather than double-posting. Reservations earn
//! balance out of `available` without touching `posted`, the same separation
//! the teacher's `backtest_v2::ledger::LedgerAccount` draws between realized
//! and mark-to-market state - here it's posted vs. reserved vs. available.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{PspError, PspResult};
use crate::ids::{new_id, AccountId, CorrelationId, LegalEntityId, ReservationId, TenantId};
use crate::money::{Amount, Currency, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    ClientFundingClearing,
    ClientNetPayPayable,
    ClientTaxPayable,
    ClientThirdPartyPayable,
    PspOperating,
    PspReserve,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::ClientFundingClearing => "client_funding_clearing",
            AccountType::ClientNetPayPayable => "client_net_pay_payable",
            AccountType::ClientTaxPayable => "client_tax_payable",
            AccountType::ClientThirdPartyPayable => "client_third_party_payable",
            AccountType::PspOperating => "psp_operating",
            AccountType::PspReserve => "psp_reserve",
        }
    }

    pub fn parse(s: &str) -> PspResult<Self> {
        match s {
            "client_funding_clearing" => Ok(AccountType::ClientFundingClearing),
            "client_net_pay_payable" => Ok(AccountType::ClientNetPayPayable),
            "client_tax_payable" => Ok(AccountType::ClientTaxPayable),
            "client_third_party_payable" => Ok(AccountType::ClientThirdPartyPayable),
            "psp_operating" => Ok(AccountType::PspOperating),
            "psp_reserve" => Ok(AccountType::PspReserve),
            other => Err(PspError::Validation(format!("unknown account_type: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerAccount {
    pub account_id: AccountId,
    pub tenant_id: TenantId,
    pub legal_entity_id: LegalEntityId,
    pub account_type: AccountType,
    pub currency: Currency,
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub entry_id: uuid::Uuid,
    pub account_id: AccountId,
    pub direction: Direction,
    pub amount: Amount,
    pub posted_at: DateTime<Utc>,
    pub source_type: String,
    pub source_id: String,
}

/// One leg of a posting: which account, which direction, how much.
#[derive(Debug, Clone)]
pub struct PostingLeg {
    pub account_id: AccountId,
    pub direction: Direction,
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Held,
    Released,
    Captured,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Held => "held",
            ReservationStatus::Released => "released",
            ReservationStatus::Captured => "captured",
            ReservationStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub account_id: AccountId,
    pub amount: Amount,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub ttl_hours: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Sum of posted credits minus posted debits.
    pub posted: Amount,
    /// Sum of amounts held by active (non-expired, non-released) reservations.
    pub reserved: Amount,
}

impl Balance {
    pub fn available(&self) -> Amount {
        self.posted - self.reserved
    }
}

#[derive(Clone)]
pub struct Ledger {
    db: Db,
}

impl Ledger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn create_account(
        &self,
        tenant_id: TenantId,
        legal_entity_id: LegalEntityId,
        account_type: AccountType,
        currency: Currency,
    ) -> PspResult<LedgerAccount> {
        let conn = self.db.conn();
        let account_id = new_id();
        let now = Utc::now().to_rfc3339();

        let existing: Option<String> = conn
            .query_row(
                "SELECT account_id FROM ledger_account
                 WHERE tenant_id = ?1 AND legal_entity_id = ?2 AND account_type = ?3 AND currency = ?4",
                rusqlite::params![
                    tenant_id.to_string(),
                    legal_entity_id.to_string(),
                    account_type.as_str(),
                    currency.code(),
                ],
                |row| row.get(0),
            )
            .ok();

        if let Some(existing_id) = existing {
            return Ok(LedgerAccount {
                account_id: existing_id.parse().map_err(|_| {
                    PspError::Integrity("stored account_id is not a valid uuid".into())
                })?,
                tenant_id,
                legal_entity_id,
                account_type,
                currency,
            });
        }

        conn.execute(
            "INSERT INTO ledger_account
             (account_id, tenant_id, legal_entity_id, account_type, currency, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6)",
            rusqlite::params![
                account_id.to_string(),
                tenant_id.to_string(),
                legal_entity_id.to_string(),
                account_type.as_str(),
                currency.code(),
                now,
            ],
        )?;

        Ok(LedgerAccount {
            account_id,
            tenant_id,
            legal_entity_id,
            account_type,
            currency,
        })
    }

    /// Post a balanced set of entries atomically. Legs must sum to zero
    /// (debits == credits) or this returns `PspError::Integrity` without
    /// writing anything. Replaying the same `idempotency_key` for the same
    /// tenant returns the originally-posted entries unchanged.
    pub fn post(
        &self,
        tenant_id: TenantId,
        legs: Vec<PostingLeg>,
        currency: Currency,
        source_type: &str,
        source_id: &str,
        correlation_id: CorrelationId,
        idempotency_key: &str,
    ) -> PspResult<Vec<LedgerEntry>> {
        if legs.is_empty() {
            return Err(PspError::Validation("posting must have at least one leg".into()));
        }

        let debits: Amount = legs
            .iter()
            .filter(|l| l.direction == Direction::Debit)
            .map(|l| l.amount)
            .sum();
        let credits: Amount = legs
            .iter()
            .filter(|l| l.direction == Direction::Credit)
            .map(|l| l.amount)
            .sum();
        if debits != credits {
            return Err(PspError::Integrity(format!(
                "unbalanced posting: debits={debits} credits={credits}"
            )));
        }

        let mut conn = self.db.conn();

        let existing: Option<String> = conn
            .query_row(
                "SELECT entry_ids_json FROM ledger_posting_idempotency
                 WHERE tenant_id = ?1 AND idempotency_key = ?2",
                rusqlite::params![tenant_id.to_string(), idempotency_key],
                |row| row.get(0),
            )
            .ok();

        if let Some(entry_ids_json) = existing {
            warn!(idempotency_key, "replayed posting, returning prior entries");
            let entry_ids: Vec<String> = serde_json::from_str(&entry_ids_json)
                .map_err(|e| PspError::Integrity(format!("corrupt idempotency record: {e}")))?;
            return self.load_entries(&conn, &entry_ids);
        }

        let tx = conn.transaction().map_err(PspError::from)?;
        let now = Utc::now();
        let mut entries = Vec::with_capacity(legs.len());

        for leg in &legs {
            let entry_id = new_id();
            tx.execute(
                "INSERT INTO ledger_entry
                 (entry_id, tenant_id, account_id, direction, amount, currency, posted_at,
                  source_type, source_id, correlation_id, idempotency_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    entry_id.to_string(),
                    tenant_id.to_string(),
                    leg.account_id.to_string(),
                    leg.direction.as_str(),
                    leg.amount.to_string(),
                    currency.code(),
                    now.to_rfc3339(),
                    source_type,
                    source_id,
                    correlation_id.to_string(),
                    idempotency_key,
                ],
            )
            .map_err(PspError::from)?;

            entries.push(LedgerEntry {
                entry_id,
                account_id: leg.account_id,
                direction: leg.direction,
                amount: leg.amount,
                posted_at: now,
                source_type: source_type.to_string(),
                source_id: source_id.to_string(),
            });
        }

        let entry_ids: Vec<String> = entries.iter().map(|e| e.entry_id.to_string()).collect();
        let entry_ids_json = serde_json::to_string(&entry_ids)
            .map_err(|e| PspError::Integrity(format!("could not serialize entry ids: {e}")))?;

        tx.execute(
            "INSERT INTO ledger_posting_idempotency
             (tenant_id, idempotency_key, correlation_id, entry_ids_json)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                tenant_id.to_string(),
                idempotency_key,
                correlation_id.to_string(),
                entry_ids_json,
            ],
        )
        .map_err(PspError::from)?;

        tx.commit().map_err(PspError::from)?;
        info!(source_type, source_id, legs = entries.len(), "ledger posting applied");
        Ok(entries)
    }

    fn load_entries(&self, conn: &rusqlite::Connection, entry_ids: &[String]) -> PspResult<Vec<LedgerEntry>> {
        let mut entries = Vec::with_capacity(entry_ids.len());
        for id in entry_ids {
            let entry = conn
                .query_row(
                    "SELECT entry_id, account_id, direction, amount, posted_at, source_type, source_id
                     FROM ledger_entry WHERE entry_id = ?1",
                    [id],
                    |row| {
                        let direction_str: String = row.get(2)?;
                        let amount_str: String = row.get(3)?;
                        let posted_at_str: String = row.get(4)?;
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            direction_str,
                            amount_str,
                            posted_at_str,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    },
                )
                .map_err(PspError::from)?;

            let (entry_id, account_id, direction_str, amount_str, posted_at_str, source_type, source_id) = entry;
            entries.push(LedgerEntry {
                entry_id: entry_id.parse().map_err(|_| PspError::Integrity("bad entry_id".into()))?,
                account_id: account_id.parse().map_err(|_| PspError::Integrity("bad account_id".into()))?,
                direction: if direction_str == "debit" { Direction::Debit } else { Direction::Credit },
                amount: amount_str
                    .parse::<Decimal>()
                    .map_err(|_| PspError::Integrity("bad amount".into()))?,
                posted_at: DateTime::parse_from_rfc3339(&posted_at_str)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                source_type,
                source_id,
            });
        }
        Ok(entries)
    }

    /// Sums entries and active reservations in `Decimal`, never SQL-side
    /// float aggregation, keeping spec.md's "no floating point anywhere in
    /// the core" invariant intact even for aggregate balances.
    pub fn get_balance(&self, account_id: AccountId) -> PspResult<Balance> {
        let conn = self.db.conn();

        let mut stmt = conn
            .prepare("SELECT direction, amount FROM ledger_entry WHERE account_id = ?1")
            .map_err(PspError::from)?;
        let rows = stmt
            .query_map([account_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(PspError::from)?;

        let mut posted = Decimal::ZERO;
        for row in rows {
            let (direction, amount_str) = row.map_err(PspError::from)?;
            let amount: Decimal = amount_str
                .parse()
                .map_err(|_| PspError::Integrity("bad amount in ledger_entry".into()))?;
            posted += if direction == "credit" { amount } else { -amount };
        }

        let mut stmt = conn
            .prepare("SELECT amount FROM reservation WHERE account_id = ?1 AND status = 'held'")
            .map_err(PspError::from)?;
        let rows = stmt
            .query_map([account_id.to_string()], |row| row.get::<_, String>(0))
            .map_err(PspError::from)?;

        let mut reserved = Decimal::ZERO;
        for row in rows {
            let amount_str = row.map_err(PspError::from)?;
            reserved += amount_str
                .parse::<Decimal>()
                .map_err(|_| PspError::Integrity("bad amount in reservation".into()))?;
        }

        Ok(Balance { posted, reserved })
    }

    pub fn create_reservation(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        amount: Amount,
        source_type: &str,
        source_id: &str,
        correlation_id: CorrelationId,
        ttl_hours: i64,
    ) -> PspResult<Reservation> {
        let conn = self.db.conn();
        let reservation_id = new_id();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO reservation
             (reservation_id, tenant_id, legal_entity_id, account_id, reserve_type, amount,
              status, source_type, source_id, correlation_id, created_at, ttl_hours)
             VALUES (?1, ?2, '', ?3, 'funding_hold', ?4, 'held', ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                reservation_id.to_string(),
                tenant_id.to_string(),
                account_id.to_string(),
                amount.to_string(),
                source_type,
                source_id,
                correlation_id.to_string(),
                now.to_rfc3339(),
                ttl_hours,
            ],
        )?;

        Ok(Reservation {
            reservation_id,
            account_id,
            amount,
            status: ReservationStatus::Held,
            created_at: now,
            ttl_hours,
        })
    }

    pub fn release_reservation(&self, reservation_id: ReservationId) -> PspResult<()> {
        self.transition_reservation(reservation_id, ReservationStatus::Released)
    }

    pub fn capture_reservation(&self, reservation_id: ReservationId) -> PspResult<()> {
        self.transition_reservation(reservation_id, ReservationStatus::Captured)
    }

    fn transition_reservation(&self, reservation_id: ReservationId, to: ReservationStatus) -> PspResult<()> {
        let conn = self.db.conn();
        let current: String = conn
            .query_row(
                "SELECT status FROM reservation WHERE reservation_id = ?1",
                [reservation_id.to_string()],
                |row| row.get(0),
            )
            .map_err(PspError::from)?;

        if current != "held" {
            return Err(PspError::Conflict(format!(
                "reservation {reservation_id} is {current}, cannot transition to {}",
                to.as_str()
            )));
        }

        conn.execute(
            "UPDATE reservation SET status = ?1 WHERE reservation_id = ?2",
            rusqlite::params![to.as_str(), reservation_id.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Ledger, TenantId, LegalEntityId, AccountId) {
        let db = Db::open_in_memory().unwrap();
        let ledger = Ledger::new(db);
        let tenant_id = new_id();
        let legal_entity_id = new_id();
        let account = ledger
            .create_account(tenant_id, legal_entity_id, AccountType::ClientFundingClearing, Currency::Usd)
            .unwrap();
        (ledger, tenant_id, legal_entity_id, account.account_id)
    }

    #[test]
    fn unbalanced_posting_is_rejected() {
        let (ledger, tenant_id, _, account_id) = setup();
        let legs = vec![PostingLeg {
            account_id,
            direction: Direction::Debit,
            amount: Decimal::new(100, 0),
        }];
        let result = ledger.post(tenant_id, legs, Currency::Usd, "test", "s1", new_id(), "idem-1");
        assert!(matches!(result, Err(PspError::Integrity(_))));
    }

    #[test]
    fn balanced_posting_updates_balance() {
        let (ledger, tenant_id, legal_entity_id, account_id) = setup();
        let operating = ledger
            .create_account(tenant_id, legal_entity_id, AccountType::PspOperating, Currency::Usd)
            .unwrap();

        let legs = vec![
            PostingLeg { account_id, direction: Direction::Credit, amount: Decimal::new(10000, 2) },
            PostingLeg { account_id: operating.account_id, direction: Direction::Debit, amount: Decimal::new(10000, 2) },
        ];
        ledger
            .post(tenant_id, legs, Currency::Usd, "test", "s1", new_id(), "idem-1")
            .unwrap();

        let balance = ledger.get_balance(account_id).unwrap();
        assert_eq!(balance.posted, Decimal::new(10000, 2));
    }

    #[test]
    fn replaying_idempotency_key_does_not_double_post() {
        let (ledger, tenant_id, legal_entity_id, account_id) = setup();
        let operating = ledger
            .create_account(tenant_id, legal_entity_id, AccountType::PspOperating, Currency::Usd)
            .unwrap();
        let legs = || vec![
            PostingLeg { account_id, direction: Direction::Credit, amount: Decimal::new(5000, 2) },
            PostingLeg { account_id: operating.account_id, direction: Direction::Debit, amount: Decimal::new(5000, 2) },
        ];

        ledger.post(tenant_id, legs(), Currency::Usd, "test", "s1", new_id(), "idem-1").unwrap();
        ledger.post(tenant_id, legs(), Currency::Usd, "test", "s1", new_id(), "idem-1").unwrap();

        let balance = ledger.get_balance(account_id).unwrap();
        assert_eq!(balance.posted, Decimal::new(5000, 2));
    }

    #[test]
    fn reservation_reduces_available_not_posted() {
        let (ledger, tenant_id, _, account_id) = setup();
        ledger
            .create_reservation(tenant_id, account_id, Decimal::new(2000, 2), "test", "s1", new_id(), 24)
            .unwrap();

        let balance = ledger.get_balance(account_id).unwrap();
        assert_eq!(balance.posted, Decimal::ZERO);
        assert_eq!(balance.reserved, Decimal::new(2000, 2));
        assert_eq!(balance.available(), Decimal::new(-2000, 2));
    }
}
