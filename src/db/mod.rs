//! Storage layer.
//!
//! A single `rusqlite::Connection` behind a `parking_lot::Mutex`, opened and
//! schema'd the same way `signals::db_storage::DbSignalStorage` does in the
//! teacher crate: `OpenFlags` with `SQLITE_OPEN_NO_MUTEX` (we do our own
//! locking), one `execute_batch` of DDL on open, WAL for concurrent readers.
//!
//! spec.md §6 lists the persisted tables; every query in `ledger`,
//! `funding_gate`, `orchestrator`, `reconciler`, `liability`, and `events`
//! goes through `Db::conn()` to take the lock for the duration of a single
//! SQL statement or transaction, then releases it - never across a provider
//! call (spec.md §5).

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS ledger_account (
    account_id          TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    legal_entity_id     TEXT NOT NULL,
    account_type        TEXT NOT NULL,
    currency            TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'active',
    created_at          TEXT NOT NULL,
    UNIQUE (tenant_id, legal_entity_id, account_type, currency)
);

CREATE TABLE IF NOT EXISTS ledger_entry (
    entry_id            TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    account_id          TEXT NOT NULL REFERENCES ledger_account(account_id),
    direction           TEXT NOT NULL,
    amount              TEXT NOT NULL,
    currency            TEXT NOT NULL,
    posted_at           TEXT NOT NULL,
    source_type         TEXT NOT NULL,
    source_id           TEXT NOT NULL,
    correlation_id      TEXT NOT NULL,
    idempotency_key     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_entry_account ON ledger_entry(account_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_entry_idem ON ledger_entry(tenant_id, idempotency_key, entry_id);

CREATE TABLE IF NOT EXISTS ledger_posting_idempotency (
    tenant_id           TEXT NOT NULL,
    idempotency_key     TEXT NOT NULL,
    correlation_id      TEXT NOT NULL,
    entry_ids_json      TEXT NOT NULL,
    PRIMARY KEY (tenant_id, idempotency_key)
);

CREATE TABLE IF NOT EXISTS reservation (
    reservation_id      TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    legal_entity_id     TEXT NOT NULL,
    account_id          TEXT NOT NULL,
    reserve_type        TEXT NOT NULL,
    amount              TEXT NOT NULL,
    status              TEXT NOT NULL,
    source_type         TEXT NOT NULL,
    source_id           TEXT NOT NULL,
    correlation_id      TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    ttl_hours           INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reservation_account ON reservation(account_id, status);

CREATE TABLE IF NOT EXISTS payment_instruction (
    instruction_id      TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    legal_entity_id     TEXT NOT NULL,
    purpose             TEXT NOT NULL,
    direction           TEXT NOT NULL,
    amount              TEXT NOT NULL,
    currency            TEXT NOT NULL,
    payee_type          TEXT NOT NULL,
    payee_ref_id        TEXT NOT NULL,
    source_type         TEXT NOT NULL,
    source_id           TEXT NOT NULL,
    status              TEXT NOT NULL,
    metadata_json       TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    idempotency_key     TEXT NOT NULL,
    UNIQUE (tenant_id, idempotency_key)
);

CREATE TABLE IF NOT EXISTS payment_attempt (
    attempt_id          TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    instruction_id      TEXT NOT NULL REFERENCES payment_instruction(instruction_id),
    provider_name       TEXT NOT NULL,
    provider_request_id TEXT,
    attempt_no          INTEGER NOT NULL,
    status              TEXT NOT NULL,
    submitted_at        TEXT NOT NULL,
    response_payload    TEXT
);
CREATE INDEX IF NOT EXISTS idx_payment_attempt_instruction ON payment_attempt(instruction_id, attempt_no);
CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_attempt_provider_req
    ON payment_attempt(tenant_id, provider_request_id)
    WHERE provider_request_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS settlement_event (
    settlement_event_id TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    bank_account_id     TEXT NOT NULL,
    provider_name       TEXT NOT NULL,
    direction           TEXT NOT NULL,
    amount              TEXT NOT NULL,
    currency            TEXT NOT NULL,
    external_trace_id   TEXT NOT NULL,
    effective_date      TEXT NOT NULL,
    status              TEXT NOT NULL,
    return_code         TEXT,
    return_reason       TEXT,
    raw_payload         TEXT,
    UNIQUE (tenant_id, provider_name, external_trace_id)
);

CREATE TABLE IF NOT EXISTS settlement_link (
    settlement_link_id  TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    settlement_event_id TEXT NOT NULL REFERENCES settlement_event(settlement_event_id),
    instruction_id      TEXT NOT NULL REFERENCES payment_instruction(instruction_id),
    match_strategy      TEXT NOT NULL,
    match_confidence    REAL NOT NULL,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_settlement_link_event ON settlement_link(settlement_event_id);

CREATE TABLE IF NOT EXISTS funding_gate_evaluation (
    tenant_id           TEXT NOT NULL,
    idempotency_key     TEXT NOT NULL,
    gate_kind           TEXT NOT NULL,
    result_json         TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    PRIMARY KEY (tenant_id, idempotency_key)
);

CREATE TABLE IF NOT EXISTS liability_event (
    liability_event_id  TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    source_type         TEXT NOT NULL,
    source_id           TEXT NOT NULL,
    error_origin        TEXT NOT NULL,
    liability_party     TEXT NOT NULL,
    recovery_path        TEXT NOT NULL,
    determination_reason TEXT NOT NULL,
    amount              TEXT NOT NULL,
    status              TEXT NOT NULL,
    idempotency_key     TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    UNIQUE (tenant_id, idempotency_key)
);

CREATE TABLE IF NOT EXISTS domain_event (
    event_id            TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL,
    event_type          TEXT NOT NULL,
    occurred_at         TEXT NOT NULL,
    correlation_id      TEXT NOT NULL,
    causation_id        TEXT,
    source_service      TEXT NOT NULL,
    payload_json        TEXT NOT NULL,
    sequence            INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_domain_event_tenant_seq ON domain_event(tenant_id, sequence);
CREATE INDEX IF NOT EXISTS idx_domain_event_correlation ON domain_event(tenant_id, correlation_id);

CREATE TABLE IF NOT EXISTS event_subscription (
    subscription_id     TEXT PRIMARY KEY,
    tenant_id           TEXT,
    event_type_pattern  TEXT NOT NULL,
    handler_name        TEXT NOT NULL,
    created_at          TEXT NOT NULL
);
"#;

/// Shared handle to the PSP database. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| anyhow::anyhow!("failed to open psp database at {path}: {e}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| anyhow::anyhow!("failed to initialize psp schema: {e}"))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("psp database initialized at: {}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}
