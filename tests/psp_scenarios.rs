//! End-to-end scenarios (spec.md §8).

use std::sync::Arc;

use rust_decimal::Decimal;

use psp_core::config::PspConfig;
use psp_core::db::Db;
use psp_core::facade::{BatchLineItem, PspFacade};
use psp_core::ids::new_id;
use psp_core::ledger::{AccountType, Ledger, PostingLeg};
use psp_core::money::{Currency, Direction};
use psp_core::orchestrator::{InstructionStatus, UpdateOutcome};
use psp_core::providers::ach_stub::AchStubProvider;
use psp_core::providers::{RailStatus, SettlementRecord};

fn fund_account(ledger: &Ledger, tenant_id: psp_core::ids::TenantId, legal_entity_id: psp_core::ids::LegalEntityId, amount: Decimal) -> psp_core::ids::AccountId {
    let funding = ledger
        .create_account(tenant_id, legal_entity_id, AccountType::ClientFundingClearing, Currency::Usd)
        .unwrap();
    let operating = ledger
        .create_account(tenant_id, legal_entity_id, AccountType::PspOperating, Currency::Usd)
        .unwrap();
    ledger
        .post(
            tenant_id,
            vec![
                PostingLeg { account_id: funding.account_id, direction: Direction::Credit, amount },
                PostingLeg { account_id: operating.account_id, direction: Direction::Debit, amount },
            ],
            Currency::Usd,
            "prefund",
            "test-prefund",
            new_id(),
            "test-prefund-idem",
        )
        .unwrap();
    funding.account_id
}

#[tokio::test]
async fn happy_path_batch_commits_executes_and_settles() {
    let db = Db::open_in_memory().unwrap();
    let ledger = Ledger::new(db.clone());
    let tenant_id = new_id();
    let legal_entity_id = new_id();
    let funding_account_id = fund_account(&ledger, tenant_id, legal_entity_id, Decimal::new(1_000_000, 2));

    let mut config = PspConfig::default();
    config.commit_gate_strict = false;
    let mut facade = PspFacade::new(db, config);
    let ach = Arc::new(AchStubProvider::new());
    facade.register_provider(ach.clone());

    let correlation_id = new_id();
    let commit = facade
        .commit_payroll_batch(
            tenant_id,
            legal_entity_id,
            funding_account_id,
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

    let instructions: Vec<_> = commit
        .instruction_ids
        .iter()
        .map(|id| facade.get_instruction(*id).unwrap())
        .collect();

    let execute = facade
        .execute_payments(tenant_id, funding_account_id, instructions, "ach", correlation_id)
        .await
        .unwrap();
    assert_eq!(execute.submitted.len(), 1);
    assert!(execute.blocked.is_empty());

    let instruction_id = commit.instruction_ids[0];
    ach.enqueue_settlement(SettlementRecord {
        external_trace_id: "trace-happy-1".to_string(),
        bank_account_id: "bank-1".to_string(),
        direction: Direction::Debit,
        amount: Decimal::new(50000, 2),
        currency: Currency::Usd,
        effective_date: chrono::Utc::now().date_naive(),
        status: RailStatus::Settled,
        return_code: None,
        return_reason: None,
        instruction_hint: Some(instruction_id.to_string()),
    });

    let summary = facade.ingest_settlement_feed(tenant_id, "batch-1", correlation_id).await.unwrap();
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.unmatched, 0);

    let settled = facade.get_instruction(instruction_id).unwrap();
    assert_eq!(settled.status, InstructionStatus::Settled);
}

#[tokio::test]
async fn strict_commit_gate_blocks_underfunded_batch() {
    let db = Db::open_in_memory().unwrap();
    let ledger = Ledger::new(db.clone());
    let tenant_id = new_id();
    let legal_entity_id = new_id();
    let funding_account_id = fund_account(&ledger, tenant_id, legal_entity_id, Decimal::new(1000, 2));

    let mut config = PspConfig::default();
    config.commit_gate_strict = true;
    let facade = PspFacade::new(db, config);

    let commit = facade
        .commit_payroll_batch(
            tenant_id,
            legal_entity_id,
            funding_account_id,
            vec![BatchLineItem {
                purpose: "tax",
                amount: Decimal::new(500000, 2),
                payee_ref_id: "irs".to_string(),
                source_id: "run-2".to_string(),
                idempotency_key: "line-2".to_string(),
            }],
            new_id(),
        )
        .unwrap();

    assert!(!commit.gate_result.approved());
    assert!(commit.instruction_ids.is_empty());
}

#[tokio::test]
async fn ach_return_reverses_ledger_and_records_liability() {
    let db = Db::open_in_memory().unwrap();
    let ledger = Ledger::new(db.clone());
    let tenant_id = new_id();
    let legal_entity_id = new_id();
    let funding_account_id = fund_account(&ledger, tenant_id, legal_entity_id, Decimal::new(1_000_000, 2));

    let config = PspConfig::default();
    let mut facade = PspFacade::new(db, config);
    let ach = Arc::new(AchStubProvider::new());
    facade.register_provider(ach.clone());

    let correlation_id = new_id();
    let commit = facade
        .commit_payroll_batch(
            tenant_id,
            legal_entity_id,
            funding_account_id,
            vec![BatchLineItem {
                purpose: "employee_net_pay",
                amount: Decimal::new(30000, 2),
                payee_ref_id: "employee-2".to_string(),
                source_id: "run-3".to_string(),
                idempotency_key: "line-3".to_string(),
            }],
            correlation_id,
        )
        .unwrap();

    let instructions: Vec<_> = commit
        .instruction_ids
        .iter()
        .map(|id| facade.get_instruction(*id).unwrap())
        .collect();
    facade
        .execute_payments(tenant_id, funding_account_id, instructions, "ach", correlation_id)
        .await
        .unwrap();

    let instruction_id = commit.instruction_ids[0];
    ach.enqueue_settlement(SettlementRecord {
        external_trace_id: "trace-return-1".to_string(),
        bank_account_id: "bank-1".to_string(),
        direction: Direction::Debit,
        amount: Decimal::new(30000, 2),
        currency: Currency::Usd,
        effective_date: chrono::Utc::now().date_naive(),
        status: RailStatus::Returned,
        return_code: Some("R01".to_string()),
        return_reason: Some("insufficient funds".to_string()),
        instruction_hint: Some(instruction_id.to_string()),
    });

    let summary = facade.ingest_settlement_feed(tenant_id, "batch-return", correlation_id).await.unwrap();
    assert_eq!(summary.matched, 1);

    let returned = facade.get_instruction(instruction_id).unwrap();
    assert_eq!(returned.status, InstructionStatus::Returned);
}

#[tokio::test]
async fn out_of_order_callback_after_settlement_is_rejected() {
    let db = Db::open_in_memory().unwrap();
    let ledger = Ledger::new(db.clone());
    let tenant_id = new_id();
    let legal_entity_id = new_id();
    let funding_account_id = fund_account(&ledger, tenant_id, legal_entity_id, Decimal::new(1_000_000, 2));

    let config = PspConfig::default();
    let mut facade = PspFacade::new(db, config);
    let ach = Arc::new(AchStubProvider::new());
    facade.register_provider(ach.clone());

    let correlation_id = new_id();
    let commit = facade
        .commit_payroll_batch(
            tenant_id,
            legal_entity_id,
            funding_account_id,
            vec![BatchLineItem {
                purpose: "third_party",
                amount: Decimal::new(8000, 2),
                payee_ref_id: "vendor-1".to_string(),
                source_id: "run-4".to_string(),
                idempotency_key: "line-4".to_string(),
            }],
            correlation_id,
        )
        .unwrap();
    let instruction_id = commit.instruction_ids[0];

    let instructions: Vec<_> = commit
        .instruction_ids
        .iter()
        .map(|id| facade.get_instruction(*id).unwrap())
        .collect();
    facade
        .execute_payments(tenant_id, funding_account_id, instructions, "ach", correlation_id)
        .await
        .unwrap();

    ach.enqueue_settlement(SettlementRecord {
        external_trace_id: "trace-ooo-1".to_string(),
        bank_account_id: "bank-1".to_string(),
        direction: Direction::Debit,
        amount: Decimal::new(8000, 2),
        currency: Currency::Usd,
        effective_date: chrono::Utc::now().date_naive(),
        status: RailStatus::Settled,
        return_code: None,
        return_reason: None,
        instruction_hint: Some(instruction_id.to_string()),
    });
    facade.ingest_settlement_feed(tenant_id, "batch-ooo", correlation_id).await.unwrap();

    // A late "accepted" callback arriving after settlement is a stale
    // duplicate, not an error.
    let stale = facade
        .handle_provider_callback(tenant_id, instruction_id, InstructionStatus::Accepted, None, correlation_id)
        .unwrap();
    assert_eq!(stale, UpdateOutcome::IgnoredStaleDuplicate);

    // A "returned" callback arriving after settlement is illegal and
    // rejected outright.
    let illegal = facade
        .handle_provider_callback(tenant_id, instruction_id, InstructionStatus::Returned, Some("R01"), correlation_id)
        .unwrap();
    assert_eq!(illegal, UpdateOutcome::Rejected);
}
