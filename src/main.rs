//! PSP Core CLI.
//!
//! A thin demonstration binary, not a server - spec.md puts the HTTP
//! surface out of scope. `clap` derive CLI and `tracing_subscriber`
//! `EnvFilter` init follow the teacher's `main.rs` exactly; everything
//! trading/market-data/GUI related from the teacher has been dropped since
//! nothing in SPEC_FULL.md calls for it.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use psp_core::config::PspConfig;
use psp_core::db::Db;
use psp_core::facade::{BatchLineItem, PspFacade};
use psp_core::ledger::{AccountType, Ledger, PostingLeg};
use psp_core::money::{Currency, Direction};
use psp_core::providers::ach_stub::AchStubProvider;
use psp_core::providers::fednow_stub::FedNowStubProvider;

#[derive(Parser)]
#[command(name = "psp-core", about = "Payment service provider backbone demo")]
struct Cli {
    #[arg(long, env = "PSP_DB_PATH", default_value = "psp.sqlite3")]
    db_path: String,

    #[arg(long, env = "PSP_CONFIG_PATH")]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the spec's end-to-end happy-path scenario against a fresh
    /// in-memory ledger: fund a client, commit a small payroll batch,
    /// execute it, then run reconciliation.
    Demo,
    /// Print the resolved configuration and exit.
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PspConfig::load(cli.config_path.as_deref().map(std::path::Path::new))?;

    match cli.command {
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Demo => run_demo(&cli.db_path, config).await,
    }
}

async fn run_demo(db_path: &str, config: PspConfig) -> anyhow::Result<()> {
    info!(db_path, "starting psp-core demo");

    let db = Db::open_in_memory()?;
    let ledger = Ledger::new(db.clone());
    let tenant_id = psp_core::ids::new_id();
    let legal_entity_id = psp_core::ids::new_id();

    let funding_account =
        ledger.create_account(tenant_id, legal_entity_id, AccountType::ClientFundingClearing, Currency::Usd)?;
    let operating =
        ledger.create_account(tenant_id, legal_entity_id, AccountType::PspOperating, Currency::Usd)?;

    ledger.post(
        tenant_id,
        vec![
            PostingLeg { account_id: funding_account.account_id, direction: Direction::Credit, amount: Decimal::new(1_000_000, 2) },
            PostingLeg { account_id: operating.account_id, direction: Direction::Debit, amount: Decimal::new(1_000_000, 2) },
        ],
        Currency::Usd,
        "prefund",
        "demo-prefund",
        psp_core::ids::new_id(),
        "demo-prefund-idem",
    )?;

    let mut facade = PspFacade::new(db, config);
    facade.register_provider(Arc::new(AchStubProvider::new()));
    facade.register_provider(Arc::new(FedNowStubProvider::new()));

    let correlation_id = facade.new_correlation_id();
    let commit = facade.commit_payroll_batch(
        tenant_id,
        legal_entity_id,
        funding_account.account_id,
        vec![BatchLineItem {
            purpose: "employee_net_pay",
            amount: Decimal::new(250_00, 2),
            payee_ref_id: "employee-demo-1".to_string(),
            source_id: "demo-run-1".to_string(),
            idempotency_key: "demo-line-1".to_string(),
        }],
        correlation_id,
    )?;

    info!(instructions = commit.instruction_ids.len(), "batch committed");

    let instructions = commit
        .instruction_ids
        .iter()
        .map(|id| facade.get_instruction(*id))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let execute = facade
        .execute_payments(tenant_id, funding_account.account_id, instructions, "ach", correlation_id)
        .await?;
    info!(submitted = execute.submitted.len(), blocked = execute.blocked.len(), "payments executed");

    let summary = facade.ingest_settlement_feed(tenant_id, "demo-batch", correlation_id).await?;
    info!(matched = summary.matched, unmatched = summary.unmatched, "reconciliation complete");

    Ok(())
}
