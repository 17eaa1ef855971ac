//! PSP Core - Payment Service Provider backbone for a multi-tenant payroll platform.
//!
//! This crate is the authoritative money-movement subsystem: every cent that
//! enters or leaves a client funding account passes through the double-entry
//! ledger (`ledger`), the two-stage funding gate (`funding_gate`), the payment
//! orchestrator (`orchestrator`), the reconciliation engine (`reconciler`),
//! and the liability classifier (`liability`). The `facade` module composes
//! these into the four top-level operations: commit a payroll batch, execute
//! payments, ingest a settlement feed, and handle a provider callback.
//!
//! Payroll calculation, the HTTP surface, and concrete rail SDKs are
//! deliberately out of scope - see `providers` for the adapter contract rail
//! implementations must satisfy.

#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod facade;
pub mod funding_gate;
pub mod ids;
pub mod ledger;
pub mod liability;
pub mod money;
pub mod orchestrator;
pub mod providers;
pub mod reconciler;
