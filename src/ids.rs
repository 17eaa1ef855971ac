//! Opaque identifiers.
//!
//! Every persistent row in this crate is keyed by a 128-bit UUID (spec.md
//! §3). We don't wrap each one in its own newtype - the teacher crate passes
//! bare `Uuid`s around its signal/order pipelines too - but we do give the
//! common ones a name so call sites read like the domain instead of a sea of
//! `Uuid`.

use uuid::Uuid;

pub type TenantId = Uuid;
pub type LegalEntityId = Uuid;
pub type AccountId = Uuid;
pub type ReservationId = Uuid;
pub type InstructionId = Uuid;
pub type AttemptId = Uuid;
pub type SettlementEventId = Uuid;
pub type SettlementLinkId = Uuid;
pub type LiabilityEventId = Uuid;
pub type EventId = Uuid;
pub type BankAccountId = Uuid;
pub type CorrelationId = Uuid;
pub type CausationId = Uuid;

pub fn new_id() -> Uuid {
    Uuid::new_v4()
}
