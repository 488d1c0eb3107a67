//! Storage layer for tessera.
//!
//! Services talk to storage only through the repository traits in this
//! crate. Two backends implement every trait:
//!
//! - [`SqliteStore`]: persistent, uniqueness constraints enforced by SQLite
//! - [`MemoryStore`]: in-process, used by tests and embedders
//!
//! # Atomicity
//!
//! Replay protection, billing idempotency, guarded entitlement updates and
//! device binding are single trait calls. Backends must make each call
//! linearizable; callers never check-then-insert.

mod error;
mod memory;
mod repo;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use repo::{
    BillingEventLedger, BindOutcome, CustomerRepo, DeviceIdentityRepo, DeviceRepo,
    EntitlementRepo, GuardedUpdate, Mutation, PurchaseRepo, ReplayLedger, Repositories,
};
pub use sqlite::SqliteStore;
