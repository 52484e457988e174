//! # Session Bookkeeping
//!
//! The two shared stores every realtime session touches:
//! - **ledger**: per-identity quota, exclusivity and blocking
//! - **registry**: durable session records and their status table
//!
//! Both are cheap to clone and safe to share between concurrent orchestrations.

pub mod identity;
pub mod ledger;
pub mod record;
pub mod registry;

pub use ledger::{AdmissionDecision, AdmissionRejection, DebitOutcome, LedgerError, QuotaLedger, QuotaPolicy, QuotaState};
pub use record::{SessionMetadata, SessionRecord, SessionStatus};
pub use registry::{RegistryError, SessionRegistry};
