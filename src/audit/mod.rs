//! Audit and compliance: event sealing, PII pseudonymization, the
//! classification policy gate.

pub mod pii;
pub mod policy;
pub mod seal;

pub use pii::{PiiDetector, PiiKind, PiiReplacement};
pub use policy::{Classification, GovernancePolicy, LevelPolicy, VectorPolicy};
pub use seal::{
    canonical_json, verify_with, AuditCategory, AuditEvent, AuditSealer, LekSchedule,
    SealedAuditRecord,
};
