pub mod logger;
pub mod types;

pub use logger::AuditLogger;
pub use types::{AuditEvent, Severity};
