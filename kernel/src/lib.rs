// Summary Log Kernel
//
// Versioned storage for uploaded summary logs: the status lifecycle,
// optimistic concurrency on every write, one in-flight submission per
// organisation/registration, and read-after-write polling.

pub mod config;
pub mod consistency;
pub mod invariants;
pub mod record;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod validation;
