//! # Bastion Telemetry
//!
//! The write side of the analytics store. Two concerns live here:
//!
//! - [`sink`] — append-only persistence of structured records: normalized
//!   events (partitioned by month), workflow step logs and summaries, and
//!   plugin logs. Unlike bus delivery, sink writes are synchronous and
//!   surface their errors; telemetry that must not be dropped goes through
//!   here, never through the bus.
//! - [`identity`] — the offline identity resolver: a periodic batch job that
//!   unions observed `(steam id, eos id)` pairs into connected components and
//!   assigns each physical player a stable canonical id.
//!
//! Storage layout is deliberately simple (JSONL files); the traits are the
//! contract, and a relational implementation can replace the file one
//! without touching producers.

pub mod identity;
pub mod sink;

pub use identity::{
    resolve_identities, CanonicalIdentity, IdentityLookupRow, IdentityResolver, JoinLedger,
    JoinObservation, IDENTITY_BATCH_SIZE,
};
pub use sink::{
    AnalyticsStore, JsonlAnalyticsStore, JsonlSink, MemorySink, PluginLogRecord, TelemetryError,
    TelemetrySink, WorkflowStepLog, WorkflowSummaryLog,
};
