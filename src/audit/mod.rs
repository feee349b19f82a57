// Observability layer - audit queries, dashboards, exports

//! # Audit, Dashboards & Exports
//!
//! Read-only projections over the audit table and the analysis layer:
//!
//! - [`trail::AuditTrail`] answers "what happened": per process, per
//!   kanban, per user, forced-only, plus compliance scoring
//! - [`dashboard::Dashboard`] answers "how are we doing": health scores,
//!   throughput, bottlenecks
//! - [`export`] renders nothing: it produces structural CSV strings,
//!   workbook row lists and report section lists for any downstream
//!   renderer

pub mod dashboard;
pub mod export;
pub mod trail;
