// Flowboard - data-driven workflow engine
// Form submissions become long-lived processes that advance through a
// declarative state machine under a warn-not-block transition contract.

//! # Flowboard Library
//!
//! This is the library root for Flowboard, a workflow engine in which every
//! form record linked to a kanban definition becomes a **process** that moves
//! through declared states. The engine's overarching contract is
//! **warn-not-block**: prerequisites and warnings inform the caller, while
//! only explicitly blocked transitions are refused.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`KanbanDefinition`]: a declarative workflow (states + transition sets)
//! - [`Process`]: the live instance of a kanban, born from one form record
//! - [`AuditEntry`]: one immutable event on one process
//! - [`models::ident`]: the 27-character Crockford-variant identifier codec
//!
//! ### Registry and Storage
//! - [`KanbanRegistry`]: loads, validates and indexes kanban definitions and
//!   their form mappings; hosts the transition classification predicates
//! - [`StorageDriver`]: pluggable persistence contract with in-memory and
//!   semicolon-delimited flat-file implementations
//! - [`ProcessRepository`]: the two-table persistence split: one live record
//!   per process plus an append-only audit table
//!
//! ### Engines
//! - [`TransitionEngine`]: the single decision gate for state changes:
//!   classification, prerequisite warnings, forced transitions, and bounded
//!   auto-transition cascades
//! - [`PrerequisiteChecker`]: four pluggable check kinds, never raising out
//!   of the checker; failures become unsatisfied results
//! - [`FormTriggerManager`]: creates and syncs processes from form events
//!
//! ### Analysis and Agents
//! - [`PatternAnalyzer`] / [`AnomalyDetector`]: pure analytics over the
//!   audit trail (frequent sequences, transition matrix, stuck processes,
//!   loops, outliers)
//! - [`AgentOrchestrator`]: aggregates the heuristic, pattern and rule
//!   agents into one ranked recommendation with consensus and a learning
//!   feedback loop
//!
//! ### Observability and Dispatch
//! - [`AuditTrail`] / [`Dashboard`]: event-log projections, health scores,
//!   bottleneck and throughput aggregates, structural exporters
//! - [`EmailDispatcher`] / [`WebhookDispatcher`]: queued event fan-out with
//!   retry and templating

// Core domain models (kanban, process, audit, prerequisite, tag, identifier)
pub mod models;

// Kanban registry: definition loading, validation, indexing, classification
pub mod registry;

// Persistence: driver contract, backends, and the process repository
pub mod storage;

// Engines: prerequisite checker, process factory, transition engine
pub mod engine;

// Analytics over the audit trail: patterns, anomalies, features
pub mod analysis;

// Suggestion agents, orchestrator, and the feedback loop
pub mod agents;

// Audit queries, dashboards, and structural exporters
pub mod audit;

// Notification and webhook dispatch
pub mod dispatch;

// Tags-as-state service
pub mod tags;

// Re-export the commonly used types so callers can import from the crate
// root instead of navigating the module hierarchy.
pub use models::{
    audit::{ActorType, AuditAction, AuditEntry},
    kanban::{
        AgentHints, BlockedTransition, EmailChannelConfig, KanbanDefinition,
        NotificationSettings, StateDefinition, StateType, TransitionRule, WarnedTransition,
        WebhookChannelConfig,
    },
    prerequisite::{CheckResult, CheckRule, FieldCondition, Prerequisite, ScriptRule},
    process::{Process, SlaConfig},
    tag::TagRecord,
};

pub use registry::KanbanRegistry;

pub use storage::{
    delimited::DelimitedFileDriver,
    memory::MemoryDriver,
    repository::{ProcessPatch, ProcessRepository, StateChange},
    FieldSpec, FieldType, Record, StorageDriver, TableSchema,
};

pub use engine::{
    factory::{FormTriggerManager, OrphanPolicy, ProcessFactory, SyncStats},
    prerequisites::PrerequisiteChecker,
    transition::{
        AutoReason, CascadeStep, SweepStats, TransitionClass, TransitionEngine,
        TransitionOutcome,
    },
};

pub use analysis::{
    anomalies::AnomalyDetector, features::FeatureExtractor, patterns::PatternAnalyzer,
};

pub use agents::{
    feedback::{FeedbackLoop, SuggestionOutcome},
    heuristic::HeuristicAgent,
    orchestrator::AgentOrchestrator,
    pattern::PatternAgent,
    rule::RuleAgent,
    AgentKind, RiskLevel, Suggestion, TransitionAgent, Validation,
};

pub use audit::{
    dashboard::Dashboard,
    export::{CsvExporter, ExcelExporter, PdfExporter},
    trail::AuditTrail,
};

pub use dispatch::{
    email::{EmailDispatcher, MailTransport, SmtpConfig},
    webhook::WebhookDispatcher,
    WorkflowEvent,
};

pub use tags::TagService;

use thiserror::Error;

/// Error type for every fallible Flowboard operation.
///
/// The four error families of the engine map onto these variants:
/// validation errors surface as `InvalidDefinition`/`DuplicateState`/
/// `UnknownStateReference`/`InvalidInput`; the only policy rejection is
/// `TransitionBlocked` (plus `JustificationRequired` for warned transitions
/// that demand one); infrastructure failures surface as `Storage` and are
/// retryable; everything else is a programming or environment defect.
///
/// Warnings are never errors; they travel inside result payloads.
#[derive(Error, Debug)]
pub enum FlowboardError {
    /// A kanban definition failed schema validation
    #[error("Invalid kanban definition in '{file}': {reason}")]
    InvalidDefinition { file: String, reason: String },

    /// Two states in one kanban share an id
    #[error("Duplicate state '{state}' in kanban definition '{file}'")]
    DuplicateState { file: String, state: String },

    /// A transition list or flow sequence references an undeclared state
    #[error("Unknown state '{state}' referenced by {context} in '{file}'")]
    UnknownStateReference {
        file: String,
        context: String,
        state: String,
    },

    /// The one policy rejection: the requested transition is on the
    /// kanban's blocked list
    #[error("Transition blocked: {0}")]
    TransitionBlocked(String),

    /// A warned transition demanded a justification and none was supplied
    #[error("Justification required for transition from '{from}' to '{to}'")]
    JustificationRequired { from: String, to: String },

    /// No kanban with this id is registered
    #[error("Kanban not found: {0}")]
    KanbanNotFound(String),

    /// No process with this id exists
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    /// The caller supplied something unusable (unknown state, empty
    /// justification on a forced transition, malformed tag, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage-backend failure; retryable
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything that indicates a bug or broken environment
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowboardError {
    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowboardError::Storage(_))
    }
}

impl From<std::io::Error> for FlowboardError {
    fn from(err: std::io::Error) -> Self {
        FlowboardError::Storage(err.into())
    }
}

/// Shorthand for results carrying a [`FlowboardError`].
pub type Result<T> = std::result::Result<T, FlowboardError>;
