// Domain models for the workflow engine

//! # Domain Models
//!
//! Pure data types shared by every engine layer: kanban definitions,
//! process records, audit entries, prerequisite descriptors, tag records,
//! and the identifier codec. Nothing in this module performs I/O.

/// 27-character Crockford-variant identifier codec
pub mod ident;

/// Kanban definitions: states and transition classification sets
pub mod kanban;

/// Prerequisite descriptors and the script rule expression tree
pub mod prerequisite;

/// Live process records
pub mod process;

/// Append-only audit entries
pub mod audit;

/// Tags-as-state records
pub mod tag;
