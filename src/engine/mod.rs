// Engine layer - prerequisite checks, process creation, transitions

//! # Engine Layer
//!
//! The three engines between the domain models and the outside world:
//!
//! - [`prerequisites::PrerequisiteChecker`] evaluates transition
//!   preconditions without ever turning a failed check into an error
//! - [`factory::ProcessFactory`] and [`factory::FormTriggerManager`] turn
//!   form events into process lifecycle operations
//! - [`transition::TransitionEngine`] is the single decision gate through
//!   which every state change executes

pub mod factory;
pub mod prerequisites;
pub mod transition;
