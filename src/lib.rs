//! Report Flow: a bounded reporting workflow engine.
//!
//! `workflow` holds the engine (pipeline registry, state, transitions,
//! feedback loop, executor). `stages` holds the collaborators and the
//! standard reporting pipeline built on top of it.

pub mod config;
pub mod error;
pub mod stages;
pub mod workflow;
