//! In-process execution scheduler for tasks, workflows and
//! agents.

pub mod config;
pub mod error;
pub mod execution;
pub mod store;
