//! Core library for the agent coordination control plane
//!
//! This crate contains the entity runtime and the five entity kinds:
//! - Coordinator: cross-agent registry, chat, tasks, zones, claims, handoffs
//! - AgentState: one private world per agent
//! - ResourceLock: TTL-bounded exclusive locks
//! - VMPool: VM fleet registry and assignment
//! - GitTree: repository tree cache

pub mod agent;
pub mod coordinator;
pub mod error;
pub mod gittree;
pub mod lock;
pub mod request;
pub mod runtime;
pub mod vmpool;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
