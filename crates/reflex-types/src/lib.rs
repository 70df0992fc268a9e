//! Reflex Types - Value objects flowing through the reflex kernel
//!
//! This crate has no dependencies on other reflex crates. It defines:
//!
//! - Identity types (CapsuleId, AgentId)
//! - Capsules, capsule results and their provenance trace
//! - Needs raised by blocked capsules
//! - Gate decisions
//! - The capsule lifecycle state machine
//! - The error taxonomy and its stable reason codes
//! - Canonical JSON hashing used for cache keys and audit input hashes
//!
//! # Flow
//!
//! ```text
//! task ─▶ gates (Decision) ─▶ Capsule ─▶ engine (CapsuleResult) ─▶ [Need ─▶ assist | provision ─▶ retry]
//! ```

pub mod canonical;
pub mod capsule;
pub mod decision;
pub mod error;
pub mod identity;
pub mod need;
pub mod state;

pub use canonical::*;
pub use capsule::*;
pub use decision::*;
pub use error::*;
pub use identity::*;
pub use need::*;
pub use state::*;
