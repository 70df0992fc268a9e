//! Reflex Guard - Decision gates that screen tasks before execution
//!
//! Every gate is a pure function of its inputs. The only state a gate may
//! touch is the [`Runtime`] it is handed explicitly (the stabilizer's
//! response cache and the clock).
//!
//! # Gates
//!
//! - [`BootGate`]: always passes; fixes ordering
//! - [`GuardGate`]: schema checks and policy deny patterns
//! - [`StabilizerGate`]: replays cached responses for identical requests
//! - [`DomainFilterGate`]: injects a data-source filter for domain queries
//!
//! # Key Principle
//!
//! **Gates decide, they never raise.** A gate error is converted to a DENY by
//! the pipeline, using [`GateError::code`] as the reason.

pub mod boot;
pub mod cache;
pub mod clock;
pub mod domain;
pub mod gate;
pub mod guard;
pub mod stabilizer;

pub use boot::BootGate;
pub use cache::{CacheLookup, CachedResponse, ResponseCache, DEFAULT_RETENTION_MS};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{DomainFilterConfig, DomainFilterGate};
pub use gate::{Gate, GateError, GateInput, Policy, Result, Runtime};
pub use guard::GuardGate;
pub use stabilizer::StabilizerGate;
