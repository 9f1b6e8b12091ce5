//! Wire types for pw-fleet.
//!
//! This crate contains the serde-serializable types shared between the
//! scheduling engine and the browser runtime: persisted authentication
//! state and the Chrome DevTools Protocol frames exchanged with session hosts.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization/deserialization
//! * Stable: Changes only when the on-wire or on-disk shape changes
//!
//! Scheduling behavior lives in `pw-fleet`; process and connection
//! handling lives in `pw-fleet-runtime`.

pub mod auth_state;
pub mod cdp;

pub use auth_state::*;
pub use cdp::*;
