//! Scheduling and session-host pooling for browser automation fleets.
//!
//! `pw-fleet` runs many long-lived automation sessions, one per external
//! account, under a global concurrency ceiling:
//!
//! * [`TaskQueue`] admits work in priority order and never runs more than the
//!   configured number of tasks at once.
//! * [`ResourcePool`] keeps one expensive session host per egress identity and
//!   checks out isolated contexts from it for each task.
//! * [`Orchestrator`] runs one independently paced loop per [`Capability`],
//!   tracking per-account due times.
//! * [`ChallengeGate`] suspends accounts that hit an anti-automation challenge
//!   or an authentication failure until an operator resolves them.
//! * [`ShutdownCoordinator`] stops loops, drains the queue, and tears
//!   everything down in a fixed order.
//!
//! Page-level interaction is not part of this crate; capabilities are opaque
//! task bodies that receive a [`SessionContext`].

pub mod account;
pub mod capability;
pub mod config;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod shutdown;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use account::{Account, AccountStore, CapabilitySettings, Credentials, ProxySpec, ResourceKey};
pub use capability::{Capability, CapabilityOutcome, ChallengeDetector, ChallengeKind, Detection, MarkerDetector, RenderedPage, TaskStatus};
pub use config::{BackoffConfig, CapabilityConfig, DurationRange, FleetConfig, Pacing};
pub use error::{ErrorClass, FleetError, Result};
pub use gate::{ChallengeGate, EscalationReason, ManualSurface, SurfaceClosed, SurfaceControl, SurfaceFactory};
pub use orchestrator::{DueTimeTable, FleetSnapshot, Orchestrator};
pub use pool::{ContextHandle, HostDriver, HostHandle, Lease, PoolStats, ResourcePool, SessionContext, SessionHost};
pub use pw_fleet_protocol::AuthState;
pub use queue::{QueueStats, TaskHandle, TaskQueue};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
