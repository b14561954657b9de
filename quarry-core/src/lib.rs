//! Execution governor for Quarry.
//!
//! Learners edit and run transformation projects and ad-hoc SQL on a small,
//! shared host. This crate keeps that host alive: it bounds how many
//! external jobs run at once, how many database connections exist, how many
//! requests a principal may make, and how long per-tenant working
//! directories survive on disk.
//!
//! Every component is constructed explicitly and shared through `Arc`; the
//! [`Governor`] wires them together and runs their background reclamation.

pub mod error;
pub mod governor;
pub mod ids;
pub mod jobs;
pub mod pool;
pub mod ratelimit;
pub mod settings;
pub mod workspace;

pub use error::{GovernorError, Result};
pub use governor::{Governor, GovernorStats, MaintenanceReport};
pub use ids::{ContentSetId, ModelName, TenantId};
pub use settings::{
    DbtSettings, GovernorSettings, JobSettings, PoolSettings, ProfileSettings,
    RateLimitSettings, WindowLimit, WorkspaceSettings,
};
