//! External job execution with admission control.

mod command;
mod job;
mod output;
mod process;
mod registry;

pub use command::{DbtInvocation, JobCommand};
pub use job::{JobId, JobSnapshot, JobStatus, KillReason};
pub use output::{OutputEvent, OutputLog, OutputSource};
pub use registry::{JobRegistry, JobStats};
