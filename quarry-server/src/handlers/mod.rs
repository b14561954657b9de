pub mod governor;
pub mod health;
pub mod jobs;
pub mod models;
pub mod query;
pub mod runs;
pub mod workspaces;
