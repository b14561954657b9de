//! Configuration for the Quarry server.
//!
//! Settings come from three layers, highest precedence first: process
//! environment (optionally seeded from a `.env` file), a TOML file, and the
//! defaults baked into [`quarry_core::GovernorSettings`]. The loader finishes
//! with guard rails that reject settings the governor cannot run with and
//! collect warnings for ones it can run with but probably should not.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{Config, ConfigMetadata, DatabaseConfig, SecurityConfig, ServerConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
