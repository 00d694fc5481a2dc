//! Database instances and the registry that hands them out.
//!
//! There is one [`Database`] per (app name, URL). Everything that depends on
//! the native connection holds an `Arc<Database>`: queries, listener
//! aggregates and the completions of in-flight operations. The registry
//! keeps each instance until it is disposed, either explicitly or because
//! its [`App`](crate::app::App) was disposed.

mod instance;
mod registry;

pub use instance::Database;
pub use registry::{DatabaseRegistry, RegistryConfig};
