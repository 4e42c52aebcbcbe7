// =============================================================================
// Parlor - Library Crate
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Core library of the Parlor homeserver: event persistence into an
//   ordered, transactional, globally-versioned key-value store, the
//   three-step federation authorization pipeline, state resolution across
//   DAG forks, versionstamp-ordered sync streams, change notification
//   fan-out, and lease-coordinated background workers. The HTTP surface,
//   configuration parsing and transports live in the embedding server.
//
// =============================================================================

pub mod config;
pub mod database;
pub mod service;
pub mod types;
pub mod utils;

pub use config::Config;
pub use utils::error::{Error, Result};

// Re-export common foundations
pub use ruma;
pub use tokio;
pub use tracing;

pub use service::Services;
