//! Forge Core - Foundational Types
//!
//! Manifest model, provider configuration, architecture and digest
//! primitives, and the error taxonomy shared by the build engine.

pub mod arch;
pub mod config;
pub mod digest;
pub mod error;
pub mod manifest;

// Re-export commonly used types
pub use arch::Architecture;
pub use config::{ProviderConfig, PublishConfig, RetryConfig};
pub use digest::Digest;
pub use error::{ForgeError, PublishFailure, ResolutionFailure, Result};
pub use manifest::{Accounts, Contents, Entrypoint, Group, Manifest, PathEntry, PathKind, User};

/// Forge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
