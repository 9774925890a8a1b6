//! Provider plumbing for Tandem.
//!
//! Concrete LLM clients live outside this workspace; everything here works
//! against `tandem_core::Provider`. The registry knows which providers are
//! configured and in what order to fall back; the failover module decides
//! which errors are worth falling back for.

pub mod failover;
pub mod registry;

pub use failover::{FailoverReason, classify};
pub use registry::ProviderRegistry;
