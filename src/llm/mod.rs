//! Backend registry and provider clients.
//!
//! This module owns the static side of the cascade: which backends exist
//! ([`ModelRegistry`]), and how to call one ([`ModelClient`]). The dynamic
//! side, deciding which backend to try next, lives in [`crate::cascade`].

mod client;
mod registry;
pub(crate) mod types;

pub use client::{HttpModelClient, ModelClient};
pub use registry::ModelRegistry;
pub use types::{ModelDescriptor, ModelResponse, Provider};

#[cfg(test)]
pub(crate) use client::testing;
