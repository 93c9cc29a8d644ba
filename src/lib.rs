//! # lexcascade
//!
//! Fault-tolerant LLM provider cascade for statute-section analysis
//! pipelines. Each per-section request (reporting-requirement detection,
//! anachronism classification, obligation extraction, complexity scoring)
//! is routed across a heterogeneous pool of backends spanning several API
//! providers, none of which offer uniform rate-limit guarantees.
//!
//! ## Core Components
//!
//! - **ModelRegistry**: the ordered, tiered backend list for one run
//! - **CascadeStrategy**: error-driven (reactive) or rate-limited
//!   (preemptive) backend selection with automatic recovery
//! - **Dispatcher**: NDJSON worker pool invoking the strategy per record
//! - **UsageStats**: per-model and per-tier accounting, reported at shutdown
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lexcascade::{
//!     build_strategy, CascadeConfig, HttpModelClient, ModelRegistry,
//!     StrategyKind, UsageStats,
//! };
//!
//! let config = CascadeConfig::default();
//! let registry = ModelRegistry::from_config(&config)?;
//! let client = Arc::new(HttpModelClient::new(config.timeout_secs)?);
//! let stats = Arc::new(UsageStats::new());
//!
//! let strategy = build_strategy(
//!     StrategyKind::RateLimited, &registry, client, stats.clone(), &config, false,
//! );
//! let response = strategy.invoke("section-42", "Does this section ...").await?;
//! println!("served by {}", response.model);
//! ```

pub mod cascade;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod stats;

// Re-exports for convenience
pub use cascade::{
    build_strategy, CascadeResponse, CascadeSnapshot, CascadeStrategy, CoolingSnapshot,
    ErrorDrivenCascade, RateLimitedCascade, StrategyKind, TierSnapshot,
};
pub use config::CascadeConfig;
pub use dispatch::{DispatchOptions, RunSummary, SectionCodec, TaskCodec};
pub use error::{Error, ErrorKind, Result};
pub use llm::{HttpModelClient, ModelClient, ModelDescriptor, ModelRegistry, ModelResponse, Provider};
pub use stats::{CallRecord, ModelCounters, TierCounters, UsageStats};
