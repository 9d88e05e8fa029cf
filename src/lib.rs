// SPDX-License-Identifier: Apache-2.0

//! AI-Shell query federation engine.
//!
//! Runs one logical query over several independently failing stores and
//! returns a single joined, aggregated result:
//!
//! - [`connector`]: the store contract and one adapter per store kind
//! - [`federation`]: type reconciliation, planning, execution, caching and
//!   partial-failure handling
//! - [`config`], [`observability`], [`metrics`]: ambient services

pub mod config;
pub mod connector;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod observability;

pub use config::FederationConfig;
pub use connector::{Connector, SourceDescriptor, SourceError, SourceRegistry};
pub use error::{ExecutionError, FederationError, FederationResult, PlanningError};
pub use federation::{Federation, QueryDescriptor, ResultEnvelope, SourceStatus};
