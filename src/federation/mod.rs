// SPDX-License-Identifier: Apache-2.0

//! Cross-store query federation.
//!
//! A [`QueryDescriptor`] is planned against a [`SourceRegistry`] snapshot,
//! executed by fanning out to every source, and answered with a
//! [`ResultEnvelope`] that states which sources contributed.
//!
//! [`SourceRegistry`]: crate::connector::SourceRegistry

pub mod cache;
pub mod coordinator;
pub mod envelope;
pub mod exec;
pub mod manager;
pub mod plan;
pub mod planner;
pub mod reconcile;
pub mod types;

pub use envelope::{ResultEnvelope, SourceStatus};
pub use manager::Federation;
pub use plan::Plan;
pub use types::{AggregateSpec, FieldRef, JoinKind, OrderBy, QueryDescriptor, ReducerSpec};
