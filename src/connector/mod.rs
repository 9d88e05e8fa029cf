// SPDX-License-Identifier: Apache-2.0

// Connector Module
// Uniform capability interface implemented by every store adapter

pub mod drivers;
pub mod error;
pub mod registry;
pub mod stream;
pub mod traits;
pub mod types;

pub use error::{SourceError, SourceResult};
pub use registry::{SourceDescriptor, SourceRegistry};
pub use traits::{Connector, RowStream};
pub use types::*;
