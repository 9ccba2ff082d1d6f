// SPDX-License-Identifier: Apache-2.0

// Data Engine Module
// Backend abstraction shared by every driver the federation engine talks to

pub mod drivers;
pub mod error;
pub mod registry;
pub mod traits;
pub mod types;

pub use error::{EngineError, EngineResult, QueryError};
pub use registry::DriverRegistry;
pub use traits::{BackendConnection, DataEngine};
pub use types::*;
