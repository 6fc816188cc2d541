//! Every error type of the crate, in one place.

pub use crate::app::DefinitionError;
pub use crate::config::ConfigError;
pub use crate::emit::EmitError;
pub use crate::runtime::{DispatchError, InvocationError, RuntimeError};
pub use crate::schema::{SchemaViolation, ViolationKind};
