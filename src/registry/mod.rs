mod error;
mod registry;
pub mod scorer;
mod types;

pub use error::{RegistryError, RegistryResult};
pub use registry::{LoadGuard, ServerRegistry, DEFAULT_REFRESH_TIMEOUT};
pub use types::{SelectionConstraints, ServerDescriptor, ServerRegistration};
