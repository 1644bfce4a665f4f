pub mod error;
pub mod handle;
pub mod state;

pub use error::{LifecycleError, RuntimeError};
pub use handle::{ContainerHandle, ExecutionRequest, PayloadRef};
pub use state::ContainerState;
