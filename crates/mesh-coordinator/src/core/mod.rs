//! Core coordinator engine

mod coordinator;
mod error;
mod state;

pub use coordinator::{ActivationRequest, ActivationResponse, Coordinator, CoordinatorQuote};
pub use error::CoordinatorError;
pub use state::{MarbleInstance, State, Stats, Status};
