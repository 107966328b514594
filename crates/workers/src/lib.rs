//! `workers` crate: the `Worker` trait and built-in worker implementations.
//!
//! Every collaborator the engine dispatches to (CRM fetchers, model calls,
//! report builders, …) must implement [`Worker`]. The engine only ever sees
//! the trait object and the capability tags it declares.

pub mod capability;
pub mod echo;
pub mod error;
pub mod mock;
pub mod traits;

pub use capability::Capability;
pub use echo::EchoWorker;
pub use error::{CapabilityError, WorkerError};
pub use traits::{JsonMap, Worker};
