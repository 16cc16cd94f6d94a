pub mod audit;
pub mod config;
pub mod directory;
pub mod error;
pub mod request;
pub mod resubmit;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod transition;
pub mod utils;
pub mod workflow;

pub use error::{ErrorClass, Result, WorkflowError};
pub use service::RequestService;
