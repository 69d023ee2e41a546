pub mod config;
pub mod controller;
pub mod error;
pub mod facts;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use controller::{Controller, ControllerSnapshot, SubmitRequest};
pub use error::{LcmError, Result};
