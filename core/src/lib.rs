pub mod activity;
pub mod drain;
pub mod error;
pub mod periodic;
pub mod relay;
pub mod replay;
pub mod session;
pub mod signal;
pub mod taskrunner;
pub mod telemetry;

pub use error::Error;
