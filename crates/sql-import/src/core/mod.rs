//! Core data types shared by every phase of a job.

pub mod health;
pub mod value;

pub use health::HealthStatus;
pub use value::{Record, Row, Value};
