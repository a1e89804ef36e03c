//! Microsoft SQL Server driver.
//!
//! - [`MssqlSource`]: source provider over a bb8 pool of Tiberius clients

mod reader;

pub use reader::{MssqlSource, TiberiusConnectionManager};
