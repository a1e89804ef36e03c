//! Store drivers.
//!
//! - [`mssql`]: SQL Server source provider
//! - [`postgres`]: PostgreSQL target store
//! - [`memory`]: in-process source and target, used by tests and dry runs

pub mod memory;
pub mod mssql;
pub mod postgres;

pub use memory::{MemorySource, MemoryTarget};
pub use mssql::MssqlSource;
pub use postgres::{PgTarget, SslMode};
