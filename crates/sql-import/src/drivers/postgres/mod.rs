//! PostgreSQL driver.
//!
//! - [`PgTarget`]: target store over a deadpool-postgres pool
//! - [`SslMode`]: TLS settings for target connections

mod tls;
mod writer;

pub use tls::SslMode;
pub use writer::PgTarget;
