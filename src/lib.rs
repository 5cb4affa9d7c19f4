//! PostgreSQL wire protocol driver core.
//!
//! This crate provides:
//! - `Connector`: one physical connection speaking protocol v3, with
//!   pipelined batches, cancellation and a per-connection statement cache
//! - `ConnectorPool`: a lock-free connector pool with FIFO waiters, idle
//!   pruning and clear epochs, usable from async and blocking callers
//! - A process-wide registry mapping connection strings to pools
//! - Driver-wide counters, see [`driver_metrics`]
//!
//! # Example
//!
//! ```ignore
//! let pool = pgkit::pool_for("Host=localhost;Username=app;Database=app")?;
//! let mut conn = pool.allocate().await?;
//! let result = conn.query("SELECT $1::int4", &[PgValue::Int4(1)]).await?;
//! ```

mod buffer;
mod cache;
pub mod command;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod pool;
mod pool_manager;
pub mod protocol;
mod scram;
pub mod settings;
mod sql;
pub mod statement;
pub mod types;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use cache::StatementCache;
pub use command::{Command, QueryResult, Transaction};
pub use connector::{CancelToken, Connector, ConnectorState};
pub use error::{PgError, PgResult, ServerError};
pub use metrics::{driver_metrics, DriverMetrics};
pub use pool::{ConnectorPool, EnlistmentId, PoolStats, PooledConnector};
pub use pool_manager::PoolManager;
pub use protocol::{FieldDescription, SharedColumns, TransactionStatus};
pub use settings::ConnectionSettings;
pub use types::{BuiltinTypeMapper, Oid, Parameter, PgValue, TypeMapper};

/// Pool registered for `conn_str`, created on first use.
///
/// The same string always yields the same pool for the life of the process.
pub fn pool_for(conn_str: &str) -> PgResult<ConnectorPool> {
    pool_manager::POOLS.get_or_create(conn_str)
}

/// Clear the registered pool for `conn_str`. Returns false if none exists.
pub fn clear_pool(conn_str: &str) -> bool {
    pool_manager::POOLS.clear(conn_str)
}

/// Clear every registered pool.
pub fn clear_all_pools() {
    pool_manager::POOLS.clear_all();
}

/// Every pool registered so far.
pub fn registered_pools() -> Vec<ConnectorPool> {
    pool_manager::POOLS.pools()
}
