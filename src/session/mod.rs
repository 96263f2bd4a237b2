// Connection management for the database boundary
pub mod pool;

pub use pool::{PgPool, PooledClient};
