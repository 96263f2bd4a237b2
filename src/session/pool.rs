use std::mem::ManuallyDrop;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};
use crate::Nl2SqlError;

/// Bounded pool of Postgres connections.
///
/// Connections are pinged before reuse; a connection that was checked out
/// and not explicitly released clean is discarded instead of being returned.
pub struct PgPool {
    url: String,
    connections: Arc<Mutex<Vec<Client>>>,
    semaphore: Arc<Semaphore>,
}

impl PgPool {
    pub fn new_with_size(url: &str, max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        PgPool {
            url: url.to_string(),
            connections: Arc::new(Mutex::new(Vec::new())),
            semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Number of idle connections currently held.
    pub fn idle_connections(&self) -> usize {
        self.connections.lock().len()
    }

    async fn create_connection(&self) -> Result<Client, Nl2SqlError> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(|e| Nl2SqlError::database(e, None))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Postgres connection task ended with error: {}", e);
            }
        });

        debug!("Opened new Postgres connection");
        Ok(client)
    }

    /// Pre-ping an idle connection before handing it out again.
    async fn is_healthy(client: &Client) -> bool {
        !client.is_closed() && client.simple_query("SELECT 1").await.is_ok()
    }

    pub async fn acquire(&self) -> Result<PooledClient, Nl2SqlError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Nl2SqlError::DatabaseError {
                sql: None,
                message: "connection pool is closed".to_string(),
            })?;

        loop {
            let idle = self.connections.lock().pop();
            match idle {
                Some(client) => {
                    if Self::is_healthy(&client).await {
                        return Ok(PooledClient::new(client, self.connections.clone(), permit));
                    }
                    debug!("Discarding stale pooled connection");
                }
                None => {
                    let client = self.create_connection().await?;
                    return Ok(PooledClient::new(client, self.connections.clone(), permit));
                }
            }
        }
    }

    /// Drop every idle connection.
    pub fn close_idle(&self) {
        self.connections.lock().clear();
    }
}

/// `SET` statement applying a per-session statement timeout.
pub fn statement_timeout_sql(timeout_ms: u64) -> String {
    format!("SET statement_timeout = {}", timeout_ms)
}

/// A checked-out connection.
///
/// Dropping it returns the connection to the pool only after
/// [`PooledClient::release`] was called; otherwise the in-flight statement
/// is cancelled server-side and the connection is closed.
pub struct PooledClient {
    client: ManuallyDrop<Client>,
    pool: Arc<Mutex<Vec<Client>>>,
    clean: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    fn new(client: Client, pool: Arc<Mutex<Vec<Client>>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            client: ManuallyDrop::new(client),
            pool,
            clean: false,
            _permit: permit,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Bound every following statement on this session to `timeout_ms`.
    pub async fn set_statement_timeout(&self, timeout_ms: u64) -> Result<(), tokio_postgres::Error> {
        self.client.batch_execute(&statement_timeout_sql(timeout_ms)).await
    }

    /// Mark the connection idle and safe to reuse.
    pub fn release(mut self) {
        self.clean = true;
    }

    /// Settle the connection after a failed statement.
    ///
    /// An error reported by the server leaves the session idle, so the
    /// connection goes back to the pool; transport and client-side errors
    /// discard it.
    pub fn release_after_error(self, error: &tokio_postgres::Error) {
        if error.as_db_error().is_some() {
            self.release();
        } else {
            debug!("Discarding connection after client-side error: {}", error);
        }
    }
}

impl std::ops::Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        self.client()
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        // SAFETY: `client` is not accessed again after being taken here
        let client = unsafe { ManuallyDrop::take(&mut self.client) };

        if self.clean && !client.is_closed() {
            self.pool.lock().push(client);
            return;
        }

        warn!("Discarding connection abandoned mid-operation");
        let token = client.cancel_token();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = token.cancel_query(NoTls).await {
                    debug!("Cancel request failed: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_timeout_sql() {
        assert_eq!(statement_timeout_sql(10_000), "SET statement_timeout = 10000");
        assert_eq!(statement_timeout_sql(250), "SET statement_timeout = 250");
    }

    #[tokio::test]
    async fn test_acquire_fails_without_server() {
        let pool = PgPool::new_with_size("postgres://nobody@127.0.0.1:1/none?connect_timeout=1", 1);
        let err = pool.acquire().await.err().map(|e| e.kind());
        assert_eq!(err, Some("database_error"));
        assert_eq!(pool.idle_connections(), 0);
    }
}
