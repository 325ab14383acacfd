//! Explicit and ambient transactions.
//!
//! A [`DbTransaction`] is a local transaction on one connection, started with
//! `Database::begin_transaction` and passed explicitly to each command.
//!
//! A [`TransactionScope`] is ambient: commands executed inside
//! [`TransactionScope::run`] enlist automatically. The scope opens at most one
//! connection per connection string and shares it between all enlisted commands
//! through its reference count.

use crate::db::connection::{DbConnection, driver_for};
use crate::db::executor;
use crate::db::wrapper::{ConnectionWrapper, SharedConnection};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionString, TransactionState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Run a transaction control statement on a shared connection.
async fn run_control(connection: &SharedConnection, statement: &str) -> DbResult<()> {
    let mut guard = connection.lock().await?;
    executor::execute_raw(guard.connection()?, statement).await
}

/// Open a connection and start a local transaction on it.
async fn open_in_transaction(connection_string: &ConnectionString) -> DbResult<SharedConnection> {
    let driver = driver_for(connection_string)?;
    let connection = ConnectionWrapper::new(DbConnection::open(connection_string).await?);
    if let Err(e) = run_control(&connection, driver.begin_statement()).await {
        connection.release().await;
        return Err(e);
    }
    Ok(connection)
}

// =============================================================================
// Explicit Transactions
// =============================================================================

/// A local transaction bound to one connection.
///
/// Dropping a transaction that was neither committed nor rolled back rolls it
/// back in the background.
pub struct DbTransaction {
    id: String,
    connection: SharedConnection,
    state: TransactionState,
    started_at: DateTime<Utc>,
}

impl DbTransaction {
    pub(crate) async fn begin(connection_string: &ConnectionString) -> DbResult<Self> {
        let connection = open_in_transaction(connection_string).await?;
        let id = Uuid::new_v4().to_string();
        info!(
            transaction_id = %id,
            connection = %connection_string.without_credentials(),
            "Transaction started"
        );
        Ok(Self {
            id,
            connection,
            state: TransactionState::Active,
            started_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The connection the transaction runs on.
    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    pub async fn commit(mut self) -> DbResult<()> {
        self.end("COMMIT", TransactionState::Committed).await
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        self.end("ROLLBACK", TransactionState::RolledBack).await
    }

    async fn end(&mut self, statement: &str, target: TransactionState) -> DbResult<()> {
        let result = run_control(&self.connection, statement).await;
        // A failed COMMIT leaves nothing to commit; the server discards the work.
        self.state = if result.is_ok() {
            target
        } else {
            TransactionState::RolledBack
        };
        self.connection.release().await;

        match &result {
            Ok(()) => info!(transaction_id = %self.id, state = ?self.state, "Transaction ended"),
            Err(e) => error!(transaction_id = %self.id, error = %e, "Failed to end transaction"),
        }
        result
    }
}

impl Drop for DbTransaction {
    fn drop(&mut self) {
        if !self.state.is_active() {
            return;
        }
        self.state = TransactionState::RolledBack;
        warn!(
            transaction_id = %self.id,
            "Transaction dropped without commit or rollback; rolling back"
        );

        let connection = Arc::clone(&self.connection);
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = run_control(&connection, "ROLLBACK").await {
                        warn!(transaction_id = %id, error = %e, "Background rollback failed");
                    }
                    connection.release().await;
                });
            }
            // Without a runtime the connection is dropped and the server discards the work.
            Err(_) => {
                warn!(transaction_id = %id, "No runtime available for background rollback");
            }
        }
    }
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTransaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .finish()
    }
}

// =============================================================================
// Ambient Transactions
// =============================================================================

tokio::task_local! {
    static AMBIENT: Arc<ScopeState>;
}

/// The ambient transaction of the current task, if any.
pub(crate) fn ambient_scope() -> Option<Arc<ScopeState>> {
    AMBIENT.try_with(Arc::clone).ok()
}

/// Shared state of a [`TransactionScope`].
pub(crate) struct ScopeState {
    id: String,
    connections: Mutex<HashMap<String, SharedConnection>>,
    closed: AtomicBool,
}

impl ScopeState {
    /// A reference to the scope's connection for `connection_string`, opening it
    /// and starting the transaction on first use. The caller releases it.
    pub(crate) async fn connection_for(
        &self,
        connection_string: &ConnectionString,
    ) -> DbResult<SharedConnection> {
        let mut connections = self.connections.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::transaction(
                "the transaction scope has already ended",
                &self.id,
            ));
        }

        if let Some(connection) = connections.get(connection_string.as_str()) {
            return Ok(connection.add_ref());
        }

        let connection = open_in_transaction(connection_string).await?;
        debug!(
            scope_id = %self.id,
            connection = %connection_string.without_credentials(),
            "Connection enlisted in transaction scope"
        );
        let reference = connection.add_ref();
        connections.insert(connection_string.as_str().to_string(), connection);
        Ok(reference)
    }

    /// End the transaction on every enlisted connection and drop the scope's
    /// references. Returns the first error after every connection has been ended.
    async fn end(&self, statement: &str) -> DbResult<()> {
        let mut connections = self.connections.lock().await;
        self.closed.store(true, Ordering::Release);

        let mut first_error = None;
        for (_, connection) in connections.drain() {
            if let Err(e) = run_control(&connection, statement).await {
                error!(scope_id = %self.id, error = %e, statement, "Failed to end scope transaction");
                first_error.get_or_insert(e);
            }
            connection.release().await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

/// An ambient transaction.
///
/// ```ignore
/// let scope = TransactionScope::new();
/// scope.run(async {
///     db.execute_non_query(&insert).await?;
///     db.execute_non_query(&update).await
/// }).await?;
/// scope.complete().await?;
/// ```
///
/// Commands run, and `complete`, while an enlisted reader is still open fail
/// with [`DbError::ConnectionBusy`].
pub struct TransactionScope {
    state: Arc<ScopeState>,
    finished: bool,
}

impl TransactionScope {
    pub fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        debug!(scope_id = %id, "Transaction scope created");
        Self {
            state: Arc::new(ScopeState {
                id,
                connections: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// Run `future` with this scope as the ambient transaction.
    pub async fn run<F: Future>(&self, future: F) -> F::Output {
        AMBIENT.scope(Arc::clone(&self.state), future).await
    }

    /// Number of connections enlisted so far.
    pub async fn connection_count(&self) -> usize {
        self.state.connection_count().await
    }

    /// Commit the work of every enlisted connection.
    pub async fn complete(mut self) -> DbResult<()> {
        self.finished = true;
        let result = self.state.end("COMMIT").await;
        info!(scope_id = %self.state.id, ok = result.is_ok(), "Transaction scope completed");
        result
    }

    /// Roll back the work of every enlisted connection.
    pub async fn dispose(mut self) -> DbResult<()> {
        self.finished = true;
        let result = self.state.end("ROLLBACK").await;
        info!(scope_id = %self.state.id, "Transaction scope rolled back");
        result
    }
}

impl Default for TransactionScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let state = Arc::clone(&self.state);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if state.connection_count().await > 0 {
                        warn!(scope_id = %state.id, "Transaction scope dropped without complete; rolling back");
                    }
                    let _ = state.end("ROLLBACK").await;
                });
            }
            Err(_) => {
                state.closed.store(true, Ordering::Release);
                warn!(scope_id = %state.id, "No runtime available to roll back transaction scope");
            }
        }
    }
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.state.id)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_ambient_scope_outside_run() {
        assert!(ambient_scope().is_none());
    }

    #[tokio::test]
    async fn test_ambient_scope_visible_inside_run() {
        let scope = TransactionScope::new();
        let id = scope.id().to_string();
        let seen = scope
            .run(async { ambient_scope().map(|s| s.id.clone()) })
            .await;
        assert_eq!(seen.as_deref(), Some(id.as_str()));
        assert!(ambient_scope().is_none());
        scope.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_shares_one_connection_per_string() {
        let cs = ConnectionString::parse("sqlite::memory:").unwrap();
        let scope = TransactionScope::new();
        let state = Arc::clone(&scope.state);

        let first = state.connection_for(&cs).await.unwrap();
        let second = state.connection_for(&cs).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // scope + two leases
        assert_eq!(first.ref_count(), 3);
        assert_eq!(scope.connection_count().await, 1);

        first.release().await;
        second.release().await;
        scope.complete().await.unwrap();
        assert!(first.is_disposed());
    }

    #[tokio::test]
    async fn test_ended_scope_rejects_enlistment() {
        let cs = ConnectionString::parse("sqlite::memory:").unwrap();
        let scope = TransactionScope::new();
        let state = Arc::clone(&scope.state);
        scope.dispose().await.unwrap();

        let result = state.connection_for(&cs).await;
        assert!(matches!(result, Err(DbError::Transaction { .. })));
    }

    #[tokio::test]
    async fn test_explicit_transaction_commit_releases_connection() {
        let cs = ConnectionString::parse("sqlite::memory:").unwrap();
        let tx = DbTransaction::begin(&cs).await.unwrap();
        assert!(tx.state().is_active());
        let connection = Arc::clone(tx.connection());
        assert_eq!(connection.ref_count(), 1);

        tx.commit().await.unwrap();
        assert!(connection.is_disposed());
    }
}
