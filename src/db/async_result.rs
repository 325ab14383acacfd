//! Envelope for asynchronous command execution.
//!
//! `Database::begin_*` starts the work on the runtime and returns an
//! [`AsyncResult`]; the matching `Database::end_*` consumes it. The envelope
//! carries what `end_*` needs to finish: the command, whether to dispose it,
//! and whether the operation must give its connection reference back.

use crate::db::wrapper::SharedConnection;
use crate::error::{DbError, DbResult};
use crate::models::Command;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Caller-supplied state carried through an asynchronous operation.
pub type AsyncState = Arc<dyn Any + Send + Sync>;

/// Invoked on the runtime once the operation has finished.
pub type AsyncCallback = Box<dyn FnOnce(CompletionInfo) + Send + 'static>;

/// What a completion callback learns about the operation.
#[derive(Clone)]
pub struct CompletionInfo {
    pub succeeded: bool,
    pub elapsed: Duration,
    pub state: Option<AsyncState>,
}

impl std::fmt::Debug for CompletionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionInfo")
            .field("succeeded", &self.succeeded)
            .field("elapsed", &self.elapsed)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

/// Optional callback and user state for a `begin_*` call.
#[derive(Default)]
pub struct AsyncOptions {
    pub callback: Option<AsyncCallback>,
    pub state: Option<AsyncState>,
}

impl AsyncOptions {
    pub fn with_callback(mut self, callback: impl FnOnce(CompletionInfo) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_state(mut self, state: impl Any + Send + Sync) -> Self {
        self.state = Some(Arc::new(state));
        self
    }
}

/// The value an operation produced plus the connection it ran on.
pub(crate) struct Completion<T> {
    pub value: T,
    pub connection: SharedConnection,
}

/// Signals completion without consuming the result.
#[derive(Debug, Clone)]
pub struct WaitHandle(watch::Receiver<bool>);

impl WaitHandle {
    pub fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Wait until the operation has finished.
    pub async fn wait(&self) {
        let mut receiver = self.0.clone();
        // An error means the task is gone, which is also "finished".
        let _ = receiver.wait_for(|done| *done).await;
    }
}

/// The spawned operation.
///
/// Dropped before it was joined, it waits for the operation in the background
/// and gives back the connection reference the operation owns.
struct PendingOperation<T: Send + 'static> {
    handle: Option<JoinHandle<DbResult<Completion<T>>>>,
    close_connection: bool,
}

impl<T: Send + 'static> PendingOperation<T> {
    async fn join(mut self) -> DbResult<Completion<T>> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| DbError::internal("asynchronous operation already ended"))?;
        handle
            .await
            .map_err(|e| DbError::internal(format!("asynchronous operation failed: {}", e)))?
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

impl<T: Send + 'static> Drop for PendingOperation<T> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if !self.close_connection {
            return;
        }
        warn!("Asynchronous result dropped without end; releasing its connection");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    // A failed operation has already released its reference.
                    if let Ok(Ok(completion)) = handle.await {
                        completion.connection.release().await;
                    }
                });
            }
            Err(_) => warn!("No runtime available to release an abandoned connection"),
        }
    }
}

/// A started asynchronous operation, finished by the matching `end_*` call.
///
/// Dropping it without `end_*` discards the value; a connection the operation
/// opened for itself is still released once the operation completes.
pub struct AsyncResult<T: Send + 'static> {
    operation: PendingOperation<T>,
    command: Command,
    dispose_command: bool,
    close_connection: bool,
    connection: Option<SharedConnection>,
    started_at: DateTime<Utc>,
    started: Instant,
    wait_handle: WaitHandle,
    state: Option<AsyncState>,
}

impl<T: Send + 'static> AsyncResult<T> {
    /// Spawn `operation` on the current runtime and wrap its handle.
    pub(crate) fn spawn<F>(
        operation: F,
        command: Command,
        dispose_command: bool,
        close_connection: bool,
        connection: Option<SharedConnection>,
        options: AsyncOptions,
    ) -> DbResult<Self>
    where
        F: Future<Output = DbResult<Completion<T>>> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            DbError::internal(format!("asynchronous execution needs a Tokio runtime: {}", e))
        })?;
        let AsyncOptions { callback, state } = options;
        let (done_tx, done_rx) = watch::channel(false);
        let started = Instant::now();
        let callback_state = state.clone();

        let handle = runtime.spawn(async move {
            let result = operation.await;
            let _ = done_tx.send(true);
            if let Some(callback) = callback {
                callback(CompletionInfo {
                    succeeded: result.is_ok(),
                    elapsed: started.elapsed(),
                    state: callback_state,
                });
            }
            result
        });

        Ok(Self {
            operation: PendingOperation {
                handle: Some(handle),
                close_connection,
            },
            command,
            dispose_command,
            close_connection,
            connection,
            started_at: Utc::now(),
            started,
            wait_handle: WaitHandle(done_rx),
            state,
        })
    }

    /// Wait for the operation, then dispose the command and release the
    /// connection as the flags say, in that order.
    pub(crate) async fn finish(self) -> DbResult<T> {
        let Self {
            operation,
            command,
            dispose_command,
            close_connection,
            started,
            ..
        } = self;

        let completion = operation.join().await?;

        if dispose_command {
            debug!(command = %command.text(), "Disposing command");
            drop(command);
        }
        if close_connection {
            completion.connection.release().await;
        }

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Asynchronous operation ended"
        );
        Ok(completion.value)
    }
}

impl<T: Send + 'static> AsyncResult<T> {
    pub fn is_completed(&self) -> bool {
        self.operation.is_finished()
    }

    /// Always false: work is handed to the runtime before `begin_*` returns.
    pub fn completed_synchronously(&self) -> bool {
        false
    }

    pub fn wait_handle(&self) -> &WaitHandle {
        &self.wait_handle
    }

    pub fn async_state(&self) -> Option<&AsyncState> {
        self.state.as_ref()
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// The caller's connection, when the operation runs on one the caller supplied.
    pub fn connection(&self) -> Option<&SharedConnection> {
        self.connection.as_ref()
    }

    pub fn dispose_command(&self) -> bool {
        self.dispose_command
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl<T: Send + 'static> std::fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("command", &self.command.text())
            .field("dispose_command", &self.dispose_command)
            .field("close_connection", &self.close_connection)
            .field("started_at", &self.started_at)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Release the connection of a failed operation that owned its reference.
pub(crate) async fn release_on_error<T>(
    result: DbResult<T>,
    connection: &SharedConnection,
    owned: bool,
) -> DbResult<T> {
    if result.is_err() && owned {
        let outcome = connection.release().await;
        if outcome == crate::db::ReleaseOutcome::AlreadyDisposed {
            warn!("Connection was disposed before a failed operation released it");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::DbConnection;
    use crate::db::wrapper::ConnectionWrapper;
    use crate::models::{CommandType, ConnectionString};

    async fn lease() -> SharedConnection {
        let cs = ConnectionString::parse("sqlite::memory:").unwrap();
        ConnectionWrapper::new(DbConnection::open(&cs).await.unwrap())
    }

    fn command() -> Command {
        Command::new(CommandType::Text, "SELECT 1").unwrap()
    }

    #[tokio::test]
    async fn test_finish_releases_owned_connection() {
        let connection = lease().await;
        let observed = Arc::clone(&connection);
        let result = AsyncResult::spawn(
            async move { Ok(Completion { value: 7u64, connection }) },
            command(),
            true,
            true,
            None,
            AsyncOptions::default(),
        )
        .unwrap();

        assert_eq!(result.finish().await.unwrap(), 7);
        assert!(observed.is_disposed());
    }

    #[tokio::test]
    async fn test_dropped_result_releases_owned_connection() {
        let connection = lease().await;
        let observed = Arc::clone(&connection);
        let result = AsyncResult::spawn(
            async move { Ok(Completion { value: 7u64, connection }) },
            command(),
            false,
            true,
            None,
            AsyncOptions::default(),
        )
        .unwrap();
        drop(result);

        for _ in 0..100 {
            if observed.is_disposed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(observed.is_disposed());
    }

    #[tokio::test]
    async fn test_dropped_result_leaves_shared_connection_alone() {
        let connection = lease().await;
        let operation_connection = Arc::clone(&connection);
        let result = AsyncResult::spawn(
            async move {
                Ok(Completion {
                    value: 7u64,
                    connection: operation_connection,
                })
            },
            command(),
            false,
            false,
            Some(Arc::clone(&connection)),
            AsyncOptions::default(),
        )
        .unwrap();
        result.wait_handle().wait().await;
        drop(result);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connection.ref_count(), 1);
        connection.release().await;
    }
}
