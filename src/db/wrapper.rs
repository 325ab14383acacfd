//! Reference-counted connection sharing.
//!
//! A [`ConnectionWrapper`] owns one physical connection and a reference count that
//! starts at 1. Every consumer that keeps the connection alive holds one reference
//! and releases it exactly once; the connection is closed when the count goes
//! from 1 to 0, and never again after that.
//!
//! The count is only touched with atomic operations. The mutex around the
//! connection is the access gate for issuing statements (drivers need `&mut`);
//! it plays no part in lifetime tracking.
//!
//! At most one reader may be open on a connection. While it is, other
//! statements fail with [`DbError::ConnectionBusy`] instead of waiting.

use crate::db::connection::{DbConnection, ManagedConnection};
use crate::error::{DbError, DbResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// A connection shared between a caller, its transaction and open readers.
pub type SharedConnection = Arc<ConnectionWrapper<DbConnection>>;

/// Result of [`ConnectionWrapper::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other references are still outstanding.
    Released { remaining: usize },
    /// This was the last reference; the connection has been closed.
    Disposed,
    /// The wrapper was already disposed; nothing happened.
    AlreadyDisposed,
}

pub struct ConnectionWrapper<C: ManagedConnection = DbConnection> {
    ref_count: AtomicUsize,
    reader_open: AtomicBool,
    connection: Mutex<Option<C>>,
}

impl<C: ManagedConnection> ConnectionWrapper<C> {
    /// Wrap a connection. The caller holds the first reference.
    pub fn new(connection: C) -> Arc<Self> {
        Arc::new(Self {
            ref_count: AtomicUsize::new(1),
            reader_open: AtomicBool::new(false),
            connection: Mutex::new(Some(connection)),
        })
    }

    /// Take an additional reference, to be released by whoever receives the clone.
    ///
    /// A disposed wrapper stays disposed: the count is not revived, and
    /// releasing the returned clone reports [`ReleaseOutcome::AlreadyDisposed`].
    pub fn add_ref(self: &Arc<Self>) -> Arc<Self> {
        let revived = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count + 1)
            });
        if revived.is_err() {
            warn!("add_ref on a disposed connection wrapper; the connection is gone");
        }
        Arc::clone(self)
    }

    /// Give back one reference. The last one closes the connection.
    ///
    /// Releasing more often than references were taken is a caller error; the extra
    /// releases are logged and have no effect.
    pub async fn release(&self) -> ReleaseOutcome {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });

        match previous {
            Err(_) => {
                warn!("Connection wrapper released after it was disposed");
                ReleaseOutcome::AlreadyDisposed
            }
            Ok(1) => {
                let connection = self.connection.lock().await.take();
                if let Some(connection) = connection {
                    if let Err(e) = connection.close().await {
                        error!(error = %e, "Failed to close connection cleanly");
                    }
                }
                debug!("Connection disposed");
                ReleaseOutcome::Disposed
            }
            Ok(previous) => ReleaseOutcome::Released {
                remaining: previous - 1,
            },
        }
    }

    /// Current number of outstanding references.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.ref_count() == 0
    }

    /// Whether a reader currently holds the connection.
    pub fn has_open_reader(&self) -> bool {
        self.reader_open.load(Ordering::Acquire)
    }

    /// Exclusive use of the connection for one statement.
    ///
    /// Fails with [`DbError::ConnectionBusy`] while a reader is open, and with
    /// [`DbError::ConnectionDisposed`] once the last reference is gone.
    pub async fn lock(&self) -> DbResult<ConnectionGuard<'_, C>> {
        if self.has_open_reader() {
            return Err(DbError::ConnectionBusy);
        }
        self.lock_unchecked().await
    }

    /// Claim the connection for a reader. Cleared through the returned mark.
    pub(crate) fn open_reader(self: &Arc<Self>) -> DbResult<ReaderMark<C>> {
        self.reader_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DbError::ConnectionBusy)?;
        Ok(ReaderMark {
            wrapper: Arc::clone(self),
            cleared: AtomicBool::new(false),
        })
    }

    /// Wait for the connection regardless of the reader claim. Only the reader
    /// holding the claim uses this.
    pub(crate) async fn lock_unchecked(&self) -> DbResult<ConnectionGuard<'_, C>> {
        let guard = self.connection.lock().await;
        if guard.is_none() {
            return Err(DbError::ConnectionDisposed);
        }
        Ok(ConnectionGuard { guard })
    }
}

/// A reader's claim on a connection. Cleared at most once, at the latest on drop.
pub(crate) struct ReaderMark<C: ManagedConnection = DbConnection> {
    wrapper: Arc<ConnectionWrapper<C>>,
    cleared: AtomicBool,
}

impl<C: ManagedConnection> ReaderMark<C> {
    pub(crate) fn clear(&self) {
        if !self.cleared.swap(true, Ordering::AcqRel) {
            self.wrapper.reader_open.store(false, Ordering::Release);
        }
    }
}

impl<C: ManagedConnection> Drop for ReaderMark<C> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<C: ManagedConnection> std::fmt::Debug for ConnectionWrapper<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWrapper")
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Exclusive access to a live connection.
pub struct ConnectionGuard<'a, C> {
    guard: MutexGuard<'a, Option<C>>,
}

impl<C> ConnectionGuard<'_, C> {
    pub fn connection(&mut self) -> DbResult<&mut C> {
        self.guard.as_mut().ok_or(DbError::ConnectionDisposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingConnection {
        closes: Arc<AtomicUsize>,
    }

    impl ManagedConnection for CountingConnection {
        async fn close(self) -> DbResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting() -> (Arc<ConnectionWrapper<CountingConnection>>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let wrapper = ConnectionWrapper::new(CountingConnection {
            closes: closes.clone(),
        });
        (wrapper, closes)
    }

    #[tokio::test]
    async fn test_new_wrapper_has_one_reference() {
        let (wrapper, closes) = counting();
        assert_eq!(wrapper.ref_count(), 1);
        assert!(!wrapper.is_disposed());
        assert_eq!(wrapper.release().await, ReleaseOutcome::Disposed);
        assert!(wrapper.is_disposed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_ref_defers_close() {
        let (wrapper, closes) = counting();
        let second = wrapper.add_ref();
        assert!(Arc::ptr_eq(&wrapper, &second));
        assert_eq!(wrapper.ref_count(), 2);

        assert_eq!(
            wrapper.release().await,
            ReleaseOutcome::Released { remaining: 1 }
        );
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert!(wrapper.lock().await.is_ok());

        assert_eq!(second.release().await, ReleaseOutcome::Disposed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_after_dispose_is_noop() {
        let (wrapper, closes) = counting();
        wrapper.release().await;
        assert_eq!(wrapper.release().await, ReleaseOutcome::AlreadyDisposed);
        assert_eq!(wrapper.release().await, ReleaseOutcome::AlreadyDisposed);
        assert_eq!(wrapper.ref_count(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_after_dispose_fails() {
        let (wrapper, _closes) = counting();
        wrapper.release().await;
        assert!(matches!(
            wrapper.lock().await,
            Err(DbError::ConnectionDisposed)
        ));
    }

    #[tokio::test]
    async fn test_add_ref_does_not_revive_disposed_wrapper() {
        let (wrapper, closes) = counting();
        assert_eq!(wrapper.release().await, ReleaseOutcome::Disposed);

        let late = wrapper.add_ref();
        assert!(wrapper.is_disposed());
        assert_eq!(wrapper.ref_count(), 0);
        assert_eq!(late.release().await, ReleaseOutcome::AlreadyDisposed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_reader_makes_connection_busy() {
        let (wrapper, _closes) = counting();
        let mark = wrapper.open_reader().unwrap();
        assert!(wrapper.has_open_reader());
        assert!(matches!(wrapper.lock().await, Err(DbError::ConnectionBusy)));
        assert!(matches!(wrapper.open_reader(), Err(DbError::ConnectionBusy)));
        assert!(wrapper.lock_unchecked().await.is_ok());

        mark.clear();
        mark.clear();
        assert!(!wrapper.has_open_reader());
        assert!(wrapper.lock().await.is_ok());

        let mark = wrapper.open_reader().unwrap();
        drop(mark);
        assert!(wrapper.lock().await.is_ok());
        wrapper.release().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_release_closes_exactly_once() {
        for _ in 0..50 {
            let (wrapper, closes) = counting();
            let holders: Vec<_> = (0..16).map(|_| wrapper.add_ref()).collect();

            let tasks: Vec<_> = holders
                .into_iter()
                .map(|holder| tokio::spawn(async move { holder.release().await }))
                .collect();
            let own = wrapper.release().await;

            let mut disposed = usize::from(own == ReleaseOutcome::Disposed);
            for task in tasks {
                if task.await.unwrap() == ReleaseOutcome::Disposed {
                    disposed += 1;
                }
            }

            assert_eq!(disposed, 1);
            assert_eq!(closes.load(Ordering::SeqCst), 1);
            assert!(wrapper.is_disposed());
        }
    }
}
