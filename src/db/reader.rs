//! Forward-only row readers.
//!
//! A [`RowReader`] streams the rows of one command. A background task owns a
//! reference to the connection for as long as rows are being produced; it gives
//! the reference back as soon as the result set is exhausted, the reader is
//! dropped, or an error ends the stream. Rows are produced on demand (the channel
//! between the task and the reader holds a single row).
//!
//! An open reader claims its connection: other statements on it fail with
//! [`DbError::ConnectionBusy`] until the reader is exhausted, closed or dropped.

use crate::db::executor;
use crate::db::wrapper::{ReaderMark, SharedConnection};
use crate::error::{DbError, DbResult};
use crate::models::DbValue;
use futures_util::{Stream, StreamExt};
use serde_json::Value as JsonValue;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One decoded row. Column names are shared by all rows of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    columns: Arc<[String]>,
    values: Vec<DbValue>,
}

impl DataRow {
    pub(crate) fn new(columns: Arc<[String]>, values: Vec<DbValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[DbValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of a column by name (case-insensitive); the first match wins.
    pub fn get(&self, column: &str) -> Option<&DbValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|idx| self.values.get(idx))
    }

    pub fn get_index(&self, idx: usize) -> Option<&DbValue> {
        self.values.get(idx)
    }

    /// Value of a column, failing with a mapping error if the column is absent.
    pub fn try_get(&self, column: &str) -> DbResult<&DbValue> {
        self.get(column)
            .ok_or_else(|| DbError::mapping(format!("column '{}' not found", column)))
    }

    pub fn into_values(self) -> Vec<DbValue> {
        self.values
    }

    /// The row as a JSON object keyed by column name.
    pub fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(column, value)| (column.clone(), value.to_json()))
            .collect()
    }
}

/// A forward-only, single-pass stream of [`DataRow`]s.
pub struct RowReader {
    receiver: mpsc::Receiver<DbResult<DataRow>>,
    task: JoinHandle<()>,
    mark: Arc<ReaderMark>,
    peeked: Option<DataRow>,
    columns: Arc<[String]>,
}

impl RowReader {
    /// Start reading `statement` on `connection`.
    ///
    /// The reader takes its own reference to the connection. Waits for the first
    /// row so that statement errors surface here rather than on the first read.
    pub(crate) async fn open(
        connection: &SharedConnection,
        statement: String,
        values: Vec<DbValue>,
        timeout: Duration,
    ) -> DbResult<Self> {
        let mark = Arc::new(connection.open_reader()?);
        let (sender, mut receiver) = mpsc::channel(1);
        let reference = connection.add_ref();

        let task_mark = Arc::clone(&mark);
        let task = tokio::spawn(async move {
            let result = match reference.lock_unchecked().await {
                Ok(mut guard) => match guard.connection() {
                    Ok(conn) => {
                        executor::stream_rows(conn, &statement, &values, timeout, &sender).await
                    }
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            // Guard is gone; free the connection before the channel closes.
            task_mark.clear();
            reference.release().await;
            if let Err(e) = result {
                let _ = sender.send(Err(e)).await;
            }
            debug!("Row reader finished");
        });

        let (peeked, columns) = match receiver.recv().await {
            Some(Ok(row)) => {
                let columns = row.columns.clone();
                (Some(row), columns)
            }
            Some(Err(e)) => {
                let _ = task.await;
                return Err(e);
            }
            None => (None, Arc::from(Vec::new())),
        };

        Ok(Self {
            receiver,
            task,
            mark,
            peeked,
            columns,
        })
    }

    /// Column names of the result set; empty when it has no rows.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Advance to the next row. `Ok(None)` once the result set is exhausted.
    pub async fn read(&mut self) -> DbResult<Option<DataRow>> {
        self.next().await.transpose()
    }

    /// Read all remaining rows.
    pub async fn collect_rows(mut self) -> DbResult<Vec<DataRow>> {
        let mut rows = Vec::new();
        while let Some(row) = self.read().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Stop reading and wait until the connection reference has been returned.
    pub async fn close(mut self) {
        self.mark.clear();
        self.receiver.close();
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Row reader task ended abnormally");
        }
    }
}

impl Drop for RowReader {
    fn drop(&mut self) {
        self.mark.clear();
    }
}

impl Stream for RowReader {
    type Item = DbResult<DataRow>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(row) = this.peeked.take() {
            return Poll::Ready(Some(Ok(row)));
        }
        this.receiver.poll_recv(cx)
    }
}

impl std::fmt::Debug for RowReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowReader")
            .field("columns", &self.columns)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}
