use std::ops::ControlFlow;
use std::sync::Arc;

use rusqlite::{Connection, InterruptHandle};
use tokio_util::sync::CancellationToken;

use crate::error::ComposerError;
use crate::query_spec::QuerySpec;
use crate::results::{CustomDbRow, ResultSet};
use crate::types::RowValues;

use super::ConnectionManager;
use super::command;
use super::session::{SharedSession, lock};

/// Opens and begins on behalf of one command, and undoes both unless completed.
struct AutoScope {
    session: SharedSession,
    auto_opened: bool,
    auto_began: bool,
    armed: bool,
}

impl AutoScope {
    fn enter(session: &SharedSession, transaction_required: bool) -> Result<Self, ComposerError> {
        let (auto_opened, began) = {
            let mut guard = lock(session);
            let auto_opened = !guard.is_open();
            if auto_opened {
                guard.open()?;
            }
            let began = if guard.in_transaction() {
                guard.ensure_usable().map(|()| false)
            } else if transaction_required {
                guard.begin().map(|()| true)
            } else {
                Ok(false)
            };
            (auto_opened, began)
        };
        let mut scope = AutoScope {
            session: Arc::clone(session),
            auto_opened,
            auto_began: false,
            armed: true,
        };
        scope.auto_began = began?;
        Ok(scope)
    }

    /// Commit and close what this scope started; on failure the drop cleanup runs.
    fn complete(mut self) -> Result<(), ComposerError> {
        if self.auto_began {
            let committed = lock(&self.session).commit();
            committed?;
            self.auto_began = false;
        }
        self.armed = false;
        if self.auto_opened {
            let closed = lock(&self.session).close();
            closed?;
        }
        Ok(())
    }

    fn finish<R>(self, outcome: Result<R, ComposerError>) -> Result<R, ComposerError> {
        match outcome {
            Ok(value) => {
                self.complete()?;
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(error = %err, query = err.query().unwrap_or_default(), "command failed");
                drop(self);
                Err(err)
            }
        }
    }
}

impl Drop for AutoScope {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut session = lock(&self.session);
        if self.auto_began
            && session.in_transaction()
            && let Err(err) = session.rollback()
        {
            tracing::warn!(error = %err, "rollback of auto-begun transaction failed");
        }
        if self.auto_opened
            && let Err(err) = session.close()
        {
            tracing::warn!(error = %err, "close of auto-opened connection failed");
        }
    }
}

/// Interrupts the native command if the awaiting future goes away.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }

    fn fire(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.interrupt();
        }
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        self.fire();
    }
}

fn execute_on<R>(
    session: &SharedSession,
    spec: &QuerySpec,
    op: impl FnOnce(&Connection, &QuerySpec) -> Result<R, ComposerError>,
) -> Result<R, ComposerError> {
    let mut guard = lock(session);
    let result = guard.connection().and_then(|conn| op(conn, spec));
    if result.is_err() {
        guard.note_failure();
    }
    result
}

impl ConnectionManager {
    /// The manager a query runs on: a nested one when it names another data source.
    fn target(&mut self, query: &QuerySpec) -> Result<&mut ConnectionManager, ComposerError> {
        self.check_thread()?;
        match query.connection_override() {
            Some(cs) if cs != self.settings.connection_string => self.nested_connection(cs, false),
            _ => Ok(self),
        }
    }

    pub(crate) fn run<R>(
        &mut self,
        query: &QuerySpec,
        op: impl FnOnce(&Connection, &QuerySpec) -> Result<R, ComposerError>,
    ) -> Result<R, ComposerError> {
        let session = Arc::clone(self.target(query)?.session());
        let spec = query.for_execution(query.total_requested(), false)?;
        let scope = AutoScope::enter(&session, spec.transaction_required())?;
        let outcome = execute_on(&session, &spec, op);
        scope.finish(outcome)
    }

    pub(crate) async fn run_async<R, F>(
        &mut self,
        query: &QuerySpec,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<R, ComposerError>
    where
        R: Send + 'static,
        F: FnOnce(&Connection, &QuerySpec) -> Result<R, ComposerError> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(ComposerError::ProcessCanceled);
        }
        let session = Arc::clone(self.target(query)?.session());
        let spec = query.for_execution(query.total_requested(), false)?;
        let scope = AutoScope::enter(&session, spec.transaction_required())?;
        let handle = lock(&session).interrupt_handle();
        let mut interrupt = InterruptOnDrop(handle);

        let worker = Arc::clone(&session);
        let mut task = tokio::task::spawn_blocking(move || execute_on(&worker, &spec, op));

        tokio::select! {
            biased;
            joined = &mut task => {
                interrupt.disarm();
                scope.finish(joined?)
            }
            () = cancel.cancelled() => {
                interrupt.fire();
                if let Ok(Err(err)) = task.await {
                    tracing::debug!(error = %err, "interrupted command returned");
                }
                tracing::debug!(connection = %self.settings.connection_string, "command canceled");
                Err(ComposerError::ProcessCanceled)
            }
        }
    }

    /// Run a query and collect every returned row.
    ///
    /// # Errors
    /// Returns `ComposerError::ThreadSafetyViolation`, `ComposerError::ParameterError`
    /// for an unbound marker, `ComposerError::TransactionPoisoned`, or a provider
    /// error carrying the query text.
    pub fn execute_query(&mut self, query: &QuerySpec) -> Result<ResultSet, ComposerError> {
        self.run(query, |conn, spec| {
            let mut out = ResultSet::with_capacity(10);
            command::fill(conn, spec, &mut out)?;
            Ok(out)
        })
    }

    /// Async form of [`execute_query`](Self::execute_query).
    ///
    /// # Errors
    /// As `execute_query`, plus `ComposerError::ProcessCanceled` once `cancel` fires.
    pub async fn execute_query_async(
        &mut self,
        query: &QuerySpec,
        cancel: &CancellationToken,
    ) -> Result<ResultSet, ComposerError> {
        self.run_async(query, cancel, |conn, spec| {
            let mut out = ResultSet::with_capacity(10);
            command::fill(conn, spec, &mut out)?;
            Ok(out)
        })
        .await
    }

    /// Run every statement of the query and return the total affected rows.
    ///
    /// # Errors
    /// As [`execute_query`](Self::execute_query).
    pub fn execute_non_query(&mut self, query: &QuerySpec) -> Result<usize, ComposerError> {
        self.run(query, command::non_query)
    }

    /// # Errors
    /// As `execute_non_query`, plus `ComposerError::ProcessCanceled` once `cancel` fires.
    pub async fn execute_non_query_async(
        &mut self,
        query: &QuerySpec,
        cancel: &CancellationToken,
    ) -> Result<usize, ComposerError> {
        self.run_async(query, cancel, command::non_query).await
    }

    /// First column of the first row, or `RowValues::Null` when nothing is returned.
    ///
    /// # Errors
    /// As [`execute_query`](Self::execute_query).
    pub fn execute_scalar(&mut self, query: &QuerySpec) -> Result<RowValues, ComposerError> {
        self.run(query, command::scalar)
    }

    /// # Errors
    /// As `execute_scalar`, plus `ComposerError::ProcessCanceled` once `cancel` fires.
    pub async fn execute_scalar_async(
        &mut self,
        query: &QuerySpec,
        cancel: &CancellationToken,
    ) -> Result<RowValues, ComposerError> {
        self.run_async(query, cancel, command::scalar).await
    }

    /// Hand rows to `visitor` one at a time until it returns `ControlFlow::Break`.
    ///
    /// Returns the number of rows visited.
    ///
    /// # Errors
    /// As [`execute_query`](Self::execute_query).
    pub fn execute_reader<F>(&mut self, query: &QuerySpec, mut visitor: F) -> Result<usize, ComposerError>
    where
        F: FnMut(CustomDbRow) -> ControlFlow<()>,
    {
        self.run(query, move |conn, spec| command::read(conn, spec, &mut visitor))
    }

    /// # Errors
    /// As `execute_reader`, plus `ComposerError::ProcessCanceled` once `cancel` fires.
    pub async fn execute_reader_async<F>(
        &mut self,
        query: &QuerySpec,
        cancel: &CancellationToken,
        mut visitor: F,
    ) -> Result<usize, ComposerError>
    where
        F: FnMut(CustomDbRow) -> ControlFlow<()> + Send + 'static,
    {
        self.run_async(query, cancel, move |conn, spec| {
            command::read(conn, spec, &mut visitor)
        })
        .await
    }

    /// Append the query's rows to `out`, which must have the same columns if it has any.
    ///
    /// # Errors
    /// As [`execute_query`](Self::execute_query), plus `ComposerError::ExecutionError`
    /// on a column mismatch.
    pub fn fill(&mut self, query: &QuerySpec, out: &mut ResultSet) -> Result<usize, ComposerError> {
        self.run(query, |conn, spec| command::fill(conn, spec, out))
    }

    /// # Errors
    /// As `fill`, plus `ComposerError::ProcessCanceled` once `cancel` fires.
    pub async fn fill_async(
        &mut self,
        query: &QuerySpec,
        out: &mut ResultSet,
        cancel: &CancellationToken,
    ) -> Result<usize, ComposerError> {
        let mut chunk = ResultSet::default();
        if let Some(names) = out.get_column_names() {
            chunk.set_column_names(Arc::clone(names));
        }
        let (added, chunk) = self
            .run_async(query, cancel, move |conn, spec| {
                let added = command::fill(conn, spec, &mut chunk)?;
                Ok((added, chunk))
            })
            .await?;
        if out.get_column_names().is_none()
            && let Some(names) = chunk.get_column_names()
        {
            out.set_column_names(Arc::clone(names));
        }
        for row in chunk.results {
            out.add_row(row);
        }
        Ok(added)
    }
}
