use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ComposerError;
use crate::query_spec::QuerySpec;
use crate::results::ResultSet;
use crate::types::RowValues;

use super::ConnectionManager;
use super::command::to_native;

/// How [`ConnectionManager::bulk_insert`] loads rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkInsertSettings {
    /// Load inside a transaction, begun here unless one is already active.
    pub use_transaction: bool,
    /// Target columns, matched to source columns by name. `None` copies every source column.
    pub columns: Option<Vec<String>>,
}

impl Default for BulkInsertSettings {
    fn default() -> Self {
        Self {
            use_transaction: true,
            columns: None,
        }
    }
}

impl BulkInsertSettings {
    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn without_transaction(mut self) -> Self {
        self.use_transaction = false;
        self
    }
}

fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

struct BulkPlan {
    sql: String,
    columns: Vec<String>,
}

impl BulkPlan {
    fn new(data: &ResultSet, table: &str, settings: &BulkInsertSettings) -> Result<Option<Self>, ComposerError> {
        let Some(source) = data.get_column_names() else {
            return Ok(None);
        };
        let columns = settings
            .columns
            .clone()
            .unwrap_or_else(|| source.as_ref().clone());
        if columns.is_empty() {
            return Err(ComposerError::ParameterError(format!(
                "bulk insert into {table} names no columns"
            )));
        }
        if let Some(missing) = columns
            .iter()
            .find(|c| !source.iter().any(|s| s.eq_ignore_ascii_case(c)))
        {
            return Err(ComposerError::ParameterError(format!(
                "bulk insert column {missing} is not in the source data"
            )));
        }
        let targets = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let markers = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(Some(Self {
            sql: format!("INSERT INTO {} ({targets}) VALUES ({markers})", quote_identifier(table)),
            columns,
        }))
    }

    fn spec(&self, settings: &BulkInsertSettings) -> QuerySpec {
        let spec = QuerySpec::new(self.sql.clone());
        if settings.use_transaction {
            spec.require_transaction()
        } else {
            spec
        }
    }

    fn load(&self, conn: &Connection, data: &ResultSet) -> Result<usize, ComposerError> {
        let mut stmt = conn
            .prepare(&self.sql)
            .map_err(|e| ComposerError::provider(&self.sql, e))?;
        let mut inserted = 0;
        for row in data {
            let values = self
                .columns
                .iter()
                .map(|c| to_native(row.get(c).cloned().unwrap_or(RowValues::Null), None))
                .collect::<Result<Vec<_>, _>>()?;
            inserted += stmt
                .execute(rusqlite::params_from_iter(values))
                .map_err(|e| ComposerError::provider(&self.sql, e))?;
        }
        Ok(inserted)
    }
}

impl ConnectionManager {
    /// Insert every row of `data` into `table` with one prepared statement.
    ///
    /// # Errors
    /// Returns `ComposerError::ParameterError` if a requested column is not in
    /// `data`, or the first provider failure (the load is rolled back when it
    /// runs in its own transaction).
    pub fn bulk_insert(
        &mut self,
        data: &ResultSet,
        table: &str,
        settings: &BulkInsertSettings,
    ) -> Result<usize, ComposerError> {
        let Some(plan) = BulkPlan::new(data, table, settings)? else {
            return Ok(0);
        };
        if data.is_empty() {
            return Ok(0);
        }
        let spec = plan.spec(settings);
        self.run(&spec, |conn, _| plan.load(conn, data))
    }

    /// # Errors
    /// As `bulk_insert`, plus `ComposerError::ProcessCanceled` once `cancel` fires.
    pub async fn bulk_insert_async(
        &mut self,
        data: &ResultSet,
        table: &str,
        settings: &BulkInsertSettings,
        cancel: &CancellationToken,
    ) -> Result<usize, ComposerError> {
        let Some(plan) = BulkPlan::new(data, table, settings)? else {
            return Ok(0);
        };
        if data.is_empty() {
            return Ok(0);
        }
        let spec = plan.spec(settings);
        let rows = data.clone();
        self.run_async(&spec, cancel, move |conn, _| plan.load(conn, &rows))
            .await
    }
}
