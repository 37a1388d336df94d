use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ComposerError;
use crate::paging::TOTAL_ROWS_COLUMN;
use crate::types::RowValues;

pub(crate) type ColumnIndex = Arc<HashMap<String, usize>>;

pub(crate) fn index_columns(column_names: &[String]) -> ColumnIndex {
    Arc::new(
        column_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect(),
    )
}

/// One row of a query result.
///
/// Column names and the name-to-position index are shared by every row of
/// the same result.
#[derive(Debug, Clone)]
pub struct CustomDbRow {
    pub column_names: Arc<Vec<String>>,
    pub rows: Vec<RowValues>,
    column_index: ColumnIndex,
}

impl CustomDbRow {
    #[must_use]
    pub fn new(column_names: Arc<Vec<String>>, rows: Vec<RowValues>) -> Self {
        let column_index = index_columns(&column_names);
        Self {
            column_names,
            rows,
            column_index,
        }
    }

    pub(crate) fn from_parts(
        column_names: Arc<Vec<String>>,
        column_index: ColumnIndex,
        rows: Vec<RowValues>,
    ) -> Self {
        Self {
            column_names,
            rows,
            column_index,
        }
    }

    /// Position of a column; exact match first, then ASCII case-insensitive.
    #[must_use]
    pub fn get_column_index(&self, column_name: &str) -> Option<usize> {
        if let Some(&idx) = self.column_index.get(column_name) {
            return Some(idx);
        }
        self.column_names
            .iter()
            .position(|col| col.eq_ignore_ascii_case(column_name))
    }

    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&RowValues> {
        self.get_column_index(column_name)
            .and_then(|idx| self.rows.get(idx))
    }

    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&RowValues> {
        self.rows.get(index)
    }
}

/// Rows returned by a query, plus the affected-row count for statements.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub results: Vec<CustomDbRow>,
    pub rows_affected: usize,
    column_names: Option<Arc<Vec<String>>>,
    column_index: Option<ColumnIndex>,
}

impl ResultSet {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> ResultSet {
        ResultSet {
            results: Vec::with_capacity(capacity),
            ..ResultSet::default()
        }
    }

    pub fn set_column_names(&mut self, column_names: Arc<Vec<String>>) {
        self.column_index = Some(index_columns(&column_names));
        self.column_names = Some(column_names);
    }

    #[must_use]
    pub fn get_column_names(&self) -> Option<&Arc<Vec<String>>> {
        self.column_names.as_ref()
    }

    /// Adopt `column_names`, or confirm they match the columns already held.
    ///
    /// # Errors
    /// Returns `ComposerError::ExecutionError` if the result already carries a
    /// different column layout.
    pub fn ensure_columns(&mut self, column_names: Vec<String>) -> Result<(), ComposerError> {
        match &self.column_names {
            None => {
                self.set_column_names(Arc::new(column_names));
                Ok(())
            }
            Some(existing) if existing.as_slice() == column_names.as_slice() => Ok(()),
            Some(existing) => Err(ComposerError::ExecutionError(format!(
                "cannot fill a result with columns {existing:?} from a query returning {column_names:?}"
            ))),
        }
    }

    /// Append a row using the result's column names. Ignored until columns are set.
    pub fn add_row_values(&mut self, row_values: Vec<RowValues>) {
        if let (Some(column_names), Some(column_index)) = (&self.column_names, &self.column_index) {
            self.results.push(CustomDbRow {
                column_names: Arc::clone(column_names),
                rows: row_values,
                column_index: Arc::clone(column_index),
            });
            self.rows_affected += 1;
        }
    }

    pub fn add_row(&mut self, row: CustomDbRow) {
        if self.column_names.is_none() {
            self.column_index = Some(Arc::clone(&row.column_index));
            self.column_names = Some(Arc::clone(&row.column_names));
        }
        self.results.push(row);
        self.rows_affected += 1;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CustomDbRow> {
        self.results.iter()
    }

    /// Unpaged row count reported by a paged query that asked for a total.
    #[must_use]
    pub fn total_rows(&self) -> Option<i64> {
        self.results
            .first()
            .and_then(|row| row.get(TOTAL_ROWS_COLUMN))
            .and_then(|value| value.as_int().copied())
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a CustomDbRow;
    type IntoIter = std::slice::Iter<'a, CustomDbRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}
